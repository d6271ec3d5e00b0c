//! Per-connection stats (spec §6's stats JSON keys), grounded in the
//! teacher's `id`/`uuid`-per-connection bookkeeping in `event.rs`, generalized
//! into the field set the original `/_livestats.js` endpoint reports.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Live counters and identifying fields for one connection, updated from the
/// connection's own task and read back by the `/_livestats.js` fabricator
/// (component F/E boundary).
pub struct ConnectionStats {
    pub id: u64,
    pub since: Instant,
    pub addr: SocketAddr,
    uri: Mutex<String>,
    user: Mutex<String>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    input_buffered: AtomicU64,
    output_buffered: AtomicU64,
}

impl ConnectionStats {
    pub fn new(id: u64, addr: SocketAddr) -> Self {
        ConnectionStats {
            id,
            since: Instant::now(),
            addr,
            uri: Mutex::new(String::new()),
            user: Mutex::new("(not authed)".to_string()),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            input_buffered: AtomicU64::new(0),
            output_buffered: AtomicU64::new(0),
        }
    }

    pub fn set_uri(&self, uri: &str) {
        *self.uri.lock().unwrap() = uri.to_string();
    }

    pub fn set_user(&self, user: &str) {
        *self.user.lock().unwrap() = user.to_string();
    }

    pub fn add_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total bytes ever received on this connection; the idle reaper treats
    /// a connection that has received nothing since accept as lame.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn add_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_input_buffered(&self, bytes: u64) {
        self.input_buffered.store(bytes, Ordering::Relaxed);
    }

    pub fn set_output_buffered(&self, bytes: u64) {
        self.output_buffered.store(bytes, Ordering::Relaxed);
    }

    /// Renders this connection's entry as the `connection({...})` object
    /// literal `/_livestats.js` emits one of, per connection (spec §6).
    pub fn to_json(&self) -> String {
        format!(
            "{{\"since\":\"{since}\",\"fd\":{id},\"id\":{id},\"uri\":\"{uri}\",\"addr\":\"{addr}\",\"user\":\"{user}\",\"input\":{input},\"read\":{read},\"output\":{output},\"written\":{written}}}",
            since = humanize_age(self.since.elapsed().as_secs()),
            id = self.id,
            uri = escape_json(&self.uri.lock().unwrap()),
            addr = self.addr,
            user = escape_json(&self.user.lock().unwrap()),
            input = self.input_buffered.load(Ordering::Relaxed),
            read = self.bytes_read.load(Ordering::Relaxed),
            output = self.output_buffered.load(Ordering::Relaxed),
            written = self.bytes_written.load(Ordering::Relaxed),
        )
    }
}

fn humanize_age(seconds: u64) -> String {
    format!("{seconds}s ago")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Renders the full `/_livestats.js` body: a `clear()` call followed by one
/// `connection({...})` call per still-open connection (spec §6).
pub fn render_livestats_js(connections: &[&ConnectionStats]) -> String {
    let mut out = String::from("clear();\n");
    for stats in connections {
        out.push_str("connection(");
        out.push_str(&stats.to_json());
        out.push_str(");\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    #[test]
    fn to_json_contains_expected_keys() {
        let stats = ConnectionStats::new(7, addr());
        stats.set_uri("/chat");
        stats.add_read(12);
        let json = stats.to_json();
        assert!(json.contains("\"id\":7"));
        assert!(json.contains("\"uri\":\"/chat\""));
        assert!(json.contains("\"user\":\"(not authed)\""));
        assert!(json.contains("\"read\":12"));
    }

    #[test]
    fn render_livestats_js_wraps_each_connection() {
        let stats = ConnectionStats::new(1, addr());
        let js = render_livestats_js(&[&stats]);
        assert!(js.starts_with("clear();\n"));
        assert!(js.contains("connection({"));
    }
}
