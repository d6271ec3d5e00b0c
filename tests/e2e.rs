//! End-to-end scenarios (spec §8.10): a live server on a loopback TCP port,
//! driven with a plain blocking `std::net::TcpStream` client so these tests
//! exercise the real accept/parse/respond pipeline rather than calling
//! internal functions directly.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tidepool::handlers::{MessageSender, WebSocketHandler};
use tidepool::message::Message;
use tidepool::{Config, Server};

fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Spawns a configured `Server` on a background OS thread and returns a
/// handle to terminate it plus the address it is listening on. `build` runs
/// before the reactor starts, the place to register handlers.
fn start_server(config: Config, build: impl FnOnce(&mut Server) + Send + 'static) -> (tidepool::ServerHandle, SocketAddr) {
    let addr = free_addr();
    let mut server = Server::new(config);
    build(&mut server);
    let handle = server.handle();
    std::thread::spawn(move || {
        let _ = server.serve(addr);
    });
    connect_with_retry(addr);
    (handle, addr)
}

fn connect_with_retry(addr: SocketAddr) {
    for _ in 0..50 {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("server at {addr} never came up");
}

fn request(addr: SocketAddr, raw: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(raw).unwrap();
    read_available(&mut stream)
}

fn read_available(stream: &mut TcpStream) -> Vec<u8> {
    stream.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let mut out = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    break;
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                break
            }
            Err(e) => panic!("read error: {e}"),
        }
    }
    out
}

fn unique_dir(label: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("tidepool-e2e-{label}-{}-{n}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn unknown_path_with_no_handler_or_file_returns_404_with_template_body() {
    let (handle, addr) = start_server(Config::default(), |_server| {});
    let response = request(addr, b"GET /unknown HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 404"));
    assert!(text.contains("404"));
    handle.terminate();
}

#[test]
fn static_png_file_is_served_with_expected_headers() {
    let dir = unique_dir("png");
    std::fs::write(dir.join("foo.png"), [0x89, b'P', b'N', b'G', 0, 1, 2, 3]).unwrap();
    let (handle, addr) = start_server(Config::default().with_static_path(dir), |_server| {});

    let response = request(addr, b"GET /foo.png HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"));
    assert!(text.contains("Content-Type: image/png"));
    assert!(text.contains("Accept-Ranges: bytes"));
    assert!(text.contains("Cache-Control: no-store"));
    handle.terminate();
}

#[test]
fn static_mp3_file_has_no_cache_disabling_headers() {
    let dir = unique_dir("mp3");
    std::fs::write(dir.join("foo.mp3"), vec![0u8; 32]).unwrap();
    let (handle, addr) = start_server(Config::default().with_static_path(dir), |_server| {});

    let response = request(addr, b"GET /foo.mp3 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"));
    assert!(!text.contains("Cache-Control"));
    assert!(!text.contains("Pragma"));
    handle.terminate();
}

#[test]
fn range_request_returns_206_with_content_range() {
    let dir = unique_dir("range");
    let body: Vec<u8> = (0..100u16).map(|n| (n % 256) as u8).collect();
    std::fs::write(dir.join("foo"), &body).unwrap();
    let (handle, addr) = start_server(Config::default().with_static_path(dir), |_server| {});

    let response = request(
        addr,
        b"GET /foo HTTP/1.1\r\nHost: x\r\nRange: bytes=0-9\r\nConnection: close\r\n\r\n",
    );
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 206"));
    assert!(text.contains("Content-Range: bytes 0-9/100"));
    assert!(text.contains("Content-Length: 10"));
    handle.terminate();
}

#[test]
fn malformed_range_header_is_a_400() {
    let dir = unique_dir("badrange");
    std::fs::write(dir.join("foo"), vec![0u8; 10]).unwrap();
    let (handle, addr) = start_server(Config::default().with_static_path(dir), |_server| {});

    let response = request(
        addr,
        b"GET /foo HTTP/1.1\r\nHost: x\r\nRange: items=0-9\r\nConnection: close\r\n\r\n",
    );
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 400"));
    handle.terminate();
}

struct EchoHandler;

impl WebSocketHandler for EchoHandler {
    fn on_message(&self, _connection_id: u64, message: Message, sender: &dyn MessageSender) {
        if let Message::Text(text) = message {
            if text == "ping" {
                let _ = sender.send(Message::Text("pong".to_string()));
            }
        }
    }
}

fn masked_client_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mask = [0x11, 0x22, 0x33, 0x44];
    let mut out = vec![0x80 | opcode, 0x80 | (payload.len() as u8)];
    out.extend_from_slice(&mask);
    for (i, b) in payload.iter().enumerate() {
        out.push(b ^ mask[i % 4]);
    }
    out
}

#[test]
fn websocket_upgrade_handshake_uses_the_spec_accept_key_vector() {
    let handler = Arc::new(EchoHandler);
    let (handle, addr) = start_server(Config::default(), move |server| {
        server.add_websocket_handler("/chat", handler.clone(), true);
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    let request = b"GET /chat HTTP/1.1\r\n\
Host: x\r\n\
Connection: Upgrade\r\n\
Upgrade: websocket\r\n\
Sec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
    stream.write_all(request).unwrap();
    let response = read_available(&mut stream);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 101"));
    assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    // opcode 0x1 == text
    stream.write_all(&masked_client_frame(0x1, b"ping")).unwrap();
    let reply = read_available(&mut stream);
    assert_eq!(reply[0], 0b1000_0001, "FIN=1, opcode=text");
    assert_eq!(reply[1] & 0x80, 0, "server frames must not be masked");
    let payload_len = (reply[1] & 0x7f) as usize;
    assert_eq!(&reply[2..2 + payload_len], b"pong");

    handle.terminate();
}

#[test]
fn websocket_upgrade_to_unknown_endpoint_is_404() {
    let (handle, addr) = start_server(Config::default(), |_server| {});
    let req_bytes = b"GET /no-such-endpoint HTTP/1.1\r\n\
Host: x\r\n\
Connection: Upgrade\r\n\
Upgrade: websocket\r\n\
Sec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
    let response = request(addr, req_bytes);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 404"));
    handle.terminate();
}

#[test]
fn livestats_endpoint_reports_json_for_connected_clients() {
    let (handle, addr) = start_server(Config::default(), |_server| {});
    // Keep a connection open concurrently while we ask for stats.
    let _keepalive = TcpStream::connect(addr).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let response = request(
        addr,
        b"GET /_livestats.js HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    );
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"));
    assert!(text.contains("clear();"));
    handle.terminate();
}
