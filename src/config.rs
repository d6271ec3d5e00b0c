//! Server configuration (spec §6's "Configurable parameters" list), grounded
//! in the teacher's `ServerConfig`/`WebSocketConfig` split.

use std::path::PathBuf;
use std::sync::Arc;

use crate::logger::{LogCrateLogger, Logger};

/// Tuning knobs for a [`crate::server::Server`]. Every field has the default
/// documented in spec §6; construct with `Config::default()` and override via
/// the `with_*` builder methods.
#[derive(Clone)]
pub struct Config {
    /// Idle-reaper trigger: a connection that has sent zero bytes since
    /// accept is destroyed once this many seconds have elapsed.
    pub lame_connection_timeout_seconds: u64,
    /// TCP keepalive probe count. `0` (the default) disables keepalive
    /// entirely; any positive value enables 1-second IDLE/INTVL probes with
    /// this many allowed drops before the kernel gives up on the socket.
    pub max_keep_alive_drops: u32,
    /// Per-connection write-buffer cap, in bytes. Exceeding it closes the
    /// connection as a slow consumer (spec §8.7).
    pub client_buffer_size: usize,
    /// Whether permessage-deflate is offered/accepted during the Hybi
    /// handshake.
    pub per_message_deflate_enabled: bool,
    /// Root directory the static file responder resolves paths against.
    /// `None` serves only the embedded assets.
    pub static_path: Option<PathBuf>,
    /// How long a single reactor tick blocks waiting for readiness/wakeup
    /// before running the idle-reaper scan again.
    pub poll_timeout_millis: u64,
    /// `SO_LINGER` duration applied to connections still open at
    /// `terminate()`.
    pub shutdown_linger_seconds: u32,
    pub logger: Arc<dyn Logger>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("lame_connection_timeout_seconds", &self.lame_connection_timeout_seconds)
            .field("max_keep_alive_drops", &self.max_keep_alive_drops)
            .field("client_buffer_size", &self.client_buffer_size)
            .field("per_message_deflate_enabled", &self.per_message_deflate_enabled)
            .field("static_path", &self.static_path)
            .field("poll_timeout_millis", &self.poll_timeout_millis)
            .field("shutdown_linger_seconds", &self.shutdown_linger_seconds)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lame_connection_timeout_seconds: 10,
            max_keep_alive_drops: 0,
            client_buffer_size: 16 * 1024 * 1024,
            per_message_deflate_enabled: false,
            static_path: None,
            poll_timeout_millis: 500,
            shutdown_linger_seconds: 1,
            logger: Arc::new(LogCrateLogger),
        }
    }
}

impl Config {
    pub fn with_static_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.static_path = Some(path.into());
        self
    }

    pub fn with_lame_connection_timeout_seconds(mut self, seconds: u64) -> Self {
        self.lame_connection_timeout_seconds = seconds;
        self
    }

    pub fn with_max_keep_alive_drops(mut self, drops: u32) -> Self {
        self.max_keep_alive_drops = drops;
        self
    }

    pub fn with_client_buffer_size(mut self, bytes: usize) -> Self {
        self.client_buffer_size = bytes;
        self
    }

    pub fn with_per_message_deflate_enabled(mut self, enabled: bool) -> Self {
        self.per_message_deflate_enabled = enabled;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }
}

/// Per-connection WebSocket framing limits, independent of the server-wide
/// [`Config`] (grounded in the teacher's `WebSocketConfig`).
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub max_frame_size: usize,
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            max_frame_size: 16 << 20,
            max_message_size: 64 << 20,
        }
    }
}
