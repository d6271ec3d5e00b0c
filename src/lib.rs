//! `tidepool` — an embeddable HTTP/1.1 and WebSocket server for dropping a
//! small web UI or control channel into an existing application: bind a
//! handler registry to a [`Server`], hand it a loopback address or Unix
//! socket, and it drives the whole request/response and WebSocket framing
//! lifecycle on a single reactor thread.
//!
//! The pieces: [`frame`] and [`handshake`] implement the wire protocol;
//! [`request`], [`headers`], [`uri`] parse what comes in; [`response`] and
//! [`static_files`] produce what goes out; [`connection`] and [`server`] own
//! the reactor loop that ties it all together; [`handlers`] is the registry
//! an embedder hangs their own logic off of.

mod assets;
pub mod config;
mod connection;
pub mod credentials;
mod deflate;
pub mod error;
mod extensions;
pub mod frame;
pub mod handlers;
pub mod handshake;
pub mod headers;
pub mod logger;
pub mod message;
pub mod request;
pub mod response;
pub mod server;
pub mod static_files;
pub mod stats;
pub mod uri;

pub use config::{Config, WebSocketConfig};
pub use credentials::Credentials;
pub use error::{Error, Result};
pub use frame::OpCode;
pub use handlers::{HandlerRegistry, MessageSender, PageHandler, WebSocketHandler};
pub use headers::HeaderMap;
pub use logger::{LogCrateLogger, Level, Logger};
pub use message::Message;
pub use request::{Method, Request};
pub use response::{Response, ResponseWriter, StreamingResponse, SynchronousResponse, TransferEncoding};
pub use server::{Server, ServerContext, ServerHandle};
pub use stats::ConnectionStats;
pub use uri::CrackedUri;
