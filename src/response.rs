//! The response pipeline — component D's data model. `Response` is the sum
//! type spec §9 calls for in place of the original's inheritance hierarchy;
//! `ResponseWriter` is the narrow capability a `Response` is handed to
//! produce bytes on the wire. The concrete `ResponseWriter` lives in
//! `connection.rs`, where it holds the handle back into a live connection.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::headers::HeaderMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    Raw,
    Chunked,
}

/// A fully materialized response: status, content-type, headers and a body
/// already in memory. The common case — most page handlers return one of
/// these.
#[derive(Debug, Clone)]
pub struct SynchronousResponse {
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub keep_alive: bool,
}

impl SynchronousResponse {
    pub fn ok(content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        SynchronousResponse {
            status: 200,
            content_type: content_type.into(),
            headers: Vec::new(),
            body: body.into(),
            keep_alive: true,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Produces bytes asynchronously over a lifetime that may outlive the
/// original request — the request handle it was built from is gone once
/// `handle` returns, so anything the implementation needs must be captured
/// by value (spec §3: "Invariants: `handle(writer)` is invoked exactly once
/// on the reactor thread; `cancel()` is invoked exactly once when the
/// underlying connection closes before `finish`").
pub trait StreamingResponse: Send + Sync {
    fn handle(&self, writer: &mut dyn ResponseWriter);

    /// Called if the connection is destroyed before this response calls
    /// `finish`. Default no-op is correct for responses that don't hold
    /// external resources.
    fn cancel(&self) {}
}

/// Component D's enum sum-type replacement for the original's polymorphic
/// `Response*` hierarchy (spec §9).
pub enum Response {
    Synchronous(SynchronousResponse),
    Streaming(Arc<dyn StreamingResponse>),
    /// Serve `path` (relative to the configured static root) through the
    /// static file responder (component E).
    StaticFile(PathBuf),
    /// A page handler looked at the request and declined it; the Connection
    /// falls through to the next handler, then the static-file pipeline
    /// (spec §9: "`Unhandled` is a distinguished variant, not a nullable
    /// value").
    Unhandled,
    /// No handler, and no matching static file: render the embedded 404
    /// template.
    NotFound,
}

/// The handle a `Response` is given to emit bytes (spec §6's
/// `ResponseWriter` collaborator interface). Every method must only be
/// called from the reactor thread; implementations enforce this and treat a
/// cross-thread call as a programmer error (`Error::WrongThread`).
pub trait ResponseWriter {
    fn begin(&mut self, status: u16, encoding: TransferEncoding) -> Result<()>;
    fn header(&mut self, key: &str, value: &str) -> Result<()>;
    fn payload(&mut self, data: &[u8], flush: bool) -> Result<()>;
    fn finish(&mut self, keep_connection_open: bool) -> Result<()>;
    fn error(&mut self, status: u16, body: &str) -> Result<()>;
    fn is_active(&self) -> bool;
}

/// Renders the embedded `_error.html` template (spec §6) for a 4xx/5xx
/// response, substituting its three placeholders.
pub fn render_error_template(template: &str, status: u16, message: &str, body: &str) -> String {
    template
        .replace("%%ERRORCODE%%", &status.to_string())
        .replace("%%MESSAGE%%", message)
        .replace("%%BODY%%", body)
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        301 => "Moved Permanently",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "Unknown",
    }
}

pub(crate) fn default_common_headers(server_header: &str, date: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.append("Server", server_header);
    headers.append("Date", date);
    headers.append("Access-Control-Allow-Origin", "*");
    headers
}
