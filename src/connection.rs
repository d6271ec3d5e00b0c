//! Per-connection HTTP/WebSocket state machine — component C. One instance
//! drives all I/O for a single accepted socket; spec §3/§4.C's "mutated only
//! on the reactor thread" invariant is compiler-enforced here by giving the
//! connection's mutable state `Rc<RefCell<..>>` internals and running the
//! whole thing as a `!Send` task pinned to the server's single `LocalSet`
//! thread (spec §9's design note on mapping the single-threaded reactor onto
//! a task executor). Grounded in the teacher's `WSConnection`/`Writer`
//! read-then-dispatch loop, generalized from a pure WebSocket client/server
//! pair into the full HTTP-then-optional-upgrade lifecycle spec §3 specifies.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::assets;
use crate::config::{Config, WebSocketConfig};
use crate::deflate::{Decoder as InflateContext, Encoder as DeflateContext};
use crate::error::{Error, Result};
use crate::extensions::{self, PermessageDeflateParams};
use crate::frame::{self, Decoded, FrameDecoder, MessageKind, OpCode};
use crate::handlers::{HandlerRegistry, MessageSender, WebSocketHandler};
use crate::handshake;
use crate::headers::HeaderMap;
use crate::logger::{Level, Logger};
use crate::message::Message;
use crate::request::{self, Method, ParsedRequest, Request};
use crate::response::{
    default_common_headers, render_error_template, status_text, Response, ResponseWriter,
    StreamingResponse, SynchronousResponse, TransferEncoding,
};
use crate::stats::ConnectionStats;
use crate::static_files;

const READ_CHUNK: usize = 16 * 1024;

/// spec §3's Connection State enumeration. The three "sending response"
/// sub-states and `AWAITING_RESPONSE_BEGIN` collapse into `WriterPhase`
/// below, since in this mapping they are a single synchronous call stack
/// (`Response::handle` runs to completion, or schedules continuations via
/// `execute`, before the connection ever loops back to `ReadingHeaders`)
/// rather than separate states the reactor revisits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadingHeaders,
    BufferingPostData,
    HandlingHixieWebSocket,
    HandlingHybiWebSocket,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterPhase {
    Idle,
    Headers,
    Body,
    Done,
}

/// Shared, reactor-thread-only mutable state behind the [`ConnectionWriter`]
/// handed to [`Response`]s and kept in the server's connection table so a
/// cross-thread [`crate::server::ServerHandle::execute`] callback can find
/// it again by id (spec §9: "model as a handle index into the reactor's
/// connection table").
struct Inner {
    id: u64,
    peer_addr: SocketAddr,
    output: Vec<u8>,
    writer_phase: WriterPhase,
    encoding: TransferEncoding,
    close_when_empty: bool,
    closed: bool,
    response_active: bool,
    client_buffer_size: usize,
    server_header: String,
    notify: Rc<Notify>,
    stats: Arc<ConnectionStats>,
    /// The in-flight `Response::Streaming` this connection handed a writer
    /// to, if any. Held so the connection can call `cancel()` exactly once
    /// if it closes before the response calls `finish` (spec §3).
    active_streaming: Option<Arc<dyn StreamingResponse>>,
}

impl Inner {
    /// Enforces spec §4.C's slow-consumer protection: a connection whose
    /// output buffer outgrows `client_buffer_size` is closed rather than
    /// left to buffer unbounded writes for a peer that isn't draining them.
    fn check_buffer_cap(&mut self, logger: &dyn Logger) {
        if self.output.len() > self.client_buffer_size && !self.closed {
            logger.log(
                Level::Warning,
                &format!(
                    "closing connection {} ({}): output buffer {} exceeds client_buffer_size {}",
                    self.id,
                    self.peer_addr,
                    self.output.len(),
                    self.client_buffer_size
                ),
            );
            self.closed = true;
            self.close_when_empty = true;
            self.notify.notify_one();
        }
    }
}

/// A `Response` is handed exactly one of these (spec §3): writes append to
/// the connection's output buffer and are drained to the socket by the
/// connection's own driving loop, including writes made long after `handle`
/// returns via `execute` (spec §4.C's cancellation/lifetime note).
pub struct ConnectionWriter {
    inner: Rc<RefCell<Inner>>,
    peer_addr: SocketAddr,
    logger: Arc<dyn Logger>,
    alive: Rc<RefCell<bool>>,
}

impl ConnectionWriter {
    fn new(inner: Rc<RefCell<Inner>>, peer_addr: SocketAddr, logger: Arc<dyn Logger>, alive: Rc<RefCell<bool>>) -> Self {
        ConnectionWriter {
            inner,
            peer_addr,
            logger,
            alive,
        }
    }

    fn ensure_headers_ended(&mut self, inner: &mut Inner) {
        if inner.writer_phase == WriterPhase::Headers {
            inner.output.extend_from_slice(b"\r\n");
            inner.writer_phase = WriterPhase::Body;
        }
    }
}

impl ResponseWriter for ConnectionWriter {
    fn begin(&mut self, status: u16, encoding: TransferEncoding) -> Result<()> {
        if !*self.alive.borrow() {
            return Ok(());
        }
        let mut inner = self.inner.borrow_mut();
        inner.encoding = encoding;
        inner.writer_phase = WriterPhase::Headers;

        let date = static_files::format_http_date(time::OffsetDateTime::now_utc());
        let common = default_common_headers(&inner.server_header.clone(), &date);

        inner.output.extend_from_slice(
            format!("HTTP/1.1 {status} {}\r\n", status_text(status)).as_bytes(),
        );
        for (key, value) in common.iter() {
            inner.output.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
        }
        if encoding == TransferEncoding::Chunked {
            inner
                .output
                .extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        Ok(())
    }

    fn header(&mut self, key: &str, value: &str) -> Result<()> {
        if !*self.alive.borrow() {
            return Ok(());
        }
        let mut inner = self.inner.borrow_mut();
        if inner.writer_phase != WriterPhase::Headers {
            return Err(Error::Internal(
                "header() called outside the response-header phase".into(),
            ));
        }
        inner.output.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
        Ok(())
    }

    fn payload(&mut self, data: &[u8], flush: bool) -> Result<()> {
        if !*self.alive.borrow() {
            return Ok(());
        }
        let mut inner = self.inner.borrow_mut();
        self.ensure_headers_ended(&mut inner);

        if inner.encoding == TransferEncoding::Chunked {
            inner
                .output
                .extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
            inner.output.extend_from_slice(data);
            inner.output.extend_from_slice(b"\r\n");
        } else {
            inner.output.extend_from_slice(data);
        }

        inner.check_buffer_cap(self.logger.as_ref());
        if flush {
            inner.notify.notify_one();
        }
        Ok(())
    }

    fn finish(&mut self, keep_connection_open: bool) -> Result<()> {
        if !*self.alive.borrow() {
            return Ok(());
        }
        let mut inner = self.inner.borrow_mut();
        self.ensure_headers_ended(&mut inner);

        if inner.encoding == TransferEncoding::Chunked {
            inner.output.extend_from_slice(b"0\r\n\r\n");
        }
        inner.writer_phase = WriterPhase::Done;
        inner.response_active = false;
        inner.close_when_empty = !keep_connection_open;
        inner.active_streaming = None;
        inner.notify.notify_one();
        Ok(())
    }

    fn error(&mut self, status: u16, body: &str) -> Result<()> {
        let rendered = render_error_template(assets::ERROR_TEMPLATE, status, status_text(status), body);
        self.begin(status, TransferEncoding::Raw)?;
        self.header("Content-Type", "text/html")?;
        self.header("Content-Length", &rendered.len().to_string())?;
        self.payload(rendered.as_bytes(), true)?;
        self.finish(false)
    }

    fn is_active(&self) -> bool {
        *self.alive.borrow() && {
            let inner = self.inner.borrow();
            !inner.closed && inner.response_active
        }
    }
}

/// Sends WebSocket messages to the peer bound to one connection (spec §6's
/// `WebSocketHandler` collaborator's outbound capability). Encoding happens
/// synchronously at call time, same as the HTTP `ResponseWriter`.
pub struct ConnSender {
    inner: Rc<RefCell<Inner>>,
    deflate: Option<Rc<RefCell<DeflateContext>>>,
    alive: Rc<RefCell<bool>>,
    logger: Arc<dyn Logger>,
}

impl MessageSender for ConnSender {
    fn send(&self, message: Message) -> Result<()> {
        if !*self.alive.borrow() {
            return Ok(());
        }
        let frame_bytes = match &self.deflate {
            Some(ctx) => {
                let plain = message.as_binary();
                let compressed = ctx.borrow_mut().compress(plain)?;
                let opcode = match &message {
                    Message::Text(_) => OpCode::Text,
                    Message::Binary(_) => OpCode::Binary,
                };
                frame::encode(opcode, &compressed, true)
            }
            None => message.encode(false),
        };
        let mut inner = self.inner.borrow_mut();
        inner.output.extend_from_slice(&frame_bytes);
        inner.check_buffer_cap(self.logger.as_ref());
        inner.notify.notify_one();
        Ok(())
    }

    fn close(&self) {
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            inner.close_when_empty = true;
            inner.notify.notify_one();
        }
    }
}

/// The table the reactor keeps so a `ServerHandle::execute` callback posted
/// from another thread can reach a live connection's writer by id, and the
/// idle reaper can enumerate connections by accept time (spec §4.F step 2,
/// §9's handle-index design note).
pub(crate) type ConnectionTable = Rc<RefCell<HashMap<u64, Rc<RefCell<Inner>>>>>;

/// Every currently open connection's live counters, shared read-only with
/// the `/_livestats.js` fabricator (spec §6).
pub(crate) type StatsTable = Rc<RefCell<HashMap<u64, Arc<ConnectionStats>>>>;

/// Runs one accepted socket through the full HTTP/WebSocket lifecycle until
/// it closes. `stats` is shared with the `/_livestats.js` fabricator;
/// `table` lets background-thread callbacks posted via `execute` find this
/// connection's writer again after `handle()` has already returned.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn serve_connection<S>(
    id: u64,
    peer_addr: SocketAddr,
    mut stream: S,
    config: Arc<Config>,
    ws_config: Arc<WebSocketConfig>,
    handlers: Rc<HandlerRegistry>,
    stats: Arc<ConnectionStats>,
    table: ConnectionTable,
    all_stats: StatsTable,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let inner = Rc::new(RefCell::new(Inner {
        id,
        peer_addr,
        output: Vec::new(),
        writer_phase: WriterPhase::Idle,
        encoding: TransferEncoding::Raw,
        close_when_empty: false,
        closed: false,
        response_active: false,
        client_buffer_size: config.client_buffer_size,
        server_header: "tidepool".to_string(),
        notify: Rc::new(Notify::new()),
        stats: stats.clone(),
        active_streaming: None,
    }));
    table.borrow_mut().insert(id, inner.clone());

    let result = drive_connection(
        &inner, peer_addr, &mut stream, &config, &ws_config, &handlers, &stats, &all_stats,
    )
    .await;

    cancel_active_streaming_response(&inner);
    table.borrow_mut().remove(&id);
    let _ = stream.shutdown().await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn drive_connection<S>(
    inner: &Rc<RefCell<Inner>>,
    peer_addr: SocketAddr,
    stream: &mut S,
    config: &Arc<Config>,
    ws_config: &Arc<WebSocketConfig>,
    handlers: &Rc<HandlerRegistry>,
    stats: &Arc<ConnectionStats>,
    all_stats: &StatsTable,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let logger = config.logger.clone();
    let alive = Rc::new(RefCell::new(true));
    let mut input = BytesMut::new();
    let mut state = ConnState::ReadingHeaders;

    loop {
        match state {
            ConnState::ReadingHeaders => {
                let mut buf = [0u8; READ_CHUNK];
                match read_with_wakeup(inner, stream, &mut buf).await? {
                    ReadOutcome::Eof => break,
                    ReadOutcome::Woken => {
                        flush_output(inner, stream).await?;
                        if connection_should_close(inner) {
                            break;
                        }
                        continue;
                    }
                    ReadOutcome::Data(n) => {
                        input.extend_from_slice(&buf[..n]);
                        stats.add_read(n as u64);
                        stats.set_input_buffered(input.len() as u64);
                    }
                }

                let parsed = match request::parse(&input, peer_addr) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        if let Some(status) = protocol_error_status(&err) {
                            let mut writer = ConnectionWriter::new(
                                inner.clone(),
                                peer_addr,
                                logger.clone(),
                                alive.clone(),
                            );
                            let _ = writer.error(status, &err.to_string());
                            flush_output(inner, stream).await?;
                        } else {
                            logger.log(
                                Level::Warning,
                                &format!("dropping connection after protocol error: {err}"),
                            );
                        }
                        break;
                    }
                };

                match parsed {
                    ParsedRequest::Incomplete => continue,
                    ParsedRequest::Complete { request, consumed } => {
                        let _ = input.split_to(consumed);
                        stats.set_uri(&request.raw_uri);
                        stats.set_user(request.credentials.display_name());

                        #[cfg(feature = "hixie76")]
                        if request.method == Method::WebSocket
                            && request.headers.get("Sec-WebSocket-Key").is_none()
                            && request.headers.get("Sec-WebSocket-Key1").is_some()
                            && request.headers.get("Sec-WebSocket-Key2").is_some()
                        {
                            match hixie76_handshake(
                                inner, peer_addr, stream, &request, &mut input, handlers, &logger,
                                &alive,
                            )
                            .await?
                            {
                                Some(handler) => {
                                    run_hixie_message_loop(
                                        inner, stream, &mut input, handler, stats, &logger, &alive,
                                    )
                                    .await?;
                                }
                                None => {}
                            }
                            state = ConnState::Closed;
                            continue;
                        }

                        if request.method == Method::WebSocket {
                            match upgrade_to_websocket(
                                inner, peer_addr, stream, &request, config, ws_config, handlers,
                                &logger, &alive,
                            )
                            .await?
                            {
                                Some(handler) => {
                                    run_websocket_loop(
                                        inner, peer_addr, stream, &mut input, ws_config, handler,
                                        stats, &logger, &alive,
                                    )
                                    .await?;
                                    state = ConnState::Closed;
                                }
                                None => state = ConnState::Closed,
                            }
                        } else {
                            let keep_open = handle_http_request(
                                inner, peer_addr, stream, &request, config, handlers, &logger,
                                &alive, all_stats,
                            )
                            .await?;
                            if keep_open {
                                state = ConnState::ReadingHeaders;
                            } else {
                                state = ConnState::Closed;
                            }
                        }
                    }
                }
            }
            ConnState::BufferingPostData | ConnState::HandlingHixieWebSocket => unreachable!(
                "folded into request::parse's content-length wait and the hixie76 feature path"
            ),
            ConnState::HandlingHybiWebSocket | ConnState::Closed => break,
        }
    }

    *alive.borrow_mut() = false;
    Ok(())
}

/// Parses and answers one HTTP request (spec §4.C's "HTTP response
/// lifecycle"): resolve a `Response` (page handler, static file, or 404),
/// hand it a writer, flush the output buffer, and report whether the
/// connection should stay open for the next pipelined request.
#[allow(clippy::too_many_arguments)]
async fn handle_http_request<S>(
    inner: &Rc<RefCell<Inner>>,
    peer_addr: SocketAddr,
    stream: &mut S,
    request: &Request,
    config: &Arc<Config>,
    handlers: &Rc<HandlerRegistry>,
    logger: &Arc<dyn Logger>,
    alive: &Rc<RefCell<bool>>,
    all_stats: &StatsTable,
) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    inner.borrow_mut().response_active = true;
    let response = resolve_response(request, config, handlers, logger, all_stats);
    let keep_alive_requested = !request
        .headers
        .header_contains_token("Connection", "close");

    let mut writer = ConnectionWriter::new(inner.clone(), peer_addr, logger.clone(), alive.clone());

    match response {
        Response::Synchronous(sync) => {
            writer.begin(sync.status, TransferEncoding::Raw)?;
            writer.header("Content-Type", &sync.content_type)?;
            writer.header("Content-Length", &sync.body.len().to_string())?;
            for (key, value) in &sync.headers {
                writer.header(key, value)?;
            }
            writer.payload(&sync.body, true)?;
            writer.finish(sync.keep_alive && keep_alive_requested)?;
        }
        Response::Streaming(streaming) => {
            inner.borrow_mut().active_streaming = Some(streaming.clone());
            streaming.handle(&mut writer);
        }
        Response::StaticFile(path) => {
            serve_static_file(&mut writer, &path, request, keep_alive_requested)?;
        }
        Response::NotFound | Response::Unhandled => {
            serve_not_found(&mut writer, request)?;
        }
    }

    flush_output(inner, stream).await?;
    let keep_open = !connection_should_close(inner);
    Ok(keep_open)
}

fn resolve_response(
    request: &Request,
    config: &Arc<Config>,
    handlers: &Rc<HandlerRegistry>,
    logger: &Arc<dyn Logger>,
    all_stats: &StatsTable,
) -> Response {
    let path = format!("/{}", request.uri.path().join("/"));

    if path == "/_livestats.js" {
        let table = all_stats.borrow();
        let stats: Vec<&ConnectionStats> = table.values().map(Arc::as_ref).collect();
        let body = crate::stats::render_livestats_js(&stats);
        return Response::Synchronous(SynchronousResponse::ok(
            "text/javascript",
            body.into_bytes(),
        ));
    }

    if let Some(asset) = assets::lookup(&path) {
        return Response::Synchronous(
            SynchronousResponse::ok(asset.content_type, asset.body.to_vec()),
        );
    }

    match handlers.dispatch_page(request) {
        Some(Response::Unhandled) | None => {}
        Some(other) => return other,
    }

    let Some(root) = &config.static_path else {
        return Response::NotFound;
    };
    match static_files::resolve_path(root, request.uri.path()) {
        Some(path) if path.is_file() => Response::StaticFile(path),
        _ => {
            logger.log(Level::Debug, &format!("no handler or file for {}", request.raw_uri));
            Response::NotFound
        }
    }
}

fn serve_not_found(writer: &mut ConnectionWriter, request: &Request) -> Result<()> {
    let body = format!("No such file or handler for {}", request.raw_uri);
    writer.error(404, &body)
}

/// Static file responder (component E): path already resolved to an
/// existing file by [`resolve_response`]; this handles MIME, `Range`,
/// and caching headers (spec §4.D).
fn serve_static_file(
    writer: &mut ConnectionWriter,
    path: &std::path::Path,
    request: &Request,
    keep_alive: bool,
) -> Result<()> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return writer.error(404, &format!("could not read {}", path.display())),
    };
    let total_len = bytes.len() as u64;
    let content_type = static_files::content_type_for_extension(path);
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(time::OffsetDateTime::from)
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc());

    let ranges = match request.headers.get("Range") {
        Some(value) => match static_files::parse_range(value, total_len) {
            Ok(ranges) => Some(ranges),
            Err(_) => return writer.error(400, "malformed Range header"),
        },
        None => None,
    };

    match ranges {
        Some(ranges) if ranges.len() == 1 => {
            let range = ranges[0];
            writer.begin(206, TransferEncoding::Raw)?;
            writer.header("Content-Type", content_type)?;
            writer.header(
                "Content-Range",
                &format!("bytes {}-{}/{}", range.start, range.end_inclusive, total_len),
            )?;
            writer.header("Content-Length", &range.len().to_string())?;
            write_common_file_headers(writer, path, modified)?;
            let slice = &bytes[range.start as usize..=range.end_inclusive as usize];
            writer.payload(slice, true)?;
            writer.finish(keep_alive)
        }
        Some(ranges) => {
            // Multiple ranges: emit the whole file rather than a
            // multipart/byteranges body (spec doesn't require multipart
            // support; each requested range is still validated above).
            let _ = ranges;
            emit_whole_file(writer, &bytes, content_type, path, modified, keep_alive)
        }
        None => emit_whole_file(writer, &bytes, content_type, path, modified, keep_alive),
    }
}

fn emit_whole_file(
    writer: &mut ConnectionWriter,
    bytes: &[u8],
    content_type: &str,
    path: &std::path::Path,
    modified: time::OffsetDateTime,
    keep_alive: bool,
) -> Result<()> {
    writer.begin(200, TransferEncoding::Raw)?;
    writer.header("Content-Type", content_type)?;
    writer.header("Content-Length", &bytes.len().to_string())?;
    write_common_file_headers(writer, path, modified)?;
    writer.payload(bytes, true)?;
    writer.finish(keep_alive)
}

fn write_common_file_headers(
    writer: &mut ConnectionWriter,
    path: &std::path::Path,
    modified: time::OffsetDateTime,
) -> Result<()> {
    writer.header("Accept-Ranges", "bytes")?;
    writer.header("Last-Modified", &static_files::format_http_date(modified))?;
    if static_files::is_cacheable_extension(path) {
        // Cacheable extensions (.mp3/.wav) emit no cache-disabling headers.
    } else {
        writer.header("Cache-Control", "no-store")?;
        writer.header("Pragma", "no-cache")?;
        writer.header(
            "Expires",
            &static_files::format_http_date(time::OffsetDateTime::now_utc()),
        )?;
    }
    Ok(())
}

/// Maps a request-parsing failure to the HTTP status it should be answered
/// with before the connection closes (spec §7). `None` means the error
/// happened below the level of a well-formed request (e.g. raw garbage
/// `httparse` itself rejected) and the connection is simply dropped.
fn protocol_error_status(err: &Error) -> Option<u16> {
    match err {
        Error::HeadersTooLarge | Error::UnsupportedHttpVersion => Some(501),
        Error::MalformedRequestLine
        | Error::UpgradeRequestNotGet
        | Error::MalformedUri(_)
        | Error::TruncatedEscape(_)
        | Error::BadEscape(_) => Some(400),
        _ => None,
    }
}

/// Outcome of racing a socket read against this connection's `Notify` (spec
/// §9's cross-thread `execute` design note): a background thread's
/// `ServerHandle::execute` callback may append to `Inner::output` and call
/// `notify_one` while this task is blocked in `stream.read`, and without
/// this race the new bytes would sit unflushed until the peer next sends
/// something.
enum ReadOutcome {
    Data(usize),
    Eof,
    Woken,
}

/// Cancellation-safe: both `AsyncReadExt::read` and `Notify::notified` may be
/// dropped mid-poll without losing data or a pending wakeup, so this is safe
/// to call repeatedly from a loop each iteration of which may itself be
/// re-selected over.
async fn read_with_wakeup<S>(
    inner: &Rc<RefCell<Inner>>,
    stream: &mut S,
    buf: &mut [u8],
) -> Result<ReadOutcome>
where
    S: AsyncRead + Unpin,
{
    let notify = inner.borrow().notify.clone();
    tokio::select! {
        result = stream.read(buf) => {
            let n = result?;
            Ok(if n == 0 { ReadOutcome::Eof } else { ReadOutcome::Data(n) })
        }
        _ = notify.notified() => Ok(ReadOutcome::Woken),
    }
}

/// Calls `cancel()` exactly once on this connection's in-flight streaming
/// response, if it has one that hasn't already finished (spec §3's
/// `cancel()` invariant).
fn cancel_active_streaming_response(inner: &Rc<RefCell<Inner>>) {
    let streaming = inner.borrow_mut().active_streaming.take();
    if let Some(streaming) = streaming {
        streaming.cancel();
    }
}

/// Cancels every connection's in-flight streaming response (if any) across
/// the whole table; used when the server is tearing every connection down
/// at once rather than one at a time (spec §4.F terminate path).
pub(crate) fn cancel_all_pending_streaming_responses(table: &ConnectionTable) {
    for inner in table.borrow().values() {
        cancel_active_streaming_response(inner);
    }
}

async fn flush_output<S>(inner: &Rc<RefCell<Inner>>, stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let (pending, stats) = {
        let mut guard = inner.borrow_mut();
        (std::mem::take(&mut guard.output), guard.stats.clone())
    };
    if !pending.is_empty() {
        stream.write_all(&pending).await?;
        stream.flush().await?;
        stats.add_written(pending.len() as u64);
    }
    stats.set_output_buffered(inner.borrow().output.len() as u64);
    Ok(())
}

/// Performs the Hybi (or, behind the `hixie76` feature, legacy) handshake
/// and, on success, registers the connection with its WebSocket handler
/// (spec §4.B). Returns the bound handler to drive the frame loop with, or
/// `None` if the handshake itself failed and a response was already sent.
#[allow(clippy::too_many_arguments)]
async fn upgrade_to_websocket<S>(
    inner: &Rc<RefCell<Inner>>,
    peer_addr: SocketAddr,
    stream: &mut S,
    request: &Request,
    config: &Arc<Config>,
    ws_config: &Arc<WebSocketConfig>,
    handlers: &Rc<HandlerRegistry>,
    logger: &Arc<dyn Logger>,
    alive: &Rc<RefCell<bool>>,
) -> Result<Option<(Arc<dyn WebSocketHandler>, Option<PermessageDeflateParams>)>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut writer = ConnectionWriter::new(inner.clone(), peer_addr, logger.clone(), alive.clone());
    let path = format!("/{}", request.uri.path().join("/"));

    let Some((handler, allow_cross_origin)) = handlers.websocket_handler(&path) else {
        writer.error(404, &format!("no WebSocket handler for {path}"))?;
        flush_output(inner, stream).await?;
        return Ok(None);
    };

    if !allow_cross_origin {
        if let Some(origin) = request.headers.get("Origin") {
            let expected_host = request.headers.get("Host").unwrap_or("");
            let expected = format!("http://{expected_host}");
            if origin != expected {
                writer.error(403, "Origin not allowed")?;
                flush_output(inner, stream).await?;
                return Ok(None);
            }
        }
    }

    let Some(client_key) = request.headers.get("Sec-WebSocket-Key") else {
        writer.error(400, "missing Sec-WebSocket-Key")?;
        flush_output(inner, stream).await?;
        return Ok(None);
    };

    let version_supported = matches!(request.headers.get("Sec-WebSocket-Version"), Some("8") | Some("13"));
    if !version_supported {
        writer.error(426, "Upgrade Required")?;
        flush_output(inner, stream).await?;
        return Ok(None);
    }

    let accept = handshake::accept_key(client_key);
    let deflate_params = request
        .headers
        .get("Sec-WebSocket-Extensions")
        .and_then(extensions::parse_permessage_deflate)
        .filter(|_| config.per_message_deflate_enabled);

    let offered_protocols: Vec<String> = request
        .headers
        .get("Sec-WebSocket-Protocol")
        .map(|v| v.split(',').map(|p| p.trim().to_string()).collect())
        .unwrap_or_default();
    let chosen_protocol = handler
        .choose_protocol(&offered_protocols)
        .and_then(|idx| offered_protocols.get(idx).cloned());

    writer.begin(101, TransferEncoding::Raw)?;
    writer.header("Upgrade", "websocket")?;
    writer.header("Connection", "Upgrade")?;
    writer.header("Sec-WebSocket-Accept", &accept)?;
    if let Some(params) = &deflate_params {
        writer.header(
            "Sec-WebSocket-Extensions",
            &extensions::build_response_header(params),
        )?;
    }
    if let Some(protocol) = &chosen_protocol {
        writer.header("Sec-WebSocket-Protocol", protocol)?;
    }
    if allow_cross_origin {
        if let Some(origin) = request.headers.get("Origin") {
            writer.header("Sec-WebSocket-Origin", origin)?;
        }
    }
    writer.finish(true)?;
    flush_output(inner, stream).await?;

    let _ = ws_config; // limits are enforced per-message in run_websocket_loop
    handler.on_connect(inner.borrow().id, request);
    Ok(Some((handler, deflate_params)))
}

/// Performs the legacy Hixie-76 handshake (spec §4.B, gated behind the
/// `hixie76` feature per spec §9's open question on legacy client support):
/// reads the 8-byte key3 that follows the request headers, computes the
/// MD5 digest over key1/key2/key3, and emits the upgrade response with the
/// digest as its body. Returns the bound handler to drive the Hixie message
/// loop with, or `None` if the handshake failed and an error was already
/// sent.
#[cfg(feature = "hixie76")]
#[allow(clippy::too_many_arguments)]
async fn hixie76_handshake<S>(
    inner: &Rc<RefCell<Inner>>,
    peer_addr: SocketAddr,
    stream: &mut S,
    request: &Request,
    input: &mut BytesMut,
    handlers: &Rc<HandlerRegistry>,
    logger: &Arc<dyn Logger>,
    alive: &Rc<RefCell<bool>>,
) -> Result<Option<Arc<dyn WebSocketHandler>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut writer = ConnectionWriter::new(inner.clone(), peer_addr, logger.clone(), alive.clone());
    let path = format!("/{}", request.uri.path().join("/"));

    let Some((handler, _allow_cross_origin)) = handlers.websocket_handler(&path) else {
        writer.error(404, &format!("no WebSocket handler for {path}"))?;
        flush_output(inner, stream).await?;
        return Ok(None);
    };

    let key1 = request.headers.get("Sec-WebSocket-Key1").unwrap_or("");
    let key2 = request.headers.get("Sec-WebSocket-Key2").unwrap_or("");

    // key3 is the 8 raw bytes the client sends immediately after the
    // request headers, with no Content-Length to announce it (spec §3's
    // READING_WEBSOCKET_KEY3 state).
    while input.len() < 8 {
        let mut buf = [0u8; READ_CHUNK];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::IOError {
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before Hixie-76 key3 arrived",
                ),
            });
        }
        input.extend_from_slice(&buf[..n]);
    }
    let key3: [u8; 8] = input.split_to(8)[..].try_into().unwrap();

    let digest = match handshake::hixie76::compute_response(key1, key2, &key3) {
        Ok(digest) => digest,
        Err(_) => {
            writer.error(400, "malformed Sec-WebSocket-Key1/Key2")?;
            flush_output(inner, stream).await?;
            return Ok(None);
        }
    };

    let host = request.headers.get("Host").unwrap_or("");
    let origin = request.headers.get("Origin").unwrap_or("");

    // The Hixie-76 upgrade response predates the common-header/status-line
    // shape the Hybi path shares with plain HTTP responses, so it is built
    // by hand here rather than through `ConnectionWriter::begin`.
    let mut inner_mut = inner.borrow_mut();
    inner_mut.output.extend_from_slice(
        format!(
            "HTTP/1.1 101 WebSocket Protocol Handshake\r\n\
             Upgrade: WebSocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Origin: {origin}\r\n\
             Sec-WebSocket-Location: ws://{host}{path}\r\n\r\n"
        )
        .as_bytes(),
    );
    inner_mut.output.extend_from_slice(&digest);
    drop(inner_mut);
    flush_output(inner, stream).await?;

    handler.on_connect(inner.borrow().id, request);
    Ok(Some(handler))
}

/// Drives the legacy Hixie-76 message loop: frames are `0x00 <utf8 text>
/// 0xff`, with no masking, fragmentation, or control opcodes (spec §4.B).
/// Only text messages exist in this protocol version.
#[cfg(feature = "hixie76")]
async fn run_hixie_message_loop<S>(
    inner: &Rc<RefCell<Inner>>,
    stream: &mut S,
    input: &mut BytesMut,
    handler: Arc<dyn WebSocketHandler>,
    stats: &Arc<ConnectionStats>,
    logger: &Arc<dyn Logger>,
    alive: &Rc<RefCell<bool>>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connection_id = inner.borrow().id;
    let sender = Rc::new(ConnSender {
        inner: inner.clone(),
        deflate: None,
        alive: alive.clone(),
        logger: logger.clone(),
    });

    loop {
        let frame_end = input.iter().position(|&b| b == 0xff);
        let (start_ok, frame_end) = match (input.first(), frame_end) {
            (Some(0x00), Some(end)) => (true, end),
            _ => (false, 0),
        };

        if start_ok {
            let text = String::from_utf8_lossy(&input[1..frame_end]).into_owned();
            input.advance(frame_end + 1);
            handler.on_message(connection_id, Message::Text(text), sender.as_ref());
            flush_output(inner, stream).await?;
            if connection_should_close(inner) {
                break;
            }
            continue;
        }

        let mut buf = [0u8; READ_CHUNK];
        match read_with_wakeup(inner, stream, &mut buf).await? {
            ReadOutcome::Eof => break,
            ReadOutcome::Woken => {
                flush_output(inner, stream).await?;
                if connection_should_close(inner) {
                    break;
                }
                continue;
            }
            ReadOutcome::Data(n) => {
                input.extend_from_slice(&buf[..n]);
                stats.add_read(n as u64);
            }
        }
    }

    handler.on_disconnect(connection_id);
    logger.log(Level::Debug, &format!("connection {connection_id} closed (hixie76)"));
    Ok(())
}

/// Drives the Hybi frame loop for an upgraded connection until a Close frame
/// or transport error (spec §4.C's receive dispatch table).
#[allow(clippy::too_many_arguments)]
async fn run_websocket_loop<S>(
    inner: &Rc<RefCell<Inner>>,
    _peer_addr: SocketAddr,
    stream: &mut S,
    input: &mut BytesMut,
    ws_config: &Arc<WebSocketConfig>,
    handler_and_deflate: (Arc<dyn WebSocketHandler>, Option<PermessageDeflateParams>),
    stats: &Arc<ConnectionStats>,
    logger: &Arc<dyn Logger>,
    alive: &Rc<RefCell<bool>>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (handler, deflate_params) = handler_and_deflate;
    let connection_id = inner.borrow().id;

    let mut inflate = deflate_params.as_ref().map(|p| {
        InflateContext::new(p.client_no_context_takeover, p.client_max_window_bits)
    });
    let deflate_ctx = deflate_params.as_ref().map(|p| {
        Rc::new(RefCell::new(DeflateContext::new(
            p.server_no_context_takeover,
            p.server_max_window_bits,
        )))
    });

    let sender = Rc::new(ConnSender {
        inner: inner.clone(),
        deflate: deflate_ctx,
        alive: alive.clone(),
        logger: logger.clone(),
    });

    let mut decoder = FrameDecoder::with_max_frame_size(ws_config.max_frame_size);

    loop {
        match decoder.decode_next(input)? {
            Decoded::NoMessage => {
                let mut buf = [0u8; READ_CHUNK];
                match read_with_wakeup(inner, stream, &mut buf).await? {
                    ReadOutcome::Eof => break,
                    ReadOutcome::Woken => {}
                    ReadOutcome::Data(n) => {
                        input.extend_from_slice(&buf[..n]);
                        stats.add_read(n as u64);
                    }
                }
                flush_output(inner, stream).await?;
                if connection_should_close(inner) {
                    break;
                }
                continue;
            }
            Decoded::Message {
                kind,
                payload,
                deflate_needed,
            } => {
                let payload = if deflate_needed {
                    match &mut inflate {
                        Some(ctx) => ctx.decompress(&payload)?,
                        None => return Err(Error::Internal(
                            "RSV1 set but permessage-deflate was not negotiated".into(),
                        )),
                    }
                } else {
                    payload
                };

                if payload.len() > ws_config.max_message_size {
                    return Err(Error::MaxMessageSize(payload.len(), ws_config.max_message_size));
                }

                match kind {
                    MessageKind::Text | MessageKind::Binary => {
                        let message = Message::from_decoded(kind, payload)?;
                        handler.on_message(connection_id, message, sender.as_ref());
                    }
                    MessageKind::Ping => {
                        let mut inner_mut = inner.borrow_mut();
                        inner_mut.output.extend_from_slice(&frame::encode_pong(&payload));
                        inner_mut.notify.notify_one();
                    }
                    MessageKind::Pong => {
                        // Unsolicited pongs are allowed and ignored (spec §4.C).
                    }
                    MessageKind::Close => {
                        let mut inner_mut = inner.borrow_mut();
                        inner_mut.output.extend_from_slice(&frame::encode_close());
                        inner_mut.close_when_empty = true;
                        drop(inner_mut);
                        flush_output(inner, stream).await?;
                        break;
                    }
                }
                flush_output(inner, stream).await?;
                if connection_should_close(inner) {
                    break;
                }
            }
        }
    }

    handler.on_disconnect(connection_id);
    logger.log(Level::Debug, &format!("connection {connection_id} closed"));
    Ok(())
}

/// True once a drained, empty-buffer connection has been asked to close —
/// by the user (`finish(false)`/`ConnSender::close`), the idle reaper, or
/// the slow-consumer buffer cap (spec §4.C/§5). Read loops check this after
/// each flush so a close request actually ends the task rather than only
/// being visible through `is_active()`.
fn connection_should_close(inner: &Rc<RefCell<Inner>>) -> bool {
    let inner = inner.borrow();
    inner.closed || (inner.close_when_empty && inner.output.is_empty())
}

/// Looks up a still-live connection's writer by id and hands it to `f`
/// (spec §9: this is the indirection a background thread must go through —
/// it never holds the real `Rc`-backed writer itself, only a connection id
/// plus a [`crate::server::ServerHandle`] that can post work to run here).
/// Marks a still-tracked connection to close once its output buffer drains,
/// and wakes its task so it notices promptly. Used by the idle reaper, which
/// only has a connection id and [`ConnectionTable`] to work with.
pub(crate) fn close_from_reaper(table: &ConnectionTable, id: u64) {
    let entry = table.borrow().get(&id).cloned();
    if let Some(inner) = entry {
        {
            let mut guard = inner.borrow_mut();
            guard.closed = true;
            guard.close_when_empty = true;
            guard.notify.notify_one();
        }
        cancel_active_streaming_response(&inner);
    }
}

pub(crate) fn with_connection_writer(
    table: &ConnectionTable,
    logger: Arc<dyn Logger>,
    id: u64,
    f: Box<dyn FnOnce(&mut dyn ResponseWriter)>,
) {
    let entry = table.borrow().get(&id).cloned();
    if let Some(inner) = entry {
        let peer_addr = inner.borrow().peer_addr;
        let alive = Rc::new(RefCell::new(!inner.borrow().closed));
        let mut writer = ConnectionWriter::new(inner, peer_addr, logger, alive);
        f(&mut writer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogCrateLogger;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    fn new_inner() -> Rc<RefCell<Inner>> {
        Rc::new(RefCell::new(Inner {
            id: 1,
            peer_addr: addr(),
            output: Vec::new(),
            writer_phase: WriterPhase::Idle,
            encoding: TransferEncoding::Raw,
            close_when_empty: false,
            closed: false,
            response_active: true,
            client_buffer_size: 16 * 1024 * 1024,
            server_header: "tidepool".to_string(),
            notify: Rc::new(Notify::new()),
            stats: Arc::new(ConnectionStats::new(1, addr())),
            active_streaming: None,
        }))
    }

    #[test]
    fn writer_emits_status_line_and_common_headers() {
        let inner = new_inner();
        let alive = Rc::new(RefCell::new(true));
        let mut writer = ConnectionWriter::new(inner.clone(), addr(), Arc::new(LogCrateLogger), alive);
        writer.begin(200, TransferEncoding::Raw).unwrap();
        writer.header("X-Test", "1").unwrap();
        writer.payload(b"hi", true).unwrap();
        writer.finish(true).unwrap();

        let output = String::from_utf8(inner.borrow().output.clone()).unwrap();
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(output.contains("Access-Control-Allow-Origin: *"));
        assert!(output.contains("X-Test: 1"));
        assert!(output.ends_with("hi"));
    }

    #[test]
    fn writes_past_client_buffer_size_close_the_connection() {
        let inner = Rc::new(RefCell::new(Inner {
            id: 1,
            peer_addr: addr(),
            output: Vec::new(),
            writer_phase: WriterPhase::Idle,
            encoding: TransferEncoding::Raw,
            close_when_empty: false,
            closed: false,
            response_active: true,
            client_buffer_size: 16,
            server_header: "tidepool".to_string(),
            notify: Rc::new(Notify::new()),
            stats: Arc::new(ConnectionStats::new(1, addr())),
            active_streaming: None,
        }));
        let alive = Rc::new(RefCell::new(true));
        let mut writer = ConnectionWriter::new(inner.clone(), addr(), Arc::new(LogCrateLogger), alive);
        writer.begin(200, TransferEncoding::Raw).unwrap();
        writer.payload(&[0u8; 64], false).unwrap();

        assert!(!writer.is_active());
        assert!(inner.borrow().closed);
        assert!(inner.borrow().close_when_empty);
    }

    #[test]
    fn chunked_payload_is_hex_length_framed() {
        let inner = new_inner();
        let alive = Rc::new(RefCell::new(true));
        let mut writer = ConnectionWriter::new(inner.clone(), addr(), Arc::new(LogCrateLogger), alive);
        writer.begin(200, TransferEncoding::Chunked).unwrap();
        writer.payload(b"abc", true).unwrap();
        writer.finish(true).unwrap();

        let output = String::from_utf8(inner.borrow().output.clone()).unwrap();
        assert!(output.contains("Transfer-Encoding: chunked"));
        assert!(output.contains("3\r\nabc\r\n"));
        assert!(output.ends_with("0\r\n\r\n"));
    }

    #[test]
    fn is_active_false_once_finished() {
        let inner = new_inner();
        let alive = Rc::new(RefCell::new(true));
        let mut writer = ConnectionWriter::new(inner.clone(), addr(), Arc::new(LogCrateLogger), alive);
        writer.begin(200, TransferEncoding::Raw).unwrap();
        assert!(writer.is_active());
        writer.finish(true).unwrap();
        assert!(!writer.is_active());
    }

    #[test]
    fn is_active_false_once_connection_marked_dead() {
        let inner = new_inner();
        let alive = Rc::new(RefCell::new(true));
        let mut writer = ConnectionWriter::new(inner, addr(), Arc::new(LogCrateLogger), alive.clone());
        assert!(writer.is_active());
        *alive.borrow_mut() = false;
        assert!(!writer.is_active());
        // Writes after the connection has gone away are silent no-ops.
        assert!(writer.payload(b"late", true).is_ok());
    }

    struct RecordingStreaming {
        cancelled: Arc<std::sync::atomic::AtomicBool>,
    }

    impl StreamingResponse for RecordingStreaming {
        fn handle(&self, _writer: &mut dyn ResponseWriter) {}
        fn cancel(&self) {
            self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_active_streaming_response_invokes_cancel_exactly_once() {
        use std::sync::atomic::Ordering;

        let inner = new_inner();
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let streaming: Arc<dyn StreamingResponse> = Arc::new(RecordingStreaming {
            cancelled: cancelled.clone(),
        });
        inner.borrow_mut().active_streaming = Some(streaming);

        cancel_active_streaming_response(&inner);
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(inner.borrow().active_streaming.is_none());

        cancelled.store(false, Ordering::SeqCst);
        cancel_active_streaming_response(&inner);
        assert!(!cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn finish_clears_active_streaming_without_cancelling() {
        use std::sync::atomic::Ordering;

        let inner = new_inner();
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let streaming: Arc<dyn StreamingResponse> = Arc::new(RecordingStreaming {
            cancelled: cancelled.clone(),
        });
        inner.borrow_mut().active_streaming = Some(streaming);

        let alive = Rc::new(RefCell::new(true));
        let mut writer = ConnectionWriter::new(inner.clone(), addr(), Arc::new(LogCrateLogger), alive);
        writer.begin(200, TransferEncoding::Raw).unwrap();
        writer.finish(true).unwrap();

        assert!(inner.borrow().active_streaming.is_none());
        assert!(!cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn read_with_wakeup_resolves_on_notify_without_new_data() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (_client, mut server_stream) = tokio::io::duplex(1024);
                let inner = new_inner();
                let notify = inner.borrow().notify.clone();

                let inner_for_task = inner.clone();
                let task = tokio::task::spawn_local(async move {
                    let mut buf = [0u8; 64];
                    read_with_wakeup(&inner_for_task, &mut server_stream, &mut buf).await
                });

                tokio::task::yield_now().await;
                notify.notify_one();

                let outcome = tokio::time::timeout(std::time::Duration::from_millis(200), task)
                    .await
                    .expect("read_with_wakeup did not resolve after notify_one")
                    .unwrap()
                    .unwrap();
                assert!(matches!(outcome, ReadOutcome::Woken));
            })
            .await;
    }

    #[tokio::test]
    async fn read_with_wakeup_returns_data_when_peer_writes() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (mut client, mut server_stream) = tokio::io::duplex(1024);
                let inner = new_inner();

                let inner_for_task = inner.clone();
                let task = tokio::task::spawn_local(async move {
                    let mut buf = [0u8; 64];
                    let outcome = read_with_wakeup(&inner_for_task, &mut server_stream, &mut buf).await?;
                    Ok::<_, Error>((outcome, buf))
                });

                client.write_all(b"hi").await.unwrap();

                let (outcome, buf) = tokio::time::timeout(std::time::Duration::from_millis(200), task)
                    .await
                    .expect("read_with_wakeup did not resolve after data arrived")
                    .unwrap()
                    .unwrap();
                match outcome {
                    ReadOutcome::Data(n) => assert_eq!(&buf[..n], b"hi"),
                    _ => panic!("expected a Data outcome"),
                }
            })
            .await;
    }
}
