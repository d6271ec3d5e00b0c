//! The reactor — component F. One `Server` binds a listener and drives every
//! accepted connection as a `!Send` task on a single `LocalSet`, matching the
//! single reactor-thread contract described throughout spec §4/§5. Grounded
//! in the teacher's `start_server_with_config` accept loop, generalized from
//! a fixed echo handler into a `Config`-driven server with a handler
//! registry, an idle reaper, and a cross-thread `execute`/`terminate` bridge.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, LocalSet};

use crate::config::{Config, WebSocketConfig};
use crate::connection::{self, ConnectionTable, StatsTable};
use crate::error::{Error, Result};
use crate::handlers::{HandlerRegistry, PageHandler, WebSocketHandler};
use crate::logger::{Level, Logger};
use crate::response::ResponseWriter;
use crate::stats::ConnectionStats;

/// Work a background thread posted via [`ServerHandle::execute`], run
/// against the reactor-thread-only [`ServerContext`] the next time the
/// reactor's job queue is drained (spec §9: "the only legal bridge for
/// background threads wanting to touch connection state").
type RemoteJob = Box<dyn FnOnce(&ServerContext) + Send>;

/// What a [`RemoteJob`] gets to touch: the connection table, keyed by id, and
/// the server's logger. This is deliberately narrower than `Server` itself —
/// `Server`'s own state (the listener, the job receiver) never needs to be
/// reachable from posted work.
pub struct ServerContext {
    connections: ConnectionTable,
    logger: Arc<dyn Logger>,
}

impl ServerContext {
    /// Looks up a still-live connection by id and hands its writer to `f`.
    /// A silent no-op if the connection has already closed (spec §9: a
    /// remote writer handle that outlives its connection degrades
    /// gracefully rather than panicking).
    pub fn post_to_connection(&self, id: u64, f: impl FnOnce(&mut dyn ResponseWriter) + 'static) {
        connection::with_connection_writer(&self.connections, self.logger.clone(), id, Box::new(f));
    }
}

/// A `Send + Sync` handle to a running [`Server`], the only legal way for
/// code outside the reactor thread to reach connection state (spec §5's
/// `execute`/`terminate` contract).
#[derive(Clone)]
pub struct ServerHandle {
    jobs_tx: mpsc::UnboundedSender<RemoteJob>,
    terminate_flag: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Posts `job` to run on the reactor thread against a [`ServerContext`].
    /// Jobs run in the order they were posted (spec §5's FIFO guarantee).
    /// Returns an error if the server has already shut down.
    pub fn execute(&self, job: impl FnOnce(&ServerContext) + Send + 'static) -> Result<()> {
        self.jobs_tx
            .send(Box::new(job))
            .map_err(|_| Error::Internal("server has already shut down".into()))
    }

    /// Signals the reactor loop to stop accepting new work and return from
    /// `serve`/`serve_unix` once the current tick finishes.
    pub fn terminate(&self) {
        self.terminate_flag.store(true, Ordering::SeqCst);
        // Wake the job-queue side of the select! promptly even if otherwise idle.
        let _ = self.jobs_tx.send(Box::new(|_: &ServerContext| {}));
    }
}

/// The embeddable HTTP/1.1 + WebSocket server (spec §1). Register handlers
/// with [`Server::add_page_handler`]/[`Server::add_websocket_handler`], then
/// call [`Server::serve`] (or [`Server::serve_unix`]) to block the calling
/// thread running the reactor loop.
pub struct Server {
    config: Config,
    ws_config: WebSocketConfig,
    handlers: HandlerRegistry,
    handle: ServerHandle,
    jobs_rx: mpsc::UnboundedReceiver<RemoteJob>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self::with_websocket_config(config, WebSocketConfig::default())
    }

    pub fn with_websocket_config(config: Config, ws_config: WebSocketConfig) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let handle = ServerHandle {
            jobs_tx,
            terminate_flag: Arc::new(AtomicBool::new(false)),
        };
        Server {
            config,
            ws_config,
            handlers: HandlerRegistry::new(),
            handle,
            jobs_rx,
        }
    }

    pub fn add_page_handler(&mut self, handler: Arc<dyn PageHandler>) {
        self.handlers.add_page_handler(handler);
    }

    pub fn add_websocket_handler(
        &mut self,
        endpoint: impl Into<String>,
        handler: Arc<dyn WebSocketHandler>,
        allow_cross_origin: bool,
    ) {
        self.handlers
            .add_websocket_handler(endpoint, handler, allow_cross_origin);
    }

    /// A cloneable, `Send + Sync` handle that background threads can use to
    /// reach this server once it is running.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Binds `addr` over TCP and blocks the calling thread running the
    /// reactor loop until [`ServerHandle::terminate`] is called.
    pub fn serve(self, addr: SocketAddr) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = LocalSet::new();
        local.block_on(&runtime, async move {
            let listener = TcpListener::bind(addr).await?;
            self.config
                .logger
                .log(Level::Info, &format!("tidepool listening on tcp://{addr}"));
            self.run_loop(Accepted::Tcp(listener)).await
        })
    }

    /// Binds `addr` over TCP and wraps every accepted stream in a TLS
    /// session using `acceptor` before handing it to the reactor (grounded
    /// in the teacher's `echo_server_tls`/`simple_server_tls` examples,
    /// generalized from a single hardcoded handler into the same
    /// `Config`/registry-driven accept loop `serve` uses).
    #[cfg(feature = "tls")]
    pub fn serve_tls(self, addr: SocketAddr, acceptor: tokio_rustls::TlsAcceptor) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = LocalSet::new();
        local.block_on(&runtime, async move {
            let listener = TcpListener::bind(addr).await?;
            self.config
                .logger
                .log(Level::Info, &format!("tidepool listening on tls+tcp://{addr}"));
            self.run_loop(Accepted::Tls(listener, acceptor)).await
        })
    }

    /// Binds a Unix-domain socket at `path` and blocks the calling thread
    /// running the reactor loop until [`ServerHandle::terminate`] is called.
    #[cfg(unix)]
    pub fn serve_unix(self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = LocalSet::new();
        local.block_on(&runtime, async move {
            let listener = UnixListener::bind(&path)?;
            self.config.logger.log(
                Level::Info,
                &format!("tidepool listening on unix://{}", path.display()),
            );
            self.run_loop(Accepted::Unix(listener)).await
        })
    }

    async fn run_loop(self, listener: Accepted) -> Result<()> {
        let Server {
            config,
            ws_config,
            handlers,
            handle,
            mut jobs_rx,
        } = self;
        let config = Arc::new(config);
        let ws_config = Arc::new(ws_config);
        let handlers = Rc::new(handlers);
        let connections: ConnectionTable = Rc::new(RefCell::new(HashMap::new()));
        let stats: StatsTable = Rc::new(RefCell::new(HashMap::new()));
        let tasks: Rc<RefCell<HashMap<u64, JoinHandle<()>>>> = Rc::new(RefCell::new(HashMap::new()));
        let next_id = Rc::new(Cell::new(0u64));
        let ctx = ServerContext {
            connections: connections.clone(),
            logger: config.logger.clone(),
        };

        let mut reap_interval =
            tokio::time::interval(Duration::from_millis(config.poll_timeout_millis.max(1)));

        loop {
            if handle.terminate_flag.load(Ordering::SeqCst) {
                break;
            }

            tokio::select! {
                accepted = listener.accept(config.max_keep_alive_drops, config.shutdown_linger_seconds, &config.logger) => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let id = next_id.get();
                            next_id.set(id + 1);
                            let conn_stats = Arc::new(ConnectionStats::new(id, peer_addr));
                            stats.borrow_mut().insert(id, conn_stats.clone());

                            let config_for_task = config.clone();
                            let ws_config_for_task = ws_config.clone();
                            let handlers_for_task = handlers.clone();
                            let connections_for_task = connections.clone();
                            let tasks_for_cleanup = tasks.clone();
                            let stats_for_task = stats.clone();

                            let join = tokio::task::spawn_local(async move {
                                let result = match stream {
                                    AcceptedStream::Tcp(stream) => {
                                        connection::serve_connection(
                                            id, peer_addr, stream, config_for_task.clone(), ws_config_for_task,
                                            handlers_for_task, conn_stats, connections_for_task, stats_for_task,
                                        ).await
                                    }
                                    #[cfg(unix)]
                                    AcceptedStream::Unix(stream) => {
                                        connection::serve_connection(
                                            id, peer_addr, stream, config_for_task.clone(), ws_config_for_task,
                                            handlers_for_task, conn_stats, connections_for_task, stats_for_task,
                                        ).await
                                    }
                                    #[cfg(feature = "tls")]
                                    AcceptedStream::Tls(stream) => {
                                        connection::serve_connection(
                                            id, peer_addr, stream, config_for_task.clone(), ws_config_for_task,
                                            handlers_for_task, conn_stats, connections_for_task, stats_for_task,
                                        ).await
                                    }
                                };
                                if let Err(err) = result {
                                    config_for_task.logger.log(
                                        Level::Warning,
                                        &format!("connection {id} ended with {err}"),
                                    );
                                }
                                tasks_for_cleanup.borrow_mut().remove(&id);
                            });
                            tasks.borrow_mut().insert(id, join);
                        }
                        Err(err) => {
                            config.logger.log(Level::Warning, &format!("accept() failed: {err}"));
                        }
                    }
                }
                job = jobs_rx.recv() => {
                    if let Some(job) = job {
                        job(&ctx);
                    }
                }
                _ = reap_interval.tick() => {
                    reap_idle_connections(
                        &stats, &tasks, &connections, config.lame_connection_timeout_seconds, &config.logger,
                    );
                }
            }
        }

        // spec §3/§5: "destruction shuts down all connections" / "terminate()
        // ... connections in flight are closed" once the loop exits. Each
        // accepted socket already carries SO_LINGER (applied at accept time
        // above) so the abort below still gives the kernel a chance to flush
        // pending bytes instead of an abrupt RST. `abort()` does not run a
        // task's own unwind path, so any in-flight streaming response is
        // cancelled explicitly here rather than relying on the task noticing
        // its own cancellation.
        connection::cancel_all_pending_streaming_responses(&connections);
        for (_, join) in tasks.borrow_mut().drain() {
            join.abort();
        }

        Ok(())
    }
}

/// Abstracts over the TCP and Unix-domain listeners so [`Server::run_loop`]
/// has one accept loop regardless of transport (spec §6: "IPv4 TCP and
/// Unix-domain listening are both implemented").
enum Accepted {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
    #[cfg(feature = "tls")]
    Tls(TcpListener, tokio_rustls::TlsAcceptor),
}

enum AcceptedStream {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::server::TlsStream<tokio::net::TcpStream>),
}

impl Accepted {
    async fn accept(
        &self,
        max_keep_alive_drops: u32,
        shutdown_linger_seconds: u32,
        logger: &Arc<dyn Logger>,
    ) -> io::Result<(AcceptedStream, SocketAddr)> {
        match self {
            Accepted::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                apply_keepalive(&stream, max_keep_alive_drops, logger);
                apply_linger(&stream, shutdown_linger_seconds, logger);
                Ok((AcceptedStream::Tcp(stream), addr))
            }
            #[cfg(unix)]
            Accepted::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                // Unix-domain peers have no meaningful SocketAddr; synthesize
                // one so the rest of the pipeline (stats, logging) has a
                // stable identity to key off of.
                let synthetic = SocketAddr::from(([127, 0, 0, 1], 0));
                Ok((AcceptedStream::Unix(stream), synthetic))
            }
            #[cfg(feature = "tls")]
            Accepted::Tls(listener, acceptor) => {
                let (stream, addr) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                apply_keepalive(&stream, max_keep_alive_drops, logger);
                apply_linger(&stream, shutdown_linger_seconds, logger);
                let tls_stream = acceptor.accept(stream).await?;
                Ok((AcceptedStream::Tls(tls_stream), addr))
            }
        }
    }
}

/// Applies spec §4.F's optional TCP keepalive to a freshly accepted socket:
/// `maxKeepAliveDrops == 0` (the default) leaves keepalive off entirely;
/// any positive value enables it with 1-second IDLE/INTVL probes and that
/// many allowed drops before the kernel gives up on the connection.
/// Grounded in the original `Server::setupConnection`'s
/// `SO_KEEPALIVE`/`TCP_KEEPIDLE`/`TCP_KEEPINTVL`/`TCP_KEEPCNT` sequence; the
/// pack's HTTP-serving examples reach for `socket2` for this exact kind of
/// socket-option tuning that `tokio::net::TcpStream` doesn't expose directly.
fn apply_keepalive(stream: &tokio::net::TcpStream, max_keep_alive_drops: u32, logger: &Arc<dyn Logger>) {
    if max_keep_alive_drops == 0 {
        return;
    }
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(1))
        .with_interval(Duration::from_secs(1))
        .with_retries(max_keep_alive_drops);
    if let Err(err) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        logger.log(Level::Warning, &format!("failed to set TCP keepalive: {err}"));
    }
}

/// Sets `SO_LINGER` on a freshly accepted socket (spec §3: "destruction
/// shuts down all connections with SO_LINGER set"; spec §5: "connections in
/// flight are closed with SO_LINGER set to 1 second"). Applied once at
/// accept time rather than re-applied at `terminate()`, since the option
/// only needs to be in place before the fd's final `close()`, wherever that
/// happens — whether a normal connection close or the abort every
/// outstanding task takes when the reactor loop exits.
fn apply_linger(stream: &tokio::net::TcpStream, linger_seconds: u32, logger: &Arc<dyn Logger>) {
    let linger = Duration::from_secs(linger_seconds as u64);
    if let Err(err) = socket2::SockRef::from(stream).set_linger(Some(linger)) {
        logger.log(Level::Warning, &format!("failed to set SO_LINGER: {err}"));
    }
}

/// Destroys connections that have received zero bytes since accept and have
/// now exceeded `timeout_seconds` (spec §4.F's "lame connection" reaper).
fn reap_idle_connections(
    stats: &StatsTable,
    tasks: &Rc<RefCell<HashMap<u64, JoinHandle<()>>>>,
    connections: &ConnectionTable,
    timeout_seconds: u64,
    logger: &Arc<dyn Logger>,
) {
    let mut lame = Vec::new();
    stats.borrow_mut().retain(|id, stat| {
        let finished = !tasks.borrow().contains_key(id);
        if finished {
            return false;
        }
        if stat.bytes_read() == 0 && stat.since.elapsed().as_secs() >= timeout_seconds {
            lame.push(*id);
            return false;
        }
        true
    });

    for id in lame {
        logger.log(Level::Debug, &format!("reaping lame connection {id}"));
        connection::close_from_reaper(connections, id);
        if let Some(join) = tasks.borrow_mut().remove(&id) {
            join.abort();
        }
    }
}
