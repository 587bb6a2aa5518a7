//! # ICAP filter server.
//!
//! The server owns one listening socket and spawns one worker task per
//! accepted connection. Workers share nothing mutable besides the read-only
//! [`ServiceOptions`] and a shutdown flag. The server:
//!
//! - Answers `OPTIONS` itself from [`ServiceOptions`];
//! - Hands every parsed `REQMOD`/`RESPMOD` to one external handler and writes
//!   back the [`Response`] it returns, if any;
//! - Frames messages by their own `Encapsulated` offsets ([`FrameMode::Delimited`]),
//!   or by the legacy short-read heuristic ([`FrameMode::ShortRead`]);
//! - Drops malformed messages without closing the connection;
//! - Can limit concurrent connections via a semaphore, refusing the excess
//!   with an early `503`;
//! - Stops accepting and winds down workers when its [`ShutdownHandle`] fires.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use icap_filter::{ConnectionInfo, Method, Request, Response, Server, ServiceOptions};
//! use icap_filter::error::IcapResult;
//!
//! #[tokio::main]
//! async fn main() -> IcapResult<()> {
//!     let server = Server::builder()
//!         .bind("127.0.0.1:1344")
//!         .with_options(
//!             ServiceOptions::new("Filter Service", "filter-1.0")
//!                 .with_methods([Method::ReqMod, Method::RespMod]),
//!         )
//!         .with_handler(|_conn: ConnectionInfo, _req: Arc<Request>| async move {
//!             Ok(Some(Response::no_content()))
//!         })
//!         .with_max_connections(128)
//!         .build()
//!         .await?;
//!
//!     let shutdown = server.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.shutdown();
//!     });
//!     server.run().await
//! }
//! ```

mod connection;
pub mod options;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, IcapResult};
use crate::parser::{NoopObserver, ParseObserver};
use crate::request::Request;
use crate::response::{Response, StatusCode};
use crate::{DEFAULT_CHUNK_SIZE, MAX_FRAME_BYTES};
pub use options::ServiceOptions;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 512;
/// Default idle/read timeout of a connection.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Pause after a transient accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// Future returned by a request handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = IcapResult<Option<Response>>> + Send>>;

/// Type-erased request handler.
type RequestHandler = Arc<dyn Fn(ConnectionInfo, Arc<Request>) -> HandlerFuture + Send + Sync>;

/// How a worker decides where one message ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameMode {
    /// Header block, then the `Encapsulated` offsets, then the chunked body
    /// through its zero-size terminator.
    #[default]
    Delimited,
    /// A read shorter than the chunk size ends the frame.
    ShortRead,
}

/// Identity of an accepted connection, passed to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Sequence number, unique per server.
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Cloneable trigger for a graceful stop.
///
/// Firing it makes [`Server::run`] return `Ok(())` and makes every worker
/// close its connection at its next read.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Settings every worker reads.
pub(crate) struct Shared {
    pub(crate) options: ServiceOptions,
    pub(crate) handler: RequestHandler,
    pub(crate) observer: Arc<dyn ParseObserver>,
    pub(crate) read_timeout: Duration,
    pub(crate) chunk_size: usize,
    pub(crate) max_frame_bytes: usize,
    pub(crate) frame_mode: FrameMode,
}

/// ICAP server.
///
/// Use [`Server::builder`] to construct and [`Server::run`] to serve.
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
    conn_limit: Option<Arc<Semaphore>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Create a new [`ServerBuilder`].
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Address the listener is bound to (useful with port `0`).
    pub fn local_addr(&self) -> IcapResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.shared.options
    }

    /// Accept loop.
    ///
    /// - Returns `Ok(())` once the shutdown handle fires.
    /// - Returns [`Error::Accept`] on a non-transient accept failure; the
    ///   listener is closed and no further connections are taken.
    /// - Transient failures (no connection pending, interrupted, aborted or
    ///   reset handshakes) back off briefly and retry.
    /// - With a connection limit, an over-limit connection gets an early
    ///   `503 Service Unavailable` and is closed.
    pub async fn run(self) -> IcapResult<()> {
        let local_addr = self.listener.local_addr()?;
        info!(addr=%local_addr, istag=%self.shared.options.istag, "ICAP server started");

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut next_id: u64 = 0;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let accepted = tokio::select! {
                _ = shutdown.changed() => continue,
                res = self.listener.accept() => res,
            };

            let (socket, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) if is_transient_accept_error(&e) => {
                    trace!(error=%e, "transient accept error, backing off");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    error!(error=%e, "accept failed, stopping listener");
                    return Err(Error::Accept(e));
                }
            };

            next_id += 1;
            let conn = ConnectionInfo {
                id: next_id,
                peer_addr,
                local_addr,
            };
            debug!(conn = conn.id, client=%peer_addr, "new connection");

            let permit = match &self.conn_limit {
                Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                    Ok(p) => Some(p),
                    Err(_) => {
                        warn!(client=%peer_addr, "refusing connection: too many concurrent connections");
                        let istag = self.shared.options.istag.clone();
                        tokio::spawn(refuse_connection(socket, peer_addr, istag));
                        continue;
                    }
                },
                None => None,
            };

            let shared = Arc::clone(&self.shared);
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = connection::serve(socket, conn, shared, shutdown_rx).await {
                    warn!(conn = conn.id, client=%conn.peer_addr, error=%e, "connection ended with error");
                }
                debug!(conn = conn.id, "connection closed");
            });
        }

        info!(addr=%local_addr, "ICAP server stopped");
        Ok(())
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Early `503` for a connection over the limit: send, drain what the peer
/// already sent, close.
async fn refuse_connection(mut socket: TcpStream, peer_addr: SocketAddr, istag: String) {
    let resp = Response::new(StatusCode::ServiceUnavailable503)
        .add_header("Connection", "close")
        .add_header("Encapsulated", "null-body=0");

    if let Err(e) = socket.write_all(&resp.to_raw(&istag)).await {
        warn!(client=%peer_addr, error=%e, "failed to send 503");
        return;
    }

    let mut tmp = [0u8; 1024];
    loop {
        match socket.try_read(&mut tmp) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    let _ = socket.shutdown().await;
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    bind_addr: Option<String>,
    backlog: u32,
    max_connections: Option<usize>,
    read_timeout: Duration,
    chunk_size: usize,
    max_frame_bytes: usize,
    frame_mode: FrameMode,
    options: ServiceOptions,
    handler: Option<RequestHandler>,
    observer: Arc<dyn ParseObserver>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            bind_addr: None,
            backlog: DEFAULT_BACKLOG,
            max_connections: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_bytes: MAX_FRAME_BYTES,
            frame_mode: FrameMode::default(),
            options: ServiceOptions::default(),
            handler: None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Set the bind address, e.g. `"127.0.0.1:1344"`.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = Some(addr.to_string());
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Limit the number of concurrent connections.
    ///
    /// Also advertised as `Max-Connections` unless the options set it.
    pub fn with_max_connections(mut self, n: usize) -> Self {
        self.max_connections = Some(n.max(1));
        self
    }

    /// Close a connection when a single read waits longer than this.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Size of one socket read.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Frames growing past this are discarded.
    pub fn with_max_frame_bytes(mut self, size: usize) -> Self {
        self.max_frame_bytes = size;
        self
    }

    pub fn with_frame_mode(mut self, mode: FrameMode) -> Self {
        self.frame_mode = mode;
        self
    }

    pub fn with_options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    /// Register the handler for `REQMOD`/`RESPMOD`.
    ///
    /// `Ok(None)` sends nothing. An `Err` or a panic is logged and nothing is
    /// sent; the connection stays open.
    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionInfo, Arc<Request>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IcapResult<Option<Response>>> + Send + 'static,
    {
        let h: RequestHandler =
            Arc::new(move |conn: ConnectionInfo, req: Arc<Request>| -> HandlerFuture {
                Box::pin(handler(conn, req))
            });
        self.handler = Some(h);
        self
    }

    pub fn with_observer<O>(mut self, observer: O) -> Self
    where
        O: ParseObserver + 'static,
    {
        self.observer = Arc::new(observer);
        self
    }

    /// Validate settings, bind the listener and create a [`Server`].
    ///
    /// Without a handler, modification requests are answered with
    /// `204 No Content`.
    pub async fn build(self) -> IcapResult<Server> {
        let mut options = self.options;
        options.validate()?;
        if self.chunk_size == 0 {
            return Err(Error::configuration("chunk size must be positive"));
        }
        if self.max_frame_bytes < self.chunk_size {
            return Err(Error::configuration(
                "maximum frame size must be at least one chunk",
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(Error::configuration("read timeout must be positive"));
        }
        if let (Some(n), None) = (self.max_connections, options.max_connections) {
            options.max_connections = Some(n);
        }

        let bind_addr = self
            .bind_addr
            .unwrap_or_else(|| "127.0.0.1:1344".to_string());
        let listener = bind_listener(&bind_addr, self.backlog).await?;

        let handler = match self.handler {
            Some(h) => h,
            None => {
                let h: RequestHandler = Arc::new(|_: ConnectionInfo, _: Arc<Request>| -> HandlerFuture {
                    Box::pin(async { Ok(Some(Response::no_content())) })
                });
                h
            }
        };

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Server {
            listener,
            shared: Arc::new(Shared {
                options,
                handler,
                observer: self.observer,
                read_timeout: self.read_timeout,
                chunk_size: self.chunk_size,
                max_frame_bytes: self.max_frame_bytes,
                frame_mode: self.frame_mode,
            }),
            conn_limit: self.max_connections.map(|n| Arc::new(Semaphore::new(n))),
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve `addr` and listen on the first address it yields.
async fn bind_listener(addr: &str, backlog: u32) -> IcapResult<TcpListener> {
    let bind_err = |source: io::Error| Error::Bind {
        addr: addr.to_string(),
        source,
    };

    let sock_addr = tokio::net::lookup_host(addr)
        .await
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| {
            bind_err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "address resolved to nothing",
            ))
        })?;

    let socket = if sock_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;

    #[cfg(unix)]
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(sock_addr).map_err(bind_err)?;
    let listener = socket.listen(backlog).map_err(bind_err)?;
    debug!(addr=%sock_addr, backlog, "listener bound");
    Ok(listener)
}
