//! The server handle driven by [`run_server`](crate::run_server).
//!
//! [`GracefulServer`] is the seam between the lifecycle core and whatever
//! actually serves requests. [`HttpServer`] is the stock implementation: an
//! axum [`Router`] served over hyper, plain or TLS, with connection
//! tracking for bounded graceful shutdown.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Request;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::connection::{ConnectionContext, ConnectionGuard, ConnectionTracker};
use crate::context::ShutdownContext;
use crate::error::{ServeError, ShutdownError};

/// Produces the base context for connections accepted on a listener,
/// given the listener's local address.
pub type BaseContext = Arc<dyn Fn(SocketAddr) -> ShutdownContext + Send + Sync>;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// A server whose lifecycle can be driven by [`run_server`](crate::run_server).
///
/// The setters are only called during setup, before any of the async
/// operations run. After that the server is used through `&self` only.
#[async_trait]
pub trait GracefulServer: Send + Sync {
    /// Attach the TLS configuration used by [`listen_and_serve_tls`](Self::listen_and_serve_tls).
    fn set_tls_config(&mut self, config: Arc<rustls::ServerConfig>);

    /// Attach the factory for per-connection base contexts.
    fn set_base_context(&mut self, base: BaseContext);

    /// Listen and serve plain connections until shut down or closed.
    ///
    /// Returns [`ServeError::ServerClosed`] after a shutdown or close.
    async fn listen_and_serve(&self) -> Result<(), ServeError>;

    /// Listen and serve TLS connections until shut down or closed.
    ///
    /// Certificates come from the attached TLS configuration; there are no
    /// certificate or key file paths.
    async fn listen_and_serve_tls(&self) -> Result<(), ServeError>;

    /// Stop accepting and wait for open connections to finish, up to
    /// `deadline`.
    async fn shutdown(&self, deadline: Instant) -> Result<(), ShutdownError>;

    /// Immediately close the listener and every open connection.
    fn close(&self) -> io::Result<()>;
}

/// Shared between the server, its connections and any [`ServerHandle`].
struct ServerState {
    /// Cancelled when the server stops accepting. Child of `closed`.
    draining: CancellationToken,
    /// Cancelled when every connection must be dropped.
    closed: CancellationToken,
    connections: ConnectionTracker,
    local_addr: OnceLock<SocketAddr>,
}

impl ServerState {
    fn new() -> Self {
        let closed = CancellationToken::new();
        Self {
            draining: closed.child_token(),
            closed,
            connections: ConnectionTracker::new(),
            local_addr: OnceLock::new(),
        }
    }
}

/// HTTP/1.1 and HTTP/2 server for an axum [`Router`].
pub struct HttpServer {
    addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    router: Router,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    base_context: Option<BaseContext>,
    state: Arc<ServerState>,
}

impl HttpServer {
    /// A server that binds `addr` when it starts serving.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self {
            addr,
            listener: Mutex::new(None),
            router,
            tls_config: None,
            base_context: None,
            state: Arc::new(ServerState::new()),
        }
    }

    /// A server that serves on an already bound listener.
    pub fn from_listener(listener: TcpListener, router: Router) -> io::Result<Self> {
        let addr = listener.local_addr()?;
        let server = Self {
            addr,
            listener: Mutex::new(Some(listener)),
            router,
            tls_config: None,
            base_context: None,
            state: Arc::new(ServerState::new()),
        };
        let _ = server.state.local_addr.set(addr);
        Ok(server)
    }

    /// The bound address once listening, otherwise the configured one.
    pub fn local_addr(&self) -> SocketAddr {
        self.state.local_addr.get().copied().unwrap_or(self.addr)
    }

    /// Whether a TLS configuration is attached.
    pub fn has_tls_config(&self) -> bool {
        self.tls_config.is_some()
    }

    /// A handle that can close the server from elsewhere.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: Arc::clone(&self.state),
        }
    }

    async fn take_listener(&self) -> Result<TcpListener, ServeError> {
        if let Some(listener) = self.listener.lock().await.take() {
            return Ok(listener);
        }
        TcpListener::bind(self.addr)
            .await
            .map_err(|source| ServeError::Bind {
                addr: self.addr,
                source,
            })
    }

    async fn serve(&self, tls: Option<TlsAcceptor>) -> Result<(), ServeError> {
        if self.state.draining.is_cancelled() {
            return Err(ServeError::ServerClosed);
        }

        let listener = self.take_listener().await?;
        let local = listener.local_addr()?;
        let _ = self.state.local_addr.set(local);

        let base = match &self.base_context {
            Some(factory) => factory(local),
            None => ShutdownContext::from(self.state.draining.clone()),
        };

        info!(addr = %local, tls = tls.is_some(), "Server listening");

        let mut backoff = ACCEPT_BACKOFF_MIN;
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.state.draining.cancelled() => {
                    info!(addr = %local, "Stopped accepting connections");
                    return Err(ServeError::ServerClosed);
                }
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    pair
                }
                Err(e) if is_connection_error(&e) => continue,
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Failed to accept connection");
                    tokio::select! {
                        _ = self.state.draining.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
                Err(e) => {
                    warn!(addr = %local, error = %e, "Listener failed, stopping accept loop");
                    return Err(ServeError::Io(e));
                }
            };

            let info = ConnectionContext {
                peer,
                local,
                shutdown: base.child(),
            };
            let guard = self.state.connections.guard();
            let span = debug_span!("http.connection", peer = %peer, tls = tls.is_some());
            tokio::spawn(
                handle_connection(
                    stream,
                    tls.clone(),
                    self.router.clone(),
                    info,
                    Arc::clone(&self.state),
                    guard,
                )
                .instrument(span),
            );
        }
    }
}

#[async_trait]
impl GracefulServer for HttpServer {
    fn set_tls_config(&mut self, config: Arc<rustls::ServerConfig>) {
        self.tls_config = Some(config);
    }

    fn set_base_context(&mut self, base: BaseContext) {
        self.base_context = Some(base);
    }

    async fn listen_and_serve(&self) -> Result<(), ServeError> {
        self.serve(None).await
    }

    async fn listen_and_serve_tls(&self) -> Result<(), ServeError> {
        let config = self
            .tls_config
            .clone()
            .ok_or(ServeError::MissingTlsConfig)?;
        self.serve(Some(TlsAcceptor::from(config))).await
    }

    async fn shutdown(&self, deadline: Instant) -> Result<(), ShutdownError> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        self.state.draining.cancel();

        let active = self.state.connections.active();
        if active == 0 {
            debug!("No active connections, drain complete");
            return Ok(());
        }

        info!(
            active_connections = active,
            timeout_ms = timeout.as_millis() as u64,
            "Draining active connections"
        );

        match tokio::time::timeout_at(deadline, self.state.connections.wait_idle()).await {
            Ok(()) => {
                info!("All connections drained cleanly");
                Ok(())
            }
            Err(_) => {
                let remaining = self.state.connections.active();
                warn!(
                    remaining_connections = remaining,
                    timeout_ms = timeout.as_millis() as u64,
                    "Drain deadline expired"
                );
                Err(ShutdownError::DeadlineExceeded {
                    timeout,
                    remaining: Some(remaining),
                })
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        ServerHandle {
            state: Arc::clone(&self.state),
        }
        .close();
        Ok(())
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("addr", &self.local_addr())
            .field("tls", &self.has_tls_config())
            .field("base_context", &self.base_context.is_some())
            .field("active_connections", &self.state.connections.active())
            .finish()
    }
}

/// Controls a running [`HttpServer`] from outside the run.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

impl ServerHandle {
    /// Close the listener and abort every connection. Idempotent.
    pub fn close(&self) {
        if self.state.closed.is_cancelled() {
            return;
        }
        info!(
            active_connections = self.state.connections.active(),
            "Force-closing server"
        );
        self.state.closed.cancel();
    }

    /// Whether the server has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.closed.is_cancelled()
    }

    /// Whether the server has stopped accepting connections.
    pub fn is_draining(&self) -> bool {
        self.state.draining.is_cancelled()
    }

    /// Number of connections currently open.
    pub fn active_connections(&self) -> usize {
        self.state.connections.active()
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("draining", &self.is_draining())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Errors that only affect one pending connection.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Accept errors worth retrying: the listener is fine, the process is
/// short on resources.
fn is_transient_accept_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    ) {
        return true;
    }
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

async fn handle_connection(
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
    router: Router,
    info: ConnectionContext,
    state: Arc<ServerState>,
    _guard: ConnectionGuard,
) {
    let _ = stream.set_nodelay(true);
    let conn_ctx = info.shutdown.clone();

    match tls {
        None => serve_connection(stream, router, info, &state).await,
        Some(acceptor) => {
            let handshake = tokio::select! {
                result = acceptor.accept(stream) => result,
                _ = state.draining.cancelled() => {
                    debug!("Abandoning TLS handshake, server is shutting down");
                    return;
                }
            };
            match handshake {
                Ok(stream) => serve_connection(stream, router, info, &state).await,
                Err(e) => debug!(error = %e, "TLS handshake failed"),
            }
        }
    }

    conn_ctx.cancel();
}

async fn serve_connection<I>(io: I, router: Router, info: ConnectionContext, state: &ServerState)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = router.map_request(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(info.clone());
        request
    });

    let builder = Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), TowerToHyperService::new(service));
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(error = %e, "Connection error");
            }
        }
        _ = state.draining.cancelled() => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                biased;
                _ = state.closed.cancelled() => debug!("Connection aborted by close"),
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!(error = %e, "Connection error during drain");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_exhaustion_is_retried() {
        for errno in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            let err = io::Error::from_raw_os_error(errno);
            assert!(is_transient_accept_error(&err), "{err}");
        }
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::WouldBlock)));
    }

    #[test]
    fn test_listener_failures_are_not_retried() {
        for errno in [libc::EINVAL, libc::EBADF, libc::ENOTSOCK] {
            let err = io::Error::from_raw_os_error(errno);
            assert!(!is_transient_accept_error(&err), "{err}");
        }
    }

    #[test]
    fn test_per_connection_errors() {
        assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_connection_error(&io::Error::from_raw_os_error(libc::EINVAL)));
    }
}
