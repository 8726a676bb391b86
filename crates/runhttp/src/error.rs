//! Error types for a server run.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by the accept/serve loop.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// IO error on the listening socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS serving was requested but no TLS configuration was attached.
    #[error("TLS serving requested without a TLS configuration")]
    MissingTlsConfig,

    /// The server stopped because it was shut down or closed.
    ///
    /// This is the expected result of a deliberate shutdown, not a failure.
    #[error("server closed")]
    ServerClosed,
}

/// Errors produced while draining a server.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Connections were still open when the drain deadline passed.
    #[error("graceful shutdown deadline exceeded after {timeout:?}")]
    DeadlineExceeded {
        /// Drain budget that was exhausted
        timeout: Duration,
        /// Connections still open at the deadline, when known
        remaining: Option<usize>,
    },

    /// IO error while shutting down
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while preparing automatic TLS.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The autocert configuration names no hostnames.
    #[error("autocert configuration has no domains")]
    NoDomains,

    /// rustls rejected the configuration
    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// The single outcome of [`run_server`](crate::run_server).
#[derive(Debug, Error)]
pub enum RunError {
    /// The termination signal could not be intercepted.
    #[error("failed to register signal handler: {0}")]
    Signal(#[source] std::io::Error),

    /// TLS bootstrap failed.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The serve loop failed.
    #[error(transparent)]
    Serve(#[from] ServeError),

    /// Graceful shutdown failed or timed out.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

impl RunError {
    /// Whether this is the normal "server closed" condition.
    pub fn is_server_closed(&self) -> bool {
        matches!(self, RunError::Serve(ServeError::ServerClosed))
    }

    /// Whether this is a drain timeout.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(
            self,
            RunError::Shutdown(ShutdownError::DeadlineExceeded { .. })
        )
    }
}
