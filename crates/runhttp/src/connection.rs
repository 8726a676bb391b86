//! Per-connection bookkeeping.
//!
//! [`ConnectionTracker`] counts open connections so a graceful shutdown can
//! wait for them to drain. Each accepted connection holds a
//! [`ConnectionGuard`]; dropping the last guard wakes any drain waiter.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::context::ShutdownContext;

/// Context handed to every request on a connection.
///
/// Inserted into request extensions, so axum handlers can take it as
/// `Extension<ConnectionContext>`. `shutdown` is cancelled as soon as the
/// server starts shutting down, well before the connection is closed.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Remote address of the client
    pub peer: SocketAddr,
    /// Local address the connection was accepted on
    pub local: SocketAddr,
    /// Cancelled when shutdown begins or the connection ends
    pub shutdown: ShutdownContext,
}

/// Counts open connections and wakes drain waiters.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    count: AtomicUsize,
    idle: Notify,
}

/// Held for the lifetime of one connection.
pub struct ConnectionGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.inner.count.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl ConnectionTracker {
    /// A tracker with no open connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection.
    pub fn guard(&self) -> ConnectionGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of connections currently open.
    pub fn active(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Completes once no connection is open.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent last drop is not missed.
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}
