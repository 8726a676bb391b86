//! Shutdown sequencer: Waiting → Draining → Closed.
//!
//! Waits for the shared context, gives the server a bounded graceful
//! shutdown measured from a fresh deadline, then force-closes it. The force
//! close runs from a drop guard so it happens exactly once on every exit
//! path, including timeout, error, panic and the future being dropped.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::ShutdownContext;
use crate::error::ShutdownError;
use crate::server::GracefulServer;

/// Default bound on graceful shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Where a shutdown sequence currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the shared context to be cancelled.
    Waiting,
    /// Graceful shutdown in progress.
    Draining,
    /// Server force-closed. Terminal.
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Waiting => write!(f, "waiting"),
            Phase::Draining => write!(f, "draining"),
            Phase::Closed => write!(f, "closed"),
        }
    }
}

/// Force-closes the server when dropped.
struct ForceClose<'a, S: GracefulServer + ?Sized> {
    server: &'a S,
}

impl<S: GracefulServer + ?Sized> Drop for ForceClose<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.server.close() {
            debug!(error = %e, "Ignoring error from force close");
        }
        debug!(phase = %Phase::Closed, "Shutdown sequence finished");
    }
}

/// Run one shutdown sequence against `server`.
///
/// Returns the graceful shutdown's result; a drain that outlives
/// `drain_timeout` yields [`ShutdownError::DeadlineExceeded`].
pub async fn shutdown_sequence<S>(
    server: &S,
    ctx: &ShutdownContext,
    drain_timeout: Duration,
) -> Result<(), ShutdownError>
where
    S: GracefulServer + ?Sized,
{
    let _close = ForceClose { server };

    debug!(phase = %Phase::Waiting, "Shutdown sequence armed");
    ctx.cancelled().await;

    // The shared context is already done, so it cannot bound the drain.
    let deadline = Instant::now() + drain_timeout;
    info!(
        phase = %Phase::Draining,
        cause = %ctx.cause().map(|c| c.to_string()).unwrap_or_default(),
        timeout_ms = drain_timeout.as_millis() as u64,
        "Shutting down server"
    );

    match tokio::time::timeout_at(deadline, server.shutdown(deadline)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!(error = %e, "Graceful shutdown failed");
            Err(e)
        }
        Err(_) => {
            warn!(
                timeout_ms = drain_timeout.as_millis() as u64,
                "Graceful shutdown did not return before the deadline"
            );
            Err(ShutdownError::DeadlineExceeded {
                timeout: drain_timeout,
                remaining: None,
            })
        }
    }
}
