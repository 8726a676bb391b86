//! Shared cancellation context.
//!
//! A [`ShutdownContext`] is the single source of truth for "should we be
//! stopping?". It is a thin layer over [`CancellationToken`] that also
//! remembers *why* it was cancelled. Cancellation is monotonic: once a
//! context is cancelled it stays cancelled, and the first recorded cause
//! wins.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::signal::ShutdownSignal;

/// Why a [`ShutdownContext`] was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelCause {
    /// Cancelled explicitly, with no more specific cause.
    Cancelled,
    /// A termination signal was received.
    Signal(ShutdownSignal),
    /// A task in the run group finished.
    TaskExited(&'static str),
    /// A task in the run group failed.
    TaskFailed {
        /// Name of the failing task
        task: &'static str,
        /// Rendered error
        error: String,
    },
    /// The signal watcher was released.
    Released,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::Cancelled => write!(f, "cancelled"),
            CancelCause::Signal(signal) => write!(f, "received {signal}"),
            CancelCause::TaskExited(task) => write!(f, "{task} exited"),
            CancelCause::TaskFailed { task, error } => write!(f, "{task} failed: {error}"),
            CancelCause::Released => write!(f, "signal watcher released"),
        }
    }
}

/// A derivable, one-shot stop signal with an optional cause.
#[derive(Clone, Default)]
pub struct ShutdownContext {
    token: CancellationToken,
    cause: Arc<OnceLock<CancelCause>>,
    parent: Option<Arc<ShutdownContext>>,
}

impl ShutdownContext {
    /// Create a root context that is only cancelled explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child context.
    ///
    /// The child is cancelled whenever `self` is; cancelling the child does
    /// not affect `self`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            cause: Arc::new(OnceLock::new()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Cancel with [`CancelCause::Cancelled`].
    pub fn cancel(&self) {
        self.cancel_with(CancelCause::Cancelled);
    }

    /// Cancel, recording `cause` unless the context is already cancelled.
    ///
    /// The first cause wins among calls on this context. A parent cancelled
    /// concurrently with this call may lose to `cause`; the outcome of the
    /// cancellation is the same either way, only the reported cause differs.
    pub fn cancel_with(&self, cause: CancelCause) {
        if self.token.is_cancelled() {
            return;
        }
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    /// Whether the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// The cause of cancellation, or `None` while the context is live.
    ///
    /// A context cancelled through its parent reports the parent's cause.
    pub fn cause(&self) -> Option<CancelCause> {
        if !self.token.is_cancelled() {
            return None;
        }
        if let Some(cause) = self.cause.get() {
            return Some(cause.clone());
        }
        match &self.parent {
            Some(parent) => parent.cause(),
            None => Some(CancelCause::Cancelled),
        }
    }

    /// The underlying token, for interop with code that speaks
    /// [`CancellationToken`].
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl From<CancellationToken> for ShutdownContext {
    fn from(token: CancellationToken) -> Self {
        Self {
            token,
            cause: Arc::new(OnceLock::new()),
            parent: None,
        }
    }
}

impl fmt::Debug for ShutdownContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownContext")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.cause())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_monotonic() {
        let ctx = ShutdownContext::new();
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.cause(), None);

        ctx.cancel_with(CancelCause::TaskExited("serve"));
        ctx.cancel_with(CancelCause::Signal(ShutdownSignal::Terminate));

        assert!(ctx.is_cancelled());
        assert_eq!(ctx.cause(), Some(CancelCause::TaskExited("serve")));
    }

    #[test]
    fn test_child_inherits_parent_cause() {
        let parent = ShutdownContext::new();
        let child = parent.child();

        parent.cancel_with(CancelCause::Signal(ShutdownSignal::Terminate));

        assert!(child.is_cancelled());
        assert_eq!(
            child.cause(),
            Some(CancelCause::Signal(ShutdownSignal::Terminate))
        );

        // Already cancelled through the parent, so this cause is not recorded.
        child.cancel_with(CancelCause::TaskExited("serve"));
        assert_eq!(
            child.cause(),
            Some(CancelCause::Signal(ShutdownSignal::Terminate))
        );
    }

    #[test]
    fn test_concurrent_causes_record_exactly_one() {
        let ctx = ShutdownContext::new();
        let causes = [
            CancelCause::TaskExited("serve"),
            CancelCause::TaskExited("shutdown"),
            CancelCause::Signal(ShutdownSignal::Terminate),
            CancelCause::Released,
        ];

        std::thread::scope(|scope| {
            for cause in &causes {
                let ctx = &ctx;
                scope.spawn(move || ctx.cancel_with(cause.clone()));
            }
        });

        let recorded = ctx.cause().expect("cancelled");
        assert!(causes.contains(&recorded));
        // Later calls never replace it.
        ctx.cancel_with(CancelCause::Cancelled);
        assert_eq!(ctx.cause(), Some(recorded));
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let parent = ShutdownContext::new();
        let child = parent.child();

        child.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_from_token_reports_plain_cancel() {
        let token = CancellationToken::new();
        let ctx = ShutdownContext::from(token.clone());
        token.cancel();
        assert_eq!(ctx.cause(), Some(CancelCause::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let ctx = ShutdownContext::new();
        let child = ctx.child();

        let waiter = tokio::spawn(async move {
            child.cancelled().await;
            child.cause()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();

        let cause = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(cause, Some(CancelCause::Cancelled));
    }
}
