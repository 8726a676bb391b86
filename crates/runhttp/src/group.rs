//! Structured task group with first-error-wins semantics.
//!
//! Members are futures polled inside the caller's task, so nothing outlives
//! the group: waiting on the group means every member has finished. Any
//! member that ends cancels the group context, which is how siblings learn
//! they should unwind.

use std::fmt::Display;
use std::future::Future;
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::context::{CancelCause, ShutdownContext};

/// A set of concurrently polled tasks sharing one cancellation context.
pub struct TaskGroup<E> {
    ctx: ShutdownContext,
    first_error: OnceLock<E>,
    ignore: fn(&E) -> bool,
}

impl<E: Display> TaskGroup<E> {
    /// Create a group whose context is derived from `parent`.
    pub fn new(parent: &ShutdownContext) -> Self {
        Self {
            ctx: parent.child(),
            first_error: OnceLock::new(),
            ignore: |_| false,
        }
    }

    /// Treat errors matching `ignore` as a normal exit.
    ///
    /// Ignored errors still cancel the group context but are never
    /// reported by [`TaskGroup::into_result`].
    pub fn ignoring(mut self, ignore: fn(&E) -> bool) -> Self {
        self.ignore = ignore;
        self
    }

    /// The group context; cancelled as soon as any member ends.
    pub fn context(&self) -> &ShutdownContext {
        &self.ctx
    }

    /// Run one member to completion.
    ///
    /// Combine the returned futures with `tokio::join!` (or
    /// `futures::future::join_all`) to run members concurrently.
    pub async fn run<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>>,
    {
        match task.await {
            Ok(()) => {
                debug!(task = name, "Task finished");
                self.ctx.cancel_with(CancelCause::TaskExited(name));
            }
            Err(err) if (self.ignore)(&err) => {
                debug!(task = name, reason = %err, "Task finished");
                self.ctx.cancel_with(CancelCause::TaskExited(name));
            }
            Err(err) => {
                warn!(task = name, error = %err, "Task failed");
                self.ctx.cancel_with(CancelCause::TaskFailed {
                    task: name,
                    error: err.to_string(),
                });
                if let Err(later) = self.first_error.set(err) {
                    debug!(task = name, error = %later, "Dropping error after first failure");
                }
            }
        }
    }

    /// The first reported error, if any member failed.
    pub fn into_result(self) -> Result<(), E> {
        match self.first_error.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
