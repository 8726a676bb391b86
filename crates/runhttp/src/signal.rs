//! Termination signal watcher.
//!
//! [`notify_context`] bridges `SIGTERM` into a [`ShutdownContext`]. While a
//! [`SignalGuard`] is alive the signal is intercepted, so a second delivery
//! does not kill the process mid-drain. Guards are reference counted per
//! signal: once the last one is released, delivery falls back to the
//! default disposition (terminate the process) again.

use std::fmt;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use signal_hook::SigId;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::{CancelCause, ShutdownContext};

/// Signals that can trigger a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownSignal {
    /// SIGTERM: graceful stop.
    Terminate,
}

impl ShutdownSignal {
    fn kind(self) -> SignalKind {
        match self {
            ShutdownSignal::Terminate => SignalKind::terminate(),
        }
    }

    fn raw(self) -> c_int {
        match self {
            ShutdownSignal::Terminate => signal_hook::consts::SIGTERM,
        }
    }

    fn watchers(self) -> &'static AtomicUsize {
        match self {
            ShutdownSignal::Terminate => &TERMINATE_WATCHERS,
        }
    }

    fn fallback(self) -> &'static Mutex<Option<SigId>> {
        match self {
            ShutdownSignal::Terminate => &TERMINATE_FALLBACK,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

static TERMINATE_WATCHERS: AtomicUsize = AtomicUsize::new(0);
static TERMINATE_FALLBACK: Mutex<Option<SigId>> = Mutex::new(None);

/// Install the process-wide action that restores default behavior when no
/// watcher is active. Installed once per signal.
fn install_default_fallback(sig: ShutdownSignal) -> std::io::Result<()> {
    let mut installed = sig.fallback().lock().unwrap_or_else(PoisonError::into_inner);
    if installed.is_some() {
        return Ok(());
    }

    let raw = sig.raw();
    let watchers = sig.watchers();
    // SAFETY: the action only performs an atomic load and
    // `emulate_default_handler`, both async-signal-safe.
    let id = unsafe {
        signal_hook::low_level::register(raw, move || {
            if watchers.load(Ordering::SeqCst) == 0 {
                let _ = signal_hook::low_level::emulate_default_handler(raw);
            }
        })
    }?;
    *installed = Some(id);
    Ok(())
}

/// Derive a context that is cancelled when `parent` is cancelled or when
/// `sig` is delivered to the process.
///
/// The returned guard must be kept alive for as long as the signal should
/// be intercepted. Dropping it (or calling [`SignalGuard::release`]) stops
/// the watcher and cancels the derived context.
///
/// Fails only if called outside a Tokio runtime with signal support.
pub fn notify_context(
    parent: &ShutdownContext,
    sig: ShutdownSignal,
) -> std::io::Result<(ShutdownContext, SignalGuard)> {
    install_default_fallback(sig)?;
    let mut stream = signal(sig.kind())?;

    sig.watchers().fetch_add(1, Ordering::SeqCst);

    let ctx = parent.child();
    let stop = CancellationToken::new();

    let watcher_ctx = ctx.clone();
    let watcher_stop = stop.clone();
    let task = tokio::spawn(async move {
        tokio::select! {
            received = stream.recv() => {
                if received.is_some() {
                    info!(signal = %sig, "Received termination signal, initiating graceful shutdown");
                    watcher_ctx.cancel_with(CancelCause::Signal(sig));
                }
            }
            _ = watcher_ctx.cancelled() => {}
            _ = watcher_stop.cancelled() => {}
        }
    });

    debug!(signal = %sig, "Intercepting termination signal");

    let guard = SignalGuard {
        sig,
        ctx: ctx.clone(),
        stop,
        task: Some(task),
    };
    Ok((ctx, guard))
}

/// Keeps a signal intercepted; releases it on drop.
#[must_use = "dropping the guard immediately stops intercepting the signal"]
pub struct SignalGuard {
    sig: ShutdownSignal,
    ctx: ShutdownContext,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SignalGuard {
    /// Stop intercepting the signal. Idempotent.
    pub fn release(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.stop.cancel();
        task.abort();
        self.ctx.cancel_with(CancelCause::Released);
        self.sig.watchers().fetch_sub(1, Ordering::SeqCst);
        debug!(signal = %self.sig, "Stopped intercepting termination signal");
    }

    /// Whether the guard still intercepts its signal.
    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SignalGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalGuard")
            .field("signal", &self.sig)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Delivering real signals lives in tests/signal.rs, where it cannot
    // race with the unit tests in this binary.

    #[tokio::test]
    async fn test_parent_cancel_propagates() {
        let parent = ShutdownContext::new();
        let (ctx, _guard) = notify_context(&parent, ShutdownSignal::Terminate).unwrap();

        parent.cancel();

        ctx.cancelled().await;
        assert_eq!(ctx.cause(), Some(CancelCause::Cancelled));
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_cancels() {
        let parent = ShutdownContext::new();
        let (ctx, mut guard) = notify_context(&parent, ShutdownSignal::Terminate).unwrap();
        assert!(guard.is_active());

        guard.release();
        guard.release();

        assert!(!guard.is_active());
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.cause(), Some(CancelCause::Released));
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_signal_display() {
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
    }
}
