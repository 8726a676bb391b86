//! The run orchestrator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::context::ShutdownContext;
use crate::error::RunError;
use crate::group::TaskGroup;
use crate::sequencer::{shutdown_sequence, DEFAULT_DRAIN_TIMEOUT};
use crate::server::GracefulServer;
use crate::signal::{notify_context, ShutdownSignal};
use crate::tls::{self, AcmeDriver, AutocertConfig};

/// Tunables for [`run_server_with_options`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Bound on graceful shutdown once draining starts.
    pub drain_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl RunOptions {
    /// Bound graceful shutdown by `drain_timeout` instead of the default.
    pub fn drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

/// Which serving form a run uses. Chosen once, during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeMode {
    Plain,
    Tls,
}

/// Run `server` until SIGTERM, cancellation of `ctx`, or a serve failure,
/// then shut it down gracefully and force-close it.
///
/// With `autocert`, the server is switched to TLS with ACME-managed
/// certificates. Returns `Ok(())` for a clean shutdown, whatever triggered
/// it; otherwise the first failure.
pub async fn run_server<S>(
    ctx: &ShutdownContext,
    server: &mut S,
    autocert: Option<&AutocertConfig>,
) -> Result<(), RunError>
where
    S: GracefulServer + ?Sized,
{
    run_server_with_options(ctx, server, autocert, &RunOptions::default()).await
}

/// [`run_server`] with explicit [`RunOptions`].
pub async fn run_server_with_options<S>(
    ctx: &ShutdownContext,
    server: &mut S,
    autocert: Option<&AutocertConfig>,
    options: &RunOptions,
) -> Result<(), RunError>
where
    S: GracefulServer + ?Sized,
{
    // Setup: every mutation of the server happens here, before any
    // concurrent activity starts.
    let (signal_ctx, _signal_guard) =
        notify_context(ctx, ShutdownSignal::Terminate).map_err(RunError::Signal)?;

    let (mode, acme) = match autocert {
        Some(autocert) => {
            let bootstrap = tls::bootstrap(autocert)?;
            server.set_tls_config(bootstrap.config);
            (ServeMode::Tls, Some(bootstrap.driver))
        }
        None => (ServeMode::Plain, None),
    };

    let group = TaskGroup::new(&signal_ctx).ignoring(RunError::is_server_closed);
    let group_ctx = group.context().clone();

    let conn_ctx = group_ctx.clone();
    server.set_base_context(Arc::new(move |_: SocketAddr| conn_ctx.clone()));

    let server: &S = &*server;
    info!(
        tls = mode == ServeMode::Tls,
        drain_timeout_ms = options.drain_timeout.as_millis() as u64,
        "Starting server"
    );

    tokio::join!(
        group.run("serve", async {
            match mode {
                ServeMode::Plain => server.listen_and_serve().await,
                ServeMode::Tls => server.listen_and_serve_tls().await,
            }
            .map_err(RunError::from)
        }),
        group.run("shutdown", async {
            shutdown_sequence(server, &group_ctx, options.drain_timeout)
                .await
                .map_err(RunError::from)
        }),
        drive_acme(acme, &group_ctx),
    );

    let result = group.into_result();
    match &result {
        Ok(()) => info!("Server stopped"),
        Err(e) => debug!(error = %e, "Server stopped with error"),
    }
    result
}

async fn drive_acme(driver: Option<AcmeDriver>, ctx: &ShutdownContext) {
    if let Some(driver) = driver {
        driver.run(ctx).await;
    }
}
