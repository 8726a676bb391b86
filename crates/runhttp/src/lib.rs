//! # runhttp
//!
//! Run one HTTP server until it is told to stop, then stop it gracefully.
//!
//! ## Overview
//!
//! [`run_server`] composes three activities around one shared
//! [`ShutdownContext`]:
//! 1. A signal watcher turns `SIGTERM` into cancellation of the context
//! 2. The serve loop accepts connections until the server is shut down or
//!    fails; its exit also cancels the context
//! 3. The shutdown sequencer waits for cancellation, drains the server for
//!    at most 3 seconds (configurable), then force-closes it
//!
//! Whichever activity initiates termination, the call returns exactly once:
//! `Ok(())` for a clean stop, otherwise the first real failure. The normal
//! "server closed" result of a deliberate shutdown is never reported.
//!
//! With an [`AutocertConfig`] the server is switched to TLS and certificates
//! are obtained from Let's Encrypt through `rustls-acme`, for the
//! configured hostnames only.
//!
//! ## Example
//!
//! ```ignore
//! use axum::{routing::get, Router};
//! use runhttp::{run_server, HttpServer, ShutdownContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), runhttp::RunError> {
//!     let router = Router::new().route("/", get(|| async { "hello" }));
//!     let mut server = HttpServer::new("0.0.0.0:8080".parse().unwrap(), router);
//!     run_server(&ShutdownContext::new(), &mut server, None).await
//! }
//! ```
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("runhttp requires a Unix platform (Linux or macOS)");

mod connection;
mod context;
mod error;
mod group;
mod run;
mod sequencer;
mod server;
mod signal;
pub mod tls;

pub use connection::{ConnectionContext, ConnectionGuard, ConnectionTracker};
pub use context::{CancelCause, ShutdownContext};
pub use error::{RunError, ServeError, ShutdownError, TlsError};
pub use group::TaskGroup;
pub use run::{run_server, run_server_with_options, RunOptions};
pub use sequencer::{shutdown_sequence, Phase, DEFAULT_DRAIN_TIMEOUT};
pub use server::{BaseContext, GracefulServer, HttpServer, ServerHandle};
pub use signal::{notify_context, ShutdownSignal, SignalGuard};
pub use tls::AutocertConfig;

/// Re-exported so [`GracefulServer`] can be implemented without a direct
/// dependency.
pub use async_trait::async_trait;
