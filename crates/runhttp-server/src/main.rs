use anyhow::{Context, Result};
use clap::Parser;
use runhttp::{run_server_with_options, HttpServer, ShutdownContext};
use tracing::info;

mod cli;
mod routes;
mod telemetry;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Install the ring crypto provider for rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    telemetry::init().map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("runhttp-server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    cli.log_config();

    let autocert = cli.autocert();
    let options = cli.run_options();
    let mut server = HttpServer::new(cli.addr, routes::router());

    run_server_with_options(&ShutdownContext::new(), &mut server, autocert.as_ref(), &options)
        .await
        .context("Server stopped with an error")?;

    info!("runhttp-server stopped");
    Ok(())
}
