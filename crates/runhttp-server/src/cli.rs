//! Command line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use runhttp::{AutocertConfig, RunOptions};
use tracing::info;

/// Serve HTTP until SIGTERM, then shut down gracefully.
#[derive(Debug, Parser)]
#[command(name = "runhttp-server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "RUNHTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,

    /// Hostname to obtain a Let's Encrypt certificate for. Enables TLS.
    /// Repeat the flag or separate names with commas.
    #[arg(
        long = "autocert-domain",
        env = "RUNHTTP_AUTOCERT_DOMAIN",
        value_delimiter = ','
    )]
    pub autocert_domains: Vec<String>,

    /// Directory for cached ACME account keys and certificates
    #[arg(
        long,
        env = "RUNHTTP_AUTOCERT_CACHE_DIR",
        default_value = "certs/acme-cache"
    )]
    pub autocert_cache_dir: PathBuf,

    /// Contact email registered with the ACME account
    #[arg(long, env = "RUNHTTP_AUTOCERT_EMAIL")]
    pub autocert_email: Option<String>,

    /// Use the Let's Encrypt staging directory
    #[arg(long, env = "RUNHTTP_AUTOCERT_STAGING")]
    pub autocert_staging: bool,

    /// Seconds to wait for open connections during shutdown
    #[arg(long, env = "RUNHTTP_DRAIN_TIMEOUT_SECS", default_value_t = 3)]
    pub drain_timeout_secs: u64,
}

impl Cli {
    /// Automatic TLS settings, if any domain was given.
    pub fn autocert(&self) -> Option<AutocertConfig> {
        let domains: Vec<&str> = self
            .autocert_domains
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .collect();
        if domains.is_empty() {
            return None;
        }

        let mut autocert = AutocertConfig::with_domains(domains, &self.autocert_cache_dir);
        if let Some(email) = self.autocert_email.as_deref().filter(|e| !e.is_empty()) {
            autocert = autocert.contact(email);
        }
        if self.autocert_staging {
            autocert = autocert.staging();
        }
        Some(autocert)
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions::default().drain_timeout(Duration::from_secs(self.drain_timeout_secs))
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!("Server configuration:");
        info!("  Address: {}", self.addr);
        info!("  Drain timeout: {}s", self.drain_timeout_secs);
        match self.autocert() {
            Some(autocert) => {
                info!("  TLS: autocert for {}", autocert.domains.join(", "));
                info!("  ACME cache: {}", autocert.cache_dir.display());
                info!("  ACME directory: {}", if autocert.production { "production" } else { "staging" });
            }
            None => info!("  TLS: disabled"),
        }
    }
}
