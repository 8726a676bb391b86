//! Automatic TLS through ACME.
//!
//! [`bootstrap`] turns an [`AutocertConfig`] into a rustls server
//! configuration whose certificates are ordered, cached and renewed by
//! `rustls-acme`, plus an [`AcmeDriver`] that has to be polled for the
//! ordering and renewal to happen. Issuance is restricted to the configured
//! hostnames: the [`HostWhitelist`] resolver refuses every other SNI name
//! at the handshake.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_acme::caches::DirCache;
use rustls_acme::{AcmeConfig, AcmeState};
use tracing::{debug, info, warn};

use crate::context::ShutdownContext;
use crate::error::TlsError;

/// ALPN protocol used by TLS-ALPN-01 challenges.
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// How to obtain and persist certificates automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutocertConfig {
    /// Hostnames certificates may be issued for
    pub domains: Vec<String>,
    /// Directory for account and certificate material
    pub cache_dir: PathBuf,
    /// Contact email for ACME account registration
    pub contact: Option<String>,
    /// Use the Let's Encrypt production directory instead of staging
    pub production: bool,
}

impl AutocertConfig {
    /// Certificates for a single `domain`, cached in `cache_dir`.
    pub fn new(domain: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_domains([domain], cache_dir)
    }

    /// Certificates for every name in `domains`, cached in `cache_dir`.
    pub fn with_domains<I, S>(domains: I, cache_dir: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domains: domains.into_iter().map(Into::into).collect(),
            cache_dir: cache_dir.into(),
            contact: None,
            production: true,
        }
    }

    /// Register the ACME account with this contact email.
    pub fn contact(mut self, email: impl Into<String>) -> Self {
        self.contact = Some(email.into());
        self
    }

    /// Use the Let's Encrypt staging directory.
    pub fn staging(mut self) -> Self {
        self.production = false;
        self
    }
}

/// Certificate resolver that only answers for an allowlist of hostnames.
///
/// Handshakes without SNI, or with a name outside the list, get no
/// certificate and fail.
pub struct HostWhitelist {
    hosts: HashSet<String>,
    inner: Arc<dyn ResolvesServerCert>,
}

impl HostWhitelist {
    /// Answer from `inner`, but only for names in `hosts`. Names are
    /// compared case-insensitively, ignoring a trailing dot.
    pub fn new<I, S>(hosts: I, inner: Arc<dyn ResolvesServerCert>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts.into_iter().map(|h| normalize_host(h.as_ref())).collect(),
            inner,
        }
    }

    /// Whether `host` is on the allowlist.
    pub fn allows(&self, host: &str) -> bool {
        self.hosts.contains(&normalize_host(host))
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

impl ResolvesServerCert for HostWhitelist {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) if self.allows(name) => self.inner.resolve(client_hello),
            Some(name) => {
                debug!(sni = name, "Rejecting TLS handshake for host outside whitelist");
                None
            }
            None => {
                debug!("Rejecting TLS handshake without SNI");
                None
            }
        }
    }
}

impl fmt::Debug for HostWhitelist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostWhitelist")
            .field("hosts", &self.hosts)
            .finish_non_exhaustive()
    }
}

/// Build a ring-backed server configuration that takes certificates from
/// `resolver` and negotiates HTTP/2, HTTP/1.1 and ACME challenges.
pub fn server_config(resolver: Arc<dyn ResolvesServerCert>) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![
        b"h2".to_vec(),
        b"http/1.1".to_vec(),
        ACME_TLS_ALPN_NAME.to_vec(),
    ];
    Ok(Arc::new(config))
}

/// Result of [`bootstrap`].
pub struct TlsBootstrap {
    /// Configuration to attach to the server
    pub config: Arc<ServerConfig>,
    /// Event loop that orders and renews certificates
    pub driver: AcmeDriver,
}

/// Prepare automatic TLS for `autocert`.
///
/// No network traffic happens until the returned [`AcmeDriver`] is run.
/// The ACME account is created with the CA's terms of service accepted.
pub fn bootstrap(autocert: &AutocertConfig) -> Result<TlsBootstrap, TlsError> {
    if autocert.domains.is_empty() {
        return Err(TlsError::NoDomains);
    }

    let mut acme_config = AcmeConfig::new(autocert.domains.iter().map(String::as_str))
        .cache(DirCache::new(autocert.cache_dir.clone()))
        .directory_lets_encrypt(autocert.production);

    if let Some(email) = autocert.contact.as_deref() {
        let contact = if email.starts_with("mailto:") {
            email.to_string()
        } else {
            format!("mailto:{email}")
        };
        acme_config = acme_config.contact_push(contact);
    }

    let state = acme_config.state();
    let resolver = Arc::new(HostWhitelist::new(&autocert.domains, state.resolver()));
    let config = server_config(resolver)?;

    info!(
        domains = ?autocert.domains,
        production = autocert.production,
        cache_dir = %autocert.cache_dir.display(),
        "ACME certificate management enabled (TLS-ALPN-01)"
    );

    Ok(TlsBootstrap {
        config,
        driver: AcmeDriver { state },
    })
}

/// Drives certificate ordering and renewal.
pub struct AcmeDriver {
    state: AcmeState<io::Error, io::Error>,
}

impl AcmeDriver {
    /// Process ACME events until `ctx` is cancelled.
    pub async fn run(mut self, ctx: &ShutdownContext) {
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    info!("ACME task stopped (shutdown context cancelled)");
                    return;
                }
                event = self.state.next() => {
                    match event {
                        Some(Ok(ok)) => info!(event = ?ok, "ACME event"),
                        Some(Err(err)) => warn!(error = %err, "ACME event failed"),
                        None => {
                            warn!("ACME stream ended unexpectedly");
                            ctx.cancelled().await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

impl fmt::Debug for AcmeDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeDriver").finish_non_exhaustive()
    }
}
