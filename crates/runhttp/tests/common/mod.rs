//! Test utilities for driving server runs.
//!
//! Provides a scriptable [`MockServer`], a raw HTTP/1.1 client, and
//! self-signed TLS material.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rcgen::generate_simple_self_signed;
use runhttp::{async_trait, BaseContext, GracefulServer, ServeError, ShutdownError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize a test subscriber once; honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How the mock's serve loop behaves.
#[derive(Debug, Clone, Copy)]
pub enum ServeBehavior {
    /// Serve until shutdown or close, then report "server closed".
    UntilStopped,
    /// Fail straight away as if the address were taken.
    FailToBind,
    /// Stop on its own after a while, reporting "server closed".
    ExitAfter(Duration),
}

/// How the mock's graceful shutdown behaves.
#[derive(Debug, Clone, Copy)]
pub enum ShutdownBehavior {
    /// Finish immediately.
    Immediate,
    /// Never finish.
    Hang,
    /// Fail with an IO error.
    Fail,
    /// Panic.
    Panic,
}

/// Call counters, shared so they survive the server being moved or lost
/// to a panic.
#[derive(Debug, Default)]
pub struct Calls {
    pub plain_serves: AtomicUsize,
    pub tls_serves: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Calls {
    pub fn plain_serves(&self) -> usize {
        self.plain_serves.load(Ordering::SeqCst)
    }

    pub fn tls_serves(&self) -> usize {
        self.tls_serves.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// A [`GracefulServer`] that does no networking.
pub struct MockServer {
    serve: ServeBehavior,
    shutdown: ShutdownBehavior,
    stopped: CancellationToken,
    pub calls: Arc<Calls>,
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
    pub base_context: Option<BaseContext>,
}

impl MockServer {
    pub fn new(serve: ServeBehavior, shutdown: ShutdownBehavior) -> Self {
        Self {
            serve,
            shutdown,
            stopped: CancellationToken::new(),
            calls: Arc::new(Calls::default()),
            tls_config: None,
            base_context: None,
        }
    }

    async fn serve(&self) -> Result<(), ServeError> {
        match self.serve {
            ServeBehavior::UntilStopped => {
                self.stopped.cancelled().await;
                Err(ServeError::ServerClosed)
            }
            ServeBehavior::FailToBind => Err(ServeError::Bind {
                addr: "127.0.0.1:8080".parse().unwrap(),
                source: io::Error::from(io::ErrorKind::AddrInUse),
            }),
            ServeBehavior::ExitAfter(after) => {
                tokio::select! {
                    _ = self.stopped.cancelled() => {}
                    _ = tokio::time::sleep(after) => {}
                }
                Err(ServeError::ServerClosed)
            }
        }
    }
}

#[async_trait]
impl GracefulServer for MockServer {
    fn set_tls_config(&mut self, config: Arc<rustls::ServerConfig>) {
        self.tls_config = Some(config);
    }

    fn set_base_context(&mut self, base: BaseContext) {
        self.base_context = Some(base);
    }

    async fn listen_and_serve(&self) -> Result<(), ServeError> {
        self.calls.plain_serves.fetch_add(1, Ordering::SeqCst);
        self.serve().await
    }

    async fn listen_and_serve_tls(&self) -> Result<(), ServeError> {
        self.calls.tls_serves.fetch_add(1, Ordering::SeqCst);
        if self.tls_config.is_none() {
            return Err(ServeError::MissingTlsConfig);
        }
        self.serve().await
    }

    async fn shutdown(&self, _deadline: Instant) -> Result<(), ShutdownError> {
        self.calls.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.stopped.cancel();
        match self.shutdown {
            ShutdownBehavior::Immediate => Ok(()),
            ShutdownBehavior::Hang => std::future::pending().await,
            ShutdownBehavior::Fail => Err(ShutdownError::Io(io::Error::new(
                io::ErrorKind::Other,
                "listener refused to close",
            ))),
            ShutdownBehavior::Panic => panic!("shutdown exploded"),
        }
    }

    fn close(&self) -> io::Result<()> {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        self.stopped.cancel();
        Ok(())
    }
}

/// Send a request over `stream` and read the whole response.
pub async fn http_request<S>(mut stream: S, path: &str) -> io::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

/// Plain HTTP/1.1 GET.
pub async fn http_get(addr: SocketAddr, path: &str) -> io::Result<String> {
    let stream = TcpStream::connect(addr).await?;
    http_request(stream, path).await
}

/// Body of a raw HTTP/1.1 response.
pub fn body(response: &str) -> &str {
    response.split("\r\n\r\n").nth(1).unwrap_or("")
}

/// Always answers with the same certificate.
#[derive(Debug)]
pub struct FixedCert(pub Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Self-signed certificate for `names`.
pub fn self_signed(names: &[&str]) -> (CertificateDer<'static>, Arc<CertifiedKey>) {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let cert = generate_simple_self_signed(names).expect("Failed to generate certificate");
    let cert_der = cert.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    let key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .expect("Failed to load generated key");
    (cert_der.clone(), Arc::new(CertifiedKey::new(vec![cert_der], key)))
}

/// Connector trusting only `root`.
pub fn tls_connector(root: CertificateDer<'static>) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(root).expect("Failed to add root certificate");
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("Failed to select protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// HTTPS GET presenting `sni`.
pub async fn https_get(
    addr: SocketAddr,
    connector: &TlsConnector,
    sni: &str,
    path: &str,
) -> io::Result<String> {
    let stream = TcpStream::connect(addr).await?;
    let name = ServerName::try_from(sni.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let stream = connector.connect(name, stream).await?;
    http_request(stream, path).await
}
