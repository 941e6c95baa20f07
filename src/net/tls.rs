//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Load a PEM certificate chain and private key from disk
//! - Decide whether configured certificate material can be used as-is
//! - Wrap a plain [`Listener`] so accepted connections speak TLS
//!
//! # Design Decisions
//! - The handshake runs on the connection's worker, never on the accept loop
//! - Key material is signed with the ring provider; no process-wide
//!   crypto provider has to be installed

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::net::listener::{BoxedStream, Incoming, Listener, NetAddr};

/// Errors raised while preparing TLS material.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("certificate and key files are required when no certificate is configured")]
    MissingCertificate,

    #[error("private key in {} does not match the certificate", .0.display())]
    KeyMismatch(PathBuf),

    #[error("unsupported private key: {0}")]
    InvalidKey(#[source] rustls::Error),

    #[error("invalid TLS configuration: {0}")]
    Rustls(#[source] rustls::Error),
}

/// Base TLS settings for an accepter.
///
/// Either `certificates` or `cert_resolver` must carry certificate
/// material, unless a certificate/key file pair is supplied when serving.
#[derive(Clone, Default)]
pub struct TlsConfig {
    /// Static certificates; the first one is served.
    pub certificates: Vec<Arc<CertifiedKey>>,
    /// Picks a certificate per handshake. Takes precedence over `certificates`.
    pub cert_resolver: Option<Arc<dyn ResolvesServerCert>>,
    /// ALPN protocols offered to clients, in preference order.
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("certificates", &self.certificates.len())
            .field("cert_resolver", &self.cert_resolver.is_some())
            .field("alpn_protocols", &self.alpn_protocols)
            .finish()
    }
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the configuration already carries certificate material.
    pub fn has_certificate(&self) -> bool {
        !self.certificates.is_empty() || self.cert_resolver.is_some()
    }

    /// Apply an optional certificate/key file pair.
    ///
    /// An empty path counts as "not supplied". The configuration is returned
    /// unchanged when it already has certificate material and neither path
    /// is supplied; otherwise the pair is loaded and becomes the sole static
    /// certificate.
    pub async fn prepare(
        mut self,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> Result<Self, TlsError> {
        let cert_file = cert_file.as_ref();
        let key_file = key_file.as_ref();
        let files_supplied =
            !cert_file.as_os_str().is_empty() || !key_file.as_os_str().is_empty();

        if self.has_certificate() && !files_supplied {
            return Ok(self);
        }
        if !files_supplied {
            return Err(TlsError::MissingCertificate);
        }

        let key_pair = load_key_pair(cert_file, key_file).await?;
        self.certificates = vec![Arc::new(key_pair)];
        Ok(self)
    }

    /// Build the rustls server configuration.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let resolver: Arc<dyn ResolvesServerCert> = match &self.cert_resolver {
            Some(resolver) => Arc::clone(resolver),
            None if !self.certificates.is_empty() => {
                Arc::new(StaticCertResolver(self.certificates.clone()))
            }
            None => return Err(TlsError::MissingCertificate),
        };

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(TlsError::Rustls)?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = self.alpn_protocols.clone();

        Ok(Arc::new(config))
    }
}

/// Serves the first of a fixed set of certificates.
#[derive(Debug)]
struct StaticCertResolver(Vec<Arc<CertifiedKey>>);

impl ResolvesServerCert for StaticCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.0.first().cloned()
    }
}

/// Load a certificate chain and private key from PEM files.
///
/// If the certificate is signed by a certificate authority, `cert_path`
/// should hold the leaf certificate followed by any intermediates.
pub async fn load_key_pair(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, TlsError> {
    let cert_pem = read_file(cert_path).await?;
    let key_pem = read_file(key_path).await?;

    let chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if chain.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|source| TlsError::Io {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

    let signing_key =
        rustls::crypto::ring::sign::any_supported_type(&key).map_err(TlsError::InvalidKey)?;

    let chain_len = chain.len();
    let key_pair = CertifiedKey::new(chain, signing_key);
    match key_pair.keys_match() {
        // Signing keys that cannot report their public half are taken on trust.
        Ok(()) | Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => {}
        Err(rustls::Error::InconsistentKeys(_)) => {
            return Err(TlsError::KeyMismatch(key_path.to_path_buf()))
        }
        Err(e) => return Err(TlsError::InvalidKey(e)),
    }

    tracing::debug!(
        cert = %cert_path.display(),
        chain_len,
        "Loaded TLS key pair"
    );

    Ok(key_pair)
}

async fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    tokio::fs::read(path).await.map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Listener whose connections are TLS-terminated.
pub struct TlsListener<L> {
    inner: L,
    acceptor: TlsAcceptor,
}

impl<L: Listener> TlsListener<L> {
    pub fn new(inner: L, config: Arc<ServerConfig>) -> Self {
        Self {
            inner,
            acceptor: TlsAcceptor::from(config),
        }
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }
}

impl<L> fmt::Debug for TlsListener<L>
where
    L: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsListener").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl<L: Listener> Listener for TlsListener<L> {
    async fn accept(&mut self) -> io::Result<Incoming> {
        let incoming = self.inner.accept().await?;
        let acceptor = self.acceptor.clone();
        Ok(incoming.and_then(move |stream| async move {
            let tls = acceptor.accept(stream).await?;
            Ok(Box::new(tls) as BoxedStream)
        }))
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        self.inner.local_addr()
    }

    fn close(self) -> io::Result<()> {
        self.inner.close()
    }

    fn is_temporary(&self, err: &io::Error) -> bool {
        self.inner.is_temporary(err)
    }
}
