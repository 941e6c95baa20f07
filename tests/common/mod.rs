//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use accepter::{Accepter, Connection, Handler};

/// Serve `accepter` on an ephemeral localhost port.
pub async fn start<H: Handler>(accepter: &Accepter<H>) -> (SocketAddr, JoinHandle<accepter::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepter = accepter.clone();
    let handle = tokio::spawn(async move { accepter.serve(listener).await });
    (addr, handle)
}

/// Wait until exactly `n` connections are registered.
pub async fn wait_for_active<H: Handler>(accepter: &Accepter<H>, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while accepter.active_connections() != n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {} active connections, found {}",
            n,
            accepter.active_connections()
        )
    });
}

/// Echo bytes back until EOF, error, or cancellation.
pub async fn echo(cancel: CancellationToken, mut conn: Connection) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            res = conn.read(&mut buf) => match res {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        if conn.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
}

/// Read until the peer goes away. True if it did so within `within`.
pub async fn observes_close<S: AsyncRead + Unpin>(stream: &mut S, within: Duration) -> bool {
    let mut buf = [0u8; 256];
    tokio::time::timeout(within, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    })
    .await
    .is_ok()
}

pub async fn connect_all(addr: SocketAddr, n: usize) -> Vec<TcpStream> {
    let mut clients = Vec::with_capacity(n);
    for _ in 0..n {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    clients
}

/// Certificate authority plus a `localhost` leaf written to disk.
pub struct TestCerts {
    _dir: TempDir,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca: CertificateDer<'static>,
}

pub fn generate_certs() -> TestCerts {
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "accepter test CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let leaf = CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .signed_by(&leaf_key, &ca, &ca_key)
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, leaf.pem()).unwrap();
    std::fs::write(&key_path, leaf_key.serialize_pem()).unwrap();

    TestCerts {
        _dir: dir,
        cert_path,
        key_path,
        ca: ca.der().clone(),
    }
}

pub fn tls_connector(certs: &TestCerts) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(certs.ca.clone()).unwrap();

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub async fn tls_connect(connector: &TlsConnector, addr: SocketAddr) -> TlsStream<TcpStream> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    connector.connect(name, tcp).await.unwrap()
}
