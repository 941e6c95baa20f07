//! TLS-terminated accepters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use accepter::net::{load_key_pair, TlsError};
use accepter::{handler_fn, Accepter, AccepterError, Connection, Deadline, TlsConfig};

mod common;

async fn serve_tls_echo(
    certs: &common::TestCerts,
) -> (
    Accepter<impl accepter::Handler>,
    std::net::SocketAddr,
    tokio::task::JoinHandle<accepter::Result<()>>,
) {
    let accepter = Accepter::new(handler_fn(common::echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = tokio::spawn({
        let accepter = accepter.clone();
        let cert = certs.cert_path.clone();
        let key = certs.key_path.clone();
        async move { accepter.serve_tls(listener, cert, key).await }
    });
    (accepter, addr, serving)
}

#[tokio::test]
async fn echoes_decrypted_bytes() {
    let certs = common::generate_certs();
    let (accepter, addr, serving) = serve_tls_echo(&certs).await;

    let connector = common::tls_connector(&certs);
    let stream = common::tls_connect(&connector, addr).await;
    let (mut rd, mut wr) = tokio::io::split(stream);

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let writer = tokio::spawn(async move {
        wr.write_all(&payload).await.unwrap();
        wr
    });
    let mut echoed = vec![0u8; expected.len()];
    rd.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, expected);
    let _wr = writer.await.unwrap();

    accepter
        .shutdown(Deadline::after(Duration::from_secs(2)))
        .await
        .unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn configured_certificate_needs_no_files() {
    let certs = common::generate_certs();
    let pair = load_key_pair(&certs.cert_path, &certs.key_path).await.unwrap();
    let accepter = Accepter::new(handler_fn(common::echo)).with_tls(TlsConfig {
        certificates: vec![Arc::new(pair)],
        ..TlsConfig::default()
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = tokio::spawn({
        let accepter = accepter.clone();
        async move { accepter.serve_tls(listener, "", "").await }
    });

    let connector = common::tls_connector(&certs);
    let mut stream = common::tls_connect(&connector, addr).await;
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    accepter.close().await.unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn missing_certificate_fails_before_serving() {
    let accepter = Accepter::new(handler_fn(common::echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let err = accepter.serve_tls(listener, "", "").await.unwrap_err();
    assert!(matches!(err, AccepterError::Tls(TlsError::MissingCertificate)));
}

#[tokio::test]
async fn unreadable_certificate_fails_before_serving() {
    let accepter = Accepter::new(handler_fn(common::echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let err = accepter
        .serve_tls(listener, "/nonexistent/cert.pem", "/nonexistent/key.pem")
        .await
        .unwrap_err();
    assert!(matches!(err, AccepterError::Tls(TlsError::Io { .. })));

    // Nothing is listening any more.
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn mismatched_key_fails_before_serving() {
    let certs = common::generate_certs();
    let dir = tempfile::tempdir().unwrap();
    let foreign_key = dir.path().join("foreign.pem");
    std::fs::write(
        &foreign_key,
        rcgen::KeyPair::generate().unwrap().serialize_pem(),
    )
    .unwrap();

    let accepter = Accepter::new(handler_fn(common::echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        accepter.serve_tls(listener, &certs.cert_path, &foreign_key),
    )
    .await
    .expect("serve_tls should fail instead of serving")
    .unwrap_err();
    assert!(matches!(err, AccepterError::Tls(TlsError::KeyMismatch(_))));
}

#[tokio::test]
async fn close_during_handshake_skips_handler() {
    let certs = common::generate_certs();
    let calls = Arc::new(AtomicUsize::new(0));
    let accepter = Accepter::new(handler_fn({
        let calls = Arc::clone(&calls);
        move |_cancel: CancellationToken, _conn: Connection| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {}
        }
    }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = tokio::spawn({
        let accepter = accepter.clone();
        let cert = certs.cert_path.clone();
        let key = certs.key_path.clone();
        async move { accepter.serve_tls(listener, cert, key).await }
    });

    // Connect but never send a ClientHello, so the handshake stays pending.
    let mut raw = TcpStream::connect(addr).await.unwrap();
    common::wait_for_active(&accepter, 1).await;

    accepter.close().await.unwrap();
    serving.await.unwrap().unwrap();

    common::wait_for_active(&accepter, 0).await;
    assert!(common::observes_close(&mut raw, Duration::from_secs(2)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_handshake_does_not_leak_registration() {
    let certs = common::generate_certs();
    let (accepter, addr, serving) = serve_tls_echo(&certs).await;

    // Plain-text garbage instead of a ClientHello.
    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    assert!(common::observes_close(&mut raw, Duration::from_secs(2)).await);
    common::wait_for_active(&accepter, 0).await;

    accepter
        .shutdown(Deadline::after(Duration::from_secs(1)))
        .await
        .unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn listen_and_serve_tls_binds_and_serves() {
    let certs = common::generate_certs();
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let accepter = Accepter::new(handler_fn(common::echo));
    let serving = tokio::spawn({
        let accepter = accepter.clone();
        let cert = certs.cert_path.clone();
        let key = certs.key_path.clone();
        async move {
            accepter
                .listen_and_serve_tls("tcp", &addr.to_string(), cert, key)
                .await
        }
    });

    let connector = common::tls_connector(&certs);
    let mut stream = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(tcp) = TcpStream::connect(addr).await {
                let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
                break connector.connect(name, tcp).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    stream.write_all(b"hello tls").await.unwrap();
    let mut buf = [0u8; 9];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello tls");

    accepter
        .shutdown(Deadline::after(Duration::from_secs(2)))
        .await
        .unwrap();
    serving.await.unwrap().unwrap();
}
