//! TLS configuration checks and accept-time TLS behaviour.

#![cfg(feature = "tls")]

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use tcp_server::config::ConfigError;
use tcp_server::net::{Stream, TlsOptions, TokioReactor};
use tcp_server::server::{HandlerError, ServerOptions, TcpServer};

mod common;

use common::{fixture, recording_handler, wait_until, RecordingReactor};

const WAIT: Duration = Duration::from_secs(2);

fn tls_options() -> ServerOptions {
    ServerOptions {
        tls: Some(TlsOptions::new(fixture("cert.pem")).with_key(fixture("key.pem"))),
        ..ServerOptions::default()
    }
}

fn construct(tls: TlsOptions) -> Result<(), ConfigError> {
    let reactor = Rc::new(RecordingReactor::default());
    let (_seen, handler) = recording_handler();
    let options = ServerOptions {
        tls: Some(tls),
        ..ServerOptions::default()
    };
    let result = TcpServer::new(handler, options, reactor.clone()).map(|_| ());
    assert!(reactor.added.borrow().is_empty());
    result
}

#[test]
fn nonexistent_certificate_fails_construction() {
    let err = construct(TlsOptions::new("/nonexistent/server.crt")).unwrap_err();
    assert!(matches!(err, ConfigError::CertificateNotFound(_)));
}

#[test]
fn missing_certificate_option_fails_construction() {
    let tls = TlsOptions {
        cert_path: None,
        key_path: Some(fixture("key.pem")),
    };
    assert!(matches!(construct(tls).unwrap_err(), ConfigError::MissingCertificate));
}

#[test]
fn nonexistent_key_fails_construction() {
    let tls = TlsOptions::new(fixture("cert.pem")).with_key("/nonexistent/server.key");
    assert!(matches!(construct(tls).unwrap_err(), ConfigError::KeyNotFound(_)));
}

#[test]
fn combined_pem_constructs() {
    construct(TlsOptions::new(fixture("combined.pem"))).unwrap();
}

/// Connect and immediately reset, so the server accepts an already dead socket.
fn connect_and_reset(addr: SocketAddr) {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    socket.set_linger(Some(Duration::ZERO)).unwrap();
    socket.connect(&addr.into()).unwrap();
    drop(socket);
}

#[tokio::test]
async fn reset_peer_is_closed_without_invoking_handler() {
    let reactor = Rc::new(TokioReactor::new());
    let (seen, handler) = recording_handler();
    let mut server = TcpServer::new(handler, tls_options(), reactor.clone()).unwrap();
    server.listen(0, "127.0.0.1").unwrap();
    let addr = server.local_addrs()[0];

    // The accept loop is not running yet, so the reset lands before accept.
    connect_and_reset(addr);
    std::thread::sleep(Duration::from_millis(50));

    reactor
        .run_until(async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(seen.borrow().is_empty());

            // The acceptor keeps serving afterwards.
            let _live = TcpStream::connect(addr).await.unwrap();
            assert!(wait_until(|| seen.borrow().len() == 1, WAIT).await);
        })
        .await;
}

#[tokio::test]
async fn handshake_is_deferred_to_the_stream() {
    let reactor = Rc::new(TokioReactor::new());
    let outcome: Rc<RefCell<Option<bool>>> = Rc::default();
    let sink = Rc::clone(&outcome);
    let handler = move |mut stream: Stream, _peer: SocketAddr| -> Result<(), HandlerError> {
        assert!(stream.is_tls());
        let sink = Rc::clone(&sink);
        tokio::task::spawn_local(async move {
            let ok = stream.handshake().await.is_ok();
            *sink.borrow_mut() = Some(ok);
        });
        Ok(())
    };
    let mut server = TcpServer::new(handler, tls_options(), reactor.clone()).unwrap();
    server.listen(0, "127.0.0.1").unwrap();
    let addr = server.local_addrs()[0];

    reactor
        .run_until(async {
            // A plaintext client still reaches the handler; the handshake fails later.
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"not a client hello\r\n\r\n").await.unwrap();
            assert!(wait_until(|| outcome.borrow().is_some(), WAIT).await);
        })
        .await;

    assert_eq!(*outcome.borrow(), Some(false));
}

fn client_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    let mut reader = std::io::BufReader::new(std::fs::File::open(fixture("ca.pem")).unwrap());
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.unwrap()).unwrap();
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

#[tokio::test]
async fn tls_client_round_trips_through_handler() {
    let reactor = Rc::new(TokioReactor::new());
    let served = Rc::new(Cell::new(0usize));
    let counter = Rc::clone(&served);
    let handler = move |mut stream: Stream, _peer: SocketAddr| -> Result<(), HandlerError> {
        let counter = Rc::clone(&counter);
        tokio::task::spawn_local(async move {
            let line = stream.read_until(b"\n").await.unwrap();
            stream.write_all(&line).await.unwrap();
            stream.flush().await.unwrap();
            counter.set(counter.get() + 1);
        });
        Ok(())
    };
    let mut server = TcpServer::new(handler, tls_options(), reactor.clone()).unwrap();
    server.listen(0, "127.0.0.1").unwrap();
    let addr = server.local_addrs()[0];

    reactor
        .run_until(async {
            let connector = TlsConnector::from(client_config());
            let tcp = TcpStream::connect(addr).await.unwrap();
            let domain = ServerName::try_from("localhost").unwrap();
            let mut tls = connector.connect(domain, tcp).await.unwrap();

            tls.write_all(b"ping\n").await.unwrap();
            let mut reader = BufReader::new(tls);
            let mut reply = String::new();
            reader.read_line(&mut reply).await.unwrap();
            assert_eq!(reply, "ping\n");
            assert!(wait_until(|| served.get() == 1, WAIT).await);
        })
        .await;
}
