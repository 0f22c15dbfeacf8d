//! rustls backend integration tests
//!
//! A blocking rustls server runs on a loopback listener; the client session
//! is driven over a non-blocking socket. Covers:
//! - Verified handshake and echo
//! - Host name mismatch and its hint
//! - Unverified sessions when verification is switched off
//! - Client identity picked from the store by advertised issuer
//! - Orderly shutdown seen as EOF

mod common;

use common::{negotiate, read_to_eof, read_until, Leaf, Pki};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection, StreamOwned};
use secio::sio::rustls::RustlsBackend;
use secio::sio::{Hint, SecureIo, SecureSession, TlsConfig};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread;

type ServerStream = StreamOwned<ServerConnection, TcpStream>;

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn identity(leaf: &Leaf) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    (
        vec![CertificateDer::from(leaf.cert_der.clone())],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der.clone())),
    )
}

fn server_config(leaf: &Leaf) -> ServerConfig {
    let (chain, key) = identity(leaf);
    ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap()
}

fn spawn_server<F>(config: ServerConfig, handler: F) -> SocketAddr
where
    F: FnOnce(ServerStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Arc::new(config);

    thread::spawn(move || {
        let (tcp, _) = listener.accept().unwrap();
        let conn = ServerConnection::new(config).unwrap();
        handler(StreamOwned::new(conn, tcp));
    });
    addr
}

fn echo(mut stream: ServerStream) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
}

fn trusting(pki: &Pki) -> TlsConfig {
    TlsConfig::builder()
        .ca_file(pki.ca_file())
        .cert_store_dir(pki.dir.path().join("store"))
        .build()
        .unwrap()
}

#[test]
fn test_verified_handshake_and_echo() {
    let pki = Pki::new("Loopback CA");
    let addr = spawn_server(server_config(&pki.leaf(&["localhost"])), echo);

    let mut session = RustlsBackend::new().create(&trusting(&pki), None).unwrap();
    negotiate(&mut session, addr, "localhost").unwrap();

    assert!(session.is_negotiated());
    assert!(!session.secure_unverified());
    let info = session.session_info().unwrap();
    assert!(info.contains("Provider: rustls"), "{}", info);
    assert!(info.contains("TLSv1.3"), "{}", info);
    assert!(session
        .server_subject_names()
        .unwrap()
        .iter()
        .any(|name| name == "localhost"));
    assert_eq!(session.rebind_count(), 0);

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();
    session.write(&payload).unwrap();
    let (echoed, eof) = read_until(&mut session, payload.len());
    assert!(!eof);
    assert_eq!(echoed, payload);
    session.close();
}

#[test]
fn test_hostname_mismatch_hint() {
    let pki = Pki::new("Loopback CA");
    let addr = spawn_server(server_config(&pki.leaf(&["other.example"])), echo);

    let mut session = RustlsBackend::new().create(&trusting(&pki), None).unwrap();
    let err = negotiate(&mut session, addr, "localhost").unwrap_err();
    assert_eq!(err.hint(), Some(Hint::HostnameMismatch), "{}", err);
    assert!(!session.is_negotiated());
}

#[test]
fn test_accept_any_hostname() {
    let pki = Pki::new("Loopback CA");
    let addr = spawn_server(server_config(&pki.leaf(&["other.example"])), echo);

    let config = TlsConfig::builder()
        .ca_file(pki.ca_file())
        .accept_hostname("any")
        .build()
        .unwrap();
    let mut session = RustlsBackend::new().create(&config, None).unwrap();
    negotiate(&mut session, addr, "localhost").unwrap();
    assert!(!session.secure_unverified());
}

#[test]
fn test_unverified_session_is_flagged() {
    let trusted = Pki::new("Trusted CA");
    let unknown = Pki::new("Unknown CA");
    let addr = spawn_server(server_config(&unknown.leaf(&["localhost"])), echo);

    let config = TlsConfig::builder()
        .ca_file(trusted.ca_file())
        .verify_host_cert(false)
        .build()
        .unwrap();
    let mut session = RustlsBackend::new().create(&config, None).unwrap();
    negotiate(&mut session, addr, "localhost").unwrap();
    assert!(session.secure_unverified());

    session.write(b"hello").unwrap();
    assert_eq!(read_until(&mut session, 5).0, b"hello");
}

#[test]
fn test_unknown_issuer_is_refused() {
    let trusted = Pki::new("Trusted CA");
    let unknown = Pki::new("Unknown CA");
    let addr = spawn_server(server_config(&unknown.leaf(&["localhost"])), echo);

    let mut session = RustlsBackend::new().create(&trusting(&trusted), None).unwrap();
    assert!(negotiate(&mut session, addr, "localhost").is_err());
    assert!(!session.secure_unverified());
}

#[test]
fn test_client_certificate_rebound_from_store() {
    let pki = Pki::new("Loopback CA");
    let client_ca = Pki::new("Client CA");
    let other_ca = Pki::new("Other CA");

    let store = pki.dir.path().join("store");
    // Sorted first, but issued by a CA the server does not accept
    other_ca.store_identity(&store, "alice");
    let bob = client_ca.store_identity(&store, "bob");

    let mut roots = RootCertStore::empty();
    roots.add(CertificateDer::from(client_ca.ca_der())).unwrap();
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
        .build()
        .unwrap();
    let (chain, key) = identity(&pki.leaf(&["localhost"]));
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let addr = spawn_server(config, move |mut stream| {
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap_or(0);
        let peer = stream
            .conn
            .peer_certificates()
            .and_then(|certs| certs.first().map(|c| c.as_ref().to_vec()));
        tx.send(peer).unwrap();
        let _ = stream.write_all(&buf[..n]);
    });

    let mut session = RustlsBackend::new().create(&trusting(&pki), None).unwrap();
    negotiate(&mut session, addr, "localhost").unwrap();
    session.write(b"ping").unwrap();
    assert_eq!(read_until(&mut session, 4).0, b"ping");

    assert_eq!(rx.recv().unwrap(), Some(bob.cert_der));
    assert_eq!(session.rebind_count(), 1);
}

#[test]
fn test_close_notify_is_eof() {
    let pki = Pki::new("Loopback CA");
    let addr = spawn_server(server_config(&pki.leaf(&["localhost"])), |mut stream| {
        stream.write_all(b"goodbye").unwrap();
        stream.conn.send_close_notify();
        let _ = stream.flush();
    });

    let mut session = RustlsBackend::new().create(&trusting(&pki), None).unwrap();
    negotiate(&mut session, addr, "localhost").unwrap();
    assert_eq!(read_to_eof(&mut session), b"goodbye");
}
