//! Shared fixtures for the network-backed session tests
#![allow(dead_code)]

use rcgen::{BasicConstraints, CertificateParams, CertifiedKey, DnType, IsCa, KeyPair};
use secio::sio::{Negotiation, ReadStatus, SecureSession, TlsError};
use std::fs;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const DEADLINE: Duration = Duration::from_secs(10);
const BACKOFF: Duration = Duration::from_millis(5);

/// A leaf certificate and its key
pub struct Leaf {
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    pub key_pem: String,
    pub key_der: Vec<u8>,
}

/// A throwaway CA with a scratch directory for the files it issues
pub struct Pki {
    pub dir: TempDir,
    ca: CertifiedKey,
}

impl Pki {
    pub fn new(ca_name: &str) -> Self {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, ca_name);
        let cert = params.self_signed(&key_pair).unwrap();
        Pki {
            dir: tempfile::tempdir().unwrap(),
            ca: CertifiedKey { cert, key_pair },
        }
    }

    pub fn ca_der(&self) -> Vec<u8> {
        self.ca.cert.der().to_vec()
    }

    /// Write the CA certificate and return its path
    pub fn ca_file(&self) -> PathBuf {
        let path = self.dir.path().join("ca.pem");
        fs::write(&path, self.ca.cert.pem()).unwrap();
        path
    }

    /// Issue a leaf valid for `names`
    pub fn leaf(&self, names: &[&str]) -> Leaf {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, names.first().copied().unwrap_or("leaf"));
        let cert = params.signed_by(&key, &self.ca.cert, &self.ca.key_pair).unwrap();
        Leaf {
            cert_pem: cert.pem(),
            cert_der: cert.der().to_vec(),
            key_pem: key.serialize_pem(),
            key_der: key.serialize_der(),
        }
    }

    /// Issue a client identity and store it as `<dir>/<name>.pem`
    pub fn store_identity(&self, dir: &std::path::Path, name: &str) -> Leaf {
        let leaf = self.leaf(&[&format!("{}.client", name)]);
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(format!("{}.pem", name)), format!("{}{}", leaf.cert_pem, leaf.key_pem)).unwrap();
        leaf
    }

    /// Write a leaf's certificate and key as separate PEM files
    pub fn write_leaf(&self, leaf: &Leaf, name: &str) -> (PathBuf, PathBuf) {
        let cert = self.dir.path().join(format!("{}.crt", name));
        let key = self.dir.path().join(format!("{}.key", name));
        fs::write(&cert, &leaf.cert_pem).unwrap();
        fs::write(&key, &leaf.key_pem).unwrap();
        (cert, key)
    }
}

/// Non-blocking client socket to `addr`
pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nodelay(true).unwrap();
    stream.set_nonblocking(true).unwrap();
    stream
}

/// Run a handshake to completion, backing off while it wants more input
pub fn negotiate<S: SecureSession>(session: &mut S, addr: SocketAddr, host: &str) -> Result<Negotiation, TlsError> {
    let deadline = Instant::now() + DEADLINE;
    let mut status = session.negotiate(Box::new(connect(addr)), host)?;
    while status == Negotiation::WantMore {
        assert!(Instant::now() < deadline, "handshake timed out");
        thread::sleep(BACKOFF);
        status = session.resume()?;
    }
    Ok(status)
}

/// Read until `want` bytes arrived or the peer closed
pub fn read_until<S: SecureSession>(session: &mut S, want: usize) -> (Vec<u8>, bool) {
    let deadline = Instant::now() + DEADLINE;
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    while out.len() < want {
        assert!(Instant::now() < deadline, "read timed out");
        match session.read(&mut buf).unwrap() {
            ReadStatus::Data(n) => out.extend_from_slice(&buf[..n]),
            ReadStatus::WouldBlock => thread::sleep(BACKOFF),
            ReadStatus::Eof => return (out, true),
        }
    }
    (out, false)
}

/// Read until the peer closes
pub fn read_to_eof<S: SecureSession>(session: &mut S) -> Vec<u8> {
    let (data, eof) = read_until(session, usize::MAX);
    assert!(eof);
    data
}
