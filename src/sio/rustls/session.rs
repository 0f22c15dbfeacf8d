use super::resolve::StoreResolver;
use super::verify::HostPolicyVerifier;
use crate::sio::cert;
use crate::sio::config::TlsConfig;
use crate::sio::error::{Hint, TlsError};
use crate::sio::info::{NegotiatedParams, SessionInfo};
use crate::sio::transport::{Socket, StallTimer, WRITE_STALL_LIMIT};
use crate::sio::version::TlsVersion;
use crate::sio::{Negotiation, Phase, ReadStatus, Result, SecureSession, StreamSizes};
use rustls::pki_types::ServerName;
use rustls::{AlertDescription, CertificateError, ClientConfig, ClientConnection, ProtocolVersion};
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Client side of a rustls session
pub struct RustlsSession {
    client_config: Arc<ClientConfig>,
    config: TlsConfig,
    verifier: Arc<HostPolicyVerifier>,
    resolver: Arc<StoreResolver>,
    conn: Option<ClientConnection>,
    socket: Option<Socket>,
    phase: Phase,
    hostname: String,
    sizes: Option<StreamSizes>,
    plaintext_ready: usize,
    info: Option<SessionInfo>,
}

/// Write queued TLS records, waiting whenever the socket is full
fn flush(conn: &mut ClientConnection, socket: &mut Socket) -> io::Result<()> {
    let mut stall = StallTimer::new(WRITE_STALL_LIMIT);
    while conn.wants_write() {
        match conn.write_tls(socket) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting data")),
            Ok(_) => stall.progress(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => stall.wait(&**socket)?,
            Err(e) => return Err(e),
        }
    }
    socket.flush()
}

fn tls_error(context: &str, err: &rustls::Error) -> TlsError {
    let message = format!("{}: {}", context, err);
    let hint = match err {
        rustls::Error::InvalidCertificate(CertificateError::NotValidForName)
        | rustls::Error::InvalidCertificate(CertificateError::NotValidForNameContext { .. }) => {
            Some(Hint::HostnameMismatch)
        }
        rustls::Error::PeerIncompatible(_) | rustls::Error::AlertReceived(AlertDescription::ProtocolVersion) => {
            Some(Hint::ProtocolVersion)
        }
        _ => Hint::classify(&message),
    };
    TlsError::protocol_with_hint(message, hint)
}

fn tls_version(version: ProtocolVersion) -> Option<TlsVersion> {
    match version {
        ProtocolVersion::SSLv3 => Some(TlsVersion::Ssl3),
        ProtocolVersion::TLSv1_0 => Some(TlsVersion::Tls10),
        ProtocolVersion::TLSv1_1 => Some(TlsVersion::Tls11),
        ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls12),
        ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls13),
        _ => None,
    }
}

/// Key strength implied by an IANA cipher suite name
fn cipher_bits(name: &str) -> Option<u32> {
    if name.contains("AES_256") || name.contains("CHACHA20") {
        Some(256)
    } else if name.contains("AES_128") {
        Some(128)
    } else {
        None
    }
}

impl RustlsSession {
    pub(super) fn new(
        client_config: Arc<ClientConfig>,
        config: TlsConfig,
        verifier: Arc<HostPolicyVerifier>,
        resolver: Arc<StoreResolver>,
    ) -> Self {
        RustlsSession {
            client_config,
            config,
            verifier,
            resolver,
            conn: None,
            socket: None,
            phase: Phase::Created,
            hostname: String::new(),
            sizes: None,
            plaintext_ready: 0,
            info: None,
        }
    }

    /// Client identities chosen from the store during handshakes
    pub fn rebind_count(&self) -> usize {
        self.resolver.rebind_count()
    }

    /// Framing parameters, once negotiated
    pub fn stream_sizes(&self) -> Option<StreamSizes> {
        self.sizes
    }

    fn fail(&mut self, err: TlsError) -> TlsError {
        tracing::debug!(error = %err, "rustls session failed");
        // Let the peer see our alert if rustls queued one
        if let (Some(conn), Some(socket)) = (self.conn.as_mut(), self.socket.as_mut()) {
            let _ = conn.write_tls(socket);
        }
        self.phase = Phase::Failed;
        self.conn = None;
        self.socket = None;
        self.info = None;
        err
    }

    fn parts(&mut self) -> Result<(&mut ClientConnection, &mut Socket)> {
        match (self.conn.as_mut(), self.socket.as_mut()) {
            (Some(conn), Some(socket)) => Ok((conn, socket)),
            _ => Err(TlsError::InvalidHandle("session has no socket")),
        }
    }

    fn drive(&mut self) -> Result<Negotiation> {
        let (conn, socket) = self.parts()?;
        let mut ready = 0;
        loop {
            flush(conn, socket)?;
            if !conn.is_handshaking() {
                break;
            }
            match conn.read_tls(socket) {
                Ok(0) => return Err(TlsError::protocol("rustls: connection closed during handshake")),
                Ok(_) => {
                    let state = conn
                        .process_new_packets()
                        .map_err(|e| tls_error("TLS negotiation failed", &e))?;
                    ready = state.plaintext_bytes_to_read();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Negotiation::WantMore),
                Err(e) => return Err(e.into()),
            }
        }
        self.plaintext_ready = ready;
        Ok(self.complete())
    }

    fn complete(&mut self) -> Negotiation {
        let Some(conn) = self.conn.as_ref() else {
            return Negotiation::Complete { data_pending: false };
        };
        let unverified = self.verifier.was_unverified();

        let version = conn.protocol_version().and_then(tls_version);
        let cipher = conn.negotiated_cipher_suite().map(|suite| {
            suite
                .suite()
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", suite.suite()))
        });
        let params = NegotiatedParams {
            provider: "rustls",
            protocol: version.map(|v| v.as_str().to_string()),
            cipher_bits: cipher.as_deref().and_then(cipher_bits),
            cipher,
            key_exchange: conn
                .negotiated_key_exchange_group()
                .map(|group| format!("{:?}", group.name())),
        };
        let chain = conn
            .peer_certificates()
            .map(|certs| cert::chain_from_der(certs.iter().map(|c| c.as_ref())))
            .unwrap_or_default();
        let mut info = SessionInfo::new(&params, &chain);
        info.secure_unverified = unverified;

        // Every suite rustls offers is AEAD
        self.sizes = Some(StreamSizes::for_tls(version.unwrap_or(TlsVersion::Tls13), true));
        self.info = Some(info);
        self.phase = Phase::Negotiated;
        tracing::info!(host = %self.hostname, protocol = ?version, "rustls session negotiated");
        Negotiation::Complete {
            data_pending: self.plaintext_ready > 0,
        }
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        let (conn, socket) = self.parts()?;
        loop {
            match conn.reader().read(buf) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => return Ok(ReadStatus::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::debug!("peer went away without close_notify");
                    return Ok(ReadStatus::Eof);
                }
                Err(e) => return Err(e.into()),
            }

            // Key updates and similar post-handshake replies
            flush(conn, socket)?;

            match conn.read_tls(socket) {
                Ok(_) => {
                    conn.process_new_packets()
                        .map_err(|e| tls_error("TLS read failed", &e))?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::WouldBlock),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_inner(&mut self, buf: &[u8]) -> Result<usize> {
        let max_message = self.sizes.map_or(StreamSizes::TLS_MAX_FRAGMENT, |s| s.max_message);
        let (conn, socket) = self.parts()?;
        for chunk in buf.chunks(max_message) {
            conn.writer().write_all(chunk)?;
            flush(conn, socket)?;
        }
        Ok(buf.len())
    }
}

impl SecureSession for RustlsSession {
    fn negotiate(&mut self, socket: Socket, hostname: &str) -> Result<Negotiation> {
        self.phase.check_created()?;
        self.hostname = hostname.to_string();
        self.socket = Some(socket);
        self.phase = Phase::Handshaking;

        let name = match ServerName::try_from(hostname.to_string()) {
            Ok(name) => name,
            Err(_) => {
                let err = TlsError::config(format!("Invalid host name '{}'", hostname));
                return Err(self.fail(err));
            }
        };
        match ClientConnection::new(self.client_config.clone(), name) {
            Ok(conn) => self.conn = Some(conn),
            Err(e) => {
                let err = tls_error("Cannot start TLS session", &e);
                return Err(self.fail(err));
            }
        }
        tracing::debug!(host = %hostname, verify = self.config.verify_host_cert, "rustls negotiation started");
        self.drive().map_err(|e| self.fail(e))
    }

    fn resume(&mut self) -> Result<Negotiation> {
        self.phase.check_handshaking()?;
        self.drive().map_err(|e| self.fail(e))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        self.phase.check_negotiated()?;
        if buf.is_empty() {
            return Ok(ReadStatus::Data(0));
        }
        self.read_inner(buf).map_err(|e| self.fail(e))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.phase.check_negotiated()?;
        self.write_inner(buf).map_err(|e| self.fail(e))
    }

    fn close(mut self) {
        if self.phase != Phase::Negotiated {
            return;
        }
        if let Ok((conn, socket)) = self.parts() {
            conn.send_close_notify();
            if let Err(e) = flush(conn, socket) {
                tracing::debug!(error = %e, "close_notify not sent");
            } else {
                // One look for the peer's close_notify
                if conn.read_tls(socket).is_ok() {
                    let _ = conn.process_new_packets();
                }
            }
        }
        tracing::debug!(host = %self.hostname, "rustls session closed");
    }

    fn is_negotiated(&self) -> bool {
        self.phase == Phase::Negotiated
    }

    fn secure_unverified(&self) -> bool {
        self.is_negotiated() && self.info.as_ref().map_or(false, |info| info.secure_unverified)
    }

    fn session_info(&self) -> Option<&str> {
        self.info
            .as_ref()
            .filter(|_| self.is_negotiated())
            .map(|info| info.session.as_str())
    }

    fn server_cert_info(&self) -> Option<&str> {
        self.info
            .as_ref()
            .filter(|_| self.is_negotiated())
            .map(|info| info.server_cert.as_str())
    }

    fn server_subject_names(&self) -> Option<&[String]> {
        self.info
            .as_ref()
            .filter(|_| self.is_negotiated())
            .map(|info| info.subject_names.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_bits() {
        assert_eq!(cipher_bits("TLS13_AES_256_GCM_SHA384"), Some(256));
        assert_eq!(cipher_bits("TLS13_CHACHA20_POLY1305_SHA256"), Some(256));
        assert_eq!(cipher_bits("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"), Some(128));
        assert_eq!(cipher_bits("UNKNOWN"), None);
    }

    #[test]
    fn test_error_hints() {
        let err = rustls::Error::InvalidCertificate(CertificateError::NotValidForName);
        assert_eq!(tls_error("x", &err).hint(), Some(Hint::HostnameMismatch));

        let err = rustls::Error::AlertReceived(AlertDescription::ProtocolVersion);
        assert_eq!(tls_error("x", &err).hint(), Some(Hint::ProtocolVersion));

        let err = rustls::Error::AlertReceived(AlertDescription::InternalError);
        assert_eq!(tls_error("x", &err).hint(), None);
    }

    #[test]
    fn test_version_mapping() {
        assert_eq!(tls_version(ProtocolVersion::TLSv1_3), Some(TlsVersion::Tls13));
        assert_eq!(tls_version(ProtocolVersion::TLSv1_2), Some(TlsVersion::Tls12));
    }
}
