use crate::sio::cert;
use crate::sio::config::{AcceptHostname, TlsConfig};
use crate::sio::error::{Hint, TlsError};
use crate::sio::info::{NegotiatedParams, SessionInfo};
use crate::sio::transport::{Socket, StallTimer, WRITE_STALL_LIMIT};
use crate::sio::version::TlsVersion;
use crate::sio::{Negotiation, Phase, ReadStatus, Result, SecureSession, StreamSizes};
use openssl::ssl::{self, ErrorCode, ShutdownResult, Ssl, SslContext, SslStream, SslVersion};
use openssl::x509::X509VerifyResult;
use std::net::IpAddr;

/// Client side of an OpenSSL session
pub struct OpensslSession {
    ctx: SslContext,
    config: TlsConfig,
    stream: Option<SslStream<Socket>>,
    phase: Phase,
    hostname: String,
    sizes: Option<StreamSizes>,
    info: Option<SessionInfo>,
    unverified: bool,
}

impl OpensslSession {
    pub(super) fn new(ctx: SslContext, config: TlsConfig) -> Self {
        OpensslSession {
            ctx,
            config,
            stream: None,
            phase: Phase::Created,
            hostname: String::new(),
            sizes: None,
            info: None,
            unverified: false,
        }
    }

    /// Framing parameters, once negotiated
    pub fn stream_sizes(&self) -> Option<StreamSizes> {
        self.sizes
    }

    /// Identities picked from the certificate store by issuer
    pub fn rebind_count(&self) -> usize {
        super::rebind::rebind_count(&self.ctx)
    }

    fn fail(&mut self, err: TlsError) -> TlsError {
        tracing::debug!(error = %err, "OpenSSL session failed");
        self.phase = Phase::Failed;
        self.stream = None;
        self.info = None;
        err
    }

    fn stream_mut(&mut self) -> Result<&mut SslStream<Socket>> {
        self.stream
            .as_mut()
            .ok_or(TlsError::InvalidHandle("session has no socket"))
    }

    fn start(&mut self, socket: Socket, hostname: &str) -> Result<()> {
        let accept = self.config.accept()?;
        let mut ssl = Ssl::new(&self.ctx).map_err(|e| TlsError::protocol(format!("SSL_new: {}", e)))?;
        ssl.set_connect_state();

        // SNI carries DNS names only
        if hostname.parse::<IpAddr>().is_err() && !hostname.is_empty() {
            ssl.set_hostname(hostname)
                .map_err(|e| TlsError::protocol(format!("Cannot set server name: {}", e)))?;
        }

        if let Some(expected) = accept.expected_name(hostname) {
            let param = ssl.param_mut();
            let result = match (&accept, expected.parse::<IpAddr>()) {
                (AcceptHostname::Ip(addr), _) => param.set_ip(*addr),
                (_, Ok(addr)) => param.set_ip(addr),
                (_, Err(_)) => param.set_host(&expected),
            };
            result.map_err(|e| TlsError::config(format!("Cannot verify host name '{}': {}", expected, e)))?;
        }

        let stream = SslStream::new(ssl, socket).map_err(|e| TlsError::protocol(format!("SSL_set_bio: {}", e)))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn drive(&mut self) -> Result<Negotiation> {
        let stream = self.stream_mut()?;
        match stream.do_handshake() {
            Ok(()) => Ok(self.complete()),
            Err(e) if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE => {
                tracing::trace!(code = ?e.code(), "OpenSSL handshake would block");
                Ok(Negotiation::WantMore)
            }
            Err(e) => {
                let verify = stream.ssl().verify_result();
                Err(handshake_error(e, verify))
            }
        }
    }

    fn complete(&mut self) -> Negotiation {
        let Some(stream) = self.stream.as_ref() else {
            return Negotiation::Complete { data_pending: false };
        };
        let ssl = stream.ssl();

        let verify = ssl.verify_result();
        if verify != X509VerifyResult::OK {
            tracing::warn!(
                host = %self.hostname,
                reason = verify.error_string(),
                "host certificate not verified; continuing as configured"
            );
            self.unverified = true;
        }

        let cipher = ssl.current_cipher();
        let description = cipher.map(|c| c.description()).unwrap_or_default();
        let params = NegotiatedParams {
            provider: "OpenSSL",
            protocol: Some(ssl.version_str().to_string()),
            cipher: cipher.map(|c| c.name().to_string()),
            cipher_bits: cipher.and_then(|c| u32::try_from(c.bits().secret).ok()),
            key_exchange: description_field(&description, "Kx"),
        };
        let chain = cert::get_cert_chain(ssl);
        let mut info = SessionInfo::new(&params, &chain);
        info.secure_unverified = self.unverified;

        let version = ssl.version2().and_then(tls_version).unwrap_or(TlsVersion::Tls12);
        let aead = description_field(&description, "Mac").map_or(false, |mac| mac == "AEAD");
        self.sizes = Some(StreamSizes::for_tls(version, aead));
        let data_pending = ssl.pending() > 0;

        self.info = Some(info);
        self.phase = Phase::Negotiated;
        tracing::info!(host = %self.hostname, protocol = ssl.version_str(), "OpenSSL session negotiated");
        Negotiation::Complete { data_pending }
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        let stream = self.stream_mut()?;
        let stall = StallTimer::new(WRITE_STALL_LIMIT);
        loop {
            match stream.ssl_read(buf) {
                Ok(n) => return Ok(ReadStatus::Data(n)),
                Err(e) => match e.code() {
                    ErrorCode::ZERO_RETURN => return Ok(ReadStatus::Eof),
                    // Renegotiation wants to send; wait until it can
                    ErrorCode::WANT_WRITE => stall.wait(&**stream.get_ref())?,
                    ErrorCode::WANT_READ => return Ok(ReadStatus::WouldBlock),
                    ErrorCode::SYSCALL if e.io_error().is_none() => {
                        tracing::debug!("peer went away without close_notify");
                        return Ok(ReadStatus::Eof);
                    }
                    _ => return Err(io_or_protocol(e, "SSL read failed")),
                },
            }
        }
    }

    fn write_inner(&mut self, buf: &[u8]) -> Result<usize> {
        let max_message = self.sizes.map_or(StreamSizes::TLS_MAX_FRAGMENT, |s| s.max_message);
        let stream = self.stream_mut()?;
        let mut stall = StallTimer::new(WRITE_STALL_LIMIT);
        for chunk in buf.chunks(max_message) {
            let mut sent = 0;
            while sent < chunk.len() {
                match stream.ssl_write(&chunk[sent..]) {
                    Ok(n) => {
                        sent += n;
                        stall.progress();
                    }
                    Err(e) if e.code() == ErrorCode::WANT_WRITE || e.code() == ErrorCode::WANT_READ => {
                        stall.wait(&**stream.get_ref())?;
                    }
                    Err(e) => return Err(io_or_protocol(e, "SSL write failed")),
                }
            }
        }
        Ok(buf.len())
    }
}

fn tls_version(version: SslVersion) -> Option<TlsVersion> {
    [
        (SslVersion::SSL3, TlsVersion::Ssl3),
        (SslVersion::TLS1, TlsVersion::Tls10),
        (SslVersion::TLS1_1, TlsVersion::Tls11),
        (SslVersion::TLS1_2, TlsVersion::Tls12),
        (SslVersion::TLS1_3, TlsVersion::Tls13),
    ]
    .into_iter()
    .find_map(|(ssl, tls)| (ssl == version).then_some(tls))
}

/// Value of `key=` in an OpenSSL cipher description line
fn description_field(description: &str, key: &str) -> Option<String> {
    description
        .split_whitespace()
        .filter_map(|field| field.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, value)| value.to_string())
}

fn io_or_protocol(err: ssl::Error, context: &str) -> TlsError {
    match err.into_io_error() {
        Ok(io) => TlsError::Transport(io),
        Err(err) => TlsError::protocol(format!("{}: {}", context, err)),
    }
}

fn handshake_error(err: ssl::Error, verify: X509VerifyResult) -> TlsError {
    let mut message = format!("SSL negotiation failed: {}", err);
    if verify != X509VerifyResult::OK {
        message.push_str(&format!(" (certificate verify failed: {})", verify.error_string()));
    }
    let hint = Hint::classify(&message);
    TlsError::protocol_with_hint(message, hint)
}

impl SecureSession for OpensslSession {
    fn negotiate(&mut self, socket: Socket, hostname: &str) -> Result<Negotiation> {
        self.phase.check_created()?;
        self.hostname = hostname.to_string();
        self.phase = Phase::Handshaking;
        if let Err(e) = self.start(socket, hostname) {
            return Err(self.fail(e));
        }
        tracing::debug!(host = %hostname, "OpenSSL negotiation started");
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
        if let Some(stream) = self.stream.as_mut() {
            match stream.shutdown() {
                Ok(ShutdownResult::Sent) => {
                    // One look for the peer's close_notify
                    let _ = stream.shutdown();
                }
                Ok(ShutdownResult::Received) => {}
                Err(e) => tracing::debug!(error = %e, "close_notify not sent"),
            }
        }
        tracing::debug!(host = %self.hostname, "OpenSSL session closed");
    }

    fn is_negotiated(&self) -> bool {
        self.phase == Phase::Negotiated
    }

    fn secure_unverified(&self) -> bool {
        self.is_negotiated() && self.unverified
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
    fn test_description_fields() {
        let line = "ECDHE-RSA-AES256-GCM-SHA384 TLSv1.2 Kx=ECDH     Au=RSA  Enc=AESGCM(256) Mac=AEAD\n";
        assert_eq!(description_field(line, "Kx").as_deref(), Some("ECDH"));
        assert_eq!(description_field(line, "Mac").as_deref(), Some("AEAD"));
        assert_eq!(description_field(line, "Missing"), None);
    }

    #[test]
    fn test_version_mapping() {
        assert_eq!(tls_version(SslVersion::TLS1_3), Some(TlsVersion::Tls13));
        assert_eq!(tls_version(SslVersion::TLS1), Some(TlsVersion::Tls10));
    }

    #[test]
    fn test_operations_before_negotiation() {
        let ctx = SslContext::builder(openssl::ssl::SslMethod::tls_client()).unwrap().build();
        let mut session = OpensslSession::new(ctx, TlsConfig::default());
        assert!(matches!(session.resume(), Err(TlsError::InvalidHandle(_))));
        assert!(matches!(session.read(&mut [0u8; 4]), Err(TlsError::InvalidHandle(_))));
        assert!(matches!(session.write(b"x"), Err(TlsError::InvalidHandle(_))));
        assert!(session.session_info().is_none());
        assert!(!session.secure_unverified());
    }
}
