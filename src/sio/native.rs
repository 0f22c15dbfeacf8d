//! Platform-native backend (SChannel on Windows, Secure Transport on macOS)
//!
//! Built on `native-tls`, which exposes less of the session than the other
//! providers: the negotiated protocol and cipher are not reported, and a
//! skipped verification cannot be told apart from a passing one, so a
//! session with verification disabled always counts as unverified.
//!
//! Client identities are PKCS#12 bundles (`cert-file` of type DER) or a PEM
//! certificate with a PKCS#8 key.

use super::cert;
use super::config::{AcceptHostname, FileType, TlsConfig};
use super::error::{Hint, InitError, TlsError};
use super::info::{NegotiatedParams, SessionInfo};
use super::options::TlsOptions;
use super::store::CertStore;
use super::transport::{Socket, StallTimer, WRITE_STALL_LIMIT};
use super::version::{parse_min_max, TlsVersion};
use super::{Negotiation, Phase, ReadStatus, Result, SecureIo, SecureSession, StreamSizes};
use native_tls::{Certificate, HandshakeError, Identity, MidHandshakeTlsStream, Protocol, TlsConnector, TlsStream};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

/// Socket wrapper with the `Debug` bound the platform streams want
struct Wire(Socket);

impl fmt::Debug for Wire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Wire")
    }
}

impl Read for Wire {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

fn protocol(version: TlsVersion) -> Option<Protocol> {
    match version {
        TlsVersion::Ssl2 => None,
        TlsVersion::Ssl3 => Some(Protocol::Sslv3),
        TlsVersion::Tls10 => Some(Protocol::Tlsv10),
        TlsVersion::Tls11 => Some(Protocol::Tlsv11),
        TlsVersion::Tls12 => Some(Protocol::Tlsv12),
        TlsVersion::Tls13 => Some(Protocol::Tlsv13),
    }
}

fn native_error(context: &str, err: native_tls::Error) -> TlsError {
    let message = format!("{}: {}", context, err);
    let hint = Hint::classify(&message);
    TlsError::protocol_with_hint(message, hint)
}

fn read(path: &Path, what: &str) -> std::result::Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|e| TlsError::config(format!("Cannot read {} {}: {}", what, path.display(), e)))
}

/// Platform TLS provider
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackend;

impl NativeBackend {
    fn identity(config: &TlsConfig, password: Option<&str>) -> std::result::Result<Option<Identity>, InitError> {
        if let Some(ref name) = config.client_cert {
            let store = config
                .cert_store()
                .map(CertStore::new)
                .ok_or_else(|| TlsError::config("No client certificate store configured"))?;
            let entry = store.find_by_name(name)?;
            let pem = read(&entry.path, "client certificate")?;
            return Identity::from_pkcs8(&pem, &pem)
                .map(Some)
                .map_err(|e| native_error("Cannot load client certificate", e).into());
        }

        let Some(ref cert_file) = config.cert_file else {
            if config.key_file.is_some() {
                return Err(TlsError::config("A key file was given without a certificate file").into());
            }
            return Ok(None);
        };
        let cert = read(cert_file, "certificate file")?;

        match config.cert_file_type {
            FileType::Der => {
                // PKCS#12 bundle; an unencrypted one opens with the empty password
                match password {
                    Some(password) => Identity::from_pkcs12(&cert, password)
                        .map(Some)
                        .map_err(|_| InitError::WrongPassword),
                    None => Identity::from_pkcs12(&cert, "")
                        .map(Some)
                        .map_err(|_| InitError::NeedPassword),
                }
            }
            FileType::Pem => {
                let key = match config.key_file {
                    Some(ref key_file) => read(key_file, "key file")?,
                    None => cert.clone(),
                };
                if String::from_utf8_lossy(&key).contains("ENCRYPTED") {
                    return Err(TlsError::config(
                        "Encrypted PEM keys are not supported by this provider; use a PKCS#12 bundle",
                    )
                    .into());
                }
                Identity::from_pkcs8(&cert, &key)
                    .map(Some)
                    .map_err(|e| native_error("Cannot load client identity", e).into())
            }
        }
    }
}

impl SecureIo for NativeBackend {
    type Session = NativeSession;

    fn provider_name(&self) -> &'static str {
        if cfg!(windows) {
            "SChannel"
        } else {
            "Secure Transport"
        }
    }

    fn options_supported(&self) -> TlsOptions {
        TlsOptions::ACCEPT_HOSTNAME
            | TlsOptions::VERIFY_HOST_CERT
            | TlsOptions::STARTTLS
            | TlsOptions::CA_FILE
            | TlsOptions::CERT_FILE
            | TlsOptions::CERT_FILE_TYPE
            | TlsOptions::KEY_FILE
            | TlsOptions::KEY_PASSWORD
            | TlsOptions::CLIENT_CERT
            | TlsOptions::MIN_PROTOCOL
            | TlsOptions::MAX_PROTOCOL
    }

    fn protocol_support(&self) -> (TlsVersion, TlsVersion) {
        if cfg!(windows) {
            (TlsVersion::Tls10, TlsVersion::Tls13)
        } else {
            (TlsVersion::Tls10, TlsVersion::Tls12)
        }
    }

    fn create(&self, config: &TlsConfig, password: Option<&str>) -> std::result::Result<NativeSession, InitError> {
        config.validate()?;
        let (impl_min, impl_max) = self.protocol_support();
        let range = parse_min_max(
            config.min_protocol.as_deref(),
            config.max_protocol.as_deref(),
            impl_min,
            impl_max,
        )?;
        let password = config.key_password(password)?;
        let accept = config.accept()?;

        let mut builder = TlsConnector::builder();
        builder
            .min_protocol_version(range.min.and_then(protocol))
            .max_protocol_version(range.max.and_then(protocol))
            .danger_accept_invalid_certs(!config.verify_host_cert)
            .danger_accept_invalid_hostnames(accept == AcceptHostname::Any);

        if let Some(ref ca_file) = config.ca_file {
            let pem = read(ca_file, "CA file")?;
            let certs = Certificate::stack_from_pem(&pem).map_err(|e| native_error("Cannot load CA file", e))?;
            for cert in certs {
                builder.add_root_certificate(cert);
            }
        }
        if let Some(identity) = Self::identity(config, password.as_deref())? {
            builder.identity(identity);
        }

        let connector = builder.build().map_err(|e| native_error("Cannot create TLS context", e))?;
        Ok(NativeSession {
            state: State::Created(connector),
            config: config.clone(),
            accept,
            hostname: String::new(),
            info: None,
        })
    }
}

enum State {
    Created(TlsConnector),
    Handshaking(MidHandshakeTlsStream<Wire>),
    Negotiated(TlsStream<Wire>),
    Closed,
}

/// Client side of a platform TLS session
pub struct NativeSession {
    state: State,
    config: TlsConfig,
    accept: AcceptHostname,
    hostname: String,
    info: Option<SessionInfo>,
}

impl NativeSession {
    fn phase(&self) -> Phase {
        match self.state {
            State::Created(_) => Phase::Created,
            State::Handshaking(_) => Phase::Handshaking,
            State::Negotiated(_) => Phase::Negotiated,
            State::Closed => Phase::Failed,
        }
    }

    fn fail(&mut self, err: TlsError) -> TlsError {
        tracing::debug!(error = %err, "native session failed");
        self.state = State::Closed;
        self.info = None;
        err
    }

    fn progress(&mut self, result: std::result::Result<TlsStream<Wire>, HandshakeError<Wire>>) -> Result<Negotiation> {
        match result {
            Ok(stream) => {
                let chain = stream
                    .peer_certificate()
                    .ok()
                    .flatten()
                    .and_then(|c| c.to_der().ok())
                    .map(|der| cert::chain_from_der([der.as_slice()]))
                    .unwrap_or_default();
                let params = NegotiatedParams {
                    provider: "native",
                    ..Default::default()
                };
                let mut info = SessionInfo::new(&params, &chain);
                info.secure_unverified = !self.config.verify_host_cert;
                let data_pending = stream.buffered_read_size().map_or(false, |n| n > 0);
                self.info = Some(info);
                self.state = State::Negotiated(stream);
                tracing::info!(host = %self.hostname, "native session negotiated");
                Ok(Negotiation::Complete { data_pending })
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                self.state = State::Handshaking(mid);
                Ok(Negotiation::WantMore)
            }
            Err(HandshakeError::Failure(e)) => Err(self.fail(native_error("TLS negotiation failed", e))),
        }
    }

    /// Framing parameters; the platform does not report them, so the
    /// TLS maximum is assumed
    pub fn stream_sizes(&self) -> Option<StreamSizes> {
        self.is_negotiated()
            .then(|| StreamSizes::for_tls(TlsVersion::Tls12, false))
    }
}

impl SecureSession for NativeSession {
    fn negotiate(&mut self, socket: Socket, hostname: &str) -> Result<Negotiation> {
        self.phase().check_created()?;
        let State::Created(connector) = std::mem::replace(&mut self.state, State::Closed) else {
            return Err(TlsError::InvalidHandle("session already negotiated"));
        };
        self.hostname = hostname.to_string();
        let domain = self.accept.expected_name(hostname).unwrap_or_else(|| hostname.to_string());
        tracing::debug!(host = %hostname, domain = %domain, "native negotiation started");
        let result = connector.connect(&domain, Wire(socket));
        self.progress(result)
    }

    fn resume(&mut self) -> Result<Negotiation> {
        self.phase().check_handshaking()?;
        let State::Handshaking(mid) = std::mem::replace(&mut self.state, State::Closed) else {
            return Err(TlsError::InvalidHandle("no negotiation pending"));
        };
        self.progress(mid.handshake())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        self.phase().check_negotiated()?;
        let State::Negotiated(ref mut stream) = self.state else {
            return Err(TlsError::InvalidHandle("session not negotiated"));
        };
        loop {
            match stream.read(buf) {
                Ok(0) if !buf.is_empty() => return Ok(ReadStatus::Eof),
                Ok(n) => return Ok(ReadStatus::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::WouldBlock),
                Err(e) => return Err(self.fail(e.into())),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.phase().check_negotiated()?;
        let State::Negotiated(ref mut stream) = self.state else {
            return Err(TlsError::InvalidHandle("session not negotiated"));
        };
        let mut sent = 0;
        let mut stall = StallTimer::new(WRITE_STALL_LIMIT);
        while sent < buf.len() {
            match stream.write(&buf[sent..]) {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting data");
                    return Err(self.fail(err.into()));
                }
                Ok(n) => {
                    sent += n;
                    stall.progress();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Err(e) = stall.wait(&*stream.get_ref().0) {
                        return Err(self.fail(e.into()));
                    }
                }
                Err(e) => return Err(self.fail(e.into())),
            }
        }
        Ok(buf.len())
    }

    fn close(mut self) {
        if let State::Negotiated(ref mut stream) = self.state {
            if let Err(e) = stream.shutdown() {
                tracing::debug!(error = %e, "close_notify not sent");
            }
        }
        tracing::debug!(host = %self.hostname, "native session closed");
    }

    fn is_negotiated(&self) -> bool {
        matches!(self.state, State::Negotiated(_))
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
