use super::record::{self, alert, ClientAuth, ContentType, Handshake, Peeked, Record};
use super::{MockCredential, MockMode};
use crate::sio::config::TlsConfig;
use crate::sio::error::{Hint, TlsError};
use crate::sio::info::{NegotiatedParams, SessionInfo};
use crate::sio::transport::{receive, send_all, send_pending, Received, Socket};
use crate::sio::version::{ProtocolRange, TlsVersion};
use crate::sio::{Negotiation, Phase, ReadStatus, Result, SecureSession, StreamSizes, HANDSHAKE_READ_CHUNK};
use bytes::{Buf, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flight {
    /// ClientHello not sent yet
    Start,
    AwaitServerHello,
    AwaitFinished,
    Done,
}

/// What the client did with one handshake record
enum Step {
    /// Record handled; move past it
    Consumed,
    /// Credentials changed; look at the same record again
    Retry,
}

/// Client side of a mock session
pub struct MockSession {
    mode: MockMode,
    config: TlsConfig,
    range: ProtocolRange,
    credential: Option<MockCredential>,
    store: Vec<MockCredential>,
    socket: Option<Socket>,
    phase: Phase,
    flight: Flight,
    hostname: String,
    pending_once: bool,
    rebinds: usize,
    total_rebinds: usize,
    renegotiations: usize,
    sizes: Option<StreamSizes>,
    rx: BytesMut,
    plain: BytesMut,
    scratch: BytesMut,
    tx: BytesMut,
    info: Option<SessionInfo>,
    unverified: bool,
}

impl std::fmt::Debug for MockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSession")
            .field("mode", &self.mode)
            .field("phase", &self.phase)
            .field("flight", &self.flight)
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

impl MockSession {
    pub(super) fn new(
        mode: MockMode,
        config: TlsConfig,
        range: ProtocolRange,
        credential: Option<MockCredential>,
        store: Vec<MockCredential>,
    ) -> Self {
        MockSession {
            mode,
            config,
            range,
            credential,
            store,
            socket: None,
            phase: Phase::Created,
            flight: Flight::Start,
            hostname: String::new(),
            pending_once: mode == MockMode::NegotiatePending,
            rebinds: 0,
            total_rebinds: 0,
            renegotiations: 0,
            sizes: None,
            rx: BytesMut::new(),
            plain: BytesMut::new(),
            scratch: BytesMut::new(),
            tx: BytesMut::new(),
            info: None,
            unverified: false,
        }
    }

    /// Credential rebinds performed over the life of the session
    pub fn rebind_count(&self) -> usize {
        self.total_rebinds
    }

    /// Renegotiations serviced inside `read()`
    pub fn renegotiations(&self) -> usize {
        self.renegotiations
    }

    /// Framing parameters, once negotiated
    pub fn stream_sizes(&self) -> Option<StreamSizes> {
        self.sizes
    }

    /// Name of the bound client certificate
    pub fn credential_name(&self) -> Option<&str> {
        self.credential.as_ref().map(|c| c.name.as_str())
    }

    /// Mark the session dead and release the socket and buffers
    fn fail(&mut self, err: TlsError) -> TlsError {
        tracing::debug!(error = %err, "mock session failed");
        self.phase = Phase::Failed;
        self.socket = None;
        self.rx = BytesMut::new();
        self.plain = BytesMut::new();
        self.tx = BytesMut::new();
        self.info = None;
        err
    }

    fn start_handshake(&mut self) {
        Handshake::ClientHello {
            hostname: self.hostname.clone(),
        }
        .write_to(&mut self.tx);
        self.flight = Flight::AwaitServerHello;
        self.rebinds = 0;
    }

    /// Run the handshake as far as the socket allows
    fn drive(&mut self) -> Result<Negotiation> {
        loop {
            let Self { socket, tx, .. } = self;
            let socket = socket
                .as_mut()
                .ok_or(TlsError::InvalidHandle("session has no socket"))?;
            if !send_pending(socket.as_mut(), tx)? {
                return Ok(Negotiation::WantMore);
            }

            if self.flight == Flight::Done {
                return Ok(self.complete());
            }

            match record::peek(&self.rx)? {
                Peeked::Record(rec, used) => match self.handle_handshake_record(&rec)? {
                    Step::Consumed => self.rx.advance(used),
                    Step::Retry => continue,
                },
                Peeked::Incomplete(shortfall) => {
                    let want = shortfall.unwrap_or(HANDSHAKE_READ_CHUNK);
                    let Self { socket, rx, .. } = self;
                    let socket = socket
                        .as_mut()
                        .ok_or(TlsError::InvalidHandle("session has no socket"))?;
                    match receive(socket.as_mut(), rx, want)? {
                        Received::Data(n) => {
                            tracing::trace!(bytes = n, wanted = want, "mock handshake input");
                        }
                        Received::WouldBlock => return Ok(Negotiation::WantMore),
                        Received::Closed => {
                            return Err(TlsError::protocol("mock: connection closed during handshake"))
                        }
                    }
                }
            }
        }
    }

    fn handle_handshake_record(&mut self, rec: &Record) -> Result<Step> {
        match rec.content_type {
            ContentType::Handshake => {}
            ContentType::Alert => {
                let description = rec.payload.get(1).copied().unwrap_or(alert::HANDSHAKE_FAILURE);
                let message = if description == alert::CLOSE_NOTIFY {
                    "mock: connection closed during handshake".to_string()
                } else {
                    format!("mock: received fatal alert: {}", alert::describe(description))
                };
                let hint = (description == alert::PROTOCOL_VERSION).then_some(Hint::ProtocolVersion);
                return Err(TlsError::protocol_with_hint(message, hint));
            }
            ContentType::ApplicationData => {
                if self.phase == Phase::Negotiated {
                    // Data sent before the peer saw our renegotiation hello
                    self.plain.extend_from_slice(&rec.payload);
                    return Ok(Step::Consumed);
                }
                return Err(TlsError::protocol("mock: application data during handshake"));
            }
        }

        match (self.flight, Handshake::decode(&rec.payload)?) {
            (_, Handshake::HelloRequest) => {
                if self.flight == Flight::Done {
                    self.start_handshake();
                }
                Ok(Step::Consumed)
            }
            (
                Flight::AwaitServerHello,
                Handshake::ServerHello {
                    client_auth,
                    version,
                    max_fragment,
                    names,
                    issuers,
                },
            ) => {
                if !self.range.allows(version) {
                    return Err(TlsError::protocol_with_hint(
                        format!("mock: unsupported protocol version {}", version.as_str()),
                        Some(Hint::ProtocolVersion),
                    ));
                }

                if client_auth != ClientAuth::None && self.credential.is_none() && self.rebinds == 0 {
                    self.rebinds += 1;
                    if let Some(found) = self.find_credential(&issuers) {
                        tracing::debug!(credential = %found.name, "client certificate requested; rebinding");
                        self.credential = Some(found);
                        self.total_rebinds += 1;
                        return Ok(Step::Retry);
                    }
                    tracing::debug!("client certificate requested; none matches the advertised issuers");
                }

                self.check_names(&names)?;

                if client_auth != ClientAuth::None {
                    Handshake::Certificate {
                        name: self.credential.as_ref().map(|c| c.name.clone()),
                    }
                    .write_to(&mut self.tx);
                }
                Handshake::Finished.write_to(&mut self.tx);

                let max_message = usize::from(max_fragment).clamp(1, record::MAX_FRAGMENT);
                self.sizes = Some(StreamSizes {
                    header: record::HEADER_LEN,
                    trailer: record::TRAILER_LEN,
                    max_message,
                });
                self.info = Some(self.describe(version, names));
                self.flight = Flight::AwaitFinished;
                Ok(Step::Consumed)
            }
            (Flight::AwaitFinished, Handshake::Finished) => {
                self.flight = Flight::Done;
                Ok(Step::Consumed)
            }
            (flight, message) => Err(TlsError::protocol(format!(
                "mock: unexpected handshake message {:?} while in {:?}",
                message, flight
            ))),
        }
    }

    fn find_credential(&self, issuers: &[String]) -> Option<MockCredential> {
        self.store
            .iter()
            .find(|c| issuers.iter().any(|issuer| issuer == &c.issuer))
            .cloned()
    }

    fn check_names(&mut self, names: &[String]) -> Result<()> {
        let expected = match self.config.accept()?.expected_name(&self.hostname) {
            Some(expected) => expected,
            None => return Ok(()),
        };
        if names.iter().any(|name| name_matches(name, &expected)) {
            return Ok(());
        }
        if self.config.verify_host_cert {
            return Err(TlsError::protocol_with_hint(
                format!("mock: certificate verify failed: hostname mismatch ({})", expected),
                Some(Hint::HostnameMismatch),
            ));
        }
        tracing::warn!(host = %expected, "host certificate does not match; continuing unverified");
        self.unverified = true;
        Ok(())
    }

    fn describe(&self, version: TlsVersion, names: Vec<String>) -> SessionInfo {
        let params = NegotiatedParams {
            provider: "mock",
            protocol: Some(version.as_str().to_string()),
            cipher: Some("MOCK_NULL_SUM16".to_string()),
            cipher_bits: Some(0),
            key_exchange: Some("none".to_string()),
        };
        let mut info = SessionInfo::new(&params, &[]);
        info.server_cert = match names.first() {
            Some(name) => format!("Host certificate:\n Subject: CN={}\n Issuer: CN=Mock CA\n", name),
            None => "Host certificate:\n Subject: <undef>\n Issuer: CN=Mock CA\n".to_string(),
        };
        let mut unique: Vec<String> = Vec::new();
        for name in names {
            if !unique.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                unique.push(name);
            }
        }
        info.subject_names = unique;
        info
    }

    fn complete(&mut self) -> Negotiation {
        let first = self.phase != Phase::Negotiated;
        self.phase = Phase::Negotiated;
        if let Some(ref mut info) = self.info {
            info.secure_unverified = self.unverified;
        }

        if first {
            if let Some(sizes) = self.sizes {
                // Room for one whole record, now that its size is known
                let wanted = sizes.max_record();
                if self.rx.capacity() < wanted {
                    self.rx.reserve(wanted - self.rx.len());
                }
                self.scratch = BytesMut::with_capacity(wanted);
                tracing::debug!(record = wanted, "mock buffers sized");
            }
            tracing::info!(host = %self.hostname, "mock session negotiated");
        }

        let data_pending = !self.plain.is_empty()
            || matches!(record::peek(&self.rx), Ok(Peeked::Record(ref r, _)) if r.content_type == ContentType::ApplicationData);
        Negotiation::Complete { data_pending }
    }

    fn copy_plain(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.plain.len());
        buf[..n].copy_from_slice(&self.plain[..n]);
        self.plain.advance(n);
        n
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        loop {
            // Output left over from a renegotiation step
            let Self { socket, tx, .. } = self;
            if let Some(socket) = socket.as_mut() {
                send_pending(socket.as_mut(), tx)?;
            }

            match record::peek(&self.rx)? {
                Peeked::Record(rec, used) => {
                    if rec.content_type == ContentType::Handshake || self.flight != Flight::Done {
                        if let Step::Consumed = self.handle_handshake_record(&rec)? {
                            self.rx.advance(used);
                        }
                        let finished = matches!(Handshake::decode(&rec.payload), Ok(Handshake::Finished));
                        if finished && self.flight == Flight::Done {
                            self.renegotiations += 1;
                            self.complete();
                            tracing::debug!("mock renegotiation complete");
                        }
                        if !self.plain.is_empty() {
                            return Ok(ReadStatus::Data(self.copy_plain(buf)));
                        }
                        continue;
                    }

                    self.rx.advance(used);
                    match rec.content_type {
                        ContentType::ApplicationData => {
                            self.plain.extend_from_slice(&rec.payload);
                            if !self.plain.is_empty() {
                                return Ok(ReadStatus::Data(self.copy_plain(buf)));
                            }
                        }
                        ContentType::Alert => {
                            if rec.payload.get(1) == Some(&alert::CLOSE_NOTIFY) {
                                return Ok(ReadStatus::Eof);
                            }
                            let description = rec.payload.get(1).copied().unwrap_or(0);
                            return Err(TlsError::protocol(format!(
                                "mock: received fatal alert: {}",
                                alert::describe(description)
                            )));
                        }
                        ContentType::Handshake => {}
                    }
                }
                Peeked::Incomplete(shortfall) => {
                    let want = shortfall.unwrap_or_else(|| {
                        self.sizes.map_or(HANDSHAKE_READ_CHUNK, |s| s.max_record())
                    });
                    let Self { socket, rx, .. } = self;
                    let socket = socket
                        .as_mut()
                        .ok_or(TlsError::InvalidHandle("session has no socket"))?;
                    match receive(socket.as_mut(), rx, want)? {
                        Received::Data(_) => continue,
                        Received::WouldBlock => return Ok(ReadStatus::WouldBlock),
                        Received::Closed => {
                            tracing::debug!("mock peer went away without close_notify");
                            return Ok(ReadStatus::Eof);
                        }
                    }
                }
            }
        }
    }
}

fn name_matches(pattern: &str, host: &str) -> bool {
    if pattern.eq_ignore_ascii_case(host) {
        return true;
    }
    match (pattern.strip_prefix("*."), host.split_once('.')) {
        (Some(suffix), Some((_, rest))) => suffix.eq_ignore_ascii_case(rest),
        _ => false,
    }
}

impl SecureSession for MockSession {
    fn negotiate(&mut self, socket: Socket, hostname: &str) -> Result<Negotiation> {
        self.phase.check_created()?;
        self.socket = Some(socket);
        self.hostname = hostname.to_string();
        self.phase = Phase::Handshaking;

        if self.mode == MockMode::Unsupported {
            return Err(self.fail(TlsError::protocol("mock: TLS is not supported by this provider")));
        }
        if self.mode == MockMode::NegotiateFailure {
            return Err(self.fail(TlsError::protocol("mock: negotiation failed")));
        }

        tracing::debug!(host = %hostname, "mock negotiation started");
        self.start_handshake();
        if self.pending_once {
            self.pending_once = false;
            return Ok(Negotiation::WantMore);
        }
        self.drive().map_err(|e| self.fail(e))
    }

    fn resume(&mut self) -> Result<Negotiation> {
        self.phase.check_handshaking()?;
        self.drive().map_err(|e| self.fail(e))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        self.phase.check_negotiated()?;
        if self.mode == MockMode::ReadFailure {
            return Err(self.fail(TlsError::protocol("mock: decrypt failed")));
        }
        if !self.plain.is_empty() {
            return Ok(ReadStatus::Data(self.copy_plain(buf)));
        }
        self.read_inner(buf).map_err(|e| self.fail(e))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.phase.check_negotiated()?;
        if self.mode == MockMode::WriteFailure {
            return Err(self.fail(TlsError::protocol("mock: encrypt failed")));
        }
        let max_message = self.sizes.map_or(record::MAX_FRAGMENT, |s| s.max_message);

        for chunk in buf.chunks(max_message) {
            self.scratch.clear();
            record::encode(ContentType::ApplicationData, chunk, &mut self.scratch);
            let Self { socket, scratch, .. } = self;
            let result = match socket.as_mut() {
                Some(socket) => send_all(socket.as_mut(), scratch).map_err(TlsError::from),
                None => Err(TlsError::InvalidHandle("session has no socket")),
            };
            if let Err(e) = result {
                return Err(self.fail(e));
            }
        }
        Ok(buf.len())
    }

    fn close(mut self) {
        if self.phase != Phase::Negotiated {
            return;
        }
        let Self { socket, scratch, rx, .. } = &mut self;
        if let Some(socket) = socket.as_mut() {
            scratch.clear();
            record::write_alert(alert::WARNING, alert::CLOSE_NOTIFY, scratch);
            if let Err(e) = send_pending(socket.as_mut(), scratch) {
                tracing::debug!(error = %e, "close_notify not sent");
                return;
            }
            // One look for the peer's close_notify; it may already be gone
            let _ = receive(socket.as_mut(), rx, HANDSHAKE_READ_CHUNK);
        }
        tracing::debug!(host = %self.hostname, "mock session closed");
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
    fn test_wildcard_names() {
        assert!(name_matches("host.example", "HOST.example"));
        assert!(name_matches("*.example", "host.example"));
        assert!(!name_matches("*.example", "a.b.example"));
        assert!(!name_matches("other.example", "host.example"));
    }
}
