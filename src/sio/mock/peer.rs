//! Loop-back server for the mock protocol
//!
//! `MockPeer` plays the server side of a mock session. It answers the
//! handshake, optionally asks for a client certificate, echoes application
//! data and can start a renegotiation or close the session on request.

use super::record::{self, alert, ClientAuth, ContentType, Handshake, Peeked};
use crate::sio::error::TlsError;
use crate::sio::transport::{receive, send_pending, Received, Socket};
use crate::sio::version::TlsVersion;
use crate::sio::{Result, HANDSHAKE_READ_CHUNK};
use bytes::{Buf, BytesMut};

/// Server behavior
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Names the server certificate is valid for
    pub names: Vec<String>,
    /// Protocol version the server answers with
    pub version: TlsVersion,
    pub client_auth: ClientAuth,
    /// Issuers advertised for client certificates
    pub issuers: Vec<String>,
    /// Largest record payload the server sends, at most `record::MAX_FRAGMENT`
    pub max_fragment: u16,
    /// Send application data back to the client
    pub echo: bool,
}

impl PeerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        PeerConfig {
            names: vec![name.into()],
            version: TlsVersion::Tls13,
            client_auth: ClientAuth::None,
            issuers: Vec::new(),
            max_fragment: record::MAX_FRAGMENT as u16,
            echo: true,
        }
    }

    pub fn client_auth(mut self, client_auth: ClientAuth, issuers: &[&str]) -> Self {
        self.client_auth = client_auth;
        self.issuers = issuers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn version(mut self, version: TlsVersion) -> Self {
        self.version = version;
        self
    }

    pub fn max_fragment(mut self, max_fragment: u16) -> Self {
        self.max_fragment = clamp_fragment(max_fragment);
        self
    }
}

fn clamp_fragment(max_fragment: u16) -> u16 {
    max_fragment.clamp(1, record::MAX_FRAGMENT as u16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    AwaitHello,
    AwaitFinished,
    Ready,
    Closed,
    Failed,
}

/// Server end of a mock session
pub struct MockPeer {
    socket: Socket,
    config: PeerConfig,
    state: PeerState,
    rx: BytesMut,
    tx: BytesMut,
    client_cert: Option<String>,
    received: Vec<u8>,
    handshakes: usize,
}

impl std::fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeer")
            .field("state", &self.state)
            .field("handshakes", &self.handshakes)
            .finish_non_exhaustive()
    }
}

impl MockPeer {
    pub fn new(socket: Socket, mut config: PeerConfig) -> Self {
        config.max_fragment = clamp_fragment(config.max_fragment);
        MockPeer {
            socket,
            config,
            state: PeerState::AwaitHello,
            rx: BytesMut::new(),
            tx: BytesMut::new(),
            client_cert: None,
            received: Vec::new(),
            handshakes: 0,
        }
    }

    /// Process everything the client has sent so far
    pub fn poll(&mut self) -> Result<()> {
        loop {
            send_pending(self.socket.as_mut(), &mut self.tx)?;

            match record::peek(&self.rx)? {
                Peeked::Record(rec, used) => {
                    self.rx.advance(used);
                    self.handle(rec.content_type, &rec.payload)?;
                }
                Peeked::Incomplete(needed) => {
                    let want = needed.unwrap_or(HANDSHAKE_READ_CHUNK);
                    match receive(self.socket.as_mut(), &mut self.rx, want)? {
                        Received::Data(_) => continue,
                        Received::WouldBlock => return Ok(()),
                        Received::Closed => {
                            if self.state != PeerState::Failed {
                                self.state = PeerState::Closed;
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn handle(&mut self, content_type: ContentType, payload: &[u8]) -> Result<()> {
        match content_type {
            ContentType::Handshake => self.handle_handshake(Handshake::decode(payload)?),
            ContentType::ApplicationData => {
                if self.state != PeerState::Ready {
                    return Err(TlsError::protocol("mock peer: application data before handshake"));
                }
                self.received.extend_from_slice(payload);
                if self.config.echo && !payload.is_empty() {
                    record::encode(ContentType::ApplicationData, payload, &mut self.tx);
                }
                Ok(())
            }
            ContentType::Alert => {
                if payload.get(1) == Some(&alert::CLOSE_NOTIFY) {
                    if self.state != PeerState::Closed {
                        record::write_alert(alert::WARNING, alert::CLOSE_NOTIFY, &mut self.tx);
                    }
                    self.state = PeerState::Closed;
                } else {
                    self.state = PeerState::Failed;
                }
                Ok(())
            }
        }
    }

    fn handle_handshake(&mut self, message: Handshake) -> Result<()> {
        match (self.state, message) {
            (PeerState::AwaitHello | PeerState::Ready, Handshake::ClientHello { .. }) => {
                Handshake::ServerHello {
                    client_auth: self.config.client_auth,
                    version: self.config.version,
                    max_fragment: self.config.max_fragment,
                    names: self.config.names.clone(),
                    issuers: self.config.issuers.clone(),
                }
                .write_to(&mut self.tx);
                self.state = PeerState::AwaitFinished;
                Ok(())
            }
            (PeerState::AwaitFinished, Handshake::Certificate { name }) => {
                self.client_cert = name;
                Ok(())
            }
            (PeerState::AwaitFinished, Handshake::Finished) => {
                if self.config.client_auth == ClientAuth::Require && self.client_cert.is_none() {
                    record::write_alert(alert::FATAL, alert::BAD_CERTIFICATE, &mut self.tx);
                    self.state = PeerState::Failed;
                    return Ok(());
                }
                Handshake::Finished.write_to(&mut self.tx);
                self.state = PeerState::Ready;
                self.handshakes += 1;
                Ok(())
            }
            (state, message) => Err(TlsError::protocol(format!(
                "mock peer: unexpected {:?} in state {:?}",
                message, state
            ))),
        }
    }

    /// Queue application data for the client
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(usize::from(self.config.max_fragment)) {
            record::encode(ContentType::ApplicationData, chunk, &mut self.tx);
        }
        send_pending(self.socket.as_mut(), &mut self.tx)?;
        Ok(())
    }

    /// Ask the client to run the handshake again
    pub fn request_renegotiation(&mut self) -> Result<()> {
        Handshake::HelloRequest.write_to(&mut self.tx);
        send_pending(self.socket.as_mut(), &mut self.tx)?;
        Ok(())
    }

    /// Send close_notify
    pub fn close(&mut self) -> Result<()> {
        record::write_alert(alert::WARNING, alert::CLOSE_NOTIFY, &mut self.tx);
        self.state = PeerState::Closed;
        send_pending(self.socket.as_mut(), &mut self.tx)?;
        Ok(())
    }

    /// Whether the last handshake completed
    pub fn is_ready(&self) -> bool {
        self.state == PeerState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.state == PeerState::Closed
    }

    /// Whether the peer rejected the client
    pub fn has_failed(&self) -> bool {
        self.state == PeerState::Failed
    }

    /// Client certificate presented in the last handshake
    pub fn client_cert(&self) -> Option<&str> {
        self.client_cert.as_deref()
    }

    /// All application data received so far
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    /// Completed handshakes, renegotiations included
    pub fn handshakes(&self) -> usize {
        self.handshakes
    }

    /// Direct access to the underlying transport
    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }
}
