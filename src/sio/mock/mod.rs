//! Deterministic mock backend
//!
//! Implements the session contract over a tiny TLS-shaped record protocol
//! (see `record`) so that handshake resumption, client-certificate rebinding,
//! renegotiation and the password flow can be exercised without a real TLS
//! provider. `MockPeer` plays the server and `pipe()` connects the two
//! without sockets.
//!
//! Failures are injected with the `SECIO_MOCK_MODE` environment variable or
//! `MockBackend::new()`.

mod peer;
mod pipe;
pub mod record;
mod session;

pub use peer::{MockPeer, PeerConfig};
pub use pipe::{pipe, PipeEnd};
pub use record::ClientAuth;
pub use session::MockSession;

use super::config::TlsConfig;
use super::error::{InitError, TlsError};
use super::options::TlsOptions;
use super::version::{parse_min_max, TlsVersion};
use super::{Negotiation, SecureIo, SecureSession};
use std::cell::Cell;
use std::fmt;
use std::str::FromStr;

/// Environment variable selecting a failure-injection mode
pub const MODE_ENV: &str = "SECIO_MOCK_MODE";

/// Password that decrypts every mock private key
pub const KEY_PASSWORD: &str = "mock-secret";

/// Failure-injection scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    #[default]
    Normal,
    /// The backend claims no options and every negotiation fails
    Unsupported,
    /// `create()` fails outright
    InitFailure,
    /// `create()` wants a password even without a key file
    InitNeedPassword,
    /// The first password offered is rejected, whatever it is
    InitWrongPasswordOnce,
    /// The handshake fails
    NegotiateFailure,
    /// The first negotiation step would block before doing anything
    NegotiatePending,
    /// Every read fails
    ReadFailure,
    /// Every write fails
    WriteFailure,
}

impl MockMode {
    pub const ALL: [MockMode; 9] = [
        MockMode::Normal,
        MockMode::Unsupported,
        MockMode::InitFailure,
        MockMode::InitNeedPassword,
        MockMode::InitWrongPasswordOnce,
        MockMode::NegotiateFailure,
        MockMode::NegotiatePending,
        MockMode::ReadFailure,
        MockMode::WriteFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MockMode::Normal => "normal",
            MockMode::Unsupported => "unsupported",
            MockMode::InitFailure => "init-failure",
            MockMode::InitNeedPassword => "init-need-password",
            MockMode::InitWrongPasswordOnce => "init-wrong-password-once",
            MockMode::NegotiateFailure => "negotiate-failure",
            MockMode::NegotiatePending => "negotiate-pending",
            MockMode::ReadFailure => "read-failure",
            MockMode::WriteFailure => "write-failure",
        }
    }

    /// Mode named by `SECIO_MOCK_MODE`; unset or unknown means normal
    pub fn from_env() -> Self {
        match std::env::var(MODE_ENV) {
            Ok(value) => value.parse().unwrap_or_else(|_| {
                tracing::warn!(mode = %value, "unknown {}; using normal", MODE_ENV);
                MockMode::Normal
            }),
            Err(_) => MockMode::Normal,
        }
    }
}

impl FromStr for MockMode {
    type Err = TlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        MockMode::ALL
            .iter()
            .copied()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s) || mode.as_str().replace('-', "_").eq_ignore_ascii_case(s))
            .ok_or_else(|| TlsError::config(format!("Unknown mock mode '{}'", s)))
    }
}

impl fmt::Display for MockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client certificate in the mock credential store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCredential {
    /// Friendly name
    pub name: String,
    /// Issuer the certificate was signed by
    pub issuer: String,
}

impl MockCredential {
    pub fn new(name: impl Into<String>, issuer: impl Into<String>) -> Self {
        MockCredential {
            name: name.into(),
            issuer: issuer.into(),
        }
    }
}

/// Mock provider
#[derive(Debug)]
pub struct MockBackend {
    mode: MockMode,
    store: Vec<MockCredential>,
    rejected_once: Cell<bool>,
}

impl Default for MockBackend {
    fn default() -> Self {
        MockBackend::new(MockMode::from_env())
    }
}

impl MockBackend {
    pub fn new(mode: MockMode) -> Self {
        MockBackend {
            mode,
            store: Vec::new(),
            rejected_once: Cell::new(false),
        }
    }

    /// Certificates available for lookup by name or issuer
    pub fn with_store(mut self, store: Vec<MockCredential>) -> Self {
        self.store = store;
        self
    }

    pub fn mode(&self) -> MockMode {
        self.mode
    }

    fn check_password(&self, config: &TlsConfig, password: Option<&str>) -> Result<(), InitError> {
        let encrypted_key = config.key_file.is_some()
            || matches!(
                self.mode,
                MockMode::InitNeedPassword | MockMode::InitWrongPasswordOnce
            );
        if !encrypted_key {
            return Ok(());
        }

        let password = match config.key_password(password)? {
            Some(password) => password,
            None => return Err(InitError::NeedPassword),
        };

        if self.mode == MockMode::InitWrongPasswordOnce && !self.rejected_once.replace(true) {
            tracing::debug!("mock: rejecting first password");
            return Err(InitError::WrongPassword);
        }
        if password != KEY_PASSWORD {
            return Err(InitError::WrongPassword);
        }
        Ok(())
    }

    fn credential(&self, config: &TlsConfig) -> Result<Option<MockCredential>, TlsError> {
        if let Some(ref name) = config.client_cert {
            return self
                .store
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name))
                .cloned()
                .map(Some)
                .ok_or_else(|| {
                    TlsError::config(format!("Client certificate '{}' not found in store", name))
                });
        }
        Ok(config.cert_file.as_ref().map(|path| {
            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            MockCredential::new(name, "")
        }))
    }
}

impl SecureIo for MockBackend {
    type Session = MockSession;

    fn provider_name(&self) -> &'static str {
        "mock"
    }

    fn options_supported(&self) -> TlsOptions {
        if self.mode == MockMode::Unsupported {
            return TlsOptions::empty();
        }
        TlsOptions::ACCEPT_HOSTNAME
            | TlsOptions::VERIFY_HOST_CERT
            | TlsOptions::STARTTLS
            | TlsOptions::CERT_FILE
            | TlsOptions::KEY_FILE
            | TlsOptions::KEY_PASSWORD
            | TlsOptions::CLIENT_CERT
            | TlsOptions::MIN_PROTOCOL
            | TlsOptions::MAX_PROTOCOL
    }

    fn protocol_support(&self) -> (TlsVersion, TlsVersion) {
        (TlsVersion::Tls10, TlsVersion::Tls13)
    }

    fn create(&self, config: &TlsConfig, password: Option<&str>) -> Result<MockSession, InitError> {
        if self.mode == MockMode::InitFailure {
            return Err(TlsError::protocol("mock: credential initialization failed").into());
        }

        let (impl_min, impl_max) = self.protocol_support();
        let range = parse_min_max(
            config.min_protocol.as_deref(),
            config.max_protocol.as_deref(),
            impl_min,
            impl_max,
        )?;
        self.check_password(config, password)?;
        let credential = self.credential(config)?;

        tracing::debug!(mode = %self.mode, credential = ?credential.as_ref().map(|c| &c.name), "mock session created");
        Ok(MockSession::new(
            self.mode,
            config.clone(),
            range,
            credential,
            self.store.clone(),
        ))
    }
}

/// Create a session, connect it to a fresh `MockPeer` over a pipe and run
/// the handshake to completion
pub fn connect(
    backend: &MockBackend,
    config: &TlsConfig,
    peer: PeerConfig,
    hostname: &str,
) -> super::Result<(MockSession, MockPeer)> {
    let mut session = backend.create(config, None).map_err(|e| match e {
        InitError::Failed(e) => e,
        other => TlsError::config(other.to_string()),
    })?;
    let (client, server) = pipe();
    let mut peer = MockPeer::new(Box::new(server), peer);

    let mut status = session.negotiate(Box::new(client), hostname)?;
    // Every round trip advances the handshake by one flight
    for _ in 0..MAX_ROUND_TRIPS {
        if let Negotiation::Complete { .. } = status {
            return Ok((session, peer));
        }
        peer.poll()?;
        status = session.resume()?;
    }
    Err(TlsError::protocol("mock: handshake did not complete"))
}

const MAX_ROUND_TRIPS: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_names() {
        for mode in MockMode::ALL {
            assert_eq!(mode.as_str().parse::<MockMode>().unwrap(), mode);
        }
        assert_eq!(
            "INIT_WRONG_PASSWORD_ONCE".parse::<MockMode>().unwrap(),
            MockMode::InitWrongPasswordOnce
        );
        assert!("sometimes".parse::<MockMode>().is_err());
    }

    #[test]
    fn test_unsupported_has_no_options() {
        assert!(MockBackend::new(MockMode::Unsupported)
            .options_supported()
            .is_empty());
        assert!(!MockBackend::new(MockMode::Normal)
            .options_supported()
            .is_empty());
    }

    #[test]
    fn test_password_outcomes() {
        let backend = MockBackend::new(MockMode::Normal);
        let config = TlsConfig::builder()
            .key_file("client.key", crate::sio::FileType::Pem)
            .build()
            .unwrap();

        assert!(matches!(
            backend.create(&config, None),
            Err(InitError::NeedPassword)
        ));
        assert!(matches!(
            backend.create(&config, Some("nope")),
            Err(InitError::WrongPassword)
        ));
        assert!(backend.create(&config, Some(KEY_PASSWORD)).is_ok());

        // No key, no password needed
        assert!(backend.create(&TlsConfig::default(), None).is_ok());
    }

    #[test]
    fn test_wrong_password_once() {
        let backend = MockBackend::new(MockMode::InitWrongPasswordOnce);
        let config = TlsConfig::default();
        assert!(matches!(
            backend.create(&config, None),
            Err(InitError::NeedPassword)
        ));
        assert!(matches!(
            backend.create(&config, Some(KEY_PASSWORD)),
            Err(InitError::WrongPassword)
        ));
        assert!(backend.create(&config, Some(KEY_PASSWORD)).is_ok());
    }

    #[test]
    fn test_init_failure_and_bad_range() {
        let backend = MockBackend::new(MockMode::InitFailure);
        assert!(matches!(
            backend.create(&TlsConfig::default(), None),
            Err(InitError::Failed(TlsError::Protocol { .. }))
        ));

        let backend = MockBackend::new(MockMode::Normal);
        let config = TlsConfig::builder()
            .protocol_range(Some("TLS1_3"), Some("TLS1_2"))
            .build()
            .unwrap();
        assert!(matches!(
            backend.create(&config, None),
            Err(InitError::Failed(TlsError::Configuration(_)))
        ));
    }

    #[test]
    fn test_client_cert_lookup_by_name() {
        let backend = MockBackend::new(MockMode::Normal)
            .with_store(vec![MockCredential::new("alice", "Mock CA")]);
        let config = TlsConfig::builder().client_cert("ALICE").build().unwrap();
        assert!(backend.create(&config, None).is_ok());

        let config = TlsConfig::builder().client_cert("bob").build().unwrap();
        assert!(backend.create(&config, None).is_err());
    }
}
