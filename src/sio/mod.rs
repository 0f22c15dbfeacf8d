//! Secure I/O session layer
//!
//! This module defines one small contract for encrypted, socket-like
//! sessions and implements it independently against several TLS providers.
//!
//! # Architecture
//!
//! 1. `TlsConfig` is an immutable snapshot of TLS settings for one attempt
//! 2. A backend (`SecureIo`) turns the configuration into a credentialed
//!    session with `create()`
//! 3. The session (`SecureSession`) drives a resumable handshake over a
//!    non-blocking `Transport`, then reads and writes application data
//! 4. The `Coordinator` retries `create()` across password prompts
//! 5. The `OptionRegistry` exposes only the settings the active backend
//!    supports as command-line switches and configuration keys
//!
//! Exactly one backend is bound per build through `ActiveBackend`: the
//! platform-native provider on Windows and macOS, OpenSSL elsewhere, or
//! rustls everywhere with the `rustls-backend` feature.
//!
//! All I/O is non-blocking and single-threaded. `negotiate()`/`resume()`
//! return `Negotiation::WantMore` and `read()` returns
//! `ReadStatus::WouldBlock` instead of blocking; the caller re-invokes them
//! once its event loop sees the socket become readable.
//!
//! # Examples
//!
//! ```no_run
//! use secio::sio::{ActiveBackend, Negotiation, ReadStatus, SecureIo, SecureSession, TlsConfig};
//! use std::net::TcpStream;
//!
//! let backend = ActiveBackend::default();
//! let config = TlsConfig::builder().build().unwrap();
//! let mut session = backend.create(&config, None).unwrap();
//!
//! let stream = TcpStream::connect("example.com:992").unwrap();
//! stream.set_nonblocking(true).unwrap();
//!
//! let mut status = session.negotiate(Box::new(stream), "example.com").unwrap();
//! while status == Negotiation::WantMore {
//!     // wait for the socket to become readable, then:
//!     status = session.resume().unwrap();
//! }
//! println!("{}", session.session_info().unwrap_or_default());
//!
//! session.write(b"hello").unwrap();
//! let mut buf = [0u8; 1024];
//! if let ReadStatus::Data(n) = session.read(&mut buf).unwrap() {
//!     println!("{:?}", &buf[..n]);
//! }
//! session.close();
//! ```

pub mod cert;
pub mod config;
pub mod error;
pub mod info;
pub mod mock;
pub mod none;
pub mod openssl;
pub mod options;
pub mod password;
pub mod rustls;
pub mod store;
pub mod strategy;
pub mod transport;
pub mod version;

#[cfg(any(windows, target_os = "macos"))]
pub mod native;

pub use config::{AcceptHostname, FileType, Overrides, PasswordSpec, TlsConfig, TlsConfigBuilder};
pub use error::{Hint, InitError, TlsError};
pub use info::SessionInfo;
pub use options::{OptionKind, OptionRegistry, TlsOptions};
pub use password::{Attempt, Coordinator, PasswordPrompt, PromptOutcome};
pub use store::CertStore;
pub use transport::{Socket, Transport};
pub use version::{parse_min_max, ProtocolRange, TlsVersion};

/// Result type for secure I/O operations
pub type Result<T> = std::result::Result<T, TlsError>;

/// The backend bound for this build
#[cfg(feature = "rustls-backend")]
pub type ActiveBackend = self::rustls::RustlsBackend;

/// The backend bound for this build
#[cfg(all(not(feature = "rustls-backend"), any(windows, target_os = "macos")))]
pub type ActiveBackend = self::native::NativeBackend;

/// The backend bound for this build
#[cfg(all(not(feature = "rustls-backend"), not(any(windows, target_os = "macos"))))]
pub type ActiveBackend = self::openssl::OpensslBackend;

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// The session is negotiated. `data_pending` is set when decrypted
    /// application data is already buffered, so the caller should read
    /// without waiting for the socket.
    Complete { data_pending: bool },
    /// The socket would block; call `resume()` when it is readable
    WantMore,
}

/// Outcome of a successful `read()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were copied into the caller's buffer
    Data(usize),
    /// The peer ended the session
    Eof,
    /// Nothing to deliver yet; try again when the socket is readable
    WouldBlock,
}

/// Record framing parameters, known only once the handshake completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSizes {
    /// Bytes of record header
    pub header: usize,
    /// Bytes of record trailer (MAC, tag, padding)
    pub trailer: usize,
    /// Largest application payload carried by one record
    pub max_message: usize,
}

impl StreamSizes {
    /// Largest TLS plaintext fragment
    pub const TLS_MAX_FRAGMENT: usize = 16384;

    /// Framing for a negotiated TLS version.
    ///
    /// `aead` selects a 16-byte authentication tag; otherwise room for the
    /// largest MAC plus CBC padding is reserved.
    pub fn for_tls(version: TlsVersion, aead: bool) -> Self {
        let mut trailer = if aead { 16 } else { 48 + 256 };
        if version >= TlsVersion::Tls13 {
            // inner content type byte
            trailer += 1;
        }
        StreamSizes {
            header: 5,
            trailer,
            max_message: Self::TLS_MAX_FRAGMENT,
        }
    }

    /// Largest complete record on the wire
    pub fn max_record(&self) -> usize {
        self.header + self.max_message + self.trailer
    }
}

/// A TLS provider
///
/// Implementations are independent: each one owns its handshake state
/// machine, record handling and certificate introspection.
pub trait SecureIo {
    /// Per-connection state owned by this provider
    type Session: SecureSession;

    /// Provider name, for display
    fn provider_name(&self) -> &'static str;

    /// Optional settings this provider understands
    fn options_supported(&self) -> TlsOptions;

    /// Oldest and newest protocol versions this provider can negotiate
    fn protocol_support(&self) -> (TlsVersion, TlsVersion);

    /// Build a credentialed session.
    ///
    /// Loads CA material and the client identity. Returns
    /// `InitError::NeedPassword` or `InitError::WrongPassword` when the
    /// private key needs a (different) password.
    fn create(&self, config: &TlsConfig, password: Option<&str>) -> std::result::Result<Self::Session, InitError>;
}

/// One TLS session over a non-blocking transport
pub trait SecureSession {
    /// Start the handshake on `socket`, which the session keeps from now on.
    fn negotiate(&mut self, socket: Socket, hostname: &str) -> Result<Negotiation>;

    /// Continue a handshake that returned `Negotiation::WantMore`.
    fn resume(&mut self) -> Result<Negotiation>;

    /// Read decrypted application data
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus>;

    /// Encrypt and send all of `buf`; returns `buf.len()` on success.
    ///
    /// Blocks while the socket is full. If the peer accepts nothing for
    /// `transport::WRITE_STALL_LIMIT` the write fails with a transport error
    /// of kind `TimedOut` and the session is failed.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Shut the session down and release everything it owns
    fn close(self)
    where
        Self: Sized;

    /// Whether the handshake has completed
    fn is_negotiated(&self) -> bool;

    /// Whether the session is encrypted but the host certificate failed
    /// verification that the configuration chose to skip
    fn secure_unverified(&self) -> bool;

    /// Negotiated protocol, cipher and key exchange
    fn session_info(&self) -> Option<&str>;

    /// Description of the host certificate chain
    fn server_cert_info(&self) -> Option<&str>;

    /// Names the host certificate is valid for
    fn server_subject_names(&self) -> Option<&[String]>;
}

/// Session lifecycle, shared by the backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Credentialed, no socket yet
    Created,
    /// Handshake in progress
    Handshaking,
    /// Ready for application data
    Negotiated,
    /// Handshake or record layer failed; only `close()` remains
    Failed,
}

impl Phase {
    pub(crate) fn check_negotiated(self) -> Result<()> {
        match self {
            Phase::Negotiated => Ok(()),
            Phase::Failed => Err(TlsError::InvalidHandle("session failed")),
            _ => Err(TlsError::InvalidHandle("session not negotiated")),
        }
    }

    pub(crate) fn check_created(self) -> Result<()> {
        match self {
            Phase::Created => Ok(()),
            Phase::Handshaking => Err(TlsError::InvalidHandle("negotiation pending; use resume()")),
            Phase::Negotiated => Err(TlsError::InvalidHandle("session already negotiated")),
            Phase::Failed => Err(TlsError::InvalidHandle("session failed")),
        }
    }

    pub(crate) fn check_handshaking(self) -> Result<()> {
        match self {
            Phase::Handshaking => Ok(()),
            Phase::Failed => Err(TlsError::InvalidHandle("session failed")),
            _ => Err(TlsError::InvalidHandle("no negotiation pending")),
        }
    }
}

/// Read chunk used while framing parameters are still unknown
pub(crate) const HANDSHAKE_READ_CHUNK: usize = 4096;
