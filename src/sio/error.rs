//! Secure I/O error types
//!
//! Every backend reports failures through the same small taxonomy so that
//! callers can react without knowing which TLS provider is compiled in.

use std::fmt;

/// Secure I/O errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// Operation on a session that is closed, failed, or in the wrong state
    #[error("Invalid session handle: {0}")]
    InvalidHandle(&'static str),

    /// Socket-level failure
    #[error("I/O error: {0}")]
    Transport(#[from] std::io::Error),

    /// Handshake, decrypt or encrypt failure reported by the TLS provider
    #[error("{message}{}", hint_suffix(.hint))]
    Protocol {
        message: String,
        hint: Option<Hint>,
    },

    /// Bad path, unparsable version range, missing or incorrect password
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TlsError {
    /// Build a protocol error without a hint
    pub fn protocol(message: impl Into<String>) -> Self {
        TlsError::Protocol {
            message: message.into(),
            hint: None,
        }
    }

    /// Build a protocol error annotated with a hint
    pub fn protocol_with_hint(message: impl Into<String>, hint: Option<Hint>) -> Self {
        TlsError::Protocol {
            message: message.into(),
            hint,
        }
    }

    /// Build a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        TlsError::Configuration(message.into())
    }

    /// Hint attached to a protocol error, if any
    pub fn hint(&self) -> Option<Hint> {
        match self {
            TlsError::Protocol { hint, .. } => *hint,
            _ => None,
        }
    }
}

/// Short advice attached to recognizable handshake failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    /// The certificate is valid but does not name the host we connected to
    HostnameMismatch,
    /// The peer and the configured protocol range do not overlap
    ProtocolVersion,
}

impl Hint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hint::HostnameMismatch => {
                "the host certificate does not match the host name; consider setting accept-hostname"
            }
            Hint::ProtocolVersion => {
                "the host may not support the configured protocol versions; consider adjusting min-protocol or max-protocol"
            }
        }
    }

    /// Classify a provider error string
    pub fn classify(text: &str) -> Option<Hint> {
        let text = text.to_ascii_lowercase();
        if text.contains("hostname mismatch")
            || text.contains("host name mismatch")
            || text.contains("notvalidforname")
            || text.contains("not valid for name")
        {
            Some(Hint::HostnameMismatch)
        } else if text.contains("unsupported protocol")
            || text.contains("wrong version number")
            || text.contains("no protocols available")
            || text.contains("protocol version")
            || text.contains("peerincompatible")
        {
            Some(Hint::ProtocolVersion)
        } else {
            None
        }
    }
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn hint_suffix(hint: &Option<Hint>) -> String {
    match hint {
        Some(hint) => format!("\nHint: {}", hint),
        None => String::new(),
    }
}

/// Outcome of a failed `create()`
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// The private key is encrypted and no password was supplied
    #[error("Private key password needed")]
    NeedPassword,

    /// The supplied password did not decrypt the private key
    #[error("Incorrect private key password")]
    WrongPassword,

    /// Anything else; not retryable with a different password
    #[error(transparent)]
    Failed(#[from] TlsError),
}

impl From<std::io::Error> for InitError {
    fn from(err: std::io::Error) -> Self {
        InitError::Failed(TlsError::Transport(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display_with_hint() {
        let err = TlsError::protocol_with_hint("handshake failed", Some(Hint::HostnameMismatch));
        let text = err.to_string();
        assert!(text.starts_with("handshake failed\nHint: "));
        assert!(text.contains("accept-hostname"));
        assert_eq!(err.hint(), Some(Hint::HostnameMismatch));
    }

    #[test]
    fn test_protocol_error_display_without_hint() {
        let err = TlsError::protocol("decrypt failed");
        assert_eq!(err.to_string(), "decrypt failed");
        assert_eq!(err.hint(), None);
    }

    #[test]
    fn test_hint_classification() {
        assert_eq!(
            Hint::classify("certificate verify failed: Hostname mismatch"),
            Some(Hint::HostnameMismatch)
        );
        assert_eq!(
            Hint::classify("error:0A00010B:SSL routines::wrong version number"),
            Some(Hint::ProtocolVersion)
        );
        assert_eq!(
            Hint::classify("received fatal alert: HandshakeFailure"),
            None
        );
    }
}
