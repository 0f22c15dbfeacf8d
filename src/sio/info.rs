//! Post-handshake session descriptions
//!
//! Filled in once when a handshake completes and read through the session
//! accessors until the session is closed.

use super::cert::{describe_chain, CertInfo};
use std::fmt::Write as _;

/// Descriptions of a negotiated session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Provider, protocol, cipher and key exchange
    pub session: String,
    /// Host certificate chain
    pub server_cert: String,
    /// Names the host certificate is valid for
    pub subject_names: Vec<String>,
    /// Encrypted, but host verification failed and was skipped by choice
    pub secure_unverified: bool,
}

impl SessionInfo {
    /// Build descriptions from the negotiated parameters and peer chain
    pub fn new(params: &NegotiatedParams<'_>, chain: &[CertInfo]) -> Self {
        SessionInfo {
            session: params.describe(),
            server_cert: describe_chain(chain),
            subject_names: chain.first().map(CertInfo::names).unwrap_or_default(),
            secure_unverified: false,
        }
    }
}

/// Negotiated parameters as reported by a provider
#[derive(Debug, Clone, Default)]
pub struct NegotiatedParams<'a> {
    pub provider: &'a str,
    pub protocol: Option<String>,
    pub cipher: Option<String>,
    pub cipher_bits: Option<u32>,
    pub key_exchange: Option<String>,
}

impl NegotiatedParams<'_> {
    fn describe(&self) -> String {
        let undef = || "<undef>".to_string();
        let mut out = String::new();
        let _ = writeln!(out, "Provider: {}", self.provider);
        let _ = writeln!(out, "Protocol: {}", self.protocol.clone().unwrap_or_else(undef));
        match self.cipher_bits {
            Some(bits) => {
                let _ = writeln!(
                    out,
                    "Cipher: {} ({} bits)",
                    self.cipher.clone().unwrap_or_else(undef),
                    bits
                );
            }
            None => {
                let _ = writeln!(out, "Cipher: {}", self.cipher.clone().unwrap_or_else(undef));
            }
        }
        if let Some(ref kx) = self.key_exchange {
            let _ = writeln!(out, "Key exchange: {}", kx);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_info() {
        let info = SessionInfo::default();
        assert!(info.session.is_empty());
        assert!(info.subject_names.is_empty());
        assert!(!info.secure_unverified);
    }

    #[test]
    fn test_session_description() {
        let params = NegotiatedParams {
            provider: "OpenSSL 3.0",
            protocol: Some("TLSv1.3".to_string()),
            cipher: Some("TLS_AES_256_GCM_SHA384".to_string()),
            cipher_bits: Some(256),
            key_exchange: Some("X25519".to_string()),
        };
        let info = SessionInfo::new(&params, &[]);
        assert_eq!(
            info.session,
            "Provider: OpenSSL 3.0\nProtocol: TLSv1.3\nCipher: TLS_AES_256_GCM_SHA384 (256 bits)\nKey exchange: X25519\n"
        );
        assert!(info.server_cert.is_empty());
        assert!(info.subject_names.is_empty());
    }

    #[test]
    fn test_missing_parameters() {
        let params = NegotiatedParams {
            provider: "mock",
            ..Default::default()
        };
        let info = SessionInfo::new(&params, &[]);
        assert!(info.session.contains("Protocol: <undef>"));
        assert!(info.session.contains("Cipher: <undef>\n"));
        assert!(!info.session.contains("Key exchange"));
    }
}
