//! rustls backend
//!
//! Portable provider, bound as the active backend by the `rustls-backend`
//! feature. The `ClientConnection` is driven by hand over the non-blocking
//! transport: `read_tls`/`process_new_packets` for input, `write_tls` for
//! output.
//!
//! The client identity is chosen by `StoreResolver` when the server asks
//! for it, which lets the store be searched by the issuers the server
//! advertises. rustls cannot decrypt private keys and has no security-level
//! knob, so `key-password` and `security-level` are not offered.

mod resolve;
mod session;
mod verify;

pub use resolve::StoreResolver;
pub use session::RustlsSession;
pub use verify::HostPolicyVerifier;

use super::config::TlsConfig;
use super::error::{InitError, TlsError};
use super::options::TlsOptions;
use super::version::{parse_min_max, ProtocolRange, TlsVersion};
use super::SecureIo;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// rustls provider
#[derive(Debug, Clone)]
pub struct RustlsBackend {
    provider: Arc<CryptoProvider>,
}

impl Default for RustlsBackend {
    fn default() -> Self {
        RustlsBackend {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl RustlsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn versions(range: &ProtocolRange) -> Vec<&'static SupportedProtocolVersion> {
        let mut versions = Vec::new();
        if range.allows(TlsVersion::Tls13) {
            versions.push(&rustls::version::TLS13);
        }
        if range.allows(TlsVersion::Tls12) {
            versions.push(&rustls::version::TLS12);
        }
        versions
    }
}

impl SecureIo for RustlsBackend {
    type Session = RustlsSession;

    fn provider_name(&self) -> &'static str {
        "rustls"
    }

    fn options_supported(&self) -> TlsOptions {
        TlsOptions::from_bits(TlsOptions::ALL.bits() & !(TlsOptions::KEY_PASSWORD | TlsOptions::SECURITY_LEVEL).bits())
    }

    fn protocol_support(&self) -> (TlsVersion, TlsVersion) {
        (TlsVersion::Tls12, TlsVersion::Tls13)
    }

    fn create(&self, config: &TlsConfig, password: Option<&str>) -> Result<RustlsSession, InitError> {
        config.validate()?;
        let (impl_min, impl_max) = self.protocol_support();
        let range = parse_min_max(
            config.min_protocol.as_deref(),
            config.max_protocol.as_deref(),
            impl_min,
            impl_max,
        )?;
        if password.is_some() || config.key_password.is_some() {
            tracing::debug!("private key password ignored; rustls reads unencrypted keys only");
        }

        let roots = Arc::new(load_roots(config)?);
        let verifier = Arc::new(HostPolicyVerifier::new(roots, self.provider.clone(), config)?);
        let resolver = Arc::new(StoreResolver::from_config(config, self.provider.clone())?);

        let client_config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&Self::versions(&range))
            .map_err(|e| TlsError::config(format!("Cannot set protocol range: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_client_cert_resolver(resolver.clone());

        Ok(RustlsSession::new(Arc::new(client_config), config.clone(), verifier, resolver))
    }
}

fn pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let data = fs::read(path).map_err(|e| TlsError::config(format!("Cannot read {}: {}", path.display(), e)))?;
    rustls_pemfile::certs(&mut BufReader::new(&data[..]))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::config(format!("Invalid certificate in {}: {}", path.display(), e)))
}

/// Trust anchors: the configured CA file and directory, or the platform
/// store, or the bundled Mozilla roots when the platform has none
fn load_roots(config: &TlsConfig) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();

    if let Some(ref file) = config.ca_file {
        let (added, ignored) = roots.add_parsable_certificates(pem_certs(file)?);
        tracing::debug!(file = %file.display(), added, ignored, "CA file loaded");
    }

    if let Some(ref dir) = config.ca_dir {
        let entries = fs::read_dir(dir)
            .map_err(|e| TlsError::config(format!("Cannot read CA directory {}: {}", dir.display(), e)))?;
        for path in entries.filter_map(|entry| entry.ok().map(|e| e.path())) {
            if !path.is_file() {
                continue;
            }
            // Hash links and non-certificate files are expected here
            if let Ok(certs) = pem_certs(&path) {
                roots.add_parsable_certificates(certs);
            }
        }
        tracing::debug!(dir = %dir.display(), roots = roots.len(), "CA directory loaded");
    }

    if config.ca_file.is_some() || config.ca_dir.is_some() {
        if roots.is_empty() {
            return Err(TlsError::config("No usable CA certificates in the configured locations"));
        }
        return Ok(roots);
    }

    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = roots.add_parsable_certificates(certs);
            tracing::debug!(added, ignored, "platform CA certificates loaded");
        }
        Err(e) => tracing::debug!(error = %e, "platform CA certificates unavailable"),
    }
    if roots.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        let backend = RustlsBackend::new();
        let options = backend.options_supported();
        assert!(options.contains(TlsOptions::CLIENT_CERT));
        assert!(!options.contains(TlsOptions::KEY_PASSWORD));
        assert!(!options.contains(TlsOptions::SECURITY_LEVEL));
        assert_eq!(backend.protocol_support(), (TlsVersion::Tls12, TlsVersion::Tls13));
    }

    #[test]
    fn test_version_selection() {
        let only_13 = ProtocolRange {
            min: Some(TlsVersion::Tls13),
            max: None,
        };
        assert_eq!(RustlsBackend::versions(&only_13).len(), 1);
        assert_eq!(RustlsBackend::versions(&ProtocolRange::default()).len(), 2);
    }

    #[test]
    fn test_rejects_old_protocols() {
        let backend = RustlsBackend::new();
        let config = TlsConfig::builder()
            .protocol_range(Some("TLS1"), None)
            .build()
            .unwrap();
        assert!(matches!(
            backend.create(&config, None),
            Err(InitError::Failed(TlsError::Configuration(_)))
        ));
    }

    #[test]
    fn test_empty_ca_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        fs::write(&path, "").unwrap();
        let config = TlsConfig::builder().ca_file(&path).build().unwrap();
        assert!(load_roots(&config).is_err());
    }
}
