//! Host certificate policy on top of the WebPKI verifier
//!
//! Applies `accept-hostname` (verify against another name, or skip the name
//! check) and `verify-host-cert = false` (record the failure and continue).

use crate::sio::config::{AcceptHostname, TlsConfig};
use crate::sio::error::TlsError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct HostPolicyVerifier {
    inner: Arc<WebPkiServerVerifier>,
    accept: AcceptHostname,
    verify: bool,
    unverified: AtomicBool,
}

impl HostPolicyVerifier {
    pub fn new(
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
        config: &TlsConfig,
    ) -> Result<Self, TlsError> {
        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| TlsError::config(format!("Cannot build certificate verifier: {}", e)))?;
        Ok(HostPolicyVerifier {
            inner,
            accept: config.accept()?,
            verify: config.verify_host_cert,
            unverified: AtomicBool::new(false),
        })
    }

    /// Whether a verification failure was waved through
    pub fn was_unverified(&self) -> bool {
        self.unverified.load(Ordering::Relaxed)
    }

    fn expected_name(&self) -> Result<Option<ServerName<'static>>, Error> {
        match self.accept {
            AcceptHostname::Connected | AcceptHostname::Any => Ok(None),
            AcceptHostname::Dns(ref name) => ServerName::try_from(name.clone())
                .map(Some)
                .map_err(|_| Error::General(format!("invalid accept-hostname '{}'", name))),
            AcceptHostname::Ip(addr) => Ok(Some(ServerName::from(addr))),
        }
    }
}

fn is_name_error(err: &Error) -> bool {
    matches!(
        err,
        Error::InvalidCertificate(CertificateError::NotValidForName)
            | Error::InvalidCertificate(CertificateError::NotValidForNameContext { .. })
    )
}

impl ServerCertVerifier for HostPolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let expected = self.expected_name()?;
        let name = match expected {
            Some(ref name) => name,
            None => server_name,
        };

        let result = match self
            .inner
            .verify_server_cert(end_entity, intermediates, name, ocsp_response, now)
        {
            Err(e) if self.accept == AcceptHostname::Any && is_name_error(&e) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        };

        match result {
            Err(e) if !self.verify => {
                tracing::warn!(error = %e, "host certificate not verified; continuing as configured");
                self.unverified.store(true, Ordering::Relaxed);
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    fn self_signed(name: &str) -> rcgen::CertifiedKey {
        rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap()
    }

    fn verifier(config: &TlsConfig, trusted: Option<&rcgen::CertifiedKey>) -> HostPolicyVerifier {
        let mut roots = RootCertStore::empty();
        if let Some(ca) = trusted {
            roots.add(ca.cert.der().clone()).unwrap();
        } else {
            roots.add(self_signed("unrelated.test").cert.der().clone()).unwrap();
        }
        HostPolicyVerifier::new(Arc::new(roots), provider(), config).unwrap()
    }

    fn check(verifier: &HostPolicyVerifier, cert: &rcgen::CertifiedKey, host: &str) -> Result<ServerCertVerified, Error> {
        let name = ServerName::try_from(host.to_string()).unwrap();
        verifier.verify_server_cert(cert.cert.der(), &[], &name, &[], UnixTime::now())
    }

    #[test]
    fn test_trusted_host() {
        let cert = self_signed("host.test");
        let v = verifier(&TlsConfig::default(), Some(&cert));
        assert!(check(&v, &cert, "host.test").is_ok());
        assert!(check(&v, &cert, "other.test").is_err());
        assert!(!v.was_unverified());
    }

    #[test]
    fn test_accept_hostname_policies() {
        let cert = self_signed("host.test");

        let config = TlsConfig::builder().accept_hostname("DNS:host.test").build().unwrap();
        let v = verifier(&config, Some(&cert));
        assert!(check(&v, &cert, "alias.test").is_ok());

        let config = TlsConfig::builder().accept_hostname("any").build().unwrap();
        let v = verifier(&config, Some(&cert));
        assert!(check(&v, &cert, "alias.test").is_ok());
        assert!(!v.was_unverified());
    }

    #[test]
    fn test_unverified_when_disabled() {
        let cert = self_signed("host.test");
        let config = TlsConfig::builder().verify_host_cert(false).build().unwrap();
        let v = verifier(&config, None);
        assert!(check(&v, &cert, "host.test").is_ok());
        assert!(v.was_unverified());

        let v = verifier(&TlsConfig::default(), None);
        assert!(matches!(
            check(&v, &cert, "host.test"),
            Err(Error::InvalidCertificate(_))
        ));
    }
}
