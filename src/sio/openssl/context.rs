//! OpenSSL credential construction
//!
//! Turns a `TlsConfig` into an `SslContext`: trust anchors, client identity,
//! protocol range and security level.

use super::rebind;
use crate::sio::config::{FileType, TlsConfig};
use crate::sio::error::{InitError, TlsError};
use crate::sio::store::CertStore;
use crate::sio::strategy::CredentialStrategy;
use crate::sio::version::{ProtocolRange, TlsVersion};
use openssl::error::ErrorStack;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslOptions, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::fs;
use std::path::Path;

fn ssl_version(version: TlsVersion) -> Option<SslVersion> {
    match version {
        TlsVersion::Ssl2 => None,
        TlsVersion::Ssl3 => Some(SslVersion::SSL3),
        TlsVersion::Tls10 => Some(SslVersion::TLS1),
        TlsVersion::Tls11 => Some(SslVersion::TLS1_1),
        TlsVersion::Tls12 => Some(SslVersion::TLS1_2),
        TlsVersion::Tls13 => Some(SslVersion::TLS1_3),
    }
}

fn disable_option(version: TlsVersion) -> SslOptions {
    match version {
        TlsVersion::Ssl2 => SslOptions::NO_SSLV2,
        TlsVersion::Ssl3 => SslOptions::NO_SSLV3,
        TlsVersion::Tls10 => SslOptions::NO_TLSV1,
        TlsVersion::Tls11 => SslOptions::NO_TLSV1_1,
        TlsVersion::Tls12 => SslOptions::NO_TLSV1_2,
        TlsVersion::Tls13 => SslOptions::NO_TLSV1_3,
    }
}

/// Provider rejected the way the protocol range was expressed
#[derive(Debug)]
pub(super) struct StrategyRejected(pub ErrorStack);

fn openssl_error(context: &str, err: ErrorStack) -> TlsError {
    TlsError::protocol(format!("{}: {}", context, err))
}

fn read_file(path: &Path, what: &str) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|e| TlsError::config(format!("Cannot read {} {}: {}", what, path.display(), e)))
}

#[cfg(test)]
thread_local! {
    static REJECT_PREFERRED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
    static ATTEMPTS: std::cell::RefCell<Vec<CredentialStrategy>> = const { std::cell::RefCell::new(Vec::new()) };
}

/// Make the preferred strategy fail on this thread, as providers without
/// version-bound support do
#[cfg(test)]
pub(super) fn reject_preferred(reject: bool) {
    REJECT_PREFERRED.with(|flag| flag.set(reject));
}

/// Strategies tried on this thread since the last call
#[cfg(test)]
pub(super) fn take_attempts() -> Vec<CredentialStrategy> {
    ATTEMPTS.with(|attempts| attempts.take())
}

/// Apply the protocol range with the given strategy
pub(super) fn apply_range(
    builder: &mut SslContextBuilder,
    range: &ProtocolRange,
    strategy: CredentialStrategy,
) -> Result<(), StrategyRejected> {
    if range.min.is_none() && range.max.is_none() {
        return Ok(());
    }

    #[cfg(test)]
    {
        ATTEMPTS.with(|attempts| attempts.borrow_mut().push(strategy));
        if strategy == CredentialStrategy::Preferred && REJECT_PREFERRED.with(|flag| flag.get()) {
            return Err(StrategyRejected(ErrorStack::get()));
        }
    }

    match strategy {
        CredentialStrategy::Preferred => {
            builder
                .set_min_proto_version(range.min.and_then(ssl_version))
                .map_err(StrategyRejected)?;
            builder
                .set_max_proto_version(range.max.and_then(ssl_version))
                .map_err(StrategyRejected)?;
        }
        CredentialStrategy::Legacy => {
            let mut options = SslOptions::empty();
            for version in TlsVersion::ALL {
                if !range.allows(version) {
                    options |= disable_option(version);
                }
            }
            builder.set_options(options);
        }
    }
    Ok(())
}

fn load_trust(builder: &mut SslContextBuilder, config: &TlsConfig) -> Result<(), TlsError> {
    match (&config.ca_file, &config.ca_dir) {
        (None, None) => builder
            .set_default_verify_paths()
            .map_err(|e| openssl_error("Cannot load default CA certificates", e)),
        (Some(file), None) => builder
            .set_ca_file(file)
            .map_err(|e| openssl_error(&format!("Cannot load CA file {}", file.display()), e)),
        (file, dir) => {
            for path in file.iter().chain(dir.iter()) {
                if !path.exists() {
                    return Err(TlsError::config(format!("CA location {} does not exist", path.display())));
                }
            }
            builder
                .load_verify_locations(file.as_deref(), dir.as_deref())
                .map_err(|e| openssl_error("Cannot load CA locations", e))
        }
    }
}

pub(super) fn load_certs(data: &[u8], file_type: FileType, path: &Path) -> Result<Vec<X509>, TlsError> {
    let certs = match file_type {
        FileType::Pem => X509::stack_from_pem(data),
        FileType::Der => X509::from_der(data).map(|cert| vec![cert]),
    }
    .map_err(|e| openssl_error(&format!("Cannot load certificate {}", path.display()), e))?;
    if certs.is_empty() {
        return Err(TlsError::config(format!("No certificate in {}", path.display())));
    }
    Ok(certs)
}

fn is_encrypted_pem(data: &[u8]) -> bool {
    let text = String::from_utf8_lossy(data);
    text.contains("BEGIN ENCRYPTED PRIVATE KEY") || text.contains("Proc-Type: 4,ENCRYPTED")
}

/// Decode a private key, decrypting it with `password` when needed
pub(super) fn load_key(
    data: &[u8],
    file_type: FileType,
    password: Option<&str>,
) -> Result<PKey<Private>, InitError> {
    match file_type {
        FileType::Pem => {
            if !is_encrypted_pem(data) {
                return PKey::private_key_from_pem(data)
                    .map_err(|e| openssl_error("Cannot load private key", e).into());
            }
            let password = password.ok_or(InitError::NeedPassword)?;
            PKey::private_key_from_pem_passphrase(data, password.as_bytes())
                .map_err(|_| InitError::WrongPassword)
        }
        FileType::Der => {
            if let Ok(key) = PKey::private_key_from_der(data) {
                return Ok(key);
            }
            let password = password.ok_or(InitError::NeedPassword)?;
            if password.contains('\0') {
                return Err(InitError::WrongPassword);
            }
            PKey::private_key_from_pkcs8_passphrase(data, password.as_bytes())
                .map_err(|_| InitError::WrongPassword)
        }
    }
}

fn load_identity(
    builder: &mut SslContextBuilder,
    config: &TlsConfig,
    password: Option<&str>,
) -> Result<(), InitError> {
    let (certs, key_data, key_type, source) = if let Some(ref name) = config.client_cert {
        let store = config
            .cert_store()
            .map(CertStore::new)
            .ok_or_else(|| TlsError::config("No client certificate store configured"))?;
        let entry = store.find_by_name(name)?;
        let data = read_file(&entry.path, "client certificate")?;
        let certs = load_certs(&data, FileType::Pem, &entry.path)?;
        (certs, data, FileType::Pem, entry.path)
    } else if let Some(ref cert_file) = config.cert_file {
        let data = read_file(cert_file, "certificate file")?;
        let certs = load_certs(&data, config.cert_file_type, cert_file)?;
        let (key_data, key_type, source) = match config.key_file {
            Some(ref key_file) => (read_file(key_file, "key file")?, config.key_file_type, key_file.clone()),
            None => (data, config.cert_file_type, cert_file.clone()),
        };
        (certs, key_data, key_type, source)
    } else if config.key_file.is_some() {
        return Err(TlsError::config("A key file was given without a certificate file").into());
    } else {
        // Nothing bound up front; answer a certificate request from the store
        if let Some(dir) = config.cert_store() {
            rebind::install(builder, CertStore::new(dir), password)?;
        }
        return Ok(());
    };

    let mut certs = certs.into_iter();
    if let Some(leaf) = certs.next() {
        builder
            .set_certificate(&leaf)
            .map_err(|e| openssl_error("Cannot use client certificate", e))?;
    }
    for extra in certs {
        builder
            .add_extra_chain_cert(extra)
            .map_err(|e| openssl_error("Cannot add chain certificate", e))?;
    }

    if let Some(ref chain_file) = config.chain_file {
        let data = read_file(chain_file, "chain file")?;
        for cert in load_certs(&data, FileType::Pem, chain_file)? {
            builder
                .add_extra_chain_cert(cert)
                .map_err(|e| openssl_error("Cannot add chain certificate", e))?;
        }
    }

    let key = load_key(&key_data, key_type, password)?;
    builder
        .set_private_key(&key)
        .map_err(|e| openssl_error("Cannot use private key", e))?;
    builder
        .check_private_key()
        .map_err(|e| openssl_error(&format!("Private key {} does not match the certificate", source.display()), e))?;
    tracing::debug!(source = %source.display(), "client identity loaded");
    Ok(())
}

/// Build a client context. `StrategyRejected` is reported separately so the
/// caller can retry with the legacy strategy.
pub(super) fn build(
    config: &TlsConfig,
    password: Option<&str>,
    range: &ProtocolRange,
    strategy: CredentialStrategy,
) -> Result<Result<SslContext, StrategyRejected>, InitError> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_client())
        .map_err(|e| openssl_error("Cannot create SSL context", e))?;

    if let Err(rejected) = apply_range(&mut builder, range, strategy) {
        return Ok(Err(rejected));
    }

    if let Some(level) = config.security_level {
        builder.set_security_level(level);
    }

    // Verification runs in every case; when disabled by configuration the
    // result is inspected after the handshake instead of failing it
    builder.set_verify(if config.verify_host_cert {
        SslVerifyMode::PEER
    } else {
        SslVerifyMode::NONE
    });

    load_trust(&mut builder, config)?;
    load_identity(&mut builder, config, password)?;

    Ok(Ok(builder.build()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypted_key_pem(password: &str) -> Vec<u8> {
        let key = PKey::generate_ed25519().unwrap();
        key.private_key_to_pem_pkcs8_passphrase(
            openssl::symm::Cipher::aes_256_cbc(),
            password.as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_encrypted_pem_key() {
        let pem = encrypted_key_pem("s3cret");
        assert!(matches!(
            load_key(&pem, FileType::Pem, None),
            Err(InitError::NeedPassword)
        ));
        assert!(matches!(
            load_key(&pem, FileType::Pem, Some("wrong")),
            Err(InitError::WrongPassword)
        ));
        assert!(load_key(&pem, FileType::Pem, Some("s3cret")).is_ok());
    }

    #[test]
    fn test_plain_keys() {
        let key = PKey::generate_ed25519().unwrap();
        let pem = key.private_key_to_pem_pkcs8().unwrap();
        assert!(load_key(&pem, FileType::Pem, None).is_ok());
        let der = key.private_key_to_pkcs8().unwrap();
        assert!(load_key(&der, FileType::Der, None).is_ok());
        assert!(matches!(
            load_key(b"garbage", FileType::Der, None),
            Err(InitError::NeedPassword)
        ));
    }

    #[test]
    fn test_ranges_with_both_strategies() {
        let range = ProtocolRange {
            min: Some(TlsVersion::Tls12),
            max: Some(TlsVersion::Tls13),
        };
        for strategy in [CredentialStrategy::Preferred, CredentialStrategy::Legacy] {
            let mut builder = SslContextBuilder::new(SslMethod::tls_client()).unwrap();
            assert!(apply_range(&mut builder, &range, strategy).is_ok());
        }

        let mut builder = SslContextBuilder::new(SslMethod::tls_client()).unwrap();
        apply_range(&mut builder, &range, CredentialStrategy::Legacy).unwrap();
        let options = builder.options();
        assert!(options.contains(SslOptions::NO_TLSV1 | SslOptions::NO_TLSV1_1));
        assert!(!options.contains(SslOptions::NO_TLSV1_2));
    }

    #[test]
    fn test_missing_ca_location() {
        let config = TlsConfig::builder().ca_dir("/nonexistent/secio-ca").build().unwrap();
        let mut builder = SslContextBuilder::new(SslMethod::tls_client()).unwrap();
        assert!(matches!(
            load_trust(&mut builder, &config),
            Err(TlsError::Configuration(_))
        ));
    }
}
