//! OpenSSL backend
//!
//! The default provider on Unix-like systems. Credentials are built into an
//! `SslContext` by `create()`; the session drives an `SslStream` over the
//! non-blocking transport, turning `WANT_READ` into `Negotiation::WantMore`.
//!
//! A client identity given by `cert-file`/`key-file` or by `client-cert`
//! name is bound before the handshake starts. Without one, a certificate
//! request from the server is answered from the certificate store with the
//! first identity issued by a CA the server lists, once per session.

mod context;
mod rebind;
mod session;

pub use session::OpensslSession;

use super::config::TlsConfig;
use super::error::{InitError, TlsError};
use super::options::TlsOptions;
use super::strategy::{self, CredentialStrategy};
use super::version::{parse_min_max, TlsVersion};
use super::SecureIo;
use context::StrategyRejected;

/// OpenSSL provider
#[derive(Debug, Clone, Copy, Default)]
pub struct OpensslBackend;

impl OpensslBackend {
    pub fn new() -> Self {
        OpensslBackend
    }
}

impl SecureIo for OpensslBackend {
    type Session = OpensslSession;

    fn provider_name(&self) -> &'static str {
        openssl::version::version()
    }

    fn options_supported(&self) -> TlsOptions {
        TlsOptions::ALL
    }

    fn protocol_support(&self) -> (TlsVersion, TlsVersion) {
        (TlsVersion::Ssl3, TlsVersion::Tls13)
    }

    fn create(&self, config: &TlsConfig, password: Option<&str>) -> Result<OpensslSession, InitError> {
        config.validate()?;
        let (impl_min, impl_max) = self.protocol_support();
        let range = parse_min_max(
            config.min_protocol.as_deref(),
            config.max_protocol.as_deref(),
            impl_min,
            impl_max,
        )?;
        let password = config.key_password(password)?;

        let strategy = strategy::current();
        let ctx = match context::build(config, password.as_deref(), &range, strategy)? {
            Ok(ctx) => ctx,
            Err(StrategyRejected(err)) if strategy == CredentialStrategy::Preferred => {
                tracing::debug!(error = %err, "protocol bounds rejected");
                strategy::pin_legacy();
                context::build(config, password.as_deref(), &range, CredentialStrategy::Legacy)?
                    .map_err(|StrategyRejected(err)| {
                        TlsError::protocol(format!("Cannot set protocol range: {}", err))
                    })?
            }
            Err(StrategyRejected(err)) => {
                return Err(TlsError::protocol(format!("Cannot set protocol range: {}", err)).into());
            }
        };

        tracing::debug!(strategy = strategy::current().as_str(), "OpenSSL credential built");
        Ok(OpensslSession::new(ctx, config.clone()))
    }
}
