//! Backend for builds without TLS
//!
//! Advertises no options and refuses to create sessions, so callers can
//! fall back to plain connections.

use super::config::TlsConfig;
use super::error::{InitError, TlsError};
use super::options::TlsOptions;
use super::transport::Socket;
use super::version::TlsVersion;
use super::{Negotiation, ReadStatus, Result, SecureIo, SecureSession};

/// Provider that supports nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneBackend;

/// Session type of `NoneBackend`; no value of it can exist
#[derive(Debug)]
pub enum NoneSession {}

impl SecureIo for NoneBackend {
    type Session = NoneSession;

    fn provider_name(&self) -> &'static str {
        "none"
    }

    fn options_supported(&self) -> TlsOptions {
        TlsOptions::empty()
    }

    fn protocol_support(&self) -> (TlsVersion, TlsVersion) {
        (TlsVersion::Tls13, TlsVersion::Tls13)
    }

    fn create(&self, _config: &TlsConfig, _password: Option<&str>) -> std::result::Result<NoneSession, InitError> {
        Err(TlsError::protocol("TLS is not supported by this build").into())
    }
}

impl SecureSession for NoneSession {
    fn negotiate(&mut self, _socket: Socket, _hostname: &str) -> Result<Negotiation> {
        match *self {}
    }

    fn resume(&mut self) -> Result<Negotiation> {
        match *self {}
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<ReadStatus> {
        match *self {}
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        match *self {}
    }

    fn close(self) {
        match self {}
    }

    fn is_negotiated(&self) -> bool {
        match *self {}
    }

    fn secure_unverified(&self) -> bool {
        match *self {}
    }

    fn session_info(&self) -> Option<&str> {
        match *self {}
    }

    fn server_cert_info(&self) -> Option<&str> {
        match *self {}
    }

    fn server_subject_names(&self) -> Option<&[String]> {
        match *self {}
    }
}
