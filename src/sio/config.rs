//! TLS configuration
//!
//! A `TlsConfig` is an immutable snapshot handed to a backend for one
//! connection attempt. It is assembled from global settings (builder, JSON
//! file, option registry) and copied with per-call overrides.

use super::error::TlsError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Highest accepted security level (OpenSSL defines 0 through 5)
pub const MAX_SECURITY_LEVEL: u32 = 5;

/// Encoding of a certificate or key file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    #[default]
    Pem,
    #[serde(alias = "asn1")]
    Der,
}

impl FileType {
    /// Parse a file type name ("pem", "der" or "asn1")
    pub fn from_name(name: &str) -> Result<Self, TlsError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pem" => Ok(FileType::Pem),
            "der" | "asn1" => Ok(FileType::Der),
            _ => Err(TlsError::config(format!(
                "Invalid file type '{}': must be pem or asn1",
                name
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pem => "pem",
            FileType::Der => "asn1",
        }
    }
}

/// Where a private key password comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordSpec {
    /// `string:<text>`
    Literal(String),
    /// `file:<path>`; the first line of the file is the password
    File(PathBuf),
    /// `env:<name>`; the value of an environment variable
    Env(String),
}

impl PasswordSpec {
    pub fn parse(spec: &str) -> Result<Self, TlsError> {
        if let Some(text) = spec.strip_prefix("string:") {
            Ok(PasswordSpec::Literal(text.to_string()))
        } else if let Some(path) = spec.strip_prefix("file:") {
            Ok(PasswordSpec::File(PathBuf::from(path)))
        } else if let Some(name) = spec.strip_prefix("env:") {
            if name.is_empty() || name.contains('=') {
                return Err(TlsError::config(format!(
                    "Invalid key password variable name '{}'",
                    name
                )));
            }
            Ok(PasswordSpec::Env(name.to_string()))
        } else {
            Err(TlsError::config(
                "Invalid key password: must begin with 'string:', 'file:' or 'env:'",
            ))
        }
    }

    /// Produce the password text
    pub fn resolve(&self) -> Result<String, TlsError> {
        match self {
            PasswordSpec::Literal(text) => Ok(text.clone()),
            PasswordSpec::File(path) => {
                let contents = fs::read_to_string(path).map_err(|e| {
                    TlsError::config(format!("Cannot read key password file {}: {}", path.display(), e))
                })?;
                Ok(contents.lines().next().unwrap_or("").to_string())
            }
            PasswordSpec::Env(name) => std::env::var(name).map_err(|e| {
                TlsError::config(format!("Cannot read key password variable {}: {}", name, e))
            }),
        }
    }
}

/// Host name matching policy derived from `accept_hostname`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptHostname {
    /// Match the name the caller connected to
    Connected,
    /// Skip the host name check (the chain is still verified)
    Any,
    /// Match this DNS name instead
    Dns(String),
    /// Match this IP address instead
    Ip(std::net::IpAddr),
}

impl AcceptHostname {
    pub fn parse(value: Option<&str>) -> Result<Self, TlsError> {
        let value = match value.map(str::trim) {
            None | Some("") => return Ok(AcceptHostname::Connected),
            Some(value) => value,
        };

        if value.eq_ignore_ascii_case("any") {
            Ok(AcceptHostname::Any)
        } else if let Some(name) = value.strip_prefix("DNS:") {
            Ok(AcceptHostname::Dns(name.to_string()))
        } else if let Some(addr) = value.strip_prefix("IP:") {
            addr.parse()
                .map(AcceptHostname::Ip)
                .map_err(|_| TlsError::config(format!("Invalid accept-hostname IP address '{}'", addr)))
        } else if let Ok(addr) = value.parse() {
            Ok(AcceptHostname::Ip(addr))
        } else {
            Ok(AcceptHostname::Dns(value.to_string()))
        }
    }

    /// The name to verify, given the name that was connected to
    pub fn expected_name(&self, connected: &str) -> Option<String> {
        match self {
            AcceptHostname::Connected => Some(connected.to_string()),
            AcceptHostname::Any => None,
            AcceptHostname::Dns(name) => Some(name.clone()),
            AcceptHostname::Ip(addr) => Some(addr.to_string()),
        }
    }
}

/// Per-call overrides applied on top of the global configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub force_no_verify: bool,
    pub accept_hostname: Option<String>,
}

/// TLS configuration (immutable once handed to a backend)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsConfig {
    pub accept_hostname: Option<String>,
    pub verify_host_cert: bool,
    pub starttls: bool,
    pub ca_dir: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub cert_file_type: FileType,
    pub chain_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub key_file_type: FileType,
    pub key_password: Option<String>,
    pub client_cert: Option<String>,
    pub min_protocol: Option<String>,
    pub max_protocol: Option<String>,
    pub security_level: Option<u32>,
    pub cert_store_dir: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            accept_hostname: None,
            verify_host_cert: true,
            starttls: true,
            ca_dir: None,
            ca_file: None,
            cert_file: None,
            cert_file_type: FileType::Pem,
            chain_file: None,
            key_file: None,
            key_file_type: FileType::Pem,
            key_password: None,
            client_cert: None,
            min_protocol: None,
            max_protocol: None,
            security_level: None,
            cert_store_dir: None,
        }
    }
}

impl TlsConfig {
    /// Create a new configuration builder
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::new()
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, TlsError> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            TlsError::config(format!("Cannot read {}: {}", path.as_ref().display(), e))
        })?;
        let config: TlsConfig = serde_json::from_str(&text).map_err(|e| {
            TlsError::config(format!("Invalid configuration {}: {}", path.as_ref().display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Copy of this configuration with per-call overrides applied
    pub fn with_overrides(&self, overrides: &Overrides) -> TlsConfig {
        let mut config = self.clone();
        if overrides.force_no_verify {
            config.verify_host_cert = false;
        }
        if let Some(ref name) = overrides.accept_hostname {
            config.accept_hostname = Some(name.clone());
        }
        config
    }

    /// Check fields that can be validated without a backend
    pub fn validate(&self) -> Result<(), TlsError> {
        if let Some(ref spec) = self.key_password {
            PasswordSpec::parse(spec)?;
        }
        if let Some(level) = self.security_level {
            if level > MAX_SECURITY_LEVEL {
                return Err(TlsError::config(format!(
                    "Invalid security level {}: must be 0 through {}",
                    level, MAX_SECURITY_LEVEL
                )));
            }
        }
        AcceptHostname::parse(self.accept_hostname.as_deref())?;
        Ok(())
    }

    /// Parsed host name policy
    pub fn accept(&self) -> Result<AcceptHostname, TlsError> {
        AcceptHostname::parse(self.accept_hostname.as_deref())
    }

    /// Password for the private key: an explicit one wins over the configured spec
    pub fn key_password(&self, explicit: Option<&str>) -> Result<Option<String>, TlsError> {
        if let Some(password) = explicit {
            return Ok(Some(password.to_string()));
        }
        match self.key_password {
            Some(ref spec) => PasswordSpec::parse(spec)?.resolve().map(Some),
            None => Ok(None),
        }
    }

    /// Whether a client identity is configured at all
    pub fn has_client_identity(&self) -> bool {
        self.cert_file.is_some() || self.key_file.is_some() || self.client_cert.is_some()
    }

    /// Directory of the file-based client certificate store
    pub fn cert_store(&self) -> Option<PathBuf> {
        self.cert_store_dir
            .clone()
            .or_else(|| dirs::config_dir().map(|dir| dir.join("secio").join("certs")))
    }
}

/// Configuration builder
pub struct TlsConfigBuilder {
    config: TlsConfig,
}

impl TlsConfigBuilder {
    fn new() -> Self {
        TlsConfigBuilder {
            config: TlsConfig::default(),
        }
    }

    /// Name to match against the host certificate ("any" disables the check)
    pub fn accept_hostname(mut self, name: impl Into<String>) -> Self {
        self.config.accept_hostname = Some(name.into());
        self
    }

    /// Enable/disable host certificate verification
    pub fn verify_host_cert(mut self, verify: bool) -> Self {
        self.config.verify_host_cert = verify;
        self
    }

    pub fn starttls(mut self, starttls: bool) -> Self {
        self.config.starttls = starttls;
        self
    }

    /// Directory of trusted CA certificates
    pub fn ca_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.ca_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// File of trusted CA certificates
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Client certificate file
    pub fn cert_file<P: AsRef<Path>>(mut self, path: P, file_type: FileType) -> Self {
        self.config.cert_file = Some(path.as_ref().to_path_buf());
        self.config.cert_file_type = file_type;
        self
    }

    /// Intermediate certificates sent along with the client certificate
    pub fn chain_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.chain_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Client private key file
    pub fn key_file<P: AsRef<Path>>(mut self, path: P, file_type: FileType) -> Self {
        self.config.key_file = Some(path.as_ref().to_path_buf());
        self.config.key_file_type = file_type;
        self
    }

    /// Key password spec (`string:<text>`, `file:<path>` or `env:<name>`)
    pub fn key_password(mut self, spec: impl Into<String>) -> Self {
        self.config.key_password = Some(spec.into());
        self
    }

    /// Client certificate friendly name in the credential store
    pub fn client_cert(mut self, name: impl Into<String>) -> Self {
        self.config.client_cert = Some(name.into());
        self
    }

    /// Location of the file-based client certificate store
    pub fn cert_store_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.cert_store_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Protocol range by symbolic name; either end may be omitted
    pub fn protocol_range(mut self, min: Option<&str>, max: Option<&str>) -> Self {
        self.config.min_protocol = min.map(str::to_string);
        self.config.max_protocol = max.map(str::to_string);
        self
    }

    pub fn security_level(mut self, level: u32) -> Self {
        self.config.security_level = Some(level);
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
