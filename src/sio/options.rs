//! Capability bitmap and option registry
//!
//! Each backend advertises which optional TLS settings it understands as a
//! `TlsOptions` bitmap. The registry walks the bitmap once at startup and
//! exposes exactly those settings as command-line switches and
//! configuration keys.

use super::config::{FileType, TlsConfig};
use super::error::TlsError;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;

/// Set of optional TLS settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TlsOptions(u32);

impl TlsOptions {
    pub const ACCEPT_HOSTNAME: TlsOptions = TlsOptions(0x0001);
    pub const VERIFY_HOST_CERT: TlsOptions = TlsOptions(0x0002);
    pub const STARTTLS: TlsOptions = TlsOptions(0x0004);
    pub const CA_DIR: TlsOptions = TlsOptions(0x0008);
    pub const CA_FILE: TlsOptions = TlsOptions(0x0010);
    pub const CERT_FILE: TlsOptions = TlsOptions(0x0020);
    pub const CERT_FILE_TYPE: TlsOptions = TlsOptions(0x0040);
    pub const CHAIN_FILE: TlsOptions = TlsOptions(0x0080);
    pub const KEY_FILE: TlsOptions = TlsOptions(0x0100);
    pub const KEY_FILE_TYPE: TlsOptions = TlsOptions(0x0200);
    pub const KEY_PASSWORD: TlsOptions = TlsOptions(0x0400);
    pub const CLIENT_CERT: TlsOptions = TlsOptions(0x0800);
    pub const MIN_PROTOCOL: TlsOptions = TlsOptions(0x1000);
    pub const MAX_PROTOCOL: TlsOptions = TlsOptions(0x2000);
    pub const SECURITY_LEVEL: TlsOptions = TlsOptions(0x4000);

    /// Every known option
    pub const ALL: TlsOptions = TlsOptions(0x7fff);

    /// No options
    pub const fn empty() -> Self {
        TlsOptions(0)
    }

    /// Create from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        TlsOptions(bits)
    }

    /// Get raw bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: TlsOptions) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn union(self, other: TlsOptions) -> Self {
        TlsOptions(self.0 | other.0)
    }

    /// Single-bit flags in ascending order
    pub fn iter(&self) -> impl Iterator<Item = TlsOptions> + '_ {
        let bits = self.0;
        std::iter::successors(Some(1u32), |flag| flag.checked_shl(1))
            .take_while(|flag| *flag <= TlsOptions::ALL.0)
            .filter(move |flag| bits & flag != 0)
            .map(TlsOptions)
    }
}

impl BitOr for TlsOptions {
    type Output = TlsOptions;

    fn bitor(self, rhs: TlsOptions) -> TlsOptions {
        self.union(rhs)
    }
}

impl BitOrAssign for TlsOptions {
    fn bitor_assign(&mut self, rhs: TlsOptions) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .iter()
            .filter_map(|flag| descriptor(flag).map(|d| d.name))
            .collect();
        f.write_str(&names.join(" "))
    }
}

/// Value type of an option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Boolean,
    String,
    Integer,
}

/// Writes a textual option value into a configuration
pub type Setter = fn(&mut TlsConfig, &str) -> Result<(), TlsError>;

/// Static description of one option
pub struct OptionDescriptor {
    pub flag: TlsOptions,
    /// Command-line switch (without leading dashes)
    pub name: &'static str,
    /// Configuration key
    pub resource: &'static str,
    pub kind: OptionKind,
    pub help: &'static str,
    pub setter: Setter,
}

impl fmt::Debug for OptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionDescriptor")
            .field("flag", &self.flag)
            .field("name", &self.name)
            .field("resource", &self.resource)
            .field("kind", &self.kind)
            .finish()
    }
}

fn parse_bool(value: &str) -> Result<bool, TlsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(TlsError::config(format!("Invalid boolean value '{}'", value))),
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Descriptor table, in ascending flag order
static DESCRIPTORS: &[OptionDescriptor] = &[
    OptionDescriptor {
        flag: TlsOptions::ACCEPT_HOSTNAME,
        name: "accept-hostname",
        resource: "tls.acceptHostname",
        kind: OptionKind::String,
        help: "Host name to accept in the host certificate (DNS:name, IP:addr or any)",
        setter: |c, v| {
            c.accept_hostname = non_empty(v);
            c.accept().map(|_| ())
        },
    },
    OptionDescriptor {
        flag: TlsOptions::VERIFY_HOST_CERT,
        name: "verify-host-cert",
        resource: "tls.verifyHostCert",
        kind: OptionKind::Boolean,
        help: "Verify the host certificate",
        setter: |c, v| {
            c.verify_host_cert = parse_bool(v)?;
            Ok(())
        },
    },
    OptionDescriptor {
        flag: TlsOptions::STARTTLS,
        name: "starttls",
        resource: "tls.starttls",
        kind: OptionKind::Boolean,
        help: "Allow TLS to be negotiated in-band (STARTTLS)",
        setter: |c, v| {
            c.starttls = parse_bool(v)?;
            Ok(())
        },
    },
    OptionDescriptor {
        flag: TlsOptions::CA_DIR,
        name: "ca-dir",
        resource: "tls.caDir",
        kind: OptionKind::String,
        help: "Directory of trusted CA certificates",
        setter: |c, v| {
            c.ca_dir = non_empty(v).map(PathBuf::from);
            Ok(())
        },
    },
    OptionDescriptor {
        flag: TlsOptions::CA_FILE,
        name: "ca-file",
        resource: "tls.caFile",
        kind: OptionKind::String,
        help: "File of trusted CA certificates",
        setter: |c, v| {
            c.ca_file = non_empty(v).map(PathBuf::from);
            Ok(())
        },
    },
    OptionDescriptor {
        flag: TlsOptions::CERT_FILE,
        name: "cert-file",
        resource: "tls.certFile",
        kind: OptionKind::String,
        help: "Client certificate file",
        setter: |c, v| {
            c.cert_file = non_empty(v).map(PathBuf::from);
            Ok(())
        },
    },
    OptionDescriptor {
        flag: TlsOptions::CERT_FILE_TYPE,
        name: "cert-file-type",
        resource: "tls.certFileType",
        kind: OptionKind::String,
        help: "Client certificate file type (pem or asn1)",
        setter: |c, v| {
            c.cert_file_type = FileType::from_name(v)?;
            Ok(())
        },
    },
    OptionDescriptor {
        flag: TlsOptions::CHAIN_FILE,
        name: "chain-file",
        resource: "tls.chainFile",
        kind: OptionKind::String,
        help: "Client certificate chain file",
        setter: |c, v| {
            c.chain_file = non_empty(v).map(PathBuf::from);
            Ok(())
        },
    },
    OptionDescriptor {
        flag: TlsOptions::KEY_FILE,
        name: "key-file",
        resource: "tls.keyFile",
        kind: OptionKind::String,
        help: "Client private key file",
        setter: |c, v| {
            c.key_file = non_empty(v).map(PathBuf::from);
            Ok(())
        },
    },
    OptionDescriptor {
        flag: TlsOptions::KEY_FILE_TYPE,
        name: "key-file-type",
        resource: "tls.keyFileType",
        kind: OptionKind::String,
        help: "Client private key file type (pem or asn1)",
        setter: |c, v| {
            c.key_file_type = FileType::from_name(v)?;
            Ok(())
        },
    },
    OptionDescriptor {
        flag: TlsOptions::KEY_PASSWORD,
        name: "key-password",
        resource: "tls.keyPassword",
        kind: OptionKind::String,
        help: "Private key password (string:text or file:path)",
        setter: |c, v| {
            c.key_password = non_empty(v);
            c.validate()
        },
    },
    OptionDescriptor {
        flag: TlsOptions::CLIENT_CERT,
        name: "client-cert",
        resource: "tls.clientCert",
        kind: OptionKind::String,
        help: "Friendly name of a client certificate in the certificate store",
        setter: |c, v| {
            c.client_cert = non_empty(v);
            Ok(())
        },
    },
    OptionDescriptor {
        flag: TlsOptions::MIN_PROTOCOL,
        name: "min-protocol",
        resource: "tls.minProtocol",
        kind: OptionKind::String,
        help: "Oldest protocol to negotiate (SSL3, TLS1, TLS1_1, TLS1_2, TLS1_3)",
        setter: |c, v| {
            c.min_protocol = non_empty(v);
            Ok(())
        },
    },
    OptionDescriptor {
        flag: TlsOptions::MAX_PROTOCOL,
        name: "max-protocol",
        resource: "tls.maxProtocol",
        kind: OptionKind::String,
        help: "Newest protocol to negotiate (SSL3, TLS1, TLS1_1, TLS1_2, TLS1_3)",
        setter: |c, v| {
            c.max_protocol = non_empty(v);
            Ok(())
        },
    },
    OptionDescriptor {
        flag: TlsOptions::SECURITY_LEVEL,
        name: "security-level",
        resource: "tls.securityLevel",
        kind: OptionKind::Integer,
        help: "Security level (0 through 5)",
        setter: |c, v| {
            c.security_level = match non_empty(v) {
                Some(v) => Some(v.parse().map_err(|_| {
                    TlsError::config(format!("Invalid security level '{}'", v))
                })?),
                None => None,
            };
            c.validate()
        },
    },
];

/// Descriptor for a single-bit flag
pub fn descriptor(flag: TlsOptions) -> Option<&'static OptionDescriptor> {
    DESCRIPTORS.iter().find(|d| d.flag == flag)
}

/// Outcome of a runtime `set()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Applied,
    /// Queued until the session disconnects
    Deferred,
}

/// Options registered for the active backend
#[derive(Debug)]
pub struct OptionRegistry {
    registered: Vec<&'static OptionDescriptor>,
    deferred: Vec<(TlsOptions, String)>,
}

impl OptionRegistry {
    /// Register every option present in both `supported` and the
    /// descriptor table. Run once at startup, before any connection.
    pub fn new(supported: TlsOptions) -> Self {
        let mut registered = Vec::new();
        let mut flag = 1u32;
        while flag <= TlsOptions::ALL.bits() {
            let option = TlsOptions::from_bits(flag);
            if supported.contains(option) {
                if let Some(d) = descriptor(option) {
                    registered.push(d);
                }
            }
            flag <<= 1;
        }
        tracing::debug!(count = registered.len(), "registered TLS options");
        OptionRegistry {
            registered,
            deferred: Vec::new(),
        }
    }

    /// Registered options, in ascending flag order
    pub fn list_supported_options(&self) -> impl Iterator<Item = &'static OptionDescriptor> + '_ {
        self.registered.iter().copied()
    }

    /// Registered flags as a bitmap
    pub fn supported(&self) -> TlsOptions {
        self.registered
            .iter()
            .fold(TlsOptions::empty(), |acc, d| acc | d.flag)
    }

    fn registered(&self, flag: TlsOptions) -> Option<&'static OptionDescriptor> {
        self.registered.iter().copied().find(|d| d.flag == flag)
    }

    /// Command-line switch name for a flag
    pub fn name_for(&self, flag: TlsOptions) -> Option<&'static str> {
        self.registered(flag).map(|d| d.name)
    }

    /// Configuration key and setter for a flag
    pub fn config_address_for(&self, flag: TlsOptions) -> Option<(&'static str, Setter)> {
        self.registered(flag).map(|d| (d.resource, d.setter))
    }

    /// Value type for a flag
    pub fn type_for(&self, flag: TlsOptions) -> Option<OptionKind> {
        self.registered(flag).map(|d| d.kind)
    }

    /// Flag for a switch name or configuration key
    pub fn flag_for_name(&self, name: &str) -> Option<TlsOptions> {
        let name = name.trim_start_matches('-');
        self.registered
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name) || d.resource.eq_ignore_ascii_case(name))
            .map(|d| d.flag)
    }

    /// Add one argument per registered option to `command`
    pub fn command(&self, mut command: Command) -> Command {
        for d in &self.registered {
            command = match d.kind {
                OptionKind::Boolean => command
                    .arg(
                        Arg::new(d.name)
                            .long(d.name)
                            .help(d.help)
                            .action(ArgAction::SetTrue)
                            .overrides_with(negated(d.name)),
                    )
                    .arg(
                        Arg::new(negated(d.name))
                            .long(negated(d.name))
                            .help(format!("Do not {}", lowercase_first(d.help)))
                            .action(ArgAction::SetTrue)
                            .overrides_with(d.name),
                    ),
                OptionKind::String | OptionKind::Integer => command.arg(
                    Arg::new(d.name)
                        .long(d.name)
                        .help(d.help)
                        .value_name(if d.kind == OptionKind::Integer { "N" } else { "VALUE" })
                        .action(ArgAction::Set),
                ),
            };
        }
        command
    }

    /// Copy parsed command-line values into `config`
    pub fn apply_matches(&self, matches: &ArgMatches, config: &mut TlsConfig) -> Result<(), TlsError> {
        for d in &self.registered {
            match d.kind {
                OptionKind::Boolean => {
                    if matches.get_flag(d.name) {
                        (d.setter)(config, "true")?;
                    } else if matches.get_flag(negated(d.name)) {
                        (d.setter)(config, "false")?;
                    }
                }
                OptionKind::String | OptionKind::Integer => {
                    if let Some(value) = matches.get_one::<String>(d.name) {
                        (d.setter)(config, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply configuration-file key/value pairs. Keys for unregistered
    /// options are rejected.
    pub fn apply_resources<'a>(
        &self,
        config: &mut TlsConfig,
        resources: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<(), TlsError> {
        for (key, value) in resources {
            let flag = self
                .flag_for_name(key)
                .ok_or_else(|| TlsError::config(format!("Unsupported TLS option '{}'", key)))?;
            if let Some((_, setter)) = self.config_address_for(flag) {
                setter(config, value)?;
            }
        }
        Ok(())
    }

    /// Change an option at runtime. While connected the change is queued
    /// and takes effect at `disconnected()`.
    pub fn set(
        &mut self,
        config: &mut TlsConfig,
        name: &str,
        value: &str,
        connected: bool,
    ) -> Result<SetOutcome, TlsError> {
        let flag = self
            .flag_for_name(name)
            .ok_or_else(|| TlsError::config(format!("Unsupported TLS option '{}'", name)))?;

        if connected {
            tracing::debug!(option = name, "deferring TLS option change until disconnect");
            self.deferred.push((flag, value.to_string()));
            return Ok(SetOutcome::Deferred);
        }

        if let Some((_, setter)) = self.config_address_for(flag) {
            setter(config, value)?;
        }
        Ok(SetOutcome::Applied)
    }

    /// Apply queued changes; returns how many were applied
    pub fn disconnected(&mut self, config: &mut TlsConfig) -> Result<usize, TlsError> {
        let deferred = std::mem::take(&mut self.deferred);
        let count = deferred.len();
        for (flag, value) in deferred {
            if let Some((_, setter)) = self.config_address_for(flag) {
                setter(config, &value)?;
            }
        }
        Ok(count)
    }

    /// Number of queued changes
    pub fn pending_changes(&self) -> usize {
        self.deferred.len()
    }
}

fn negated(name: &'static str) -> &'static str {
    match name {
        "verify-host-cert" => "no-verify-host-cert",
        "starttls" => "no-starttls",
        _ => "no-option",
    }
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
