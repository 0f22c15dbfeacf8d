//! Protocol version names and range parsing
//!
//! Protocol versions are configured by symbolic name. The names map onto an
//! ordered enum so that ranges can be compared independently of any backend.

use super::error::TlsError;
use std::fmt;
use std::str::FromStr;

/// TLS protocol version, ordered oldest to newest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    /// SSL 2.0 (no backend still implements it)
    Ssl2,
    /// SSL 3.0
    Ssl3,
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Every version, oldest first
    pub const ALL: [TlsVersion; 6] = [
        TlsVersion::Ssl2,
        TlsVersion::Ssl3,
        TlsVersion::Tls10,
        TlsVersion::Tls11,
        TlsVersion::Tls12,
        TlsVersion::Tls13,
    ];

    /// Symbolic configuration name
    pub fn name(&self) -> &'static str {
        match self {
            TlsVersion::Ssl2 => "SSL2",
            TlsVersion::Ssl3 => "SSL3",
            TlsVersion::Tls10 => "TLS1",
            TlsVersion::Tls11 => "TLS1_1",
            TlsVersion::Tls12 => "TLS1_2",
            TlsVersion::Tls13 => "TLS1_3",
        }
    }

    /// Human-readable protocol name, as used in session descriptions
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Ssl2 => "SSLv2",
            TlsVersion::Ssl3 => "SSLv3",
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }

    /// Numeric level (0 = SSL2)
    pub fn level(&self) -> u8 {
        *self as u8
    }

    /// Version for a numeric level
    pub fn from_level(level: u8) -> Option<Self> {
        Self::ALL.get(level as usize).copied()
    }

    /// Look up a symbolic name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|v| v.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Versions between `min` and `max`, inclusive
    pub fn range(min: TlsVersion, max: TlsVersion) -> impl Iterator<Item = TlsVersion> {
        Self::ALL.into_iter().filter(move |v| *v >= min && *v <= max)
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TlsVersion::from_name(s).ok_or_else(|| {
            TlsError::config(format!(
                "Invalid protocol version '{}': legal values are {}",
                s,
                legal_names(TlsVersion::Ssl2, TlsVersion::Tls13)
            ))
        })
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed protocol range. `None` leaves the backend default in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolRange {
    pub min: Option<TlsVersion>,
    pub max: Option<TlsVersion>,
}

impl ProtocolRange {
    /// Effective bounds, falling back to the implementation limits
    pub fn bounds(&self, impl_min: TlsVersion, impl_max: TlsVersion) -> (TlsVersion, TlsVersion) {
        (self.min.unwrap_or(impl_min), self.max.unwrap_or(impl_max))
    }

    /// Whether `version` is acceptable under this range
    pub fn allows(&self, version: TlsVersion) -> bool {
        self.min.map_or(true, |min| version >= min) && self.max.map_or(true, |max| version <= max)
    }
}

/// Parse the configured min/max protocol names.
///
/// Names outside `[impl_min, impl_max]` are rejected, as is a minimum greater
/// than the maximum. Error messages list the names the caller supports.
pub fn parse_min_max(
    min_name: Option<&str>,
    max_name: Option<&str>,
    impl_min: TlsVersion,
    impl_max: TlsVersion,
) -> Result<ProtocolRange, TlsError> {
    let min = parse_one("min-protocol", min_name, impl_min, impl_max)?;
    let max = parse_one("max-protocol", max_name, impl_min, impl_max)?;

    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(TlsError::config(format!(
                "min-protocol ({}) is greater than max-protocol ({})",
                min, max
            )));
        }
    }

    Ok(ProtocolRange { min, max })
}

fn parse_one(
    what: &str,
    name: Option<&str>,
    impl_min: TlsVersion,
    impl_max: TlsVersion,
) -> Result<Option<TlsVersion>, TlsError> {
    let name = match name {
        Some(name) if !name.trim().is_empty() => name,
        _ => return Ok(None),
    };

    match TlsVersion::from_name(name) {
        Some(v) if v >= impl_min && v <= impl_max => Ok(Some(v)),
        _ => Err(TlsError::config(format!(
            "Invalid {} '{}': legal values are {}",
            what,
            name,
            legal_names(impl_min, impl_max)
        ))),
    }
}

fn legal_names(impl_min: TlsVersion, impl_max: TlsVersion) -> String {
    TlsVersion::range(impl_min, impl_max)
        .map(|v| v.name())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!("TLS1_2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("tls1_3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert_eq!("TLS1".parse::<TlsVersion>().unwrap(), TlsVersion::Tls10);
        assert_eq!("ssl3".parse::<TlsVersion>().unwrap(), TlsVersion::Ssl3);
        assert!("TLSv1.2".parse::<TlsVersion>().is_err());
        assert!("invalid".parse::<TlsVersion>().is_err());
    }

    #[test]
    fn test_version_order_and_levels() {
        for pair in TlsVersion::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].level() + 1, pair[1].level());
        }
        assert_eq!(TlsVersion::from_level(4), Some(TlsVersion::Tls12));
        assert_eq!(TlsVersion::from_level(6), None);
        assert_eq!(TlsVersion::Tls13.as_str(), "TLSv1.3");
    }

    #[test]
    fn test_parse_min_max_accepts_exactly_supported_names() {
        let (lo, hi) = (TlsVersion::Tls10, TlsVersion::Tls13);
        for v in TlsVersion::ALL {
            let result = parse_min_max(Some(v.name()), None, lo, hi);
            assert_eq!(result.is_ok(), v >= lo && v <= hi, "{}", v);
            let result = parse_min_max(None, Some(v.name()), lo, hi);
            assert_eq!(result.is_ok(), v >= lo && v <= hi, "{}", v);
        }
    }

    #[test]
    fn test_parse_min_max_rejects_inverted_range() {
        let (lo, hi) = (TlsVersion::Ssl3, TlsVersion::Tls13);
        for min in TlsVersion::range(lo, hi) {
            for max in TlsVersion::range(lo, hi) {
                let result = parse_min_max(Some(min.name()), Some(max.name()), lo, hi);
                if min > max {
                    let err = result.unwrap_err().to_string();
                    assert!(err.contains("greater than"), "{}", err);
                } else {
                    let range = result.unwrap();
                    assert_eq!(range, ProtocolRange { min: Some(min), max: Some(max) });
                }
            }
        }
    }

    #[test]
    fn test_parse_min_max_error_lists_legal_names() {
        let err = parse_min_max(Some("TLS1"), None, TlsVersion::Tls12, TlsVersion::Tls13)
            .unwrap_err()
            .to_string();
        assert!(err.contains("min-protocol"));
        assert!(err.contains("TLS1_2 TLS1_3"));

        let err = parse_min_max(None, Some("bogus"), TlsVersion::Tls12, TlsVersion::Tls13)
            .unwrap_err()
            .to_string();
        assert!(err.contains("max-protocol 'bogus'"));
    }

    #[test]
    fn test_parse_min_max_unset() {
        let range = parse_min_max(None, Some(""), TlsVersion::Tls12, TlsVersion::Tls13).unwrap();
        assert_eq!(range, ProtocolRange::default());
        assert_eq!(
            range.bounds(TlsVersion::Tls12, TlsVersion::Tls13),
            (TlsVersion::Tls12, TlsVersion::Tls13)
        );
        assert!(range.allows(TlsVersion::Ssl3));
    }
}
