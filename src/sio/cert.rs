//! Certificate introspection
//!
//! Every backend describes the host certificate chain the same way, so the
//! parsing lives here and works on DER bytes or OpenSSL references.

use openssl::asn1::Asn1TimeRef;
use openssl::nid::Nid;
use openssl::x509::{X509NameRef, X509Ref, X509};
use std::fmt::Write as _;

/// Details of one certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Full subject name, e.g. "CN=host.example, O=Example"
    pub subject: String,
    /// Subject common name, if present
    pub common_name: Option<String>,
    /// Full issuer name
    pub issuer: String,
    /// Subject Alternative Names ("DNS:..." and "IP:...")
    pub subject_alt_names: Vec<String>,
    pub not_before: String,
    pub not_after: String,
    /// Serial number in hex
    pub serial: String,
}

impl CertInfo {
    /// Extract certificate information from an X.509 certificate reference
    pub fn from_x509(cert: &X509Ref) -> Self {
        CertInfo {
            subject: format_name(cert.subject_name()),
            common_name: common_name(cert.subject_name()),
            issuer: format_name(cert.issuer_name()),
            subject_alt_names: subject_alt_names(cert),
            not_before: format_time(cert.not_before()),
            not_after: format_time(cert.not_after()),
            serial: cert
                .serial_number()
                .to_bn()
                .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
                .unwrap_or_else(|_| "<undef>".to_string()),
        }
    }

    /// Parse a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Option<Self> {
        X509::from_der(der).ok().map(|cert| Self::from_x509(&cert))
    }

    /// Host names the certificate is valid for: the SAN entries, then the
    /// common name, without duplicates
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let sans = self.subject_alt_names.iter().map(|san| {
            san.strip_prefix("DNS:")
                .or_else(|| san.strip_prefix("IP:"))
                .unwrap_or(san)
                .to_string()
        });
        for name in sans.chain(self.common_name.clone()) {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                names.push(name);
            }
        }
        names
    }
}

/// Get Common Name from X509_NAME
fn common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
}

/// Render every entry of a name as "SN=value, SN=value"
fn format_name(name: &X509NameRef) -> String {
    let parts: Vec<String> = name
        .entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| "<undef>".to_string());
            format!("{}={}", key, value)
        })
        .collect();
    if parts.is_empty() {
        "<undef>".to_string()
    } else {
        parts.join(", ")
    }
}

fn format_time(time: &Asn1TimeRef) -> String {
    time.to_string()
}

/// Get Subject Alternative Names
fn subject_alt_names(cert: &X509Ref) -> Vec<String> {
    let mut names = Vec::new();

    if let Some(san_ext) = cert.subject_alt_names() {
        for name in san_ext {
            if let Some(dns) = name.dnsname() {
                names.push(format!("DNS:{}", dns));
            } else if let Some(ip) = name.ipaddress() {
                if let Ok(octets) = <[u8; 4]>::try_from(ip) {
                    names.push(format!("IP:{}", std::net::Ipv4Addr::from(octets)));
                } else if let Ok(octets) = <[u8; 16]>::try_from(ip) {
                    names.push(format!("IP:{}", std::net::Ipv6Addr::from(octets)));
                }
            }
        }
    }

    names
}

/// Multi-line description of a certificate chain, leaf first
pub fn describe_chain(chain: &[CertInfo]) -> String {
    let mut out = String::new();
    for (index, cert) in chain.iter().enumerate() {
        let label = if index == 0 {
            "Host certificate".to_string()
        } else {
            format!("Issuer certificate {}", index)
        };
        let _ = writeln!(out, "{}:", label);
        let _ = writeln!(out, " Subject: {}", cert.subject);
        let _ = writeln!(out, " Issuer: {}", cert.issuer);
        let _ = writeln!(out, " Serial: {}", cert.serial);
        let _ = writeln!(out, " Valid from: {}", cert.not_before);
        let _ = writeln!(out, " Valid until: {}", cert.not_after);
        if !cert.subject_alt_names.is_empty() {
            let _ = writeln!(out, " Alternate names: {}", cert.subject_alt_names.join(", "));
        }
    }
    out
}

/// Extract certificate chain information from an SSL connection
pub fn get_cert_chain(ssl: &openssl::ssl::SslRef) -> Vec<CertInfo> {
    let mut chain = Vec::new();

    // Peer certificate (index 0)
    let peer = ssl.peer_certificate();
    if let Some(ref peer_cert) = peer {
        chain.push(CertInfo::from_x509(peer_cert));
    }

    // Chain (index 1+). Client side chains include the leaf, skip it.
    if let Some(cert_chain) = ssl.peer_cert_chain() {
        for cert in cert_chain {
            let is_leaf = peer
                .as_ref()
                .map_or(false, |leaf| leaf.to_der().ok() == cert.to_der().ok());
            if !is_leaf {
                chain.push(CertInfo::from_x509(cert));
            }
        }
    }

    chain
}

/// Extract certificate chain information from DER certificates, leaf first
pub fn chain_from_der<'a>(certs: impl IntoIterator<Item = &'a [u8]>) -> Vec<CertInfo> {
    certs.into_iter().filter_map(CertInfo::from_der).collect()
}

/// DER encoding of a certificate's issuer name
pub fn issuer_der(cert_der: &[u8]) -> Option<Vec<u8>> {
    X509::from_der(cert_der)
        .ok()
        .and_then(|cert| cert.issuer_name().to_der().ok())
}

/// Whether `hint` names `name_der`. Handshake messages may carry a
/// distinguished name with or without its outer SEQUENCE header.
pub fn name_matches(name_der: &[u8], hint: &[u8]) -> bool {
    name_der == hint || strip_sequence(name_der) == Some(hint)
}

fn strip_sequence(der: &[u8]) -> Option<&[u8]> {
    if der.len() < 2 || der[0] != 0x30 {
        return None;
    }
    let (len, offset) = match der[1] {
        n if n < 0x80 => (n as usize, 2),
        0x81 => (*der.get(2)? as usize, 3),
        0x82 => (((*der.get(2)? as usize) << 8) | *der.get(3)? as usize, 4),
        _ => return None,
    };
    der.get(offset..offset + len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cert() -> X509 {
        let mut params =
            rcgen::CertificateParams::new(vec!["example.com".to_string(), "*.example.com".to_string()])
                .unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "example.com");
        params
            .subject_alt_names
            .push(rcgen::SanType::IpAddress("127.0.0.1".parse().unwrap()));
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        X509::from_der(cert.der()).unwrap()
    }

    #[test]
    fn test_cert_info_from_self_signed() {
        let cert = test_cert();
        let info = CertInfo::from_x509(&cert);

        assert_eq!(info.common_name.as_deref(), Some("example.com"));
        assert!(info.subject.contains("CN=example.com"));
        assert_eq!(info.subject, info.issuer); // Self-signed

        assert!(info.subject_alt_names.contains(&"DNS:example.com".to_string()));
        assert!(info.subject_alt_names.contains(&"DNS:*.example.com".to_string()));
        assert!(info.subject_alt_names.contains(&"IP:127.0.0.1".to_string()));
    }

    #[test]
    fn test_names_are_deduplicated() {
        let info = CertInfo::from_x509(&test_cert());
        let names = info.names();
        assert_eq!(names, vec!["example.com", "*.example.com", "127.0.0.1"]);
    }

    #[test]
    fn test_describe_chain() {
        let info = CertInfo::from_der(&test_cert().to_der().unwrap()).unwrap();
        let text = describe_chain(&[info.clone(), info]);
        assert!(text.starts_with("Host certificate:\n Subject: CN=example.com"));
        assert!(text.contains("Issuer certificate 1:"));
        assert!(text.contains("Alternate names: DNS:example.com"));
    }

    #[test]
    fn test_issuer_matching() {
        let cert = test_cert();
        let issuer = issuer_der(&cert.to_der().unwrap()).unwrap();
        assert!(name_matches(&issuer, &issuer));
        assert!(name_matches(&issuer, strip_sequence(&issuer).unwrap()));
        assert!(!name_matches(&issuer, b"nope"));
    }
}
