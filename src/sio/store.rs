//! File-based client certificate store
//!
//! A directory of PEM bundles, one per identity. `<name>.pem` holds the
//! client certificate, any intermediates and the private key; `<name>` is
//! the friendly name used by the `client-cert` option.

use super::cert;
use super::error::TlsError;
use rustls::pki_types::CertificateDer;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// One identity in the store
#[derive(Debug, Clone)]
pub struct StoreEntry {
    /// Friendly name (file stem)
    pub name: String,
    /// Path of the PEM bundle
    pub path: PathBuf,
    /// Certificates, leaf first
    pub chain: Vec<CertificateDer<'static>>,
}

impl StoreEntry {
    fn load(path: &Path) -> Result<Self, TlsError> {
        let data = fs::read(path)
            .map_err(|e| TlsError::config(format!("Cannot read {}: {}", path.display(), e)))?;
        let chain = rustls_pemfile::certs(&mut BufReader::new(&data[..]))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::config(format!("Invalid certificate in {}: {}", path.display(), e)))?;
        if chain.is_empty() {
            return Err(TlsError::config(format!("No certificate in {}", path.display())));
        }
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(StoreEntry {
            name,
            path: path.to_path_buf(),
            chain,
        })
    }

    /// DER issuer name of the leaf certificate
    pub fn issuer(&self) -> Option<Vec<u8>> {
        self.chain.first().and_then(|leaf| cert::issuer_der(leaf.as_ref()))
    }
}

/// A directory of identity bundles
#[derive(Debug, Clone)]
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        CertStore {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Look an identity up by friendly name. Names are plain file stems;
    /// anything that could leave the store directory is rejected.
    pub fn find_by_name(&self, name: &str) -> Result<StoreEntry, TlsError> {
        if name.is_empty() || name.contains(['/', '\\', '\0']) || name.contains("..") {
            return Err(TlsError::config(format!("Invalid client certificate name '{}'", name)));
        }
        let path = self.dir.join(format!("{}.pem", name));
        if !path.is_file() {
            return Err(TlsError::config(format!(
                "Client certificate '{}' not found in {}",
                name,
                self.dir.display()
            )));
        }
        StoreEntry::load(&path)
    }

    /// First identity whose leaf was issued by one of `issuers` (DER names,
    /// with or without the outer SEQUENCE)
    pub fn find_by_issuer(&self, issuers: &[&[u8]]) -> Option<StoreEntry> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %self.dir.display(), error = %e, "certificate store unavailable");
                return None;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "pem"))
            .collect();
        paths.sort();

        paths.iter().find_map(|path| {
            let entry = StoreEntry::load(path).ok()?;
            let issuer = entry.issuer()?;
            issuers
                .iter()
                .any(|hint| cert::name_matches(&issuer, hint))
                .then_some(entry)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_identity(dir: &Path, name: &str, ca: &rcgen::CertifiedKey) -> Vec<u8> {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![format!("{}.client", name)]).unwrap();
        let cert = params.signed_by(&key, &ca.cert, &ca.key_pair).unwrap();
        let bundle = format!("{}{}", cert.pem(), key.serialize_pem());
        fs::write(dir.join(format!("{}.pem", name)), bundle).unwrap();
        cert.der().to_vec()
    }

    fn ca(name: &str) -> rcgen::CertifiedKey {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.distinguished_name.push(rcgen::DnType::CommonName, name);
        let cert = params.self_signed(&key_pair).unwrap();
        rcgen::CertifiedKey { cert, key_pair }
    }

    #[test]
    fn test_lookup_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let ca = ca("Store CA");
        let der = write_identity(dir.path(), "alice", &ca);

        let store = CertStore::new(dir.path());
        let entry = store.find_by_name("alice").unwrap();
        assert_eq!(entry.name, "alice");
        assert_eq!(entry.chain[0].as_ref(), &der[..]);
        assert!(store.find_by_name("bob").is_err());
    }

    #[test]
    fn test_name_cannot_leave_store() {
        let root = tempfile::tempdir().unwrap();
        let store_dir = root.path().join("store");
        fs::create_dir(&store_dir).unwrap();
        let ca = ca("Store CA");
        // A valid bundle one level above the store
        write_identity(root.path(), "outside", &ca);

        let store = CertStore::new(&store_dir);
        for name in ["../outside", "..\\outside", "sub/alice", "..", ""] {
            match store.find_by_name(name) {
                Err(TlsError::Configuration(msg)) => assert!(msg.contains("Invalid"), "{}: {}", name, msg),
                other => panic!("{:?} accepted: {:?}", name, other),
            }
        }
    }

    #[test]
    fn test_lookup_by_issuer() {
        let dir = tempfile::tempdir().unwrap();
        let ca_a = ca("CA A");
        let ca_b = ca("CA B");
        write_identity(dir.path(), "alice", &ca_a);
        write_identity(dir.path(), "bob", &ca_b);

        let store = CertStore::new(dir.path());
        let hint = openssl::x509::X509::from_der(ca_b.cert.der())
            .unwrap()
            .subject_name()
            .to_der()
            .unwrap();
        let entry = store.find_by_issuer(&[hint.as_slice()]).unwrap();
        assert_eq!(entry.name, "bob");

        assert!(store.find_by_issuer(&[&b"unknown"[..]]).is_none());
        assert!(CertStore::new(dir.path().join("missing"))
            .find_by_issuer(&[hint.as_slice()])
            .is_none());
    }
}
