//! Client identity picked from the store when the server asks for one
//!
//! OpenSSL consults the client certificate callback only when no identity
//! is bound to the connection. The callback reads the CA names the server
//! advertised, takes the first store identity issued by one of them and
//! binds it to the connection. A context rebinds at most once.

use super::context::{load_certs, load_key};
use crate::sio::config::FileType;
use crate::sio::error::TlsError;
use crate::sio::store::{CertStore, StoreEntry};
use foreign_types::ForeignTypeRef;
use openssl::error::ErrorStack;
use openssl::ex_data::Index;
use openssl::ssl::{SslContext, SslContextBuilder, SslContextRef, SslRef};
use openssl::stack::StackRef;
use openssl::x509::X509Name;
use openssl_sys as ffi;
use std::fs;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

type ClientCertCallback =
    unsafe extern "C" fn(ssl: *mut ffi::SSL, x509: *mut *mut ffi::X509, pkey: *mut *mut ffi::EVP_PKEY) -> c_int;

extern "C" {
    fn SSL_CTX_set_client_cert_cb(ctx: *mut ffi::SSL_CTX, cb: Option<ClientCertCallback>);
    fn SSL_get_client_CA_list(ssl: *const ffi::SSL) -> *mut ffi::stack_st_X509_NAME;
}

/// Store lookup attached to a client context
#[derive(Debug)]
pub(super) struct StoreRebind {
    store: CertStore,
    password: Option<String>,
    rebinds: AtomicUsize,
}

impl StoreRebind {
    fn bind(&self, ssl: &mut SslRef, issuers: &[Vec<u8>]) -> bool {
        if self.rebinds.load(Ordering::Relaxed) > 0 {
            tracing::debug!("client certificate requested again; already rebound once");
            return false;
        }
        if issuers.is_empty() {
            tracing::debug!("client certificate requested without acceptable issuers");
            return false;
        }

        let hints: Vec<&[u8]> = issuers.iter().map(Vec::as_slice).collect();
        let Some(entry) = self.store.find_by_issuer(&hints) else {
            tracing::debug!("client certificate requested; none matches the advertised issuers");
            return false;
        };

        match use_entry(ssl, &entry, self.password.as_deref()) {
            Ok(()) => {
                tracing::debug!(credential = %entry.name, "client certificate requested; rebinding");
                self.rebinds.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!(credential = %entry.name, error = %e, "matching client certificate unusable");
                false
            }
        }
    }
}

fn use_entry(ssl: &mut SslRef, entry: &StoreEntry, password: Option<&str>) -> Result<(), TlsError> {
    let data = fs::read(&entry.path)
        .map_err(|e| TlsError::config(format!("Cannot read {}: {}", entry.path.display(), e)))?;
    let mut certs = load_certs(&data, FileType::Pem, &entry.path)?.into_iter();
    let key = load_key(&data, FileType::Pem, password)
        .map_err(|e| TlsError::config(format!("Cannot use key in {}: {}", entry.path.display(), e)))?;

    let bind_error = |e: ErrorStack| TlsError::protocol(format!("Cannot bind {}: {}", entry.name, e));
    if let Some(leaf) = certs.next() {
        ssl.set_certificate(&leaf).map_err(bind_error)?;
    }
    for extra in certs {
        ssl.add_chain_cert(extra).map_err(bind_error)?;
    }
    ssl.set_private_key(&key).map_err(bind_error)?;
    Ok(())
}

fn index() -> Result<Index<SslContext, Arc<StoreRebind>>, ErrorStack> {
    static INDEX: OnceLock<Index<SslContext, Arc<StoreRebind>>> = OnceLock::new();
    if let Some(index) = INDEX.get() {
        return Ok(*index);
    }
    let index = SslContext::new_ex_index()?;
    Ok(*INDEX.get_or_init(|| index))
}

/// CA names from the server's certificate request, DER encoded
fn advertised_issuers(ssl: &SslRef) -> Vec<Vec<u8>> {
    // SAFETY: the list is owned by `ssl` and outlives this borrow
    let names = unsafe { SSL_get_client_CA_list(ssl.as_ptr()) };
    if names.is_null() {
        return Vec::new();
    }
    let names = unsafe { StackRef::<X509Name>::from_ptr(names) };
    names.iter().filter_map(|name| name.to_der().ok()).collect()
}

unsafe extern "C" fn client_cert_cb(
    ssl: *mut ffi::SSL,
    _x509: *mut *mut ffi::X509,
    _pkey: *mut *mut ffi::EVP_PKEY,
) -> c_int {
    let ssl = SslRef::from_ptr_mut(ssl);
    let Some(rebind) = index().ok().and_then(|index| ssl.ssl_context().ex_data(index)).cloned() else {
        return 0;
    };
    let issuers = advertised_issuers(ssl);
    // 1 with nothing handed back: OpenSSL uses what was bound to `ssl`
    c_int::from(rebind.bind(ssl, &issuers))
}

/// Search `store` for an identity whenever the server requests one
pub(super) fn install(
    builder: &mut SslContextBuilder,
    store: CertStore,
    password: Option<&str>,
) -> Result<(), TlsError> {
    let index = index().map_err(|e| TlsError::protocol(format!("Cannot attach certificate store: {}", e)))?;
    builder.set_ex_data(
        index,
        Arc::new(StoreRebind {
            store,
            password: password.map(str::to_string),
            rebinds: AtomicUsize::new(0),
        }),
    );
    // SAFETY: the callback only reads data owned by the context it runs in
    unsafe { SSL_CTX_set_client_cert_cb(builder.as_ptr(), Some(client_cert_cb)) };
    Ok(())
}

/// Identities picked from the store for sessions of `ctx`
pub(super) fn rebind_count(ctx: &SslContextRef) -> usize {
    index()
        .ok()
        .and_then(|index| ctx.ex_data(index))
        .map_or(0, |rebind| rebind.rebinds.load(Ordering::Relaxed))
}
