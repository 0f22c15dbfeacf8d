//! Sticky credential-strategy pin
//!
//! Some providers reject the preferred way of building a credential with a
//! recognizable "unknown structure" status. When that happens the backend
//! falls back to the legacy strategy and pins it for the rest of the
//! process. The preferred strategy is never probed again.

use std::sync::atomic::{AtomicBool, Ordering};

/// Forces the legacy strategy when set to a non-empty value other than "0"
pub const LEGACY_ENV: &str = "SECIO_LEGACY_CREDENTIALS";

/// How a backend builds its credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStrategy {
    /// Protocol range set through explicit version bounds
    Preferred,
    /// Protocol range set by disabling individual versions
    Legacy,
}

impl CredentialStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStrategy::Preferred => "preferred",
            CredentialStrategy::Legacy => "legacy",
        }
    }
}

static LEGACY_PINNED: AtomicBool = AtomicBool::new(false);

fn forced_by_env() -> bool {
    std::env::var(LEGACY_ENV)
        .map(|value| !value.is_empty() && value != "0")
        .unwrap_or(false)
}

/// Strategy to try for the next credential
pub fn current() -> CredentialStrategy {
    if LEGACY_PINNED.load(Ordering::Relaxed) || forced_by_env() {
        CredentialStrategy::Legacy
    } else {
        CredentialStrategy::Preferred
    }
}

/// Pin the legacy strategy for the rest of the process.
///
/// Returns `true` only for the call that performed the downgrade.
pub fn pin_legacy() -> bool {
    let downgraded = !LEGACY_PINNED.swap(true, Ordering::Relaxed);
    if downgraded {
        tracing::warn!("credential strategy rejected by provider; using legacy strategy from now on");
    }
    downgraded
}

/// Whether the downgrade has happened in this process
pub fn is_pinned() -> bool {
    LEGACY_PINNED.load(Ordering::Relaxed)
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    LEGACY_PINNED.store(false, Ordering::Relaxed);
}

/// Serializes tests that pin or reset the process-wide strategy
#[cfg(test)]
pub(crate) fn lock_for_test() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
