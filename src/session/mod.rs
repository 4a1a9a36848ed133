//! Passphrase session
//!
//! The passphrase and the key material derived from it live only inside a
//! [`PassphraseSession`] and are never persisted or logged.
//! Ending the session scrubs both; crypto operations started afterwards
//! fail with [`Error::NoActiveSession`].

mod identity;
mod policy;
mod setup;

pub use identity::{SessionHandle, SessionProvider, SharedIdentity};
pub use policy::{NonEmptyPolicy, PassphrasePolicy, StrengthPolicy};
pub use setup::{SetupEvent, SetupState, Transition};

use crate::config::EncryptionConfig;
use crate::crypto::VaultKeyMaterial;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

struct SessionInner {
    passphrase: Zeroizing<String>,
    keys: Option<Arc<VaultKeyMaterial>>,
}

/// In-memory passphrase session
///
/// Cloning yields another handle to the same session; [`end`](Self::end)
/// on any handle ends it for all of them.
#[derive(Clone)]
pub struct PassphraseSession {
    inner: Arc<RwLock<Option<SessionInner>>>,
}

impl PassphraseSession {
    /// Start a session after checking the passphrase against `policy`
    pub fn begin(passphrase: impl Into<String>, policy: &dyn PassphrasePolicy) -> Result<Self> {
        let passphrase = Zeroizing::new(passphrase.into());

        let violations = policy.violations(&passphrase);
        if !violations.is_empty() {
            return Err(Error::WeakPassphrase(violations));
        }

        debug!("Passphrase session started");
        Ok(PassphraseSession {
            inner: Arc::new(RwLock::new(Some(SessionInner {
                passphrase,
                keys: None,
            }))),
        })
    }

    /// Whether the session has not been ended
    pub fn is_active(&self) -> bool {
        self.inner.read().is_some()
    }

    /// Derive the vault key material from the session passphrase and
    /// `salt`, and keep it for the rest of the session.
    ///
    /// Runs Argon2 without holding the session lock.
    pub fn derive_keys(&self, salt: &[u8], config: &EncryptionConfig) -> Result<Arc<VaultKeyMaterial>> {
        let passphrase = {
            let guard = self.inner.read();
            let inner = guard.as_ref().ok_or(Error::NoActiveSession)?;
            inner.passphrase.clone()
        };

        let keys = Arc::new(VaultKeyMaterial::derive(passphrase.as_bytes(), salt, config)?);

        let mut guard = self.inner.write();
        let inner = guard.as_mut().ok_or(Error::NoActiveSession)?;
        inner.keys = Some(Arc::clone(&keys));
        Ok(keys)
    }

    /// Key material for the active session
    pub fn keys(&self) -> Result<Arc<VaultKeyMaterial>> {
        self.inner
            .read()
            .as_ref()
            .and_then(|inner| inner.keys.clone())
            .ok_or(Error::NoActiveSession)
    }

    /// End the session, scrubbing the passphrase and key material
    pub fn end(&self) {
        if self.inner.write().take().is_some() {
            debug!("Passphrase session ended");
        }
    }
}

impl fmt::Debug for PassphraseSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassphraseSession")
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
