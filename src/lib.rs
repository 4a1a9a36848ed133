//! cardvault - Passphrase-encrypted card vault
//!
//! Card records (payment cards, IDs, loyalty cards) are encrypted on the
//! device with a key derived from a passphrase only the user knows, stored
//! as one object per card on an untrusted remote store, and reconciled with
//! the local working set in pull and push passes.

pub mod card;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod session;
pub mod storage;
pub mod sync;
pub mod usage;
pub mod vault;

pub use config::VaultConfig;
pub use error::{Error, Result};
pub use vault::Vault;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::card::{Card, CardCategory, CardImage};
    pub use crate::config::VaultConfig;
    pub use crate::error::{Error, FailureKind, Result};
    pub use crate::session::{SessionHandle, SetupEvent, SetupState, SharedIdentity};
    pub use crate::sync::{SyncAction, SyncOutcome, SyncReport};
    pub use crate::usage::UsageReport;
    pub use crate::vault::Vault;
}
