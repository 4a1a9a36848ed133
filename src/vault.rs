//! Vault facade
//!
//! Ties the passphrase session, the storage adapter and the reconciler
//! together behind the operations the application calls.

use crate::card::Card;
use crate::config::{EncryptionConfig, VaultConfig};
use crate::crypto::{generate_salt, CryptoEngine};
use crate::error::{Error, Result};
use crate::session::{
    NonEmptyPolicy, PassphraseSession, SessionProvider, SetupState, StrengthPolicy,
};
use crate::storage::{open_backend, RemoteStore, StorageAdapter, VaultHeader};
use crate::sync::{SyncReconciler, SyncReport, SyncState};
use crate::usage::UsageReport;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// A card vault backed by a remote store
pub struct Vault {
    config: VaultConfig,
    adapter: Arc<StorageAdapter>,
    reconciler: SyncReconciler,
    engine: CryptoEngine,
    session: RwLock<Option<PassphraseSession>>,
    cancel: Mutex<CancellationToken>,
}

impl Vault {
    /// Open a vault on the backend selected in `config`
    pub fn open(config: VaultConfig, identity: Arc<dyn SessionProvider>) -> Result<Self> {
        config.validate()?;
        let store = open_backend(&config.storage)?;
        Ok(Self::with_store(config, store, identity))
    }

    /// Open a vault on an already constructed store
    pub fn with_store(
        config: VaultConfig,
        store: Arc<dyn RemoteStore>,
        identity: Arc<dyn SessionProvider>,
    ) -> Self {
        let adapter = Arc::new(StorageAdapter::new(store, identity, config.storage.clone()));
        let reconciler = SyncReconciler::new(Arc::clone(&adapter), config.sync.clone());
        Vault {
            config,
            adapter,
            reconciler,
            engine: CryptoEngine::new(),
            session: RwLock::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Whether the remote store already holds a vault
    pub async fn is_initialized(&self) -> Result<bool> {
        Ok(self.adapter.read_header().await?.is_some())
    }

    /// Create the vault from a completed passphrase setup and leave it
    /// unlocked.
    ///
    /// Fails with `InvalidTransition` unless `setup` is committed, and with
    /// `VaultAlreadyInitialized` if the remote store already holds a vault.
    pub async fn setup_passphrase(&self, setup: SetupState) -> Result<()> {
        let stage = setup.stage();
        let passphrase = setup.into_passphrase().ok_or_else(|| {
            Error::InvalidTransition(format!("setup is at {} and not committed", stage))
        })?;

        let policy = StrengthPolicy::from_config(&self.config.passphrase);
        let session = PassphraseSession::begin(passphrase.as_str(), &policy)?;
        drop(passphrase);

        if self.adapter.read_header().await?.is_some() {
            session.end();
            return Err(Error::VaultAlreadyInitialized);
        }

        let salt = if self.config.encryption.salt.is_empty() {
            generate_salt().to_vec()
        } else {
            self.config.encryption.salt.clone()
        };
        let kdf = EncryptionConfig {
            salt: salt.clone(),
            ..self.config.encryption.clone()
        };

        let created = async {
            derive_keys(&session, &salt, &kdf).await?;
            let verifier = self.engine.seal_verifier(&session)?;
            self.adapter
                .write_header(&VaultHeader::new(salt.clone(), &kdf, verifier))
                .await
        }
        .await;
        if let Err(e) = created {
            session.end();
            return Err(e);
        }

        self.reconciler.clear_local();
        self.install_session(session);
        info!("Vault created");
        Ok(())
    }

    /// Start a session for an existing vault.
    ///
    /// The passphrase is checked against the header verifier, so a wrong
    /// passphrase fails here with `AuthenticationFailed` rather than on
    /// every record later.
    pub async fn unlock(&self, passphrase: impl Into<String>) -> Result<()> {
        let session = PassphraseSession::begin(passphrase, &NonEmptyPolicy)?;

        let unlocked = async {
            let header = self
                .adapter
                .read_header()
                .await?
                .ok_or(Error::VaultNotInitialized)?;
            derive_keys(&session, &header.salt, &header.encryption_config()).await?;
            self.engine.check_verifier(&session, &header.verifier)
        }
        .await;

        if let Err(e) = unlocked {
            session.end();
            warn!("Unlock failed: {}", e);
            return Err(e);
        }

        self.install_session(session);
        info!("Vault unlocked");
        Ok(())
    }

    fn install_session(&self, session: PassphraseSession) {
        if let Some(previous) = self.session.write().replace(session) {
            previous.end();
        }
    }

    /// End the session, cancel any running pass and drop the local cards
    pub fn lock(&self) {
        self.cancel_sync();
        if let Some(session) = self.session.write().take() {
            session.end();
        }
        self.reconciler.clear_local();
        info!("Vault locked");
    }

    pub fn is_unlocked(&self) -> bool {
        self.session
            .read()
            .as_ref()
            .map_or(false, PassphraseSession::is_active)
    }

    fn session(&self) -> Result<PassphraseSession> {
        self.session
            .read()
            .clone()
            .ok_or(Error::NoActiveSession)
    }

    /// Token for a new pass, cancelled by [`cancel_sync`](Self::cancel_sync)
    fn pass_token(&self) -> CancellationToken {
        self.cancel.lock().child_token()
    }

    /// Cancel the running pass, if any. Later passes are unaffected.
    pub fn cancel_sync(&self) {
        let previous = std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new());
        previous.cancel();
    }

    pub fn sync_state(&self) -> SyncState {
        self.reconciler.state()
    }

    /// Replace the local cards with the decrypted remote records
    pub async fn pull_all(&self) -> Result<SyncReport> {
        let session = self.session()?;
        let cancel = self.pass_token();
        self.reconciler.pull_all(&session, &cancel).await
    }

    /// Make the remote store mirror the local cards
    pub async fn push_all(&self) -> Result<SyncReport> {
        let session = self.session()?;
        let cancel = self.pass_token();
        let cards = self.reconciler.cards();
        self.reconciler.push_all(&cards, &session, &cancel).await
    }

    /// Re-run the failed items of an earlier pass
    pub async fn retry_failed(&self, report: &SyncReport) -> Result<SyncReport> {
        let session = self.session()?;
        let cancel = self.pass_token();
        self.reconciler.retry_failed(report, &session, &cancel).await
    }

    /// Snapshot of the local cards
    pub fn cards(&self) -> Arc<[Card]> {
        self.reconciler.cards()
    }

    pub fn card(&self, id: &Uuid) -> Option<Card> {
        self.cards().iter().find(|c| c.id == *id).cloned()
    }

    /// Replace the whole local card set
    pub fn replace_local(&self, cards: Vec<Card>) -> Result<()> {
        self.session()?;
        self.reconciler.replace_local(cards);
        Ok(())
    }

    /// Add a card locally, or replace the one with the same id
    pub fn save_card(&self, mut card: Card) -> Result<()> {
        self.session()?;
        card.touch();
        let mut cards: Vec<Card> = self
            .cards()
            .iter()
            .filter(|c| c.id != card.id)
            .cloned()
            .collect();
        cards.push(card);
        self.reconciler.replace_local(cards);
        Ok(())
    }

    /// Remove a card locally; the next push deletes it remotely
    pub fn delete_card(&self, id: &Uuid) -> Result<bool> {
        self.session()?;
        let snapshot = self.cards();
        let cards: Vec<Card> = snapshot.iter().filter(|c| c.id != *id).cloned().collect();
        let removed = cards.len() != snapshot.len();
        self.reconciler.replace_local(cards);
        Ok(removed)
    }

    /// Remote storage usage, from listing metadata only
    pub async fn usage(&self) -> Result<UsageReport> {
        let stats = self.adapter.usage().await?;
        Ok(UsageReport::new(stats, self.config.storage.quota_bytes))
    }
}

/// Run Argon2 off the async runtime
async fn derive_keys(session: &PassphraseSession, salt: &[u8], config: &EncryptionConfig) -> Result<()> {
    let session = session.clone();
    let salt = salt.to_vec();
    let config = config.clone();
    tokio::task::spawn_blocking(move || session.derive_keys(&salt, &config).map(|_| ()))
        .await
        .map_err(|e| Error::Internal(format!("Key derivation task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::CardCategory;
    use crate::session::{SessionHandle, SetupEvent, SharedIdentity};
    use crate::storage::MemoryStore;

    const PASSPHRASE: &str = "Correct-Horse-9-Battery";

    fn test_config() -> VaultConfig {
        let mut config = VaultConfig::default();
        config.encryption.argon2_memory_kib = 1024;
        config.encryption.argon2_iterations = 1;
        config.encryption.argon2_parallelism = 1;
        config
    }

    fn committed(passphrase: &str) -> SetupState {
        let policy = StrengthPolicy::default();
        let mut state = SetupState::new();
        for event in [
            SetupEvent::Start,
            SetupEvent::propose(passphrase),
            SetupEvent::confirm(passphrase),
            SetupEvent::Acknowledge(true),
        ] {
            let transition = state.apply(event, &policy);
            assert!(transition.is_accepted());
            state = transition.state;
        }
        state
    }

    fn vault(store: Arc<MemoryStore>) -> Vault {
        let identity = SharedIdentity::signed_in(SessionHandle::new("token"));
        Vault::with_store(test_config(), store, Arc::new(identity))
    }

    #[tokio::test]
    async fn test_setup_then_unlock() {
        let store = Arc::new(MemoryStore::new());
        let vault = vault(store.clone());
        assert!(!vault.is_initialized().await.unwrap());

        vault.setup_passphrase(committed(PASSPHRASE)).await.unwrap();
        assert!(vault.is_unlocked());
        assert!(vault.is_initialized().await.unwrap());

        vault.lock();
        assert!(!vault.is_unlocked());
        assert!(matches!(vault.pull_all().await, Err(Error::NoActiveSession)));

        vault.unlock(PASSPHRASE).await.unwrap();
        assert!(vault.is_unlocked());
    }

    #[tokio::test]
    async fn test_setup_requires_committed_state() {
        let vault = vault(Arc::new(MemoryStore::new()));
        let result = vault.setup_passphrase(SetupState::new()).await;
        assert!(matches!(result, Err(Error::InvalidTransition(_))));
        assert!(!vault.is_initialized().await.unwrap());
    }

    #[tokio::test]
    async fn test_second_setup_rejected() {
        let store = Arc::new(MemoryStore::new());
        vault(store.clone())
            .setup_passphrase(committed(PASSPHRASE))
            .await
            .unwrap();

        let other = vault(store);
        let result = other.setup_passphrase(committed("Another-Pass-42")).await;
        assert!(matches!(result, Err(Error::VaultAlreadyInitialized)));
        assert!(!other.is_unlocked());
    }

    #[tokio::test]
    async fn test_unlock_wrong_passphrase() {
        let store = Arc::new(MemoryStore::new());
        vault(store.clone())
            .setup_passphrase(committed(PASSPHRASE))
            .await
            .unwrap();

        let other = vault(store);
        let result = other.unlock("not the passphrase").await;
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
        assert!(!other.is_unlocked());
    }

    #[tokio::test]
    async fn test_unlock_uninitialized() {
        let vault = vault(Arc::new(MemoryStore::new()));
        assert!(matches!(
            vault.unlock(PASSPHRASE).await,
            Err(Error::VaultNotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_local_edits() {
        let vault = vault(Arc::new(MemoryStore::new()));
        let card = Card::new(CardCategory::Credit, "Everyday");
        assert!(matches!(
            vault.save_card(card.clone()),
            Err(Error::NoActiveSession)
        ));

        vault.setup_passphrase(committed(PASSPHRASE)).await.unwrap();
        vault.save_card(card.clone()).unwrap();
        assert_eq!(vault.cards().len(), 1);

        let mut renamed = card.clone();
        renamed.nickname = "Groceries".to_string();
        vault.save_card(renamed).unwrap();
        assert_eq!(vault.card(&card.id).unwrap().nickname, "Groceries");

        assert!(vault.delete_card(&card.id).unwrap());
        assert!(!vault.delete_card(&card.id).unwrap());
        assert!(vault.cards().is_empty());
    }

    #[tokio::test]
    async fn test_lock_clears_cards() {
        let vault = vault(Arc::new(MemoryStore::new()));
        vault.setup_passphrase(committed(PASSPHRASE)).await.unwrap();
        vault
            .save_card(Card::new(CardCategory::Loyalty, "Library"))
            .unwrap();
        vault.lock();
        assert!(vault.cards().is_empty());
    }
}
