//! Reconciliation between the local card set and the remote store
//!
//! A pass is either a pull (remote → local) or a push (local → remote).
//! Items within a pass run concurrently up to `SyncConfig::max_concurrency`;
//! each one yields a [`SyncOutcome`], so one bad record never aborts the
//! rest. Only one pass runs at a time per reconciler.

mod report;

pub use report::{PassKind, SyncAction, SyncOutcome, SyncReport, SyncState};

use crate::card::{Card, CardImage, CardPayload};
use crate::config::SyncConfig;
use crate::crypto::CryptoEngine;
use crate::error::{Error, FailureKind, Result};
use crate::session::PassphraseSession;
use crate::storage::{RecordMeta, RemoteId, StorageAdapter};
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Marks a pass as running; dropping it makes the reconciler available again
struct PassGuard<'a> {
    reconciler: &'a SyncReconciler,
}

impl PassGuard<'_> {
    fn finish(self, state: SyncState) {
        *self.reconciler.state.write() = state;
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        {
            // A pass future dropped mid-way ends up Idle
            let mut state = self.reconciler.state.write();
            if *state == SyncState::Running {
                *state = SyncState::Idle;
            }
        }
        self.reconciler.running.store(false, Ordering::SeqCst);
    }
}

/// Pull/push engine holding the local card snapshot
pub struct SyncReconciler {
    adapter: Arc<StorageAdapter>,
    engine: CryptoEngine,
    config: SyncConfig,
    running: AtomicBool,
    state: RwLock<SyncState>,
    cache: RwLock<Arc<[Card]>>,
}

impl SyncReconciler {
    pub fn new(adapter: Arc<StorageAdapter>, config: SyncConfig) -> Self {
        SyncReconciler {
            adapter,
            engine: CryptoEngine::new(),
            config,
            running: AtomicBool::new(false),
            state: RwLock::new(SyncState::Idle),
            cache: RwLock::new(Arc::from(Vec::new())),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Immutable snapshot of the local cards
    pub fn cards(&self) -> Arc<[Card]> {
        Arc::clone(&self.cache.read())
    }

    /// Replace the local card set, e.g. after the user edited a card
    pub fn replace_local(&self, cards: Vec<Card>) {
        self.swap_cache(cards);
    }

    /// Drop every local card
    pub fn clear_local(&self) {
        self.swap_cache(Vec::new());
    }

    fn swap_cache(&self, mut cards: Vec<Card>) {
        cards.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        *self.cache.write() = Arc::from(cards);
    }

    fn begin(&self) -> Result<PassGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::SyncAlreadyInProgress);
        }
        *self.state.write() = SyncState::Running;
        Ok(PassGuard { reconciler: self })
    }

    fn concurrency(&self) -> usize {
        self.config.max_concurrency.max(1)
    }

    fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.config.item_timeout_ms)
    }

    /// Run one item unless the pass was cancelled, bounded by the item timeout
    async fn run_item<T, F>(&self, cancel: &CancellationToken, item: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let timeout = self.item_timeout();
        match tokio::time::timeout(timeout, item).await {
            Ok(result) => result,
            Err(_) => Err(Error::NetworkFailure(format!("Timed out after {:?}", timeout))),
        }
    }

    async fn list_remote(&self) -> Result<Vec<RecordMeta>> {
        self.adapter.list().try_collect().await
    }

    /// Download and decrypt every remote record, then swap the local
    /// snapshot for the result.
    ///
    /// Records that fail are left out of the snapshot and reported. If the
    /// listing fails the snapshot is untouched and the error is returned; if
    /// the pass is cancelled the snapshot is untouched and the skipped
    /// records are reported as cancelled.
    pub async fn pull_all(
        &self,
        session: &PassphraseSession,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        session.keys()?;
        let guard = self.begin()?;
        self.pull_pass(guard, session, cancel).await
    }

    /// A full pull under an already acquired pass
    async fn pull_pass(
        &self,
        guard: PassGuard<'_>,
        session: &PassphraseSession,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let started_at = Utc::now();

        let remote = match self.list_remote().await {
            Ok(remote) => remote,
            Err(e) => {
                error!("Pull aborted, listing failed: {}", e);
                guard.finish(SyncState::Failed);
                return Err(e);
            }
        };
        info!("Pulling {} records", remote.len());

        let results: Vec<(SyncOutcome, Option<Card>)> = stream::iter(remote)
            .map(|meta| self.pull_one(meta.remote_id, session, cancel))
            .buffer_unordered(self.concurrency())
            .collect()
            .await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut cards = Vec::with_capacity(results.len());
        for (outcome, card) in results {
            outcomes.push(outcome);
            cards.extend(card);
        }

        let report = SyncReport::new(PassKind::Pull, started_at, outcomes);
        if report.count_failed(FailureKind::Cancelled) > 0 {
            warn!("Pull cancelled, local cards left unchanged");
        } else {
            self.swap_cache(cards);
        }

        guard.finish(SyncState::Idle);
        info!("{}", report);
        Ok(report)
    }

    async fn pull_one(
        &self,
        id: RemoteId,
        session: &PassphraseSession,
        cancel: &CancellationToken,
    ) -> (SyncOutcome, Option<Card>) {
        let result = self.run_item(cancel, self.fetch_card(&id, session)).await;
        match result {
            Ok(card) => {
                debug!("Fetched {}", id);
                let outcome = SyncOutcome::Ok {
                    id,
                    action: SyncAction::Fetched,
                };
                (outcome, Some(card))
            }
            Err(e) => {
                warn!("Failed to pull {}: {}", id, e);
                (SyncOutcome::failed(id, SyncAction::Fetched, &e), None)
            }
        }
    }

    async fn fetch_card(&self, id: &RemoteId, session: &PassphraseSession) -> Result<Card> {
        let record = self.adapter.fetch(id).await?;
        let plaintext = self
            .engine
            .open_record(session, id.as_str(), &record.envelope())?;

        let payload: CardPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::MalformedInput(format!("Undecodable record payload: {}", e)))?;
        if RemoteId::for_card(&payload.id) != *id {
            return Err(Error::MalformedInput(format!(
                "Record {} holds card {}",
                id, payload.id
            )));
        }

        let envelopes = self.adapter.fetch_assets(id, &payload.assets).await?;
        let mut images = Vec::with_capacity(envelopes.len());
        for (asset, envelope) in payload.assets.iter().zip(envelopes) {
            let bytes = self
                .engine
                .open_asset(session, id.as_str(), &asset.object_name(), &envelope)?;
            if bytes.len() as u64 != asset.len {
                return Err(Error::MalformedInput(format!(
                    "Image {} of record {} has unexpected length",
                    asset.id, id
                )));
            }
            images.push(CardImage {
                id: asset.id,
                mime_type: asset.mime_type.clone(),
                bytes: bytes.to_vec(),
            });
        }

        Ok(payload.into_card(images))
    }

    /// Make the remote store hold exactly `cards`.
    ///
    /// Every card is stored (unchanged ones cause no write), then every
    /// remote record without a local card is removed, along with images
    /// left behind by records that were never written. All stores finish
    /// before the first removal starts. When the same card id appears more
    /// than once the last occurrence wins.
    pub async fn push_all(
        &self,
        cards: &[Card],
        session: &PassphraseSession,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        session.keys()?;
        let guard = self.begin()?;
        let started_at = Utc::now();

        let listing = async {
            let records = self.list_remote().await?;
            let owners = self.adapter.asset_owners().await?;
            Ok::<_, Error>((records, owners))
        }
        .await;
        let (remote, owners): (HashMap<RemoteId, RecordMeta>, BTreeSet<RemoteId>) = match listing {
            Ok((records, owners)) => (
                records
                    .into_iter()
                    .map(|meta| (meta.remote_id.clone(), meta))
                    .collect(),
                owners,
            ),
            Err(e) => {
                error!("Push aborted, listing failed: {}", e);
                guard.finish(SyncState::Failed);
                return Err(e);
            }
        };

        let mut local: BTreeMap<RemoteId, &Card> = BTreeMap::new();
        for card in cards {
            if local.insert(RemoteId::for_card(&card.id), card).is_some() {
                debug!("Card {} listed twice, keeping the last copy", card.id);
            }
        }
        info!("Pushing {} cards against {} remote records", local.len(), remote.len());

        let mut outcomes: Vec<SyncOutcome> = stream::iter(local.iter())
            .map(|(id, card)| self.store_one(id.clone(), card, remote.get(id), session, cancel))
            .buffer_unordered(self.concurrency())
            .collect()
            .await;

        let orphans: BTreeSet<RemoteId> = remote
            .keys()
            .cloned()
            .chain(owners)
            .filter(|id| !local.contains_key(id))
            .collect();
        let removals: Vec<SyncOutcome> = stream::iter(orphans)
            .map(|id| self.remove_one(id, cancel))
            .buffer_unordered(self.concurrency())
            .collect()
            .await;
        outcomes.extend(removals);

        let pending = failed_stores(&outcomes, |id| local.get(id).map(|card| (*card).clone()));
        guard.finish(SyncState::Idle);
        let report = SyncReport::new(PassKind::Push, started_at, outcomes).with_pending(pending);
        info!("{}", report);
        Ok(report)
    }

    async fn store_one(
        &self,
        id: RemoteId,
        card: &Card,
        known: Option<&RecordMeta>,
        session: &PassphraseSession,
        cancel: &CancellationToken,
    ) -> SyncOutcome {
        let store = self.adapter.store(card, &self.engine, session, known);
        match self.run_item(cancel, store).await {
            Ok(outcome) => SyncOutcome::Ok {
                id,
                action: if outcome.written {
                    SyncAction::Stored
                } else {
                    SyncAction::Unchanged
                },
            },
            Err(e) => {
                warn!("Failed to store {}: {}", id, e);
                SyncOutcome::failed(id, SyncAction::Stored, &e)
            }
        }
    }

    async fn remove_one(&self, id: RemoteId, cancel: &CancellationToken) -> SyncOutcome {
        let result = self.run_item(cancel, self.adapter.remove(&id)).await;
        match result {
            Ok(_) => SyncOutcome::Ok {
                id,
                action: SyncAction::Removed,
            },
            Err(e) => {
                warn!("Failed to remove {}: {}", id, e);
                SyncOutcome::failed(id, SyncAction::Removed, &e)
            }
        }
    }

    /// Re-run the items a previous report lists as failed.
    ///
    /// For a pull the records are fetched again and merged into the local
    /// snapshot, unless the pull was cancelled: its snapshot was never
    /// committed, so a full pull runs instead. For a push every item repeats
    /// the action that failed; stores use the card the push was given.
    pub async fn retry_failed(
        &self,
        previous: &SyncReport,
        session: &PassphraseSession,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        session.keys()?;
        let guard = self.begin()?;
        if previous.pass == PassKind::Pull && previous.count_failed(FailureKind::Cancelled) > 0 {
            info!("Previous pull was cancelled, pulling every record again");
            return self.pull_pass(guard, session, cancel).await;
        }

        let started_at = Utc::now();
        let failures: Vec<(RemoteId, SyncAction)> = previous
            .outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                SyncOutcome::Failed { id, attempted, .. } => Some((id.clone(), *attempted)),
                SyncOutcome::Ok { .. } => None,
            })
            .collect();
        info!("Retrying {} failed items of a {:?} pass", failures.len(), previous.pass);

        let (outcomes, pending) = match previous.pass {
            PassKind::Pull => {
                let results: Vec<(SyncOutcome, Option<Card>)> = stream::iter(failures)
                    .map(|(id, _)| self.pull_one(id, session, cancel))
                    .buffer_unordered(self.concurrency())
                    .collect()
                    .await;

                let mut outcomes = Vec::with_capacity(results.len());
                let mut fetched = Vec::new();
                for (outcome, card) in results {
                    outcomes.push(outcome);
                    fetched.extend(card);
                }

                let fetched_ids: HashSet<Uuid> = fetched.iter().map(|c| c.id).collect();
                let mut merged: Vec<Card> = self
                    .cards()
                    .iter()
                    .filter(|c| !fetched_ids.contains(&c.id))
                    .cloned()
                    .collect();
                merged.extend(fetched);
                self.swap_cache(merged);
                (outcomes, Vec::new())
            }
            PassKind::Push => {
                let mut outcomes = Vec::new();
                let mut stores = Vec::new();
                let mut removes = Vec::new();
                for (id, attempted) in failures {
                    if attempted == SyncAction::Removed {
                        removes.push(id);
                    } else if let Some(card) = previous.pending_card(&id) {
                        stores.push((id, card));
                    } else {
                        let error = Error::NotFound(format!("No card kept to store {}", id));
                        outcomes.push(SyncOutcome::failed(id, SyncAction::Stored, &error));
                    }
                }

                let stored: Vec<SyncOutcome> = stream::iter(stores)
                    .map(|(id, card)| self.store_one(id, card, None, session, cancel))
                    .buffer_unordered(self.concurrency())
                    .collect()
                    .await;
                outcomes.extend(stored);
                let removals: Vec<SyncOutcome> = stream::iter(removes)
                    .map(|id| self.remove_one(id, cancel))
                    .buffer_unordered(self.concurrency())
                    .collect()
                    .await;
                outcomes.extend(removals);

                let pending = failed_stores(&outcomes, |id| previous.pending_card(id).cloned());
                (outcomes, pending)
            }
        };

        guard.finish(SyncState::Idle);
        let report = SyncReport::new(previous.pass, started_at, outcomes).with_pending(pending);
        info!("{}", report);
        Ok(report)
    }
}

/// Cards of the stores that failed among `outcomes`
fn failed_stores<F>(outcomes: &[SyncOutcome], card: F) -> Vec<Card>
where
    F: Fn(&RemoteId) -> Option<Card>,
{
    outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            SyncOutcome::Failed {
                id,
                attempted: SyncAction::Stored,
                ..
            } => card(id),
            _ => None,
        })
        .collect()
}
