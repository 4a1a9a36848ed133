//! Per-item results of a reconciliation pass

use crate::card::Card;
use crate::error::{Error, FailureKind};
use crate::storage::RemoteId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Reconciler state between and during passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Running,
    /// The last pass was aborted before any item was processed
    Failed,
}

/// Direction of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassKind {
    Pull,
    Push,
}

/// What happened to an item, or what was attempted when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// Downloaded and decrypted
    Fetched,
    /// Encrypted and written
    Stored,
    /// Remote copy already current, nothing written
    Unchanged,
    /// Deleted from the remote store
    Removed,
}

/// Result for one record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SyncOutcome {
    Ok {
        id: RemoteId,
        action: SyncAction,
    },
    Failed {
        id: RemoteId,
        attempted: SyncAction,
        kind: FailureKind,
        message: String,
    },
}

impl SyncOutcome {
    pub fn failed(id: RemoteId, attempted: SyncAction, error: &Error) -> Self {
        SyncOutcome::Failed {
            id,
            attempted,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn id(&self) -> &RemoteId {
        match self {
            SyncOutcome::Ok { id, .. } | SyncOutcome::Failed { id, .. } => id,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, SyncOutcome::Ok { .. })
    }
}

/// Outcomes of one pass. Every item the pass considered appears exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub pass: PassKind,
    pub outcomes: Vec<SyncOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Cards whose store failed, kept for a retry of this report
    #[serde(skip)]
    pending: Vec<Card>,
}

impl SyncReport {
    pub(crate) fn new(pass: PassKind, started_at: DateTime<Utc>, mut outcomes: Vec<SyncOutcome>) -> Self {
        outcomes.sort_by(|a, b| a.id().cmp(b.id()));
        SyncReport {
            pass,
            outcomes,
            started_at,
            finished_at: Utc::now(),
            pending: Vec::new(),
        }
    }

    /// Attach the cards a retry of this push has to store again
    pub(crate) fn with_pending(mut self, pending: Vec<Card>) -> Self {
        self.pending = pending;
        self
    }

    /// Card whose store failed in this pass
    pub fn pending_card(&self, id: &RemoteId) -> Option<&Card> {
        self.pending.iter().find(|c| RemoteId::for_card(&c.id) == *id)
    }

    /// Whether any item failed
    pub fn is_partial(&self) -> bool {
        self.outcomes.iter().any(|o| !o.is_ok())
    }

    pub fn failed_ids(&self) -> Vec<RemoteId> {
        self.failures().map(|o| o.id().clone()).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SyncOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    /// Number of items that succeeded with `action`
    pub fn count(&self, action: SyncAction) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SyncOutcome::Ok { action: a, .. } if *a == action))
            .count()
    }

    /// Number of items that failed with `kind`
    pub fn count_failed(&self, kind: FailureKind) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SyncOutcome::Failed { kind: k, .. } if *k == kind))
            .count()
    }

    /// Outcome recorded for `id`
    pub fn outcome(&self, id: &RemoteId) -> Option<&SyncOutcome> {
        self.outcomes.iter().find(|o| o.id() == id)
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.failures().count();
        write!(
            f,
            "{:?}: {} items, {} ok, {} failed",
            self.pass,
            self.outcomes.len(),
            self.outcomes.len() - failed,
            failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id() -> RemoteId {
        RemoteId::for_card(&Uuid::new_v4())
    }

    #[test]
    fn test_report_accounting() {
        let a = id();
        let b = id();
        let c = id();
        let report = SyncReport::new(
            PassKind::Push,
            Utc::now(),
            vec![
                SyncOutcome::Ok {
                    id: a.clone(),
                    action: SyncAction::Stored,
                },
                SyncOutcome::failed(
                    b.clone(),
                    SyncAction::Stored,
                    &Error::NetworkFailure("reset".to_string()),
                ),
                SyncOutcome::Ok {
                    id: c.clone(),
                    action: SyncAction::Removed,
                },
            ],
        );

        assert!(report.is_partial());
        assert_eq!(report.failed_ids(), vec![b.clone()]);
        assert_eq!(report.count(SyncAction::Stored), 1);
        assert_eq!(report.count(SyncAction::Removed), 1);
        assert_eq!(report.count_failed(FailureKind::NetworkFailure), 1);
        assert!(report.outcome(&a).unwrap().is_ok());
        assert_eq!(report.to_string(), "Push: 3 items, 2 ok, 1 failed");
    }

    #[test]
    fn test_clean_report() {
        let report = SyncReport::new(PassKind::Pull, Utc::now(), Vec::new());
        assert!(!report.is_partial());
        assert!(report.failed_ids().is_empty());
    }

    #[test]
    fn test_outcome_serializes_without_secrets() {
        let outcome = SyncOutcome::failed(id(), SyncAction::Fetched, &Error::AuthenticationFailed);
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"status\":\"failed\""));
        assert!(json.contains("\"attempted\":\"fetched\""));
        assert!(json.contains("\"kind\":\"authentication_failed\""));
    }
}
