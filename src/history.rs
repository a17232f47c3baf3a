//! Update history ledger
//!
//! This module provides the durable record of every configuration update
//! attempt: the record types, the status state machine, the criteria query
//! surface, and the [`HistoryStore`] trait with its in-memory implementation.
//! The store is the engine's single source of truth; admission of a new update
//! and the exactly-once finalize transition are both enforced here under one
//! lock so no caller can observe a torn state.

use crate::configuration::Configuration;
use crate::error::UpdateError;
use crate::validate::UpdateKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle status of an update record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStatus {
    /// Dispatched to the agent, outcome not yet confirmed
    InProgress,
    /// The agent confirmed the configuration was applied
    Success,
    /// The update failed (agent error, validation error, transport error, or timeout)
    Failure,
}

impl UpdateStatus {
    /// Whether this status is terminal (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UpdateStatus::InProgress)
    }
}

/// One update attempt against one target: the unit of durable truth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// Record id, used as the correlation token for the agent round trip.
    /// Ids are random; creation order comes from `seq`, not from the id.
    pub id: Uuid,
    /// The target this update was applied to
    pub target: String,
    /// Whether this updates the plugin-level or resource-level configuration
    pub kind: UpdateKind,
    /// The configuration being applied; replaced by the agent-confirmed value on success
    pub configuration: Configuration,
    /// Current lifecycle status
    pub status: UpdateStatus,
    /// Error message for failed updates
    pub error: Option<String>,
    /// Principal that requested the update
    pub requested_by: String,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record last changed status
    pub modified_at: DateTime<Utc>,
    /// Store-assigned monotonic sequence number establishing creation order
    pub seq: u64,
}

impl UpdateRecord {
    /// How long this update has been running (or ran, once terminal)
    pub fn duration(&self) -> chrono::Duration {
        self.modified_at - self.created_at
    }
}

/// Fields for a record about to be appended; the store assigns id, timestamps,
/// and the sequence number.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub target: String,
    pub kind: UpdateKind,
    pub configuration: Configuration,
    pub status: UpdateStatus,
    pub requested_by: String,
}

/// Sort order for history queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest first
    CreatedAsc,
    /// Newest first
    #[default]
    CreatedDesc,
}

/// Filter and paging criteria for history queries
#[derive(Debug, Clone, Default)]
pub struct HistoryCriteria {
    /// Only records for this target
    pub target: Option<String>,
    /// Only records with this status
    pub status: Option<UpdateStatus>,
    /// Only records created at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Only records created before this instant
    pub until: Option<DateTime<Utc>>,
    /// Zero-based page number
    pub page: usize,
    /// Page size; 0 means "use the engine default"
    pub page_size: usize,
    /// Sort order by creation time
    pub sort: SortOrder,
}

impl HistoryCriteria {
    /// Criteria matching every record for one target, newest first
    pub fn for_target(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::default()
        }
    }
}

/// One page of query results
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Records on this page
    pub items: Vec<T>,
    /// Total records matching the criteria across all pages
    pub total: usize,
    /// Zero-based page number
    pub page: usize,
    /// Page size used for the query
    pub page_size: usize,
}

/// Durable ledger of update attempts
///
/// Implementations must make `append` an atomic check-and-insert: the check
/// for an existing in-progress record and the insertion of the new one happen
/// under a single critical section scoped to the store.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a new record, enforcing at most one in-progress record per target
    async fn append(&self, record: NewRecord) -> Result<UpdateRecord, UpdateError>;

    /// Fetch a record by id
    async fn get(&self, id: Uuid) -> Option<UpdateRecord>;

    /// Most recently created record for a target, by creation order
    async fn latest(&self, target: &str) -> Option<UpdateRecord>;

    /// Most recently created record with a terminal status for a target
    async fn latest_terminal(&self, target: &str) -> Option<UpdateRecord>;

    /// Whether the target currently has an in-progress record
    async fn is_in_progress(&self, target: &str) -> bool;

    /// Transition a record out of `InProgress` exactly once.
    ///
    /// `configuration` replaces the stored snapshot when present (the agent
    /// confirmed or annotated value). A second finalize for the same id fails
    /// with [`UpdateError::AlreadyFinalized`] and leaves the record unchanged.
    async fn finalize(
        &self,
        id: Uuid,
        status: UpdateStatus,
        configuration: Option<Configuration>,
        error: Option<String>,
    ) -> Result<UpdateRecord, UpdateError>;

    /// Delete a record.
    ///
    /// Refuses to delete an in-progress record, or the sole record of a
    /// target, unless `force` is set. Deleting an unknown id is logged and
    /// ignored.
    async fn purge(&self, id: Uuid, force: bool) -> Result<(), UpdateError>;

    /// Query records matching the given criteria
    async fn list(&self, criteria: &HistoryCriteria) -> Page<UpdateRecord>;

    /// All in-progress records created before the cutoff (for the sweeper)
    async fn in_progress_older_than(&self, cutoff: DateTime<Utc>) -> Vec<UpdateRecord>;

    /// Number of records stored for a target
    async fn count(&self, target: &str) -> usize;
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<Uuid, UpdateRecord>,
    /// Record ids per target in creation order
    by_target: HashMap<String, Vec<Uuid>>,
    /// Target -> id of its single in-progress record, if any
    in_progress: HashMap<String, Uuid>,
    next_seq: u64,
}

/// In-memory [`HistoryStore`]
///
/// All indexes live behind one `RwLock`, which makes the admission
/// check-and-insert and the finalize compare-and-set naturally atomic. The
/// lock is only ever held for map operations, never across a remote call.
pub struct InMemoryHistoryStore {
    inner: RwLock<StoreInner>,
    /// Fallback page size when a query asks for page_size 0
    default_page_size: usize,
}

impl InMemoryHistoryStore {
    /// Create an empty store
    pub fn new(default_page_size: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            default_page_size: default_page_size.max(1),
        }
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, record: NewRecord) -> Result<UpdateRecord, UpdateError> {
        let mut inner = self.inner.write().await;

        // Admission check and insert under the same lock: a concurrent append
        // for the same target is guaranteed to observe this one.
        if inner.in_progress.contains_key(&record.target) {
            return Err(UpdateError::UpdateInProgress {
                target: record.target,
            });
        }

        let now = Utc::now();
        inner.next_seq += 1;
        let stored = UpdateRecord {
            id: Uuid::new_v4(),
            target: record.target.clone(),
            kind: record.kind,
            configuration: record.configuration,
            status: record.status,
            error: None,
            requested_by: record.requested_by,
            created_at: now,
            modified_at: now,
            seq: inner.next_seq,
        };

        if stored.status == UpdateStatus::InProgress {
            inner.in_progress.insert(record.target.clone(), stored.id);
        }
        inner
            .by_target
            .entry(record.target)
            .or_default()
            .push(stored.id);
        inner.records.insert(stored.id, stored.clone());

        debug!(
            "Appended {:?} update record [{}] for target [{}]",
            stored.status, stored.id, stored.target
        );
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> Option<UpdateRecord> {
        self.inner.read().await.records.get(&id).cloned()
    }

    async fn latest(&self, target: &str) -> Option<UpdateRecord> {
        let inner = self.inner.read().await;
        let ids = inner.by_target.get(target)?;
        ids.iter()
            .filter_map(|id| inner.records.get(id))
            .max_by_key(|r| r.seq)
            .cloned()
    }

    async fn latest_terminal(&self, target: &str) -> Option<UpdateRecord> {
        let inner = self.inner.read().await;
        let ids = inner.by_target.get(target)?;
        ids.iter()
            .filter_map(|id| inner.records.get(id))
            .filter(|r| r.status.is_terminal())
            .max_by_key(|r| r.seq)
            .cloned()
    }

    async fn is_in_progress(&self, target: &str) -> bool {
        self.inner.read().await.in_progress.contains_key(target)
    }

    async fn finalize(
        &self,
        id: Uuid,
        status: UpdateStatus,
        configuration: Option<Configuration>,
        error: Option<String>,
    ) -> Result<UpdateRecord, UpdateError> {
        if !status.is_terminal() {
            return Err(UpdateError::InvalidStatus { id });
        }

        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get(&id)
            .cloned()
            .ok_or(UpdateError::RecordNotFound { id })?;

        if record.status.is_terminal() {
            // Duplicate agent callback or a race with the sweeper. The record
            // stays exactly as the first transition left it.
            warn!(
                "Ignoring finalize of already-finalized record [{}] (stored status {:?}, requested {:?})",
                id, record.status, status
            );
            return Err(UpdateError::AlreadyFinalized { id });
        }

        let mut updated = record;
        updated.status = status;
        updated.error = error;
        updated.modified_at = Utc::now();
        if let Some(configuration) = configuration {
            updated.configuration = configuration;
        }

        inner.in_progress.remove(&updated.target);
        inner.records.insert(id, updated.clone());

        debug!(
            "Finalized update record [{}] for target [{}] to {:?}",
            id, updated.target, updated.status
        );
        Ok(updated)
    }

    async fn purge(&self, id: Uuid, force: bool) -> Result<(), UpdateError> {
        let mut inner = self.inner.write().await;

        let record = match inner.records.get(&id) {
            Some(record) => record.clone(),
            None => {
                debug!("Asked to purge a non-existing update record [{}]", id);
                return Ok(());
            }
        };

        if record.status == UpdateStatus::InProgress && !force {
            return Err(UpdateError::UpdateInProgress {
                target: record.target,
            });
        }

        let remaining = inner
            .by_target
            .get(&record.target)
            .map(|ids| ids.len())
            .unwrap_or(0);
        if remaining <= 1 && !force {
            return Err(UpdateError::RetentionInvariant {
                target: record.target,
            });
        }

        inner.records.remove(&id);
        if let Some(ids) = inner.by_target.get_mut(&record.target) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                inner.by_target.remove(&record.target);
            }
        }
        if inner.in_progress.get(&record.target) == Some(&id) {
            inner.in_progress.remove(&record.target);
        }

        debug!(
            "Purged update record [{}] for target [{}]",
            id, record.target
        );
        Ok(())
    }

    async fn list(&self, criteria: &HistoryCriteria) -> Page<UpdateRecord> {
        let inner = self.inner.read().await;

        let mut matches: Vec<UpdateRecord> = inner
            .records
            .values()
            .filter(|r| {
                criteria
                    .target
                    .as_ref()
                    .map_or(true, |target| &r.target == target)
            })
            .filter(|r| criteria.status.map_or(true, |status| r.status == status))
            .filter(|r| criteria.since.map_or(true, |since| r.created_at >= since))
            .filter(|r| criteria.until.map_or(true, |until| r.created_at < until))
            .cloned()
            .collect();

        match criteria.sort {
            SortOrder::CreatedAsc => matches.sort_by_key(|r| r.seq),
            SortOrder::CreatedDesc => matches.sort_by_key(|r| std::cmp::Reverse(r.seq)),
        }

        let page_size = if criteria.page_size == 0 {
            self.default_page_size
        } else {
            criteria.page_size
        };
        let total = matches.len();
        let items = matches
            .into_iter()
            .skip(criteria.page * page_size)
            .take(page_size)
            .collect();

        Page {
            items,
            total,
            page: criteria.page,
            page_size,
        }
    }

    async fn in_progress_older_than(&self, cutoff: DateTime<Utc>) -> Vec<UpdateRecord> {
        let inner = self.inner.read().await;
        inner
            .in_progress
            .values()
            .filter_map(|id| inner.records.get(id))
            .filter(|r| r.created_at < cutoff)
            .cloned()
            .collect()
    }

    async fn count(&self, target: &str) -> usize {
        self.inner
            .read()
            .await
            .by_target
            .get(target)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }
}
