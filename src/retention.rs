//! History retention and purge management
//!
//! Deleting audit history must never leave a configured target with zero
//! records, because the current configuration has to stay derivable from the
//! ledger. When a purge would remove a target's sole record, the manager
//! first materializes a live baseline through the reader and only then
//! deletes; `force` skips the safety net entirely. The invariant holds per
//! target no matter how the purge was invoked - by id or in a batch.

use crate::error::UpdateError;
use crate::history::{HistoryStore, UpdateStatus};
use crate::live::LiveConfigReader;
use crate::permission::PermissionService;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Manager reconciling purge requests against the retention invariant
pub struct RetentionManager {
    store: Arc<dyn HistoryStore>,
    reader: Arc<LiveConfigReader>,
    permissions: Arc<dyn PermissionService>,
}

impl RetentionManager {
    /// Create a retention manager
    pub fn new(
        store: Arc<dyn HistoryStore>,
        reader: Arc<LiveConfigReader>,
        permissions: Arc<dyn PermissionService>,
    ) -> Self {
        Self {
            store,
            reader,
            permissions,
        }
    }

    /// Purge one history record.
    ///
    /// Purging the audit trail requires the same write permission as creating
    /// it. Unknown ids are logged and ignored. Without `force`, an
    /// in-progress record is refused and a sole record is replaced by a fresh
    /// live baseline before the delete goes through.
    pub async fn purge(&self, id: Uuid, force: bool, principal: &str) -> Result<(), UpdateError> {
        let Some(record) = self.store.get(id).await else {
            debug!("Asked to purge a non-existing update record [{}]", id);
            return Ok(());
        };

        if !self
            .permissions
            .has_write_permission(principal, &record.target)
            .await
        {
            return Err(UpdateError::PermissionDenied {
                principal: principal.to_string(),
                target: record.target,
            });
        }

        if record.status == UpdateStatus::InProgress && !force {
            return Err(UpdateError::UpdateInProgress {
                target: record.target,
            });
        }

        match self.store.purge(id, force).await {
            Err(UpdateError::RetentionInvariant { target }) => {
                // Sole record for this target: capture the live configuration
                // as a new baseline, then the doomed record is safe to drop.
                info!(
                    "Record [{}] is the only history entry for target [{}] - materializing a live baseline before purging",
                    id, target
                );
                match self.reader.materialize_baseline(&target, record.kind).await {
                    Ok(_) => self.store.purge(id, force).await,
                    Err(UpdateError::UpdateInProgress { .. }) => {
                        // An update slipped in concurrently; its finalize will
                        // write the next record, so keep this one for now.
                        warn!(
                            "Baseline for target [{}] could not be recorded - refusing to purge its last record",
                            target
                        );
                        Err(UpdateError::RetentionInvariant { target })
                    }
                    Err(e) => Err(e),
                }
            }
            other => other,
        }
    }

    /// Purge a batch of records, applying the invariant to each id's target
    /// independently. Stops at the first hard error.
    pub async fn purge_many(
        &self,
        ids: &[Uuid],
        force: bool,
        principal: &str,
    ) -> Result<(), UpdateError> {
        for id in ids {
            self.purge(*id, force, principal).await?;
        }
        Ok(())
    }
}
