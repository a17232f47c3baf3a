//! Single-target update coordinator
//!
//! Admits, dispatches, and finalizes one configuration update against one
//! target. Admission (the existence check, the permission check, and the
//! atomic write of the INPROGRESS record) is the only synchronous part of the
//! flow; the remote push runs on its own task and the agent's answer arrives
//! later as a [`CompletionReport`]. A push that fails at the transport level
//! finalizes the record to FAILURE right away so INPROGRESS can never leak
//! from a failed dispatch.

use crate::configuration::Configuration;
use crate::directory::ResourceDirectory;
use crate::error::UpdateError;
use crate::gateway::{AgentGateway, CompletionReport, ReportStatus};
use crate::group::GroupTracker;
use crate::history::{HistoryStore, NewRecord, UpdateRecord, UpdateStatus};
use crate::permission::PermissionService;
use crate::validate::{default_validator, ConfigValidator, UpdateKind};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of an admitted update request
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// A new history record was created; poll it for the terminal result
    Accepted(UpdateRecord),
    /// The desired configuration equals the current one; nothing was
    /// dispatched and no new record was created
    Unchanged(UpdateRecord),
}

impl UpdateOutcome {
    /// The history record this outcome refers to
    pub fn record(&self) -> &UpdateRecord {
        match self {
            UpdateOutcome::Accepted(record) | UpdateOutcome::Unchanged(record) => record,
        }
    }
}

/// Coordinator for updates against individual targets
pub struct UpdateCoordinator {
    store: Arc<dyn HistoryStore>,
    gateway: Arc<dyn AgentGateway>,
    permissions: Arc<dyn PermissionService>,
    directory: Arc<dyn ResourceDirectory>,
    tracker: Arc<GroupTracker>,
    plugin_validator: Box<dyn ConfigValidator>,
    resource_validator: Box<dyn ConfigValidator>,
    detect_unchanged: bool,
}

impl UpdateCoordinator {
    /// Create a coordinator with the default per-kind validators
    pub fn new(
        store: Arc<dyn HistoryStore>,
        gateway: Arc<dyn AgentGateway>,
        permissions: Arc<dyn PermissionService>,
        directory: Arc<dyn ResourceDirectory>,
        tracker: Arc<GroupTracker>,
        detect_unchanged: bool,
    ) -> Self {
        Self {
            store,
            gateway,
            permissions,
            directory,
            tracker,
            plugin_validator: default_validator(UpdateKind::Plugin),
            resource_validator: default_validator(UpdateKind::Resource),
            detect_unchanged,
        }
    }

    /// Replace the validator used for a kind
    pub fn with_validator(mut self, kind: UpdateKind, validator: Box<dyn ConfigValidator>) -> Self {
        match kind {
            UpdateKind::Plugin => self.plugin_validator = validator,
            UpdateKind::Resource => self.resource_validator = validator,
        }
        self
    }

    /// Request a configuration update against one target.
    ///
    /// Returns as soon as the INPROGRESS record is written and the push is
    /// handed to its own task; it never blocks on the remote round trip.
    pub async fn request_update(
        &self,
        target: &str,
        desired: Configuration,
        principal: &str,
        kind: UpdateKind,
    ) -> Result<UpdateOutcome, UpdateError> {
        if !self.directory.target_exists(target).await {
            return Err(UpdateError::UnknownTarget {
                target: target.to_string(),
            });
        }

        if !self.permissions.has_write_permission(principal, target).await {
            return Err(UpdateError::PermissionDenied {
                principal: principal.to_string(),
                target: target.to_string(),
            });
        }

        self.admit_and_dispatch(target, desired, principal, kind, None)
            .await
    }

    /// Admission and dispatch without the permission check, for callers that
    /// already verified permission at a coarser scope (group fan-out).
    pub(crate) async fn admit_and_dispatch(
        &self,
        target: &str,
        desired: Configuration,
        principal: &str,
        kind: UpdateKind,
        group_id: Option<Uuid>,
    ) -> Result<UpdateOutcome, UpdateError> {
        // The in-flight check comes before the no-change shortcut: while an
        // update is running, the latest terminal value is about to be
        // superseded, so "unchanged" would be answering against stale data.
        // The append below re-checks under the store lock for the racy case.
        if self.store.is_in_progress(target).await {
            return Err(UpdateError::UpdateInProgress {
                target: target.to_string(),
            });
        }

        if self.detect_unchanged {
            if let Some(current) = self.store.latest_terminal(target).await {
                if current.status == UpdateStatus::Success && current.configuration == desired {
                    debug!(
                        "Desired configuration for target [{}] matches the current one - nothing to do",
                        target
                    );
                    return Ok(UpdateOutcome::Unchanged(current));
                }
            }
        }

        let annotated = self.validator_for(kind).validate(&desired);

        // The admission write is atomic: a concurrent request for the same
        // target gets UpdateInProgress from the store, not a second record.
        let record = self
            .store
            .append(NewRecord {
                target: target.to_string(),
                kind,
                configuration: desired,
                status: UpdateStatus::InProgress,
                requested_by: principal.to_string(),
            })
            .await?;

        if let Some(group_id) = group_id {
            self.tracker.attach_child(group_id, target, record.id);
        }

        if let Some(annotated) = annotated {
            // Local validation failure: admitted, never dispatched. The record
            // goes straight to FAILURE with the offending properties annotated.
            let message = format!(
                "configuration values failed validation: {}",
                annotated.error_property_names().join(", ")
            );
            info!(
                "Update [{}] for target [{}] rejected by local validation: {}",
                record.id, target, message
            );
            let finalized = self
                .store
                .finalize(record.id, UpdateStatus::Failure, Some(annotated), Some(message))
                .await?;
            self.tracker
                .on_child_finalized(finalized.id, finalized.status);
            return Ok(UpdateOutcome::Accepted(finalized));
        }

        info!(
            "Dispatching {:?} configuration update [{}] to target [{}] on behalf of [{}]",
            kind, record.id, target, principal
        );
        self.spawn_dispatch(record.clone());

        Ok(UpdateOutcome::Accepted(record))
    }

    /// Push the record's configuration to the agent on a separate task so the
    /// caller never waits on the transport.
    fn spawn_dispatch(&self, record: UpdateRecord) {
        let store = Arc::clone(&self.store);
        let gateway = Arc::clone(&self.gateway);
        let tracker = Arc::clone(&self.tracker);

        tokio::spawn(async move {
            let push = gateway
                .push_configuration(&record.target, &record.configuration, record.id)
                .await;

            if let Err(e) = push {
                warn!(
                    "Failed to dispatch update [{}] to target [{}]: {}",
                    record.id, record.target, e
                );
                let message = format!("failed to communicate with the agent: {}", e);
                match store
                    .finalize(record.id, UpdateStatus::Failure, None, Some(message))
                    .await
                {
                    Ok(finalized) => tracker.on_child_finalized(finalized.id, finalized.status),
                    // The sweeper or a stray callback beat us to it.
                    Err(UpdateError::AlreadyFinalized { .. }) => {}
                    Err(e) => warn!(
                        "Could not record dispatch failure for update [{}]: {}",
                        record.id, e
                    ),
                }
            }
        });
    }

    /// Handle an agent's completion callback.
    ///
    /// A configuration carrying per-property error annotations forces FAILURE
    /// even when the transport reported success; the annotated value is kept
    /// on the record for diagnosis. Duplicate callbacks are logged and
    /// dropped.
    pub async fn complete_update(
        &self,
        report: CompletionReport,
    ) -> Result<Option<UpdateRecord>, UpdateError> {
        debug!(
            "Received configuration-update-completed message for [{}]",
            report.correlation_id
        );

        let mut status = match report.status {
            ReportStatus::Success => UpdateStatus::Success,
            ReportStatus::Failure => UpdateStatus::Failure,
        };
        let mut error = report.error;

        if let Some(configuration) = &report.configuration {
            if configuration.has_errors() {
                status = UpdateStatus::Failure;
                if error.is_none() {
                    error = Some(format!(
                        "configuration values failed validation: {}",
                        configuration.error_property_names().join(", ")
                    ));
                }
            }
        }

        match self
            .store
            .finalize(report.correlation_id, status, report.configuration, error)
            .await
        {
            Ok(finalized) => {
                info!(
                    "Update [{}] for target [{}] completed with {:?}",
                    finalized.id, finalized.target, finalized.status
                );
                self.tracker
                    .on_child_finalized(finalized.id, finalized.status);
                Ok(Some(finalized))
            }
            Err(UpdateError::AlreadyFinalized { id }) => {
                // The original caller already got their result; nothing to redo.
                warn!("Dropping duplicate completion callback for update [{}]", id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Fail an orphaned in-progress record that exceeded the deadline
    pub(crate) async fn fail_timed_out(&self, record: &UpdateRecord, timeout_secs: u64) {
        let running_for = (chrono::Utc::now() - record.created_at).num_seconds();
        let message = format!(
            "timed out: did not complete after {}s (the timeout period was {}s)",
            running_for, timeout_secs
        );

        match self
            .store
            .finalize(record.id, UpdateStatus::Failure, None, Some(message))
            .await
        {
            Ok(finalized) => {
                warn!(
                    "Update [{}] for target [{}] seems to have been orphaned - timing it out",
                    record.id, record.target
                );
                self.tracker
                    .on_child_finalized(finalized.id, finalized.status);
            }
            // Completed between the scan and the finalize; not an orphan after all.
            Err(UpdateError::AlreadyFinalized { .. }) => {}
            Err(e) => warn!("Could not time out update [{}]: {}", record.id, e),
        }
    }

    fn validator_for(&self, kind: UpdateKind) -> &dyn ConfigValidator {
        match kind {
            UpdateKind::Plugin => self.plugin_validator.as_ref(),
            UpdateKind::Resource => self.resource_validator.as_ref(),
        }
    }
}
