//! Group update orchestration
//!
//! Fans one logical update out to the members of a group as independent
//! per-target updates, then folds the member outcomes into a single aggregate
//! status. Group semantics are best-effort across the set: a member that
//! already has an update in flight is marked skipped instead of failing the
//! whole call, while a member that reaches FAILURE makes the aggregate
//! FAILURE no matter how many others succeed.
//!
//! The tracker holds nothing but member dispositions and child statuses; the
//! records themselves live in the history store. No lock is held across a
//! remote call, so fan-out scales with member count.

use crate::configuration::Configuration;
use crate::coordinator::{UpdateCoordinator, UpdateOutcome};
use crate::directory::ResourceDirectory;
use crate::error::UpdateError;
use crate::history::UpdateStatus;
use crate::permission::PermissionService;
use crate::validate::UpdateKind;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How one group member was handled at fan-out time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberDisposition {
    /// A per-target update record was created; its id is referenced here
    Dispatched { record_id: Uuid },
    /// The member already had an update in progress and was left alone
    SkippedInProgress,
    /// The member was already at the desired configuration
    Unchanged,
    /// Admission failed outright; no per-target record was created
    SkippedError { error: String },
}

/// The group-level record: member dispositions plus the aggregate status.
/// References child record ids only; child data stays in the history store.
#[derive(Debug, Clone)]
pub struct GroupUpdateRecord {
    /// Group update id
    pub id: Uuid,
    /// The group that was updated
    pub group: String,
    /// Disposition per member target
    pub members: HashMap<String, MemberDisposition>,
    /// Aggregate status folded from the dispatched members
    pub status: UpdateStatus,
    /// Names of failed members, once the aggregate turns FAILURE
    pub error: Option<String>,
    /// Principal that requested the group update
    pub requested_by: String,
    /// When the fan-out started
    pub created_at: DateTime<Utc>,
}

struct ChildState {
    target: String,
    status: UpdateStatus,
}

struct GroupState {
    record: GroupUpdateRecord,
    children: HashMap<Uuid, ChildState>,
    /// Fan-out still attaching members; suppresses premature aggregation
    registering: bool,
    changed: watch::Sender<UpdateStatus>,
}

impl GroupState {
    /// Recompute the aggregate: INPROGRESS while any dispatched child is
    /// in progress, FAILURE if any child failed, SUCCESS otherwise. Once
    /// terminal the aggregate never changes again.
    fn recompute(&mut self) {
        if self.registering || self.record.status.is_terminal() {
            return;
        }

        let mut failed_targets: Vec<&str> = Vec::new();
        for child in self.children.values() {
            match child.status {
                UpdateStatus::InProgress => return,
                UpdateStatus::Failure => failed_targets.push(&child.target),
                UpdateStatus::Success => {}
            }
        }

        if failed_targets.is_empty() {
            self.record.status = UpdateStatus::Success;
        } else {
            failed_targets.sort_unstable();
            self.record.status = UpdateStatus::Failure;
            self.record.error = Some(format!(
                "the following targets failed to update their configurations: {}",
                failed_targets.join(", ")
            ));
        }

        info!(
            "Group update [{}] for group [{}] completed with {:?}",
            self.record.id, self.record.group, self.record.status
        );
        let _ = self.changed.send(self.record.status);
    }
}

#[derive(Default)]
struct TrackerInner {
    groups: HashMap<Uuid, GroupState>,
    by_record: HashMap<Uuid, Uuid>,
}

/// Tracks in-flight group updates and folds child transitions into aggregates
#[derive(Default)]
pub struct GroupTracker {
    inner: Mutex<TrackerInner>,
}

impl GroupTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new group record in the registering state
    fn create_group(&self, group: &str, requested_by: &str) -> Uuid {
        let id = Uuid::new_v4();
        let (changed, _) = watch::channel(UpdateStatus::InProgress);
        let state = GroupState {
            record: GroupUpdateRecord {
                id,
                group: group.to_string(),
                members: HashMap::new(),
                status: UpdateStatus::InProgress,
                error: None,
                requested_by: requested_by.to_string(),
                created_at: Utc::now(),
            },
            children: HashMap::new(),
            registering: true,
            changed,
        };
        self.inner.lock().unwrap().groups.insert(id, state);
        id
    }

    /// Attach a dispatched child to its group. Called between the child's
    /// admission write and its dispatch, so a child can never finalize before
    /// the tracker knows about it.
    pub(crate) fn attach_child(&self, group_id: Uuid, target: &str, record_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_record.insert(record_id, group_id);
        if let Some(state) = inner.groups.get_mut(&group_id) {
            state.record.members.insert(
                target.to_string(),
                MemberDisposition::Dispatched { record_id },
            );
            state.children.insert(
                record_id,
                ChildState {
                    target: target.to_string(),
                    status: UpdateStatus::InProgress,
                },
            );
        }
    }

    fn mark_member(&self, group_id: Uuid, target: &str, disposition: MemberDisposition) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.groups.get_mut(&group_id) {
            state.record.members.insert(target.to_string(), disposition);
        }
    }

    /// End the registering phase and compute the first real aggregate
    fn finish_registration(&self, group_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.groups.get_mut(&group_id) {
            state.registering = false;
            state.recompute();
        }
    }

    /// Fold a child's terminal transition into its group's aggregate.
    /// Records that belong to no group are ignored.
    pub(crate) fn on_child_finalized(&self, record_id: Uuid, status: UpdateStatus) {
        if !status.is_terminal() {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        let Some(group_id) = inner.by_record.get(&record_id).copied() else {
            return;
        };
        let Some(state) = inner.groups.get_mut(&group_id) else {
            return;
        };

        if state.record.status.is_terminal() {
            // Terminal aggregates are immutable; a late child transition
            // (duplicate callback raced with the sweeper) changes nothing.
            debug!(
                "Ignoring child transition for already-terminal group update [{}]",
                group_id
            );
            return;
        }

        if let Some(child) = state.children.get_mut(&record_id) {
            child.status = status;
        }
        state.recompute();
    }

    /// Drop a terminal group record along with its child-id mappings, so
    /// completed fan-outs do not accumulate for the life of the process.
    /// Returns `false` for an unknown or still-in-progress group.
    pub fn purge_terminal(&self, group_update_id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let children: Vec<Uuid> = match inner.groups.get(&group_update_id) {
            Some(state) if state.record.status.is_terminal() => {
                state.children.keys().copied().collect()
            }
            _ => return false,
        };

        for child in &children {
            inner.by_record.remove(child);
        }
        inner.groups.remove(&group_update_id);
        debug!("Purged terminal group update record [{}]", group_update_id);
        true
    }

    /// Fetch a group record snapshot
    pub fn get(&self, group_update_id: Uuid) -> Option<GroupUpdateRecord> {
        self.inner
            .lock()
            .unwrap()
            .groups
            .get(&group_update_id)
            .map(|state| state.record.clone())
    }

    /// Wait until the group's aggregate reaches a terminal status, with a
    /// bounded deadline. The expected pattern for batch callers and tests.
    pub async fn wait_terminal(
        &self,
        group_update_id: Uuid,
        deadline: Duration,
    ) -> Result<UpdateStatus, UpdateError> {
        let mut receiver = {
            let inner = self.inner.lock().unwrap();
            let state =
                inner
                    .groups
                    .get(&group_update_id)
                    .ok_or(UpdateError::UnknownGroup {
                        group: group_update_id.to_string(),
                    })?;
            if state.record.status.is_terminal() {
                return Ok(state.record.status);
            }
            state.changed.subscribe()
        };

        let wait = async {
            loop {
                if receiver.changed().await.is_err() {
                    // Sender dropped without a terminal status; treat as timeout
                    return None;
                }
                let status = *receiver.borrow();
                if status.is_terminal() {
                    return Some(status);
                }
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(Some(status)) => Ok(status),
            _ => Err(UpdateError::WaitTimedOut {
                group: group_update_id.to_string(),
            }),
        }
    }
}

/// Orchestrator fanning group updates out through the single-target coordinator
pub struct GroupOrchestrator {
    coordinator: Arc<UpdateCoordinator>,
    tracker: Arc<GroupTracker>,
    permissions: Arc<dyn PermissionService>,
    directory: Arc<dyn ResourceDirectory>,
}

impl GroupOrchestrator {
    /// Create a group orchestrator
    pub fn new(
        coordinator: Arc<UpdateCoordinator>,
        tracker: Arc<GroupTracker>,
        permissions: Arc<dyn PermissionService>,
        directory: Arc<dyn ResourceDirectory>,
    ) -> Self {
        Self {
            coordinator,
            tracker,
            permissions,
            directory,
        }
    }

    /// Fan a group update out to every member of the group.
    ///
    /// Permission is checked once against the group, before any member is
    /// touched. Membership is snapshotted here; later changes to the group do
    /// not affect this update. Returns the group update id immediately - the
    /// members complete on their own time.
    pub async fn request_group_update(
        &self,
        group: &str,
        member_configurations: &HashMap<String, Configuration>,
        principal: &str,
        kind: UpdateKind,
    ) -> Result<Uuid, UpdateError> {
        let members =
            self.directory
                .group_members(group)
                .await
                .ok_or_else(|| UpdateError::UnknownGroup {
                    group: group.to_string(),
                })?;

        // One atomic permission gate for the whole fan-out; a half-permitted
        // group update is not a thing.
        if !self.permissions.has_write_permission(principal, group).await {
            return Err(UpdateError::PermissionDenied {
                principal: principal.to_string(),
                target: group.to_string(),
            });
        }

        let group_id = self.tracker.create_group(group, principal);
        info!(
            "Fanning group update [{}] out to {} members of group [{}]",
            group_id,
            members.len(),
            group
        );

        for member in &members {
            let Some(desired) = member_configurations.get(member) else {
                debug!(
                    "No configuration supplied for member [{}] of group [{}] - leaving it alone",
                    member, group
                );
                continue;
            };

            match self
                .coordinator
                .admit_and_dispatch(member, desired.clone(), principal, kind, Some(group_id))
                .await
            {
                Ok(UpdateOutcome::Accepted(_)) => {
                    // attach_child already recorded the disposition
                }
                Ok(UpdateOutcome::Unchanged(_)) => {
                    self.tracker
                        .mark_member(group_id, member, MemberDisposition::Unchanged);
                }
                Err(UpdateError::UpdateInProgress { .. }) => {
                    debug!(
                        "Member [{}] of group [{}] already has an update in progress - skipping it",
                        member, group
                    );
                    self.tracker
                        .mark_member(group_id, member, MemberDisposition::SkippedInProgress);
                }
                Err(e) => {
                    warn!(
                        "Could not admit member [{}] of group [{}]: {}",
                        member, group, e
                    );
                    self.tracker.mark_member(
                        group_id,
                        member,
                        MemberDisposition::SkippedError {
                            error: e.to_string(),
                        },
                    );
                }
            }
        }

        self.tracker.finish_registration(group_id);
        Ok(group_id)
    }
}
