//! Process-scoped update engine
//!
//! [`UpdateEngine`] is the single entry point embedders talk to: it owns the
//! history store, wires the coordinator, group orchestrator, live reader,
//! retention manager, and timeout sweeper together, and hosts the inbound
//! agent callback. One engine is constructed at startup and shared by
//! reference; `shutdown` stops the background sweeper explicitly.

use crate::config::EngineConfig;
use crate::configuration::Configuration;
use crate::coordinator::{UpdateCoordinator, UpdateOutcome};
use crate::directory::ResourceDirectory;
use crate::error::UpdateError;
use crate::gateway::{AgentGateway, CompletionReport};
use crate::group::{GroupOrchestrator, GroupTracker, GroupUpdateRecord};
use crate::history::{
    HistoryCriteria, HistoryStore, InMemoryHistoryStore, Page, UpdateRecord, UpdateStatus,
};
use crate::live::LiveConfigReader;
use crate::permission::PermissionService;
use crate::retention::RetentionManager;
use crate::sweeper::TimeoutSweeper;
use crate::validate::UpdateKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// The configuration update orchestration engine
pub struct UpdateEngine {
    store: Arc<dyn HistoryStore>,
    coordinator: Arc<UpdateCoordinator>,
    orchestrator: GroupOrchestrator,
    tracker: Arc<GroupTracker>,
    reader: Arc<LiveConfigReader>,
    retention: RetentionManager,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateEngine {
    /// Construct an engine with the in-memory history store
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn AgentGateway>,
        permissions: Arc<dyn PermissionService>,
        directory: Arc<dyn ResourceDirectory>,
    ) -> Self {
        let store: Arc<dyn HistoryStore> =
            Arc::new(InMemoryHistoryStore::new(config.default_page_size));
        Self::with_store(config, store, gateway, permissions, directory)
    }

    /// Construct an engine on top of a caller-provided history store
    pub fn with_store(
        config: EngineConfig,
        store: Arc<dyn HistoryStore>,
        gateway: Arc<dyn AgentGateway>,
        permissions: Arc<dyn PermissionService>,
        directory: Arc<dyn ResourceDirectory>,
    ) -> Self {
        let tracker = Arc::new(GroupTracker::new());
        let coordinator = Arc::new(UpdateCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&permissions),
            Arc::clone(&directory),
            Arc::clone(&tracker),
            config.detect_unchanged,
        ));
        let orchestrator = GroupOrchestrator::new(
            Arc::clone(&coordinator),
            Arc::clone(&tracker),
            Arc::clone(&permissions),
            directory,
        );
        let reader = Arc::new(LiveConfigReader::new(Arc::clone(&store), gateway));
        let retention =
            RetentionManager::new(Arc::clone(&store), Arc::clone(&reader), permissions);

        let sweeper = TimeoutSweeper::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            config.in_progress_timeout_secs,
            config.sweep_interval_secs,
        );
        let sweeper_task = tokio::spawn(sweeper.run());

        info!(
            "Update engine started (in-progress timeout {}s, sweep interval {}s)",
            config.in_progress_timeout_secs, config.sweep_interval_secs
        );

        Self {
            store,
            coordinator,
            orchestrator,
            tracker,
            reader,
            retention,
            sweeper_task: Mutex::new(Some(sweeper_task)),
        }
    }

    /// Stop the background sweeper. In-flight updates keep completing through
    /// the callback path; they just lose timeout protection.
    pub fn shutdown(&self) {
        if let Some(task) = self.sweeper_task.lock().unwrap().take() {
            task.abort();
            info!("Update engine shut down");
        }
    }

    /// Request a configuration update against one target (see
    /// [`UpdateCoordinator::request_update`])
    pub async fn request_update(
        &self,
        target: &str,
        desired: Configuration,
        principal: &str,
        kind: UpdateKind,
    ) -> Result<UpdateOutcome, UpdateError> {
        self.coordinator
            .request_update(target, desired, principal, kind)
            .await
    }

    /// Re-request an update using the configuration snapshot of an earlier
    /// history record
    pub async fn rollback(
        &self,
        target: &str,
        history_id: Uuid,
        principal: &str,
    ) -> Result<UpdateOutcome, UpdateError> {
        let record = self
            .store
            .get(history_id)
            .await
            .ok_or(UpdateError::RecordNotFound { id: history_id })?;

        info!(
            "Rolling target [{}] back to the configuration of record [{}]",
            target, history_id
        );
        self.coordinator
            .request_update(target, record.configuration, principal, record.kind)
            .await
    }

    /// Fan an update out to every member of a group (see
    /// [`GroupOrchestrator::request_group_update`])
    pub async fn request_group_update(
        &self,
        group: &str,
        member_configurations: &HashMap<String, Configuration>,
        principal: &str,
        kind: UpdateKind,
    ) -> Result<Uuid, UpdateError> {
        self.orchestrator
            .request_group_update(group, member_configurations, principal, kind)
            .await
    }

    /// Snapshot of a group update record
    pub fn group_update(&self, group_update_id: Uuid) -> Option<GroupUpdateRecord> {
        self.tracker.get(group_update_id)
    }

    /// Drop a terminal group update record once its result has been consumed.
    /// Returns `false` for an unknown or still-in-progress group.
    pub fn purge_group_update(&self, group_update_id: Uuid) -> bool {
        self.tracker.purge_terminal(group_update_id)
    }

    /// Wait with a bounded deadline until a group update reaches a terminal
    /// aggregate status
    pub async fn wait_for_group_update(
        &self,
        group_update_id: Uuid,
        deadline: Duration,
    ) -> Result<UpdateStatus, UpdateError> {
        self.tracker.wait_terminal(group_update_id, deadline).await
    }

    /// Inbound completion callback invoked by the agent gateway's remote side.
    /// Returns the finalized record, or `None` for a dropped duplicate.
    pub async fn complete_update(
        &self,
        report: CompletionReport,
    ) -> Result<Option<UpdateRecord>, UpdateError> {
        self.coordinator.complete_update(report).await
    }

    /// Resolve the authoritative current configuration for a target (see
    /// [`LiveConfigReader::get_live`])
    pub async fn get_live(
        &self,
        target: &str,
        force_refresh: bool,
        kind: UpdateKind,
    ) -> Result<Configuration, UpdateError> {
        self.reader.get_live(target, force_refresh, kind).await
    }

    /// Most recently created history record for a target
    pub async fn latest(&self, target: &str) -> Option<UpdateRecord> {
        self.store.latest(target).await
    }

    /// Whether the target currently has an update in progress
    pub async fn is_in_progress(&self, target: &str) -> bool {
        self.store.is_in_progress(target).await
    }

    /// Fetch one history record by id
    pub async fn record(&self, id: Uuid) -> Option<UpdateRecord> {
        self.store.get(id).await
    }

    /// Query history records by target, status, and time range
    pub async fn history(&self, criteria: &HistoryCriteria) -> Page<UpdateRecord> {
        self.store.list(criteria).await
    }

    /// Purge one history record (see [`RetentionManager::purge`])
    pub async fn purge(&self, id: Uuid, force: bool, principal: &str) -> Result<(), UpdateError> {
        self.retention.purge(id, force, principal).await
    }

    /// Purge a batch of history records
    pub async fn purge_many(
        &self,
        ids: &[Uuid],
        force: bool,
        principal: &str,
    ) -> Result<(), UpdateError> {
        self.retention.purge_many(ids, force, principal).await
    }
}

impl Drop for UpdateEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
