//! Live configuration reader
//!
//! Resolves the authoritative current configuration for a target: the latest
//! terminal history record when one exists, otherwise a synchronous pull from
//! the agent. A pull that reveals a value the ledger has never seen (first
//! read, or an out-of-band change made directly on the agent) is persisted as
//! a fresh baseline record attributed to the system principal, so "current
//! configuration" stays derivable from history alone. The in-flight desired
//! value of a concurrent update is never returned - it is not confirmed yet.

use crate::configuration::Configuration;
use crate::error::UpdateError;
use crate::gateway::AgentGateway;
use crate::history::{HistoryStore, NewRecord, UpdateStatus};
use crate::validate::UpdateKind;
use std::sync::Arc;
use tracing::{debug, warn};

/// Principal recorded on baseline records the system materializes on its own
pub const SYSTEM_PRINCIPAL: &str = "system";

/// Reader for authoritative current configuration values
pub struct LiveConfigReader {
    store: Arc<dyn HistoryStore>,
    gateway: Arc<dyn AgentGateway>,
}

impl LiveConfigReader {
    /// Create a live reader
    pub fn new(store: Arc<dyn HistoryStore>, gateway: Arc<dyn AgentGateway>) -> Self {
        Self { store, gateway }
    }

    /// Resolve the current configuration for a target.
    ///
    /// With `force_refresh` false this returns the last known good value from
    /// history when one exists. Otherwise it blocks for one agent round trip
    /// and reconciles the pulled value into history.
    pub async fn get_live(
        &self,
        target: &str,
        force_refresh: bool,
        kind: UpdateKind,
    ) -> Result<Configuration, UpdateError> {
        let current = self.store.latest_terminal(target).await;

        if !force_refresh {
            if let Some(record) = &current {
                return Ok(record.configuration.clone());
            }
        }

        let live = self.gateway.pull_configuration(target).await?;

        let known = current
            .as_ref()
            .map(|record| record.configuration == live)
            .unwrap_or(false);
        if !known {
            // Someone changed the configuration on the agent side (or this is
            // the target's very first read) - persist the live value as a new
            // baseline so history keeps matching reality.
            match self
                .store
                .append(NewRecord {
                    target: target.to_string(),
                    kind,
                    configuration: live.clone(),
                    status: UpdateStatus::Success,
                    requested_by: SYSTEM_PRINCIPAL.to_string(),
                })
                .await
            {
                Ok(record) => debug!(
                    "Materialized live configuration of target [{}] as baseline record [{}]",
                    target, record.id
                ),
                Err(UpdateError::UpdateInProgress { .. }) => {
                    // An update is mid-flight; its finalize will reconcile
                    // history, so the pulled value is returned unrecorded.
                    debug!(
                        "Target [{}] is changing its configuration - skipping baseline materialization",
                        target
                    );
                }
                Err(e) => {
                    warn!(
                        "Could not materialize baseline record for target [{}]: {}",
                        target, e
                    );
                }
            }
        }

        Ok(live)
    }

    /// Pull the live configuration and persist it as a fresh baseline record
    /// unconditionally, even when it matches the latest terminal value. Used
    /// by the retention manager before it deletes a target's last record.
    pub(crate) async fn materialize_baseline(
        &self,
        target: &str,
        kind: UpdateKind,
    ) -> Result<Configuration, UpdateError> {
        let live = self.gateway.pull_configuration(target).await?;
        let record = self
            .store
            .append(NewRecord {
                target: target.to_string(),
                kind,
                configuration: live.clone(),
                status: UpdateStatus::Success,
                requested_by: SYSTEM_PRINCIPAL.to_string(),
            })
            .await?;
        debug!(
            "Materialized live configuration of target [{}] as baseline record [{}]",
            target, record.id
        );
        Ok(live)
    }

    /// The last known good (most recent terminal) configuration, without ever
    /// touching the agent. `None` when the target has no terminal history.
    pub async fn last_known_good(&self, target: &str) -> Option<Configuration> {
        self.store
            .latest_terminal(target)
            .await
            .map(|record| record.configuration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::Property;
    use crate::history::InMemoryHistoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct PullOnlyGateway {
        live: Configuration,
        pulls: AtomicUsize,
    }

    impl PullOnlyGateway {
        fn new(live: Configuration) -> Self {
            Self {
                live,
                pulls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AgentGateway for PullOnlyGateway {
        async fn push_configuration(
            &self,
            _target: &str,
            _configuration: &Configuration,
            _correlation_id: Uuid,
        ) -> Result<(), UpdateError> {
            Ok(())
        }

        async fn pull_configuration(&self, _target: &str) -> Result<Configuration, UpdateError> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(self.live.clone())
        }
    }

    fn config(value: &str) -> Configuration {
        let mut c = Configuration::new();
        c.put("x", Property::scalar(value));
        c
    }

    fn reader(live: &str) -> (LiveConfigReader, Arc<InMemoryHistoryStore>, Arc<PullOnlyGateway>) {
        let store = Arc::new(InMemoryHistoryStore::new(50));
        let gateway = Arc::new(PullOnlyGateway::new(config(live)));
        let reader = LiveConfigReader::new(
            Arc::clone(&store) as Arc<dyn HistoryStore>,
            Arc::clone(&gateway) as Arc<dyn AgentGateway>,
        );
        (reader, store, gateway)
    }

    #[tokio::test]
    async fn test_first_read_materializes_baseline() {
        let (reader, store, gateway) = reader("live-value");

        let value = reader
            .get_live("web-01", false, UpdateKind::Resource)
            .await
            .unwrap();
        assert_eq!(value, config("live-value"));
        assert_eq!(gateway.pulls.load(Ordering::SeqCst), 1);

        // The very first read created the first record
        let baseline = store.latest("web-01").await.unwrap();
        assert_eq!(baseline.status, UpdateStatus::Success);
        assert_eq!(baseline.requested_by, SYSTEM_PRINCIPAL);
        assert_eq!(baseline.configuration, config("live-value"));
    }

    #[tokio::test]
    async fn test_cached_value_avoids_the_agent() {
        let (reader, _store, gateway) = reader("live-value");

        reader
            .get_live("web-01", false, UpdateKind::Resource)
            .await
            .unwrap();
        reader
            .get_live("web-01", false, UpdateKind::Resource)
            .await
            .unwrap();

        // Second read came from history
        assert_eq!(gateway.pulls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forced_refresh_detects_drift() {
        let (reader, store, gateway) = reader("drifted");

        // Seed history with an older confirmed value
        store
            .append(NewRecord {
                target: "web-01".to_string(),
                kind: UpdateKind::Resource,
                configuration: config("stale"),
                status: UpdateStatus::Success,
                requested_by: "alice".to_string(),
            })
            .await
            .unwrap();

        let value = reader
            .get_live("web-01", true, UpdateKind::Resource)
            .await
            .unwrap();
        assert_eq!(value, config("drifted"));
        assert_eq!(gateway.pulls.load(Ordering::SeqCst), 1);

        // The drifted value became the new baseline
        let latest = store.latest("web-01").await.unwrap();
        assert_eq!(latest.configuration, config("drifted"));
        assert_eq!(latest.requested_by, SYSTEM_PRINCIPAL);
        assert_eq!(store.count("web-01").await, 2);
    }

    #[tokio::test]
    async fn test_in_flight_update_suppresses_materialization() {
        let (reader, store, _gateway) = reader("live-value");

        store
            .append(NewRecord {
                target: "web-01".to_string(),
                kind: UpdateKind::Resource,
                configuration: config("desired"),
                status: UpdateStatus::InProgress,
                requested_by: "alice".to_string(),
            })
            .await
            .unwrap();

        let value = reader
            .get_live("web-01", true, UpdateKind::Resource)
            .await
            .unwrap();
        // The pulled value is returned but not recorded
        assert_eq!(value, config("live-value"));
        assert_eq!(store.count("web-01").await, 1);

        // And the unconfirmed in-flight value is never surfaced as "last known good"
        assert!(reader.last_known_good("web-01").await.is_none());
    }
}
