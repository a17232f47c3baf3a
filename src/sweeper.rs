//! Timeout sweeper for orphaned updates
//!
//! An agent that dies mid-update never sends its completion callback, which
//! would leave the record INPROGRESS forever and block every future update to
//! that target. The sweeper periodically scans for in-progress records older
//! than the configured deadline and fails them with a timeout message.

use crate::coordinator::UpdateCoordinator;
use crate::history::HistoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::debug;

/// Background task failing updates that outlived the deadline
pub struct TimeoutSweeper {
    store: Arc<dyn HistoryStore>,
    coordinator: Arc<UpdateCoordinator>,
    timeout_secs: u64,
    sweep_interval_secs: u64,
}

impl TimeoutSweeper {
    /// Create a sweeper
    pub fn new(
        store: Arc<dyn HistoryStore>,
        coordinator: Arc<UpdateCoordinator>,
        timeout_secs: u64,
        sweep_interval_secs: u64,
    ) -> Self {
        Self {
            store,
            coordinator,
            timeout_secs,
            sweep_interval_secs,
        }
    }

    /// Run the periodic scan until the owning task is aborted
    pub async fn run(self) {
        let mut interval_timer = interval(Duration::from_secs(self.sweep_interval_secs.max(1)));
        // The first tick fires immediately; skip it so a fresh engine does not
        // sweep before anything could possibly have timed out.
        interval_timer.tick().await;

        loop {
            interval_timer.tick().await;
            self.sweep_once().await;
        }
    }

    /// Scan once for timed-out updates and fail them
    pub async fn sweep_once(&self) {
        debug!("Scanning update requests to see if any in-progress executions have timed out");

        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(self.timeout_secs as i64);
        let orphans = self.store.in_progress_older_than(cutoff).await;

        for record in orphans {
            self.coordinator
                .fail_timed_out(&record, self.timeout_secs)
                .await;
        }
    }
}
