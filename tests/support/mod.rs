//! Shared test support: a scripted agent gateway and bounded-wait helpers

use async_trait::async_trait;
use confsync::{AgentGateway, Configuration, Property, UpdateError};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, Once};
use std::time::Duration;
use uuid::Uuid;

static INIT_TRACING: Once = Once::new();

/// Install a tracing subscriber honoring RUST_LOG, once per test binary
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Gateway that records pushes for the test to answer and serves scripted
/// live configurations for pulls
#[derive(Default)]
pub struct ScriptedGateway {
    pushes: Mutex<Vec<(String, Uuid)>>,
    unreachable: Mutex<HashSet<String>>,
    live: Mutex<HashMap<String, Configuration>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make pushes to this target fail at the transport level
    pub fn set_unreachable(&self, target: &str) {
        self.unreachable.lock().unwrap().insert(target.to_string());
    }

    /// Script the live configuration a pull will return for a target
    pub fn set_live(&self, target: &str, configuration: Configuration) {
        self.live
            .lock()
            .unwrap()
            .insert(target.to_string(), configuration);
    }

    /// All pushes recorded so far, as (target, correlation id) pairs
    pub fn pushes(&self) -> Vec<(String, Uuid)> {
        self.pushes.lock().unwrap().clone()
    }

    /// Wait with a bounded deadline until `n` pushes have been recorded
    pub async fn wait_for_pushes(&self, n: usize, deadline: Duration) -> Vec<(String, Uuid)> {
        let started = std::time::Instant::now();
        loop {
            let pushes = self.pushes();
            if pushes.len() >= n {
                return pushes;
            }
            assert!(
                started.elapsed() < deadline,
                "expected {} pushes within {:?}, saw {}",
                n,
                deadline,
                pushes.len()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl AgentGateway for ScriptedGateway {
    async fn push_configuration(
        &self,
        target: &str,
        _configuration: &Configuration,
        correlation_id: Uuid,
    ) -> Result<(), UpdateError> {
        if self.unreachable.lock().unwrap().contains(target) {
            return Err(UpdateError::Transport(format!(
                "no route to agent for [{}]",
                target
            )));
        }
        self.pushes
            .lock()
            .unwrap()
            .push((target.to_string(), correlation_id));
        Ok(())
    }

    async fn pull_configuration(&self, target: &str) -> Result<Configuration, UpdateError> {
        self.live
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .ok_or_else(|| UpdateError::Transport(format!("no route to agent for [{}]", target)))
    }
}

/// Build a flat configuration from string pairs
pub fn config(pairs: &[(&str, &str)]) -> Configuration {
    let mut c = Configuration::new();
    for (name, value) in pairs {
        c.put(*name, Property::scalar(*value));
    }
    c
}

/// Poll a condition with a bounded deadline instead of spinning forever
pub async fn wait_until<F, Fut>(deadline: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = std::time::Instant::now();
    while !condition().await {
        assert!(
            started.elapsed() < deadline,
            "condition not met within {:?}",
            deadline
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
