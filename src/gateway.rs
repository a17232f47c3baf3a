//! Agent gateway boundary
//!
//! This module defines the RPC seam to remote agents. Pushing a configuration
//! is fire-and-forget: the call returns once the request is handed to the
//! transport, and the agent later reports the outcome back through
//! [`crate::engine::UpdateEngine::complete_update`] with a
//! [`CompletionReport`]. Pulling is a synchronous round trip. The gateway
//! holds no shared mutable state between calls to different targets.

use crate::configuration::Configuration;
use crate::error::UpdateError;
use async_trait::async_trait;
use uuid::Uuid;

/// Transport-level outcome reported by the agent for one update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    /// The agent applied the configuration
    Success,
    /// The agent failed to apply the configuration
    Failure,
}

/// Inbound completion callback payload from an agent
///
/// `correlation_id` is the history record id the update was dispatched with.
/// When `configuration` carries per-property error annotations the engine
/// forces the record to FAILURE regardless of `status`.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub correlation_id: Uuid,
    pub status: ReportStatus,
    pub configuration: Option<Configuration>,
    pub error: Option<String>,
}

impl CompletionReport {
    /// A success report confirming the applied configuration
    pub fn success(correlation_id: Uuid, configuration: Configuration) -> Self {
        Self {
            correlation_id,
            status: ReportStatus::Success,
            configuration: Some(configuration),
            error: None,
        }
    }

    /// A failure report with an error message and optionally the annotated configuration
    pub fn failure(
        correlation_id: Uuid,
        configuration: Option<Configuration>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            status: ReportStatus::Failure,
            configuration,
            error: Some(error.into()),
        }
    }
}

/// RPC boundary to remote agents
#[async_trait]
pub trait AgentGateway: Send + Sync {
    /// Hand a configuration to the agent owning `target` for asynchronous
    /// application. An `Err` means the transport itself could not be reached;
    /// the outcome of a successfully handed-off push arrives later as a
    /// [`CompletionReport`].
    async fn push_configuration(
        &self,
        target: &str,
        configuration: &Configuration,
        correlation_id: Uuid,
    ) -> Result<(), UpdateError>;

    /// Fetch the live configuration currently in effect on the agent
    async fn pull_configuration(&self, target: &str) -> Result<Configuration, UpdateError>;
}
