//! Resource and group directory boundary
//!
//! Resolves group ids to their member targets and answers target existence.
//! Group membership is read once at fan-out time; later membership changes do
//! not affect an already-dispatched group update.

use async_trait::async_trait;
use std::collections::HashMap;

/// Inventory seam consumed by the coordinator and group orchestrator
#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    /// Whether the target exists and its owning agent session is open
    async fn target_exists(&self, target: &str) -> bool;

    /// Snapshot of the group's current member targets, or `None` for an
    /// unknown group
    async fn group_members(&self, group: &str) -> Option<Vec<String>>;
}

/// Directory backed by fixed maps; useful for tests and single-process embedders
#[derive(Debug, Default)]
pub struct StaticDirectory {
    targets: Vec<String>,
    groups: HashMap<String, Vec<String>>,
}

impl StaticDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    /// Register a group and its members (members are registered as targets too)
    pub fn with_group(
        mut self,
        group: impl Into<String>,
        members: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let members: Vec<String> = members.into_iter().map(Into::into).collect();
        for member in &members {
            if !self.targets.contains(member) {
                self.targets.push(member.clone());
            }
        }
        self.groups.insert(group.into(), members);
        self
    }
}

#[async_trait]
impl ResourceDirectory for StaticDirectory {
    async fn target_exists(&self, target: &str) -> bool {
        self.targets.iter().any(|t| t == target)
    }

    async fn group_members(&self, group: &str) -> Option<Vec<String>> {
        self.groups.get(group).cloned()
    }
}
