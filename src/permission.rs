//! Permission service boundary
//!
//! An update requires write permission on its target (or group); the check
//! runs before any history record is created so a denied request has no side
//! effects.

use async_trait::async_trait;
use std::collections::HashSet;

/// Authorization seam consumed by the coordinator and group orchestrator
#[async_trait]
pub trait PermissionService: Send + Sync {
    /// Whether the principal may modify the configuration of the given target
    /// or group id
    async fn has_write_permission(&self, principal: &str, target_or_group: &str) -> bool;
}

/// Permission service that allows every principal; useful for embedders that
/// enforce authorization upstream, and for tests
#[derive(Debug, Default)]
pub struct AllowAllPermissions;

#[async_trait]
impl PermissionService for AllowAllPermissions {
    async fn has_write_permission(&self, _principal: &str, _target_or_group: &str) -> bool {
        true
    }
}

/// Permission service backed by a fixed deny list
#[derive(Debug, Default)]
pub struct StaticPermissions {
    denied: HashSet<(String, String)>,
}

impl StaticPermissions {
    /// Create a service that allows everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny a specific principal write access to a specific target or group
    pub fn deny(mut self, principal: impl Into<String>, target_or_group: impl Into<String>) -> Self {
        self.denied.insert((principal.into(), target_or_group.into()));
        self
    }
}

#[async_trait]
impl PermissionService for StaticPermissions {
    async fn has_write_permission(&self, principal: &str, target_or_group: &str) -> bool {
        !self
            .denied
            .contains(&(principal.to_string(), target_or_group.to_string()))
    }
}
