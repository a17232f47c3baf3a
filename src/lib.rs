//! Confsync - Configuration update orchestration engine
//!
//! This crate propagates desired configurations from a central authority to
//! remote-managed endpoints, tracks the lifecycle of each propagation
//! asynchronously in a durable history ledger, and aggregates per-member
//! outcomes of group updates into a single queryable record.

pub mod config;
pub mod configuration;
pub mod coordinator;
pub mod directory;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod group;
pub mod history;
pub mod live;
pub mod permission;
pub mod retention;
pub mod sweeper;
pub mod validate;

pub use config::{load_engine_config, EngineConfig};
pub use configuration::{Configuration, ConflictPolicy, Property, PropertyValue};
pub use coordinator::{UpdateCoordinator, UpdateOutcome};
pub use directory::{ResourceDirectory, StaticDirectory};
pub use engine::UpdateEngine;
pub use error::UpdateError;
pub use gateway::{AgentGateway, CompletionReport, ReportStatus};
pub use group::{GroupUpdateRecord, MemberDisposition};
pub use history::{
    HistoryCriteria, HistoryStore, InMemoryHistoryStore, Page, SortOrder, UpdateRecord,
    UpdateStatus,
};
pub use permission::{AllowAllPermissions, PermissionService, StaticPermissions};
pub use validate::{ConfigValidator, UpdateKind};
