//! Error types for the update orchestration engine
//!
//! Admission-time errors (`PermissionDenied`, `UpdateInProgress`) are returned
//! synchronously to the caller that requested the update and carry no side
//! effects. Everything that happens after dispatch is recorded on the terminal
//! FAILURE state of the relevant history record instead of being thrown into
//! an unrelated call stack.

use uuid::Uuid;

/// Errors surfaced by the orchestration engine
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Caller lacks write permission on the target or group
    #[error("principal [{principal}] does not have permission to modify configuration for [{target}]")]
    PermissionDenied { principal: String, target: String },

    /// The target already has an update in progress; retry once it finishes
    #[error("target [{target}] has a configuration update already in progress - wait for it to finish")]
    UpdateInProgress { target: String },

    /// A finalize was attempted against a record that already reached a terminal status
    #[error("update record [{id}] has already been finalized")]
    AlreadyFinalized { id: Uuid },

    /// Purge would leave a configured target with no history at all
    #[error("record is the only history entry for target [{target}] - purge refused without force")]
    RetentionInvariant { target: String },

    /// No history record exists with the given id
    #[error("no update record found with id [{id}]")]
    RecordNotFound { id: Uuid },

    /// The target is not known to the resource directory
    #[error("unknown target [{target}]")]
    UnknownTarget { target: String },

    /// The group is not known to the resource directory
    #[error("unknown group [{group}]")]
    UnknownGroup { group: String },

    /// A bounded wait elapsed before the group update reached a terminal status
    #[error("group update [{group}] did not reach a terminal status within the deadline")]
    WaitTimedOut { group: String },

    /// The remote transport to the agent could not be reached
    #[error("agent transport error: {0}")]
    Transport(String),

    /// A record was asked to transition into a non-terminal status
    #[error("cannot finalize record [{id}] to non-terminal status")]
    InvalidStatus { id: Uuid },
}
