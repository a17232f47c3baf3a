//! Kind-specific configuration validation
//!
//! One coordinator serves both plugin-level and resource-level updates; the
//! difference is captured by [`UpdateKind`] on the record plus a
//! [`ConfigValidator`] strategy, not by separate coordinator types. A locally
//! detected invalid value does not block admission: the record is created and
//! then finalized straight to FAILURE with the offending properties annotated,
//! the same shape an agent-side validation failure takes.

use crate::configuration::{Configuration, PropertyValue};
use serde::{Deserialize, Serialize};

/// Which configuration of the target an update applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    /// Connection/plugin-level configuration
    Plugin,
    /// The managed resource's own configuration
    Resource,
}

/// Strategy for local validation of a desired configuration before dispatch
///
/// Returns the configuration with error annotations added to any invalid
/// properties, or `None` when everything checks out.
pub trait ConfigValidator: Send + Sync {
    fn validate(&self, configuration: &Configuration) -> Option<Configuration>;
}

/// Validator that performs no local checks and defers entirely to the agent
#[derive(Debug, Default)]
pub struct DeferToAgent;

impl ConfigValidator for DeferToAgent {
    fn validate(&self, _configuration: &Configuration) -> Option<Configuration> {
        None
    }
}

/// Baseline structural checks shared by both kinds: property names must be
/// non-empty and scalar values must be single-line.
#[derive(Debug, Default)]
pub struct StructuralValidator;

impl ConfigValidator for StructuralValidator {
    fn validate(&self, configuration: &Configuration) -> Option<Configuration> {
        let mut annotated = configuration.clone();
        let mut found_error = false;

        for (name, property) in configuration.iter() {
            let mut property = property.clone();

            if name.trim().is_empty() {
                property.error = Some("property name must not be empty".to_string());
            } else if let PropertyValue::Scalar(value) = &property.value {
                if value.contains('\n') {
                    property.error = Some("scalar values must be single-line".to_string());
                }
            }

            if property.error.is_some() {
                found_error = true;
                annotated.put(name.clone(), property);
            }
        }

        found_error.then_some(annotated)
    }
}

/// Pick the default validator for an update kind
pub fn default_validator(kind: UpdateKind) -> Box<dyn ConfigValidator> {
    match kind {
        // Plugin configurations are interpreted by the server-side plugin
        // container, so structural problems can be caught before dispatch.
        UpdateKind::Plugin => Box::new(StructuralValidator),
        // Resource configurations are opaque to the server; the agent decides.
        UpdateKind::Resource => Box::new(DeferToAgent),
    }
}
