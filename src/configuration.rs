//! Configuration value object
//!
//! This module provides the property bag that travels between the server and
//! remote agents: an ordered mapping of property names to scalar, list, or
//! nested map values. Each property can carry a validation error reported by
//! the agent (or detected locally), which is preserved on the stored history
//! record so users can diagnose a failed update.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single property value: a scalar, a list of properties, or a nested map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Simple scalar value, stored as its string representation
    Scalar(String),
    /// Ordered list of member properties
    List(Vec<Property>),
    /// Nested property map
    Map(BTreeMap<String, Property>),
}

/// A named property's value together with an optional validation error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// The property value
    pub value: PropertyValue,
    /// Validation error reported for this value, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Property {
    /// Create a scalar property with no error annotation
    pub fn scalar(value: impl Into<String>) -> Self {
        Self {
            value: PropertyValue::Scalar(value.into()),
            error: None,
        }
    }

    /// Create a scalar property annotated with a validation error
    pub fn scalar_with_error(value: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            value: PropertyValue::Scalar(value.into()),
            error: Some(error.into()),
        }
    }

    /// Whether this property or any nested member carries a validation error
    pub fn has_error(&self) -> bool {
        if self.error.is_some() {
            return true;
        }

        match &self.value {
            PropertyValue::Scalar(_) => false,
            PropertyValue::List(members) => members.iter().any(Property::has_error),
            PropertyValue::Map(members) => members.values().any(Property::has_error),
        }
    }
}

/// Policy for resolving conflicts when merging two configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Properties from the other configuration win on name collision
    TheirsWins,
    /// Existing properties win; colliding properties from the other side are dropped
    OursWins,
}

/// An ordered bag of named properties representing a desired or actual
/// configuration state.
///
/// Equality is structural: two configurations with the same property names,
/// values, and error annotations are equal regardless of how they were built.
/// A configuration is freely mutable while a caller assembles it; once it is
/// attached to a finalized history record the store only ever hands out clones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    properties: BTreeMap<String, Property>,
}

impl Configuration {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a property by name
    pub fn get(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Set a property, replacing any previous value under the same name
    pub fn put(&mut self, name: impl Into<String>, property: Property) {
        self.properties.insert(name.into(), property);
    }

    /// Remove a property, returning the previous value if one existed
    pub fn remove(&mut self, name: &str) -> Option<Property> {
        self.properties.remove(name)
    }

    /// Merge another configuration into this one.
    ///
    /// Non-colliding properties are always taken; colliding names are resolved
    /// by the given policy.
    pub fn merge(&mut self, other: &Configuration, policy: ConflictPolicy) {
        for (name, property) in &other.properties {
            match policy {
                ConflictPolicy::TheirsWins => {
                    self.properties.insert(name.clone(), property.clone());
                }
                ConflictPolicy::OursWins => {
                    self.properties
                        .entry(name.clone())
                        .or_insert_with(|| property.clone());
                }
            }
        }
    }

    /// Number of top-level properties
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether the configuration has no properties at all
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Iterate over properties in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Property)> {
        self.properties.iter()
    }

    /// Whether any property (at any nesting depth) carries a validation error
    pub fn has_errors(&self) -> bool {
        self.properties.values().any(Property::has_error)
    }

    /// Names of top-level properties that carry a validation error
    pub fn error_property_names(&self) -> Vec<&str> {
        self.properties
            .iter()
            .filter(|(_, p)| p.has_error())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl FromIterator<(String, Property)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (String, Property)>>(iter: I) -> Self {
        Self {
            properties: iter.into_iter().collect(),
        }
    }
}
