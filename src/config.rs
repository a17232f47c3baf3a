//! Configuration management for the update engine
//!
//! This module provides the engine's own tuning knobs and loading
//! functionality. Not to be confused with [`crate::configuration`], which
//! models the configurations being pushed to remote targets.

use serde::{Deserialize, Serialize};

/// Engine tuning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an in-progress update may run before the sweeper fails it (seconds)
    pub in_progress_timeout_secs: u64,
    /// Interval between sweeper scans for timed-out updates (seconds)
    pub sweep_interval_secs: u64,
    /// Default page size for history queries
    pub default_page_size: usize,
    /// Whether to skip updates whose desired configuration equals the current one
    pub detect_unchanged: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            in_progress_timeout_secs: 60 * 60, // 1 hour
            sweep_interval_secs: 60,           // 1 minute
            default_page_size: 50,
            detect_unchanged: true,
        }
    }
}

/// Load engine configuration from the config directory
///
/// Looks for `engine.yml`, `engine.json`, or `engine.toml` in that order and
/// falls back to defaults when no file exists.
pub fn load_engine_config(
    config_dir: &std::path::Path,
) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let yaml_path = config_dir.join("engine.yml");
    let json_path = config_dir.join("engine.json");
    let toml_path = config_dir.join("engine.toml");

    let contents = if yaml_path.exists() {
        std::fs::read_to_string(&yaml_path)?
    } else if json_path.exists() {
        std::fs::read_to_string(&json_path)?
    } else if toml_path.exists() {
        std::fs::read_to_string(&toml_path)?
    } else {
        // Return default configuration if no config file exists
        return Ok(EngineConfig::default());
    };

    let config: EngineConfig = if yaml_path.exists() {
        serde_yaml::from_str(&contents)?
    } else if json_path.exists() {
        serde_json::from_str(&contents)?
    } else {
        toml::from_str(&contents)?
    };

    Ok(config)
}
