//! Typed configuration (§6), loaded once from a JSON file and
//! overridable via environment variables. Mirrors the teacher's
//! `WorkflowConfigIndex::load_from_file` (`bpmn_integration/config.rs`):
//! read the file with `anyhow::Context`, parse, then lift into process
//! state.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Fields marked `hot_reload` below can be updated at runtime through the
/// `PUT config` control-surface handler without restarting the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub poll_interval_seconds: u64,
    pub max_concurrent_syncs: usize,
    pub snapshot_directory: String,
    pub log_level: String,

    pub root_ids: Vec<String>,
    pub excluded_root_ids: Vec<String>,

    pub auto_sync: bool,
    pub auto_extract_new_roots: bool,
    pub auto_test_case_extraction: bool,

    pub retry_attempts: u32,
    pub retry_delay_seconds: u64,

    pub requirement_type: String,
    pub user_story_type: String,
    pub story_extraction_type: String,
    pub test_case_extraction_type: String,

    /// hot_reload
    pub enable_compact_extraction: bool,
    /// hot_reload
    pub change_significance_threshold: f64,
    /// hot_reload
    pub max_changes_per_root: u32,

    /// hot_reload
    pub title_change_weight: f64,
    /// hot_reload
    pub description_change_weight: f64,
    /// hot_reload
    pub state_change_weight: f64,

    /// hot_reload
    pub extraction_cooldown_hours: i64,

    /// hot_reload
    pub archive_orphans: bool,

    pub manual_override_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_interval_seconds: 300,
            max_concurrent_syncs: 3,
            snapshot_directory: "data/snapshots".to_string(),
            log_level: "info".to_string(),
            root_ids: Vec::new(),
            excluded_root_ids: Vec::new(),
            auto_sync: true,
            auto_extract_new_roots: true,
            auto_test_case_extraction: false,
            retry_attempts: 3,
            retry_delay_seconds: 60,
            requirement_type: "Epic".to_string(),
            user_story_type: "User Story".to_string(),
            story_extraction_type: "story_extraction".to_string(),
            test_case_extraction_type: "test_case_extraction".to_string(),
            enable_compact_extraction: true,
            change_significance_threshold: 0.3,
            max_changes_per_root: 10,
            title_change_weight: 0.8,
            description_change_weight: 0.6,
            state_change_weight: 0.2,
            extraction_cooldown_hours: 0,
            archive_orphans: false,
            manual_override_enabled: true,
        }
    }
}

impl Config {
    /// Load from a JSON file, falling back to defaults for any field the
    /// file omits, then apply environment overrides.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("POLL_INTERVAL_SECONDS") {
            if let Ok(parsed) = v.parse() {
                self.poll_interval_seconds = parsed;
            }
        }
        if let Ok(v) = std::env::var("MAX_CONCURRENT_SYNCS") {
            if let Ok(parsed) = v.parse() {
                self.max_concurrent_syncs = parsed;
            }
        }
        if let Ok(v) = std::env::var("SNAPSHOT_DIRECTORY") {
            self.snapshot_directory = v;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("CHANGE_SIGNIFICANCE_THRESHOLD") {
            if let Ok(parsed) = v.parse() {
                self.change_significance_threshold = parsed;
            }
        }
        if let Ok(v) = std::env::var("AUTO_TEST_CASE_EXTRACTION") {
            if let Ok(parsed) = v.parse() {
                self.auto_test_case_extraction = parsed;
            }
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.requirement_type.is_empty() {
            return Err(ConfigError::MissingField("requirement_type".into()));
        }
        if !(0.0..=1.0).contains(&self.change_significance_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "change_significance_threshold".into(),
                reason: "must be within [0, 1]".into(),
            });
        }
        if self.max_concurrent_syncs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_syncs".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Apply a partial JSON update (the `PUT config` control-surface
    /// handler). Only hot-reloadable fields are accepted; the fields
    /// marked `hot_reload` in the struct doc above.
    pub fn apply_partial_update(&mut self, patch: &serde_json::Value) -> ConfigResult<()> {
        if let Some(v) = patch.get("enable_compact_extraction").and_then(|v| v.as_bool()) {
            self.enable_compact_extraction = v;
        }
        if let Some(v) = patch.get("change_significance_threshold").and_then(|v| v.as_f64()) {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::InvalidValue {
                    field: "change_significance_threshold".into(),
                    reason: "must be within [0, 1]".into(),
                });
            }
            self.change_significance_threshold = v;
        }
        if let Some(v) = patch.get("max_changes_per_root").and_then(|v| v.as_u64()) {
            self.max_changes_per_root = v as u32;
        }
        if let Some(v) = patch.get("title_change_weight").and_then(|v| v.as_f64()) {
            self.title_change_weight = v;
        }
        if let Some(v) = patch.get("description_change_weight").and_then(|v| v.as_f64()) {
            self.description_change_weight = v;
        }
        if let Some(v) = patch.get("state_change_weight").and_then(|v| v.as_f64()) {
            self.state_change_weight = v;
        }
        if let Some(v) = patch.get("extraction_cooldown_hours").and_then(|v| v.as_i64()) {
            self.extraction_cooldown_hours = v;
        }
        if let Some(v) = patch.get("archive_orphans").and_then(|v| v.as_bool()) {
            self.archive_orphans = v;
        }
        Ok(())
    }

    pub fn weights(&self) -> crate::significance::Weights {
        crate::significance::Weights {
            title: self.title_change_weight,
            description: self.description_change_weight,
            state: self.state_change_weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let mut config = Config::default();
        config.change_significance_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_update_rejects_invalid_threshold() {
        let mut config = Config::default();
        let patch = serde_json::json!({ "change_significance_threshold": 2.0 });
        assert!(config.apply_partial_update(&patch).is_err());
        assert_eq!(config.change_significance_threshold, 0.3);
    }

    #[test]
    fn partial_update_applies_hot_reload_fields() {
        let mut config = Config::default();
        let patch = serde_json::json!({ "change_significance_threshold": 0.5, "archive_orphans": true });
        config.apply_partial_update(&patch).unwrap();
        assert_eq!(config.change_significance_threshold, 0.5);
        assert!(config.archive_orphans);
    }
}
