//! Processed-Item Ledger (§4.B): a durable `map<RootType, set<RootID>>`,
//! written whole on every change under a mutex, with legacy flat-list
//! migration performed on load and written back on first change.
//! Grounded on `enhanced_monitor.py::_load_processed_epics` /
//! `_save_processed_epics` in `original_source/`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::RootType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeExtractionStat {
    pub change_extraction_count: u32,
    pub last_significant_change: Option<DateTime<Utc>>,
    pub last_change_significance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerFile {
    processed_items_by_type: HashMap<String, Vec<String>>,
    current_requirement_type: String,
    last_updated: DateTime<Utc>,
    #[serde(default)]
    change_extraction_stats: HashMap<String, ChangeExtractionStat>,
}

struct State {
    by_type: HashMap<RootType, HashSet<String>>,
    change_extraction_stats: HashMap<String, ChangeExtractionStat>,
}

pub struct Ledger {
    path: PathBuf,
    current_requirement_type: String,
    state: Mutex<State>,
}

const ALL_ROOT_TYPES: [RootType; 5] = [
    RootType::Epic,
    RootType::Feature,
    RootType::Story,
    RootType::Task,
    RootType::TestCase,
];

impl Ledger {
    pub fn load(path: &Path, current_requirement_type: &str) -> anyhow::Result<Self> {
        let (by_type, change_extraction_stats, dirty_from_migration) = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::parse(&content)?
        } else {
            (HashMap::new(), HashMap::new(), false)
        };

        let ledger = Ledger {
            path: path.to_path_buf(),
            current_requirement_type: current_requirement_type.to_string(),
            state: Mutex::new(State {
                by_type,
                change_extraction_stats,
            }),
        };

        if dirty_from_migration {
            ledger.save_locked()?;
        }

        Ok(ledger)
    }

    /// Parses either the current shape (`processed_items_by_type`) or the
    /// legacy flat-list shape (`processed_epics: [...]`), migrating the
    /// latter into `{Epic: {...}}` in memory (write-back happens once the
    /// caller calls `save`).
    fn parse(
        content: &str,
    ) -> anyhow::Result<(
        HashMap<RootType, HashSet<String>>,
        HashMap<String, ChangeExtractionStat>,
        bool,
    )> {
        let raw: Value = serde_json::from_str(content)?;

        if let Some(obj) = raw.get("processed_items_by_type") {
            let file: LedgerFile = serde_json::from_value(raw.clone())?;
            let mut by_type = HashMap::new();
            for (type_str, ids) in obj.as_object().into_iter().flatten() {
                if let Ok(root_type) = type_str.parse::<RootType>() {
                    by_type.insert(
                        root_type,
                        ids.as_array()
                            .into_iter()
                            .flatten()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect(),
                    );
                }
            }
            return Ok((by_type, file.change_extraction_stats, false));
        }

        if let Some(epics) = raw.get("processed_epics") {
            let ids: HashSet<String> = epics
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            let mut by_type = HashMap::new();
            by_type.insert(RootType::Epic, ids);
            return Ok((by_type, HashMap::new(), true));
        }

        Ok((HashMap::new(), HashMap::new(), false))
    }

    pub fn contains(&self, root_type: RootType, id: &str) -> bool {
        let state = self.state.lock().expect("ledger mutex poisoned");
        state
            .by_type
            .get(&root_type)
            .map(|ids| ids.contains(id))
            .unwrap_or(false)
    }

    pub fn add(&self, root_type: RootType, id: &str) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().expect("ledger mutex poisoned");
            state.by_type.entry(root_type).or_default().insert(id.to_string());
        }
        self.save_locked()
    }

    pub fn remove(&self, root_type: RootType, id: &str) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().expect("ledger mutex poisoned");
            if let Some(ids) = state.by_type.get_mut(&root_type) {
                ids.remove(id);
            }
        }
        self.save_locked()
    }

    pub fn for_type(&self, root_type: RootType) -> HashSet<String> {
        let state = self.state.lock().expect("ledger mutex poisoned");
        state.by_type.get(&root_type).cloned().unwrap_or_default()
    }

    pub fn record_change_extraction(&self, root_id: &str, stat: ChangeExtractionStat) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().expect("ledger mutex poisoned");
            state.change_extraction_stats.insert(root_id.to_string(), stat);
        }
        self.save_locked()
    }

    fn save_locked(&self) -> anyhow::Result<()> {
        let state = self.state.lock().expect("ledger mutex poisoned");
        let mut processed_items_by_type = HashMap::new();
        for root_type in ALL_ROOT_TYPES {
            if let Some(ids) = state.by_type.get(&root_type) {
                let mut ids: Vec<String> = ids.iter().cloned().collect();
                ids.sort();
                processed_items_by_type.insert(root_type.as_str().to_string(), ids);
            }
        }

        let file = LedgerFile {
            processed_items_by_type,
            current_requirement_type: self.current_requirement_type.clone(),
            last_updated: Utc::now(),
            change_extraction_stats: state.change_extraction_stats.clone(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(&file)?)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_and_contains_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let ledger = Ledger::load(&path, "Epic").unwrap();
        assert!(!ledger.contains(RootType::Epic, "E1"));
        ledger.add(RootType::Epic, "E1").unwrap();
        assert!(ledger.contains(RootType::Epic, "E1"));
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        {
            let ledger = Ledger::load(&path, "Epic").unwrap();
            ledger.add(RootType::Epic, "E1").unwrap();
        }
        let reloaded = Ledger::load(&path, "Epic").unwrap();
        assert!(reloaded.contains(RootType::Epic, "E1"));
    }

    #[test]
    fn migrates_legacy_flat_list_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, r#"{"processed_epics": ["1", "2"]}"#).unwrap();

        let ledger = Ledger::load(&path, "Epic").unwrap();
        assert!(ledger.contains(RootType::Epic, "1"));
        assert!(ledger.contains(RootType::Epic, "2"));

        // write-back happened: the file is now in the current shape.
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("processed_items_by_type"));
    }

    #[test]
    fn switching_requirement_type_preserves_other_types_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let ledger = Ledger::load(&path, "Epic").unwrap();
        ledger.add(RootType::Epic, "E1").unwrap();

        // Switch the monitored type: a fresh Ledger handle with a new
        // current_requirement_type still sees the Epic entries.
        let switched = Ledger::load(&path, "Feature").unwrap();
        assert!(switched.contains(RootType::Epic, "E1"));
        switched.add(RootType::Feature, "F1").unwrap();
        assert!(switched.contains(RootType::Epic, "E1"));
        assert!(switched.contains(RootType::Feature, "F1"));
    }

    #[test]
    fn remove_then_contains_false() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let ledger = Ledger::load(&path, "Epic").unwrap();
        ledger.add(RootType::Epic, "E1").unwrap();
        ledger.remove(RootType::Epic, "E1").unwrap();
        assert!(!ledger.contains(RootType::Epic, "E1"));
    }
}
