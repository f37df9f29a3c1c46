//! Snapshot Store (§4.A): one JSON file per root, written via
//! temp-file + atomic rename so the file on disk is always either the
//! pre-sync or post-sync version (invariant 6, §3). Load failures
//! degrade to "no previous snapshot" and are logged rather than failing
//! the caller, per §4.A.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::models::{RootType, Snapshot};

pub struct SnapshotStore {
    directory: PathBuf,
}

impl SnapshotStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        SnapshotStore {
            directory: directory.into(),
        }
    }

    /// `{root_type}_{id}.json`, lower-cased type prefix, per spec scenario
    /// S1's literal filename (`epic_E1.json`).
    fn path_for(&self, root_type: RootType, id: &str) -> PathBuf {
        // Root IDs are tracker-assigned opaque strings; sanitize path
        // separators so a hostile/odd ID can't escape the directory.
        let safe_id: String = id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let prefix = root_type.as_str().to_lowercase();
        self.directory.join(format!("{prefix}_{safe_id}.json"))
    }

    pub fn load(&self, root_type: RootType, id: &str) -> Option<Snapshot> {
        let path = self.path_for(root_type, id);
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(root_id = %id, error = %e, "failed to parse snapshot, treating as no previous snapshot");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(root_id = %id, error = %e, "failed to read snapshot, treating as no previous snapshot");
                None
            }
        }
    }

    pub fn save(&self, root_type: RootType, id: &str, snapshot: &Snapshot) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.directory)?;
        let path = self.path_for(root_type, id);
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn delete(&self, root_type: RootType, id: &str) -> anyhow::Result<()> {
        let path = self.path_for(root_type, id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns bare root IDs, stripping the `{type}_` prefix and `.json`
    /// suffix from every snapshot file found.
    pub fn list(&self) -> anyhow::Result<Vec<String>> {
        if !self.directory.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Some((_, id)) = stem.split_once('_') {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RootType, SnapshotMetadata};
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample_snapshot() -> Snapshot {
        let now = Utc::now();
        Snapshot {
            title: "Checkout".to_string(),
            description: "Users purchase".to_string(),
            state: "New".to_string(),
            priority: None,
            area_path: None,
            iteration_path: None,
            content_hash: "abc123".to_string(),
            last_modified: now,
            captured_at: now,
            enhanced_metadata: SnapshotMetadata {
                last_updated: now,
                monitor_version: "test".to_string(),
            },
        }
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store.load(RootType::Epic, "E1").is_none());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let snapshot = sample_snapshot();
        store.save(RootType::Epic, "E1", &snapshot).unwrap();
        let loaded = store.load(RootType::Epic, "E1").unwrap();
        assert_eq!(loaded.content_hash, snapshot.content_hash);
    }

    #[test]
    fn save_names_file_by_root_type() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(RootType::Epic, "E1", &sample_snapshot()).unwrap();
        assert!(dir.path().join("epic_E1.json").exists());
    }

    #[test]
    fn save_is_atomic_no_tmp_left_behind() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(RootType::Epic, "E1", &sample_snapshot()).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].as_ref().unwrap().file_name().to_string_lossy().ends_with(".json"));
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(RootType::Epic, "E1", &sample_snapshot()).unwrap();
        store.delete(RootType::Epic, "E1").unwrap();
        assert!(store.load(RootType::Epic, "E1").is_none());
    }

    #[test]
    fn corrupt_file_degrades_to_none() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        std::fs::write(dir.path().join("epic_E1.json"), "not json").unwrap();
        assert!(store.load(RootType::Epic, "E1").is_none());
    }

    #[test]
    fn list_returns_known_ids() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(RootType::Epic, "E1", &sample_snapshot()).unwrap();
        store.save(RootType::Epic, "E2", &sample_snapshot()).unwrap();
        let mut ids = store.list().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["E1".to_string(), "E2".to_string()]);
    }
}
