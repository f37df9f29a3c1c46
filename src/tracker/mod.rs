//! Tracker Adapter contract (§6): CRUD + hierarchy traversal over the
//! work-item tracker. This is an external collaborator per §1 — the
//! core only depends on this trait, never on a concrete tracker SDK,
//! mirroring how the teacher's `DslExecutorV2` trait
//! (`repl::orchestrator_v2`) lets `JobWorker` stay agnostic of the
//! concrete executor behind it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TrackerError;
use crate::models::{ExistingChild, Root, RootType};

pub mod ado;

/// Loosely-typed field bag for create/update calls. The core never
/// constructs tracker-specific payloads (e.g. step-list XML); it hands
/// the adapter raw strings/lists and the adapter translates them.
pub type FieldMap = HashMap<String, Value>;

#[derive(Debug, Clone)]
pub struct FeatureNode {
    pub id: String,
    pub title: String,
    pub stories: Vec<ExistingChild>,
}

#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    pub features: Vec<FeatureNode>,
}

#[async_trait]
pub trait TrackerAdapter: Send + Sync {
    async fn get_root(&self, id: &str) -> Result<Root, TrackerError>;
    async fn get_children(&self, id: &str) -> Result<Vec<ExistingChild>, TrackerError>;
    async fn get_hierarchy(&self, root_id: &str) -> Result<Hierarchy, TrackerError>;
    async fn list_by_type(&self, root_type: RootType) -> Result<Vec<String>, TrackerError>;
    async fn create(
        &self,
        root_type: RootType,
        fields: FieldMap,
        parent: Option<&str>,
    ) -> Result<String, TrackerError>;
    async fn update(&self, id: &str, fields: FieldMap) -> Result<(), TrackerError>;
    async fn link_parent_child(&self, parent: &str, child: &str) -> Result<(), TrackerError>;
    /// `Ok(true)` exists, `Ok(false)` does not exist but tracker reachable,
    /// `Err` for a transient failure.
    async fn exists(&self, id: &str) -> Result<bool, TrackerError>;
}

/// Build the field map for a newly created or updated story, from a
/// `ProposedStory`. Step/XML formatting for test cases is left entirely
/// to the adapter (§4.H step 7); this only carries plain fields.
pub fn story_fields(story: &crate::models::ProposedStory) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("title".to_string(), Value::String(story.heading.clone()));
    fields.insert(
        "description".to_string(),
        Value::String(story.description.clone()),
    );
    fields.insert(
        "acceptance_criteria".to_string(),
        Value::Array(
            story
                .acceptance_criteria
                .iter()
                .cloned()
                .map(Value::String)
                .collect(),
        ),
    );
    if let Some(priority) = &story.priority {
        fields.insert("priority".to_string(), Value::String(priority.clone()));
    }
    if let Some(points) = story.story_points {
        fields.insert(
            "story_points".to_string(),
            serde_json::json!(points),
        );
    }
    fields
}

/// Field map used to archive an orphaned existing child when
/// `archive_orphans` is enabled (§9 open question).
pub fn archive_fields() -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("state".to_string(), Value::String("Removed".to_string()));
    fields
}

pub fn test_case_fields(tc: &crate::models::TestCase) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("title".to_string(), Value::String(tc.title.clone()));
    fields.insert(
        "description".to_string(),
        Value::String(tc.description.clone()),
    );
    fields.insert(
        "test_type".to_string(),
        serde_json::json!(tc.test_type),
    );
    fields.insert("priority".to_string(), serde_json::json!(tc.priority));
    fields.insert(
        "preconditions".to_string(),
        Value::Array(tc.preconditions.iter().cloned().map(Value::String).collect()),
    );
    fields.insert(
        "test_steps".to_string(),
        Value::Array(tc.test_steps.iter().cloned().map(Value::String).collect()),
    );
    fields.insert(
        "expected_result".to_string(),
        Value::String(tc.expected_result.clone()),
    );
    fields
}
