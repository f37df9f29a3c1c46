//! Core value types shared across the engine.
//!
//! Mirrors the teacher's pattern of translating loosely-shaped external
//! payloads into a small set of owned, strongly-typed records at the
//! adapter boundary (see `ai::AiDslRequest`/`AiDslResponse` in the
//! teacher repo) rather than propagating `serde_json::Value` into the core.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of work item a `Root` or `ExistingChild` represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RootType {
    Epic,
    Feature,
    Story,
    Task,
    TestCase,
}

impl RootType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootType::Epic => "Epic",
            RootType::Feature => "Feature",
            RootType::Story => "Story",
            RootType::Task => "Task",
            RootType::TestCase => "TestCase",
        }
    }
}

impl std::fmt::Display for RootType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RootType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Epic" => Ok(RootType::Epic),
            "Feature" => Ok(RootType::Feature),
            "Story" => Ok(RootType::Story),
            "Task" => Ok(RootType::Task),
            "TestCase" => Ok(RootType::TestCase),
            other => Err(format!("unknown root type: {other}")),
        }
    }
}

/// A top-of-hierarchy work item being monitored (Epic/Feature/...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    pub id: String,
    #[serde(rename = "type")]
    pub root_type: RootType,
    pub title: String,
    pub description: String,
    pub state: String,
    pub priority: Option<String>,
    pub area_path: Option<String>,
    pub iteration_path: Option<String>,
    pub last_modified: DateTime<Utc>,
}

/// Immutable record of a root at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub title: String,
    pub description: String,
    pub state: String,
    pub priority: Option<String>,
    pub area_path: Option<String>,
    pub iteration_path: Option<String>,
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
    pub enhanced_metadata: SnapshotMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub last_updated: DateTime<Utc>,
    pub monitor_version: String,
}

impl Snapshot {
    /// Canonical concatenation used for `content_hash`: title|description|state|priority|area|iteration.
    pub fn canonical_string(
        title: &str,
        description: &str,
        state: &str,
        priority: Option<&str>,
        area_path: Option<&str>,
        iteration_path: Option<&str>,
    ) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            title,
            description,
            state,
            priority.unwrap_or(""),
            area_path.unwrap_or(""),
            iteration_path.unwrap_or("")
        )
    }

    pub fn from_root(root: &Root, monitor_version: &str, now: DateTime<Utc>) -> Self {
        let content_hash = crate::significance::content_hash(&Self::canonical_string(
            &root.title,
            &root.description,
            &root.state,
            root.priority.as_deref(),
            root.area_path.as_deref(),
            root.iteration_path.as_deref(),
        ));
        Snapshot {
            title: root.title.clone(),
            description: root.description.clone(),
            state: root.state.clone(),
            priority: root.priority.clone(),
            area_path: root.area_path.clone(),
            iteration_path: root.iteration_path.clone(),
            content_hash,
            last_modified: root.last_modified,
            captured_at: now,
            enhanced_metadata: SnapshotMetadata {
                last_updated: now,
                monitor_version: monitor_version.to_string(),
            },
        }
    }
}

/// One field's contribution to a significance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub significance: f64,
    pub old: String,
    pub new: String,
}

/// A single scored change between two snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub timestamp: DateTime<Utc>,
    pub total_significance: f64,
    pub changes: Vec<FieldChange>,
}

/// Bounded ring buffer of `ChangeRecord`s (capacity 20, per §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeHistory {
    buf: VecDeque<ChangeRecord>,
}

impl ChangeHistory {
    const CAPACITY: usize = 20;

    pub fn push(&mut self, record: ChangeRecord) {
        if self.buf.len() == Self::CAPACITY {
            self.buf.pop_front();
        }
        self.buf.push_back(record);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.buf.iter()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Generator output: one candidate user story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedStory {
    pub heading: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub story_points: Option<f64>,
    #[serde(default)]
    pub technical_context: Option<String>,
    #[serde(default)]
    pub business_requirements: Option<String>,
    /// True when this proposal came from the heuristic text fallback
    /// parser rather than a structured generator response. Per the
    /// design note in §9, fallback artifacts must be tagged so metrics
    /// can exclude them; the Reconciler itself treats them identically.
    #[serde(default)]
    pub from_fallback_parser: bool,
}

/// A child work item as read from the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingChild {
    pub id: String,
    pub title: String,
    pub description: String,
    pub state: String,
    pub parent_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Positive,
    Negative,
    EdgeCase,
    Security,
    Performance,
    Integration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestPriority {
    Critical,
    High,
    Medium,
    Low,
}

/// A generated grand-child test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub title: String,
    pub description: String,
    pub test_type: TestType,
    pub priority: TestPriority,
    pub preconditions: Vec<String>,
    pub test_steps: Vec<String>,
    pub expected_result: String,
}

/// Outcome of one Sync Worker run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub test_cases_created: Vec<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SyncResult {
    pub fn noop(unchanged: Vec<String>, now: DateTime<Utc>) -> Self {
        SyncResult {
            success: true,
            created: vec![],
            updated: vec![],
            unchanged,
            test_cases_created: vec![],
            error: None,
            timestamp: now,
        }
    }

    pub fn failure(error: String, now: DateTime<Utc>) -> Self {
        SyncResult {
            success: false,
            created: vec![],
            updated: vec![],
            unchanged: vec![],
            test_cases_created: vec![],
            error: Some(error),
            timestamp: now,
        }
    }
}

/// One Feature under a monitored root, as read via `get_hierarchy` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureState {
    pub id: String,
    pub title: String,
    pub story_count: u32,
}

/// Per-root mutable state held by the scheduler (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootMonitorState {
    pub root_id: String,
    pub root_type: RootType,
    pub last_snapshot: Option<Snapshot>,
    pub last_check: DateTime<Utc>,
    pub consecutive_errors: u32,
    pub stories_extracted: bool,
    pub change_extraction_count: u32,
    pub last_significant_change: Option<DateTime<Utc>>,
    pub last_change_significance: f64,
    pub change_history: ChangeHistory,
    pub features: Vec<FeatureState>,
    pub feature_count: u32,
    pub total_story_count: u32,
    pub last_sync_result: Option<SyncResult>,
}

impl RootMonitorState {
    pub fn new(root_id: String, root_type: RootType, now: DateTime<Utc>) -> Self {
        RootMonitorState {
            root_id,
            root_type,
            last_snapshot: None,
            last_check: now,
            consecutive_errors: 0,
            stories_extracted: false,
            change_extraction_count: 0,
            last_significant_change: None,
            last_change_significance: 0.0,
            change_history: ChangeHistory::default(),
            features: Vec::new(),
            feature_count: 0,
            total_story_count: 0,
            last_sync_result: None,
        }
    }
}
