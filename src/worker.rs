//! Sync Worker (§4.H): for one root, fetches current state, scores
//! significance, decides whether to regenerate, calls the generator,
//! reconciles against existing children, applies via the tracker
//! adapter, optionally cascades to test cases, then persists snapshot,
//! ledger and monitor state. Grounded on
//! `bpmn_integration::pending_dispatch_worker` in the teacher repo: a
//! per-item worker function the scheduler dispatches into a bounded
//! pool, with its own retry-the-whole-sequence discipline distinct from
//! the generator's internal backoff.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::config::Config;
use crate::error::{SyncError, TrackerError};
use crate::generator::{parsing, ChatMessage, GeneratorAdapter};
use crate::ledger::{ChangeExtractionStat, Ledger};
use crate::models::{
    ChangeRecord, FeatureState, ProposedStory, RootMonitorState, Snapshot, SyncResult, TestCase,
};
use crate::reconciler::{self, ReconcileOutcome};
use crate::significance;
use crate::snapshot_store::SnapshotStore;
use crate::token_accountant::{CallType, TokenAccountant};
use crate::tracker::{story_fields, test_case_fields, TrackerAdapter};

const MONITOR_VERSION: &str = "hierarchy-sync-engine/1";
const STORY_TEMPERATURE: f32 = 0.3;
const STORY_MAX_TOKENS: u32 = 3000;

/// Why this tick is regenerating stories, if at all. Determines whether
/// `change_extraction_count` advances (testable property 6, §8).
enum Dispatch {
    Initial,
    ChangeBased,
    Noop,
}

pub struct SyncWorker {
    tracker: Arc<dyn TrackerAdapter>,
    story_generator: Arc<dyn GeneratorAdapter>,
    test_case_generator: Arc<dyn GeneratorAdapter>,
    snapshots: Arc<SnapshotStore>,
    ledger: Arc<Ledger>,
    accountant: Arc<TokenAccountant>,
}

impl SyncWorker {
    pub fn new(
        tracker: Arc<dyn TrackerAdapter>,
        story_generator: Arc<dyn GeneratorAdapter>,
        test_case_generator: Arc<dyn GeneratorAdapter>,
        snapshots: Arc<SnapshotStore>,
        ledger: Arc<Ledger>,
        accountant: Arc<TokenAccountant>,
    ) -> Self {
        SyncWorker {
            tracker,
            story_generator,
            test_case_generator,
            snapshots,
            ledger,
            accountant,
        }
    }

    /// Runs the full sequence, retrying on transient tracker failures up
    /// to `config.retry_attempts` times with a fixed delay (§4.H retry
    /// discipline; distinct from the generator's own backoff). `force`
    /// bypasses the significance gate entirely (the `force-reextract`
    /// control-surface handler), always treating the tick as change-based.
    pub async fn run(&self, state: &mut RootMonitorState, config: &Config, force: bool) -> SyncResult {
        let mut attempt = 0u32;
        loop {
            match self.run_once(state, config, force).await {
                Ok(result) => {
                    state.consecutive_errors = 0;
                    state.last_sync_result = Some(result.clone());
                    return result;
                }
                Err(SyncError::RootMissing(id)) => {
                    let now = Utc::now();
                    let result = SyncResult::failure(format!("root missing: {id}"), now);
                    state.consecutive_errors += 1;
                    state.last_sync_result = Some(result.clone());
                    return result;
                }
                Err(e) if is_transient(&e) && attempt < config.retry_attempts => {
                    attempt += 1;
                    warn!(root_id = %state.root_id, attempt, error = %e, "transient sync failure, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(config.retry_delay_seconds)).await;
                }
                Err(e) => {
                    let now = Utc::now();
                    let result = SyncResult::failure(e.to_string(), now);
                    state.consecutive_errors += 1;
                    state.last_sync_result = Some(result.clone());
                    return result;
                }
            }
        }
    }

    async fn run_once(
        &self,
        state: &mut RootMonitorState,
        config: &Config,
        force: bool,
    ) -> Result<SyncResult, SyncError> {
        let now = Utc::now();

        // Step 1: fetch root.
        let root = match self.tracker.get_root(&state.root_id).await {
            Ok(root) => root,
            Err(TrackerError::NotFound(id)) => return Err(SyncError::RootMissing(id)),
            Err(e) => return Err(SyncError::Tracker(e)),
        };

        // Step 2: significance.
        let cur_snapshot = Snapshot::from_root(&root, MONITOR_VERSION, now);
        let prev_snapshot = self.snapshots.load(state.root_type, &state.root_id);
        let (significance, changes) =
            significance::score(prev_snapshot.as_ref(), &cur_snapshot, config.weights());

        // Step 3: decide.
        let existing = self
            .tracker
            .get_children(&state.root_id)
            .await
            .map_err(SyncError::Tracker)?;

        // Step 3b: refresh the feature-level view (§3 RootMonitorState.features).
        match self.tracker.get_hierarchy(&state.root_id).await {
            Ok(hierarchy) => {
                state.features = hierarchy
                    .features
                    .iter()
                    .map(|f| FeatureState {
                        id: f.id.clone(),
                        title: f.title.clone(),
                        story_count: f.stories.len() as u32,
                    })
                    .collect();
                state.feature_count = state.features.len() as u32;
            }
            Err(e) => warn!(root_id = %state.root_id, error = %e, "failed to refresh feature hierarchy"),
        }

        let dispatch = self.decide(state, config, significance, force);
        if matches!(dispatch, Dispatch::Noop) {
            self.persist_tick(state, &cur_snapshot, now, None)?;
            return Ok(SyncResult::noop(
                existing.iter().map(|c| c.id.clone()).collect(),
                now,
            ));
        }

        // Step 4: generate proposed stories.
        let compact = config.enable_compact_extraction;
        let system_prompt = parsing::story_system_prompt(compact);
        let user_prompt = parsing::story_user_prompt(&root, compact);
        let messages = vec![
            ChatMessage::system(system_prompt.clone()),
            ChatMessage::user(user_prompt.clone()),
        ];

        let response = self
            .story_generator
            .chat(&messages, STORY_TEMPERATURE, STORY_MAX_TOKENS)
            .await
            .map_err(SyncError::Generator)?;

        let (proposed, used_fallback) = parsing::parse_proposed_stories(&response);
        let is_placeholder = used_fallback
            && proposed.len() == 1
            && proposed[0].heading == "Manual Validation Required";

        self.accountant.record(
            CallType::StoryExtraction,
            &format!("{system_prompt}\n{user_prompt}"),
            &response,
            compact,
            self.story_generator.model(),
            self.story_generator.provider(),
            true,
            is_placeholder.then(|| "generator response could not be parsed".to_string()),
            Some(root.id.clone()),
            Some(root.title.clone()),
            now,
        );

        // Step 5: reconcile.
        let outcome = reconciler::reconcile(&existing, &proposed);

        // Step 6: apply create/update, never delete.
        let (created_ids, created_pairs) = self.apply_creates(&root.id, &outcome).await?;
        self.apply_updates(&outcome).await?;
        self.apply_orphans(&outcome, config).await?;

        // Step 7: optional test-case cascade.
        let mut test_cases_created = Vec::new();
        if config.auto_test_case_extraction {
            for (story_id, story) in &created_pairs {
                match self.extract_test_cases(&root, story_id, story, config).await {
                    Ok(ids) => test_cases_created.extend(ids),
                    Err(e) => warn!(story_id, error = %e, "test case extraction failed, story unaffected"),
                }
            }
        }

        // Step 8: persist.
        let change_record = matches!(dispatch, Dispatch::ChangeBased).then(|| ChangeRecord {
            timestamp: now,
            total_significance: significance,
            changes,
        });
        self.persist_tick(state, &cur_snapshot, now, change_record)?;

        let unchanged_ids = outcome
            .unchanged
            .iter()
            .chain(outcome.orphaned.iter())
            .map(|c| c.id.clone())
            .collect();
        state.total_story_count = (existing.len() + created_ids.len()) as u32;

        Ok(SyncResult {
            success: true,
            created: created_ids,
            updated: outcome.to_update.iter().map(|u| u.id.clone()).collect(),
            unchanged: unchanged_ids,
            test_cases_created,
            error: None,
            timestamp: now,
        })
    }

    fn decide(
        &self,
        state: &RootMonitorState,
        config: &Config,
        significance: f64,
        force: bool,
    ) -> Dispatch {
        if !state.stories_extracted {
            return Dispatch::Initial;
        }
        if force {
            return Dispatch::ChangeBased;
        }

        let cooldown_elapsed = config.extraction_cooldown_hours == 0
            || state
                .last_sync_result
                .as_ref()
                .map(|r| Utc::now() - r.timestamp >= chrono::Duration::hours(config.extraction_cooldown_hours))
                .unwrap_or(true);

        if config.enable_compact_extraction
            && significance >= config.change_significance_threshold
            && state.change_extraction_count < config.max_changes_per_root
            && cooldown_elapsed
        {
            Dispatch::ChangeBased
        } else {
            Dispatch::Noop
        }
    }

    async fn apply_creates(
        &self,
        root_id: &str,
        outcome: &ReconcileOutcome,
    ) -> Result<(Vec<String>, Vec<(String, ProposedStory)>), SyncError> {
        let mut created_ids = Vec::new();
        let mut created_pairs = Vec::new();
        for story in &outcome.to_create {
            if story.heading.trim().is_empty() {
                warn!(root_id, "skipping proposed story with empty heading");
                continue;
            }
            let id = self
                .tracker
                .create(
                    crate::models::RootType::Story,
                    story_fields(story),
                    Some(root_id),
                )
                .await
                .map_err(SyncError::Tracker)?;
            self.tracker
                .link_parent_child(root_id, &id)
                .await
                .map_err(SyncError::Tracker)?;
            created_ids.push(id.clone());
            created_pairs.push((id, story.clone()));
        }
        Ok((created_ids, created_pairs))
    }

    async fn apply_updates(&self, outcome: &ReconcileOutcome) -> Result<(), SyncError> {
        for update in &outcome.to_update {
            self.tracker
                .update(&update.id, story_fields(&update.new))
                .await
                .map_err(SyncError::Tracker)?;
        }
        Ok(())
    }

    /// Orphaned existing children matched no proposal. Left alone by
    /// default (§9: "matches current behavior"); when `archive_orphans`
    /// is set the tracker is asked to mark each one removed.
    async fn apply_orphans(&self, outcome: &ReconcileOutcome, config: &Config) -> Result<(), SyncError> {
        if !config.archive_orphans {
            return Ok(());
        }
        for orphan in &outcome.orphaned {
            self.tracker
                .update(&orphan.id, crate::tracker::archive_fields())
                .await
                .map_err(SyncError::Tracker)?;
        }
        Ok(())
    }

    async fn extract_test_cases(
        &self,
        root: &crate::models::Root,
        story_id: &str,
        story: &ProposedStory,
        config: &Config,
    ) -> Result<Vec<String>, SyncError> {
        let compact = config.enable_compact_extraction;
        let system_prompt = parsing::test_case_system_prompt(compact);
        let user_prompt = parsing::test_case_user_prompt(story, compact);
        let messages = vec![
            ChatMessage::system(system_prompt.clone()),
            ChatMessage::user(user_prompt.clone()),
        ];

        let response = self
            .test_case_generator
            .chat(&messages, STORY_TEMPERATURE, STORY_MAX_TOKENS)
            .await
            .map_err(SyncError::Generator)?;

        let test_cases: Vec<TestCase> = parsing::parse_test_cases(&response);

        self.accountant.record(
            CallType::TestCaseExtraction,
            &format!("{system_prompt}\n{user_prompt}"),
            &response,
            compact,
            self.test_case_generator.model(),
            self.test_case_generator.provider(),
            true,
            None,
            Some(root.id.clone()),
            Some(story.heading.clone()),
            Utc::now(),
        );

        let mut ids = Vec::new();
        for tc in &test_cases {
            let id = self
                .tracker
                .create(
                    crate::models::RootType::TestCase,
                    test_case_fields(tc),
                    Some(story_id),
                )
                .await
                .map_err(SyncError::Tracker)?;
            self.tracker
                .link_parent_child(story_id, &id)
                .await
                .map_err(SyncError::Tracker)?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn persist_tick(
        &self,
        state: &mut RootMonitorState,
        cur_snapshot: &Snapshot,
        now: chrono::DateTime<Utc>,
        change_record: Option<ChangeRecord>,
    ) -> Result<(), SyncError> {
        self.snapshots
            .save(state.root_type, &state.root_id, cur_snapshot)
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        self.ledger
            .add(state.root_type, &state.root_id)
            .map_err(|e| SyncError::Persistence(e.to_string()))?;

        state.last_snapshot = Some(cur_snapshot.clone());
        state.last_check = now;
        state.stories_extracted = true;

        if let Some(record) = change_record {
            state.change_extraction_count += 1;
            state.last_significant_change = Some(now);
            state.last_change_significance = record.total_significance;
            state.change_history.push(record);

            self.ledger
                .record_change_extraction(
                    &state.root_id,
                    ChangeExtractionStat {
                        change_extraction_count: state.change_extraction_count,
                        last_significant_change: state.last_significant_change,
                        last_change_significance: state.last_change_significance,
                    },
                )
                .map_err(|e| SyncError::Persistence(e.to_string()))?;
        }

        Ok(())
    }
}

fn is_transient(error: &SyncError) -> bool {
    matches!(
        error,
        SyncError::Tracker(TrackerError::Unavailable(_)) | SyncError::Tracker(TrackerError::Timeout)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExistingChild, Root, RootType};
    use crate::tracker::{FeatureNode, FieldMap, Hierarchy};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    pub(crate) struct FakeTracker {
        root: StdMutex<Option<Root>>,
        children: StdMutex<Vec<ExistingChild>>,
        pub(crate) created: StdMutex<Vec<(RootType, FieldMap, Option<String>)>>,
        pub(crate) updated: StdMutex<Vec<(String, FieldMap)>>,
        next_id: StdMutex<u32>,
    }

    impl FakeTracker {
        fn new(root: Root, children: Vec<ExistingChild>) -> Self {
            FakeTracker {
                root: StdMutex::new(Some(root)),
                children: StdMutex::new(children),
                created: StdMutex::new(Vec::new()),
                updated: StdMutex::new(Vec::new()),
                next_id: StdMutex::new(100),
            }
        }
    }

    #[async_trait]
    impl TrackerAdapter for FakeTracker {
        async fn get_root(&self, id: &str) -> Result<Root, TrackerError> {
            self.root
                .lock()
                .unwrap()
                .clone()
                .filter(|r| r.id == id)
                .ok_or_else(|| TrackerError::NotFound(id.to_string()))
        }

        async fn get_children(&self, _id: &str) -> Result<Vec<ExistingChild>, TrackerError> {
            Ok(self.children.lock().unwrap().clone())
        }

        async fn get_hierarchy(&self, _root_id: &str) -> Result<Hierarchy, TrackerError> {
            Ok(Hierarchy {
                features: vec![FeatureNode {
                    id: "F1".to_string(),
                    title: "Feature".to_string(),
                    stories: self.children.lock().unwrap().clone(),
                }],
            })
        }

        async fn list_by_type(&self, _root_type: RootType) -> Result<Vec<String>, TrackerError> {
            Ok(vec![])
        }

        async fn create(
            &self,
            root_type: RootType,
            fields: FieldMap,
            parent: Option<&str>,
        ) -> Result<String, TrackerError> {
            let mut next_id = self.next_id.lock().unwrap();
            let id = format!("{}", *next_id);
            *next_id += 1;
            self.created
                .lock()
                .unwrap()
                .push((root_type, fields, parent.map(str::to_string)));
            Ok(id)
        }

        async fn update(&self, id: &str, fields: FieldMap) -> Result<(), TrackerError> {
            self.updated.lock().unwrap().push((id.to_string(), fields));
            Ok(())
        }

        async fn link_parent_child(&self, _parent: &str, _child: &str) -> Result<(), TrackerError> {
            Ok(())
        }

        async fn exists(&self, id: &str) -> Result<bool, TrackerError> {
            Ok(self.root.lock().unwrap().as_ref().map(|r| r.id == id).unwrap_or(false))
        }
    }

    struct FakeGenerator {
        response: String,
    }

    #[async_trait]
    impl GeneratorAdapter for FakeGenerator {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String, crate::error::GeneratorError> {
            Ok(self.response.clone())
        }

        fn model(&self) -> &str {
            "fake-model"
        }

        fn provider(&self) -> &str {
            "FAKE"
        }
    }

    fn sample_root() -> Root {
        Root {
            id: "E1".to_string(),
            root_type: RootType::Epic,
            title: "Checkout".to_string(),
            description: "Users purchase".to_string(),
            state: "New".to_string(),
            priority: None,
            area_path: None,
            iteration_path: None,
            last_modified: Utc::now(),
        }
    }

    fn make_worker(
        tracker: Arc<dyn TrackerAdapter>,
        story_response: &str,
    ) -> (SyncWorker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let snapshots = Arc::new(SnapshotStore::new(dir.path().join("snapshots")));
        let ledger = Arc::new(Ledger::load(&dir.path().join("ledger.json"), "Epic").unwrap());
        let accountant = Arc::new(TokenAccountant::new(None));
        let story_gen = Arc::new(FakeGenerator {
            response: story_response.to_string(),
        });
        let tc_gen = Arc::new(FakeGenerator {
            response: r#"{"tcs":[]}"#.to_string(),
        });
        let worker = SyncWorker::new(tracker, story_gen, tc_gen, snapshots, ledger, accountant);
        (worker, dir)
    }

    #[tokio::test]
    async fn s1_first_seen_epic_creates_snapshot_and_ledger_entry() {
        let tracker: Arc<dyn TrackerAdapter> = Arc::new(FakeTracker::new(sample_root(), vec![]));
        let (worker, _dir) = make_worker(
            tracker,
            r#"{"stories":[{"heading":"Buy item","description":"desc"}]}"#,
        );
        let mut state = RootMonitorState::new("E1".to_string(), RootType::Epic, Utc::now());
        let config = Config::default();

        let result = worker.run(&mut state, &config, false).await;
        assert!(result.success);
        assert_eq!(result.created.len(), 1);
        assert!(state.stories_extracted);
        assert_eq!(state.change_extraction_count, 0);
        assert!(worker.snapshots.load(RootType::Epic, "E1").is_some());
        assert!(worker.ledger.contains(RootType::Epic, "E1"));
    }

    #[tokio::test]
    async fn s2_second_tick_with_no_change_is_noop() {
        let tracker: Arc<dyn TrackerAdapter> = Arc::new(FakeTracker::new(sample_root(), vec![]));
        let (worker, _dir) = make_worker(
            tracker,
            r#"{"stories":[{"heading":"Buy item","description":"desc"}]}"#,
        );
        let mut state = RootMonitorState::new("E1".to_string(), RootType::Epic, Utc::now());
        let config = Config::default();

        worker.run(&mut state, &config, false).await;
        let second = worker.run(&mut state, &config, false).await;

        assert!(second.success);
        assert!(second.created.is_empty());
        assert_eq!(state.change_extraction_count, 0);
    }

    #[tokio::test]
    async fn orphan_is_left_alone_by_default() {
        let existing = vec![ExistingChild {
            id: "900".to_string(),
            title: "Completely unrelated".to_string(),
            description: "nothing in common".to_string(),
            state: "Active".to_string(),
            parent_id: "E1".to_string(),
        }];
        let fake_tracker = Arc::new(FakeTracker::new(sample_root(), existing));
        let tracker: Arc<dyn TrackerAdapter> = fake_tracker.clone();
        let (worker, _dir) = make_worker(tracker, r#"{"stories":[]}"#);
        let mut state = RootMonitorState::new("E1".to_string(), RootType::Epic, Utc::now());
        let config = Config::default();
        assert!(!config.archive_orphans);

        let result = worker.run(&mut state, &config, false).await;
        assert!(result.success);
        assert_eq!(result.unchanged, vec!["900".to_string()]);
        assert!(fake_tracker.updated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn orphan_is_archived_when_configured() {
        let existing = vec![ExistingChild {
            id: "900".to_string(),
            title: "Completely unrelated".to_string(),
            description: "nothing in common".to_string(),
            state: "Active".to_string(),
            parent_id: "E1".to_string(),
        }];
        let fake_tracker = Arc::new(FakeTracker::new(sample_root(), existing));
        let tracker: Arc<dyn TrackerAdapter> = fake_tracker.clone();
        let (worker, _dir) = make_worker(tracker, r#"{"stories":[]}"#);
        let mut state = RootMonitorState::new("E1".to_string(), RootType::Epic, Utc::now());
        let mut config = Config::default();
        config.archive_orphans = true;

        let result = worker.run(&mut state, &config, false).await;
        assert!(result.success);
        let updated = fake_tracker.updated.lock().unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].0, "900");
        assert_eq!(updated[0].1.get("state").unwrap(), "Removed");
    }

    #[tokio::test]
    async fn s5_garbage_generator_response_yields_placeholder_story() {
        let fake_tracker = Arc::new(FakeTracker::new(sample_root(), vec![]));
        let tracker: Arc<dyn TrackerAdapter> = fake_tracker.clone();
        let (worker, _dir) = make_worker(tracker, "not json");
        let mut state = RootMonitorState::new("E1".to_string(), RootType::Epic, Utc::now());
        let config = Config::default();

        let result = worker.run(&mut state, &config, false).await;
        assert!(result.success);
        assert_eq!(result.created.len(), 1);

        let created = fake_tracker.created.lock().unwrap();
        let heading = created[0]
            .1
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        assert_eq!(heading, "Manual Validation Required");
    }

    #[tokio::test]
    async fn root_missing_marks_failure_without_panicking() {
        let root = sample_root();
        let tracker = Arc::new(FakeTracker::new(root, vec![]));
        *tracker.root.lock().unwrap() = None;
        let tracker: Arc<dyn TrackerAdapter> = tracker;
        let (worker, _dir) = make_worker(tracker, "{}");
        let mut state = RootMonitorState::new("E1".to_string(), RootType::Epic, Utc::now());
        let config = Config::default();

        let result = worker.run(&mut state, &config, false).await;
        assert!(!result.success);
        assert_eq!(state.consecutive_errors, 1);
    }
}
