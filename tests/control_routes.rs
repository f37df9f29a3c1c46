//! HTTP-level integration tests for the Control/Query surface (§6),
//! grounded on the teacher's `sem_os_server` route-test convention:
//! `tower::ServiceExt::oneshot` against the real `axum::Router`, bodies
//! read with `http_body_util::BodyExt::collect`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use hierarchy_sync_engine::config::Config;
use hierarchy_sync_engine::control::{self, ControlState};
use hierarchy_sync_engine::error::{GeneratorError, TrackerError};
use hierarchy_sync_engine::generator::{ChatMessage, GeneratorAdapter};
use hierarchy_sync_engine::ledger::Ledger;
use hierarchy_sync_engine::models::{ExistingChild, Root, RootType};
use hierarchy_sync_engine::scheduler::Scheduler;
use hierarchy_sync_engine::snapshot_store::SnapshotStore;
use hierarchy_sync_engine::token_accountant::TokenAccountant;
use hierarchy_sync_engine::tracker::{FieldMap, Hierarchy, TrackerAdapter};
use hierarchy_sync_engine::worker::SyncWorker;

struct FakeTracker {
    roots: StdMutex<HashMap<String, Root>>,
}

#[async_trait]
impl TrackerAdapter for FakeTracker {
    async fn get_root(&self, id: &str) -> Result<Root, TrackerError> {
        self.roots
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))
    }

    async fn get_children(&self, _id: &str) -> Result<Vec<ExistingChild>, TrackerError> {
        Ok(vec![])
    }

    async fn get_hierarchy(&self, _root_id: &str) -> Result<Hierarchy, TrackerError> {
        Ok(Hierarchy { features: vec![] })
    }

    async fn list_by_type(&self, _root_type: RootType) -> Result<Vec<String>, TrackerError> {
        Ok(self.roots.lock().unwrap().keys().cloned().collect())
    }

    async fn create(
        &self,
        _root_type: RootType,
        _fields: FieldMap,
        _parent: Option<&str>,
    ) -> Result<String, TrackerError> {
        Ok("new-1".to_string())
    }

    async fn update(&self, _id: &str, _fields: FieldMap) -> Result<(), TrackerError> {
        Ok(())
    }

    async fn link_parent_child(&self, _parent: &str, _child: &str) -> Result<(), TrackerError> {
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool, TrackerError> {
        Ok(self.roots.lock().unwrap().contains_key(id))
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
    ) -> Result<String, GeneratorError> {
        Ok(self.response.clone())
    }

    fn model(&self) -> &str {
        "fake-model"
    }

    fn provider(&self) -> &str {
        "FAKE"
    }
}

fn root(id: &str) -> Root {
    Root {
        id: id.to_string(),
        root_type: RootType::Epic,
        title: "Checkout".to_string(),
        description: "Users purchase".to_string(),
        state: "New".to_string(),
        priority: None,
        area_path: None,
        iteration_path: None,
        last_modified: chrono::Utc::now(),
    }
}

fn build_app(roots: Vec<Root>, manual_override_enabled: bool) -> (axum::Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let tracker: Arc<dyn TrackerAdapter> = Arc::new(FakeTracker {
        roots: StdMutex::new(roots.into_iter().map(|r| (r.id.clone(), r)).collect()),
    });
    let snapshots = Arc::new(SnapshotStore::new(dir.path().join("snapshots")));
    let ledger = Arc::new(Ledger::load(&dir.path().join("ledger.json"), "Epic").unwrap());
    let accountant = Arc::new(TokenAccountant::new(None));
    let story_gen: Arc<dyn GeneratorAdapter> = Arc::new(FakeGenerator {
        response: r#"{"stories":[]}"#.to_string(),
    });
    let tc_gen: Arc<dyn GeneratorAdapter> = Arc::new(FakeGenerator {
        response: r#"{"tcs":[]}"#.to_string(),
    });

    let worker = Arc::new(SyncWorker::new(
        tracker.clone(),
        story_gen.clone(),
        tc_gen.clone(),
        snapshots.clone(),
        ledger.clone(),
        accountant.clone(),
    ));

    let mut config = Config::default();
    config.manual_override_enabled = manual_override_enabled;
    let config = Arc::new(StdRwLock::new(config));

    let scheduler = Arc::new(Scheduler::new(
        tracker.clone(),
        worker,
        snapshots,
        ledger,
        accountant.clone(),
        config.clone(),
        RootType::Epic,
    ));

    let state = ControlState::new(scheduler, tracker, story_gen, tc_gen, accountant, config);
    (control::router(state), dir)
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn status_reports_stopped_scheduler_with_no_monitored_roots() {
    let (app, _dir) = build_app(vec![], true);
    let resp = app
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["running"], false);
    assert_eq!(body["monitored_roots"], 0);
}

#[tokio::test]
async fn force_check_on_unmonitored_root_is_404() {
    let (app, _dir) = build_app(vec![root("E1")], true);
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/roots/GHOST/force-check")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn force_reextract_is_forbidden_when_manual_override_disabled() {
    let (app, _dir) = build_app(vec![root("E1")], false);
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/roots/E1/force-reextract")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn update_config_rejects_out_of_range_threshold() {
    let (app, _dir) = build_app(vec![], true);
    let resp = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/config")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({ "change_significance_threshold": 2.0 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn update_config_applies_valid_hot_reload_field() {
    let (app, _dir) = build_app(vec![], true);
    let resp = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/config")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({ "change_significance_threshold": 0.5 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["change_significance_threshold"], 0.5);
}

#[tokio::test]
async fn extract_stories_for_unknown_root_is_404() {
    let (app, _dir) = build_app(vec![], true);
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/requirements/GHOST/stories")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::json!({}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn extract_stories_for_known_root_returns_empty_set_for_fake_generator() {
    let (app, _dir) = build_app(vec![root("E1")], true);
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/requirements/E1/stories")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::json!({}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["stories"], serde_json::json!([]));
    assert_eq!(body["created"], serde_json::json!([]));
}

#[tokio::test]
async fn extract_test_cases_returns_generated_fields() {
    let (app, _dir) = build_app(vec![], true);
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/stories/S1/test-cases")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({ "title": "Buy item", "description": "desc" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["test_cases"], serde_json::json!([]));
}

#[tokio::test]
async fn tokens_dashboard_and_stats_are_reachable() {
    let (app, _dir) = build_app(vec![], true);
    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/tokens/dashboard")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn roots_lists_what_force_check_monitors() {
    let (app, _dir) = build_app(vec![root("E1")], true);

    // Force-check a root that isn't monitored yet -> 404, /roots stays empty.
    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/roots").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body, serde_json::json!([]));
}
