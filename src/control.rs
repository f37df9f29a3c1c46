//! Control/Query surface (§6): HTTP shape over the Scheduler, Token
//! Accountant and Config. Routes and handler shape follow the teacher's
//! `api::entity_routes::create_entity_router` pattern: a small `Clone`
//! state struct holding `Arc` handles, one handler per route, errors
//! mapped to `(StatusCode, String)`.

use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::Config;
use crate::generator::{parsing, ChatMessage, GeneratorAdapter};
use crate::models::{ProposedStory, RootType};
use crate::scheduler::{RootSummary, Scheduler, SchedulerStatus};
use crate::token_accountant::{CallType, Dashboard, TokenAccountant, TokenStats};
use crate::tracker::{story_fields, test_case_fields, TrackerAdapter};

const STORY_TEMPERATURE: f32 = 0.3;
const STORY_MAX_TOKENS: u32 = 3000;

#[derive(Clone)]
pub struct ControlState {
    scheduler: Arc<Scheduler>,
    tracker: Arc<dyn TrackerAdapter>,
    story_generator: Arc<dyn GeneratorAdapter>,
    test_case_generator: Arc<dyn GeneratorAdapter>,
    accountant: Arc<TokenAccountant>,
    config: Arc<StdRwLock<Config>>,
    shutdown_tx: Arc<StdMutex<Option<watch::Sender<bool>>>>,
}

impl ControlState {
    pub fn new(
        scheduler: Arc<Scheduler>,
        tracker: Arc<dyn TrackerAdapter>,
        story_generator: Arc<dyn GeneratorAdapter>,
        test_case_generator: Arc<dyn GeneratorAdapter>,
        accountant: Arc<TokenAccountant>,
        config: Arc<StdRwLock<Config>>,
    ) -> Self {
        ControlState {
            scheduler,
            tracker,
            story_generator,
            test_case_generator,
            accountant,
            config,
            shutdown_tx: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Signals a running scheduler loop to begin its graceful shutdown
    /// sequence (§5), same as `POST /stop`. No-op if the scheduler was
    /// never started. Callers that need to know when it actually stopped
    /// should poll `scheduler_status().running`.
    pub fn signal_shutdown(&self) {
        let tx = self.shutdown_tx.lock().expect("shutdown_tx mutex poisoned").take();
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
    }
}

/// Builds the router with cors + trace layers, matching the teacher's
/// `features.server` wiring (`tower_http::{cors, trace}` per Cargo.toml).
pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/status", get(status))
        .route("/roots", get(roots))
        .route("/roots/:id/force-check", post(force_check))
        .route("/roots/:id/force-reextract", post(force_reextract))
        .route("/roots/:id/sync-hierarchy", post(sync_hierarchy))
        .route("/hierarchy/status", get(hierarchy_status))
        .route("/stats", get(stats))
        .route("/tokens/dashboard", get(tokens_dashboard))
        .route("/tokens/clear", post(tokens_clear))
        .route("/config", put(update_config))
        .route("/stories/:id/test-cases", post(extract_test_cases))
        .route(
            "/stories/:id/test-cases/upload",
            post(extract_and_upload_test_cases),
        )
        .route("/requirements/:id/stories", post(extract_stories))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn internal(msg: impl ToString) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, msg.to_string())
}

// ---------------------------------------------------------------------------
// Scheduler lifecycle
// ---------------------------------------------------------------------------

async fn start(State(state): State<ControlState>) -> Result<Json<SchedulerStatus>, ApiError> {
    let mut guard = state.shutdown_tx.lock().expect("shutdown_tx mutex poisoned");
    if guard.is_some() {
        return Ok(Json(state.scheduler.status()));
    }
    let (tx, rx) = watch::channel(false);
    *guard = Some(tx);
    drop(guard);

    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        scheduler.rehydrate();
        scheduler.run(rx).await;
    });

    Ok(Json(state.scheduler.status()))
}

async fn stop(State(state): State<ControlState>) -> Result<Json<SchedulerStatus>, ApiError> {
    state.signal_shutdown();
    Ok(Json(state.scheduler.status()))
}

async fn status(State(state): State<ControlState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status())
}

async fn roots(State(state): State<ControlState>) -> Json<Vec<RootSummary>> {
    Json(state.scheduler.roots())
}

async fn force_check(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Result<Json<crate::models::SyncResult>, ApiError> {
    state
        .scheduler
        .force_check(&id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("root not monitored: {id}")))
}

async fn force_reextract(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Result<Json<crate::models::SyncResult>, ApiError> {
    if !state.config.read().expect("config lock poisoned").manual_override_enabled {
        return Err((
            StatusCode::FORBIDDEN,
            "manual_override_enabled is false".to_string(),
        ));
    }
    state
        .scheduler
        .force_reextract(&id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("root not monitored: {id}")))
}

/// `sync-hierarchy` forces the same full create/update/cascade sequence
/// as `force-reextract`; the distinct route exists for callers that want
/// to express "resync the whole subtree" rather than "bypass the gate".
async fn sync_hierarchy(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Result<Json<crate::models::SyncResult>, ApiError> {
    state
        .scheduler
        .force_check(&id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("root not monitored: {id}")))
}

#[derive(Serialize)]
struct HierarchyStatus {
    monitored_roots: usize,
    roots: Vec<RootSummary>,
}

async fn hierarchy_status(State(state): State<ControlState>) -> Json<HierarchyStatus> {
    let roots = state.scheduler.roots();
    Json(HierarchyStatus {
        monitored_roots: roots.len(),
        roots,
    })
}

// ---------------------------------------------------------------------------
// Token accounting
// ---------------------------------------------------------------------------

async fn stats(State(state): State<ControlState>) -> Json<TokenStats> {
    Json(state.accountant.stats())
}

async fn tokens_dashboard(State(state): State<ControlState>) -> Json<Dashboard> {
    Json(state.accountant.dashboard())
}

async fn tokens_clear(State(state): State<ControlState>) -> StatusCode {
    state.accountant.clear();
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn update_config(
    State(state): State<ControlState>,
    Json(patch): Json<serde_json::Value>,
) -> Result<Json<Config>, ApiError> {
    let mut config = state.config.write().expect("config lock poisoned");
    config
        .apply_partial_update(&patch)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(config.clone()))
}

// ---------------------------------------------------------------------------
// Story / test-case extraction on demand
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TestCaseRequest {
    title: String,
    description: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
}

#[derive(Serialize)]
struct TestCasesResponse {
    test_cases: Vec<crate::models::TestCase>,
    created: Vec<String>,
}

async fn generate_test_cases(
    state: &ControlState,
    story: &ProposedStory,
) -> Result<Vec<crate::models::TestCase>, ApiError> {
    let compact = state.config.read().expect("config lock poisoned").enable_compact_extraction;
    let system_prompt = parsing::test_case_system_prompt(compact);
    let user_prompt = parsing::test_case_user_prompt(story, compact);
    let messages = vec![
        ChatMessage::system(system_prompt.clone()),
        ChatMessage::user(user_prompt.clone()),
    ];

    let response = state
        .test_case_generator
        .chat(&messages, STORY_TEMPERATURE, STORY_MAX_TOKENS)
        .await
        .map_err(internal)?;

    let test_cases = parsing::parse_test_cases(&response);

    state.accountant.record(
        CallType::TestCaseExtraction,
        &format!("{system_prompt}\n{user_prompt}"),
        &response,
        compact,
        state.test_case_generator.model(),
        state.test_case_generator.provider(),
        true,
        None,
        None,
        Some(story.heading.clone()),
        chrono::Utc::now(),
    );

    Ok(test_cases)
}

async fn extract_test_cases(
    State(state): State<ControlState>,
    Path(id): Path<String>,
    Json(req): Json<TestCaseRequest>,
) -> Result<Json<TestCasesResponse>, ApiError> {
    let story = ProposedStory {
        heading: req.title,
        description: req.description,
        acceptance_criteria: req.acceptance_criteria,
        priority: None,
        story_points: None,
        technical_context: None,
        business_requirements: None,
        from_fallback_parser: false,
    };
    let _ = &id;
    let test_cases = generate_test_cases(&state, &story).await?;
    Ok(Json(TestCasesResponse {
        test_cases,
        created: Vec::new(),
    }))
}

async fn extract_and_upload_test_cases(
    State(state): State<ControlState>,
    Path(id): Path<String>,
    Json(req): Json<TestCaseRequest>,
) -> Result<Json<TestCasesResponse>, ApiError> {
    let story = ProposedStory {
        heading: req.title,
        description: req.description,
        acceptance_criteria: req.acceptance_criteria,
        priority: None,
        story_points: None,
        technical_context: None,
        business_requirements: None,
        from_fallback_parser: false,
    };
    let test_cases = generate_test_cases(&state, &story).await?;

    let mut created = Vec::new();
    for tc in &test_cases {
        let tc_id = state
            .tracker
            .create(RootType::TestCase, test_case_fields(tc), Some(&id))
            .await
            .map_err(internal)?;
        state
            .tracker
            .link_parent_child(&id, &tc_id)
            .await
            .map_err(internal)?;
        created.push(tc_id);
    }

    Ok(Json(TestCasesResponse { test_cases, created }))
}

#[derive(Deserialize)]
struct RequirementStoriesRequest {
    #[serde(default)]
    upload: bool,
}

#[derive(Serialize)]
struct StoriesResponse {
    stories: Vec<ProposedStory>,
    created: Vec<String>,
}

async fn extract_stories(
    State(state): State<ControlState>,
    Path(id): Path<String>,
    Json(req): Json<RequirementStoriesRequest>,
) -> Result<Json<StoriesResponse>, ApiError> {
    let root = state
        .tracker
        .get_root(&id)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;

    let compact = state.config.read().expect("config lock poisoned").enable_compact_extraction;
    let system_prompt = parsing::story_system_prompt(compact);
    let user_prompt = parsing::story_user_prompt(&root, compact);
    let messages = vec![
        ChatMessage::system(system_prompt.clone()),
        ChatMessage::user(user_prompt.clone()),
    ];

    let response = state
        .story_generator
        .chat(&messages, STORY_TEMPERATURE, STORY_MAX_TOKENS)
        .await
        .map_err(internal)?;

    let (stories, used_fallback) = parsing::parse_proposed_stories(&response);

    state.accountant.record(
        CallType::StoryExtraction,
        &format!("{system_prompt}\n{user_prompt}"),
        &response,
        compact,
        state.story_generator.model(),
        state.story_generator.provider(),
        true,
        used_fallback.then(|| "fell back to heuristic parser".to_string()),
        Some(root.id.clone()),
        Some(root.title.clone()),
        chrono::Utc::now(),
    );

    let mut created = Vec::new();
    if req.upload {
        for story in &stories {
            let story_id = state
                .tracker
                .create(RootType::Story, story_fields(story), Some(&root.id))
                .await
                .map_err(internal)?;
            state
                .tracker
                .link_parent_child(&root.id, &story_id)
                .await
                .map_err(internal)?;
            created.push(story_id);
        }
    }

    Ok(Json(StoriesResponse { stories, created }))
}
