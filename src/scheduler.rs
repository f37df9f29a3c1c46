//! Scheduler (§4.I): single-producer polling loop over a bounded worker
//! pool. Auto-discovers new roots, dispatches syncs, retires roots that
//! disappear or fail repeatedly, and shuts down gracefully. Grounded on
//! `bpmn_integration::pending_dispatch_worker`'s `run(shutdown_rx)` loop
//! in the teacher repo: `tokio::select!` between the poll-sleep and a
//! `watch::Receiver<bool>` shutdown signal, scan-then-dispatch per tick.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{FeatureState, RootMonitorState, RootType, SyncResult};
use crate::snapshot_store::SnapshotStore;
use crate::token_accountant::TokenAccountant;
use crate::tracker::TrackerAdapter;
use crate::worker::SyncWorker;
use crate::ledger::Ledger;

/// `consecutive_errors` threshold at which a root is retired (§4.I).
const RETIREMENT_THRESHOLD: u32 = 3;

/// Upper bound on how long the scheduler waits for in-flight workers to
/// finish during shutdown, ≤ pool-size × a generous single-worker budget
/// (§5 cancellation sequence).
const SHUTDOWN_GRACE_SECONDS: u64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct RootSummary {
    pub root_id: String,
    pub root_type: RootType,
    pub title: Option<String>,
    pub state: Option<String>,
    pub child_count: u32,
    pub consecutive_errors: u32,
    pub stories_extracted: bool,
    pub features: Vec<FeatureState>,
    pub last_sync_result: Option<SyncResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub monitored_roots: usize,
    pub poll_interval_seconds: u64,
}

pub struct Scheduler {
    tracker: Arc<dyn TrackerAdapter>,
    worker: Arc<SyncWorker>,
    snapshots: Arc<SnapshotStore>,
    ledger: Arc<Ledger>,
    accountant: Arc<TokenAccountant>,
    config: Arc<StdRwLock<Config>>,
    states: Arc<StdMutex<HashMap<String, RootMonitorState>>>,
    excluded: Arc<StdMutex<HashSet<String>>>,
    in_flight: Arc<StdMutex<HashSet<String>>>,
    root_type: RootType,
    running: std::sync::atomic::AtomicBool,
}

impl Scheduler {
    pub fn new(
        tracker: Arc<dyn TrackerAdapter>,
        worker: Arc<SyncWorker>,
        snapshots: Arc<SnapshotStore>,
        ledger: Arc<Ledger>,
        accountant: Arc<TokenAccountant>,
        config: Arc<StdRwLock<Config>>,
        root_type: RootType,
    ) -> Self {
        let excluded = {
            let cfg = config.read().expect("config lock poisoned");
            cfg.excluded_root_ids.iter().cloned().collect()
        };
        Scheduler {
            tracker,
            worker,
            snapshots,
            ledger,
            accountant,
            config,
            states: Arc::new(StdMutex::new(HashMap::new())),
            excluded: Arc::new(StdMutex::new(excluded)),
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
            root_type,
            running: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Rehydrates `RootMonitorState` for every known root from the
    /// ledger + snapshot store, per §4.A ("consulted on scheduler
    /// startup to rehydrate RootMonitorState").
    pub fn rehydrate(&self) {
        let mut states = self.states.lock().expect("states mutex poisoned");
        for root_id in self.ledger.for_type(self.root_type) {
            let mut state = RootMonitorState::new(root_id.clone(), self.root_type, Utc::now());
            if let Some(snapshot) = self.snapshots.load(self.root_type, &root_id) {
                state.stories_extracted = true;
                state.last_snapshot = Some(snapshot);
            }
            states.insert(root_id, state);
        }
    }

    /// Runs the polling loop until `shutdown_rx` fires (§5 cancellation).
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("scheduler started");
        self.running.store(true, std::sync::atomic::Ordering::SeqCst);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.tick().await;

            let poll_interval = self.config.read().expect("config lock poisoned").poll_interval_seconds;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(poll_interval)) => {}
                _ = shutdown_rx.changed() => {
                    info!("scheduler shutting down (during poll sleep)");
                    break;
                }
            }
        }

        self.shutdown().await;
        self.running.store(false, std::sync::atomic::Ordering::SeqCst);
        info!("scheduler stopped");
    }

    async fn shutdown(&self) {
        // Stop enqueueing already happened (the caller broke the loop);
        // wait up to the grace period for anything still dispatched via
        // force_check/force_reextract, then flush durable state.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(SHUTDOWN_GRACE_SECONDS);
        while !self.in_flight.lock().expect("in_flight mutex poisoned").is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown grace period elapsed with workers still in flight, forcing termination");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.accountant.flush();

        let states = self.states.lock().expect("states mutex poisoned");
        for state in states.values() {
            if let Some(snapshot) = &state.last_snapshot {
                if let Err(e) = self.snapshots.save(state.root_type, &state.root_id, snapshot) {
                    warn!(root_id = %state.root_id, error = %e, "failed to flush snapshot on shutdown");
                }
            }
        }
    }

    /// One tick: auto-discover, dispatch every eligible monitored root,
    /// await them all, then apply retirement policy (§4.I).
    async fn tick(&self) {
        self.auto_discover().await;

        let config = self.config.read().expect("config lock poisoned").clone();
        if !config.auto_sync {
            return;
        }

        let root_ids: Vec<String> = {
            let states = self.states.lock().expect("states mutex poisoned");
            let excluded = self.excluded.lock().expect("excluded mutex poisoned");
            let in_flight = self.in_flight.lock().expect("in_flight mutex poisoned");
            states
                .keys()
                .filter(|id| !excluded.contains(*id) && !in_flight.contains(*id))
                .cloned()
                .collect()
        };

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_syncs));
        let mut join_set: JoinSet<(String, RootMonitorState, SyncResult)> = JoinSet::new();

        for root_id in root_ids {
            let mut state = {
                let mut states = self.states.lock().expect("states mutex poisoned");
                match states.remove(&root_id) {
                    Some(s) => s,
                    None => continue,
                }
            };
            self.in_flight.lock().expect("in_flight mutex poisoned").insert(root_id.clone());

            let worker = self.worker.clone();
            let config = config.clone();
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");

            join_set.spawn(async move {
                let _permit = permit;
                let result = worker.run(&mut state, &config, false).await;
                (state.root_id.clone(), state, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((root_id, state, _result)) => self.complete_tick(root_id, state).await,
                Err(e) => warn!(error = %e, "sync task panicked"),
            }
        }
    }

    /// Discovers roots the tracker knows about that aren't monitored yet
    /// and gives each one its initial sync. Gated only on
    /// `auto_extract_new_roots` — independent of `auto_sync`, which only
    /// guards the *recurring* change-based dispatch in `tick()` (§4.I
    /// step 1: a newly-discovered root is dispatched whenever auto-extract
    /// is enabled, regardless of whether auto-sync is).
    async fn auto_discover(&self) {
        let config = self.config.read().expect("config lock poisoned").clone();
        if !config.auto_extract_new_roots {
            return;
        }

        let all_ids = match self.tracker.list_by_type(self.root_type).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "auto-discovery failed to list roots");
                return;
            }
        };

        let new_ids: Vec<String> = {
            let states = self.states.lock().expect("states mutex poisoned");
            let excluded = self.excluded.lock().expect("excluded mutex poisoned");
            all_ids
                .into_iter()
                .filter(|id| !states.contains_key(id) && !excluded.contains(id))
                .collect()
        };

        for root_id in new_ids {
            info!(root_id, "discovered new root, dispatching initial sync");
            self.in_flight.lock().expect("in_flight mutex poisoned").insert(root_id.clone());
            let mut state = RootMonitorState::new(root_id.clone(), self.root_type, Utc::now());
            let result = self.worker.run(&mut state, &config, false).await;
            if !result.success {
                warn!(root_id, "initial sync for newly discovered root failed");
            }
            self.complete_tick(root_id, state).await;
        }
    }

    async fn complete_tick(&self, root_id: String, mut state: RootMonitorState) {
        self.in_flight.lock().expect("in_flight mutex poisoned").remove(&root_id);

        if state.consecutive_errors >= RETIREMENT_THRESHOLD {
            self.retire(&root_id, &mut state).await;
            return;
        }

        self.states.lock().expect("states mutex poisoned").insert(root_id, state);
    }

    async fn retire(&self, root_id: &str, state: &mut RootMonitorState) {
        match self.tracker.exists(root_id).await {
            Ok(true) => {
                warn!(root_id, "retiring root after repeated failures despite tracker reporting it exists");
            }
            _ => {
                info!(root_id, "retiring root: tracker reports missing");
            }
        }

        if let Err(e) = self.ledger.remove(state.root_type, root_id) {
            warn!(root_id, error = %e, "failed to remove ledger entry on retirement");
        }
        if let Err(e) = self.snapshots.delete(state.root_type, root_id) {
            warn!(root_id, error = %e, "failed to delete snapshot on retirement");
        }
        self.states.lock().expect("states mutex poisoned").remove(root_id);
    }

    /// `POST roots/{id}/force-check` — run a sync right now, respecting
    /// the normal significance gate.
    pub async fn force_check(&self, root_id: &str) -> Option<SyncResult> {
        self.force(root_id, false).await
    }

    /// `POST roots/{id}/force-reextract` — run a sync right now,
    /// bypassing the significance gate. Caller must check
    /// `manual_override_enabled` before invoking this (control surface
    /// concern, §6).
    pub async fn force_reextract(&self, root_id: &str) -> Option<SyncResult> {
        self.force(root_id, true).await
    }

    async fn force(&self, root_id: &str, force_regen: bool) -> Option<SyncResult> {
        let mut state = {
            let mut states = self.states.lock().expect("states mutex poisoned");
            states.remove(root_id)?
        };
        self.in_flight.lock().expect("in_flight mutex poisoned").insert(root_id.to_string());

        let config = self.config.read().expect("config lock poisoned").clone();
        let result = self.worker.run(&mut state, &config, force_regen).await;

        self.complete_tick(root_id.to_string(), state).await;
        Some(result)
    }

    pub fn add_root(&self, root_id: String) {
        self.excluded.lock().expect("excluded mutex poisoned").remove(&root_id);
        let mut states = self.states.lock().expect("states mutex poisoned");
        states
            .entry(root_id.clone())
            .or_insert_with(|| RootMonitorState::new(root_id, self.root_type, Utc::now()));
    }

    /// Explicit "remove root" — adds to the exclusion list so
    /// auto-discovery never re-adds it (§4.I).
    pub fn remove_root(&self, root_id: &str) {
        self.excluded.lock().expect("excluded mutex poisoned").insert(root_id.to_string());
        self.states.lock().expect("states mutex poisoned").remove(root_id);
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.running.load(std::sync::atomic::Ordering::SeqCst),
            monitored_roots: self.states.lock().expect("states mutex poisoned").len(),
            poll_interval_seconds: self.config.read().expect("config lock poisoned").poll_interval_seconds,
        }
    }

    pub fn roots(&self) -> Vec<RootSummary> {
        self.states
            .lock()
            .expect("states mutex poisoned")
            .values()
            .map(|state| RootSummary {
                root_id: state.root_id.clone(),
                root_type: state.root_type,
                title: state.last_snapshot.as_ref().map(|s| s.title.clone()),
                state: state.last_snapshot.as_ref().map(|s| s.state.clone()),
                child_count: state.total_story_count,
                consecutive_errors: state.consecutive_errors,
                stories_extracted: state.stories_extracted,
                features: state.features.clone(),
                last_sync_result: state.last_sync_result.clone(),
            })
            .collect()
    }
}
