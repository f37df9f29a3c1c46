//! Hierarchy Sync Engine daemon (§6 SUPPLEMENT): `run` starts the
//! Control/Query HTTP surface (scheduler lifecycle is then driven via
//! `POST /start`/`POST /stop` on that surface); `status` and
//! `force-check` are local conveniences that only inspect the config
//! file, since there is no IPC channel to a running instance. Grounded
//! on `dsl_cli.rs`'s `clap::Parser`/`Subcommand` shape and
//! `ob-poc-web/main.rs`'s `tracing_subscriber` + `axum::serve` wiring.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

/// A little past the scheduler's own `SHUTDOWN_GRACE_SECONDS`, so the
/// in-flight-worker drain inside `Scheduler::shutdown` has room to finish
/// before this wait loop gives up on its own.
const SHUTDOWN_WAIT_SECONDS: u64 = 35;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hierarchy_sync_engine::config::Config;
use hierarchy_sync_engine::control::{self, ControlState};
use hierarchy_sync_engine::generator::openai::{OpenAiConfig, OpenAiGenerator};
use hierarchy_sync_engine::generator::GeneratorAdapter;
use hierarchy_sync_engine::ledger::Ledger;
use hierarchy_sync_engine::scheduler::Scheduler;
use hierarchy_sync_engine::snapshot_store::SnapshotStore;
use hierarchy_sync_engine::token_accountant::TokenAccountant;
use hierarchy_sync_engine::tracker::ado::{AdoConfig, AdoTracker};
use hierarchy_sync_engine::tracker::TrackerAdapter;
use hierarchy_sync_engine::worker::SyncWorker;

#[derive(Parser)]
#[command(name = "hierarchy-syncd")]
#[command(author, version, about = "Hierarchy Sync Engine daemon")]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, short, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Control/Query HTTP surface (scheduler starts via POST /start)
    Run {
        /// Address to bind the Control/Query HTTP surface to
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: SocketAddr,
    },
    /// Print whether a local config file looks ready to run
    Status,
    /// Without a running daemon there is nothing to check remotely; this
    /// always reports that no instance is reachable.
    ForceCheck { root_id: String },
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: failed to load config from {}: {e}", cli.config.display());
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Run { listen } => {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("fatal: failed to start tokio runtime: {e}");
                    return ExitCode::from(1);
                }
            };
            runtime.block_on(run_daemon(config, listen))
        }
        Commands::Status => {
            println!("hierarchy-syncd is not running (no IPC to a running instance)");
            println!(
                "config loaded from {}: requirement_type={}, poll_interval_seconds={}",
                cli.config.display(),
                config.requirement_type,
                config.poll_interval_seconds
            );
            ExitCode::SUCCESS
        }
        Commands::ForceCheck { root_id } => {
            println!("hierarchy-syncd is not running (no IPC to a running instance)");
            println!("cannot force-check {root_id}: start the daemon with `run` first");
            ExitCode::from(1)
        }
    }
}

/// Builds every adapter/handle the engine needs and serves the
/// Control/Query surface until SIGINT. Exit codes per §6: 0 on clean
/// shutdown, 1 on fatal startup error, 130 on interrupt.
async fn run_daemon(config: Config, listen: SocketAddr) -> ExitCode {
    let root_type: hierarchy_sync_engine::models::RootType = match config.requirement_type.parse() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("fatal: invalid requirement_type in config: {e}");
            return ExitCode::from(1);
        }
    };

    let tracker: Arc<dyn TrackerAdapter> = match AdoConfig::from_env().and_then(AdoTracker::new) {
        Ok(tracker) => Arc::new(tracker),
        Err(e) => {
            eprintln!("fatal: failed to configure tracker adapter: {e}");
            return ExitCode::from(1);
        }
    };

    let story_generator: Arc<dyn GeneratorAdapter> = match OpenAiGenerator::new(OpenAiConfig::default()) {
        Ok(g) => Arc::new(g),
        Err(e) => {
            eprintln!("fatal: failed to configure story generator: {e}");
            return ExitCode::from(1);
        }
    };
    let test_case_generator: Arc<dyn GeneratorAdapter> = match OpenAiGenerator::new(OpenAiConfig::default()) {
        Ok(g) => Arc::new(g),
        Err(e) => {
            eprintln!("fatal: failed to configure test-case generator: {e}");
            return ExitCode::from(1);
        }
    };

    let snapshots = Arc::new(SnapshotStore::new(config.snapshot_directory.clone()));
    let ledger = match Ledger::load(&PathBuf::from("data/ledger.json"), &config.requirement_type) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            eprintln!("fatal: failed to load ledger: {e}");
            return ExitCode::from(1);
        }
    };
    let accountant = Arc::new(TokenAccountant::new(Some(PathBuf::from("data/tokens.json"))));
    let config = Arc::new(StdRwLock::new(config));

    let worker = Arc::new(SyncWorker::new(
        tracker.clone(),
        story_generator.clone(),
        test_case_generator.clone(),
        snapshots.clone(),
        ledger.clone(),
        accountant.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        tracker.clone(),
        worker,
        snapshots,
        ledger,
        accountant.clone(),
        config.clone(),
        root_type,
    ));

    let control_state = ControlState::new(
        scheduler,
        tracker,
        story_generator,
        test_case_generator,
        accountant,
        config,
    );
    let app = control::router(control_state.clone());

    let listener = match tokio::net::TcpListener::bind(listen).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("fatal: failed to bind {listen}: {e}");
            return ExitCode::from(1);
        }
    };

    tracing::info!("Hierarchy Sync Engine control surface listening on {listen}");
    tracing::info!("POST /start to begin polling, GET /status to check progress");

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("fatal: HTTP server error: {e}");
                    ExitCode::from(1)
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, signalling scheduler shutdown");
            control_state.signal_shutdown();
            let deadline = tokio::time::Instant::now() + Duration::from_secs(SHUTDOWN_WAIT_SECONDS);
            while control_state.scheduler_status().running && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            tracing::info!("shutdown complete");
            ExitCode::from(130)
        }
    }
}
