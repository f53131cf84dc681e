//! Standalone Agent Console server binary. Run with --port and --dist, or use
//! defaults. Startup order: store (with legacy JSON import) → managers →
//! orphan sweep → job queue loop → HTTP/WS server. Scrollback buffers are
//! drained on graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use common::agents::AgentRegistry;
use common::config::Config;
use common::db::json_import;
use common::git::CliGitRunner;
use common::jobs::JobQueue;
use common::lifecycle::{real_path_probe, WorkerLifecycle};
use common::output::{OutputConfig, OutputFileManager};
use common::pty::NativePtyProvider;
use common::session::SessionManager;
use common::worker::WorkerManager;

use server::web_server::{run_web_server, AppState};

const DEFAULT_PORT: u16 = 5190;

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut port = DEFAULT_PORT;
    let mut dist: Option<PathBuf> = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            port = args[i + 1].parse().unwrap_or(DEFAULT_PORT);
            i += 2;
            continue;
        }
        if args[i] == "--dist" && i + 1 < args.len() {
            dist = Some(PathBuf::from(&args[i + 1]));
            i += 2;
            continue;
        }
        i += 1;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(port, dist))
}

async fn run(port: u16, dist: Option<PathBuf>) -> Result<(), anyhow::Error> {
    let config = Arc::new(Config::from_env());
    tracing::info!(home = %config.home.display(), "agent console starting");

    let db = json_import::open_with_import(&config.home)?;
    let output = OutputFileManager::new(
        config.outputs_dir(),
        OutputConfig {
            flush_interval: config.flush_interval,
            flush_threshold_bytes: config.flush_threshold_bytes,
            max_file_size: config.max_file_size,
        },
    );
    let agents = Arc::new(AgentRegistry::new(db.clone()));
    let workers = Arc::new(WorkerManager::new(output.clone(), config.ring_buffer_bytes));
    let sessions = Arc::new(SessionManager::new(db.clone(), std::process::id() as i64));

    let loaded = sessions.load_from_store(&workers)?;
    let reclaimed = sessions.reclaim_orphans();
    tracing::info!(loaded, reclaimed, "sessions loaded from store");

    let jobs = JobQueue::new(db.clone());
    jobs.register_output_cleanup(output.clone());
    let queue_loop = jobs.spawn_worker_loop();

    let lifecycle = Arc::new(WorkerLifecycle::new(
        sessions.clone(),
        workers,
        output.clone(),
        agents.clone(),
        Some(jobs),
        Arc::new(NativePtyProvider),
        Arc::new(CliGitRunner),
        real_path_probe(),
        db.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        db,
        sessions,
        lifecycle,
        agents,
        git: Arc::new(CliGitRunner),
        dist_path: dist,
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    };
    let result = run_web_server(port, state, shutdown).await;

    queue_loop.abort();
    output.flush_all().await;
    result
}
