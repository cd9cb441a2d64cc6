use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ai_orchestrator::admin::Admin;
use ai_orchestrator::api::{ApiState, api_routes};
use ai_orchestrator::config::Config;
use ai_orchestrator::graph::{GoalPlan, GoalStatus};
use ai_orchestrator::llm::create_provider;
use ai_orchestrator::orchestrator::Orchestrator;
use ai_orchestrator::safety::SafetyLayer;
use ai_orchestrator::store::{Database, LibSqlBackend};
use ai_orchestrator::tools::{FallbackBackend, LocalBackend, builtin::default_registry};
use ai_orchestrator::worker::{RunnerDeps, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(&config);

    eprintln!("🧭 AI Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!("   Workers: {}", config.orchestrator.max_workers);
    eprintln!("   API: http://{}/api/diagnostics", config.api.bind);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.database_path)
            .await
            .with_context(|| format!("failed to open {}", config.database_path.display()))?,
    );

    if let Some(path) = &config.goal_file {
        seed_goal(db.as_ref(), path).await?;
    }

    // ── Workers ──────────────────────────────────────────────────────────
    let llm = create_provider(&config.llm);
    let local = Arc::new(LocalBackend::new(
        config.worker.working_dir.clone(),
        config.worker.max_output_bytes,
    ));
    let backend = Arc::new(FallbackBackend::new(None, local));
    let tools = Arc::new(default_registry(backend, &config.worker));
    let safety = Arc::new(
        SafetyLayer::standard(config.worker.max_output_bytes).context("invalid command guard")?,
    );
    let deps = RunnerDeps {
        store: Arc::clone(&db),
        llm,
        tools,
        safety,
        config: config.worker.clone(),
    };
    let pool = Arc::new(WorkerPool::new(deps, config.orchestrator.max_workers));

    // ── Orchestrator ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        Arc::clone(&pool),
        config.orchestrator.clone(),
    ));
    let cycle = orchestrator.cycle_signal();
    let loop_handle = Arc::clone(&orchestrator).spawn(shutdown_rx.clone());

    // ── API ──────────────────────────────────────────────────────────────
    let app = api_routes(ApiState {
        store: Arc::clone(&db),
        admin: Arc::new(Admin::new(Arc::clone(&db)).with_pool(Arc::clone(&pool))),
        thresholds: config.health.clone(),
        cycle,
        admin_token: config.api.admin_token.clone(),
    });
    if config.api.admin_token.is_none() {
        tracing::warn!("ORCH_ADMIN_TOKEN not set, admin routes are disabled");
    }
    let listener = tokio::net::TcpListener::bind(&config.api.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.api.bind))?;
    tracing::info!(bind = %config.api.bind, "API server started");
    let mut api_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "API server failed");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    if let Err(e) = loop_handle.await {
        tracing::warn!(error = %e, "Orchestrator loop ended abnormally");
    }
    let aborted = pool.shutdown(config.orchestrator.shutdown_grace).await;
    if aborted > 0 {
        tracing::warn!(aborted, "Runners aborted at shutdown, orphan recovery will requeue them");
    }
    let _ = server.await;
    tracing::info!("Stopped");
    Ok(())
}

/// Console logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}

/// Insert the goal plan at `path` unless an active goal with its title exists.
async fn seed_goal(db: &dyn Database, path: &std::path::Path) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read goal file {}", path.display()))?;
    let plan = GoalPlan::from_json(&json).context("invalid goal file")?;
    let (goal, tasks) = plan.build().context("invalid goal plan")?;

    let existing = db.list_goals().await?;
    if existing
        .iter()
        .any(|g| g.status == GoalStatus::Active && g.title == goal.title)
    {
        tracing::info!(title = %goal.title, "Goal already active, not seeding again");
        return Ok(());
    }

    db.insert_plan(&goal, &tasks).await?;
    tracing::info!(goal_id = %goal.id, title = %goal.title, tasks = tasks.len(), "Goal seeded");
    Ok(())
}
