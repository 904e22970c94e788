use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use flywheel_core::config::OUTCOME_CHANNEL_CAPACITY;
use flywheel_core::FlywheelConfig;
use flywheel_scheduler::{
    ActionRegistry, CompletionStore, Engine, EngineConfig, EngineHandle, LoadReport,
};

mod actions;

/// Task scheduling daemon: cron and interval triggers, dependency gating,
/// prioritised dispatch with per-job retry policies.
#[derive(Parser)]
#[command(name = "flywheel-daemon", version)]
struct Cli {
    /// Path to flywheel.toml. Falls back to FLYWHEEL_CONFIG, then
    /// ~/.flywheel/flywheel.toml.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flywheel_daemon=info,flywheel_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = FlywheelConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        FlywheelConfig::default()
    });
    let scheduler_cfg = config.scheduler.clone();

    // single SQLite file for completion records and the firing log
    let db_path = &scheduler_cfg.db_path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    let store = Arc::new(CompletionStore::new(db).context("initialise completion store")?);

    if let Some(days) = scheduler_cfg.completion_retention_days {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
        match store.prune_before(cutoff) {
            Ok(0) => {}
            Ok(rows) => info!(rows, days, "pruned completion history"),
            Err(e) => warn!("completion pruning failed: {e}"),
        }
    }

    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(actions::CommandAction));
    registry.register(Arc::new(actions::LogAction));
    let registry = Arc::new(registry);

    let (outcome_tx, mut outcome_rx) = tokio::sync::mpsc::channel(OUTCOME_CHANNEL_CAPACITY);
    let engine_config = EngineConfig::from_section(&scheduler_cfg);
    let mut engine = Engine::new(engine_config, Arc::clone(&store), registry, outcome_tx)
        .context("build scheduler engine")?;

    let report = engine.load_jobs(&config.jobs);
    log_load_report(&report);
    let handle = engine.handle();

    // Outcome sink: one structured line per finished instance. This is the
    // place to hang alerting or metrics export off later.
    tokio::spawn(async move {
        while let Some(event) = outcome_rx.recv().await {
            info!(
                job_id = %event.descriptor_id,
                instance_id = %event.instance_id,
                cycle = %event.cycle_key,
                status = %event.status,
                attempts = event.attempts,
                duration_ms = event.duration.as_millis() as u64,
                "job outcome"
            );
        }
    });

    spawn_sighup_reload(handle.clone(), cli.config.clone());
    if scheduler_cfg.reload_poll_secs > 0 {
        spawn_config_poll(
            handle.clone(),
            cli.config.clone(),
            Duration::from_secs(scheduler_cfg.reload_poll_secs),
        );
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    wait_for_shutdown().await;
    info!("shutdown signal received");
    shutdown_tx.send(true).ok();
    engine_task.await.ok();
    info!("flywheel daemon stopped");
    Ok(())
}

fn log_load_report(report: &LoadReport) {
    info!(
        added = report.added.len(),
        removed = report.removed.len(),
        rejected = report.rejected.len(),
        "schedule loaded"
    );
    for (id, e) in &report.rejected {
        warn!(job_id = %id, "job spec rejected: {e}");
    }
}

/// Re-read the config file and hand the engine the new job set.
async fn reload_jobs(handle: &EngineHandle, config_path: Option<&str>) {
    match FlywheelConfig::load(config_path) {
        Ok(config) => {
            if !handle.reload(config.jobs).await {
                warn!("engine already stopped, reload ignored");
            }
        }
        Err(e) => warn!("config reload failed ({e}), keeping current schedule"),
    }
}

/// SIGHUP triggers a schedule reload, the classic daemon convention.
fn spawn_sighup_reload(handle: EngineHandle, config_path: Option<String>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("SIGHUP handler unavailable: {e}");
                return;
            }
        };
        while hup.recv().await.is_some() {
            info!("SIGHUP received, reloading schedule");
            reload_jobs(&handle, config_path.as_deref()).await;
        }
    });
}

/// Optional mtime poll on the config file, for setups where sending
/// signals is awkward (containers, supervisors).
fn spawn_config_poll(handle: EngineHandle, config_path: Option<String>, every: Duration) {
    let watched = FlywheelConfig::resolve_path(config_path.as_deref());
    tokio::spawn(async move {
        let mut last = file_mtime(&watched);
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let mtime = file_mtime(&watched);
            if mtime.is_some() && mtime != last {
                last = mtime;
                info!(path = %watched, "config change detected, reloading schedule");
                reload_jobs(&handle, config_path.as_deref()).await;
            }
        }
    });
}

fn file_mtime(path: &str) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {e}");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
