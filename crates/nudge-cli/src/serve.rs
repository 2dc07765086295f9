use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use nudge_config::NudgeConfig;
use nudge_cron::{AgentRouter, DelayedQueue, LogSink, ReminderEngine, TimerQueue};
use nudge_storage::SqliteReminderStore;

use crate::GlobalArgs;

/// Load config, open the database and assemble an engine around `queue`.
pub fn open_engine(
    global: &GlobalArgs,
    queue: impl FnOnce(&NudgeConfig) -> Arc<dyn DelayedQueue>,
) -> Result<ReminderEngine> {
    let config = match &global.config {
        Some(path) => nudge_config::load_config_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => nudge_config::load_config().context("Failed to load config")?,
    };

    let db_path = match &global.db {
        Some(path) => path.clone(),
        None => config.database_path()?,
    };
    nudge_config::ensure_parent_dir(&db_path)?;
    let store = SqliteReminderStore::open(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let dispatcher = AgentRouter::from_config(&config.agent)?;
    let queue = queue(&config);

    Ok(ReminderEngine::new(
        &config,
        Arc::new(store),
        queue,
        Arc::new(dispatcher),
        Arc::new(LogSink),
    ))
}

/// Run the engine in the foreground until Ctrl-C.
pub async fn run_serve(global: &GlobalArgs) -> Result<()> {
    let engine = open_engine(global, |config| {
        Arc::new(TimerQueue::new(config.worker.max_concurrent))
    })?;

    let report = engine.start().await?;
    info!(
        scanned = report.scanned,
        enqueued = report.enqueued,
        fired_now = report.fired_now,
        "Serving reminders, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    engine.shutdown().await;
    Ok(())
}
