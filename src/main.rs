//! Tick indexer daemon.
//!
//! Loads the set registry, schedules parsing/indexing work through the task
//! engine and runs periodic maintenance until interrupted.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tick_indexer::config::EngineConfig;
use tick_indexer::core::Timeframe;
use tick_indexer::sets::SetManager;
use tick_indexer::tasks::TaskEngine;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Arc::new(EngineConfig::from_env()?);
    config.ensure_directories()?;
    info!(
        base = %config.min_time_frame.label(),
        databases = %config.databases_dir.display(),
        archives = %config.archives_dir.display(),
        csv = %config.csv_dir.display(),
        slots = config.max_simultaneous_parsing,
        "starting tick indexer"
    );

    let manager = SetManager::load(Arc::clone(&config)).await?;
    let engine = TaskEngine::new(Arc::clone(&config), Arc::clone(&manager));
    let engine_handle = engine.start();
    let maintenance_handle = manager.spawn_maintenance();
    let csv_cleanup_handle = spawn_csv_cleanup(Arc::clone(&config));

    // Materialize the default 4h view and kick whatever each asset needs.
    for set in manager.list() {
        match set.add_timeframe(Timeframe::parse_label("4h")?) {
            Ok(_) => {}
            Err(e) => error!(set = %set.id(), error = %e, "registering 4h timeframe failed"),
        }
        for asset in set.assets() {
            engine.run_asset_tasks(&asset);
        }
    }

    signal::ctrl_c().await?;
    info!("shutdown signal received");

    engine.quit();
    csv_cleanup_handle.abort();
    maintenance_handle.abort();
    engine_handle.await.ok();
    info!("exiting");
    Ok(())
}

/// Drop finished export archives older than a day, once per day.
fn spawn_csv_cleanup(config: Arc<EngineConfig>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(86_400));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let dir = match std::fs::read_dir(&config.csv_dir) {
                Ok(dir) => dir,
                Err(e) => {
                    error!(error = %e, "reading csv dir failed");
                    continue;
                }
            };
            for entry in dir.flatten() {
                let path = entry.path();
                if path.extension().map(|e| e == "zip") != Some(true) {
                    continue;
                }
                let old = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|t| t.elapsed().unwrap_or_default() > Duration::from_secs(86_400))
                    .unwrap_or(false);
                if old {
                    match std::fs::remove_file(&path) {
                        Ok(()) => info!(file = %path.display(), "expired export removed"),
                        Err(e) => error!(file = %path.display(), error = %e, "removing export failed"),
                    }
                }
            }
        }
    })
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tick_indexer=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .compact()
        .init();
}
