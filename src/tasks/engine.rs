//! The task engine: a deduplicating, multi-slot scheduler.
//!
//! Queued runners dispatch when a slot is free and their running filter
//! accepts the current running set. Duplicate ids coalesce: adding a runner
//! whose id is already queued or running is a no-op.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

use super::runner::{EngineDetails, Runner};
use super::{
    csv_building, indicator_indexing, state_parsing, state_rollback, timeframe_indexing,
};
use crate::config::EngineConfig;
use crate::core::{EngineError, EngineResult, Timeframe};
use crate::sets::{AssetState, SetManager};

struct EngineState {
    queued: VecDeque<Arc<Runner>>,
    running: HashMap<String, Arc<Runner>>,
}

pub struct TaskEngine {
    config: Arc<EngineConfig>,
    manager: Arc<SetManager>,
    max_simultaneous: usize,
    state: Mutex<EngineState>,
    notify: tokio::sync::Notify,
    shutdown: AtomicBool,
}

impl TaskEngine {
    pub fn new(config: Arc<EngineConfig>, manager: Arc<SetManager>) -> Arc<TaskEngine> {
        let max_simultaneous = config.max_simultaneous_parsing.max(1);
        Arc::new(TaskEngine {
            config,
            manager,
            max_simultaneous,
            state: Mutex::new(EngineState {
                queued: VecDeque::new(),
                running: HashMap::new(),
            }),
            notify: tokio::sync::Notify::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn manager(&self) -> &Arc<SetManager> {
        &self.manager
    }

    /// Enqueue a runner. Returns false when its id coalesced with an
    /// already queued or running one.
    pub fn add(self: &Arc<Self>, runner: Runner) -> bool {
        {
            let mut state = self.state.lock().expect("engine lock");
            if state.running.contains_key(&runner.id)
                || state.queued.iter().any(|r| r.id == runner.id)
            {
                return false;
            }
            state.queued.push_back(Arc::new(runner));
        }
        self.notify.notify_one();
        true
    }

    /// Background dispatch loop. Runs until [`TaskEngine::quit`].
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!(slots = engine.max_simultaneous, "task engine started");
            loop {
                if engine.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                engine.dispatch_pass();
                tokio::select! {
                    _ = engine.notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                }
            }
            info!("task engine stopped");
        })
    }

    fn dispatch_pass(self: &Arc<Self>) {
        let mut to_spawn = Vec::new();
        {
            let mut state = self.state.lock().expect("engine lock");
            let mut i = 0;
            while i < state.queued.len() {
                if state.running.len() >= self.max_simultaneous {
                    break;
                }
                let details = EngineDetails {
                    running: state.running.values().cloned().collect(),
                };
                if state.queued[i].accepts(&details) {
                    let runner = state.queued.remove(i).expect("index in bounds");
                    state.running.insert(runner.id.clone(), Arc::clone(&runner));
                    to_spawn.push(runner);
                } else {
                    i += 1;
                }
            }
        }
        for runner in to_spawn {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.execute(runner).await;
            });
        }
    }

    async fn execute(self: &Arc<Self>, runner: Arc<Runner>) {
        runner.mark_started();
        for process in runner.processes() {
            match process(Arc::clone(&runner)).await {
                Ok(()) => {}
                Err(e) if e.is_noop() => break,
                Err(e) => {
                    runner.record_error(e.to_string());
                    error!(runner = %runner.id, error = %e, "runner failed");
                    break;
                }
            }
        }
        runner.mark_finished();
        self.state
            .lock()
            .expect("engine lock")
            .running
            .remove(&runner.id);
        for callback in runner.callbacks() {
            callback(&runner);
        }
        self.notify.notify_one();
    }

    pub fn running_runners(&self) -> Vec<Arc<Runner>> {
        self.state
            .lock()
            .expect("engine lock")
            .running
            .values()
            .cloned()
            .collect()
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().expect("engine lock").queued.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().expect("engine lock");
        state.queued.is_empty() && state.running.is_empty()
    }

    /// Cooperative shutdown: stop dispatching and interrupt running work.
    pub fn quit(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for runner in self.running_runners() {
            runner.interrupt();
        }
        self.notify.notify_one();
    }

    // ---------------------------------------------------------------------
    // Runner constructors
    // ---------------------------------------------------------------------

    pub fn add_timeframe_indexing(
        self: &Arc<Self>,
        asset: &Arc<AssetState>,
        timeframe: Timeframe,
    ) -> EngineResult<()> {
        if timeframe <= self.config.min_time_frame {
            return Err(EngineError::TimeframeTooSmall);
        }
        self.add(timeframe_indexing::build_runner(
            Arc::clone(asset),
            timeframe,
        ));
        Ok(())
    }

    pub fn add_indicator_indexing(
        self: &Arc<Self>,
        asset: &Arc<AssetState>,
        timeframe: Timeframe,
    ) -> EngineResult<()> {
        let deps = self.manager.dependencies_of(asset)?;
        self.add(indicator_indexing::build_runner(
            Arc::clone(asset),
            deps,
            timeframe,
        )?);
        Ok(())
    }

    /// Enqueue parsing of the next missing day. Surfaces `AlreadySynced`
    /// when the stream is fresh and `FileTooRecent` when the archive is
    /// still being written.
    pub fn add_state_parsing(self: &Arc<Self>, asset: &Arc<AssetState>) -> EngineResult<()> {
        if asset.is_indicator() {
            return Err(EngineError::Validation(
                "indicator assets are materialized by indicator indexing".to_string(),
            ));
        }
        let date = asset.should_sync()?.ok_or(EngineError::AlreadySynced)?;

        let zip_path = self.config.archive_file_path(
            asset.set_id(),
            &asset.parsed().asset_type,
            &date,
            "zip",
        );
        let meta = std::fs::metadata(&zip_path)?;
        if let Ok(modified) = meta.modified() {
            if modified.elapsed().unwrap_or_default() < Duration::from_secs(60) {
                return Err(EngineError::FileTooRecent);
            }
        }

        let engine = Arc::downgrade(self);
        let chained = Arc::clone(asset);
        let runner = state_parsing::build_runner(Arc::clone(asset), date, move |runner| {
            // A clean four-step finish chains the next day and any newly
            // eligible indexing work.
            if runner.count_steps() >= 4 && runner.error().is_none() {
                if let Some(engine) = engine.upgrade() {
                    engine.run_asset_tasks(&chained);
                }
            }
        });
        self.add(runner);
        Ok(())
    }

    pub fn add_state_rollback(
        self: &Arc<Self>,
        asset: &Arc<AssetState>,
        date: &str,
        timeframe: Timeframe,
    ) -> EngineResult<()> {
        self.config.scale.parse_date(date)?;
        self.add(state_rollback::build_runner(
            Arc::clone(asset),
            date.to_string(),
            timeframe,
        )?);
        Ok(())
    }

    pub fn add_csv_building(
        self: &Arc<Self>,
        order: csv_building::CsvBuildOrder,
    ) -> EngineResult<()> {
        self.add(csv_building::build_runner(order)?);
        Ok(())
    }

    /// Schedule everything an asset currently needs: the next archive day,
    /// lagging higher timeframes and dependent indicator streams.
    pub fn run_asset_tasks(self: &Arc<Self>, asset: &Arc<AssetState>) {
        if asset.is_indicator() {
            match asset.active_timeframes() {
                Ok(tfs) => {
                    for tf in tfs {
                        if let Err(e) = self.add_indicator_indexing(asset, tf) {
                            error!(asset = %asset.set_and_asset_id(), error = %e, "indicator scheduling failed");
                        }
                    }
                }
                Err(e) => {
                    error!(asset = %asset.set_and_asset_id(), error = %e, "reading active timeframes failed")
                }
            }
            return;
        }

        match self.add_state_parsing(asset) {
            Ok(()) => {}
            Err(e) if e.is_noop() => {}
            Err(EngineError::Io(_)) => {} // archive not downloaded yet
            Err(e) => {
                error!(asset = %asset.set_and_asset_id(), error = %e, "state parsing scheduling failed")
            }
        }

        match asset.timeframes_to_reindex() {
            Ok(tfs) => {
                for tf in tfs {
                    if let Err(e) = self.add_timeframe_indexing(asset, tf) {
                        error!(asset = %asset.set_and_asset_id(), error = %e, "timeframe scheduling failed");
                    }
                }
            }
            Err(e) => {
                error!(asset = %asset.set_and_asset_id(), error = %e, "reindex probe failed")
            }
        }

        self.run_dependent_tasks(asset);
    }

    /// Kick indicator indexing for every asset in the same set whose
    /// dependency closure contains this asset.
    fn run_dependent_tasks(self: &Arc<Self>, asset: &Arc<AssetState>) {
        let Some(set) = self.manager.find(asset.set_id()) else {
            return;
        };
        for candidate in set.assets() {
            if !candidate.is_indicator() {
                continue;
            }
            let closure = match candidate.parsed().dependency_closure() {
                Ok(c) => c,
                Err(_) => continue,
            };
            if !closure.contains(asset.address()) {
                continue;
            }
            if let Ok(tfs) = candidate.active_timeframes() {
                for tf in tfs {
                    let _ = self.add_indicator_indexing(&candidate, tf);
                }
            }
        }
    }

    /// Queued and running runners of one kind, for kind-specific listings.
    pub fn runners_of_kind(&self, kind_key: &str) -> Vec<Arc<Runner>> {
        let state = self.state.lock().expect("engine lock");
        state
            .running
            .values()
            .chain(state.queued.iter())
            .filter(|r| r.args.kind == kind_key)
            .cloned()
            .collect()
    }

    /// Serializable status of live work, merged into listings.
    pub fn statuses(&self) -> Vec<RunnerStatus> {
        let state = self.state.lock().expect("engine lock");
        let mut out: Vec<RunnerStatus> = state
            .running
            .values()
            .map(|r| RunnerStatus::from_runner(r, true))
            .chain(
                state
                    .queued
                    .iter()
                    .map(|r| RunnerStatus::from_runner(r, false)),
            )
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RunnerStatus {
    pub id: String,
    pub kind: String,
    pub running: bool,
    pub percent: f64,
    pub steps: u32,
    pub error: Option<String>,
}

impl RunnerStatus {
    fn from_runner(runner: &Arc<Runner>, running: bool) -> RunnerStatus {
        RunnerStatus {
            id: runner.id.clone(),
            kind: runner.args.kind.to_string(),
            running,
            percent: runner.percent(),
            steps: runner.count_steps(),
            error: runner.error(),
        }
    }
}

/// Composite runner ids, shared by constructors and listings.
pub fn runner_id(kind_key: &str, parts: &[&str]) -> String {
    let mut id = kind_key.to_string();
    for part in parts {
        id.push('-');
        id.push_str(part);
    }
    id
}
