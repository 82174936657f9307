//! A named unit of schedulable work: sequential processes, post-process
//! callbacks, a dispatch filter and live progress accounting.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::core::{EngineResult, Timeframe};
use crate::models::AssetAddress;

pub mod kind {
    pub const STATE_PARSING: &str = "state_parsing";
    pub const TIMEFRAME_INDEXING: &str = "timeframe_indexing";
    pub const INDICATOR_INDEXING: &str = "indicator_indexing";
    pub const STATE_ROLLBACK: &str = "state_rollback";
    pub const CSV_BUILDING: &str = "csv_building";
}

pub const STAT_ARCHIVE_SIZE: &str = "ARCHIVE_SIZE";
pub const STAT_DATA_COUNT: &str = "DATA_COUNT";
pub const STAT_LINE_COUNT: &str = "LINE_COUNT";

/// Comparable metadata the conflict filters read.
#[derive(Debug, Clone)]
pub struct RunnerArgs {
    pub kind: &'static str,
    /// Target asset addresses.
    pub addresses: Vec<AssetAddress>,
    /// Transitive dependency closure; populated for indicator and rollback
    /// work, empty otherwise.
    pub closure: Vec<AssetAddress>,
    pub timeframe: Option<Timeframe>,
    pub date: Option<String>,
}

impl RunnerArgs {
    pub fn new(kind: &'static str, addresses: Vec<AssetAddress>) -> RunnerArgs {
        RunnerArgs {
            kind,
            addresses,
            closure: Vec::new(),
            timeframe: None,
            date: None,
        }
    }

    pub fn with_timeframe(mut self, timeframe: Timeframe) -> RunnerArgs {
        self.timeframe = Some(timeframe);
        self
    }

    pub fn with_date(mut self, date: impl Into<String>) -> RunnerArgs {
        self.date = Some(date.into());
        self
    }

    pub fn with_closure(mut self, closure: Vec<AssetAddress>) -> RunnerArgs {
        self.closure = closure;
        self
    }
}

pub type ProcessFn =
    Box<dyn Fn(Arc<Runner>) -> BoxFuture<'static, EngineResult<()>> + Send + Sync>;
pub type CallbackFn = Box<dyn Fn(&Arc<Runner>) + Send + Sync>;
pub type FilterFn = Box<dyn Fn(&EngineDetails, &Runner) -> bool + Send + Sync>;

/// Snapshot of the engine the dispatch filter sees.
pub struct EngineDetails {
    pub running: Vec<Arc<Runner>>,
}

#[derive(Default)]
struct RunnerSize {
    initial: AtomicI64,
    current: AtomicI64,
    max: AtomicI64,
}

pub struct Runner {
    pub id: String,
    pub args: RunnerArgs,
    processes: Vec<ProcessFn>,
    callbacks: Vec<CallbackFn>,
    filter: Option<FilterFn>,
    size: RunnerSize,
    steps: AtomicU32,
    stats: Mutex<HashMap<&'static str, i64>>,
    started_at: Mutex<Option<Instant>>,
    finished: AtomicBool,
    interrupted: AtomicBool,
    error: Mutex<Option<String>>,
}

pub struct RunnerBuilder {
    runner: Runner,
}

impl RunnerBuilder {
    pub fn process<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Runner>) -> BoxFuture<'static, EngineResult<()>> + Send + Sync + 'static,
    {
        self.runner.processes.push(Box::new(f));
        self
    }

    pub fn callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Runner>) + Send + Sync + 'static,
    {
        self.runner.callbacks.push(Box::new(f));
        self
    }

    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&EngineDetails, &Runner) -> bool + Send + Sync + 'static,
    {
        self.runner.filter = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Runner {
        self.runner
    }
}

impl Runner {
    pub fn builder(id: impl Into<String>, args: RunnerArgs) -> RunnerBuilder {
        RunnerBuilder {
            runner: Runner {
                id: id.into(),
                args,
                processes: Vec::new(),
                callbacks: Vec::new(),
                filter: None,
                size: RunnerSize::default(),
                steps: AtomicU32::new(0),
                stats: Mutex::new(HashMap::new()),
                started_at: Mutex::new(None),
                finished: AtomicBool::new(false),
                interrupted: AtomicBool::new(false),
                error: Mutex::new(None),
            },
        }
    }

    pub(crate) fn processes(&self) -> &[ProcessFn] {
        &self.processes
    }

    pub(crate) fn callbacks(&self) -> &[CallbackFn] {
        &self.callbacks
    }

    /// True when it is safe to dispatch this runner against the currently
    /// running set.
    pub fn accepts(&self, details: &EngineDetails) -> bool {
        match &self.filter {
            Some(f) => f(details, self),
            None => true,
        }
    }

    // -- lifecycle ---------------------------------------------------------

    pub(crate) fn mark_started(&self) {
        *self.started_at.lock().expect("runner lock") = Some(Instant::now());
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn has_started(&self) -> bool {
        self.started_at.lock().expect("runner lock").is_some()
    }

    pub fn is_done(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.has_started() && !self.is_done()
    }

    pub fn timer(&self) -> Duration {
        self.started_at
            .lock()
            .expect("runner lock")
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    // -- cancellation ------------------------------------------------------

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Consulted between batches; a cancelled runner stops at the next
    /// batch boundary, leaving a valid resting state.
    pub fn must_interrupt(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    // -- error -------------------------------------------------------------

    pub(crate) fn record_error(&self, message: String) {
        *self.error.lock().expect("runner lock") = Some(message);
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().expect("runner lock").clone()
    }

    // -- progress ----------------------------------------------------------

    pub fn set_size_initial(&self, v: i64) {
        self.size.initial.store(v, Ordering::Relaxed);
        self.size.current.store(v, Ordering::Relaxed);
    }

    pub fn set_size_current(&self, v: i64) {
        self.size.current.store(v, Ordering::Relaxed);
    }

    pub fn set_size_max(&self, v: i64) {
        self.size.max.store(v, Ordering::Relaxed);
    }

    pub fn size(&self) -> (i64, i64, i64) {
        (
            self.size.initial.load(Ordering::Relaxed),
            self.size.current.load(Ordering::Relaxed),
            self.size.max.load(Ordering::Relaxed),
        )
    }

    pub fn percent(&self) -> f64 {
        let (initial, current, max) = self.size();
        if max <= initial {
            return 0.0;
        }
        ((current - initial) as f64 / (max - initial) as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Remaining wall time, extrapolated from throughput since start.
    pub fn eta(&self) -> Duration {
        let (initial, current, max) = self.size();
        let done = current - initial;
        let left = max - current;
        if done <= 0 || left <= 0 {
            return Duration::ZERO;
        }
        let elapsed = self.timer().as_secs_f64();
        Duration::from_secs_f64(elapsed * left as f64 / done as f64)
    }

    pub fn add_step(&self) {
        self.steps.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count_steps(&self) -> u32 {
        self.steps.load(Ordering::SeqCst)
    }

    pub fn set_stat(&self, key: &'static str, value: i64) {
        self.stats.lock().expect("runner lock").insert(key, value);
    }

    pub fn increment_stat(&self, key: &'static str, by: i64) {
        *self
            .stats
            .lock()
            .expect("runner lock")
            .entry(key)
            .or_insert(0) += by;
    }

    pub fn stat_value(&self, key: &str) -> i64 {
        self.stats
            .lock()
            .expect("runner lock")
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("id", &self.id)
            .field("kind", &self.args.kind)
            .field("steps", &self.count_steps())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percent_and_eta() {
        let runner = Runner::builder("t", RunnerArgs::new(kind::STATE_PARSING, vec![])).build();
        runner.set_size_initial(0);
        runner.set_size_max(200);
        runner.mark_started();
        runner.set_size_current(50);
        assert_eq!(runner.percent(), 25.0);
        assert!(runner.eta() >= Duration::ZERO);
    }

    #[test]
    fn stats_accumulate() {
        let runner = Runner::builder("t", RunnerArgs::new(kind::STATE_PARSING, vec![])).build();
        runner.increment_stat(STAT_DATA_COUNT, 5);
        runner.increment_stat(STAT_DATA_COUNT, 2);
        assert_eq!(runner.stat_value(STAT_DATA_COUNT), 7);
        assert_eq!(runner.stat_value("missing"), 0);
    }

    #[test]
    fn interruption_is_sticky() {
        let runner = Runner::builder("t", RunnerArgs::new(kind::CSV_BUILDING, vec![])).build();
        assert!(!runner.must_interrupt());
        runner.interrupt();
        assert!(runner.must_interrupt());
    }
}
