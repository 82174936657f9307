//! Embedded tick-series storage and indexing engine.
//!
//! Ingests per-day market-data archives into per-asset tick streams over
//! RocksDB, aggregates them into higher timeframes, computes dependent
//! indicators over dependency DAGs and exports bounded ranges as zipped CSV
//! archives. A deduplicating task engine serializes conflicting work while
//! running independent work in parallel.

pub mod config;
pub mod core;
pub mod database;
pub mod indicators;
pub mod models;
pub mod sets;
pub mod tasks;

pub use crate::config::EngineConfig;
pub use crate::core::{EngineError, EngineResult, TimeScale, TimeUnit, Timeframe};
pub use crate::models::{AssetAddress, DataType, SetSettings, TickList, TickValue};
pub use crate::sets::{AssetState, Set, SetManager};
pub use crate::tasks::TaskEngine;
