pub mod csv_building;
pub mod engine;
pub mod filters;
pub mod indicator_indexing;
pub mod runner;
pub mod state_parsing;
pub mod state_rollback;
pub mod timeframe_indexing;

pub use csv_building::{
    list_exports, parse_packed_order, CsvAssetOrder, CsvBuildOrder, CsvStatus, PackedCsvOrder,
};
pub use engine::{RunnerStatus, TaskEngine};
pub use runner::{kind, Runner, RunnerArgs};
