pub mod error;
pub mod time;
pub mod timeframe;

pub use error::{EngineError, EngineResult};
pub use time::{TimeScale, TimeUnit};
pub use timeframe::{initial_bucket_range, Timeframe};
