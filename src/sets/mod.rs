pub mod asset;
pub mod manager;
pub mod read_list;
pub mod set;

pub use asset::{least_consistent, AssetState, DataLimitQuery};
pub use manager::SetManager;
pub use read_list::{ReadEntry, ReadList};
pub use set::{fetch_pair_price, volume_decimals_from_price, Set, SetJson};
