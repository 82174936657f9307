//! Byte layout of every key in a set's store.
//!
//! Asset-scoped keys open with the two-byte asset key and a one-byte column
//! tag. Data keys end with a big-endian timestamp so lexicographic order
//! equals timestamp order within one `(asset, timeframe)` stream.

use crate::core::{EngineError, EngineResult, TimeUnit};
use crate::models::AssetAddress;

pub const READ_LIST_COLUMN: u8 = 0x00;
pub const LAST_CONSISTENCY_TIME_COLUMN: u8 = 0x01;
pub const PREV_STATE_COLUMN: u8 = 0x02;
pub const DATA_COLUMN: u8 = 0xFF;

const READ_LIST_SUFFIX: &[u8] = b"read_list";

/// Set-level keys live outside any asset's two-byte prefix space.
pub const LAST_ASSET_KEY: &[u8] = b"last_key";
pub const PRICES_KEY: &[u8] = b"prices";
const KEY_LOOKUP_PREFIX: &[u8] = b"key";

pub type AssetKey = [u8; 2];

pub fn read_list_key(asset: AssetKey) -> Vec<u8> {
    let mut k = Vec::with_capacity(3 + READ_LIST_SUFFIX.len());
    k.extend_from_slice(&asset);
    k.push(READ_LIST_COLUMN);
    k.extend_from_slice(READ_LIST_SUFFIX);
    k
}

pub fn consistency_key(asset: AssetKey, label: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(3 + label.len());
    k.extend_from_slice(&asset);
    k.push(LAST_CONSISTENCY_TIME_COLUMN);
    k.extend_from_slice(label.as_bytes());
    k
}

pub fn prev_state_key(asset: AssetKey, label: &str, date: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(3 + label.len() + date.len());
    k.extend_from_slice(&asset);
    k.push(PREV_STATE_COLUMN);
    k.extend_from_slice(label.as_bytes());
    k.extend_from_slice(date.as_bytes());
    k
}

pub fn data_key(asset: AssetKey, label: &str, time: TimeUnit) -> Vec<u8> {
    let mut k = Vec::with_capacity(3 + label.len() + 8);
    k.extend_from_slice(&asset);
    k.push(DATA_COLUMN);
    k.extend_from_slice(label.as_bytes());
    k.extend_from_slice(&time.to_be_bytes());
    k
}

/// Inverse of [`data_key`]: `(timeframe label, timestamp)`. Rejects any key
/// whose tag is not the data column or whose trailing timestamp is missing.
pub fn parse_data_key(key: &[u8]) -> EngineResult<(String, TimeUnit)> {
    if key.len() < 3 || key[2] != DATA_COLUMN {
        return Err(EngineError::Malformed("invalid tick key format".to_string()));
    }
    let body = &key[3..];
    if body.len() < 8 + 1 {
        return Err(EngineError::Malformed("invalid tick key format".to_string()));
    }
    let (label_bytes, ts_bytes) = body.split_at(body.len() - 8);
    let label = std::str::from_utf8(label_bytes)
        .map_err(|_| EngineError::Malformed("invalid tick key format".to_string()))?;
    let time = TimeUnit::from_be_bytes(ts_bytes.try_into().expect("8 bytes"));
    Ok((label.to_string(), time))
}

/// Lookup key for `address -> asset key`.
pub fn address_lookup_key(address: &AssetAddress) -> Vec<u8> {
    address.as_bytes().to_vec()
}

/// Lookup key for `asset key -> address`.
pub fn key_lookup_key(asset: AssetKey) -> Vec<u8> {
    let mut k = Vec::with_capacity(KEY_LOOKUP_PREFIX.len() + 2);
    k.extend_from_slice(KEY_LOOKUP_PREFIX);
    k.extend_from_slice(&asset);
    k
}

/// The next position in the dense two-byte keyspace, or `None` once
/// `(255, 255)` is taken.
pub fn next_asset_key(last: AssetKey) -> Option<AssetKey> {
    if last[1] < 255 {
        Some([last[0], last[1] + 1])
    } else if last[0] < 255 {
        Some([last[0] + 1, 0])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASSET: AssetKey = [0, 7];

    #[test]
    fn data_key_round_trip() {
        let t = TimeUnit::new(1_700_000_000);
        let key = data_key(ASSET, "1min", t);
        let (label, time) = parse_data_key(&key).unwrap();
        assert_eq!(label, "1min");
        assert_eq!(time, t);
    }

    #[test]
    fn data_keys_sort_by_timestamp() {
        let a = data_key(ASSET, "1s", TimeUnit::new(100));
        let b = data_key(ASSET, "1s", TimeUnit::new(101));
        let c = data_key(ASSET, "1s", TimeUnit::new(-1));
        assert!(a < b);
        // Negative timestamps sort above positive ones in raw big-endian
        // two's complement; streams never store them.
        assert!(b < c);
    }

    #[test]
    fn parse_rejects_foreign_columns() {
        assert!(parse_data_key(&consistency_key(ASSET, "1s")).is_err());
        assert!(parse_data_key(&read_list_key(ASSET)).is_err());
        assert!(parse_data_key(b"xy").is_err());
        // Tag alone, no label or timestamp.
        assert!(parse_data_key(&[0, 7, DATA_COLUMN]).is_err());
    }

    #[test]
    fn column_tags_partition_one_asset_prefix() {
        let rl = read_list_key(ASSET);
        let ct = consistency_key(ASSET, "1s");
        let ps = prev_state_key(ASSET, "1s", "2023-11-14");
        let dt = data_key(ASSET, "1s", TimeUnit::new(0));
        assert!(rl < ct && ct < ps && ps < dt);
    }

    #[test]
    fn keyspace_walks_densely_and_ends() {
        assert_eq!(next_asset_key([0, 0]), Some([0, 1]));
        assert_eq!(next_asset_key([0, 255]), Some([1, 0]));
        assert_eq!(next_asset_key([255, 255]), None);
    }
}
