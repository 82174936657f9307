//! Persisted set declarations (`_sets.json`).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::address::AssetAddress;
use super::DataType;
use crate::core::{EngineError, EngineResult, TimeScale};

/// Default asset roster of a binance pair set. Trade streams, ten book-depth
/// bands and five futures-metrics streams, each bound to its own earliest
/// history class.
pub const PRICE: &str = "price";
pub const VOLUME: &str = "volume";
pub const BOOK_DEPTH_TYPES: [&str; 10] = [
    "bd-p1", "bd-p2", "bd-p3", "bd-p4", "bd-p5", "bd-m1", "bd-m2", "bd-m3", "bd-m4", "bd-m5",
];
pub const METRIC_TYPES: [&str; 5] = [
    "metrics_sum_open_interest",
    "metrics_count_toptrader_long_short_ratio",
    "metrics_sum_toptrader_long_short_ratio",
    "metrics_count_long_short_ratio",
    "metrics_sum_taker_long_short_vol_ratio",
];

pub const ALLOWED_STABLE_SYMBOLS: [&str; 2] = ["USDT", "USDC"];

/// The data type a well-known asset type materializes as. Unknown types with
/// dependencies are indicators (Point); unknown types without dependencies
/// are rejected at validation time.
pub fn builtin_data_type(asset_type: &str) -> Option<DataType> {
    if asset_type == PRICE || asset_type.starts_with("bd-") {
        return Some(DataType::Unit);
    }
    if asset_type == VOLUME || asset_type.starts_with("metrics_") || asset_type == "circulating_supply" {
        return Some(DataType::Quantity);
    }
    None
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetSettings {
    #[serde(rename = "type")]
    pub asset_type: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<AssetAddress>,
    pub min_data_date: String,
    #[serde(default = "default_decimals")]
    pub decimals: i8,
}

fn default_decimals() -> i8 {
    -1
}

impl AssetSettings {
    pub fn new(asset_type: &str, min_data_date: &str, decimals: i8) -> AssetSettings {
        AssetSettings {
            asset_type: asset_type.to_string(),
            arguments: Vec::new(),
            dependencies: Vec::new(),
            min_data_date: min_data_date.to_string(),
            decimals,
        }
    }

    pub fn address(&self, set_id: &str) -> AssetAddress {
        AssetAddress::build(set_id, &self.asset_type, &self.arguments, &self.dependencies)
    }

    pub fn is_indicator(&self) -> bool {
        !self.dependencies.is_empty()
    }

    pub fn data_type(&self) -> EngineResult<DataType> {
        if self.is_indicator() {
            return Ok(DataType::Point);
        }
        builtin_data_type(&self.asset_type).ok_or_else(|| {
            EngineError::Validation(format!(
                "asset type '{}' has no dependencies and is not a known stream type",
                self.asset_type
            ))
        })
    }

    pub fn validate(&self, scale: &TimeScale) -> EngineResult<()> {
        scale.parse_date(&self.min_data_date)?;
        if !(-1..=18).contains(&self.decimals) {
            return Err(EngineError::Validation(format!(
                "decimals {} out of range [-1,18]",
                self.decimals
            )));
        }
        self.data_type()?;
        for dep in &self.dependencies {
            dep.parse()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SettingEntry {
    pub id: String,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SetSettings {
    /// Symbolic id parts; the set id is their lowercased concatenation.
    pub id: Vec<String>,
    pub assets: Vec<AssetSettings>,
    #[serde(default)]
    pub settings: Vec<SettingEntry>,
}

impl SetSettings {
    pub fn id_string(&self) -> String {
        self.id.join("").to_lowercase()
    }

    pub fn db_path(&self, databases_dir: &Path) -> PathBuf {
        databases_dir.join(self.id_string())
    }

    pub fn setting_value(&self, id: &str) -> i64 {
        self.settings
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.value)
            .unwrap_or(0)
    }

    pub fn contains_asset(&self, asset_type: &str) -> bool {
        self.assets.iter().any(|a| a.asset_type == asset_type)
    }

    /// A binance pair set is declared by exactly two symbol parts, the
    /// second being an allowed stablecoin.
    pub fn is_binance_pair(&self) -> bool {
        self.id.len() == 2
            && ALLOWED_STABLE_SYMBOLS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(&self.id[1]))
    }

    pub fn symbols(&self) -> Option<(String, String)> {
        if self.id.len() == 2 {
            Some((self.id[0].to_uppercase(), self.id[1].to_uppercase()))
        } else {
            None
        }
    }

    /// A pair set with its default roster: trade streams starting at
    /// `trade_date`, book-depth streams at `book_depth_date`, metrics
    /// streams at `metrics_date`.
    pub fn binance_pair(
        symbol0: &str,
        symbol1: &str,
        trade_date: &str,
        book_depth_date: &str,
        metrics_date: &str,
        volume_decimals: i8,
    ) -> SetSettings {
        let mut assets = vec![
            AssetSettings::new(PRICE, trade_date, -1),
            AssetSettings::new(VOLUME, trade_date, volume_decimals),
        ];
        for t in BOOK_DEPTH_TYPES {
            assets.push(AssetSettings::new(t, book_depth_date, -1));
        }
        for t in METRIC_TYPES {
            assets.push(AssetSettings::new(t, metrics_date, -1));
        }
        SetSettings {
            id: vec![symbol0.to_string(), symbol1.to_string()],
            assets,
            settings: Vec::new(),
        }
    }

    pub fn validate(&self, scale: &TimeScale) -> EngineResult<()> {
        if self.id_string().is_empty() {
            return Err(EngineError::Validation("set id is empty".to_string()));
        }
        let set_id = self.id_string();
        let mut seen = HashSet::new();
        let declared: HashSet<AssetAddress> =
            self.assets.iter().map(|a| a.address(&set_id)).collect();
        for asset in &self.assets {
            asset.validate(scale)?;
            let addr = asset.address(&set_id);
            if !seen.insert(addr.clone()) {
                return Err(EngineError::Validation(format!(
                    "duplicate asset '{}'",
                    addr
                )));
            }
            // Addresses embed their dependency subtree, so a cycle cannot be
            // expressed; what must hold is that every referenced dependency
            // is itself declared in this set's roster.
            for dep in &asset.dependencies {
                let parsed = dep.parse()?;
                if parsed.set_id == set_id && !declared.contains(dep) {
                    return Err(EngineError::Validation(format!(
                        "asset '{}' depends on undeclared asset '{}'",
                        addr, dep
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scale() -> TimeScale {
        TimeScale::new(Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn pair_roster_has_all_default_streams() {
        let s = SetSettings::binance_pair(
            "BTC", "USDT", "2023-11-14", "2023-11-15", "2023-11-16", 2,
        );
        assert_eq!(s.id_string(), "btcusdt");
        assert!(s.is_binance_pair());
        assert_eq!(s.assets.len(), 17);
        assert!(s.contains_asset("price"));
        assert!(s.contains_asset("bd-m5"));
        assert!(s.contains_asset("metrics_sum_open_interest"));
        s.validate(&scale()).unwrap();
    }

    #[test]
    fn indicator_assets_are_points() {
        let mut asset = AssetSettings::new("ema", "2023-11-14", -1);
        asset.arguments = vec!["12".to_string()];
        asset.dependencies =
            vec![AssetAddress::from_canonical("btcusdt.price").unwrap()];
        assert_eq!(asset.data_type().unwrap(), DataType::Point);
    }

    #[test]
    fn unknown_plain_asset_type_is_rejected() {
        let asset = AssetSettings::new("mystery", "2023-11-14", -1);
        assert!(asset.data_type().is_err());
    }

    #[test]
    fn undeclared_dependency_is_rejected() {
        let mut s = SetSettings::binance_pair(
            "BTC", "USDT", "2023-11-14", "2023-11-14", "2023-11-14", 2,
        );
        let mut ema = AssetSettings::new("ema", "2023-11-14", -1);
        ema.dependencies =
            vec![AssetAddress::from_canonical("btcusdt.mystery").unwrap()];
        s.assets.push(ema);
        assert!(s.validate(&scale()).is_err());
    }

    #[test]
    fn settings_json_round_trip() {
        let s = SetSettings::binance_pair(
            "BTC", "USDT", "2023-11-14", "2023-11-15", "2023-11-16", 2,
        );
        let json = serde_json::to_string(&s).unwrap();
        let back: SetSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
