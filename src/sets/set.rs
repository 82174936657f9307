//! A set: one KV store, its asset streams and set-level records.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use super::asset::AssetState;
use crate::config::EngineConfig;
use crate::core::{EngineError, EngineResult, Timeframe};
use crate::database::{keys, SetDb};
use crate::models::{settings, AssetAddress, AssetSettings, SetSettings};

pub struct Set {
    id: String,
    settings: RwLock<SetSettings>,
    db: Arc<SetDb>,
    config: Arc<EngineConfig>,
    assets: RwLock<HashMap<AssetAddress, Arc<AssetState>>>,
}

impl Set {
    /// Open the set's store and materialize every declared asset. A binance
    /// pair set resolves and persists its reference prices on first open.
    pub async fn open(set_settings: SetSettings, config: Arc<EngineConfig>) -> EngineResult<Arc<Set>> {
        set_settings.validate(&config.scale)?;
        let id = set_settings.id_string();
        let db = SetDb::open(&set_settings.db_path(&config.databases_dir), &config.rocksdb)?;
        info!(set = %id, "set open");

        let set = Arc::new(Set {
            id: id.clone(),
            settings: RwLock::new(set_settings.clone()),
            db,
            config,
            assets: RwLock::new(HashMap::new()),
        });

        if set_settings.is_binance_pair() {
            set.ensure_prices().await?;
        }

        for asset in &set_settings.assets {
            set.register_asset(asset)?;
        }
        Ok(set)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn db(&self) -> &Arc<SetDb> {
        &self.db
    }

    pub fn settings(&self) -> SetSettings {
        self.settings.read().expect("settings lock").clone()
    }

    pub fn size(&self) -> i64 {
        self.db.approximate_size()
    }

    pub fn find_asset(&self, address: &AssetAddress) -> Option<Arc<AssetState>> {
        self.assets
            .read()
            .expect("assets lock")
            .get(address)
            .cloned()
    }

    /// Find a plain stream by its asset type (`price`, `volume`, ...).
    pub fn asset_by_type(&self, asset_type: &str) -> Option<Arc<AssetState>> {
        self.assets
            .read()
            .expect("assets lock")
            .values()
            .find(|a| a.parsed().asset_type == asset_type && !a.is_indicator())
            .cloned()
    }

    pub fn assets(&self) -> Vec<Arc<AssetState>> {
        let mut list: Vec<Arc<AssetState>> = self
            .assets
            .read()
            .expect("assets lock")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.address().cmp(b.address()));
        list
    }

    /// Deduplicated union of every asset's active timeframes.
    pub fn all_assets_timeframes(&self) -> EngineResult<Vec<Timeframe>> {
        let mut out: Vec<Timeframe> = Vec::new();
        for asset in self.assets() {
            for tf in asset.active_timeframes()? {
                if !out.contains(&tf) {
                    out.push(tf);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Register a higher timeframe on every aggregatable stream; returns the
    /// assets whose index now lags so the caller can enqueue their work.
    pub fn add_timeframe(&self, timeframe: Timeframe) -> EngineResult<Vec<Arc<AssetState>>> {
        if timeframe <= self.config.min_time_frame {
            return Err(EngineError::TimeframeTooSmall);
        }
        let mut touched = Vec::new();
        for asset in self.assets() {
            if asset.is_indicator() || !asset.data_type().is_aggregatable() {
                continue;
            }
            asset.add_if_unfound_in_read_list(timeframe)?;
            touched.push(asset);
        }
        Ok(touched)
    }

    /// Add a new asset to a live set. The inclusion must not change what
    /// kind of set this is: a pair set only accepts its roster stream types
    /// and indicators over existing assets.
    pub fn add_asset(&self, asset_settings: AssetSettings) -> EngineResult<Arc<AssetState>> {
        asset_settings.validate(&self.config.scale)?;
        let address = asset_settings.address(&self.id);
        if self.find_asset(&address).is_some() {
            return Err(EngineError::Validation(format!(
                "asset '{}' already exists",
                address
            )));
        }

        let is_pair = self.settings.read().expect("settings lock").is_binance_pair();
        if is_pair
            && !asset_settings.is_indicator()
            && settings::builtin_data_type(&asset_settings.asset_type).is_none()
        {
            return Err(EngineError::Validation(format!(
                "asset type '{}' would change the type of pair set '{}'",
                asset_settings.asset_type, self.id
            )));
        }
        for dep in &asset_settings.dependencies {
            let parsed = dep.parse()?;
            if parsed.set_id == self.id && self.find_asset(dep).is_none() {
                return Err(EngineError::Validation(format!(
                    "dependency '{}' is not registered",
                    dep
                )));
            }
        }

        let state = self.register_asset(&asset_settings)?;
        self.settings
            .write()
            .expect("settings lock")
            .assets
            .push(asset_settings);
        Ok(state)
    }

    /// Look up or allocate the asset's 2-byte key, persist both address
    /// mappings and attach the state.
    fn register_asset(&self, asset_settings: &AssetSettings) -> EngineResult<Arc<AssetState>> {
        let address = asset_settings.address(&self.id);
        let key = self.lookup_or_allocate_key(&address)?;
        let state = AssetState::new(
            key,
            asset_settings,
            &self.id,
            Arc::clone(&self.db),
            Arc::clone(&self.config),
        )?;
        self.assets
            .write()
            .expect("assets lock")
            .insert(address, Arc::clone(&state));
        Ok(state)
    }

    fn lookup_or_allocate_key(&self, address: &AssetAddress) -> EngineResult<keys::AssetKey> {
        if let Some(raw) = self.db.get(&keys::address_lookup_key(address))? {
            if raw.len() == 2 {
                return Ok([raw[0], raw[1]]);
            }
            return Err(EngineError::Storage(format!(
                "corrupt key mapping for '{}'",
                address
            )));
        }

        let mut candidate = match self.db.get(keys::LAST_ASSET_KEY)? {
            Some(last) if last.len() == 2 => keys::next_asset_key([last[0], last[1]])
                .ok_or(EngineError::KeyspaceExhausted)?,
            _ => [0, 0],
        };
        loop {
            if self.db.get(&keys::key_lookup_key(candidate))?.is_none() {
                break;
            }
            candidate =
                keys::next_asset_key(candidate).ok_or(EngineError::KeyspaceExhausted)?;
        }

        self.db
            .put(&keys::address_lookup_key(address), &candidate)?;
        self.db
            .put(&keys::key_lookup_key(candidate), address.as_bytes())?;
        self.db.put(keys::LAST_ASSET_KEY, &candidate)?;
        Ok(candidate)
    }

    // ---------------------------------------------------------------------
    // Reference prices
    // ---------------------------------------------------------------------

    /// Cached `(symbol0, symbol1)` reference prices; fetched once and stored
    /// as two big-endian f64 under the set-level prices key.
    pub async fn ensure_prices(&self) -> EngineResult<(f64, f64)> {
        if let Some(raw) = self.db.get(keys::PRICES_KEY)? {
            if raw.len() == 16 {
                return Ok((
                    f64::from_be_bytes(raw[..8].try_into().expect("8 bytes")),
                    f64::from_be_bytes(raw[8..].try_into().expect("8 bytes")),
                ));
            }
            warn!(set = %self.id, "prices record has wrong length, refetching");
        }

        let (symbol0, symbol1) = self
            .settings
            .read()
            .expect("settings lock")
            .symbols()
            .ok_or_else(|| {
                EngineError::Validation(format!("set '{}' is not a pair", self.id))
            })?;

        let price0 = resolve_symbol_price(&symbol0).await?;
        let price1 = resolve_symbol_price(&symbol1).await?;

        let mut raw = Vec::with_capacity(16);
        raw.extend_from_slice(&price0.to_be_bytes());
        raw.extend_from_slice(&price1.to_be_bytes());
        self.db.put(keys::PRICES_KEY, &raw)?;
        info!(set = %self.id, price0, price1, "reference prices stored");
        Ok((price0, price1))
    }

    pub fn run_gc(&self) -> EngineResult<()> {
        self.db.run_gc()
    }

    pub fn json(&self) -> EngineResult<SetJson> {
        let mut assets = Vec::new();
        for asset in self.assets() {
            let entries = asset.read_entries()?;
            assets.push(AssetJson {
                address: asset.address().clone(),
                data_type: format!("{:?}", asset.data_type()).to_lowercase(),
                decimals: asset.decimals(),
                min_data_date: asset.min_data_date().to_string(),
                timeframes: entries.iter().map(|e| e.timeframe.label()).collect(),
                consistency_ranges: entries
                    .iter()
                    .map(|e| [e.consistency[0].int(), e.consistency[1].int()])
                    .collect(),
            });
        }
        Ok(SetJson {
            settings: self.settings(),
            size: self.size(),
            assets,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetJson {
    pub address: AssetAddress,
    #[serde(rename = "type")]
    pub data_type: String,
    pub decimals: i8,
    pub min_data_date: String,
    pub timeframes: Vec<String>,
    pub consistency_ranges: Vec<[i64; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetJson {
    pub settings: SetSettings,
    pub size: i64,
    pub assets: Vec<AssetJson>,
}

#[derive(Debug, Deserialize)]
struct TickerPriceResponse {
    #[allow(dead_code)]
    symbol: String,
    price: String,
}

/// A stablecoin resolves to 1.0 without a network call; anything else is
/// quoted against USDT on the spot ticker endpoint, falling back to the
/// futures endpoint when the spot pair does not exist.
async fn resolve_symbol_price(symbol: &str) -> EngineResult<f64> {
    if settings::ALLOWED_STABLE_SYMBOLS
        .iter()
        .any(|s| s.eq_ignore_ascii_case(symbol))
    {
        return Ok(1.0);
    }
    let pair = format!("{}USDT", symbol);
    match fetch_pair_price(&pair, false).await {
        Ok(price) => Ok(price),
        Err(EngineError::NotFound { .. }) => fetch_pair_price(&pair, true).await,
        Err(e) => Err(e),
    }
}

pub async fn fetch_pair_price(pair: &str, futures: bool) -> EngineResult<f64> {
    let url = if futures {
        format!("https://fapi.binance.com/fapi/v1/ticker/price?symbol={}", pair)
    } else {
        format!("https://api.binance.com/api/v3/ticker/price?symbol={}", pair)
    };

    let resp = reqwest::get(&url).await?;
    let status = resp.status();
    if status.as_u16() == 400 || status.as_u16() == 404 {
        return Err(EngineError::not_found("pair", pair));
    }
    if !status.is_success() {
        return Err(EngineError::Network(format!(
            "unexpected status {} for {}",
            status, pair
        )));
    }

    let ticker: TickerPriceResponse = resp.json().await?;
    if ticker.price.is_empty() {
        return Err(EngineError::Network(format!("empty price for {}", pair)));
    }
    ticker
        .price
        .parse()
        .map_err(|_| EngineError::Malformed(format!("price '{}' for {}", ticker.price, pair)))
}

/// Decimal precision the volume stream records at, derived from the quote
/// price magnitude at registration time.
pub fn volume_decimals_from_price(price: f64) -> i8 {
    let mut decimals: i8 = 1;
    let mut p = price;
    while p > 0.1 {
        p /= 10.0;
        decimals += 1;
    }
    decimals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_decimals_scale_with_price() {
        assert_eq!(volume_decimals_from_price(0.05), 1);
        assert_eq!(volume_decimals_from_price(0.5), 2);
        assert_eq!(volume_decimals_from_price(42_000.0), 7);
    }
}
