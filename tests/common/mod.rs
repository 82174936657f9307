#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use tick_indexer::config::EngineConfig;
use tick_indexer::core::{TimeUnit, Timeframe};
use tick_indexer::models::{AssetAddress, AssetSettings, PrevState, SetSettings, TickValue};
use tick_indexer::sets::{AssetState, Set, SetManager};
use tick_indexer::tasks::TaskEngine;

pub const SET_ID: &str = "teststream";
pub const MIN_DATE: &str = "2023-11-14";

pub struct TestRig {
    pub tmp: TempDir,
    pub config: Arc<EngineConfig>,
    pub manager: Arc<SetManager>,
    pub engine: Arc<TaskEngine>,
}

pub async fn rig() -> TestRig {
    let tmp = TempDir::new().unwrap();
    let config = Arc::new(EngineConfig::for_root(tmp.path()).unwrap());
    let manager = SetManager::load(Arc::clone(&config)).await.unwrap();
    let engine = TaskEngine::new(Arc::clone(&config), Arc::clone(&manager));
    TestRig {
        tmp,
        config,
        manager,
        engine,
    }
}

/// A plain (non-pair) set holding a price and a volume stream.
pub fn stream_settings() -> SetSettings {
    SetSettings {
        id: vec![SET_ID.to_string()],
        assets: vec![
            AssetSettings::new("price", MIN_DATE, -1),
            AssetSettings::new("volume", MIN_DATE, 2),
        ],
        settings: Vec::new(),
    }
}

/// Same set plus a two-dependency indicator over price and volume.
pub fn stream_settings_with_indicator() -> SetSettings {
    let mut settings = stream_settings();
    let mut vwap = AssetSettings::new("vwap", MIN_DATE, -1);
    vwap.dependencies = vec![
        AssetAddress::from_canonical(format!("{}.price", SET_ID)).unwrap(),
        AssetAddress::from_canonical(format!("{}.volume", SET_ID)).unwrap(),
    ];
    settings.assets.push(vwap);
    settings
}

pub async fn open_stream_set(rig: &TestRig) -> Arc<Set> {
    rig.manager
        .add(stream_settings(), true)
        .await
        .unwrap()
        .unwrap()
}

pub async fn open_indicator_set(rig: &TestRig) -> Arc<Set> {
    rig.manager
        .add(stream_settings_with_indicator(), true)
        .await
        .unwrap()
        .unwrap()
}

pub fn find_by_type(set: &Arc<Set>, asset_type: &str) -> Arc<AssetState> {
    set.assets()
        .into_iter()
        .find(|a| a.parsed().asset_type == asset_type)
        .unwrap_or_else(|| panic!("asset type '{}' not found", asset_type))
}

/// Store one tick per step starting at `start`, then advance the watermark
/// to `consistency`. The carry's opaque bytes are set to `marker`.
pub fn store_values(
    asset: &Arc<AssetState>,
    timeframe: Timeframe,
    start: TimeUnit,
    step: i64,
    values: &[f64],
    consistency: TimeUnit,
    marker: &[u8],
) {
    let mut data: BTreeMap<TimeUnit, Vec<u8>> = BTreeMap::new();
    let mut prev = asset
        .last_prev_state_cached(timeframe)
        .unwrap_or_else(|_| PrevState::new());
    prev.update_state(marker);
    for (i, v) in values.iter().enumerate() {
        let t = start + (i as i64) * step;
        let value = TickValue::from_value(asset.data_type(), *v);
        prev.check_update_min(value.min(), t);
        prev.check_update_max(value.max(), t);
        data.insert(t, value.to_raw(asset.decimals()));
    }
    asset.store(&data, timeframe, &prev, consistency).unwrap();
}

pub fn unit_of(value: TickValue) -> tick_indexer::models::Unit {
    match value {
        TickValue::Unit(u) => u,
        other => panic!("expected unit, got {:?}", other.data_type()),
    }
}

pub fn point_of(value: TickValue) -> tick_indexer::models::Point {
    match value {
        TickValue::Point(p) => p,
        other => panic!("expected point, got {:?}", other.data_type()),
    }
}

pub async fn wait_idle(engine: &Arc<TaskEngine>) {
    for _ in 0..400 {
        if engine.is_idle() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task engine did not go idle");
}

pub fn day(rig: &TestRig, date: &str) -> TimeUnit {
    rig.config.scale.parse_date(date).unwrap()
}

pub fn base(rig: &TestRig) -> Timeframe {
    rig.config.min_time_frame
}
