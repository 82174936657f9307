//! Incremental re-aggregation of base-timeframe ticks into a higher
//! timeframe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::engine::runner_id;
use super::filters::standard_filter;
use super::runner::{kind, Runner, RunnerArgs, STAT_DATA_COUNT};
use crate::core::{initial_bucket_range, EngineResult, TimeUnit, Timeframe};
use crate::models::{AbsoluteSumMode, TickList};
use crate::sets::AssetState;

const MAX_BATCH_SIZE: usize = 30_000;
const MAX_READ_SIZE: usize = 1_000_000;
const PROGRESS_EVERY: std::time::Duration = std::time::Duration::from_secs(5);

pub fn build_runner(asset: Arc<AssetState>, timeframe: Timeframe) -> Runner {
    let id = runner_id(
        kind::TIMEFRAME_INDEXING,
        &[asset.address().as_str(), &timeframe.label()],
    );
    let args = RunnerArgs::new(kind::TIMEFRAME_INDEXING, vec![asset.address().clone()])
        .with_timeframe(timeframe);

    Runner::builder(id, args)
        .filter(standard_filter())
        .process(move |runner| {
            let asset = Arc::clone(&asset);
            Box::pin(async move { index_timeframe(runner, asset, timeframe).await })
        })
        .build()
}

async fn index_timeframe(
    runner: Arc<Runner>,
    asset: Arc<AssetState>,
    timeframe: Timeframe,
) -> EngineResult<()> {
    // Dependent assets are materialized by the indicator engine; points are
    // not aggregatable.
    if (!asset.is_unit() && !asset.is_quantity()) || asset.is_indicator() {
        return Ok(());
    }
    if asset.is_timeframe_index_up_to_date(timeframe)? {
        return Ok(());
    }

    let scale = asset.config().scale;
    let base = asset.base_timeframe();
    let label = timeframe.label();
    let max_time = asset.last_consistency_time_cached(base)?;

    asset.add_if_unfound_in_read_list(timeframe)?;
    let mut prev_state = asset.last_prev_state_cached(timeframe)?;

    let prev_t1 = asset.last_indexed_time(timeframe)?;
    let (mut t0, mut t1) = if prev_t1.is_zero() {
        initial_bucket_range(&scale, asset.data_t0(), timeframe)
    } else {
        (prev_t1, scale.add(prev_t1, timeframe))
    };

    runner.set_size_initial(t0.int());
    runner.set_size_max(max_time.int());

    let mut batch: BTreeMap<TimeUnit, Vec<u8>> = BTreeMap::new();
    let mut read_size = 0usize;
    let mut last_log = Instant::now();

    while t1 < max_time {
        let ticks: TickList = asset.get_in_range(base, t0, t1)?;
        read_size += ticks.len();
        if !ticks.is_empty() {
            let aggregated = ticks.aggregate(AbsoluteSumMode::DiffOfCloses)?;
            prev_state.check_update_min(aggregated.min(), t1);
            prev_state.check_update_max(aggregated.max(), t1);
            batch.insert(t1, aggregated.to_raw(asset.decimals()));
            runner.increment_stat(STAT_DATA_COUNT, 1);
        }

        if batch.len() >= MAX_BATCH_SIZE || read_size >= MAX_READ_SIZE {
            asset.store(&batch, timeframe, &prev_state, t1)?;
            batch.clear();
            read_size = 0;
        }

        t0 = t1;
        t1 = scale.add(t1, timeframe);
        runner.set_size_current(t0.int());

        if runner.must_interrupt() {
            break;
        }
        if last_log.elapsed() >= PROGRESS_EVERY {
            info!(
                asset = %asset.set_and_asset_id(),
                timeframe = %label,
                progress = format!("{:.2}%", runner.percent()),
                rows = runner.stat_value(STAT_DATA_COUNT),
                date = %scale.date_str(t0),
                eta = ?runner.eta(),
                "indexing rows"
            );
            last_log = Instant::now();
        }
    }

    if !batch.is_empty() {
        asset.store(&batch, timeframe, &prev_state, t0)?;
    }

    runner.add_step();
    info!(
        asset = %asset.set_and_asset_id(),
        timeframe = %label,
        rows = runner.stat_value(STAT_DATA_COUNT),
        took = ?runner.timer(),
        "stored aggregated rows"
    );
    Ok(())
}
