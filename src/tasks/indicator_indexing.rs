//! Indicator materialization: a lazy k-way merge over the dependency
//! streams feeding the indicator builder, with carry persisted at day
//! boundaries.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::engine::runner_id;
use super::filters::standard_filter;
use super::runner::{kind, Runner, RunnerArgs, STAT_DATA_COUNT};
use crate::core::{initial_bucket_range, EngineResult, TimeUnit, Timeframe};
use crate::indicators::IndicatorBuilder;
use crate::models::{TickList, TickValue};
use crate::sets::{AssetState, DataLimitQuery};

const MAX_BATCH_BUCKETS: i64 = 30_000;

pub fn build_runner(
    asset: Arc<AssetState>,
    deps: Vec<Arc<AssetState>>,
    timeframe: Timeframe,
) -> EngineResult<Runner> {
    let closure = asset.parsed().dependency_closure()?;
    let id = runner_id(
        kind::INDICATOR_INDEXING,
        &[asset.address().as_str(), &timeframe.label()],
    );
    let args = RunnerArgs::new(kind::INDICATOR_INDEXING, vec![asset.address().clone()])
        .with_timeframe(timeframe)
        .with_closure(closure);

    Ok(Runner::builder(id, args)
        .filter(standard_filter())
        .process(move |runner| {
            let asset = Arc::clone(&asset);
            let deps = deps.clone();
            Box::pin(async move { index_indicator(runner, asset, deps, timeframe).await })
        })
        .build())
}

async fn index_indicator(
    runner: Arc<Runner>,
    asset: Arc<AssetState>,
    deps: Vec<Arc<AssetState>>,
    timeframe: Timeframe,
) -> EngineResult<()> {
    if !asset.is_point() || !asset.is_indicator() || deps.is_empty() {
        return Ok(());
    }

    let scale = asset.config().scale;
    let label = timeframe.label();

    // The merge can only advance to where every dependency is consistent.
    let mut min_dep_consistency = TimeUnit::MAX;
    for dep in &deps {
        let t = dep.last_consistency_time_cached(timeframe)?;
        if t < min_dep_consistency {
            min_dep_consistency = t;
        }
    }
    if min_dep_consistency > scale.now() {
        return Ok(());
    }

    asset.add_if_unfound_in_read_list(timeframe)?;
    let consistent = asset.last_consistency_time_cached(timeframe)?;
    if min_dep_consistency <= consistent {
        return Ok(());
    }

    let mut prev_state = asset.last_prev_state_cached(timeframe)?;
    let mut builder = IndicatorBuilder::create(asset.parsed(), prev_state.state())?;

    let steps = scale.steps(timeframe);
    let mut prev_samples: Vec<Option<(TimeUnit, TickValue)>> = vec![None; deps.len()];

    let prev_t1 = asset.last_indexed_time(timeframe)?;
    let (mut t0, mut t1) = if prev_t1.is_zero() {
        initial_bucket_range(&scale, asset.data_t0(), timeframe)
    } else {
        // Resume: seed each dependency's last-known sample at the exact
        // boundary so the merge can replay it.
        let t0 = prev_t1;
        for (i, dep) in deps.iter().enumerate() {
            let list = dep.get_data_limit(
                DataLimitQuery {
                    timeframe,
                    limit: 1,
                    offset: scale.add(t0, timeframe),
                    start_by_end: true,
                },
                false,
            )?;
            prev_samples[i] = list.last_value();
        }
        (t0, scale.add(t0, timeframe))
    };

    runner.set_size_initial(t0.int());
    runner.set_size_max(min_dep_consistency.int());

    while t1 <= min_dep_consistency {
        let remaining_buckets = (min_dep_consistency.int() - t0.int()) / steps;
        let max_buckets = remaining_buckets.min(MAX_BATCH_BUCKETS);
        t1 = TimeUnit::new(t0.int() + steps * max_buckets);

        let mut current: Vec<TickList> = Vec::with_capacity(deps.len());
        for dep in &deps {
            current.push(dep.get_in_range(timeframe, t0, t1 + 1)?);
        }
        let mut cursors = vec![0usize; deps.len()];
        let mut batch: BTreeMap<TimeUnit, Vec<u8>> = BTreeMap::new();

        loop {
            // Lowest unconsumed timestamp across dependencies.
            let mut min_ts: Option<TimeUnit> = None;
            for (i, list) in current.iter().enumerate() {
                if let Some(ts) = list.time_at(cursors[i]) {
                    if min_ts.map_or(true, |m| ts < m) {
                        min_ts = Some(ts);
                    }
                }
            }
            let Some(ts) = min_ts else { break };

            // Assemble the input tuple: the head where it matches `ts`, the
            // last-known sample elsewhere. Heads at `ts` are consumed either
            // way, so a tuple with a missing last-known skips `ts` without
            // stalling the merge.
            let mut inputs: Vec<TickValue> = Vec::with_capacity(deps.len());
            let mut complete = true;
            for i in 0..deps.len() {
                match current[i].time_at(cursors[i]) {
                    Some(head_ts) if head_ts == ts => {
                        let value = current[i].value_at(cursors[i]).expect("head exists");
                        prev_samples[i] = Some((head_ts, value));
                        cursors[i] += 1;
                        inputs.push(value);
                    }
                    _ => match prev_samples[i] {
                        Some((_, value)) => inputs.push(value),
                        None => complete = false,
                    },
                }
            }
            if !complete {
                continue;
            }

            let point = builder.compute(&inputs)?;
            prev_state.check_update_min(point.value, ts);
            prev_state.check_update_max(point.value, ts);
            batch.insert(ts, point.to_raw(asset.decimals()));
            runner.increment_stat(STAT_DATA_COUNT, 1);

            // Persist batch and captured carry at each calendar-day
            // boundary so a rollback to any date restores exact state.
            if scale.day_start(ts) != scale.day_start(ts + steps) {
                prev_state.update_state(&builder.serialize_state()?);
                asset.store(&batch, timeframe, &prev_state, ts)?;
                batch.clear();
            }
        }

        prev_state.update_state(&builder.serialize_state()?);
        asset.store(&batch, timeframe, &prev_state, t1)?;

        if runner.must_interrupt() {
            break;
        }
        t0 = t1;
        t1 = scale.add(t1, timeframe);
        runner.set_size_current(t0.int());
    }

    runner.add_step();
    info!(
        asset = %asset.set_and_asset_id(),
        timeframe = %label,
        rows = runner.stat_value(STAT_DATA_COUNT),
        took = ?runner.timer(),
        "indicator stream advanced"
    );
    Ok(())
}
