//! Administrative rollback of one `(asset, timeframe)` stream to a date.

use std::sync::Arc;
use tracing::info;

use super::engine::runner_id;
use super::filters::standard_filter;
use super::runner::{kind, Runner, RunnerArgs};
use crate::core::{EngineResult, Timeframe};
use crate::sets::AssetState;

pub fn build_runner(
    asset: Arc<AssetState>,
    date: String,
    timeframe: Timeframe,
) -> EngineResult<Runner> {
    let closure = asset.parsed().dependency_closure()?;
    let id = runner_id(
        kind::STATE_ROLLBACK,
        &[asset.address().as_str(), &date, &timeframe.label()],
    );
    let args = RunnerArgs::new(kind::STATE_ROLLBACK, vec![asset.address().clone()])
        .with_timeframe(timeframe)
        .with_date(date.clone())
        .with_closure(closure);

    Ok(Runner::builder(id, args)
        .filter(standard_filter())
        .process(move |runner| {
            let asset = Arc::clone(&asset);
            let date = date.clone();
            Box::pin(async move {
                asset.rollback(&date, timeframe).await?;
                runner.add_step();
                info!(
                    asset = %asset.set_and_asset_id(),
                    timeframe = %timeframe.label(),
                    date = %date,
                    took = ?runner.timer(),
                    "rollback finished"
                );
                Ok(())
            })
        })
        .build())
}
