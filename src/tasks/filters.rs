//! Conflict predicates between runners.
//!
//! Two runners conflict when any of:
//! - they share a target asset address and run on the same timeframe;
//! - one's targets intersect the other's dependency closure (indicator and
//!   rollback work carry their closure);
//! - they share a target address for the same calendar date.

use super::runner::{EngineDetails, FilterFn, Runner, RunnerArgs};
use crate::models::AssetAddress;

fn overlap(a: &[AssetAddress], b: &[AssetAddress]) -> bool {
    a.iter().any(|x| b.contains(x))
}

pub fn conflicts(a: &RunnerArgs, b: &RunnerArgs) -> bool {
    let share_target = overlap(&a.addresses, &b.addresses);

    if share_target && a.timeframe.is_some() && a.timeframe == b.timeframe {
        return true;
    }
    if overlap(&a.closure, &b.addresses) || overlap(&b.closure, &a.addresses) {
        return true;
    }
    if share_target && a.date.is_some() && a.date == b.date {
        return true;
    }
    false
}

/// The standard running filter: dispatch iff no running runner conflicts.
pub fn standard_filter() -> FilterFn {
    Box::new(|details: &EngineDetails, runner: &Runner| {
        !details
            .running
            .iter()
            .any(|r| conflicts(&r.args, &runner.args))
    })
}
