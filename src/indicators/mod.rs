//! Indicator builders.
//!
//! A dependent asset owns an opaque carry; the engine never interprets it.
//! The contract is narrow: compute a point from one sample per dependency
//! (mutating the carry), serialize the carry to bytes, restore it from
//! bytes. Builders form a closed, tagged set keyed by the asset type and
//! its argument list.

use serde::{Deserialize, Serialize};

use crate::core::{EngineError, EngineResult};
use crate::models::{ParsedAddress, Point, TickValue};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
struct EmaState {
    value: f64,
    primed: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
struct VwapState {
    weighted_sum: f64,
    weight_sum: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
struct ChangeState {
    last: f64,
    primed: bool,
}

#[derive(Debug)]
pub enum IndicatorBuilder {
    /// Exponential moving average of the single dependency's scalar.
    /// Argument: period.
    Ema { period: u32, state: EmaState },
    /// Running volume-weighted average price over `(price, weight)`
    /// dependencies.
    Vwap { state: VwapState },
    /// Difference between the dependency's current and previous scalar.
    Change { state: ChangeState },
    /// Stateless `dep0 / dep1`; a zero denominator yields zero.
    Ratio,
}

impl IndicatorBuilder {
    /// Instantiate the builder an address names, restoring carry bytes when
    /// a previous run left them.
    pub fn create(parsed: &ParsedAddress, prev_state: &[u8]) -> EngineResult<IndicatorBuilder> {
        let deps = parsed.dependencies.len();
        let expect_deps = |n: usize| -> EngineResult<()> {
            if deps != n {
                return Err(EngineError::Validation(format!(
                    "indicator '{}' needs {} dependencies, got {}",
                    parsed.asset_type, n, deps
                )));
            }
            Ok(())
        };

        match parsed.asset_type.as_str() {
            "ema" => {
                expect_deps(1)?;
                let period: u32 = parsed
                    .arguments
                    .first()
                    .and_then(|a| a.parse().ok())
                    .filter(|p| *p > 0)
                    .ok_or_else(|| {
                        EngineError::Validation(
                            "ema needs a positive integer period argument".to_string(),
                        )
                    })?;
                let state = restore(prev_state)?;
                Ok(IndicatorBuilder::Ema { period, state })
            }
            "vwap" => {
                expect_deps(2)?;
                let state = restore(prev_state)?;
                Ok(IndicatorBuilder::Vwap { state })
            }
            "change" => {
                expect_deps(1)?;
                let state = restore(prev_state)?;
                Ok(IndicatorBuilder::Change { state })
            }
            "ratio" => {
                expect_deps(2)?;
                Ok(IndicatorBuilder::Ratio)
            }
            other => Err(EngineError::Validation(format!(
                "unknown indicator type '{}'",
                other
            ))),
        }
    }

    pub fn expected_inputs(&self) -> usize {
        match self {
            IndicatorBuilder::Ema { .. } | IndicatorBuilder::Change { .. } => 1,
            IndicatorBuilder::Vwap { .. } | IndicatorBuilder::Ratio => 2,
        }
    }

    /// One aligned sample per dependency, in declaration order.
    pub fn compute(&mut self, inputs: &[TickValue]) -> EngineResult<Point> {
        if inputs.len() != self.expected_inputs() {
            return Err(EngineError::Validation(format!(
                "indicator expected {} inputs, got {}",
                self.expected_inputs(),
                inputs.len()
            )));
        }
        let value = match self {
            IndicatorBuilder::Ema { period, state } => {
                let x = inputs[0].scalar();
                let alpha = 2.0 / (*period as f64 + 1.0);
                if state.primed {
                    state.value = alpha * x + (1.0 - alpha) * state.value;
                } else {
                    state.value = x;
                    state.primed = true;
                }
                state.value
            }
            IndicatorBuilder::Vwap { state } => {
                let price = inputs[0].scalar();
                let weight = inputs[1].scalar().abs();
                state.weighted_sum += price * weight;
                state.weight_sum += weight;
                if state.weight_sum == 0.0 {
                    0.0
                } else {
                    state.weighted_sum / state.weight_sum
                }
            }
            IndicatorBuilder::Change { state } => {
                let x = inputs[0].scalar();
                let out = if state.primed { x - state.last } else { 0.0 };
                state.last = x;
                state.primed = true;
                out
            }
            IndicatorBuilder::Ratio => {
                let denom = inputs[1].scalar();
                if denom == 0.0 {
                    0.0
                } else {
                    inputs[0].scalar() / denom
                }
            }
        };
        Ok(Point::new(value))
    }

    pub fn serialize_state(&self) -> EngineResult<Vec<u8>> {
        Ok(match self {
            IndicatorBuilder::Ema { state, .. } => bincode::serialize(state)?,
            IndicatorBuilder::Vwap { state } => bincode::serialize(state)?,
            IndicatorBuilder::Change { state } => bincode::serialize(state)?,
            IndicatorBuilder::Ratio => Vec::new(),
        })
    }
}

fn restore<T: Default + for<'de> Deserialize<'de>>(prev: &[u8]) -> EngineResult<T> {
    if prev.is_empty() {
        return Ok(T::default());
    }
    Ok(bincode::deserialize(prev)?)
}
