//! Per `(asset, timeframe)` carry state persisted at day granularity.
//!
//! The opaque bytes belong to the indicator that produced them; the engine
//! only tracks the running extremes. On disk a record is
//! `min_time(8, BE) || max_time(8, BE) || opaque bytes`.

use crate::core::{EngineError, EngineResult, TimeUnit};

#[derive(Debug, Clone, PartialEq)]
pub struct PrevState {
    state: Vec<u8>,
    min: f64,
    min_time: TimeUnit,
    max: f64,
    max_time: TimeUnit,
}

impl Default for PrevState {
    fn default() -> Self {
        PrevState {
            state: Vec::new(),
            min: f64::MAX,
            min_time: TimeUnit::ZERO,
            max: f64::MIN,
            max_time: TimeUnit::ZERO,
        }
    }
}

impl PrevState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn min_time(&self) -> TimeUnit {
        self.min_time
    }

    pub fn max_time(&self) -> TimeUnit {
        self.max_time
    }

    pub fn state(&self) -> &[u8] {
        &self.state
    }

    pub fn check_update_min(&mut self, min: f64, min_time: TimeUnit) {
        if min < self.min {
            self.min = min;
            self.min_time = min_time;
        }
    }

    pub fn check_update_max(&mut self, max: f64, max_time: TimeUnit) {
        if max > self.max {
            self.max = max;
            self.max_time = max_time;
        }
    }

    pub fn update_state(&mut self, state: &[u8]) {
        self.state = state.to_vec();
    }

    pub fn is_empty(&self) -> bool {
        *self == PrevState::default()
    }

    /// On-disk form: both extreme timestamps followed by the opaque carry.
    pub fn compact(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.state.len());
        out.extend_from_slice(&self.min_time.to_be_bytes());
        out.extend_from_slice(&self.max_time.to_be_bytes());
        out.extend_from_slice(&self.state);
        out
    }

    /// Inverse of [`compact`]. The extreme values themselves are not stored;
    /// they are restored from the referenced ticks by the caller.
    pub fn from_compact(raw: &[u8], min: f64, max: f64) -> EngineResult<PrevState> {
        if raw.len() < 16 {
            return Err(EngineError::Malformed(format!(
                "prev-state record has {} bytes",
                raw.len()
            )));
        }
        let min_time = TimeUnit::from_be_bytes(raw[..8].try_into().expect("8 bytes"));
        let max_time = TimeUnit::from_be_bytes(raw[8..16].try_into().expect("8 bytes"));
        Ok(PrevState {
            state: raw[16..].to_vec(),
            min,
            min_time,
            max,
            max_time,
        })
    }

    pub fn times_from_compact(raw: &[u8]) -> EngineResult<(TimeUnit, TimeUnit)> {
        if raw.len() < 16 {
            return Err(EngineError::Malformed(format!(
                "prev-state record has {} bytes",
                raw.len()
            )));
        }
        Ok((
            TimeUnit::from_be_bytes(raw[..8].try_into().expect("8 bytes")),
            TimeUnit::from_be_bytes(raw[8..16].try_into().expect("8 bytes")),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_empty() {
        assert!(PrevState::new().is_empty());
    }

    #[test]
    fn extremes_only_tighten() {
        let mut ps = PrevState::new();
        ps.check_update_min(5.0, TimeUnit::new(1));
        ps.check_update_min(7.0, TimeUnit::new(2));
        ps.check_update_max(7.0, TimeUnit::new(2));
        ps.check_update_max(5.0, TimeUnit::new(3));
        assert_eq!(ps.min(), 5.0);
        assert_eq!(ps.min_time(), TimeUnit::new(1));
        assert_eq!(ps.max(), 7.0);
        assert_eq!(ps.max_time(), TimeUnit::new(2));
    }

    #[test]
    fn compact_round_trip() {
        let mut ps = PrevState::new();
        ps.check_update_min(1.0, TimeUnit::new(10));
        ps.check_update_max(2.0, TimeUnit::new(20));
        ps.update_state(b"carry");

        let raw = ps.compact();
        let restored = PrevState::from_compact(&raw, 1.0, 2.0).unwrap();
        assert_eq!(restored, ps);
        assert_eq!(
            PrevState::times_from_compact(&raw).unwrap(),
            (TimeUnit::new(10), TimeUnit::new(20))
        );
    }

    #[test]
    fn truncated_record_is_malformed() {
        assert!(PrevState::from_compact(&[0u8; 8], 0.0, 0.0).is_err());
    }
}
