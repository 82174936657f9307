//! Per-asset cache of materialized timeframes.
//!
//! Each entry tracks when the timeframe was last read, its consistency
//! range and the cached carry state. The list itself (timeframe ->
//! last-read-at) is persisted under the asset's read-list key; consistency
//! and carry are re-hydrated from their own records on load.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::core::{EngineResult, TimeUnit, Timeframe};
use crate::models::PrevState;

#[derive(Debug, Clone)]
pub struct ReadEntry {
    pub timeframe: Timeframe,
    pub last_read_at: TimeUnit,
    pub prev_state: PrevState,
    /// `[data start, watermark]`.
    pub consistency: [TimeUnit; 2],
}

impl ReadEntry {
    pub fn new(timeframe: Timeframe, t0: TimeUnit, now: TimeUnit) -> ReadEntry {
        ReadEntry {
            timeframe,
            last_read_at: now,
            prev_state: PrevState::new(),
            consistency: [t0, t0],
        }
    }
}

/// Persisted projection of one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRead {
    pub last_read_at: i64,
}

pub fn encode_read_list(entries: &HashMap<Timeframe, ReadEntry>) -> EngineResult<Vec<u8>> {
    let persisted: BTreeMap<String, PersistedRead> = entries
        .values()
        .map(|e| {
            (
                e.timeframe.label(),
                PersistedRead {
                    last_read_at: e.last_read_at.int(),
                },
            )
        })
        .collect();
    Ok(bincode::serialize(&persisted)?)
}

pub fn decode_read_list(raw: &[u8]) -> EngineResult<BTreeMap<String, PersistedRead>> {
    Ok(bincode::deserialize(raw)?)
}

/// Write-behind cache guarded by a RW lock. `None` until first load.
pub struct ReadList {
    inner: RwLock<Option<HashMap<Timeframe, ReadEntry>>>,
}

impl Default for ReadList {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadList {
    pub fn new() -> ReadList {
        ReadList {
            inner: RwLock::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().expect("read list lock").is_some()
    }

    pub fn set_loaded(&self, entries: HashMap<Timeframe, ReadEntry>) {
        *self.inner.write().expect("read list lock") = Some(entries);
    }

    /// Insert if absent. Returns whether a new entry was created.
    pub fn cache_add(&self, timeframe: Timeframe, t0: TimeUnit, now: TimeUnit) -> bool {
        let mut guard = self.inner.write().expect("read list lock");
        let map = guard.get_or_insert_with(HashMap::new);
        if map.contains_key(&timeframe) {
            return false;
        }
        map.insert(timeframe, ReadEntry::new(timeframe, t0, now));
        true
    }

    pub fn cache_read_time_update(&self, timeframe: Timeframe, now: TimeUnit) -> bool {
        let mut guard = self.inner.write().expect("read list lock");
        match guard.as_mut().and_then(|m| m.get_mut(&timeframe)) {
            Some(entry) => {
                entry.last_read_at = now;
                true
            }
            None => false,
        }
    }

    pub fn cache_prev_state_update(&self, timeframe: Timeframe, prev_state: PrevState) -> bool {
        let mut guard = self.inner.write().expect("read list lock");
        match guard.as_mut().and_then(|m| m.get_mut(&timeframe)) {
            Some(entry) => {
                entry.prev_state = prev_state;
                true
            }
            None => false,
        }
    }

    pub fn cache_consistency_update(&self, timeframe: Timeframe, t_max: TimeUnit) -> bool {
        let mut guard = self.inner.write().expect("read list lock");
        match guard.as_mut().and_then(|m| m.get_mut(&timeframe)) {
            Some(entry) => {
                entry.consistency[1] = t_max;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, timeframe: Timeframe) {
        let mut guard = self.inner.write().expect("read list lock");
        if let Some(map) = guard.as_mut() {
            map.remove(&timeframe);
        }
    }

    pub fn timeframes(&self) -> Vec<Timeframe> {
        let guard = self.inner.read().expect("read list lock");
        let mut list: Vec<Timeframe> = guard
            .as_ref()
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        list.sort();
        list
    }

    pub fn consistency(&self, timeframe: Timeframe) -> Option<[TimeUnit; 2]> {
        let guard = self.inner.read().expect("read list lock");
        guard
            .as_ref()
            .and_then(|m| m.get(&timeframe))
            .map(|e| e.consistency)
    }

    pub fn prev_state(&self, timeframe: Timeframe) -> Option<PrevState> {
        let guard = self.inner.read().expect("read list lock");
        guard
            .as_ref()
            .and_then(|m| m.get(&timeframe))
            .map(|e| e.prev_state.clone())
    }

    pub fn encode(&self) -> EngineResult<Vec<u8>> {
        let guard = self.inner.read().expect("read list lock");
        match guard.as_ref() {
            Some(map) => encode_read_list(map),
            None => encode_read_list(&HashMap::new()),
        }
    }

    pub fn entries(&self) -> Vec<ReadEntry> {
        let guard = self.inner.read().expect("read list lock");
        let mut list: Vec<ReadEntry> = guard
            .as_ref()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by_key(|e| e.timeframe);
        list
    }
}
