//! One tick stream within a set: storage, reads, consistency bookkeeping
//! and rollback.

use rocksdb::Direction;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::error;

use super::read_list::{decode_read_list, ReadEntry, ReadList};
use crate::config::EngineConfig;
use crate::core::{EngineError, EngineResult, TimeUnit, Timeframe};
use crate::database::{keys, KeyDestructor, SetDb};
use crate::models::{
    AssetAddress, AssetSettings, DataType, ParsedAddress, PrevState, TickList, TickValue,
};

/// Query shape for limit reads.
#[derive(Debug, Clone, Copy)]
pub struct DataLimitQuery {
    pub timeframe: Timeframe,
    pub limit: usize,
    pub offset: TimeUnit,
    /// Iterate backwards from `offset` when set.
    pub start_by_end: bool,
}

pub struct AssetState {
    key: keys::AssetKey,
    address: AssetAddress,
    parsed: ParsedAddress,
    set_id: String,
    data_type: DataType,
    decimals: i8,
    min_data_date: String,
    start: TimeUnit,
    db: Arc<SetDb>,
    config: Arc<EngineConfig>,
    read_list: ReadList,
    resolved_deps: RwLock<Option<Vec<Arc<AssetState>>>>,
}

impl AssetState {
    pub(crate) fn new(
        key: keys::AssetKey,
        settings: &AssetSettings,
        set_id: &str,
        db: Arc<SetDb>,
        config: Arc<EngineConfig>,
    ) -> EngineResult<Arc<AssetState>> {
        let address = settings.address(set_id);
        let parsed = address.parse()?;
        let start = config.scale.parse_date(&settings.min_data_date)?;
        Ok(Arc::new(AssetState {
            key,
            address,
            parsed,
            set_id: set_id.to_string(),
            data_type: settings.data_type()?,
            decimals: settings.decimals,
            min_data_date: settings.min_data_date.clone(),
            start,
            db,
            config,
            read_list: ReadList::new(),
            resolved_deps: RwLock::new(None),
        }))
    }

    pub fn key(&self) -> keys::AssetKey {
        self.key
    }

    pub fn address(&self) -> &AssetAddress {
        &self.address
    }

    pub fn parsed(&self) -> &ParsedAddress {
        &self.parsed
    }

    pub fn set_id(&self) -> &str {
        &self.set_id
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn decimals(&self) -> i8 {
        self.decimals
    }

    pub fn min_data_date(&self) -> &str {
        &self.min_data_date
    }

    /// Earliest timestamp data may exist at (midnight of `min_data_date`).
    pub fn data_t0(&self) -> TimeUnit {
        self.start
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn db(&self) -> &Arc<SetDb> {
        &self.db
    }

    pub fn is_unit(&self) -> bool {
        self.data_type == DataType::Unit
    }

    pub fn is_quantity(&self) -> bool {
        self.data_type == DataType::Quantity
    }

    pub fn is_point(&self) -> bool {
        self.data_type == DataType::Point
    }

    pub fn is_indicator(&self) -> bool {
        self.parsed.has_dependencies()
    }

    /// `setid:assettype-args`, the stable human identifier used in logs and
    /// export prefixes.
    pub fn set_and_asset_id(&self) -> String {
        format!("{}:{}", self.set_id, self.parsed.column_prefix(false))
    }

    pub fn base_timeframe(&self) -> Timeframe {
        self.config.min_time_frame
    }

    // ---------------------------------------------------------------------
    // Dependency references
    // ---------------------------------------------------------------------

    pub fn cache_dependencies(&self, deps: Vec<Arc<AssetState>>) {
        *self.resolved_deps.write().expect("deps lock") = Some(deps);
    }

    pub fn dependencies(&self) -> Option<Vec<Arc<AssetState>>> {
        self.resolved_deps.read().expect("deps lock").clone()
    }

    // ---------------------------------------------------------------------
    // Read list
    // ---------------------------------------------------------------------

    /// Lazy-load the read list: seed the base timeframe on first contact,
    /// otherwise re-hydrate each persisted entry's watermark and carry.
    pub fn ensure_read_list(&self) -> EngineResult<()> {
        if self.read_list.is_loaded() {
            return Ok(());
        }

        let raw = self.db.get(&keys::read_list_key(self.key))?;
        let now = self.config.scale.now();

        let Some(raw) = raw else {
            let base = self.base_timeframe();
            let mut entries = HashMap::new();
            entries.insert(base, ReadEntry::new(base, self.start, now));
            self.read_list.set_loaded(entries);
            return self.persist_read_list();
        };

        let persisted = decode_read_list(&raw)?;
        let mut entries = HashMap::new();
        for (label, read) in persisted {
            let timeframe = Timeframe::parse_label(&label)?;
            let mut entry = ReadEntry::new(timeframe, self.start, now);
            entry.last_read_at = TimeUnit::new(read.last_read_at);
            let t_max = self.pull_consistency_time(timeframe)?;
            if t_max > self.start {
                entry.consistency[1] = t_max;
            }
            entry.prev_state = self.pull_last_prev_state(timeframe)?;
            entries.insert(timeframe, entry);
        }
        self.read_list.set_loaded(entries);
        Ok(())
    }

    fn persist_read_list(&self) -> EngineResult<()> {
        let raw = self.read_list.encode()?;
        self.db.put(&keys::read_list_key(self.key), &raw)
    }

    pub fn add_if_unfound_in_read_list(&self, timeframe: Timeframe) -> EngineResult<()> {
        self.ensure_read_list()?;
        if self
            .read_list
            .cache_add(timeframe, self.start, self.config.scale.now())
        {
            self.persist_read_list()?;
        }
        Ok(())
    }

    pub fn remove_in_read_list(&self, timeframe: Timeframe) -> EngineResult<()> {
        self.ensure_read_list()?;
        self.read_list.remove(timeframe);
        self.persist_read_list()
    }

    fn on_new_read(&self, timeframe: Timeframe) -> EngineResult<()> {
        self.ensure_read_list()?;
        if self
            .read_list
            .cache_read_time_update(timeframe, self.config.scale.now())
        {
            self.persist_read_list()?;
        }
        Ok(())
    }

    pub fn active_timeframes(&self) -> EngineResult<Vec<Timeframe>> {
        self.ensure_read_list()?;
        Ok(self.read_list.timeframes())
    }

    pub fn read_entries(&self) -> EngineResult<Vec<ReadEntry>> {
        self.ensure_read_list()?;
        Ok(self.read_list.entries())
    }

    // ---------------------------------------------------------------------
    // Consistency
    // ---------------------------------------------------------------------

    fn pull_consistency_time(&self, timeframe: Timeframe) -> EngineResult<TimeUnit> {
        let key = keys::consistency_key(self.key, &timeframe.label());
        match self.db.get(&key)? {
            Some(raw) => TimeUnit::from_decimal_bytes(&raw),
            None => Ok(TimeUnit::ZERO),
        }
    }

    pub fn last_consistency_time(&self, timeframe: Timeframe) -> EngineResult<TimeUnit> {
        self.pull_consistency_time(timeframe)
    }

    pub fn last_consistency_time_cached(&self, timeframe: Timeframe) -> EngineResult<TimeUnit> {
        self.ensure_read_list()?;
        match self.read_list.consistency(timeframe) {
            Some(range) => Ok(range[1]),
            None => self.pull_consistency_time(timeframe),
        }
    }

    fn set_consistency_time(
        &self,
        timeframe: Timeframe,
        new_time: TimeUnit,
    ) -> EngineResult<()> {
        let key = keys::consistency_key(self.key, &timeframe.label());
        self.db.put(&key, new_time.to_decimal_string().as_bytes())?;
        self.read_list.cache_consistency_update(timeframe, new_time);
        Ok(())
    }

    /// Whether the base watermark is fresh enough for downstream work.
    pub fn is_consistent(&self, timeframe: Timeframe) -> EngineResult<bool> {
        let t = self.last_consistency_time(timeframe)?;
        let scale = &self.config.scale;
        let lookback = (self.config.max_days_backward_for_consistency - 1).max(0);
        let min_end_allowed = scale.day_start(scale.now()) - lookback * scale.day_units();
        Ok(t > min_end_allowed)
    }

    /// The next calendar day whose archive should be parsed, or `None` when
    /// the stream is fresh enough.
    pub fn should_sync(&self) -> EngineResult<Option<String>> {
        let t = self.last_consistency_time(self.base_timeframe())?;
        if t.is_zero() {
            return Ok(Some(self.min_data_date.clone()));
        }
        let scale = &self.config.scale;
        let lookback = (self.config.max_days_backward_for_consistency - 1).max(0);
        let max = scale.now() - lookback * scale.day_units();
        if t < max {
            return Ok(Some(scale.date_str(t)));
        }
        Ok(None)
    }

    // ---------------------------------------------------------------------
    // Prev state
    // ---------------------------------------------------------------------

    /// Scan backwards day-by-day from the watermark down to the data start
    /// for the most recent carry record.
    fn search_last_prev_state(&self, timeframe: Timeframe) -> EngineResult<Option<Vec<u8>>> {
        let t_max = self.pull_consistency_time(timeframe)?;
        let label = timeframe.label();
        let scale = &self.config.scale;
        let limit = self.min_data_date.clone();

        let mut cursor = if t_max.is_zero() { self.start } else { t_max };
        loop {
            let date = scale.date_str(cursor);
            let key = keys::prev_state_key(self.key, &label, &date);
            if let Some(raw) = self.db.get(&key)? {
                return Ok(Some(raw));
            }
            if date == limit {
                break;
            }
            cursor = cursor - scale.day_units();
        }
        Ok(None)
    }

    /// Most recent persisted carry with its extremes restored from the
    /// referenced ticks, or a fresh carry when none exists.
    pub fn pull_last_prev_state(&self, timeframe: Timeframe) -> EngineResult<PrevState> {
        let Some(raw) = self.search_last_prev_state(timeframe)? else {
            return Ok(PrevState::new());
        };
        let (min_time, max_time) = PrevState::times_from_compact(&raw)?;
        if min_time.is_zero() && max_time.is_zero() {
            return PrevState::from_compact(&raw, f64::MAX, f64::MIN);
        }
        let label = timeframe.label();
        let min = match self.db.get(&keys::data_key(self.key, &label, min_time))? {
            Some(v) => TickValue::parse_raw(self.data_type, &v)?.min(),
            None => f64::MAX,
        };
        let max = match self.db.get(&keys::data_key(self.key, &label, max_time))? {
            Some(v) => TickValue::parse_raw(self.data_type, &v)?.max(),
            None => f64::MIN,
        };
        PrevState::from_compact(&raw, min, max)
    }

    pub fn last_prev_state_cached(&self, timeframe: Timeframe) -> EngineResult<PrevState> {
        self.ensure_read_list()?;
        match self.read_list.prev_state(timeframe) {
            Some(ps) => Ok(ps),
            None => self.pull_last_prev_state(timeframe),
        }
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Persist a tick batch, then the carry record for the watermark's day,
    /// then the watermark itself. The carry lands before the watermark so a
    /// crash between writes leaves redundant data, never data missing its
    /// carry. Data writes commit in chunks of 10,000 keys.
    pub fn store(
        &self,
        data: &BTreeMap<TimeUnit, Vec<u8>>,
        timeframe: Timeframe,
        new_prev_state: &PrevState,
        new_consistency_time: TimeUnit,
    ) -> EngineResult<()> {
        if new_consistency_time <= TimeUnit::ZERO {
            return Err(EngineError::Validation(
                "consistency time must be positive".to_string(),
            ));
        }
        let label = timeframe.label();

        if !data.is_empty() {
            self.db.write_chunked(
                data.iter()
                    .map(|(t, raw)| (keys::data_key(self.key, &label, *t), raw.clone())),
            )?;
        }

        if !new_prev_state.is_empty() {
            // The record is dated by the last instant the watermark covers:
            // a whole-day watermark sits exactly on the next midnight, and
            // its carry belongs to the day that produced it.
            let date = self.config.scale.date_str(new_consistency_time - 1);
            let key = keys::prev_state_key(self.key, &label, &date);
            self.db.put(&key, &new_prev_state.compact())?;
            self.read_list
                .cache_prev_state_update(timeframe, new_prev_state.clone());
        }

        self.set_consistency_time(timeframe, new_consistency_time)
    }

    /// Persist a carry record alone, dated by `state_time`.
    pub fn store_prev_state(
        &self,
        new_prev_state: &PrevState,
        timeframe: Timeframe,
        state_time: TimeUnit,
    ) -> EngineResult<()> {
        if new_prev_state.is_empty() {
            return Ok(());
        }
        let label = timeframe.label();
        let date = self.config.scale.date_str(state_time);
        self.db.put(
            &keys::prev_state_key(self.key, &label, &date),
            &new_prev_state.compact(),
        )?;
        self.read_list
            .cache_prev_state_update(timeframe, new_prev_state.clone());
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Decode all ticks in `[t0, t1)` for the timeframe.
    pub fn get_in_range(
        &self,
        timeframe: Timeframe,
        t0: TimeUnit,
        t1: TimeUnit,
    ) -> EngineResult<TickList> {
        if t1 < t0 {
            return Err(EngineError::Validation(
                "t1 must not be before t0".to_string(),
            ));
        }
        let label = timeframe.label();
        let start = keys::data_key(self.key, &label, t0);
        let end = keys::data_key(self.key, &label, t1);

        let mut list = TickList::new(self.data_type);
        for item in self.db.iter_range(&start, &end) {
            let (key, value) = item?;
            let (key_label, time) = match keys::parse_data_key(&key) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };
            if key_label != label {
                continue;
            }
            list.push(time, TickValue::parse_raw(self.data_type, &value)?)?;
        }
        Ok(list)
    }

    /// Bounded read walking forward from `offset`, or backward when
    /// `start_by_end` is set. Reverse iteration skips the seed key when it
    /// matches the offset exactly; results always come back ascending.
    pub fn get_data_limit(
        self: &Arc<Self>,
        query: DataLimitQuery,
        set_a_read: bool,
    ) -> EngineResult<TickList> {
        let mut list = TickList::new(self.data_type);
        if query.limit > 1 && !self.is_timeframe_supported(query.timeframe)? {
            return Ok(list);
        }

        let label = query.timeframe.label();
        let seed = keys::data_key(self.key, &label, query.offset);
        let direction = if query.start_by_end {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        let readahead = if query.limit > 0 && query.limit < 100 {
            Some(4 * 1024)
        } else {
            None
        };

        let mut collected: Vec<(TimeUnit, TickValue)> = Vec::new();
        for item in self.db.iter_from(&seed, direction, readahead) {
            let (key, value) = item?;
            if query.start_by_end && key.as_ref() == seed.as_slice() {
                continue;
            }
            let Ok((key_label, time)) = keys::parse_data_key(&key) else {
                break;
            };
            if key_label != label || key[..2] != self.key {
                break;
            }
            collected.push((time, TickValue::parse_raw(self.data_type, &value)?));
            if collected.len() == query.limit {
                break;
            }
        }

        if query.start_by_end {
            collected.reverse();
        }
        for (time, value) in collected {
            list.push(time, value)?;
        }

        if set_a_read {
            let asset = Arc::clone(self);
            let timeframe = query.timeframe;
            tokio::spawn(async move {
                if let Err(e) = asset.on_new_read(timeframe) {
                    error!(
                        asset = %asset.set_and_asset_id(),
                        error = %e,
                        "failed to record read time"
                    );
                }
            });
        }

        Ok(list)
    }

    pub fn earliest_tick(
        self: &Arc<Self>,
        timeframe: Timeframe,
    ) -> EngineResult<Option<(TimeUnit, TickValue)>> {
        let list = self.get_data_limit(
            DataLimitQuery {
                timeframe,
                limit: 1,
                offset: TimeUnit::ZERO,
                start_by_end: false,
            },
            false,
        )?;
        Ok(list.time_at(0).zip(list.value_at(0)))
    }

    pub fn latest_tick(
        self: &Arc<Self>,
        timeframe: Timeframe,
    ) -> EngineResult<Option<(TimeUnit, TickValue)>> {
        let list = self.get_data_limit(
            DataLimitQuery {
                timeframe,
                limit: 1,
                offset: self.config.scale.now(),
                start_by_end: true,
            },
            false,
        )?;
        Ok(list.time_at(0).zip(list.value_at(0)))
    }

    // ---------------------------------------------------------------------
    // Timeframe bookkeeping
    // ---------------------------------------------------------------------

    pub fn is_timeframe_supported(&self, timeframe: Timeframe) -> EngineResult<bool> {
        if timeframe == self.base_timeframe() {
            return Ok(true);
        }
        Ok(self.active_timeframes()?.contains(&timeframe))
    }

    /// Timestamp of the newest indexed tick at this timeframe; zero when the
    /// timeframe holds no data yet.
    pub fn last_indexed_time(self: &Arc<Self>, timeframe: Timeframe) -> EngineResult<TimeUnit> {
        Ok(self
            .latest_tick(timeframe)?
            .map(|(t, _)| t)
            .unwrap_or(TimeUnit::ZERO))
    }

    /// The target is synced when its newest bucket is within one step of the
    /// base watermark.
    pub fn is_timeframe_index_up_to_date(
        self: &Arc<Self>,
        timeframe: Timeframe,
    ) -> EngineResult<bool> {
        let indexed = self.last_indexed_time(timeframe)?;
        if indexed.is_zero() {
            return Ok(false);
        }
        let base_watermark = self.last_consistency_time_cached(self.base_timeframe())?;
        Ok(self.config.scale.add(indexed, timeframe) >= base_watermark)
    }

    /// Higher timeframes whose index lags the base watermark. Empty while
    /// the base stream itself is stale.
    pub fn timeframes_to_reindex(self: &Arc<Self>) -> EngineResult<Vec<Timeframe>> {
        if !self.is_consistent(self.base_timeframe())? {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for tf in self.active_timeframes()? {
            if tf == self.base_timeframe() {
                continue;
            }
            if !self.is_timeframe_index_up_to_date(tf)? {
                out.push(tf);
            }
        }
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Rollback
    // ---------------------------------------------------------------------

    /// Delete every tick with `timestamp >= t0` where `t0` derives from
    /// `to_date`, newest first, then reconcile the watermark, carry and
    /// read-list entry. Reverse order guarantees a crash mid-rollback never
    /// leaves a hole below persisted data.
    pub async fn rollback(
        self: &Arc<Self>,
        to_date: &str,
        timeframe: Timeframe,
    ) -> EngineResult<()> {
        let scale = self.config.scale;
        let label = timeframe.label();
        self.ensure_read_list()?;

        let to_time = scale.parse_date(to_date)?;
        let is_base = timeframe == self.base_timeframe();
        // A non-base timeframe always rolls back as a full wipe of its
        // records; partial rollback is only meaningful on the base stream.
        let full_wipe = to_time <= self.start || !is_base;

        let t0 = if full_wipe {
            self.start
        } else if timeframe.millis() > Timeframe::DAY.millis() {
            // Snap to the previous whole-timeframe boundary at or below the
            // requested date, anchored on the current watermark.
            let watermark = self.last_consistency_time(timeframe)?;
            let steps = scale.steps(timeframe);
            if watermark > to_time {
                let diff = watermark.int() - to_time.int();
                let k = (diff + steps - 1) / steps;
                TimeUnit::new(watermark.int() - k * steps)
            } else {
                to_time
            }
        } else {
            to_time
        };

        // Reverse sweep from "now" down to t0, feeding the destructor.
        let destructor = KeyDestructor::spawn(Arc::clone(&self.db));
        let seed = keys::data_key(self.key, &label, scale.now());
        let floor = keys::data_key(self.key, &label, t0);
        let mut latest_seen: Option<TimeUnit> = None;

        {
            let iter = self.db.iter_from(&seed, Direction::Reverse, None);
            for item in iter {
                let (key, _) = item?;
                if key.as_ref() < floor.as_slice() {
                    break;
                }
                let Ok((key_label, time)) = keys::parse_data_key(&key) else {
                    break;
                };
                if key_label != label || key[..2] != self.key {
                    break;
                }
                if latest_seen.is_none() {
                    latest_seen = Some(time);
                }
                destructor.delete(key.into_vec()).await;
            }
        }
        let deleted = destructor.discard().await?;
        tracing::info!(
            asset = %self.set_and_asset_id(),
            timeframe = %label,
            to_date,
            deleted,
            "rollback swept data keys"
        );

        // Drop carry records for every day the sweep covered, plus the day
        // after the newest tick so the straddling boundary record goes too.
        let upper = match latest_seen {
            Some(t) => t,
            None => {
                let watermark = self.last_consistency_time(timeframe)?;
                if watermark.is_zero() {
                    t0
                } else {
                    watermark
                }
            }
        };
        let mut cursor = scale.day_start(t0);
        let end = scale.next_day(upper);
        while cursor <= end {
            let date = scale.date_str(cursor);
            self.db
                .delete(&keys::prev_state_key(self.key, &label, &date))?;
            cursor = cursor + scale.day_units();
        }

        if full_wipe {
            self.db
                .delete(&keys::consistency_key(self.key, &label))?;
            self.read_list
                .cache_prev_state_update(timeframe, PrevState::new());
            if !is_base {
                self.remove_in_read_list(timeframe)?;
            } else {
                self.read_list
                    .cache_consistency_update(timeframe, self.start);
            }
        } else {
            self.set_consistency_time(timeframe, t0 - 1)?;
            let latest = self.pull_last_prev_state(timeframe)?;
            self.read_list.cache_prev_state_update(timeframe, latest);
        }

        Ok(())
    }
}

impl std::fmt::Debug for AssetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetState")
            .field("address", &self.address)
            .field("key", &self.key)
            .field("data_type", &self.data_type)
            .finish()
    }
}

/// Group helpers over several streams.
pub fn least_consistent(
    assets: &[Arc<AssetState>],
    timeframe: Timeframe,
) -> EngineResult<Option<Arc<AssetState>>> {
    let mut least: Option<(TimeUnit, Arc<AssetState>)> = None;
    for asset in assets {
        let t = asset.last_consistency_time(timeframe)?;
        match &least {
            Some((best, _)) if t >= *best => {}
            _ => least = Some((t, Arc::clone(asset))),
        }
    }
    Ok(least.map(|(_, a)| a))
}
