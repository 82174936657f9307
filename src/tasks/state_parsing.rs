//! Raw-archive ingestion: unzip a day's archive, decode its CSV rows, fold
//! them into base-timeframe buckets and persist the day.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::engine::runner_id;
use super::filters::standard_filter;
use super::runner::{kind, Runner, RunnerArgs, STAT_ARCHIVE_SIZE, STAT_DATA_COUNT};
use crate::core::{EngineError, EngineResult, TimeUnit};
use crate::models::{AbsoluteSumMode, DataType, TickList, TickValue};
use crate::sets::AssetState;

pub fn build_runner<F>(asset: Arc<AssetState>, date: String, on_done: F) -> Runner
where
    F: Fn(&Arc<Runner>) + Send + Sync + 'static,
{
    let id = runner_id(kind::STATE_PARSING, &[asset.address().as_str(), &date]);
    let args = RunnerArgs::new(kind::STATE_PARSING, vec![asset.address().clone()])
        .with_timeframe(asset.base_timeframe())
        .with_date(date.clone());

    Runner::builder(id, args)
        .filter(standard_filter())
        .process(move |runner| {
            let asset = Arc::clone(&asset);
            let date = date.clone();
            Box::pin(async move { parse_day(runner, asset, date).await })
        })
        .callback(on_done)
        .build()
}

async fn parse_day(runner: Arc<Runner>, asset: Arc<AssetState>, date: String) -> EngineResult<()> {
    if asset.is_indicator() {
        return Ok(());
    }
    let config = Arc::clone(asset.config());
    let scale = config.scale;
    let date_start = scale.parse_date(&date)?;
    let asset_type = asset.parsed().asset_type.clone();

    let zip_path = config.archive_file_path(asset.set_id(), &asset_type, &date, "zip");
    let csv_path = config.archive_file_path(asset.set_id(), &asset_type, &date, "csv");
    let folder = config.archive_folder_path(asset.set_id(), &asset_type);

    let archive_size = std::fs::metadata(&zip_path)?.len() as i64;
    runner.set_stat(STAT_ARCHIVE_SIZE, archive_size);
    info!(
        asset = %asset.set_and_asset_id(),
        date = %date,
        size = archive_size,
        "unzipping archive"
    );

    if let Err(e) = unzip_archive(&zip_path, &folder) {
        // A corrupt download has to be fetched again.
        let _ = std::fs::remove_file(&zip_path);
        return Err(e);
    }
    runner.add_step();

    let rows = read_archive_rows(&csv_path)?;
    if rows.is_empty() {
        warn!(asset = %asset.set_and_asset_id(), date = %date, "no data found in archive CSV");
    }
    runner.set_size_max(rows.len() as i64);
    runner.add_step();

    let div = scale.steps(asset.base_timeframe());
    let list = fold_rows_to_base(&rows, asset.data_type(), div)?;
    runner.set_stat(STAT_DATA_COUNT, list.len() as i64);
    runner.add_step();

    let mut prev_state = asset.last_prev_state_cached(asset.base_timeframe())?;
    for i in 0..list.len() {
        if let (Some(t), Some(v)) = (list.time_at(i), list.value_at(i)) {
            prev_state.check_update_min(v.min(), t);
            prev_state.check_update_max(v.max(), t);
        }
    }

    let new_consistency = date_start + scale.day_units();
    asset.store(
        &list.to_raw(asset.decimals()),
        asset.base_timeframe(),
        &prev_state,
        new_consistency,
    )?;
    runner.add_step();

    let _ = std::fs::remove_file(&csv_path);
    info!(
        asset = %asset.set_and_asset_id(),
        date = %date,
        aggregated = list.len(),
        parsed = rows.len(),
        took = ?runner.timer(),
        "day stored"
    );
    Ok(())
}

fn unzip_archive(zip_path: &Path, dest: &Path) -> EngineResult<()> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    archive.extract(dest)?;
    Ok(())
}

/// `(timestamp, value)` rows, skipping a heuristically detected header row
/// (any field containing `time`, `date` or `id`).
pub fn read_archive_rows(path: &Path) -> EngineResult<Vec<(i64, f64)>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;

    let mut rows = Vec::new();
    let mut first = true;
    for record in reader.records() {
        let record = record?;
        if first {
            first = false;
            if is_header(&record) {
                continue;
            }
        }
        if record.len() < 2 {
            return Err(EngineError::Malformed(format!(
                "archive row has {} fields",
                record.len()
            )));
        }
        let timestamp: i64 = record[0]
            .parse()
            .map_err(|_| EngineError::Malformed(format!("timestamp '{}'", &record[0])))?;
        let value: f64 = record[1]
            .parse()
            .map_err(|_| EngineError::Malformed(format!("value '{}'", &record[1])))?;
        rows.push((timestamp, value));
    }
    Ok(rows)
}

fn is_header(record: &csv::StringRecord) -> bool {
    record
        .iter()
        .any(|f| f.contains("time") || f.contains("date") || f.contains("id"))
}

/// Fold raw rows into one tick per base bucket. Raw samples are count-1
/// records, so the candle fold sums child absolute-sums (zero) rather than
/// accumulating intra-bucket close movement.
pub fn fold_rows_to_base(
    rows: &[(i64, f64)],
    data_type: DataType,
    div: i64,
) -> EngineResult<TickList> {
    if data_type == DataType::Point {
        return Err(EngineError::Validation(
            "point streams are not parsed from archives".to_string(),
        ));
    }
    let mut out = TickList::new(data_type);
    let mut bucket_items = TickList::new(data_type);
    let mut current_bucket: Option<i64> = None;

    for &(ts, value) in rows {
        let bucket = ts - ts.rem_euclid(div.max(1));
        if current_bucket != Some(bucket) {
            if let Some(b) = current_bucket {
                let aggregated = bucket_items.aggregate(AbsoluteSumMode::SumOfChildren)?;
                out.push(TimeUnit::new(b), aggregated)?;
                bucket_items = TickList::new(data_type);
            }
        }
        bucket_items.push(TimeUnit::new(bucket), TickValue::from_value(data_type, value))?;
        current_bucket = Some(bucket);
    }
    if let Some(b) = current_bucket {
        if !bucket_items.is_empty() {
            let aggregated = bucket_items.aggregate(AbsoluteSumMode::SumOfChildren)?;
            out.push(TimeUnit::new(b), aggregated)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_same_bucket_rows_into_one_candle() {
        let rows = vec![(1_700_000_000, 10.0), (1_700_000_000, 12.0), (1_700_000_001, 9.0)];
        let list = fold_rows_to_base(&rows, DataType::Unit, 1).unwrap();
        assert_eq!(list.len(), 2);

        let first = list.value_at(0).unwrap();
        if let TickValue::Unit(u) = first {
            assert_eq!(u.open, 10.0);
            assert_eq!(u.high, 12.0);
            assert_eq!(u.low, 10.0);
            assert_eq!(u.close, 12.0);
            assert_eq!(u.average, 11.0);
            assert_eq!(u.median, 11.0);
            assert_eq!(u.absolute_sum, 0.0);
            assert_eq!(u.count, 2);
        } else {
            panic!("expected a unit");
        }

        let second = list.value_at(1).unwrap();
        if let TickValue::Unit(u) = second {
            assert_eq!(u.open, 9.0);
            assert_eq!(u.count, 1);
        } else {
            panic!("expected a unit");
        }
    }

    #[test]
    fn sub_bucket_timestamps_align_down() {
        let rows = vec![(10_004, 1.0), (10_007, 2.0), (10_012, 3.0)];
        let list = fold_rows_to_base(&rows, DataType::Quantity, 10).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.time_at(0), Some(TimeUnit::new(10_000)));
        assert_eq!(list.time_at(1), Some(TimeUnit::new(10_010)));
    }

    #[test]
    fn header_row_is_detected() {
        let mut record = csv::StringRecord::new();
        record.push_field("open_time");
        record.push_field("value");
        assert!(is_header(&record));

        let mut data = csv::StringRecord::new();
        data.push_field("1700000000");
        data.push_field("1.5");
        assert!(!is_header(&data));
    }
}
