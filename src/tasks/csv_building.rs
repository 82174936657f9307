//! CSV export: a time-ordered k-way merge across heterogeneous asset
//! streams into rolling files with a size cap, archived as one zip.

use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::engine::runner_id;
use super::filters::standard_filter;
use super::runner::{
    kind, Runner, RunnerArgs, STAT_ARCHIVE_SIZE, STAT_LINE_COUNT,
};
use crate::config::EngineConfig;
use crate::core::{EngineError, EngineResult, TimeUnit, Timeframe};
use crate::models::{AssetAddress, CsvRequirement, TickList};
use crate::sets::{AssetState, SetManager};

pub const MAX_FILE_BYTES: i64 = 100 * 1024 * 1024;

pub const STAT_FROM_UNIX: &str = "FROM_UNIX";
pub const STAT_TO_UNIX: &str = "TO_UNIX";

#[derive(Clone)]
pub struct CsvAssetOrder {
    pub asset: Arc<AssetState>,
    pub columns: CsvRequirement,
}

#[derive(Clone)]
pub struct CsvBuildOrder {
    pub from: TimeUnit,
    pub to: TimeUnit,
    pub timeframe: Timeframe,
    pub orders: Vec<CsvAssetOrder>,
    pub config: Arc<EngineConfig>,
    pub max_file_bytes: i64,
}

/// Wire form of an export request: `[address, column, column, ...]` per
/// order, times in unix seconds.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PackedCsvOrder {
    pub from: i64,
    pub to: i64,
    pub timeframe: String,
    pub orders: Vec<Vec<String>>,
}

pub fn parse_packed_order(
    manager: &SetManager,
    config: &Arc<EngineConfig>,
    packed: PackedCsvOrder,
) -> EngineResult<CsvBuildOrder> {
    if packed.to <= packed.from {
        return Err(EngineError::Validation(
            "to must be greater than from".to_string(),
        ));
    }
    let timeframe = Timeframe::parse_label(&packed.timeframe)?;
    let scale = config.scale;
    let unit_seconds = (scale.unit_millis() as f64 / 1_000.0).max(0.001);
    let from = TimeUnit::new((packed.from as f64 / unit_seconds) as i64);
    let to = TimeUnit::new((packed.to as f64 / unit_seconds) as i64);

    let mut orders: Vec<CsvAssetOrder> = Vec::new();
    for raw in packed.orders {
        if raw.len() < 2 {
            return Err(EngineError::Validation(format!(
                "order has invalid length {}",
                raw.len()
            )));
        }
        let address = AssetAddress::from_canonical(raw[0].clone())?;
        let parsed = address.parse()?;
        let set = manager
            .find(&parsed.set_id)
            .ok_or_else(|| EngineError::not_found("set", parsed.set_id.clone()))?;
        let asset = set
            .find_asset(&address)
            .ok_or_else(|| EngineError::not_found("asset", address.as_str()))?;

        if !asset.is_timeframe_supported(timeframe)? {
            return Err(EngineError::Validation(format!(
                "asset {} does not support timeframe {}",
                address,
                timeframe.label()
            )));
        }
        let consistency = asset.last_consistency_time(asset.base_timeframe())?;
        if consistency < to {
            return Err(EngineError::Validation(format!(
                "asset {} is only consistent until {}",
                address, consistency
            )));
        }

        let mut columns = CsvRequirement::new();
        for column in &raw[1..] {
            if !asset
                .data_type()
                .columns()
                .contains(&column.as_str())
            {
                return Err(EngineError::Validation(format!(
                    "asset {} has no column {}",
                    address, column
                )));
            }
            columns.insert(column.clone());
        }
        orders.push(CsvAssetOrder { asset, columns });
    }

    // Deterministic output: dedup by address, sort by address.
    orders.sort_by(|a, b| a.asset.address().cmp(b.asset.address()));
    orders.dedup_by(|a, b| a.asset.address() == b.asset.address());

    Ok(CsvBuildOrder {
        from,
        to,
        timeframe,
        orders,
        config: Arc::clone(config),
        max_file_bytes: MAX_FILE_BYTES,
    })
}

impl CsvBuildOrder {
    /// `<label>-<fromUnix>-<toUnix>-<sha256hex>`; doubles as the runner id
    /// and the archive filename.
    pub fn build_id(&self) -> String {
        let scale = self.config.scale;
        let mut parts: Vec<String> = self
            .orders
            .iter()
            .map(|o| {
                format!(
                    "{},{}",
                    o.asset.address(),
                    o.columns.projected(o.asset.data_type()).join(",")
                )
            })
            .collect();
        parts.sort();
        let digest = Sha256::digest(parts.join("|").as_bytes());
        format!(
            "{}-{}-{}-{:x}",
            self.timeframe.label(),
            scale.unix_seconds(self.from),
            scale.unix_seconds(self.to),
            digest
        )
    }

    fn multi_set(&self) -> bool {
        let first = self.orders.first().map(|o| o.asset.set_id().to_string());
        self.orders
            .iter()
            .any(|o| Some(o.asset.set_id().to_string()) != first)
    }

    fn header(&self) -> Vec<String> {
        let multi = self.multi_set();
        self.orders
            .iter()
            .flat_map(|o| {
                o.asset
                    .data_type()
                    .header(&o.asset.parsed().column_prefix(multi), &o.columns)
            })
            .collect()
    }
}

pub fn build_runner(order: CsvBuildOrder) -> EngineResult<Runner> {
    let build_id = order.build_id();
    let id = runner_id(kind::CSV_BUILDING, &[&build_id]);
    let addresses: Vec<AssetAddress> = order
        .orders
        .iter()
        .map(|o| o.asset.address().clone())
        .collect();
    let args =
        RunnerArgs::new(kind::CSV_BUILDING, addresses).with_timeframe(order.timeframe);
    let scale = order.config.scale;
    let (from_unix, to_unix) = (
        scale.unix_seconds(order.from),
        scale.unix_seconds(order.to),
    );

    let runner = Runner::builder(id, args)
        .filter(standard_filter())
        .process(move |runner| {
            let order = order.clone();
            Box::pin(async move { build_csv(runner, order).await })
        })
        .build();
    runner.set_stat(STAT_FROM_UNIX, from_unix);
    runner.set_stat(STAT_TO_UNIX, to_unix);

    Ok(runner)
}

async fn build_csv(runner: Arc<Runner>, order: CsvBuildOrder) -> EngineResult<()> {
    let config = Arc::clone(&order.config);
    let scale = config.scale;
    let build_id = order.build_id();

    runner.set_size_initial(order.from.int());
    runner.set_size_max(order.to.int());
    runner.set_stat(STAT_FROM_UNIX, scale.unix_seconds(order.from));
    runner.set_stat(STAT_TO_UNIX, scale.unix_seconds(order.to));

    let header = order.header();
    let folder = config.csv_build_folder(&build_id);
    std::fs::create_dir_all(&folder)?;

    // Larger timeframes carry fewer rows per wall-clock span, so the fetch
    // window widens as the timeframe grows.
    let batch_limit: i64 = if order.timeframe.millis() > Timeframe::MINUTE.millis() {
        10_000
    } else if order.timeframe.millis() > 15 * 1_000 {
        20_000
    } else {
        50_000
    };
    let interval = batch_limit * scale.steps(order.timeframe);

    let mut froms: Vec<TimeUnit> = order
        .orders
        .iter()
        .map(|o| o.asset.data_t0().max(order.from))
        .collect();

    let mut file_count = 0usize;
    let mut written_bytes: i64 = 0;
    let mut writer: Option<csv::Writer<std::fs::File>> = None;

    'production: loop {
        if froms.iter().all(|f| *f > order.to) {
            break 'production;
        }

        // One parallel fetch per order.
        let mut fetches = Vec::with_capacity(order.orders.len());
        for (i, o) in order.orders.iter().enumerate() {
            let asset = Arc::clone(&o.asset);
            let from = froms[i];
            let to = order.to;
            let timeframe = order.timeframe;
            fetches.push(tokio::task::spawn_blocking(move || {
                if from > to {
                    return Ok(TickList::new(asset.data_type()));
                }
                let end = TimeUnit::new((from.int() + interval).min(to.int() + 1));
                asset.get_in_range(timeframe, from, end)
            }));
        }
        let mut queues: Vec<TickList> = Vec::with_capacity(order.orders.len());
        for (i, joined) in join_all(fetches).await.into_iter().enumerate() {
            let list = joined
                .map_err(|e| EngineError::Storage(format!("fetch task failed: {}", e)))??;
            // Advance the cursor regardless; an empty window additionally
            // bumps by one so it is never revisited.
            froms[i] = froms[i] + interval;
            if list.is_empty() {
                froms[i] = froms[i] + 1;
            }
            queues.push(list);
        }

        let mut cursors = vec![0usize; queues.len()];
        let mut lines: Vec<Vec<String>> = Vec::new();
        loop {
            let mut min_ts: Option<TimeUnit> = None;
            for (i, queue) in queues.iter().enumerate() {
                if let Some(ts) = queue.time_at(cursors[i]) {
                    if min_ts.map_or(true, |m| ts < m) {
                        min_ts = Some(ts);
                    }
                }
            }
            // All queues drained: no placeholder row is owed to anyone.
            let Some(min_ts) = min_ts else { break };
            if min_ts > order.to {
                break;
            }

            let mut line: Vec<String> = Vec::new();
            for (i, o) in order.orders.iter().enumerate() {
                let at = match queues[i].time_at(cursors[i]) {
                    Some(ts) if ts == min_ts => {
                        let idx = cursors[i];
                        cursors[i] += 1;
                        Some(idx)
                    }
                    _ => None,
                };
                line.extend(queues[i].csv_cells_at(
                    at,
                    o.asset.decimals(),
                    &o.columns,
                    &scale,
                ));
            }
            lines.push(line);
        }

        if lines.is_empty() {
            if runner.must_interrupt() {
                break 'production;
            }
            continue;
        }

        for line in &lines {
            if writer.is_none() {
                let path = folder.join(format!("{}.csv", file_count));
                let file = std::fs::File::create(&path)?;
                let mut w = csv::Writer::from_writer(file);
                w.write_record(&header)?;
                let header_bytes = header.join(",").len() as i64 + 1;
                written_bytes += header_bytes;
                runner.increment_stat(STAT_ARCHIVE_SIZE, header_bytes);
                writer = Some(w);
            }
            let w = writer.as_mut().expect("writer open");
            w.write_record(line)?;
            let line_bytes = line.join(",").len() as i64 + 1;
            written_bytes += line_bytes;
            runner.increment_stat(STAT_ARCHIVE_SIZE, line_bytes);

            if written_bytes > order.max_file_bytes {
                let mut w = writer.take().expect("writer open");
                w.flush()?;
                file_count += 1;
                written_bytes = 0;
            }
        }
        runner.increment_stat(STAT_LINE_COUNT, lines.len() as i64);
        if let Some(min_from) = froms.iter().min() {
            runner.set_size_current(min_from.int().min(order.to.int()));
        }

        if runner.must_interrupt() {
            break 'production;
        }
    }

    if let Some(mut w) = writer.take() {
        w.flush()?;
    }

    write_query_summary(&folder, &order, &runner)?;

    runner.add_step();
    info!(build_id = %build_id, size = runner.stat_value(STAT_ARCHIVE_SIZE), "zipping export");
    let archive_path = config.csv_archive_path(&build_id);
    zip_directory(&folder, &archive_path)?;
    runner.add_step();
    std::fs::remove_dir_all(&folder)?;

    info!(
        build_id = %build_id,
        rows = runner.stat_value(STAT_LINE_COUNT),
        took = ?runner.timer(),
        "export built"
    );
    Ok(())
}

/// `query.txt`: timeframe, covered range, per-set projected columns and the
/// total row count.
fn write_query_summary(
    folder: &Path,
    order: &CsvBuildOrder,
    runner: &Arc<Runner>,
) -> EngineResult<()> {
    let scale = order.config.scale;
    let mut out = String::new();
    out.push_str(&format!("timeframe: {}\n", order.timeframe.label()));
    out.push_str(&format!(
        "range: {} .. {}\n",
        scale.date_str(order.from),
        scale.date_str(order.to)
    ));
    for o in &order.orders {
        out.push_str(&format!(
            "{}: {}\n",
            o.asset.set_and_asset_id(),
            o.columns.projected(o.asset.data_type()).join(",")
        ));
    }
    out.push_str(&format!("rows: {}\n", runner.stat_value(STAT_LINE_COUNT)));

    let mut file = std::fs::File::create(folder.join("query.txt"))?;
    file.write_all(out.as_bytes())?;
    Ok(())
}

fn zip_directory(folder: &Path, dest: &Path) -> EngineResult<()> {
    let file = std::fs::File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut entries: Vec<_> = std::fs::read_dir(folder)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|e| e.path().is_file())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        zip.start_file(name, options)?;
        let mut src = std::fs::File::open(entry.path())?;
        std::io::copy(&mut src, &mut zip)?;
    }
    zip.finish()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Status reporting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
pub struct CsvStatus {
    pub build_id: String,
    pub status: String,
    pub size: i64,
    pub percent: f64,
    pub from: i64,
    pub to: i64,
    pub timeframe_label: String,
    pub asset_ids: Vec<String>,
}

pub fn status_of(runner: &Arc<Runner>) -> CsvStatus {
    let prefix = format!("{}-", kind::CSV_BUILDING);
    let build_id = runner
        .id
        .strip_prefix(&prefix)
        .unwrap_or(&runner.id)
        .to_string();

    let (status, percent) = if !runner.has_started() {
        ("SCHEDULED".to_string(), 0.0)
    } else if runner.is_done() {
        ("DONE".to_string(), 99.99)
    } else if runner.count_steps() == 0 {
        ("WRITING".to_string(), runner.percent())
    } else {
        ("ZIPPING".to_string(), 99.99)
    };

    CsvStatus {
        build_id,
        status,
        size: runner.stat_value(STAT_ARCHIVE_SIZE),
        percent,
        from: runner.stat_value(STAT_FROM_UNIX),
        to: runner.stat_value(STAT_TO_UNIX),
        timeframe_label: runner
            .args
            .timeframe
            .map(|tf| tf.label())
            .unwrap_or_default(),
        asset_ids: runner
            .args
            .addresses
            .iter()
            .map(|a| a.to_string())
            .collect(),
    }
}

/// All exports known: live runners merged with the finished archives on
/// disk.
pub fn list_exports(
    config: &EngineConfig,
    csv_runners: &[Arc<Runner>],
) -> EngineResult<Vec<CsvStatus>> {
    let mut statuses: Vec<CsvStatus> = csv_runners.iter().map(status_of).collect();
    let live: std::collections::HashSet<String> =
        statuses.iter().map(|s| s.build_id.clone()).collect();

    if config.csv_dir.exists() {
        for entry in std::fs::read_dir(&config.csv_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(build_id) = name.strip_suffix(".zip") else {
                continue;
            };
            if live.contains(build_id) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len() as i64).unwrap_or(0);
            let (label, from, to) = parse_build_id(build_id);
            statuses.push(CsvStatus {
                build_id: build_id.to_string(),
                status: "DONE".to_string(),
                size,
                percent: 100.0,
                from,
                to,
                timeframe_label: label,
                asset_ids: Vec::new(),
            });
        }
    }
    statuses.sort_by(|a, b| a.build_id.cmp(&b.build_id));
    Ok(statuses)
}

fn parse_build_id(build_id: &str) -> (String, i64, i64) {
    let parts: Vec<&str> = build_id.splitn(4, '-').collect();
    if parts.len() == 4 {
        let from = parts[1].parse().unwrap_or(0);
        let to = parts[2].parse().unwrap_or(0);
        return (parts[0].to_string(), from, to);
    }
    (String::new(), 0, 0)
}
