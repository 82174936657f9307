//! Engine configuration, assembled from the environment into an explicit
//! handle passed down from `main`.

use std::path::{Path, PathBuf};

use crate::core::{EngineError, EngineResult, TimeScale, Timeframe};

pub const SETS_FILE: &str = "_sets.json";

#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    pub enable_compression: bool,
    pub max_open_files: i32,
    pub write_buffer_size_mb: usize,
    pub max_write_buffer_number: i32,
    pub block_cache_size_mb: usize,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            enable_compression: true,
            max_open_files: 1000,
            write_buffer_size_mb: 256,
            max_write_buffer_number: 4,
            block_cache_size_mb: 512,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub databases_dir: PathBuf,
    pub archives_dir: PathBuf,
    pub csv_dir: PathBuf,
    /// Base timeframe; also the resolution timestamps are counted in.
    pub min_time_frame: Timeframe,
    pub scale: TimeScale,
    /// How many days behind "now" the base watermark may lag while the asset
    /// still counts as consistent.
    pub max_days_backward_for_consistency: i64,
    /// Scheduler slots.
    pub max_simultaneous_parsing: usize,
    pub rocksdb: RocksDbConfig,
}

fn env_var(name: &str) -> EngineResult<String> {
    std::env::var(name).map_err(|_| EngineError::Config(format!("{} is not set", name)))
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        let min_time_frame = match std::env::var("MIN_TIME_FRAME") {
            Ok(label) => Timeframe::parse_label(&label)?,
            Err(_) => Timeframe::SECOND,
        };
        let max_days_backward = match std::env::var("MAX_DAYS_BACKWARD_FOR_CONSISTENCY") {
            Ok(v) => v.parse().map_err(|_| {
                EngineError::Config("MAX_DAYS_BACKWARD_FOR_CONSISTENCY must be an integer".into())
            })?,
            Err(_) => 3,
        };
        let max_simultaneous = match std::env::var("MAX_SIMULTANEOUS_PARSING") {
            Ok(v) => v.parse().map_err(|_| {
                EngineError::Config("MAX_SIMULTANEOUS_PARSING must be an integer".into())
            })?,
            Err(_) => 3,
        };

        Self::new(
            PathBuf::from(env_var("DATABASES_DIR")?),
            PathBuf::from(env_var("ARCHIVES_DIR")?),
            PathBuf::from(env_var("CSV_DIR")?),
            min_time_frame,
            max_days_backward,
            max_simultaneous,
        )
    }

    pub fn new(
        databases_dir: PathBuf,
        archives_dir: PathBuf,
        csv_dir: PathBuf,
        min_time_frame: Timeframe,
        max_days_backward_for_consistency: i64,
        max_simultaneous_parsing: usize,
    ) -> EngineResult<Self> {
        let scale = TimeScale::new(min_time_frame.as_duration())?;
        Ok(Self {
            databases_dir,
            archives_dir,
            csv_dir,
            min_time_frame,
            scale,
            max_days_backward_for_consistency,
            max_simultaneous_parsing,
            rocksdb: RocksDbConfig::default(),
        })
    }

    pub fn ensure_directories(&self) -> EngineResult<()> {
        std::fs::create_dir_all(&self.databases_dir)?;
        std::fs::create_dir_all(&self.archives_dir)?;
        std::fs::create_dir_all(&self.csv_dir)?;
        Ok(())
    }

    pub fn sets_file_path(&self) -> PathBuf {
        self.databases_dir.join(SETS_FILE)
    }

    pub fn archive_folder_path(&self, set_id: &str, asset_type: &str) -> PathBuf {
        self.archives_dir.join(set_id).join(asset_type)
    }

    pub fn archive_file_path(
        &self,
        set_id: &str,
        asset_type: &str,
        date: &str,
        ext: &str,
    ) -> PathBuf {
        self.archive_folder_path(set_id, asset_type)
            .join(format!("{}.{}", date, ext))
    }

    pub fn csv_build_folder(&self, build_id: &str) -> PathBuf {
        self.csv_dir.join(build_id)
    }

    pub fn csv_archive_path(&self, build_id: &str) -> PathBuf {
        self.csv_dir.join(format!("{}.zip", build_id))
    }
}

/// Test-friendly constructor rooted at temporary directories.
impl EngineConfig {
    pub fn for_root(root: &Path) -> EngineResult<Self> {
        let cfg = Self::new(
            root.join("databases"),
            root.join("archives"),
            root.join("csv"),
            Timeframe::SECOND,
            3,
            3,
        )?;
        cfg.ensure_directories()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_the_configured_roots() {
        let cfg = EngineConfig::new(
            PathBuf::from("/data/db"),
            PathBuf::from("/data/archives"),
            PathBuf::from("/data/csv"),
            Timeframe::SECOND,
            3,
            4,
        )
        .unwrap();

        assert_eq!(cfg.sets_file_path(), PathBuf::from("/data/db/_sets.json"));
        assert_eq!(
            cfg.archive_file_path("btcusdt", "price", "2023-11-14", "zip"),
            PathBuf::from("/data/archives/btcusdt/price/2023-11-14.zip")
        );
        assert_eq!(
            cfg.csv_archive_path("1s-0-1-abc"),
            PathBuf::from("/data/csv/1s-0-1-abc.zip")
        );
        assert_eq!(cfg.scale.unit_millis(), 1_000);
    }

    #[test]
    fn rocksdb_defaults_are_sane() {
        let defaults = RocksDbConfig::default();
        assert!(defaults.enable_compression);
        assert!(defaults.max_open_files >= 100);
        assert!(defaults.write_buffer_size_mb >= 64);
    }
}
