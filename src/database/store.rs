//! RocksDB handle owned by one set.

use rocksdb::{Direction, IteratorMode, Options, ReadOptions, WriteBatch, DB};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::RocksDbConfig;
use crate::core::EngineResult;

/// Keys per committed transaction for bulk writes and deletes.
pub const WRITE_CHUNK: usize = 10_000;

pub struct SetDb {
    db: DB,
    path: PathBuf,
}

impl SetDb {
    pub fn open(path: &Path, config: &RocksDbConfig) -> EngineResult<Arc<SetDb>> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        if config.enable_compression {
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        }

        let cache = rocksdb::Cache::new_lru_cache(config.block_cache_size_mb * 1024 * 1024);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_block_cache(&cache);
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open(&opts, path)?;
        info!(path = %path.display(), "store open");

        Ok(Arc::new(SetDb {
            db,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        Ok(self.db.put(key, value)?)
    }

    pub fn delete(&self, key: &[u8]) -> EngineResult<()> {
        Ok(self.db.delete(key)?)
    }

    pub fn write(&self, batch: WriteBatch) -> EngineResult<()> {
        Ok(self.db.write(batch)?)
    }

    /// Write a large entry set in chunked batches of [`WRITE_CHUNK`] keys.
    /// Each chunk is atomic; replaying after a mid-write crash is idempotent
    /// because keys are content-addressed by timestamp.
    pub fn write_chunked<I>(&self, entries: I) -> EngineResult<()>
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let mut batch = WriteBatch::default();
        let mut n = 0usize;
        for (key, value) in entries {
            batch.put(&key, &value);
            n += 1;
            if n >= WRITE_CHUNK {
                self.db.write(std::mem::take(&mut batch))?;
                n = 0;
            }
        }
        if n > 0 {
            self.db.write(batch)?;
        }
        Ok(())
    }

    /// Forward iterator over `[start, end)`.
    pub fn iter_range<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
    ) -> impl Iterator<Item = EngineResult<(Box<[u8]>, Box<[u8]>)>> + 'a {
        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_upper_bound(end.to_vec());
        self.db
            .iterator_opt(IteratorMode::From(start, Direction::Forward), read_opts)
            .map(|r| r.map_err(Into::into))
    }

    /// Iterator seeded at `start`, walking in `direction`. A small
    /// `readahead` hint keeps point-lookups from dragging whole blocks in.
    pub fn iter_from<'a>(
        &'a self,
        start: &[u8],
        direction: Direction,
        readahead: Option<usize>,
    ) -> impl Iterator<Item = EngineResult<(Box<[u8]>, Box<[u8]>)>> + 'a {
        let mut read_opts = ReadOptions::default();
        if let Some(bytes) = readahead {
            read_opts.set_readahead_size(bytes);
        }
        self.db
            .iterator_opt(IteratorMode::From(start, direction), read_opts)
            .map(|r| r.map_err(Into::into))
    }

    /// Storage maintenance: flush memtables and compact the whole keyspace.
    /// Runs until RocksDB has nothing left to rewrite.
    pub fn run_gc(&self) -> EngineResult<()> {
        self.db.flush()?;
        self.db.compact_range(None::<&[u8]>, None::<&[u8]>);
        Ok(())
    }

    pub fn approximate_size(&self) -> i64 {
        let mut total = 0i64;
        for prop in ["rocksdb.total-sst-files-size", "rocksdb.size-all-mem-tables"] {
            if let Ok(Some(v)) = self.db.property_int_value(prop) {
                total += v as i64;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (Arc<SetDb>, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = SetDb::open(dir.path(), &RocksDbConfig::default()).unwrap();
        (db, dir)
    }

    #[test]
    fn put_get_delete() {
        let (db, _dir) = open_temp();
        db.put(b"k", b"v").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        db.delete(b"k").unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn range_iteration_is_half_open() {
        let (db, _dir) = open_temp();
        for i in 0u8..10 {
            db.put(&[i], &[i]).unwrap();
        }
        let keys: Vec<u8> = db
            .iter_range(&[2], &[5])
            .map(|r| r.unwrap().0[0])
            .collect();
        assert_eq!(keys, vec![2, 3, 4]);
    }

    #[test]
    fn chunked_write_lands_every_key() {
        let (db, _dir) = open_temp();
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0u32..25_000)
            .map(|i| (i.to_be_bytes().to_vec(), vec![1]))
            .collect();
        db.write_chunked(entries).unwrap();
        let count = db
            .iter_from(&[], Direction::Forward, None)
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(count, 25_000);
    }

    #[test]
    fn reverse_iteration_from_seed() {
        let (db, _dir) = open_temp();
        for i in 0u8..10 {
            db.put(&[i], &[i]).unwrap();
        }
        let keys: Vec<u8> = db
            .iter_from(&[5], Direction::Reverse, None)
            .map(|r| r.unwrap().0[0])
            .collect();
        assert_eq!(keys, vec![5, 4, 3, 2, 1, 0]);
    }
}
