//! Background key deletion through a bounded channel.
//!
//! Large rollbacks push millions of keys; queueing them through the
//! destructor keeps the delete targets out of memory and commits them in
//! batches of [`WRITE_CHUNK`] keys. Errors are sticky: the first failed
//! commit stops the worker and is surfaced by [`KeyDestructor::discard`].

use rocksdb::WriteBatch;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::store::{SetDb, WRITE_CHUNK};
use crate::core::{EngineError, EngineResult};

const QUEUE_CAPACITY: usize = 10_000;

pub struct KeyDestructor {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    worker: JoinHandle<EngineResult<u64>>,
}

impl KeyDestructor {
    pub fn spawn(db: Arc<SetDb>) -> KeyDestructor {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(QUEUE_CAPACITY);

        let worker = tokio::spawn(async move {
            let mut batch = WriteBatch::default();
            let mut pending = 0usize;
            let mut total = 0u64;

            while let Some(key) = rx.recv().await {
                batch.delete(&key);
                pending += 1;
                total += 1;

                if pending >= WRITE_CHUNK {
                    db.write(std::mem::take(&mut batch))?;
                    pending = 0;
                }
            }

            if pending > 0 {
                db.write(batch)?;
            }
            Ok(total)
        });

        KeyDestructor {
            tx: Some(tx),
            worker,
        }
    }

    /// Queue a key for deletion. Blocks when the channel is full; a closed
    /// channel means the worker already failed, which `discard` reports.
    pub async fn delete(&self, key: Vec<u8>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(key).await;
        }
    }

    /// Flush queued keys, commit the tail batch and return the number of
    /// keys deleted, or the worker's sticky error.
    pub async fn discard(mut self) -> EngineResult<u64> {
        drop(self.tx.take());
        self.worker
            .await
            .map_err(|e| EngineError::Storage(format!("destructor worker panicked: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RocksDbConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn deletes_across_batch_boundaries() {
        let dir = TempDir::new().unwrap();
        let db = SetDb::open(dir.path(), &RocksDbConfig::default()).unwrap();
        for i in 0u32..12_000 {
            db.put(&i.to_be_bytes(), b"x").unwrap();
        }

        let destructor = KeyDestructor::spawn(db.clone());
        for i in 0u32..12_000 {
            destructor.delete(i.to_be_bytes().to_vec()).await;
        }
        let deleted = destructor.discard().await.unwrap();
        assert_eq!(deleted, 12_000);
        assert_eq!(db.get(&0u32.to_be_bytes()).unwrap(), None);
        assert_eq!(db.get(&11_999u32.to_be_bytes()).unwrap(), None);
    }

    #[tokio::test]
    async fn empty_destructor_discards_cleanly() {
        let dir = TempDir::new().unwrap();
        let db = SetDb::open(dir.path(), &RocksDbConfig::default()).unwrap();
        let destructor = KeyDestructor::spawn(db);
        assert_eq!(destructor.discard().await.unwrap(), 0);
    }
}
