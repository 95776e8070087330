//! MinerScoreRepository trait and RocksDB implementation
//!
//! Score records are append-only. The RocksDB store keeps them in a single
//! column family, keyed so that a miner's history is one contiguous,
//! time-ordered range.

use crate::keys::{decode_score_key, encode_miner_prefix, encode_score_key};
use crate::records::{MinerKey, MinerScoreRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

const SCORES_CF: &str = "miner_scores";

#[async_trait]
pub trait MinerScoreRepository: Send + Sync {
    /// Persist a new score record.
    async fn add(&self, record: &MinerScoreRecord) -> Result<()>;

    /// Overall scores of `miner`, newest first, at most `count` of them.
    async fn find_latest_overall_scores(&self, miner: &MinerKey, count: usize) -> Result<Vec<f64>>;

    /// Moving average of the newest record of every miner.
    async fn find_last_average_overall_scores(&self) -> Result<HashMap<MinerKey, f64>>;
}

/// RocksDB-backed implementation of MinerScoreRepository.
///
/// Column families:
/// - miner_scores: postcard-encoded [`MinerScoreRecord`]s
///
/// RocksDB calls block, so the async methods run them on tokio's blocking pool.
#[derive(Clone)]
pub struct RocksScoreRepository {
    db: Arc<DB>,
}

impl RocksScoreRepository {
    /// Open or create a RocksDB database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let column_families = vec![ColumnFamilyDescriptor::new(SCORES_CF, Options::default())];

        let db = DB::open_cf_descriptors(&opts, path, column_families)
            .context("Failed to open RocksDB database")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn get_cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .with_context(|| format!("Column family '{}' not found", name))
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .context("Score store task failed")?
    }

    /// Fetch one record by its full identity.
    pub fn get(&self, miner: &MinerKey, created_at: u64, id: uuid::Uuid) -> Result<Option<MinerScoreRecord>> {
        let cf = self.get_cf(SCORES_CF)?;
        let key = encode_score_key(miner, created_at, id)?;
        match self.db.get_cf(cf, &key).context("Failed to get score")? {
            Some(bytes) => {
                let record = postcard::from_bytes(&bytes)
                    .context("Failed to deserialize score record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_record(&self, record: &MinerScoreRecord) -> Result<()> {
        let cf = self.get_cf(SCORES_CF)?;
        let key = encode_score_key(&record.miner(), record.created_at, record.id)?;
        let value = postcard::to_allocvec(record).context("Failed to serialize score record")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put score")?;
        Ok(())
    }

    fn latest_overall_scores(&self, miner: &MinerKey, count: usize) -> Result<Vec<f64>> {
        let cf = self.get_cf(SCORES_CF)?;
        let prefix = encode_miner_prefix(miner)?;

        // Start past the newest possible key of this miner and walk back
        let mut search_key = prefix.clone();
        search_key.extend_from_slice(&[0xff; 24]);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&search_key, Direction::Reverse));

        let mut scores = Vec::with_capacity(count);
        for item in iter {
            let (key, value) = item.context("Failed to read iterator")?;
            if !key.starts_with(&prefix) {
                break;
            }
            let record: MinerScoreRecord = postcard::from_bytes(&value)
                .context("Failed to deserialize score record")?;
            scores.push(record.overall_score);
            if scores.len() == count {
                break;
            }
        }
        Ok(scores)
    }

    fn last_average_overall_scores(&self) -> Result<HashMap<MinerKey, f64>> {
        let cf = self.get_cf(SCORES_CF)?;
        let mut averages = HashMap::new();

        // Keys ascend by time within a miner, so the last write wins
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.context("Failed to read iterator")?;
            let (miner, _, _) = decode_score_key(&key).context("Failed to decode score key")?;
            let record: MinerScoreRecord = postcard::from_bytes(&value)
                .context("Failed to deserialize score record")?;
            averages.insert(miner, record.overall_score_moving_average);
        }
        Ok(averages)
    }
}

#[async_trait]
impl MinerScoreRepository for RocksScoreRepository {
    async fn add(&self, record: &MinerScoreRecord) -> Result<()> {
        let record = record.clone();
        self.blocking(move |store| store.put_record(&record)).await
    }

    async fn find_latest_overall_scores(&self, miner: &MinerKey, count: usize) -> Result<Vec<f64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let miner = miner.clone();
        self.blocking(move |store| store.latest_overall_scores(&miner, count))
            .await
    }

    async fn find_last_average_overall_scores(&self) -> Result<HashMap<MinerKey, f64>> {
        self.blocking(|store| store.last_average_overall_scores()).await
    }
}
