//! Concurrent, batched event fetching
//!
//! Resolves block numbers to hashes, groups them by runtime version and
//! pulls the `System.Events` storage of each group in combined batches.
//! Runtime versions are fetched concurrently, batches of one version one
//! after the other.

use crate::cache::SharedCache;
use crate::client::ChainClient;
use crate::config::FetcherSettings;
use crate::runtime::group_blocks;
use crate::types::{BlockHash, BlockNumber, BlockRef, RawEventBatch, RuntimeVersion};
use anyhow::{Context, Result};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub struct EventFetcher {
    client: Arc<ChainClient>,
    settings: FetcherSettings,
    preprocess_limiter: Semaphore,
    block_hashes: SharedCache<BlockNumber, BlockHash>,
    events: SharedCache<(RuntimeVersion, BlockNumber), RawEventBatch>,
    head: Mutex<Option<(BlockNumber, Instant)>>,
}

impl EventFetcher {
    pub fn new(client: Arc<ChainClient>, settings: FetcherSettings) -> Self {
        Self {
            client,
            preprocess_limiter: Semaphore::new(settings.preprocess_concurrency.max(1)),
            block_hashes: SharedCache::new(settings.block_hash_cache_size),
            events: SharedCache::new(settings.event_cache_size),
            head: Mutex::new(None),
            settings,
        }
    }

    pub fn client(&self) -> &Arc<ChainClient> {
        &self.client
    }

    /// Blocks per combined event request when the caller has no preference.
    pub fn batch_size(&self) -> usize {
        self.settings.event_batch_size
    }

    /// Current chain head, refreshed at most once per refresh interval.
    pub async fn current_block(&self) -> Result<BlockNumber> {
        if let Some((number, fetched_at)) = *self.lock_head() {
            if fetched_at.elapsed() < self.settings.head_refresh_interval() {
                return Ok(number);
            }
        }

        let header = self.client.head().await.context("Failed to fetch chain head")?;
        *self.lock_head() = Some((header.number, Instant::now()));
        debug!("Chain head is now {}", header.number);
        Ok(header.number)
    }

    fn lock_head(&self) -> std::sync::MutexGuard<'_, Option<(BlockNumber, Instant)>> {
        self.head.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Events of the given blocks, keyed by block number.
    ///
    /// Best effort: blocks whose hash or events could not be obtained are
    /// absent from the result. Only a failure to read the chain head is an error.
    pub async fn fetch_all_events(
        &self,
        block_numbers: &[BlockNumber],
        batch_size: usize,
    ) -> Result<BTreeMap<BlockNumber, RawEventBatch>> {
        if block_numbers.is_empty() {
            warn!("No block numbers provided, nothing to fetch");
            return Ok(BTreeMap::new());
        }

        let unique: BTreeSet<BlockNumber> = block_numbers.iter().copied().collect();

        let mut results = BTreeMap::new();
        let mut uncached = Vec::new();
        for number in unique {
            match self.cached_events(number) {
                Some(events) => {
                    results.insert(number, events);
                }
                None => uncached.push(number),
            }
        }

        if uncached.is_empty() {
            info!("All {} blocks served from cache", results.len());
            return Ok(results);
        }
        info!(
            "Fetching events for {} uncached blocks ({} cached)",
            uncached.len(),
            results.len()
        );

        let start = Instant::now();
        let current_block = self.current_block().await?;
        let resolved = self.resolve_hashes(&uncached).await;
        let grouped = group_blocks(&resolved, current_block, self.client.versions(), batch_size);

        let fetches = grouped
            .into_iter()
            .map(|(version, batches)| self.fetch_version(version, batches));
        let mut fetched = 0usize;
        for version_events in join_all(fetches).await {
            fetched += version_events.len();
            results.extend(version_events);
        }

        info!(
            "Fetched events for {}/{} blocks in {:.2?}",
            fetched,
            uncached.len(),
            start.elapsed()
        );
        Ok(results)
    }

    /// Events of a single block, if they could be obtained.
    pub async fn get_block_events(&self, block_number: BlockNumber) -> Result<Option<RawEventBatch>> {
        let mut events = self
            .fetch_all_events(&[block_number], self.batch_size())
            .await?;
        Ok(events.remove(&block_number))
    }

    fn cached_events(&self, number: BlockNumber) -> Option<RawEventBatch> {
        self.client
            .versions()
            .versions()
            .find_map(|version| self.events.get(&(version, number)))
    }

    async fn resolve_hashes(&self, numbers: &[BlockNumber]) -> Vec<BlockRef> {
        let lookups = numbers.iter().map(|&number| async move {
            if let Some(hash) = self.block_hashes.get(&number) {
                return Some(BlockRef { number, hash });
            }

            let _permit = self.preprocess_limiter.acquire().await.ok()?;
            match self.client.block_hash(number).await {
                Ok(Some(hash)) => {
                    self.block_hashes.insert(number, hash);
                    Some(BlockRef { number, hash })
                }
                Ok(None) => {
                    warn!("Block {} has no hash on chain, skipping", number);
                    None
                }
                Err(e) => {
                    warn!("Failed to resolve hash for block {}: {}", number, e);
                    None
                }
            }
        });

        join_all(lookups).await.into_iter().flatten().collect()
    }

    async fn fetch_version(
        &self,
        version: RuntimeVersion,
        batches: Vec<Vec<BlockRef>>,
    ) -> BTreeMap<BlockNumber, RawEventBatch> {
        let mut results = BTreeMap::new();
        for (index, batch) in batches.iter().enumerate() {
            debug!(
                "Runtime version {}: batch {}/{} ({} blocks)",
                version,
                index + 1,
                batches.len(),
                batch.len()
            );
            results.extend(self.fetch_batch(version, batch).await);
        }
        results
    }

    async fn fetch_batch(
        &self,
        version: RuntimeVersion,
        batch: &[BlockRef],
    ) -> BTreeMap<BlockNumber, RawEventBatch> {
        let preparations = batch.iter().map(|block| async move {
            let _permit = self.preprocess_limiter.acquire().await.ok()?;
            match self.client.prepare_events(version, block.hash).await {
                Ok(prepared) => Some((block.number, prepared)),
                Err(e) => {
                    warn!("Failed to prepare block {}: {}", block.number, e);
                    None
                }
            }
        });
        let prepared: Vec<_> = join_all(preparations).await.into_iter().flatten().collect();
        if prepared.is_empty() {
            return BTreeMap::new();
        }

        let numbers: HashMap<BlockHash, BlockNumber> = prepared
            .iter()
            .map(|(number, p)| (p.block_hash, *number))
            .collect();
        let queries = prepared.into_iter().map(|(_, p)| p).collect();

        let timeout = self.settings.batch_timeout();
        let events = match tokio::time::timeout(timeout, self.client.event_batch(version, queries)).await {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                warn!("Event batch for runtime version {} failed: {}", version, e);
                return BTreeMap::new();
            }
            Err(_) => {
                warn!(
                    "Event batch for runtime version {} timed out after {:?}",
                    version, timeout
                );
                return BTreeMap::new();
            }
        };

        let mut fetched = BTreeMap::new();
        for (hash, block_events) in events {
            let Some(&number) = numbers.get(&hash) else {
                continue;
            };
            self.events.insert((version, number), block_events.clone());
            fetched.insert(number, block_events);
        }
        fetched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        account, event, split_versions, test_client, test_client_with, test_settings, MockTransport,
    };
    use crate::types::FieldValue;
    use std::time::Duration;

    fn transfer(amount: u128) -> crate::types::RawEvent {
        event(
            "Balances",
            "Transfer",
            vec![
                FieldValue::Account(account(1)),
                FieldValue::Account(account(2)),
                FieldValue::Uint(amount),
            ],
        )
    }

    fn setup(blocks: &[BlockNumber]) -> (Arc<MockTransport>, EventFetcher) {
        let transport = Arc::new(MockTransport::new());
        transport.set_head(1_000);
        for &number in blocks {
            transport.add_block_with_events(number, &[transfer(number as u128)]);
        }
        let client = Arc::new(test_client(transport.clone()));
        let fetcher = EventFetcher::new(client, FetcherSettings::default());
        (transport, fetcher)
    }

    #[tokio::test]
    async fn test_fetch_all_events() {
        let (_, fetcher) = setup(&[10, 11, 12]);

        let events = fetcher.fetch_all_events(&[12, 10, 11, 10], 2).await.unwrap();
        assert_eq!(events.keys().copied().collect::<Vec<_>>(), vec![10, 11, 12]);
        assert_eq!(events[&11], vec![transfer(11)]);
    }

    #[tokio::test]
    async fn test_cached_blocks_need_no_network() {
        let (transport, fetcher) = setup(&[10, 11, 12]);
        let first = fetcher.fetch_all_events(&[10, 11, 12], 75).await.unwrap();

        let data_calls = transport.data_calls();
        let health_calls = transport.calls("system_health");

        let second = fetcher.fetch_all_events(&[12, 11, 10], 75).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.data_calls(), data_calls);
        assert_eq!(transport.calls("system_health"), health_calls);
    }

    #[tokio::test]
    async fn test_unresolved_blocks_are_absent() {
        let (_, fetcher) = setup(&[10, 11]);

        // Block 500 has no hash on chain
        let events = fetcher.fetch_all_events(&[10, 11, 500], 75).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(!events.contains_key(&500));
    }

    #[tokio::test]
    async fn test_failed_hash_lookups_are_absent() {
        let (transport, fetcher) = setup(&[10, 11]);
        transport.fail_next("chain_getBlockHash", 100, false);

        let events = fetcher.fetch_all_events(&[10, 11], 75).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_batch_yields_nothing() {
        let (transport, _) = setup(&[10, 11]);
        transport.set_batch_delay(Duration::from_millis(500));
        let client = Arc::new(test_client(transport.clone()));
        let settings = FetcherSettings {
            batch_timeout_ms: 20,
            ..FetcherSettings::default()
        };
        let fetcher = EventFetcher::new(client, settings);

        let events = fetcher.fetch_all_events(&[10, 11], 75).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_fetches_across_runtime_versions() {
        let transport = Arc::new(MockTransport::new());
        transport.set_head(1_000);
        for number in [50, 60, 150, 250, 260] {
            transport.add_block_with_events(number, &[transfer(number as u128)]);
        }
        let client = Arc::new(test_client_with(transport.clone(), split_versions(), test_settings()));
        let fetcher = EventFetcher::new(client, FetcherSettings::default());

        let events = fetcher
            .fetch_all_events(&[50, 60, 150, 250, 260], 75)
            .await
            .unwrap();

        // 150 sits between the two ranges
        assert_eq!(events.keys().copied().collect::<Vec<_>>(), vec![50, 60, 250, 260]);
        assert_eq!(events[&50], vec![transfer(50)]);
        assert_eq!(events[&260], vec![transfer(260)]);
        // One combined batch per version
        assert_eq!(transport.calls("batch"), 2);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let (transport, fetcher) = setup(&[]);
        assert!(fetcher.fetch_all_events(&[], 75).await.unwrap().is_empty());
        assert_eq!(transport.data_calls(), 0);
    }

    #[tokio::test]
    async fn test_current_block_is_cached() {
        let (transport, fetcher) = setup(&[]);
        assert_eq!(fetcher.current_block().await.unwrap(), 1_000);
        transport.set_head(1_001);
        assert_eq!(fetcher.current_block().await.unwrap(), 1_000);
        assert_eq!(transport.calls("chain_getHeader"), 1);
    }
}
