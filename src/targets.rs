//! Random query targets
//!
//! Picks `(address, block)` pairs for the validator to ask miners about:
//! sample a handful of evenly spaced blocks from a random starting point,
//! decode them, and draw from the accounts that appear in their events.

use crate::config::TargetSettings;
use crate::decoder::EventDecoder;
use crate::fetcher::EventFetcher;
use crate::protocol::ChainEvent;
use crate::types::BlockNumber;
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

/// An account to build a subgraph around, and the block to build it at.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Target {
    pub address: String,
    pub block_number: BlockNumber,
}

/// Every account an event touches, paired with the event's block.
pub fn find_candidates(events: &[ChainEvent]) -> BTreeSet<Target> {
    let mut candidates = BTreeSet::new();
    for event in events {
        let block_number = event.evidence.block_number();
        if block_number == 0 {
            continue;
        }
        let accounts = [&event.coldkey_source, &event.coldkey_destination, &event.coldkey_owner];
        for address in accounts.into_iter().flatten() {
            candidates.insert(Target {
                address: address.clone(),
                block_number,
            });
        }
    }
    candidates
}

pub struct TargetGenerator {
    fetcher: Arc<EventFetcher>,
    decoder: Arc<EventDecoder>,
    settings: TargetSettings,
    rng: Mutex<StdRng>,
}

impl TargetGenerator {
    pub fn new(fetcher: Arc<EventFetcher>, decoder: Arc<EventDecoder>, settings: TargetSettings) -> Self {
        Self::with_rng(fetcher, decoder, settings, StdRng::from_entropy())
    }

    /// Generator with a fixed seed, for reproducible sampling.
    pub fn with_seed(
        fetcher: Arc<EventFetcher>,
        decoder: Arc<EventDecoder>,
        settings: TargetSettings,
        seed: u64,
    ) -> Self {
        Self::with_rng(fetcher, decoder, settings, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        fetcher: Arc<EventFetcher>,
        decoder: Arc<EventDecoder>,
        settings: TargetSettings,
        rng: StdRng,
    ) -> Self {
        Self {
            fetcher,
            decoder,
            settings,
            rng: Mutex::new(rng),
        }
    }

    fn lock_rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evenly spaced blocks starting at a random block below the head.
    pub async fn sample_blocks(&self, count: usize) -> Result<Vec<BlockNumber>> {
        let head = self.fetcher.current_block().await?;
        let sampled = (count as u64).saturating_mul(self.settings.blocks_per_target);
        let margin = sampled.saturating_mul(self.settings.head_margin_per_block);

        let highest_start = head
            .checked_sub(margin)
            .filter(|start| *start >= self.settings.min_start_block)
            .with_context(|| {
                format!(
                    "Chain head {} is too low to sample {} blocks from block {}",
                    head, sampled, self.settings.min_start_block
                )
            })?;

        let start = self
            .lock_rng()
            .gen_range(self.settings.min_start_block..=highest_start);
        Ok((0..sampled)
            .map(|i| start + i * self.settings.block_stride)
            .collect())
    }

    /// Up to `count` distinct targets drawn from `candidates`.
    fn draw(&self, candidates: &BTreeSet<Target>, count: usize) -> Vec<Target> {
        let pool: Vec<&Target> = candidates.iter().collect();
        let mut rng = self.lock_rng();
        pool.choose_multiple(&mut *rng, count.min(pool.len()))
            .map(|target| (*target).clone())
            .collect()
    }

    /// Exactly `count` targets, repeating some when the chain offers fewer.
    ///
    /// A sampling run that finds no accounts is retried from a new random
    /// block; when every run comes back empty the result is empty.
    pub async fn generate_targets(&self, count: usize) -> Result<Vec<Target>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        debug!("Fetching {} target addresses", count);
        let start = Instant::now();

        let attempts = self.settings.retries + 1;
        for attempt in 1..=attempts {
            let blocks = self.sample_blocks(count).await?;
            let events = self
                .fetcher
                .fetch_all_events(&blocks, self.fetcher.batch_size())
                .await?;
            let decoded = self.decoder.process_event_data(&events).await;

            let mut targets = self.draw(&find_candidates(&decoded), count);
            if targets.is_empty() {
                warn!(
                    "No targets in blocks {}..={} (attempt {}/{})",
                    blocks.first().copied().unwrap_or_default(),
                    blocks.last().copied().unwrap_or_default(),
                    attempt,
                    attempts
                );
                continue;
            }

            {
                let mut rng = self.lock_rng();
                while targets.len() < count {
                    let Some(repeat) = targets.choose(&mut *rng).cloned() else {
                        break;
                    };
                    targets.push(repeat);
                }
            }

            info!("Returning {} targets in {:.2?}", targets.len(), start.elapsed());
            return Ok(targets);
        }

        warn!("No targets found after {} attempts", attempts);
        Ok(Vec::new())
    }
}
