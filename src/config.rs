//! Configuration
//!
//! All tunables of the pipeline live in [`Settings`]. Every field has a
//! default, so a settings file only needs the values it overrides:
//!
//! ```json
//! { "fetcher": { "event_batch_size": 50 }, "subgraph": { "max_past_events": 50 } }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// First block with subnet-aware staking; stake evidence from this block on
/// must carry a net uid.
pub const SUBNET_UPGRADE_BLOCK: u64 = 4_920_352;

/// Lowest block the pipeline will look at.
pub const LOWER_BLOCK_LIMIT: u64 = 3_014_341;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub client: ClientSettings,
    pub fetcher: FetcherSettings,
    pub decoder: DecoderSettings,
    pub subgraph: SubgraphSettings,
    pub scoring: ScoringSettings,
    pub targets: TargetSettings,
}

/// Chain client connection and retry behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Attempts per query before giving up
    pub max_retries: u32,
    /// Base delay between retries, in milliseconds
    pub retry_delay_ms: u64,
    /// Attempts to (re)establish the connection
    pub connect_attempts: u32,
    /// Minimum seconds between two liveness checks
    pub liveness_interval_secs: u64,
    /// HTTP request timeout, in seconds
    pub request_timeout_secs: u64,
    /// Ceiling of the query result cache
    pub query_cache_size: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 1_000,
            connect_attempts: 5,
            liveness_interval_secs: 60,
            request_timeout_secs: 60,
            query_cache_size: 10_000,
        }
    }
}

impl ClientSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherSettings {
    /// Seconds the cached chain head stays fresh
    pub head_refresh_secs: u64,
    /// Concurrent hash lookups / preprocessing requests per batch
    pub preprocess_concurrency: usize,
    /// Timeout of one combined event batch request, in milliseconds
    pub batch_timeout_ms: u64,
    /// Blocks per combined event request
    pub event_batch_size: usize,
    pub block_hash_cache_size: usize,
    pub event_cache_size: usize,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            head_refresh_secs: 60,
            preprocess_concurrency: 20,
            batch_timeout_ms: 10_000,
            event_batch_size: 75,
            block_hash_cache_size: 10_000,
            event_cache_size: 10_000,
        }
    }
}

impl FetcherSettings {
    pub fn head_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.head_refresh_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecoderSettings {
    /// Concurrent stake event decodes
    pub stake_concurrency: usize,
    /// Concurrent owner lookups against the chain
    pub owner_lookup_concurrency: usize,
    /// Blocks decoded together before moving on
    pub block_chunk_size: usize,
    /// Events of one block handled per step
    pub event_chunk_size: usize,
    pub decoded_block_cache_size: usize,
    pub owner_cache_size: usize,
    pub address_cache_size: usize,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            stake_concurrency: 50,
            owner_lookup_concurrency: 20,
            block_chunk_size: 20,
            event_chunk_size: 100,
            decoded_block_cache_size: 1_000,
            owner_cache_size: 10_000,
            address_cache_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubgraphSettings {
    /// Blocks searched after the target block
    pub max_future_events: u64,
    /// Blocks searched before the target block
    pub max_past_events: u64,
    pub lower_block_limit: u64,
    pub subnet_upgrade_block: u64,
    pub subgraph_cache_size: usize,
}

impl Default for SubgraphSettings {
    fn default() -> Self {
        Self {
            max_future_events: 150,
            max_past_events: 150,
            lower_block_limit: LOWER_BLOCK_LIMIT,
            subnet_upgrade_block: SUBNET_UPGRADE_BLOCK,
            subgraph_cache_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    /// Volume at which the volume score is 0.5
    pub inflection_point: f64,
    pub steepness: f64,
    /// Response time in seconds at which the responsiveness score is 0.5
    pub response_time_half_score: f64,
    pub volume_weight: f64,
    pub responsiveness_weight: f64,
    pub moving_average_window: usize,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            inflection_point: 1000.0,
            steepness: 0.005,
            response_time_half_score: 2.0,
            volume_weight: 0.9,
            responsiveness_weight: 0.1,
            moving_average_window: 20,
        }
    }
}

/// Random target sampling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetSettings {
    /// Lowest block a sampling run may start at
    pub min_start_block: u64,
    /// Blocks sampled per requested target
    pub blocks_per_target: u64,
    /// Distance between two sampled blocks
    pub block_stride: u64,
    /// Blocks kept free below the head per sampled block
    pub head_margin_per_block: u64,
    /// Extra sampling runs when a run finds nothing
    pub retries: u32,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            min_start_block: LOWER_BLOCK_LIMIT + 1,
            blocks_per_target: 4,
            block_stride: 500,
            head_margin_per_block: 600,
            retries: 3,
        }
    }
}

/// Load settings from a JSON file, or use the defaults when no path is given.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {:?}", path))?;
    let settings: Settings = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid settings file: {:?}", path))?;

    let weights = settings.scoring.volume_weight + settings.scoring.responsiveness_weight;
    if (weights - 1.0).abs() > 1e-9 {
        anyhow::bail!("Scoring weights must sum to 1, got {}", weights);
    }
    if settings.scoring.moving_average_window == 0 {
        anyhow::bail!("Moving average window must be at least 1");
    }

    Ok(settings)
}
