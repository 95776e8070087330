//! Chain client
//!
//! One logical connection to the archive node, multiplexed across every
//! configured runtime version. All chain access goes through [`ChainClient::query`],
//! which adds:
//!
//! - a throttled liveness check that rebuilds a dead connection
//! - a bounded result cache for pure lookups (block hashes, prepared queries)
//! - bounded retries with backoff (exponential when rate limited, linear otherwise)

use crate::cache::SharedCache;
use crate::codec::{system_events_key, MetadataCodec, RuntimeCodec};
use crate::config::ClientSettings;
use crate::rpc::{RpcCall, RpcError, RpcTransport};
use crate::runtime::RuntimeVersions;
use crate::types::{parse_hex_bytes, BlockHash, BlockNumber, Header, RawEvent, RuntimeVersion};
use futures::future::try_join_all;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Could not connect to the RPC node after {attempts} attempts: {last_error}")]
    Connection { attempts: u32, last_error: String },
    #[error("Client has no initialized runtime versions")]
    NotInitialized,
    #[error("Runtime version {version} is not initialized (available: {available:?})")]
    UnknownVersion {
        version: RuntimeVersion,
        available: Vec<RuntimeVersion>,
    },
    #[error("Failed to build decode context for runtime version {version}: {reason}")]
    DecodeContext { version: RuntimeVersion, reason: String },
    #[error("Query failed for runtime version {version} after {attempts} attempts: {errors:?}")]
    RetriesExhausted {
        version: RuntimeVersion,
        attempts: u32,
        errors: Vec<String>,
    },
    #[error("Unexpected answer to {0} query")]
    UnexpectedAnswer(&'static str),
}

/// Everything needed to fetch the events of one block in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreparedQuery {
    pub block_hash: BlockHash,
    /// Runtime version the node reports for this block, if it told us
    pub spec_version: Option<RuntimeVersion>,
    pub storage_key: Vec<u8>,
}

/// An operation the client can run against a runtime version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    BlockHash(BlockNumber),
    Head,
    PrepareEvents(BlockHash),
    /// One combined request for the events of many blocks
    EventBatch(Vec<PreparedQuery>),
    Storage { key: Vec<u8>, at: Option<BlockHash> },
}

impl Query {
    /// Pure lookups whose answer never changes.
    ///
    /// The head is not one of them.
    fn is_cacheable(&self) -> bool {
        matches!(self, Query::BlockHash(_) | Query::PrepareEvents(_))
    }

    fn name(&self) -> &'static str {
        match self {
            Query::BlockHash(_) => "block_hash",
            Query::Head => "head",
            Query::PrepareEvents(_) => "prepare_events",
            Query::EventBatch(_) => "event_batch",
            Query::Storage { .. } => "storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Hash(Option<BlockHash>),
    Header(Header),
    Prepared(PreparedQuery),
    /// Decoded events per block; blocks that failed to decode are absent
    Events(HashMap<BlockHash, Vec<RawEvent>>),
    Storage(Option<Vec<u8>>),
}

pub struct ChainClient {
    transport: Arc<dyn RpcTransport>,
    versions: RuntimeVersions,
    codecs: HashMap<RuntimeVersion, Arc<dyn RuntimeCodec>>,
    settings: ClientSettings,
    last_liveness_check: Mutex<Option<Instant>>,
    query_cache: SharedCache<(RuntimeVersion, Query), Answer>,
}

impl ChainClient {
    /// Create an uninitialized client. Call [`ChainClient::initialize`] before querying.
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        versions: RuntimeVersions,
        settings: ClientSettings,
    ) -> Self {
        Self::with_codecs(transport, versions, HashMap::new(), settings)
    }

    /// Create a client with ready-made decode contexts.
    pub fn with_codecs(
        transport: Arc<dyn RpcTransport>,
        versions: RuntimeVersions,
        codecs: HashMap<RuntimeVersion, Arc<dyn RuntimeCodec>>,
        settings: ClientSettings,
    ) -> Self {
        let query_cache = SharedCache::new(settings.query_cache_size);
        Self {
            transport,
            versions,
            codecs,
            settings,
            last_liveness_check: Mutex::new(None),
            query_cache,
        }
    }

    /// Connect and build a decode context for every runtime version.
    ///
    /// Contexts load concurrently; any failure aborts initialization.
    pub async fn initialize(&mut self) -> Result<(), ChainError> {
        self.connect(false).await?;

        info!("Initializing decode contexts for {} runtime versions", self.versions.len());
        let loads = self
            .versions
            .iter()
            .map(|(version, range)| self.load_codec(version, range.block_hash_min));
        let loaded = try_join_all(loads).await?;

        self.codecs.extend(loaded);
        info!("Chain client ready (versions {:?})", self.available_versions());
        Ok(())
    }

    async fn load_codec(
        &self,
        version: RuntimeVersion,
        anchor: BlockHash,
    ) -> Result<(RuntimeVersion, Arc<dyn RuntimeCodec>), ChainError> {
        let metadata = self
            .call_with_retry(version, "state_getMetadata", json!([anchor.to_hex()]))
            .await?;

        let codec = metadata
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("metadata is not a hex string"))
            .and_then(parse_hex_bytes)
            .and_then(|bytes| MetadataCodec::from_bytes(&bytes))
            .map_err(|e| ChainError::DecodeContext {
                version,
                reason: format!("{:#}", e),
            })?;

        debug!("Loaded metadata for runtime version {} at {}", version, anchor);
        Ok((version, Arc::new(codec) as Arc<dyn RuntimeCodec>))
    }

    pub fn versions(&self) -> &RuntimeVersions {
        &self.versions
    }

    /// Highest runtime version with a decode context.
    pub fn latest_version(&self) -> Option<RuntimeVersion> {
        self.codecs.keys().max().copied()
    }

    fn available_versions(&self) -> Vec<RuntimeVersion> {
        let mut available: Vec<RuntimeVersion> = self.codecs.keys().copied().collect();
        available.sort_unstable();
        available
    }

    fn resolve_version(&self, version: Option<RuntimeVersion>) -> Result<RuntimeVersion, ChainError> {
        match version {
            Some(v) if self.codecs.contains_key(&v) => Ok(v),
            Some(v) => Err(ChainError::UnknownVersion {
                version: v,
                available: self.available_versions(),
            }),
            None => self.latest_version().ok_or(ChainError::NotInitialized),
        }
    }

    /// Run `query` against `version` (the latest version when `None`).
    pub async fn query(
        &self,
        version: Option<RuntimeVersion>,
        query: Query,
    ) -> Result<Answer, ChainError> {
        let version = self.resolve_version(version)?;

        let cacheable = query.is_cacheable();
        if cacheable {
            if let Some(answer) = self.query_cache.get(&(version, query.clone())) {
                return Ok(answer);
            }
        }

        self.check_connection().await?;
        let answer = self.execute_with_retry(version, &query).await?;

        // A missing hash only means the block does not exist yet
        if cacheable && answer != Answer::Hash(None) {
            self.query_cache.insert((version, query), answer.clone());
        }
        Ok(answer)
    }

    async fn execute_with_retry(
        &self,
        version: RuntimeVersion,
        query: &Query,
    ) -> Result<Answer, ChainError> {
        let attempts = self.settings.max_retries.max(1);
        let mut errors = Vec::new();

        for attempt in 0..attempts {
            let err = match self.execute(version, query).await {
                Ok(answer) => return Ok(answer),
                Err(e) => e,
            };
            errors.push(err.to_string());
            if attempt + 1 == attempts {
                break;
            }
            self.back_off(version, query.name(), attempt, attempts, &err).await?;
        }

        Err(ChainError::RetriesExhausted {
            version,
            attempts,
            errors,
        })
    }

    /// Single RPC call with the same retry policy as [`ChainClient::query`].
    async fn call_with_retry(
        &self,
        version: RuntimeVersion,
        method: &'static str,
        params: Value,
    ) -> Result<Value, ChainError> {
        let attempts = self.settings.max_retries.max(1);
        let mut errors = Vec::new();

        for attempt in 0..attempts {
            let err = match self.transport.request(method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            errors.push(err.to_string());
            if attempt + 1 == attempts {
                break;
            }
            self.back_off(version, method, attempt, attempts, &err).await?;
        }

        Err(ChainError::RetriesExhausted {
            version,
            attempts,
            errors,
        })
    }

    async fn back_off(
        &self,
        version: RuntimeVersion,
        what: &str,
        attempt: u32,
        attempts: u32,
        err: &RpcError,
    ) -> Result<(), ChainError> {
        let base = self.settings.retry_delay();

        if err.is_rate_limited() {
            let delay = base.saturating_mul(2u32.saturating_pow(attempt));
            warn!(
                "Rate limited on {} (version {}), retrying in {:?} ({}/{})",
                what,
                version,
                delay,
                attempt + 1,
                attempts
            );
            tokio::time::sleep(delay).await;
            return Ok(());
        }

        let delay = base.saturating_mul(attempt + 1);
        warn!(
            "{} failed (version {}): {}; retrying in {:?} ({}/{})",
            what,
            version,
            err,
            delay,
            attempt + 1,
            attempts
        );
        tokio::time::sleep(delay).await;

        if attempt + 2 == attempts {
            info!("Rebuilding connection before final attempt of {}", what);
            self.rebuild_connection().await?;
        }
        Ok(())
    }

    async fn execute(&self, version: RuntimeVersion, query: &Query) -> Result<Answer, RpcError> {
        match query {
            Query::BlockHash(number) => {
                let result = self.transport.request("chain_getBlockHash", json!([number])).await?;
                Ok(Answer::Hash(parse_optional_hash(&result)?))
            }
            Query::Head => {
                let result = self.transport.request("chain_getHeader", json!([])).await?;
                let header: Header = serde_json::from_value(result)
                    .map_err(|e| RpcError::Malformed(format!("invalid header: {}", e)))?;
                Ok(Answer::Header(header))
            }
            Query::PrepareEvents(hash) => {
                let result = self
                    .transport
                    .request("state_getRuntimeVersion", json!([hash.to_hex()]))
                    .await?;
                let spec_version = result
                    .get("specVersion")
                    .and_then(Value::as_u64)
                    .and_then(|v| RuntimeVersion::try_from(v).ok());
                Ok(Answer::Prepared(PreparedQuery {
                    block_hash: *hash,
                    spec_version,
                    storage_key: system_events_key(),
                }))
            }
            Query::EventBatch(prepared) => {
                let events = self.fetch_event_batch(version, prepared).await?;
                Ok(Answer::Events(events))
            }
            Query::Storage { key, at } => {
                let mut params = vec![json!(format!("0x{}", hex::encode(key)))];
                if let Some(at) = at {
                    params.push(json!(at.to_hex()));
                }
                let result = self
                    .transport
                    .request("state_getStorage", Value::Array(params))
                    .await?;
                Ok(Answer::Storage(parse_optional_bytes(&result)?))
            }
        }
    }

    async fn fetch_event_batch(
        &self,
        version: RuntimeVersion,
        prepared: &[PreparedQuery],
    ) -> Result<HashMap<BlockHash, Vec<RawEvent>>, RpcError> {
        let calls = prepared
            .iter()
            .map(|p| RpcCall {
                id: p.block_hash.to_hex(),
                method: "state_getStorage",
                params: json!([format!("0x{}", hex::encode(&p.storage_key)), p.block_hash.to_hex()]),
            })
            .collect();

        let mut results = self.transport.batch(calls).await?;

        let mut events = HashMap::with_capacity(prepared.len());
        for p in prepared {
            let raw = match results.remove(&p.block_hash.to_hex()) {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => {
                    warn!("Event storage query failed for block {}: {}", p.block_hash, e);
                    continue;
                }
                None => {
                    warn!("No answer for block {} in event batch", p.block_hash);
                    continue;
                }
            };

            let bytes = match parse_optional_bytes(&raw) {
                Ok(Some(bytes)) => bytes,
                // No event storage at all: an empty block
                Ok(None) => {
                    events.insert(p.block_hash, Vec::new());
                    continue;
                }
                Err(e) => {
                    warn!("Malformed event storage for block {}: {}", p.block_hash, e);
                    continue;
                }
            };

            let Some(codec) = self.codec_for(p.spec_version, version) else {
                warn!("No decode context for block {} (version {})", p.block_hash, version);
                continue;
            };
            match codec.decode_events(&bytes) {
                Ok(decoded) => {
                    events.insert(p.block_hash, decoded);
                }
                Err(e) => warn!("Failed to decode events of block {}: {:#}", p.block_hash, e),
            }
        }
        Ok(events)
    }

    // Prefer the version the node reported for the block over the grouping's guess
    fn codec_for(
        &self,
        spec_version: Option<RuntimeVersion>,
        version: RuntimeVersion,
    ) -> Option<&Arc<dyn RuntimeCodec>> {
        spec_version
            .and_then(|v| self.codecs.get(&v))
            .or_else(|| self.codecs.get(&version))
    }

    /// Probe the node at most once per liveness interval, rebuilding a dead connection.
    async fn check_connection(&self) -> Result<(), ChainError> {
        let due = {
            let last = self.lock_liveness();
            last.map_or(true, |at| at.elapsed() >= self.settings.liveness_interval())
        };
        if !due {
            return Ok(());
        }

        if !self.transport.is_alive().await {
            warn!("RPC connection is not responding, rebuilding");
            self.rebuild_connection().await?;
        }
        *self.lock_liveness() = Some(Instant::now());
        Ok(())
    }

    /// Drop the current connection and establish a fresh one.
    pub async fn rebuild_connection(&self) -> Result<(), ChainError> {
        self.connect(true).await
    }

    /// Establish the connection, retrying with linear backoff.
    ///
    /// With `fresh` the transport is rebuilt even if the old connection still answers.
    async fn connect(&self, fresh: bool) -> Result<(), ChainError> {
        let attempts = self.settings.connect_attempts.max(1);
        let mut last_error = String::from("node did not answer the health check");

        for attempt in 0..attempts {
            if fresh || attempt > 0 {
                if let Err(e) = self.transport.reconnect().await {
                    last_error = e.to_string();
                }
            }
            if self.transport.is_alive().await {
                *self.lock_liveness() = Some(Instant::now());
                debug!("RPC connection established (attempt {})", attempt + 1);
                return Ok(());
            }
            warn!("Connection attempt {}/{} failed", attempt + 1, attempts);
            if attempt + 1 < attempts {
                tokio::time::sleep(self.settings.retry_delay().saturating_mul(attempt + 1)).await;
            }
        }

        Err(ChainError::Connection {
            attempts,
            last_error,
        })
    }

    fn lock_liveness(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_liveness_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Typed helpers

    pub async fn block_hash(&self, number: BlockNumber) -> Result<Option<BlockHash>, ChainError> {
        match self.query(None, Query::BlockHash(number)).await? {
            Answer::Hash(hash) => Ok(hash),
            _ => Err(ChainError::UnexpectedAnswer("block_hash")),
        }
    }

    pub async fn head(&self) -> Result<Header, ChainError> {
        match self.query(None, Query::Head).await? {
            Answer::Header(header) => Ok(header),
            _ => Err(ChainError::UnexpectedAnswer("head")),
        }
    }

    pub async fn prepare_events(
        &self,
        version: RuntimeVersion,
        hash: BlockHash,
    ) -> Result<PreparedQuery, ChainError> {
        match self.query(Some(version), Query::PrepareEvents(hash)).await? {
            Answer::Prepared(prepared) => Ok(prepared),
            _ => Err(ChainError::UnexpectedAnswer("prepare_events")),
        }
    }

    pub async fn event_batch(
        &self,
        version: RuntimeVersion,
        prepared: Vec<PreparedQuery>,
    ) -> Result<HashMap<BlockHash, Vec<RawEvent>>, ChainError> {
        match self.query(Some(version), Query::EventBatch(prepared)).await? {
            Answer::Events(events) => Ok(events),
            _ => Err(ChainError::UnexpectedAnswer("event_batch")),
        }
    }

    pub async fn storage(
        &self,
        key: Vec<u8>,
        at: Option<BlockHash>,
    ) -> Result<Option<Vec<u8>>, ChainError> {
        match self.query(None, Query::Storage { key, at }).await? {
            Answer::Storage(value) => Ok(value),
            _ => Err(ChainError::UnexpectedAnswer("storage")),
        }
    }
}

fn parse_optional_hash(value: &Value) -> Result<Option<BlockHash>, RpcError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => s
            .parse()
            .map(Some)
            .map_err(|e| RpcError::Malformed(format!("invalid block hash {}: {}", s, e))),
        other => Err(RpcError::Malformed(format!("expected block hash, got {}", other))),
    }
}

fn parse_optional_bytes(value: &Value) -> Result<Option<Vec<u8>>, RpcError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => parse_hex_bytes(s)
            .map(Some)
            .map_err(|e| RpcError::Malformed(e.to_string())),
        other => Err(RpcError::Malformed(format!("expected hex bytes, got {}", other))),
    }
}
