//! Scripted transport and helpers shared by the unit tests.

use crate::client::ChainClient;
use crate::codec::{owner_storage_key, system_events_key, RuntimeCodec};
use crate::config::ClientSettings;
use crate::rpc::{BatchResults, RpcCall, RpcError, RpcTransport};
use crate::runtime::{RuntimeVersions, VersionRange};
use crate::types::{AccountBytes, BlockHash, BlockNumber, FieldValue, RawEvent, RawField};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Deterministic block hash for block `n`.
pub fn hash(n: BlockNumber) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    bytes[0] = 0xb1;
    BlockHash(bytes)
}

pub fn account(n: u8) -> AccountBytes {
    [n; 32]
}

pub fn event(pallet: &str, variant: &str, fields: Vec<FieldValue>) -> RawEvent {
    RawEvent {
        pallet: pallet.to_string(),
        variant: variant.to_string(),
        fields: fields
            .into_iter()
            .map(|value| RawField { name: None, value })
            .collect(),
    }
}

/// One runtime version (1) covering every block.
pub fn test_versions() -> RuntimeVersions {
    let mut ranges = BTreeMap::new();
    ranges.insert(
        1,
        VersionRange {
            block_number_min: 0,
            block_number_max: 10_000_000,
            block_hash_min: hash(0),
        },
    );
    RuntimeVersions::new(ranges).unwrap()
}

pub fn test_settings() -> ClientSettings {
    ClientSettings {
        max_retries: 3,
        retry_delay_ms: 1,
        connect_attempts: 2,
        liveness_interval_secs: 60,
        request_timeout_secs: 5,
        query_cache_size: 100,
    }
}

/// Version 1 covers blocks 0..=100, version 2 covers 200 onwards; 101..=199 is a gap.
pub fn split_versions() -> RuntimeVersions {
    let mut ranges = BTreeMap::new();
    ranges.insert(
        1,
        VersionRange {
            block_number_min: 0,
            block_number_max: 100,
            block_hash_min: hash(0),
        },
    );
    ranges.insert(
        2,
        VersionRange {
            block_number_min: 200,
            block_number_max: 10_000_000,
            block_hash_min: hash(200),
        },
    );
    RuntimeVersions::new(ranges).unwrap()
}

/// Client over `transport` with a JSON decode context for version 1.
pub fn test_client(transport: Arc<MockTransport>) -> ChainClient {
    test_client_with(transport, test_versions(), test_settings())
}

/// Client with a JSON decode context for every version in `versions`.
pub fn test_client_with(
    transport: Arc<MockTransport>,
    versions: RuntimeVersions,
    settings: ClientSettings,
) -> ChainClient {
    let codecs: HashMap<u32, Arc<dyn RuntimeCodec>> = versions
        .versions()
        .map(|v| (v, Arc::new(JsonCodec) as Arc<dyn RuntimeCodec>))
        .collect();
    ChainClient::with_codecs(transport, versions, codecs, settings)
}

/// Decode context that reads events serialized as JSON.
pub struct JsonCodec;

impl RuntimeCodec for JsonCodec {
    fn decode_events(&self, bytes: &[u8]) -> anyhow::Result<Vec<RawEvent>> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

struct Failure {
    remaining: usize,
    rate_limited: bool,
}

/// In-memory node answering the RPC methods the client uses.
#[derive(Default)]
pub struct MockTransport {
    head: Mutex<BlockNumber>,
    hashes: Mutex<HashMap<BlockNumber, BlockHash>>,
    storage: Mutex<HashMap<(String, Option<BlockHash>), Vec<u8>>>,
    failures: Mutex<HashMap<String, Failure>>,
    calls: Mutex<HashMap<String, usize>>,
    batch_delay: Mutex<Option<Duration>>,
    dead: AtomicBool,
    revive_on_reconnect: AtomicBool,
    reconnects: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, number: BlockNumber) {
        *self.head.lock().unwrap() = number;
    }

    pub fn add_block(&self, number: BlockNumber, hash: BlockHash) {
        self.hashes.lock().unwrap().insert(number, hash);
    }

    pub fn put_raw_events(&self, at: BlockHash, bytes: Vec<u8>) {
        let key = format!("0x{}", hex::encode(system_events_key()));
        self.storage.lock().unwrap().insert((key, Some(at)), bytes);
    }

    pub fn put_events(&self, at: BlockHash, events: &[RawEvent]) {
        self.put_raw_events(at, serde_json::to_vec(events).unwrap());
    }

    /// Register `number` with its hash and events.
    pub fn add_block_with_events(&self, number: BlockNumber, events: &[RawEvent]) {
        self.add_block(number, hash(number));
        self.put_events(hash(number), events);
    }

    pub fn set_owner(&self, hotkey: &AccountBytes, owner: &AccountBytes) {
        self.set_owner_bytes(hotkey, owner.to_vec());
    }

    pub fn set_owner_bytes(&self, hotkey: &AccountBytes, bytes: Vec<u8>) {
        let key = format!("0x{}", hex::encode(owner_storage_key(hotkey)));
        self.storage.lock().unwrap().insert((key, None), bytes);
    }

    /// Fail the next `times` calls of `method` (`"batch"` for whole batches).
    pub fn fail_next(&self, method: &str, times: usize, rate_limited: bool) {
        self.failures.lock().unwrap().insert(
            method.to_string(),
            Failure {
                remaining: times,
                rate_limited,
            },
        );
    }

    pub fn set_batch_delay(&self, delay: Duration) {
        *self.batch_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_alive(&self, alive: bool) {
        self.dead.store(!alive, Ordering::SeqCst);
    }

    pub fn revive_on_reconnect(&self) {
        self.revive_on_reconnect.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    /// Calls of every method except the liveness probe.
    pub fn data_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(method, _)| method.as_str() != "system_health")
            .map(|(_, n)| n)
            .sum()
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn record(&self, method: &str) -> Result<(), RpcError> {
        *self.calls.lock().unwrap().entry(method.to_string()).or_default() += 1;

        let mut failures = self.failures.lock().unwrap();
        if let Some(failure) = failures.get_mut(method) {
            if failure.remaining > 0 {
                failure.remaining -= 1;
                return Err(if failure.rate_limited {
                    RpcError::RateLimited
                } else {
                    RpcError::Malformed(format!("injected failure for {}", method))
                });
            }
        }
        Ok(())
    }

    fn storage_value(&self, params: &Value) -> Value {
        let key = params[0].as_str().unwrap_or_default().to_string();
        let at = params
            .get(1)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<BlockHash>().ok());

        let storage = self.storage.lock().unwrap();
        storage
            .get(&(key.clone(), at))
            .or_else(|| storage.get(&(key, None)))
            .map(|bytes| json!(format!("0x{}", hex::encode(bytes))))
            .unwrap_or(Value::Null)
    }

    fn answer(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        match method {
            "system_health" => Ok(json!({"peers": 8, "isSyncing": false, "shouldHavePeers": true})),
            "chain_getHeader" => {
                let head = *self.head.lock().unwrap();
                Ok(json!({
                    "number": format!("0x{:x}", head),
                    "parentHash": hash(head.saturating_sub(1)).to_hex(),
                }))
            }
            "chain_getBlockHash" => {
                let number = params[0].as_u64().unwrap_or_default();
                Ok(self
                    .hashes
                    .lock()
                    .unwrap()
                    .get(&number)
                    .map(|h| json!(h.to_hex()))
                    .unwrap_or(Value::Null))
            }
            "state_getRuntimeVersion" => Ok(json!({})),
            "state_getStorage" => Ok(self.storage_value(params)),
            other => Err(RpcError::Rpc {
                code: -32601,
                message: format!("Method not found: {}", other),
            }),
        }
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.record(method)?;
        self.answer(method, &params)
    }

    async fn batch(&self, calls: Vec<RpcCall>) -> Result<BatchResults, RpcError> {
        self.record("batch")?;
        let delay = *self.batch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(calls
            .into_iter()
            .map(|call| {
                let answer = self.answer(call.method, &call.params);
                (call.id, answer)
            })
            .collect())
    }

    async fn is_alive(&self) -> bool {
        *self.calls.lock().unwrap().entry("system_health".to_string()).or_default() += 1;
        !self.dead.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), RpcError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.revive_on_reconnect.load(Ordering::SeqCst) {
            self.dead.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}
