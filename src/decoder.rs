//! Event decoding
//!
//! Turns the raw events of a block into [`ChainEvent`]s:
//!
//! - `Balances::Transfer` becomes a transfer directly
//! - `Balances::Withdraw` / `Balances::Deposit` are staged as balance legs
//! - `SubtensorModule::Stake{Added,Removed,Moved}` are decoded by shape.
//!   Current runtimes emit complete stakes; early runtimes emit a two-field
//!   form naming only the hotkey and amount, which is completed by matching
//!   it against the single balance leg of the same block with the same amount.

use crate::cache::SharedCache;
use crate::codec::format_account;
use crate::config::DecoderSettings;
use crate::owner::OwnerLookup;
use crate::protocol::{ChainEvent, EdgeCategory, EdgeKind, Evidence, StakeEvidence};
use crate::types::{AccountBytes, BlockNumber, FieldValue, RawEvent, RawEventBatch};
use anyhow::{Context, Result};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// A `Withdraw` or `Deposit` waiting to complete a legacy stake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceLeg {
    Withdraw { account: String, rao_amount: u64 },
    Deposit { account: String, rao_amount: u64 },
}

/// Two-field stake event: the hotkey side is known, the coldkey side is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyStakeLeg {
    pub kind: EdgeKind,
    pub hotkey: String,
    /// Coldkey owning the hotkey
    pub owner: String,
    pub rao_amount: u64,
    pub block_number: BlockNumber,
}

impl LegacyStakeLeg {
    /// Complete the stake with the account found on the matching balance leg.
    fn complete(&self, counterparty: String) -> ChainEvent {
        let mut evidence = StakeEvidence {
            block_number: self.block_number,
            rao_amount: self.rao_amount,
            ..StakeEvidence::default()
        };

        let (source, destination) = match self.kind {
            EdgeKind::Remove => {
                evidence.delegate_hotkey_source = Some(self.hotkey.clone());
                (self.owner.clone(), counterparty)
            }
            _ => {
                evidence.delegate_hotkey_destination = Some(self.hotkey.clone());
                (counterparty, self.owner.clone())
            }
        };

        ChainEvent {
            coldkey_source: Some(source),
            coldkey_destination: Some(destination),
            coldkey_owner: None,
            category: EdgeCategory::Staking,
            kind: self.kind,
            evidence: Evidence::Stake(evidence),
        }
    }
}

/// Layout of a stake event, told apart by field count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StakeShape {
    /// `(hotkey, amount)`
    Legacy,
    /// add/remove: `(coldkey, hotkey, rao, alpha, net_uid, ..)`,
    /// move: `(coldkey, src_hotkey, src_uid, dst_hotkey, dst_uid, rao)`
    Complete,
}

impl StakeShape {
    pub fn detect(kind: EdgeKind, field_count: usize) -> Option<Self> {
        match (kind, field_count) {
            (EdgeKind::Add | EdgeKind::Remove, 2) => Some(StakeShape::Legacy),
            (EdgeKind::Add | EdgeKind::Remove, n) if n >= 5 => Some(StakeShape::Complete),
            (EdgeKind::Move, 6) => Some(StakeShape::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StakeEntry {
    Incomplete(LegacyStakeLeg),
    Complete(ChainEvent),
}

enum BalanceEntry {
    Transfer(ChainEvent),
    Leg(BalanceLeg),
}

fn stake_kind(variant: &str) -> Option<EdgeKind> {
    match variant {
        "StakeAdded" => Some(EdgeKind::Add),
        "StakeRemoved" => Some(EdgeKind::Remove),
        "StakeMoved" => Some(EdgeKind::Move),
        _ => None,
    }
}

fn is_stake_event(event: &RawEvent) -> bool {
    event.pallet == "SubtensorModule" && stake_kind(&event.variant).is_some()
}

fn account_field(value: Option<&FieldValue>, what: &str) -> Result<AccountBytes> {
    value
        .and_then(FieldValue::as_account)
        .copied()
        .with_context(|| format!("missing or malformed {} account", what))
}

fn amount_field(value: Option<&FieldValue>, what: &str) -> Result<u64> {
    let raw = value
        .and_then(FieldValue::as_uint)
        .with_context(|| format!("missing or malformed {}", what))?;
    u64::try_from(raw).with_context(|| format!("{} {} does not fit in u64", what, raw))
}

fn net_uid_field(value: Option<&FieldValue>) -> Result<u16> {
    let raw = value
        .and_then(FieldValue::as_uint)
        .context("missing or malformed net uid")?;
    u16::try_from(raw).with_context(|| format!("net uid {} out of range", raw))
}

/// Complete legacy stake legs against the balance legs of their block.
///
/// A leg is completed only when exactly one leg of the right direction has
/// the same amount; otherwise the join is ambiguous and the leg is dropped.
pub fn reconcile(legacy: &[LegacyStakeLeg], legs: &[BalanceLeg]) -> Vec<ChainEvent> {
    legacy
        .iter()
        .filter_map(|stake| {
            let matches: Vec<&String> = legs
                .iter()
                .filter_map(|leg| match (stake.kind, leg) {
                    (EdgeKind::Add, BalanceLeg::Withdraw { account, rao_amount })
                    | (EdgeKind::Remove, BalanceLeg::Deposit { account, rao_amount })
                        if *rao_amount == stake.rao_amount =>
                    {
                        Some(account)
                    }
                    _ => None,
                })
                .collect();

            match matches.as_slice() {
                [account] => Some(stake.complete((*account).clone())),
                _ => {
                    debug!(
                        "Dropping legacy {:?} stake of {} at block {}: {} matching legs",
                        stake.kind,
                        stake.rao_amount,
                        stake.block_number,
                        matches.len()
                    );
                    None
                }
            }
        })
        .collect()
}

pub struct EventDecoder {
    owners: Arc<dyn OwnerLookup>,
    settings: DecoderSettings,
    stake_limiter: Semaphore,
    owner_limiter: Semaphore,
    addresses: SharedCache<AccountBytes, String>,
    owner_cache: SharedCache<AccountBytes, String>,
    decoded_blocks: SharedCache<BlockNumber, Vec<ChainEvent>>,
}

impl EventDecoder {
    pub fn new(owners: Arc<dyn OwnerLookup>, settings: DecoderSettings) -> Self {
        Self {
            owners,
            stake_limiter: Semaphore::new(settings.stake_concurrency.max(1)),
            owner_limiter: Semaphore::new(settings.owner_lookup_concurrency.max(1)),
            addresses: SharedCache::new(settings.address_cache_size),
            owner_cache: SharedCache::new(settings.owner_cache_size),
            decoded_blocks: SharedCache::new(settings.decoded_block_cache_size),
            settings,
        }
    }

    /// Decode the events of many blocks, in ascending block order.
    ///
    /// Blocks decoded before are served from cache.
    pub async fn process_event_data(
        &self,
        events_by_block: &BTreeMap<BlockNumber, RawEventBatch>,
    ) -> Vec<ChainEvent> {
        if events_by_block.is_empty() {
            warn!("No event data provided");
            return Vec::new();
        }

        let start = Instant::now();
        let mut by_block: BTreeMap<BlockNumber, Vec<ChainEvent>> = BTreeMap::new();
        let mut uncached = Vec::new();
        for (&number, events) in events_by_block {
            match self.decoded_blocks.get(&number) {
                Some(cached) => {
                    by_block.insert(number, cached);
                }
                None => uncached.push((number, events)),
            }
        }

        if uncached.is_empty() {
            info!("All {} blocks found in decode cache", events_by_block.len());
            return by_block.into_values().flatten().collect();
        }
        info!(
            "Decoding {} uncached blocks out of {}",
            uncached.len(),
            events_by_block.len()
        );

        for chunk in uncached.chunks(self.settings.block_chunk_size.max(1)) {
            let decoded = join_all(
                chunk
                    .iter()
                    .map(|(number, events)| self.decode_block(events, *number)),
            )
            .await;
            for ((number, _), block_events) in chunk.iter().zip(decoded) {
                by_block.insert(*number, block_events);
            }
        }

        let parsed: Vec<ChainEvent> = by_block.into_values().flatten().collect();

        info!(
            "Decoded {} events from {} blocks in {:.2?}",
            parsed.len(),
            events_by_block.len(),
            start.elapsed()
        );
        parsed
    }

    /// Decode one block. Events that fail to decode are skipped.
    pub async fn decode_block(&self, events: &[RawEvent], block_number: BlockNumber) -> Vec<ChainEvent> {
        if let Some(cached) = self.decoded_blocks.get(&block_number) {
            return cached;
        }

        let mut decoded = Vec::new();
        let mut balance_legs = Vec::new();
        let mut legacy_legs = Vec::new();

        for chunk in events.chunks(self.settings.event_chunk_size.max(1)) {
            for event in chunk.iter().filter(|e| e.pallet == "Balances") {
                match self.decode_balance_event(event, block_number) {
                    Ok(Some(BalanceEntry::Transfer(transfer))) => decoded.push(transfer),
                    Ok(Some(BalanceEntry::Leg(leg))) => balance_legs.push(leg),
                    Ok(None) => {}
                    Err(e) => warn!(
                        "Skipping Balances::{} in block {}: {:#}",
                        event.variant, block_number, e
                    ),
                }
            }

            let stakes = chunk.iter().filter(|e| is_stake_event(e)).map(|event| async move {
                let _permit = self.stake_limiter.acquire().await?;
                self.decode_stake_event(event, block_number).await
            });
            for (entry, event) in join_all(stakes)
                .await
                .into_iter()
                .zip(chunk.iter().filter(|e| is_stake_event(e)))
            {
                match entry {
                    Ok(StakeEntry::Complete(stake)) => decoded.push(stake),
                    Ok(StakeEntry::Incomplete(leg)) => legacy_legs.push(leg),
                    Err(e) => warn!(
                        "Skipping SubtensorModule::{} in block {}: {:#}",
                        event.variant, block_number, e
                    ),
                }
            }
        }

        decoded.extend(reconcile(&legacy_legs, &balance_legs));
        self.decoded_blocks.insert(block_number, decoded.clone());
        decoded
    }

    fn decode_balance_event(&self, event: &RawEvent, block_number: BlockNumber) -> Result<Option<BalanceEntry>> {
        let entry = match event.variant.as_str() {
            "Transfer" => {
                let from = account_field(event.field("from", 0), "from")?;
                let to = account_field(event.field("to", 1), "to")?;
                let amount = amount_field(event.field("amount", 2), "amount")?;
                BalanceEntry::Transfer(ChainEvent::transfer(
                    self.format_address(&from),
                    self.format_address(&to),
                    amount,
                    block_number,
                ))
            }
            "Withdraw" => BalanceEntry::Leg(BalanceLeg::Withdraw {
                account: self.format_address(&account_field(event.field("who", 0), "who")?),
                rao_amount: amount_field(event.field("amount", 1), "amount")?,
            }),
            "Deposit" => BalanceEntry::Leg(BalanceLeg::Deposit {
                account: self.format_address(&account_field(event.field("who", 0), "who")?),
                rao_amount: amount_field(event.field("amount", 1), "amount")?,
            }),
            _ => return Ok(None),
        };
        Ok(Some(entry))
    }

    async fn decode_stake_event(&self, event: &RawEvent, block_number: BlockNumber) -> Result<StakeEntry> {
        let kind = stake_kind(&event.variant).context("not a stake event")?;
        let shape = StakeShape::detect(kind, event.fields.len()).with_context(|| {
            format!("unexpected field count {} for {}", event.fields.len(), event.variant)
        })?;

        match (shape, kind) {
            (StakeShape::Legacy, _) => {
                let hotkey = account_field(event.field_at(0), "hotkey")?;
                let rao_amount = amount_field(event.field_at(1), "amount")?;
                Ok(StakeEntry::Incomplete(LegacyStakeLeg {
                    kind,
                    hotkey: self.format_address(&hotkey),
                    owner: self.owner_of(&hotkey).await?,
                    rao_amount,
                    block_number,
                }))
            }
            (StakeShape::Complete, EdgeKind::Move) => {
                let coldkey = account_field(event.field_at(0), "coldkey")?;
                let source_hotkey = account_field(event.field_at(1), "source hotkey")?;
                let destination_hotkey = account_field(event.field_at(3), "destination hotkey")?;
                let evidence = StakeEvidence {
                    block_number,
                    rao_amount: amount_field(event.field_at(5), "amount")?,
                    source_net_uid: Some(net_uid_field(event.field_at(2))?),
                    destination_net_uid: Some(net_uid_field(event.field_at(4))?),
                    alpha_amount: None,
                    delegate_hotkey_source: Some(self.format_address(&source_hotkey)),
                    delegate_hotkey_destination: Some(self.format_address(&destination_hotkey)),
                };
                Ok(StakeEntry::Complete(ChainEvent {
                    coldkey_source: Some(self.owner_of(&source_hotkey).await?),
                    coldkey_destination: Some(self.owner_of(&destination_hotkey).await?),
                    coldkey_owner: Some(self.format_address(&coldkey)),
                    category: EdgeCategory::Staking,
                    kind,
                    evidence: Evidence::Stake(evidence),
                }))
            }
            (StakeShape::Complete, _) => {
                let coldkey = self.format_address(&account_field(event.field_at(0), "coldkey")?);
                let hotkey = account_field(event.field_at(1), "hotkey")?;
                let owner = self.owner_of(&hotkey).await?;
                let mut evidence = StakeEvidence {
                    block_number,
                    rao_amount: amount_field(event.field_at(2), "amount")?,
                    alpha_amount: Some(amount_field(event.field_at(3), "alpha amount")?),
                    ..StakeEvidence::default()
                };
                let net_uid = net_uid_field(event.field_at(4))?;

                let (source, destination) = if kind == EdgeKind::Add {
                    evidence.delegate_hotkey_destination = Some(self.format_address(&hotkey));
                    evidence.destination_net_uid = Some(net_uid);
                    (coldkey, owner)
                } else {
                    evidence.delegate_hotkey_source = Some(self.format_address(&hotkey));
                    evidence.source_net_uid = Some(net_uid);
                    (owner, coldkey)
                };

                Ok(StakeEntry::Complete(ChainEvent {
                    coldkey_source: Some(source),
                    coldkey_destination: Some(destination),
                    coldkey_owner: None,
                    category: EdgeCategory::Staking,
                    kind,
                    evidence: Evidence::Stake(evidence),
                }))
            }
        }
    }

    async fn owner_of(&self, hotkey: &AccountBytes) -> Result<String> {
        if let Some(owner) = self.owner_cache.get(hotkey) {
            return Ok(owner);
        }

        let owner = {
            let _permit = self.owner_limiter.acquire().await?;
            self.owners.resolve_owner(hotkey).await?
        };
        self.owner_cache.insert(*hotkey, owner.clone());
        Ok(owner)
    }

    fn format_address(&self, bytes: &AccountBytes) -> String {
        if let Some(address) = self.addresses.get(bytes) {
            return address;
        }
        let address = format_account(bytes);
        self.addresses.insert(*bytes, address.clone());
        address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::owner::ChainOwnerLookup;
    use crate::testing::{account, event, test_client, MockTransport};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StaticOwners {
        owners: HashMap<AccountBytes, AccountBytes>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OwnerLookup for StaticOwners {
        async fn resolve_owner(&self, hotkey: &AccountBytes) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.owners
                .get(hotkey)
                .map(format_account)
                .context("unknown hotkey")
        }
    }

    fn decoder_with(owners: &[(u8, u8)]) -> (Arc<StaticOwners>, EventDecoder) {
        let lookup = Arc::new(StaticOwners {
            owners: owners.iter().map(|(h, o)| (account(*h), account(*o))).collect(),
            ..StaticOwners::default()
        });
        let decoder = EventDecoder::new(lookup.clone(), DecoderSettings::default());
        (lookup, decoder)
    }

    fn addr(n: u8) -> String {
        format_account(&account(n))
    }

    fn acc(n: u8) -> FieldValue {
        FieldValue::Account(account(n))
    }

    fn uint(n: u128) -> FieldValue {
        FieldValue::Uint(n)
    }

    #[tokio::test]
    async fn test_transfer() {
        let (_, decoder) = decoder_with(&[]);
        let events = vec![event("Balances", "Transfer", vec![acc(1), acc(2), uint(500)])];

        let decoded = decoder.decode_block(&events, 100).await;
        assert_eq!(decoded, vec![ChainEvent::transfer(addr(1), addr(2), 500, 100)]);
    }

    #[tokio::test]
    async fn test_legacy_add_with_single_withdraw() {
        let (_, decoder) = decoder_with(&[(10, 20)]);
        let events = vec![
            event("Balances", "Withdraw", vec![acc(1), uint(500)]),
            event("SubtensorModule", "StakeAdded", vec![acc(10), uint(500)]),
        ];

        let decoded = decoder.decode_block(&events, 100).await;
        assert_eq!(decoded.len(), 1);
        let stake = &decoded[0];
        assert_eq!(stake.kind, EdgeKind::Add);
        assert_eq!(stake.coldkey_source, Some(addr(1)));
        assert_eq!(stake.coldkey_destination, Some(addr(20)));
        match &stake.evidence {
            Evidence::Stake(evidence) => {
                assert_eq!(evidence.delegate_hotkey_destination, Some(addr(10)));
                assert_eq!(evidence.rao_amount, 500);
            }
            other => panic!("unexpected evidence {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_legacy_add_with_two_withdraws_is_dropped() {
        let (_, decoder) = decoder_with(&[(10, 20)]);
        let events = vec![
            event("Balances", "Withdraw", vec![acc(1), uint(500)]),
            event("Balances", "Withdraw", vec![acc(2), uint(500)]),
            event("SubtensorModule", "StakeAdded", vec![acc(10), uint(500)]),
        ];

        assert!(decoder.decode_block(&events, 100).await.is_empty());
    }

    #[tokio::test]
    async fn test_legacy_add_without_withdraw_is_dropped() {
        let (_, decoder) = decoder_with(&[(10, 20)]);
        let events = vec![
            // Same amount but the wrong direction, and the right direction with another amount
            event("Balances", "Deposit", vec![acc(1), uint(500)]),
            event("Balances", "Withdraw", vec![acc(2), uint(499)]),
            event("SubtensorModule", "StakeAdded", vec![acc(10), uint(500)]),
        ];

        assert!(decoder.decode_block(&events, 100).await.is_empty());
    }

    #[tokio::test]
    async fn test_legacy_remove_without_deposit_is_dropped() {
        let (_, decoder) = decoder_with(&[(10, 20)]);
        let events = vec![
            event("Balances", "Withdraw", vec![acc(3), uint(700)]),
            event("SubtensorModule", "StakeRemoved", vec![acc(10), uint(700)]),
        ];

        assert!(decoder.decode_block(&events, 100).await.is_empty());
    }

    #[test]
    fn test_reconcile_pairs_each_leg_independently() {
        let leg = |kind, amount| LegacyStakeLeg {
            kind,
            hotkey: addr(10),
            owner: addr(20),
            rao_amount: amount,
            block_number: 100,
        };
        let legacy = vec![leg(EdgeKind::Add, 500), leg(EdgeKind::Remove, 700)];
        let balances = vec![BalanceLeg::Withdraw {
            account: addr(1),
            rao_amount: 500,
        }];

        let events = reconcile(&legacy, &balances);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EdgeKind::Add);
        assert!(reconcile(&legacy, &[]).is_empty());
    }

    #[tokio::test]
    async fn test_legacy_remove_matches_deposit() {
        let (_, decoder) = decoder_with(&[(10, 20)]);
        let events = vec![
            event("Balances", "Deposit", vec![acc(3), uint(700)]),
            event("Balances", "Withdraw", vec![acc(4), uint(700)]),
            event("SubtensorModule", "StakeRemoved", vec![acc(10), uint(700)]),
        ];

        let decoded = decoder.decode_block(&events, 100).await;
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].coldkey_source, Some(addr(20)));
        assert_eq!(decoded[0].coldkey_destination, Some(addr(3)));
    }

    #[tokio::test]
    async fn test_complete_stake_added() {
        let (_, decoder) = decoder_with(&[(10, 20)]);
        let events = vec![event(
            "SubtensorModule",
            "StakeAdded",
            vec![acc(1), acc(10), uint(1_000), uint(900), uint(7)],
        )];

        let decoded = decoder.decode_block(&events, 5_000_000).await;
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].coldkey_source, Some(addr(1)));
        assert_eq!(decoded[0].coldkey_destination, Some(addr(20)));
        match &decoded[0].evidence {
            Evidence::Stake(evidence) => {
                assert_eq!(evidence.alpha_amount, Some(900));
                assert_eq!(evidence.destination_net_uid, Some(7));
                assert_eq!(evidence.source_net_uid, None);
            }
            other => panic!("unexpected evidence {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stake_moved() {
        let (_, decoder) = decoder_with(&[(10, 20), (11, 21)]);
        let events = vec![event(
            "SubtensorModule",
            "StakeMoved",
            vec![acc(1), acc(10), uint(1), acc(11), uint(2), uint(300)],
        )];

        let decoded = decoder.decode_block(&events, 5_000_000).await;
        assert_eq!(decoded.len(), 1);
        let moved = &decoded[0];
        assert_eq!(moved.kind, EdgeKind::Move);
        assert_eq!(moved.coldkey_owner, Some(addr(1)));
        assert_eq!(moved.coldkey_source, Some(addr(20)));
        assert_eq!(moved.coldkey_destination, Some(addr(21)));
    }

    #[tokio::test]
    async fn test_bad_events_are_skipped() {
        let (_, decoder) = decoder_with(&[(10, 20)]);
        let events = vec![
            // Unknown field count
            event("SubtensorModule", "StakeAdded", vec![acc(10), uint(1), uint(2)]),
            // Hotkey without owner
            event("SubtensorModule", "StakeAdded", vec![acc(1), acc(99), uint(1), uint(1), uint(1)]),
            event("Balances", "Transfer", vec![acc(1)]),
            event("Balances", "Transfer", vec![acc(1), acc(2), uint(5)]),
        ];

        let decoded = decoder.decode_block(&events, 100).await;
        assert_eq!(decoded, vec![ChainEvent::transfer(addr(1), addr(2), 5, 100)]);
    }

    #[tokio::test]
    async fn test_owner_lookups_are_memoized() {
        let lookup = Arc::new(StaticOwners {
            owners: [(account(10), account(20))].into_iter().collect(),
            ..StaticOwners::default()
        });
        let settings = DecoderSettings {
            block_chunk_size: 1,
            ..DecoderSettings::default()
        };
        let decoder = EventDecoder::new(lookup.clone(), settings);
        let stake = event(
            "SubtensorModule",
            "StakeAdded",
            vec![acc(1), acc(10), uint(1_000), uint(900), uint(7)],
        );

        let mut blocks = BTreeMap::new();
        blocks.insert(1, vec![stake.clone()]);
        blocks.insert(2, vec![stake]);
        let decoded = decoder.process_event_data(&blocks).await;

        assert_eq!(decoded.len(), 2);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        let again = decoder.process_event_data(&blocks).await;
        assert_eq!(again, decoded);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mixed_cached_blocks_keep_block_order() {
        let (_, decoder) = decoder_with(&[]);
        let transfer = |n: u128| event("Balances", "Transfer", vec![acc(1), acc(2), uint(n)]);

        let mut blocks = BTreeMap::new();
        blocks.insert(2, vec![transfer(2)]);
        decoder.process_event_data(&blocks).await;

        blocks.insert(1, vec![transfer(1)]);
        blocks.insert(3, vec![transfer(3)]);
        let decoded = decoder.process_event_data(&blocks).await;
        let order: Vec<_> = decoded.iter().map(|e| e.evidence.block_number()).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unregistered_hotkey_still_yields_edge() {
        let transport = Arc::new(MockTransport::new());
        let client = Arc::new(test_client(transport));
        let decoder = EventDecoder::new(
            Arc::new(ChainOwnerLookup::new(client)),
            DecoderSettings::default(),
        );
        let events = vec![event(
            "SubtensorModule",
            "StakeAdded",
            vec![acc(1), acc(10), uint(1_000), uint(900), uint(7)],
        )];

        let decoded = decoder.decode_block(&events, 5_000_000).await;
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].coldkey_source, Some(addr(1)));
        assert_eq!(decoded[0].coldkey_destination, Some(format_account(&[0u8; 32])));
    }

    #[test]
    fn test_stake_shape_detection() {
        assert_eq!(StakeShape::detect(EdgeKind::Add, 2), Some(StakeShape::Legacy));
        assert_eq!(StakeShape::detect(EdgeKind::Remove, 5), Some(StakeShape::Complete));
        assert_eq!(StakeShape::detect(EdgeKind::Add, 6), Some(StakeShape::Complete));
        assert_eq!(StakeShape::detect(EdgeKind::Move, 6), Some(StakeShape::Complete));
        assert_eq!(StakeShape::detect(EdgeKind::Move, 2), None);
        assert_eq!(StakeShape::detect(EdgeKind::Add, 3), None);
    }
}
