//! Subgraph assembly
//!
//! A subgraph is everything reachable from a target account through the
//! transfers and stakes decoded from a window of blocks around a target
//! block. The traversal is a plain breadth-first search over an undirected
//! adjacency index; it is bounded only by the window.

use crate::cache::SharedCache;
use crate::config::SubgraphSettings;
use crate::decoder::EventDecoder;
use crate::fetcher::EventFetcher;
use crate::protocol::{ChainEvent, Edge, EdgeKey, GraphPayload, Node};
use crate::types::BlockNumber;
use anyhow::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One side of an undirected connection in the adjacency index.
#[derive(Debug, Clone, Copy)]
pub struct Connection<'a> {
    pub neighbor: &'a str,
    pub event: &'a ChainEvent,
}

pub type Adjacency<'a> = HashMap<&'a str, Vec<Connection<'a>>>;

/// Inclusive block range searched for a subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockWindow {
    pub start: BlockNumber,
    pub end: BlockNumber,
}

impl BlockWindow {
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn blocks(&self) -> Vec<BlockNumber> {
        (self.start..=self.end).collect()
    }
}

/// Index events by account.
///
/// Each event links its source with its destination and with its owner,
/// in both directions. Self links and events without a source are ignored.
pub fn build_adjacency(events: &[ChainEvent]) -> Adjacency<'_> {
    let start = Instant::now();
    let mut adjacency: Adjacency<'_> = HashMap::new();

    for event in events {
        let Some(source) = event.coldkey_source.as_deref() else {
            continue;
        };

        for other in [event.coldkey_destination.as_deref(), event.coldkey_owner.as_deref()]
            .into_iter()
            .flatten()
        {
            if other == source {
                continue;
            }
            adjacency.entry(source).or_default().push(Connection {
                neighbor: other,
                event,
            });
            adjacency.entry(other).or_default().push(Connection {
                neighbor: source,
                event,
            });
        }
    }

    debug!(
        "Adjacency index with {} accounts built in {:.2?}",
        adjacency.len(),
        start.elapsed()
    );
    adjacency
}

/// Breadth-first walk from `target`, collecting every account and edge met.
///
/// The target node is always present. Edges are deduplicated by [`EdgeKey`];
/// edges that fail validation are skipped but still lead to their neighbor.
pub fn traverse(adjacency: &Adjacency<'_>, target: &str, subnet_upgrade_block: BlockNumber) -> GraphPayload {
    let mut payload = GraphPayload::default();
    let mut seen_nodes: HashSet<&str> = HashSet::new();
    let mut seen_edges: HashSet<EdgeKey> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();

    payload.nodes.push(Node::wallet(target));
    seen_nodes.insert(target);
    queue.push_back(target);

    while let Some(current) = queue.pop_front() {
        let Some(connections) = adjacency.get(current) else {
            continue;
        };

        for connection in connections {
            if seen_edges.insert(connection.event.key()) {
                match Edge::from_event(connection.event, subnet_upgrade_block) {
                    Ok(edge) => payload.edges.push(edge),
                    Err(e) => warn!("Skipping edge: {}", e),
                }
            }

            if seen_nodes.insert(connection.neighbor) {
                payload.nodes.push(Node::wallet(connection.neighbor));
                queue.push_back(connection.neighbor);
            }
        }
    }

    payload
}

pub struct SubgraphBuilder {
    fetcher: Arc<EventFetcher>,
    decoder: Arc<EventDecoder>,
    settings: SubgraphSettings,
    by_window: SharedCache<(String, BlockWindow), GraphPayload>,
    by_target: SharedCache<(String, BlockNumber), GraphPayload>,
}

impl SubgraphBuilder {
    pub fn new(fetcher: Arc<EventFetcher>, decoder: Arc<EventDecoder>, settings: SubgraphSettings) -> Self {
        // Evict in chunks of ten whatever the ceiling
        let by_window = SharedCache::with_chunk(settings.subgraph_cache_size, 10);
        let by_target = SharedCache::with_chunk(settings.subgraph_cache_size, 10);
        Self {
            fetcher,
            decoder,
            settings,
            by_window,
            by_target,
        }
    }

    /// `[max(target - past, lower), min(target + future, head)]`
    pub async fn generate_block_window(
        &self,
        target_block: BlockNumber,
        lower_block_limit: BlockNumber,
    ) -> Result<BlockWindow> {
        let head = self.fetcher.current_block().await?;
        let window = BlockWindow {
            start: target_block
                .saturating_sub(self.settings.max_past_events)
                .max(lower_block_limit),
            end: target_block
                .saturating_add(self.settings.max_future_events)
                .min(head),
        };
        info!(
            "Block window for target block {}: {}..={} (head {})",
            target_block, window.start, window.end, head
        );
        Ok(window)
    }

    /// Build the subgraph of `target` from events already decoded for `window`.
    pub fn build_subgraph(&self, events: &[ChainEvent], target: &str, window: BlockWindow) -> GraphPayload {
        let key = (target.to_string(), window);
        if let Some(cached) = self.by_window.get(&key) {
            debug!("Using cached subgraph for {} over {:?}", target, window);
            return cached;
        }

        let start = Instant::now();
        let adjacency = build_adjacency(events);
        let subgraph = traverse(&adjacency, target, self.settings.subnet_upgrade_block);
        info!(
            "Subgraph of volume {} for {} built in {:.2?}",
            subgraph.volume(),
            target,
            start.elapsed()
        );

        self.by_window.insert(key, subgraph.clone());
        subgraph
    }

    /// Window → fetch → decode → subgraph.
    pub async fn run(&self, target: &str, target_block: BlockNumber) -> Result<GraphPayload> {
        let key = (target.to_string(), target_block);
        if let Some(cached) = self.by_target.get(&key) {
            info!("Using cached subgraph for {} at block {}", target, target_block);
            return Ok(cached);
        }

        let start = Instant::now();
        let window = self
            .generate_block_window(target_block, self.settings.lower_block_limit)
            .await?;

        let subgraph = if window.is_empty() {
            warn!(
                "Empty block window for target block {}, returning the target alone",
                target_block
            );
            GraphPayload {
                nodes: vec![Node::wallet(target)],
                edges: Vec::new(),
            }
        } else {
            let raw = self
                .fetcher
                .fetch_all_events(&window.blocks(), self.fetcher.batch_size())
                .await?;
            let events = self.decoder.process_event_data(&raw).await;
            self.build_subgraph(&events, target, window)
        };

        self.by_target.insert(key, subgraph.clone());
        info!(
            "Total subgraph generation for {} took {:.2?}",
            target,
            start.elapsed()
        );
        Ok(subgraph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::format_account;
    use crate::config::{DecoderSettings, FetcherSettings, SUBNET_UPGRADE_BLOCK};
    use crate::owner::ChainOwnerLookup;
    use crate::protocol::{EdgeCategory, EdgeKind, Evidence, StakeEvidence};
    use crate::testing::{account, event, test_client, MockTransport};
    use crate::types::FieldValue;
    use std::collections::BTreeSet;

    fn transfer(src: &str, dst: &str, amount: u64, block: BlockNumber) -> ChainEvent {
        ChainEvent::transfer(src.into(), dst.into(), amount, block)
    }

    fn node_ids(payload: &GraphPayload) -> BTreeSet<String> {
        payload.nodes.iter().map(|n| n.id.clone()).collect()
    }

    fn edge_keys(payload: &GraphPayload) -> BTreeSet<EdgeKey> {
        payload.edges.iter().map(Edge::key).collect()
    }

    #[test]
    fn test_adjacency_skips_self_links() {
        let events = vec![transfer("a", "a", 1, 1), transfer("a", "b", 1, 1)];
        let adjacency = build_adjacency(&events);

        assert_eq!(adjacency["a"].len(), 1);
        assert_eq!(adjacency["b"][0].neighbor, "a");
    }

    #[test]
    fn test_adjacency_links_owner() {
        let moved = ChainEvent {
            coldkey_source: Some("a".into()),
            coldkey_destination: Some("b".into()),
            coldkey_owner: Some("o".into()),
            category: EdgeCategory::Staking,
            kind: EdgeKind::Move,
            evidence: Evidence::Stake(StakeEvidence {
                block_number: 10,
                rao_amount: 5,
                delegate_hotkey_source: Some("h".into()),
                ..StakeEvidence::default()
            }),
        };
        let events = vec![moved];
        let adjacency = build_adjacency(&events);

        assert_eq!(adjacency["a"].len(), 2);
        assert_eq!(adjacency["o"][0].neighbor, "a");
    }

    #[test]
    fn test_traverse_collects_component() {
        let events = vec![
            transfer("a", "b", 1, 10),
            transfer("b", "c", 2, 11),
            transfer("x", "y", 3, 12),
        ];
        let adjacency = build_adjacency(&events);
        let payload = traverse(&adjacency, "a", SUBNET_UPGRADE_BLOCK);

        assert_eq!(payload.nodes[0].id, "a");
        let expected: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(node_ids(&payload), expected);
        assert_eq!(payload.edges.len(), 2);
    }

    #[test]
    fn test_traverse_is_idempotent() {
        let events = vec![
            transfer("a", "b", 1, 10),
            transfer("b", "a", 1, 10),
            transfer("c", "b", 4, 12),
        ];
        let adjacency = build_adjacency(&events);
        let first = traverse(&adjacency, "b", SUBNET_UPGRADE_BLOCK);
        let second = traverse(&adjacency, "b", SUBNET_UPGRADE_BLOCK);

        assert_eq!(node_ids(&first), node_ids(&second));
        assert_eq!(edge_keys(&first), edge_keys(&second));
    }

    #[test]
    fn test_edge_keys_are_unique() {
        let events = vec![
            transfer("a", "b", 1, 10),
            transfer("a", "b", 1, 10),
            transfer("a", "b", 1, 11),
        ];
        let adjacency = build_adjacency(&events);
        let payload = traverse(&adjacency, "a", SUBNET_UPGRADE_BLOCK);

        assert_eq!(payload.edges.len(), 2);
        assert_eq!(edge_keys(&payload).len(), payload.edges.len());
    }

    #[test]
    fn test_target_without_edges() {
        let adjacency = build_adjacency(&[]);
        let payload = traverse(&adjacency, "lonely", SUBNET_UPGRADE_BLOCK);

        assert_eq!(payload.nodes, vec![Node::wallet("lonely")]);
        assert!(payload.edges.is_empty());
    }

    #[test]
    fn test_invalid_edge_is_skipped_but_neighbor_kept() {
        let bad_stake = ChainEvent {
            coldkey_source: Some("a".into()),
            coldkey_destination: Some("b".into()),
            coldkey_owner: None,
            category: EdgeCategory::Staking,
            kind: EdgeKind::Add,
            // After the upgrade block without a net uid
            evidence: Evidence::Stake(StakeEvidence {
                block_number: SUBNET_UPGRADE_BLOCK + 1,
                rao_amount: 5,
                delegate_hotkey_destination: Some("h".into()),
                ..StakeEvidence::default()
            }),
        };
        let events = vec![bad_stake];
        let adjacency = build_adjacency(&events);
        let payload = traverse(&adjacency, "a", SUBNET_UPGRADE_BLOCK);

        assert!(payload.edges.is_empty());
        assert_eq!(node_ids(&payload).len(), 2);
    }

    fn builder(transport: Arc<MockTransport>, settings: SubgraphSettings) -> SubgraphBuilder {
        let client = Arc::new(test_client(transport));
        let fetcher = Arc::new(EventFetcher::new(client.clone(), FetcherSettings::default()));
        let owners = Arc::new(ChainOwnerLookup::new(client));
        let decoder = Arc::new(EventDecoder::new(owners, DecoderSettings::default()));
        SubgraphBuilder::new(fetcher, decoder, settings)
    }

    fn small_window() -> SubgraphSettings {
        SubgraphSettings {
            max_future_events: 5,
            max_past_events: 5,
            lower_block_limit: 0,
            ..SubgraphSettings::default()
        }
    }

    #[tokio::test]
    async fn test_block_window_is_clamped() {
        let transport = Arc::new(MockTransport::new());
        transport.set_head(102);
        let builder = builder(transport, small_window());

        let window = builder.generate_block_window(100, 97).await.unwrap();
        assert_eq!(window, BlockWindow { start: 97, end: 102 });

        let window = builder.generate_block_window(50, 0).await.unwrap();
        assert_eq!(window, BlockWindow { start: 45, end: 55 });
    }

    #[tokio::test]
    async fn test_run_end_to_end() {
        let transport = Arc::new(MockTransport::new());
        transport.set_head(1_000);
        let send = |from: u8, to: u8, amount: u128| {
            event(
                "Balances",
                "Transfer",
                vec![
                    FieldValue::Account(account(from)),
                    FieldValue::Account(account(to)),
                    FieldValue::Uint(amount),
                ],
            )
        };
        transport.add_block_with_events(99, &[send(1, 2, 10)]);
        transport.add_block_with_events(101, &[send(2, 3, 20), send(4, 5, 30)]);
        // Outside the window
        transport.add_block_with_events(200, &[send(1, 6, 40)]);

        let builder = builder(transport.clone(), small_window());
        let target = format_account(&account(1));
        let payload = builder.run(&target, 100).await.unwrap();

        let expected: BTreeSet<String> = [1u8, 2, 3].iter().map(|n| format_account(&account(*n))).collect();
        assert_eq!(node_ids(&payload), expected);
        assert_eq!(payload.edges.len(), 2);
        assert_eq!(payload.volume(), 5);

        let calls = transport.data_calls();
        let again = builder.run(&target, 100).await.unwrap();
        assert_eq!(again, payload);
        assert_eq!(transport.data_calls(), calls);
    }
}
