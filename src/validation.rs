//! Validation of subgraphs handed in by peers
//!
//! Checks run in order and the first failure wins:
//!
//! 1. structure: known fields, no duplicate nodes or edges, valid evidence
//! 2. at least two nodes, and the target on some edge
//! 3. connectivity (owners are joined to both ends of their edge)
//! 4. every edge block lies in `[lower_block_limit, head]`
//! 5. every edge matches an event decoded from the chain; edges in blocks
//!    that yielded no events are not held against the peer

use crate::config::SubgraphSettings;
use crate::decoder::EventDecoder;
use crate::fetcher::EventFetcher;
use crate::protocol::{
    ChainEvent, Edge, EdgeCategory, EdgeError, EdgeKey, EdgeKind, ErrorPayload, Evidence, GraphPayload, Node,
};
use crate::types::BlockNumber;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Empty/Null Payload received.")]
    Empty,
    #[error("Payload validation error: {0}")]
    Malformed(String),
    #[error("Duplicate node detected: {0}")]
    DuplicateNode(String),
    #[error("Duplicate edge detected: {0:?}")]
    DuplicateEdge(EdgeKey),
    #[error("Edge is missing the 'evidence' field.")]
    MissingEvidence,
    #[error(transparent)]
    InvalidEdge(#[from] EdgeError),
    #[error("Only single node provided.")]
    SingleNode,
    #[error("Target not found in payload.")]
    TargetNotFound,
    #[error("Edge refers to a node not in the payload")]
    UnknownNode,
    #[error("Edge owner refers to a node not in the payload")]
    UnknownOwner,
    #[error("Graph is not fully connected.")]
    Disconnected,
    #[error("Found {} invalid block(s) outside the allowed range [{min}, {max}]: {blocks:?}", .blocks.len())]
    BlocksOutOfRange {
        min: BlockNumber,
        max: BlockNumber,
        blocks: Vec<BlockNumber>,
    },
    #[error("{0} edges not found in on-chain events.")]
    EdgesNotFound(usize),
    #[error("Chain data unavailable: {0}")]
    Chain(String),
}

#[derive(Deserialize)]
struct RawPayload {
    nodes: Vec<Value>,
    edges: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEdge {
    coldkey_source: String,
    coldkey_destination: String,
    #[serde(default)]
    coldkey_owner: Option<String>,
    category: EdgeCategory,
    #[serde(rename = "type")]
    kind: EdgeKind,
    #[serde(default)]
    evidence: Option<Value>,
}

fn malformed(e: serde_json::Error) -> ValidationError {
    ValidationError::Malformed(e.to_string())
}

fn parse_edge(raw: RawEdge, subnet_upgrade_block: BlockNumber) -> Result<Edge, ValidationError> {
    let evidence = raw.evidence.ok_or(ValidationError::MissingEvidence)?;
    let evidence = match raw.category {
        EdgeCategory::Balance => Evidence::Transfer(serde_json::from_value(evidence).map_err(malformed)?),
        EdgeCategory::Staking => Evidence::Stake(serde_json::from_value(evidence).map_err(malformed)?),
    };
    let event = ChainEvent {
        coldkey_source: Some(raw.coldkey_source),
        coldkey_destination: Some(raw.coldkey_destination),
        coldkey_owner: raw.coldkey_owner,
        category: raw.category,
        kind: raw.kind,
        evidence,
    };
    Ok(Edge::from_event(&event, subnet_upgrade_block)?)
}

/// Parse an untrusted payload, rejecting duplicates and malformed entries.
pub fn parse_payload(payload: &Value, subnet_upgrade_block: BlockNumber) -> Result<GraphPayload, ValidationError> {
    let is_empty = match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if is_empty {
        return Err(ValidationError::Empty);
    }

    let raw: RawPayload = serde_json::from_value(payload.clone()).map_err(malformed)?;

    let mut nodes = Vec::with_capacity(raw.nodes.len());
    let mut seen_nodes = HashSet::new();
    for value in raw.nodes {
        let node: Node = serde_json::from_value(value).map_err(malformed)?;
        if !seen_nodes.insert(node.id.clone()) {
            return Err(ValidationError::DuplicateNode(node.id));
        }
        nodes.push(node);
    }

    let mut edges = Vec::with_capacity(raw.edges.len());
    let mut seen_edges = HashSet::new();
    for value in raw.edges {
        let edge = parse_edge(serde_json::from_value(value).map_err(malformed)?, subnet_upgrade_block)?;
        let key = edge.key();
        if !seen_edges.insert(key.clone()) {
            return Err(ValidationError::DuplicateEdge(key));
        }
        edges.push(edge);
    }

    Ok(GraphPayload { nodes, edges })
}

/// The target must be the source, destination or owner of some edge.
pub fn verify_target(payload: &GraphPayload, target: &str) -> Result<(), ValidationError> {
    if payload.nodes.len() < 2 {
        return Err(ValidationError::SingleNode);
    }

    let found = payload.edges.iter().any(|edge| {
        edge.coldkey_source == target
            || edge.coldkey_destination == target
            || edge.coldkey_owner.as_deref() == Some(target)
    });
    if found {
        Ok(())
    } else {
        Err(ValidationError::TargetNotFound)
    }
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Path compression
        let mut current = x;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a != root_b {
            self.parent[root_b] = root_a;
        }
    }
}

/// Every node must be connected to every other through the edges.
pub fn verify_connected(payload: &GraphPayload) -> Result<(), ValidationError> {
    let index: HashMap<&str, usize> = payload
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.id.as_str(), i))
        .collect();
    let mut sets = DisjointSet::new(payload.nodes.len());

    for edge in &payload.edges {
        let (Some(&src), Some(&dst)) = (
            index.get(edge.coldkey_source.as_str()),
            index.get(edge.coldkey_destination.as_str()),
        ) else {
            return Err(ValidationError::UnknownNode);
        };
        sets.union(src, dst);

        if let Some(owner) = &edge.coldkey_owner {
            let &own = index.get(owner.as_str()).ok_or(ValidationError::UnknownOwner)?;
            sets.union(src, own);
            sets.union(dst, own);
        }
    }

    let roots: HashSet<usize> = (0..payload.nodes.len()).map(|i| sets.find(i)).collect();
    if roots.len() == 1 {
        Ok(())
    } else {
        Err(ValidationError::Disconnected)
    }
}

pub struct PayloadValidator {
    fetcher: Arc<EventFetcher>,
    decoder: Arc<EventDecoder>,
    settings: SubgraphSettings,
}

impl PayloadValidator {
    pub fn new(fetcher: Arc<EventFetcher>, decoder: Arc<EventDecoder>, settings: SubgraphSettings) -> Self {
        Self {
            fetcher,
            decoder,
            settings,
        }
    }

    /// Validate the payload a miner returned for `target`.
    ///
    /// Failures become an [`ErrorPayload`] whose message starts with `Error: `.
    pub async fn validate(&self, uid: u16, payload: &Value, target: &str) -> Result<GraphPayload, ErrorPayload> {
        let start = Instant::now();
        info!("Starting validation for uid {}", uid);

        match self.check(payload, target).await {
            Ok(graph) => {
                info!(
                    "Validation finished for uid {} in {:.2?}",
                    uid,
                    start.elapsed()
                );
                Ok(graph)
            }
            Err(e) => {
                error!("Validation error for uid {}: {}", uid, e);
                Err(ErrorPayload::new(format!("Error: {}", e)))
            }
        }
    }

    async fn check(&self, payload: &Value, target: &str) -> Result<GraphPayload, ValidationError> {
        let graph = parse_payload(payload, self.settings.subnet_upgrade_block)?;
        verify_target(&graph, target)?;
        verify_connected(&graph)?;
        self.verify_edge_data(&graph).await?;
        Ok(graph)
    }

    async fn verify_block_ranges(&self, blocks: &[BlockNumber]) -> Result<(), ValidationError> {
        let head = self
            .fetcher
            .current_block()
            .await
            .map_err(|e| ValidationError::Chain(format!("{:#}", e)))?;
        let min = self.settings.lower_block_limit;

        let invalid: Vec<BlockNumber> = blocks
            .iter()
            .copied()
            .filter(|b| !(min..=head).contains(b))
            .collect();
        if invalid.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::BlocksOutOfRange {
                min,
                max: head,
                blocks: invalid,
            })
        }
    }

    async fn verify_edge_data(&self, graph: &GraphPayload) -> Result<(), ValidationError> {
        let blocks: Vec<BlockNumber> = graph.edges.iter().map(|e| e.evidence.block_number()).collect();
        self.verify_block_ranges(&blocks).await?;

        let raw = self
            .fetcher
            .fetch_all_events(&blocks, self.fetcher.batch_size())
            .await
            .map_err(|e| ValidationError::Chain(format!("{:#}", e)))?;
        let events = self.decoder.process_event_data(&raw).await;

        let decoded_blocks: BTreeSet<BlockNumber> = events.iter().map(|e| e.evidence.block_number()).collect();
        let on_chain: HashSet<&ChainEvent> = events.iter().collect();

        let missing = graph
            .edges
            .iter()
            .filter(|edge| decoded_blocks.contains(&edge.evidence.block_number()))
            .filter(|edge| !on_chain.contains(&ChainEvent::from(*edge)))
            .count();
        if missing > 0 {
            return Err(ValidationError::EdgesNotFound(missing));
        }

        debug!("All {} edges matched on-chain events", graph.edges.len());
        Ok(())
    }
}
