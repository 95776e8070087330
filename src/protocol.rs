//! Graph payload types
//!
//! [`ChainEvent`] is what the decoder produces: a loosely typed edge
//! candidate whose accounts may still be unknown. [`Edge`] is the checked
//! form exchanged between peers inside a [`GraphPayload`].

use crate::types::BlockNumber;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeCategory {
    Balance,
    Staking,
}

impl fmt::Display for EdgeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeCategory::Balance => f.write_str("balance"),
            EdgeCategory::Staking => f.write_str("staking"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Transfer,
    Add,
    Remove,
    Move,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferEvidence {
    pub rao_amount: u64,
    pub block_number: BlockNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StakeEvidence {
    pub block_number: BlockNumber,
    pub rao_amount: u64,
    #[serde(default)]
    pub destination_net_uid: Option<u16>,
    #[serde(default)]
    pub source_net_uid: Option<u16>,
    #[serde(default)]
    pub alpha_amount: Option<u64>,
    #[serde(default)]
    pub delegate_hotkey_source: Option<String>,
    #[serde(default)]
    pub delegate_hotkey_destination: Option<String>,
}

impl StakeEvidence {
    /// Check the stake invariants.
    ///
    /// Every stake names at least one delegate hotkey, and from
    /// `subnet_upgrade_block` on at least one net uid.
    pub fn validate(&self, subnet_upgrade_block: BlockNumber) -> Result<(), EdgeError> {
        if self.block_number >= subnet_upgrade_block
            && self.destination_net_uid.is_none()
            && self.source_net_uid.is_none()
        {
            return Err(EdgeError::MissingNetUid {
                block_number: self.block_number,
                subnet_upgrade_block,
            });
        }
        if self.delegate_hotkey_source.is_none() && self.delegate_hotkey_destination.is_none() {
            return Err(EdgeError::MissingDelegateHotkey {
                block_number: self.block_number,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Evidence {
    Transfer(TransferEvidence),
    Stake(StakeEvidence),
}

impl Evidence {
    pub fn rao_amount(&self) -> u64 {
        match self {
            Evidence::Transfer(e) => e.rao_amount,
            Evidence::Stake(e) => e.rao_amount,
        }
    }

    pub fn block_number(&self) -> BlockNumber {
        match self {
            Evidence::Transfer(e) => e.block_number,
            Evidence::Stake(e) => e.block_number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EdgeError {
    #[error("Either delegate_hotkey_source or delegate_hotkey_destination must be provided (block {block_number})")]
    MissingDelegateHotkey { block_number: BlockNumber },
    #[error("Either destination_net_uid or source_net_uid must be provided from block {subnet_upgrade_block} (block {block_number})")]
    MissingNetUid {
        block_number: BlockNumber,
        subnet_upgrade_block: BlockNumber,
    },
    #[error("Edge is missing its {0}")]
    MissingAccount(&'static str),
    #[error("Evidence does not fit a {0} edge")]
    EvidenceMismatch(EdgeCategory),
}

/// Structural identity of an edge: two edges with the same key are duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey {
    pub source: Option<String>,
    pub destination: Option<String>,
    pub category: EdgeCategory,
    pub kind: EdgeKind,
    pub rao_amount: u64,
    pub block_number: BlockNumber,
}

/// A decoded transfer or stake, before its invariants are checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainEvent {
    pub coldkey_source: Option<String>,
    pub coldkey_destination: Option<String>,
    pub coldkey_owner: Option<String>,
    pub category: EdgeCategory,
    pub kind: EdgeKind,
    pub evidence: Evidence,
}

impl ChainEvent {
    pub fn transfer(source: String, destination: String, rao_amount: u64, block_number: BlockNumber) -> Self {
        Self {
            coldkey_source: Some(source),
            coldkey_destination: Some(destination),
            coldkey_owner: None,
            category: EdgeCategory::Balance,
            kind: EdgeKind::Transfer,
            evidence: Evidence::Transfer(TransferEvidence {
                rao_amount,
                block_number,
            }),
        }
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            source: self.coldkey_source.clone(),
            destination: self.coldkey_destination.clone(),
            category: self.category,
            kind: self.kind,
            rao_amount: self.evidence.rao_amount(),
            block_number: self.evidence.block_number(),
        }
    }
}

impl From<&Edge> for ChainEvent {
    fn from(edge: &Edge) -> Self {
        Self {
            coldkey_source: Some(edge.coldkey_source.clone()),
            coldkey_destination: Some(edge.coldkey_destination.clone()),
            coldkey_owner: edge.coldkey_owner.clone(),
            category: edge.category,
            kind: edge.kind,
            evidence: edge.evidence.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Edge {
    pub coldkey_source: String,
    pub coldkey_destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coldkey_owner: Option<String>,
    pub category: EdgeCategory,
    #[serde(rename = "type")]
    pub kind: EdgeKind,
    pub evidence: Evidence,
}

impl Edge {
    /// Build a checked edge from a decoded event.
    pub fn from_event(event: &ChainEvent, subnet_upgrade_block: BlockNumber) -> Result<Self, EdgeError> {
        let coldkey_source = event
            .coldkey_source
            .clone()
            .ok_or(EdgeError::MissingAccount("coldkey_source"))?;
        let coldkey_destination = event
            .coldkey_destination
            .clone()
            .ok_or(EdgeError::MissingAccount("coldkey_destination"))?;

        match (&event.category, &event.evidence) {
            (EdgeCategory::Balance, Evidence::Transfer(_)) => {}
            (EdgeCategory::Staking, Evidence::Stake(stake)) => stake.validate(subnet_upgrade_block)?,
            (category, _) => return Err(EdgeError::EvidenceMismatch(*category)),
        }

        Ok(Self {
            coldkey_source,
            coldkey_destination,
            // Owners only exist on stake moves
            coldkey_owner: match event.category {
                EdgeCategory::Balance => None,
                EdgeCategory::Staking => event.coldkey_owner.clone(),
            },
            category: event.category,
            kind: event.kind,
            evidence: event.evidence.clone(),
        })
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            source: Some(self.coldkey_source.clone()),
            destination: Some(self.coldkey_destination.clone()),
            category: self.category,
            kind: self.kind,
            rao_amount: self.evidence.rao_amount(),
            block_number: self.evidence.block_number(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub origin: String,
}

impl Node {
    pub fn wallet(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: "wallet".to_string(),
            origin: "bittensor".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphPayload {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphPayload {
    /// Size of the payload as scored: nodes plus edges.
    pub fn volume(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }
}

/// Outcome of a submission that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// What a peer handed in, after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Graph(GraphPayload),
    Error(ErrorPayload),
}

impl From<Result<GraphPayload, ErrorPayload>> for Submission {
    fn from(result: Result<GraphPayload, ErrorPayload>) -> Self {
        match result {
            Ok(payload) => Submission::Graph(payload),
            Err(error) => Submission::Error(error),
        }
    }
}
