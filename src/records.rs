//! Miner score records
//!
//! One record is written per scored submission and never modified. Records
//! are stored with postcard, so field order is part of the on-disk format.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identity a score history belongs to: the miner's hotkey and uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MinerKey {
    pub hotkey: String,
    pub uid: u16,
}

impl MinerKey {
    pub fn new(hotkey: impl Into<String>, uid: u16) -> Self {
        Self {
            hotkey: hotkey.into(),
            uid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerScoreRecord {
    pub id: Uuid,
    /// Shared by every record scored in the same validation round
    pub batch_id: Uuid,
    /// Unix epoch milliseconds
    pub created_at: u64,
    pub uid: u16,
    pub coldkey: String,
    pub hotkey: String,
    /// Nodes plus edges of the submitted subgraph
    pub volume: u64,
    pub volume_score: f64,
    pub responsiveness_score: f64,
    pub response_time_seconds: f64,
    pub overall_score: f64,
    pub overall_score_moving_average: f64,
    /// Not computed yet; always `None`
    pub novelty_score: Option<f64>,
    pub validation_passed: bool,
    pub error_message: Option<String>,
}

impl MinerScoreRecord {
    pub fn miner(&self) -> MinerKey {
        MinerKey::new(self.hotkey.clone(), self.uid)
    }
}

/// Current time as unix epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
