//! Miner scoring
//!
//! A submission scores on volume (sigmoid of nodes plus edges) and on
//! responsiveness (hyperbolic decay of response time). The weighted sum is
//! folded into a moving average over the miner's previous scores.

use crate::config::ScoringSettings;
use crate::protocol::Submission;
use crate::records::{now_millis, MinerKey, MinerScoreRecord};
use crate::store::MinerScoreRepository;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Who handed in a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinerIdentity {
    pub uid: u16,
    pub coldkey: String,
    pub hotkey: String,
}

impl MinerIdentity {
    pub fn key(&self) -> MinerKey {
        MinerKey::new(self.hotkey.clone(), self.uid)
    }
}

/// `1 / (1 + e^(-steepness * (volume - inflection)))`
pub fn volume_score(volume: u64, settings: &ScoringSettings) -> f64 {
    let exponent = -settings.steepness * (volume as f64 - settings.inflection_point);
    1.0 / (1.0 + exponent.exp())
}

/// `half / (t + half)`: 1.0 for an instant answer, 0.5 at `half` seconds.
pub fn responsiveness_score(response_time_seconds: f64, settings: &ScoringSettings) -> f64 {
    let half = settings.response_time_half_score;
    half / (response_time_seconds + half)
}

/// Min-max scale scores to `[0, 1]`, rounded to six decimals.
///
/// When every score is equal, each maps to 1.0.
pub fn normalize_scores<K: Clone + Eq + Hash>(scores: &HashMap<K, f64>) -> HashMap<K, f64> {
    if scores.is_empty() {
        return HashMap::new();
    }

    let min = scores.values().copied().fold(f64::INFINITY, f64::min);
    let max = scores.values().copied().fold(f64::NEG_INFINITY, f64::max);

    if min == max {
        return scores.keys().map(|k| (k.clone(), 1.0)).collect();
    }

    scores
        .iter()
        .map(|(k, score)| {
            let scaled = (score - min) / (max - min);
            (k.clone(), (scaled * 1e6).round() / 1e6)
        })
        .collect()
}

/// Turn moving averages into weights for the active miners.
///
/// Averages of miners not in `active` are ignored; the rest are divided by
/// their sum. Nothing to weigh (or an all-zero sum) gives an empty map.
pub fn calculate_weights(averages: &HashMap<MinerKey, f64>, active: &[MinerKey]) -> HashMap<MinerKey, f64> {
    let selected: HashMap<&MinerKey, f64> = active
        .iter()
        .filter_map(|miner| averages.get(miner).map(|avg| (miner, *avg)))
        .collect();

    let total: f64 = selected.values().sum();
    if total <= 0.0 {
        warn!(
            "No positive scores among {} active miners, no weights to set",
            active.len()
        );
        return HashMap::new();
    }

    selected
        .into_iter()
        .map(|(miner, avg)| (miner.clone(), avg / total))
        .collect()
}

pub struct MinerScoring {
    repository: Arc<dyn MinerScoreRepository>,
    settings: ScoringSettings,
}

impl MinerScoring {
    pub fn new(repository: Arc<dyn MinerScoreRepository>, settings: ScoringSettings) -> Self {
        Self {
            repository,
            settings,
        }
    }

    pub fn repository(&self) -> &Arc<dyn MinerScoreRepository> {
        &self.repository
    }

    /// Score one submission.
    ///
    /// The moving average covers the `window - 1` previous overall scores of
    /// the miner plus this one, always divided by `window`. The record is
    /// returned, not stored.
    pub async fn score(
        &self,
        miner: &MinerIdentity,
        submission: &Submission,
        response_time_seconds: f64,
        batch_id: Uuid,
        moving_average_window: usize,
    ) -> Result<MinerScoreRecord> {
        if moving_average_window == 0 {
            anyhow::bail!("Moving average window must be at least 1");
        }

        let previous = self
            .repository
            .find_latest_overall_scores(&miner.key(), moving_average_window - 1)
            .await
            .with_context(|| format!("Failed to load previous scores of uid {}", miner.uid))?;
        let previous_sum: f64 = previous.iter().sum();

        let mut record = MinerScoreRecord {
            id: Uuid::new_v4(),
            batch_id,
            created_at: now_millis(),
            uid: miner.uid,
            coldkey: miner.coldkey.clone(),
            hotkey: miner.hotkey.clone(),
            volume: 0,
            volume_score: 0.0,
            responsiveness_score: 0.0,
            response_time_seconds,
            overall_score: 0.0,
            overall_score_moving_average: previous_sum / moving_average_window as f64,
            novelty_score: None,
            validation_passed: false,
            error_message: None,
        };

        match submission {
            Submission::Error(error) => {
                warn!("Zero score recorded for uid {}: {}", miner.uid, error.message);
                record.error_message = Some(error.message.clone());
            }
            Submission::Graph(payload) => {
                let volume = payload.volume() as u64;
                let volume_score = volume_score(volume, &self.settings);
                let responsiveness_score = responsiveness_score(response_time_seconds, &self.settings);
                let overall = volume_score * self.settings.volume_weight
                    + responsiveness_score * self.settings.responsiveness_weight;

                record.volume = volume;
                record.volume_score = volume_score;
                record.responsiveness_score = responsiveness_score;
                record.overall_score = overall;
                record.overall_score_moving_average =
                    (previous_sum + overall) / moving_average_window as f64;
                record.validation_passed = true;

                info!(
                    "Scored uid {}: volume {} overall {:.6} moving average {:.6}",
                    miner.uid, volume, overall, record.overall_score_moving_average
                );
            }
        }

        Ok(record)
    }

    /// Score with the configured window and store the record.
    pub async fn score_and_record(
        &self,
        miner: &MinerIdentity,
        submission: &Submission,
        response_time_seconds: f64,
        batch_id: Uuid,
    ) -> Result<MinerScoreRecord> {
        let record = self
            .score(
                miner,
                submission,
                response_time_seconds,
                batch_id,
                self.settings.moving_average_window,
            )
            .await?;
        self.repository
            .add(&record)
            .await
            .context("Failed to store score record")?;
        Ok(record)
    }

    /// Weights of the active miners from their latest moving averages.
    pub async fn weights(&self, active: &[MinerKey]) -> Result<HashMap<MinerKey, f64>> {
        let averages = self
            .repository
            .find_last_average_overall_scores()
            .await
            .context("Failed to load moving averages")?;
        Ok(calculate_weights(&averages, active))
    }
}
