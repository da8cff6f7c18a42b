//! Decay scoring for long-term records
//!
//! `decay_score = 0.6 * exp(-age_days / half_life_days) + 0.4 * min(1, access_count / 10)`
//!
//! Records fall below `min_score` and get evicted by the daily scan; any
//! recall hit refreshes `last_access_at` and bumps `access_count`, which the
//! next scan folds back into the score.

use chrono::{DateTime, Utc};

use crate::types::LtmMetadata;

/// Pure decay calculator
#[derive(Debug, Clone, Copy)]
pub struct DecayCalculator {
    half_life_days: i64,
    min_score: f64,
}

impl DecayCalculator {
    pub fn new(half_life_days: i64, min_score: f64) -> Self {
        Self {
            half_life_days: half_life_days.max(1),
            min_score,
        }
    }

    /// Score as of now
    pub fn score(&self, last_access_at: DateTime<Utc>, access_count: i64) -> f64 {
        self.score_at(Utc::now(), last_access_at, access_count)
    }

    /// Score at an explicit reference time
    pub fn score_at(
        &self,
        now: DateTime<Utc>,
        last_access_at: DateTime<Utc>,
        access_count: i64,
    ) -> f64 {
        let age_days = (now - last_access_at).num_seconds() as f64 / 86_400.0;
        let time_decay = (-age_days / self.half_life_days as f64).exp();
        let frequency_bonus = (access_count as f64 / 10.0).min(1.0);
        0.6 * time_decay + 0.4 * frequency_bonus
    }

    pub fn should_evict(&self, decay_score: f64) -> bool {
        decay_score < self.min_score
    }

    /// Recompute a record's decay score in place
    pub fn update(&self, metadata: &mut LtmMetadata) {
        metadata.decay_score = self.score(metadata.last_access_at, metadata.access_count);
    }
}

/// Register a recall hit
pub fn refresh_access(metadata: &mut LtmMetadata) {
    metadata.last_access_at = Utc::now();
    metadata.access_count += 1;
}
