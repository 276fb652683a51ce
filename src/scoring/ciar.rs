//! CIAR significance score.
//!
//! ```text
//! score = (certainty * impact * criticality) * age_decay(age) * recency_boost(since_access)
//! ```
//!
//! `age_decay` halves every `age_half_life`; `recency_boost` is
//! `1 + max_recency_boost * 0.5^(since_access / recency_half_life)`, and
//! exactly `1.0` for an item that has never been read back. The scorer holds
//! no clock: callers pass `now`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ScoringConfig;
use crate::error::{Error, Result};
use crate::memory::Fact;

/// Rounding slack tolerated on factor inputs before rejecting them.
const FACTOR_EPSILON: f64 = 1e-9;

/// Score together with its components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CiarScore {
    /// certainty × impact × criticality
    pub base: f64,
    pub age_decay: f64,
    pub recency_boost: f64,
    /// Final score
    pub value: f64,
}

/// Pure CIAR scorer.
#[derive(Debug, Clone, PartialEq)]
pub struct CiarScorer {
    age_half_life_secs: f64,
    recency_half_life_secs: f64,
    max_recency_boost: f64,
}

impl CiarScorer {
    /// Create a scorer from validated configuration.
    pub fn new(config: &ScoringConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            age_half_life_secs: config.age_half_life_secs as f64,
            recency_half_life_secs: config.recency_half_life_secs as f64,
            max_recency_boost: config.max_recency_boost,
        })
    }

    /// Compute the score.
    pub fn score(
        &self,
        certainty: f64,
        impact: f64,
        criticality: f64,
        created_at: DateTime<Utc>,
        last_accessed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<CiarScore> {
        let certainty = check_factor("certainty", certainty)?;
        let impact = check_factor("impact", impact)?;
        let criticality = check_factor("criticality", criticality)?;

        let base = certainty * impact * criticality;
        let age_decay = self.age_decay(elapsed_secs(created_at, now));
        let recency_boost = self.recency_boost(last_accessed_at.map(|at| elapsed_secs(at, now)));

        Ok(CiarScore {
            base,
            age_decay,
            recency_boost,
            value: base * age_decay * recency_boost,
        })
    }

    /// Score a fact using its own significance inputs and timestamps.
    pub fn score_fact(&self, fact: &Fact, now: DateTime<Utc>) -> Result<CiarScore> {
        self.score(
            fact.certainty,
            fact.impact,
            fact.criticality,
            fact.created_at,
            fact.last_accessed_at,
            now,
        )
    }

    /// Exponential half-life decay, 1.0 at age zero.
    pub fn age_decay(&self, age_secs: f64) -> f64 {
        0.5f64.powf(age_secs.max(0.0) / self.age_half_life_secs)
    }

    /// Bounded bonus for recent access; `None` means never accessed.
    pub fn recency_boost(&self, since_access_secs: Option<f64>) -> f64 {
        match since_access_secs {
            Some(secs) => {
                1.0 + self.max_recency_boost
                    * 0.5f64.powf(secs.max(0.0) / self.recency_half_life_secs)
            }
            None => 1.0,
        }
    }

    /// Upper bound of any score this scorer can produce.
    pub fn max_score(&self) -> f64 {
        1.0 + self.max_recency_boost
    }
}

impl Default for CiarScorer {
    fn default() -> Self {
        let config = ScoringConfig::default();
        Self {
            age_half_life_secs: config.age_half_life_secs as f64,
            recency_half_life_secs: config.recency_half_life_secs as f64,
            max_recency_boost: config.max_recency_boost,
        }
    }
}

fn check_factor(field: &'static str, value: f64) -> Result<f64> {
    if !value.is_finite() || value < -FACTOR_EPSILON || value > 1.0 + FACTOR_EPSILON {
        return Err(Error::invalid_score_input(field, value));
    }
    Ok(value.clamp(0.0, 1.0))
}

/// Seconds from `from` to `now`; negative spans (clock skew) count as zero.
fn elapsed_secs(from: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let span = now - from;
    (span.num_milliseconds() as f64 / 1000.0).max(0.0)
}
