//! Configuration for the lifecycle engines.
//!
//! All values are supplied externally and validated when an engine is
//! constructed; invalid values fail fast with `Error::InvalidConfiguration`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::memory::{Scope, SearchWeights};

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(Error::invalid_config(format!(
            "{} must be in [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

fn check_positive(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(Error::invalid_config(format!("{} must be > 0", name)));
    }
    Ok(())
}

/// Longest duration any setting may hold: 100 years.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 3600;

fn check_secs(name: &str, value: u64) -> Result<()> {
    if value > MAX_DURATION_SECS {
        return Err(Error::invalid_config(format!(
            "{} must be <= {} seconds, got {}",
            name, MAX_DURATION_SECS, value
        )));
    }
    Ok(())
}

fn check_ms(name: &str, value: u64) -> Result<()> {
    if value > MAX_DURATION_SECS * 1000 {
        return Err(Error::invalid_config(format!(
            "{} must be <= {} milliseconds, got {}",
            name,
            MAX_DURATION_SECS * 1000,
            value
        )));
    }
    Ok(())
}

fn check_positive_secs(name: &str, value: u64) -> Result<()> {
    check_positive(name, value)?;
    check_secs(name, value)
}

/// Seconds as a signed duration, saturating at [`MAX_DURATION_SECS`].
fn seconds(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(value.min(MAX_DURATION_SECS) as i64)
}

/// CIAR scoring parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Age after which the age decay factor halves
    pub age_half_life_secs: u64,
    /// Time since last access after which the recency bonus halves
    pub recency_half_life_secs: u64,
    /// Upper bound of the recency bonus (boost is in `[1, 1 + max]`)
    pub max_recency_boost: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            age_half_life_secs: 7 * 24 * 3600,
            recency_half_life_secs: 24 * 3600,
            max_recency_boost: 0.2,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        check_positive_secs("scoring.age_half_life_secs", self.age_half_life_secs)?;
        check_positive_secs("scoring.recency_half_life_secs", self.recency_half_life_secs)?;
        check_unit("scoring.max_recency_boost", self.max_recency_boost)
    }
}

/// L1 → L2 promotion parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// Significance threshold θ_p applied when no scope override exists
    pub default_threshold: f64,
    /// Per-scope θ_p overrides
    pub scope_thresholds: HashMap<String, f64>,
    /// Maximum facts pulled from L1 per batch
    pub max_batch_size: usize,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.4,
            scope_thresholds: HashMap::new(),
            max_batch_size: 500,
        }
    }
}

impl PromotionConfig {
    /// Threshold for a scope.
    pub fn threshold_for(&self, scope: &Scope) -> f64 {
        self.scope_thresholds
            .get(scope.as_str())
            .copied()
            .unwrap_or(self.default_threshold)
    }

    pub fn with_scope_threshold(mut self, scope: impl Into<String>, threshold: f64) -> Self {
        self.scope_thresholds.insert(scope.into(), threshold);
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_unit("promotion.default_threshold", self.default_threshold)?;
        for (scope, threshold) in &self.scope_thresholds {
            check_unit(&format!("promotion.scope_thresholds[{}]", scope), *threshold)?;
        }
        check_positive("promotion.max_batch_size", self.max_batch_size as u64)
    }
}

/// L2 → L3 consolidation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Default window length for scheduled consolidation
    pub window_secs: u64,
    /// Facts further apart than this start a new cluster
    pub max_cluster_gap_secs: u64,
    /// Maximum facts included in a summarization prompt
    pub max_prompt_facts: usize,
    /// Maximum characters per fact in a summarization prompt
    pub max_fact_chars: usize,
    /// Attempts for the vector + graph write of one episode
    pub index_retry_budget: u32,
    /// Attempts for closing each member fact
    pub supersession_retry_budget: u32,
    /// Clusters processed concurrently
    pub max_concurrency: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            window_secs: 24 * 3600,
            max_cluster_gap_secs: 3600,
            max_prompt_facts: 32,
            max_fact_chars: 500,
            index_retry_budget: 3,
            supersession_retry_budget: 3,
            max_concurrency: 4,
        }
    }
}

impl ConsolidationConfig {
    pub fn window(&self) -> chrono::Duration {
        seconds(self.window_secs)
    }

    pub fn max_cluster_gap(&self) -> chrono::Duration {
        seconds(self.max_cluster_gap_secs)
    }

    pub fn validate(&self) -> Result<()> {
        check_positive_secs("consolidation.window_secs", self.window_secs)?;
        check_positive_secs("consolidation.max_cluster_gap_secs", self.max_cluster_gap_secs)?;
        check_positive("consolidation.max_prompt_facts", self.max_prompt_facts as u64)?;
        check_positive("consolidation.max_fact_chars", self.max_fact_chars as u64)?;
        check_positive(
            "consolidation.index_retry_budget",
            self.index_retry_budget as u64,
        )?;
        check_positive(
            "consolidation.supersession_retry_budget",
            self.supersession_retry_budget as u64,
        )?;
        check_positive("consolidation.max_concurrency", self.max_concurrency as u64)
    }
}

/// L3 → L4 distillation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillationConfig {
    /// Episodes older than this are eligible
    pub min_episode_age_secs: u64,
    /// Token similarity at or above which a candidate merges into an existing document
    pub dedup_threshold: f64,
    /// Minimum episodes a pattern must span
    pub min_support: usize,
    /// Synthesis calls in flight at once
    pub max_concurrency: usize,
    /// Maximum episodes considered per batch
    pub max_episodes_per_batch: usize,
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            min_episode_age_secs: 24 * 3600,
            dedup_threshold: 0.6,
            min_support: 2,
            max_concurrency: 2,
            max_episodes_per_batch: 200,
        }
    }
}

impl DistillationConfig {
    pub fn min_episode_age(&self) -> chrono::Duration {
        seconds(self.min_episode_age_secs)
    }

    pub fn validate(&self) -> Result<()> {
        check_secs("distillation.min_episode_age_secs", self.min_episode_age_secs)?;
        if !self.dedup_threshold.is_finite()
            || self.dedup_threshold <= 0.0
            || self.dedup_threshold > 1.0
        {
            return Err(Error::invalid_config(format!(
                "distillation.dedup_threshold must be in (0, 1], got {}",
                self.dedup_threshold
            )));
        }
        check_positive("distillation.min_support", self.min_support as u64)?;
        check_positive("distillation.max_concurrency", self.max_concurrency as u64)?;
        check_positive(
            "distillation.max_episodes_per_batch",
            self.max_episodes_per_batch as u64,
        )
    }
}

/// Query-time synthesis parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Lifetime of a cached synthesis
    pub cache_ttl_secs: u64,
    /// Maximum cached entries (oldest evicted first)
    pub cache_capacity: usize,
    /// Candidates pulled per tier
    pub max_candidates: usize,
    pub search_weights: SearchWeights,
    /// Age after which the freshness signal halves
    pub freshness_half_life_secs: u64,
    /// Character budget for the assembled context block
    pub context_max_chars: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            cache_capacity: 1024,
            max_candidates: 10,
            search_weights: SearchWeights::default(),
            freshness_half_life_secs: 7 * 24 * 3600,
            context_max_chars: 8000,
        }
    }
}

impl SynthesisConfig {
    pub fn cache_ttl(&self) -> chrono::Duration {
        seconds(self.cache_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        check_positive_secs("synthesis.cache_ttl_secs", self.cache_ttl_secs)?;
        check_positive("synthesis.cache_capacity", self.cache_capacity as u64)?;
        check_positive("synthesis.max_candidates", self.max_candidates as u64)?;
        check_positive_secs(
            "synthesis.freshness_half_life_secs",
            self.freshness_half_life_secs,
        )?;
        check_positive("synthesis.context_max_chars", self.context_max_chars as u64)
    }
}

/// Retry, timeout and circuit-breaker policy for reasoning provider calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Deadline for a single call
    pub call_timeout_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failures that open the breaker
    pub breaker_failure_threshold: u32,
    /// How long the breaker stays open
    pub breaker_cooldown_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 30_000,
        }
    }
}

impl ProviderConfig {
    pub fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.call_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        check_positive("provider.call_timeout_ms", self.call_timeout_ms)?;
        check_ms("provider.call_timeout_ms", self.call_timeout_ms)?;
        check_ms("provider.max_backoff_ms", self.max_backoff_ms)?;
        check_ms("provider.breaker_cooldown_ms", self.breaker_cooldown_ms)?;
        check_positive(
            "provider.breaker_failure_threshold",
            self.breaker_failure_threshold as u64,
        )?;
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(Error::invalid_config(
                "provider.max_backoff_ms must be >= provider.initial_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// Scheduling and lease parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Lease lifetime; an expired lease can be taken over
    pub lease_ttl_secs: u64,
    /// Pause between scheduled cycles
    pub cycle_interval_secs: u64,
    /// Run a consolidation when a synthesis surfaces a conflict
    pub reconsolidate_on_conflict: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 600,
            cycle_interval_secs: 300,
            reconsolidate_on_conflict: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn lease_ttl(&self) -> chrono::Duration {
        seconds(self.lease_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        check_positive_secs("orchestrator.lease_ttl_secs", self.lease_ttl_secs)?;
        check_positive_secs("orchestrator.cycle_interval_secs", self.cycle_interval_secs)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub scoring: ScoringConfig,
    pub promotion: PromotionConfig,
    pub consolidation: ConsolidationConfig,
    pub distillation: DistillationConfig,
    pub synthesis: SynthesisConfig,
    pub provider: ProviderConfig,
    pub orchestrator: OrchestratorConfig,
}

impl LifecycleConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            // SearchWeights validation surfaces as a serde error
            Error::invalid_config(e.to_string())
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.scoring.validate()?;
        self.promotion.validate()?;
        self.consolidation.validate()?;
        self.distillation.validate()?;
        self.synthesis.validate()?;
        self.provider.validate()?;
        self.orchestrator.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults_are_valid() {
        LifecycleConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = LifecycleConfig::from_json_str(
            r#"{
                "promotion": { "default_threshold": 0.3, "scope_thresholds": { "ops": 0.6 } },
                "synthesis": { "cache_ttl_secs": 60 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.promotion.threshold_for(&Scope::new("ops")), 0.6);
        assert_eq!(config.promotion.threshold_for(&Scope::new("dev")), 0.3);
        assert_eq!(config.synthesis.cache_ttl_secs, 60);
        assert_eq!(config.scoring, ScoringConfig::default());
    }

    #[test]
    fn test_invalid_values_fail_fast() {
        let cases = [
            r#"{ "promotion": { "default_threshold": 1.5 } }"#,
            r#"{ "scoring": { "age_half_life_secs": 0 } }"#,
            r#"{ "consolidation": { "index_retry_budget": 0 } }"#,
            r#"{ "distillation": { "dedup_threshold": 0.0 } }"#,
            r#"{ "synthesis": { "search_weights": { "vector": 1, "graph": 1, "recency": 0 } } }"#,
            r#"{ "provider": { "initial_backoff_ms": 10, "max_backoff_ms": 5 } }"#,
            r#"{ "promotion": { "scope_thresholds": { "x": -0.1 } } }"#,
            r#"{ "orchestrator": { "lease_ttl_secs": 1000000000000000 } }"#,
            r#"{ "consolidation": { "window_secs": 18446744073709551615 } }"#,
            r#"{ "distillation": { "min_episode_age_secs": 18446744073709551615 } }"#,
            r#"{ "provider": { "breaker_cooldown_ms": 18446744073709551615 } }"#,
        ];
        for json in cases {
            let err = LifecycleConfig::from_json_str(json).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfiguration, "{}", json);
        }
    }

    #[test]
    fn test_longest_allowed_durations_stay_positive() {
        let mut config = LifecycleConfig::default();
        config.orchestrator.lease_ttl_secs = MAX_DURATION_SECS;
        config.consolidation.window_secs = MAX_DURATION_SECS;
        config.validate().unwrap();
        assert_eq!(
            config.orchestrator.lease_ttl(),
            chrono::Duration::seconds(MAX_DURATION_SECS as i64)
        );
        assert!(config.consolidation.window() > chrono::Duration::zero());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifecycle.json");
        std::fs::write(&path, r#"{ "orchestrator": { "lease_ttl_secs": 30 } }"#).unwrap();

        let config = LifecycleConfig::load(&path).unwrap();
        assert_eq!(config.orchestrator.lease_ttl_secs, 30);

        let missing = LifecycleConfig::load(dir.path().join("nope.json")).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::InvalidConfiguration);
    }
}
