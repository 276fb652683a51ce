//! L1 → L2 promotion.
//!
//! Captured facts whose CIAR score reaches the scope's threshold are copied
//! into working memory and flagged as promoted in active context. The L2
//! write comes first, so a fact present in L2 is always treated as already
//! promoted and re-running a batch never duplicates work.
//!
//! Facts that miss the threshold are stamped with `scored_at`. Each batch
//! takes facts that still need scoring first and then the least recently
//! scored ones, so a backlog of low-significance facts cannot starve newer
//! captures.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::{PromotionConfig, ScoringConfig};
use crate::error::{Error, Result};
use crate::memory::{query_all, Fact, FactCandidate, ItemQuery, Scope, TierStore};
use crate::scoring::CiarScorer;

use super::batch::{BatchResult, EngineKind};
use super::cancel::CancelToken;

/// What happened to a single fact.
#[derive(Debug, Clone, PartialEq)]
pub enum PromotionOutcome {
    Promoted { score: f64 },
    /// Already in L2; nothing written
    AlreadyPromoted,
    BelowThreshold { score: f64, threshold: f64 },
    /// Significance inputs out of range; the fact stays in L1
    InvalidInput { field: &'static str, value: f64 },
}

/// Promotion engine.
pub struct PromotionEngine {
    l1: Arc<dyn TierStore<Fact>>,
    l2: Arc<dyn TierStore<Fact>>,
    scorer: CiarScorer,
    config: PromotionConfig,
    clock: Arc<dyn Clock>,
}

impl PromotionEngine {
    pub fn new(
        l1: Arc<dyn TierStore<Fact>>,
        l2: Arc<dyn TierStore<Fact>>,
        scoring: &ScoringConfig,
        config: PromotionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            l1,
            l2,
            scorer: CiarScorer::new(scoring)?,
            config,
            clock,
        })
    }

    pub fn scorer(&self) -> &CiarScorer {
        &self.scorer
    }

    /// Write a new fact into active context.
    pub async fn capture(&self, scope: &Scope, candidate: FactCandidate) -> Result<Fact> {
        let fact = Fact::capture(scope.clone(), candidate, self.clock.now());
        self.l1.put(&fact).await?;
        debug!(fact_id = %fact.id, scope = %scope, "Captured fact");
        Ok(fact)
    }

    /// Promote the scope's unpromoted, current L1 facts.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn run_batch(&self, scope: &Scope, cancel: &CancelToken) -> Result<BatchResult> {
        let query = ItemQuery::new().scope(scope).current_only();
        let mut facts: Vec<Fact> = query_all(self.l1.as_ref(), &query)
            .await?
            .into_iter()
            .filter(|f| !f.is_promoted())
            .collect();
        facts.sort_by(|a, b| {
            b.needs_scoring()
                .cmp(&a.needs_scoring())
                .then_with(|| a.scored_at.cmp(&b.scored_at))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        facts.truncate(self.config.max_batch_size);

        Ok(self.promote(scope, &facts, cancel).await)
    }

    /// Promote an explicit batch of facts. Each fact succeeds or fails on its own.
    pub async fn promote(
        &self,
        scope: &Scope,
        facts: &[Fact],
        cancel: &CancelToken,
    ) -> BatchResult {
        let threshold = self.config.threshold_for(scope);
        let mut result = BatchResult::new(EngineKind::Promotion, scope.clone(), self.clock.now());
        info!(
            "Starting promotion of {} facts (threshold {:.3})",
            facts.len(),
            threshold
        );

        for (idx, fact) in facts.iter().enumerate() {
            if !cancel.checkpoint() {
                result.record_cancelled(facts.len() - idx);
                info!("Promotion cancelled with {} facts remaining", facts.len() - idx);
                break;
            }

            let now = self.clock.now();
            match self.promote_fact(fact, threshold, now).await {
                Ok(PromotionOutcome::Promoted { .. }) => {
                    result.record_success(Some(fact.id.to_string()))
                }
                Ok(PromotionOutcome::AlreadyPromoted) => result.record_success(None),
                Ok(PromotionOutcome::BelowThreshold { .. }) => result.record_skip(),
                Ok(PromotionOutcome::InvalidInput { field, value }) => {
                    warn!(
                        fact_id = %fact.id,
                        field,
                        value,
                        "Skipping fact with invalid significance input"
                    );
                    result.record_skip();
                }
                Err(e) => {
                    warn!(fact_id = %fact.id, error = %e, "Promotion failed");
                    result.record_failure(&fact.id, &e);
                }
            }
        }

        let result = result.finish(self.clock.now());
        info!(
            attempted = result.attempted,
            promoted = result.written.len(),
            skipped = result.skipped,
            failed = result.failed,
            "Promotion finished"
        );
        result
    }

    /// Promote one fact.
    pub async fn promote_fact(
        &self,
        fact: &Fact,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Result<PromotionOutcome> {
        if fact.is_promoted() {
            return Ok(PromotionOutcome::AlreadyPromoted);
        }

        match self.l2.get(&fact.id).await {
            Ok(existing) => {
                // L2 write landed but the L1 flag did not
                let mut flagged = fact.clone();
                flagged.promoted_at = existing.promoted_at.or(Some(now));
                flagged.ciar_score = existing.ciar_score;
                self.l1.put(&flagged).await?;
                return Ok(PromotionOutcome::AlreadyPromoted);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let score = match self.scorer.score_fact(fact, now) {
            Ok(score) => score.value,
            Err(Error::InvalidScoreInput { field, value }) => {
                self.mark_scored(fact, None, now).await;
                return Ok(PromotionOutcome::InvalidInput { field, value });
            }
            Err(e) => return Err(e),
        };

        if score < threshold {
            debug!(fact_id = %fact.id, score, threshold, "Below promotion threshold");
            self.mark_scored(fact, Some(score), now).await;
            return Ok(PromotionOutcome::BelowThreshold { score, threshold });
        }

        let mut promoted = fact.clone();
        promoted.ciar_score = Some(score);
        promoted.promoted_at = Some(now);

        self.l2.put(&promoted).await?;
        self.l1.put(&promoted).await?;
        debug!(fact_id = %fact.id, score, "Promoted fact");
        Ok(PromotionOutcome::Promoted { score })
    }

    /// Stamp a fact that stays in L1 so later batches look at newer facts first.
    async fn mark_scored(&self, fact: &Fact, score: Option<f64>, now: DateTime<Utc>) {
        let mut scored = fact.clone();
        scored.ciar_score = score.or(fact.ciar_score);
        scored.scored_at = Some(now);
        if let Err(e) = self.l1.put(&scored).await {
            // Only affects batch ordering
            warn!(fact_id = %fact.id, error = %e, "Could not record score time");
        }
    }
}
