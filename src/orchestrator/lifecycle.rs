//! Lifecycle orchestration: leases, batch entry points and cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::LifecycleConfig;
use crate::engine::{
    BatchResult, CancelToken, ConsolidationEngine, DistillationEngine, EngineKind, FactClusterer,
    PatternMiner, PromotionEngine,
};
use crate::error::{ItemError, Result};
use crate::memory::{
    Episode, Fact, FactCandidate, FactId, GraphIndex, InMemoryGraphIndex, InMemoryTierStore,
    InMemoryVectorIndex, KnowledgeDocument, Scope, Tier, TierStore, TimeWindow, VectorIndex,
};
use crate::provider::{ReasoningProvider, ResilientProvider};
use crate::synthesis::{CacheStats, ConflictPolicy, KnowledgeSynthesizer, SynthesisResult};

use super::lease::LeaseTable;

/// Store handles for all tiers and both episode indexes.
#[derive(Clone)]
pub struct MemoryStores {
    pub l1: Arc<dyn TierStore<Fact>>,
    pub l2: Arc<dyn TierStore<Fact>>,
    pub l3: Arc<dyn TierStore<Episode>>,
    pub l4: Arc<dyn TierStore<KnowledgeDocument>>,
    pub vector: Arc<dyn VectorIndex>,
    pub graph: Arc<dyn GraphIndex>,
}

impl MemoryStores {
    /// In-process stores for every tier.
    pub fn in_memory() -> Self {
        Self {
            l1: Arc::new(InMemoryTierStore::new(Tier::ActiveContext)),
            l2: Arc::new(InMemoryTierStore::new(Tier::Working)),
            l3: Arc::new(InMemoryTierStore::new(Tier::Episodic)),
            l4: Arc::new(InMemoryTierStore::new(Tier::Semantic)),
            vector: Arc::new(InMemoryVectorIndex::new()),
            graph: Arc::new(InMemoryGraphIndex::new()),
        }
    }
}

/// Outcome of one promotion → consolidation → distillation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub scope: Scope,
    pub promotion: Option<BatchResult>,
    pub consolidation: Option<BatchResult>,
    pub distillation: Option<BatchResult>,
    /// Stages that could not start, keyed by engine name
    pub errors: Vec<ItemError>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    fn new(scope: Scope, started_at: DateTime<Utc>) -> Self {
        Self {
            scope,
            promotion: None,
            consolidation: None,
            distillation: None,
            errors: Vec::new(),
            cancelled: false,
            started_at,
            finished_at: started_at,
        }
    }

    fn batches(&self) -> impl Iterator<Item = &BatchResult> {
        [&self.promotion, &self.consolidation, &self.distillation]
            .into_iter()
            .flatten()
    }

    /// Whether any consolidation left an index half-written.
    pub fn has_inconsistency(&self) -> bool {
        self.batches().any(|b| b.has_inconsistency())
    }

    /// All stages ran and no unit failed.
    pub fn is_clean(&self) -> bool {
        !self.cancelled && self.errors.is_empty() && self.batches().all(|b| b.failed == 0)
    }
}

/// Entry point for lifecycle batches and synthesis queries.
///
/// At most one batch per engine and scope runs at a time; a second
/// request is rejected with [`Error::BatchInProgress`](crate::error::Error::BatchInProgress).
pub struct LifecycleOrchestrator {
    stores: MemoryStores,
    provider: Arc<dyn ReasoningProvider>,
    promotion: PromotionEngine,
    consolidation: ConsolidationEngine,
    distillation: DistillationEngine,
    synthesizer: KnowledgeSynthesizer,
    leases: LeaseTable,
    config: LifecycleConfig,
    clock: Arc<dyn Clock>,
}

impl LifecycleOrchestrator {
    /// Build all engines. The provider is wrapped with retry, timeout and
    /// circuit breaking from `config.provider`.
    pub fn new(
        stores: MemoryStores,
        provider: Arc<dyn ReasoningProvider>,
        config: LifecycleConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let provider: Arc<dyn ReasoningProvider> =
            Arc::new(ResilientProvider::new(provider, config.provider.clone())?);

        let promotion = PromotionEngine::new(
            stores.l1.clone(),
            stores.l2.clone(),
            &config.scoring,
            config.promotion.clone(),
            clock.clone(),
        )?;
        let consolidation = ConsolidationEngine::new(
            stores.l2.clone(),
            stores.l3.clone(),
            stores.vector.clone(),
            stores.graph.clone(),
            provider.clone(),
            config.consolidation.clone(),
            clock.clone(),
        )?;
        let distillation = DistillationEngine::new(
            stores.l3.clone(),
            stores.l4.clone(),
            provider.clone(),
            config.distillation.clone(),
            clock.clone(),
        )?;
        let synthesizer = KnowledgeSynthesizer::new(
            stores.l3.clone(),
            stores.l4.clone(),
            stores.vector.clone(),
            stores.graph.clone(),
            provider.clone(),
            config.synthesis.clone(),
            clock.clone(),
        )?;

        info!("Lifecycle orchestrator ready");
        Ok(Self {
            stores,
            provider,
            promotion,
            consolidation,
            distillation,
            synthesizer,
            leases: LeaseTable::new(config.orchestrator.lease_ttl(), clock.clone()),
            config,
            clock,
        })
    }

    pub fn with_clusterer(mut self, clusterer: Arc<dyn FactClusterer>) -> Self {
        self.consolidation = self.consolidation.with_clusterer(clusterer);
        self
    }

    pub fn with_pattern_miner(mut self, miner: Arc<dyn PatternMiner>) -> Self {
        self.distillation = self.distillation.with_miner(miner);
        self
    }

    pub fn with_conflict_policy(mut self, policy: Arc<dyn ConflictPolicy>) -> Self {
        self.synthesizer = self.synthesizer.with_policy(policy);
        self
    }

    pub fn stores(&self) -> &MemoryStores {
        &self.stores
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn synthesizer(&self) -> &KnowledgeSynthesizer {
        &self.synthesizer
    }

    /// Write one observation into L1.
    pub async fn capture(&self, scope: &Scope, candidate: FactCandidate) -> Result<Fact> {
        self.promotion.capture(scope, candidate).await
    }

    /// Extract facts from free text and capture each of them.
    pub async fn ingest_text(&self, scope: &Scope, text: &str) -> Result<Vec<Fact>> {
        let candidates = self.provider.extract_facts(text).await?;
        let mut facts = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            facts.push(self.promotion.capture(scope, candidate).await?);
        }
        debug!(scope = %scope, count = facts.len(), "Ingested text");
        Ok(facts)
    }

    /// Record a read of a fact in L1 and, when promoted, in L2.
    pub async fn touch_fact(&self, id: &FactId) -> Result<()> {
        let now = self.clock.now();
        let l1 = self.stores.l1.record_access(id, now).await;
        let l2 = self.stores.l2.record_access(id, now).await;
        match (l1, l2) {
            (Err(e), _) if !e.is_not_found() => Err(e.into()),
            (_, Err(e)) if !e.is_not_found() => Err(e.into()),
            // Unknown in both tiers
            (Err(e), Err(_)) => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub async fn run_promotion_batch(&self, scope: &Scope) -> Result<BatchResult> {
        self.run_promotion_batch_with_cancel(scope, &CancelToken::new())
            .await
    }

    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn run_promotion_batch_with_cancel(
        &self,
        scope: &Scope,
        cancel: &CancelToken,
    ) -> Result<BatchResult> {
        let batch = self.leased(EngineKind::Promotion, scope, cancel)?;
        let result = self.promotion.run_batch(scope, &batch).await;
        report_lost_lease(EngineKind::Promotion, scope, &batch);
        result
    }

    pub async fn run_consolidation_batch(
        &self,
        scope: &Scope,
        window: &TimeWindow,
    ) -> Result<BatchResult> {
        self.run_consolidation_batch_with_cancel(scope, window, &CancelToken::new())
            .await
    }

    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn run_consolidation_batch_with_cancel(
        &self,
        scope: &Scope,
        window: &TimeWindow,
        cancel: &CancelToken,
    ) -> Result<BatchResult> {
        let batch = self.leased(EngineKind::Consolidation, scope, cancel)?;
        let result = self.consolidation.run_batch(scope, window, &batch).await?;
        report_lost_lease(EngineKind::Consolidation, scope, &batch);
        if result.has_inconsistency() {
            error!(
                scope = %scope,
                failed = result.failed,
                "Consolidation left inconsistent index state"
            );
        }
        self.after_write(scope, &result).await;
        Ok(result)
    }

    pub async fn run_distillation_batch(&self, scope: &Scope) -> Result<BatchResult> {
        self.run_distillation_batch_with_cancel(scope, &CancelToken::new())
            .await
    }

    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn run_distillation_batch_with_cancel(
        &self,
        scope: &Scope,
        cancel: &CancelToken,
    ) -> Result<BatchResult> {
        let batch = self.leased(EngineKind::Distillation, scope, cancel)?;
        let result = self.distillation.run_batch(scope, &batch).await?;
        report_lost_lease(EngineKind::Distillation, scope, &batch);
        self.after_write(scope, &result).await;
        Ok(result)
    }

    /// Take the `(engine, scope)` lease and bind it to a token for one batch.
    ///
    /// The engine renews the lease at every checkpoint and stops if it was
    /// taken over. The lease is released when the token is dropped.
    fn leased(
        &self,
        engine: EngineKind,
        scope: &Scope,
        cancel: &CancelToken,
    ) -> Result<CancelToken> {
        let lease = self.leases.try_acquire(engine, scope)?;
        Ok(cancel.with_keep_alive(Arc::new(lease)))
    }

    async fn after_write(&self, scope: &Scope, result: &BatchResult) {
        if result.written.is_empty() {
            return;
        }
        let dropped = self.synthesizer.cache().invalidate_scope(scope).await;
        if dropped > 0 {
            debug!(scope = %scope, dropped, "Invalidated cached syntheses");
        }
    }

    /// Consolidation window ending now.
    pub fn default_window(&self) -> TimeWindow {
        TimeWindow::ending_at(self.clock.now(), self.config.consolidation.window())
    }

    /// Answer a query from L3 and L4.
    ///
    /// With `reconsolidate_on_conflict` set, a fresh conflict triggers a
    /// consolidation of the default window unless one is already running.
    pub async fn synthesize(&self, query: &str, scope: &Scope) -> Result<SynthesisResult> {
        let result = self.synthesizer.synthesize(query, scope).await?;
        if result.conflict
            && !result.from_cache
            && self.config.orchestrator.reconsolidate_on_conflict
        {
            if self.leases.is_held(EngineKind::Consolidation, scope) {
                debug!(scope = %scope, "Consolidation already running; skipping reconsolidation");
            } else {
                match self
                    .run_consolidation_batch(scope, &self.default_window())
                    .await
                {
                    Ok(batch) => info!(
                        scope = %scope,
                        succeeded = batch.succeeded,
                        "Reconsolidated after conflict"
                    ),
                    Err(e) => warn!(scope = %scope, error = %e, "Reconsolidation failed"),
                }
            }
        }
        Ok(result)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.synthesizer.cache().stats().await
    }

    /// Run promotion, consolidation and distillation for one scope.
    ///
    /// A stage that cannot start is recorded and the next stage still runs.
    /// Cancellation stops the cycle before the next stage.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn run_cycle(&self, scope: &Scope, cancel: &CancelToken) -> CycleReport {
        let mut report = CycleReport::new(scope.clone(), self.clock.now());

        for engine in [
            EngineKind::Promotion,
            EngineKind::Consolidation,
            EngineKind::Distillation,
        ] {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let outcome = match engine {
                EngineKind::Promotion => self.run_promotion_batch_with_cancel(scope, cancel).await,
                EngineKind::Consolidation => {
                    let window = self.default_window();
                    self.run_consolidation_batch_with_cancel(scope, &window, cancel)
                        .await
                }
                EngineKind::Distillation => {
                    self.run_distillation_batch_with_cancel(scope, cancel).await
                }
            };
            match outcome {
                Ok(batch) => {
                    report.cancelled |= batch.cancelled;
                    let slot = match engine {
                        EngineKind::Promotion => &mut report.promotion,
                        EngineKind::Consolidation => &mut report.consolidation,
                        EngineKind::Distillation => &mut report.distillation,
                    };
                    *slot = Some(batch);
                }
                Err(e) => {
                    warn!(engine = %engine, error = %e, "Cycle stage did not run");
                    report.errors.push(e.to_item_error(engine));
                }
            }
        }

        report.finished_at = self.clock.now();
        info!(
            cancelled = report.cancelled,
            stage_errors = report.errors.len(),
            clean = report.is_clean(),
            "Lifecycle cycle finished"
        );
        report
    }

    /// Run cycles for `scopes` every `cycle_interval_secs` until cancelled.
    ///
    /// Scopes are cycled concurrently. The task returns the number of
    /// completed rounds.
    #[cfg(feature = "tokio-runtime")]
    pub fn spawn_scheduler(
        self: Arc<Self>,
        scopes: Vec<Scope>,
        cancel: CancelToken,
    ) -> tokio::task::JoinHandle<u64> {
        let interval = std::time::Duration::from_secs(self.config.orchestrator.cycle_interval_secs);
        tokio::spawn(async move {
            let mut rounds = 0;
            while !cancel.is_cancelled() {
                let reports =
                    futures::future::join_all(scopes.iter().map(|s| self.run_cycle(s, &cancel)))
                        .await;
                rounds += 1;
                for report in reports.iter().filter(|r| r.has_inconsistency()) {
                    error!(scope = %report.scope, "Scheduled cycle left inconsistent index state");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!(rounds, "Scheduler stopped");
            rounds
        })
    }
}

fn report_lost_lease(engine: EngineKind, scope: &Scope, batch: &CancelToken) {
    if batch.keep_alive_lost() {
        error!(
            engine = %engine,
            scope = %scope,
            "Batch lease was taken over; batch stopped early"
        );
    }
}
