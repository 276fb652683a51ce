//! End-to-end lifecycle scenarios driven through the orchestrator.

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::{Clock, ManualClock};
use crate::config::LifecycleConfig;
use crate::engine::{BatchStatus, CancelToken, EngineKind};
use crate::error::ErrorKind;
use crate::memory::{
    FactCandidate, FactId, GraphIndex, InMemoryVectorIndex, ItemQuery, Scope, SourceRef,
    TierStore, Triple, VectorIndex,
};
use crate::orchestrator::{LifecycleOrchestrator, MemoryStores};
use crate::testing::{FaultyGraphIndex, ProviderOp, ScriptedProvider};

struct Harness {
    orch: LifecycleOrchestrator,
    provider: ScriptedProvider,
    clock: Arc<ManualClock>,
    scope: Scope,
}

fn harness_with(
    stores: MemoryStores,
    provider: ScriptedProvider,
    config: LifecycleConfig,
) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let orch =
        LifecycleOrchestrator::new(stores, Arc::new(provider.clone()), config, clock.clone())
            .unwrap();
    Harness {
        orch,
        provider,
        clock,
        scope: Scope::new("agent-7"),
    }
}

fn harness() -> Harness {
    harness_with(
        MemoryStores::in_memory(),
        ScriptedProvider::new(),
        LifecycleConfig::default(),
    )
}

fn significant(subject: &str, predicate: &str, object: &str) -> FactCandidate {
    FactCandidate::new(format!("{} {} {}", subject, predicate, object))
        .with_triple(Triple::new(subject, predicate, object))
        .with_significance(0.9, 0.8, 0.7)
}

impl Harness {
    async fn promote_and_consolidate(&self) {
        let promoted = self.orch.run_promotion_batch(&self.scope).await.unwrap();
        assert_eq!(promoted.failed, 0);
        let consolidated = self
            .orch
            .run_consolidation_batch(&self.scope, &self.orch.default_window())
            .await
            .unwrap();
        assert_eq!(consolidated.status(), BatchStatus::FullSuccess);
    }
}

#[tokio::test]
async fn fresh_significant_fact_is_promoted_and_decayed_one_is_not() {
    let h = harness();
    let fresh = h
        .orch
        .capture(&h.scope, significant("db", "engine", "postgres"))
        .await
        .unwrap();

    let result = h.orch.run_promotion_batch(&h.scope).await.unwrap();
    assert_eq!(result.succeeded, 1);
    let promoted = h.orch.stores().l2.get(&fresh.id).await.unwrap();
    assert!((promoted.ciar_score.unwrap() - 0.504).abs() < 1e-9);

    let stale = h
        .orch
        .capture(&h.scope, significant("cache", "engine", "redis"))
        .await
        .unwrap();
    // Past one half-life the decay factor drops below 0.5
    h.clock.advance(Duration::days(8));
    let result = h.orch.run_promotion_batch(&h.scope).await.unwrap();
    assert_eq!((result.succeeded, result.skipped), (0, 1));
    assert!(h
        .orch
        .stores()
        .l2
        .get(&stale.id)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn promoting_twice_leaves_working_memory_unchanged() {
    let h = harness();
    let fact = h
        .orch
        .capture(&h.scope, significant("db", "engine", "postgres"))
        .await
        .unwrap();
    h.orch.run_promotion_batch(&h.scope).await.unwrap();
    let once = h.orch.stores().l2.query(&ItemQuery::new()).await.unwrap();

    // Lose the L1 flag so the fact looks unpromoted again
    h.clock.advance(Duration::minutes(1));
    h.orch.stores().l1.put(&fact).await.unwrap();
    let again = h.orch.run_promotion_batch(&h.scope).await.unwrap();
    assert_eq!(again.attempted, 1);
    assert!(again.written.is_empty());

    let twice = h.orch.stores().l2.query(&ItemQuery::new()).await.unwrap();
    assert_eq!(once, twice);
    assert!(h
        .orch
        .stores()
        .l1
        .get(&fact.id)
        .await
        .unwrap()
        .promoted_at
        .is_some());
}

#[tokio::test]
async fn contradictory_facts_surface_as_conflict_with_both_sources() {
    let h = harness();
    let basic = h
        .orch
        .capture(&h.scope, significant("api", "auth", "basic"))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(1));
    let jwt = h
        .orch
        .capture(&h.scope, significant("api", "auth", "jwt"))
        .await
        .unwrap();
    h.promote_and_consolidate().await;

    let result = h.orch.synthesize("api auth", &h.scope).await.unwrap();
    assert!(result.conflict);
    let sources = result.conflict_sources();
    assert!(sources.contains(&SourceRef::Fact(basic.id)));
    assert!(sources.contains(&SourceRef::Fact(jwt.id)));
    assert_eq!(result.conflicts[0].winner.triple.object, "jwt");
}

#[tokio::test]
async fn graph_failure_rolls_back_vector_and_fails_cluster() {
    let vector = Arc::new(InMemoryVectorIndex::new());
    let graph = Arc::new(FaultyGraphIndex::default());
    graph.fail_writes.set(u32::MAX);
    let stores = MemoryStores {
        vector: vector.clone(),
        graph: graph.clone(),
        ..MemoryStores::in_memory()
    };
    let h = harness_with(stores, ScriptedProvider::new(), LifecycleConfig::default());
    h.orch
        .capture(&h.scope, significant("api", "auth", "jwt"))
        .await
        .unwrap();
    h.orch.run_promotion_batch(&h.scope).await.unwrap();

    let result = h
        .orch
        .run_consolidation_batch(&h.scope, &h.orch.default_window())
        .await
        .unwrap();
    assert_eq!(result.status(), BatchStatus::TotalFailure);
    assert_eq!(result.errors[0].kind, ErrorKind::IndexWriteFailed);
    assert!(!result.has_inconsistency());

    assert_eq!(vector.len().await, 0);
    assert_eq!(graph.inner.len().await, 0);
    assert!(h
        .orch
        .stores()
        .l3
        .query(&ItemQuery::new())
        .await
        .unwrap()
        .is_empty());
    // Member facts stay open for the next attempt
    let open = h
        .orch
        .stores()
        .l2
        .query(&ItemQuery::new().current_only())
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
}

#[tokio::test]
async fn every_consolidated_fact_is_closed_and_claimed_once() {
    let h = harness();
    for (s, p, o) in [
        ("api", "auth", "jwt"),
        ("api", "owner", "team-a"),
        ("db", "engine", "postgres"),
        ("queue", "engine", "kafka"),
    ] {
        h.orch.capture(&h.scope, significant(s, p, o)).await.unwrap();
        h.clock.advance(Duration::minutes(2));
    }
    h.promote_and_consolidate().await;

    let episodes = h
        .orch
        .stores()
        .l3
        .query(&ItemQuery::new().current_only())
        .await
        .unwrap();
    assert_eq!(episodes.len(), 3);

    let mut claims: HashMap<FactId, usize> = HashMap::new();
    for episode in &episodes {
        assert!(h.orch.stores().vector.contains(&episode.id).await.unwrap());
        assert!(h.orch.stores().graph.contains(&episode.id).await.unwrap());
        for id in &episode.fact_ids {
            *claims.entry(id.clone()).or_default() += 1;
        }
    }

    let facts = h.orch.stores().l2.query(&ItemQuery::new()).await.unwrap();
    assert_eq!(facts.len(), 4);
    for fact in facts {
        assert!(fact.validity.valid_to.is_some());
        assert!(fact.superseded_by.is_some());
        assert_eq!(claims.get(&fact.id), Some(&1));
    }
}

#[tokio::test]
async fn distilled_documents_cite_existing_episodes() {
    let h = harness();
    h.orch
        .capture(&h.scope, significant("api", "auth", "jwt"))
        .await
        .unwrap();
    h.orch
        .capture(&h.scope, significant("gateway", "fronts", "api"))
        .await
        .unwrap();
    h.orch
        .capture(&h.scope, significant("billing", "runs on", "cron"))
        .await
        .unwrap();
    h.promote_and_consolidate().await;

    h.clock.advance(Duration::days(2));
    let result = h.orch.run_distillation_batch(&h.scope).await.unwrap();
    assert_eq!(result.status(), BatchStatus::FullSuccess);
    assert_eq!(result.succeeded, 1);

    let documents = h.orch.stores().l4.query(&ItemQuery::new()).await.unwrap();
    assert_eq!(documents.len(), 1);
    for document in &documents {
        assert_eq!(document.provenance.len(), 2);
        for id in &document.provenance {
            assert!(h.orch.stores().l3.get(id).await.is_ok());
        }
        assert!(document.tags.contains("api"));
    }
}

#[tokio::test]
async fn requery_after_supersession_returns_updated_answer() {
    let h = harness();
    let t0 = h.clock.now();
    h.orch
        .capture(&h.scope, significant("deploy", "strategy", "canary"))
        .await
        .unwrap();
    h.promote_and_consolidate().await;

    let first = h.orch.synthesize("deploy strategy", &h.scope).await.unwrap();
    assert_eq!(first.accepted[0].triple.object, "canary");
    let cached = h.orch.synthesize("deploy strategy", &h.scope).await.unwrap();
    assert!(cached.from_cache);

    // A correction recorded for the same period supersedes the old episode
    h.clock.advance(Duration::minutes(30));
    h.orch
        .capture(
            &h.scope,
            significant("deploy", "strategy", "blue-green").with_valid_from(t0),
        )
        .await
        .unwrap();
    h.promote_and_consolidate().await;

    let updated = h.orch.synthesize("deploy strategy", &h.scope).await.unwrap();
    assert!(!updated.from_cache);
    assert!(!updated.conflict);
    assert_eq!(updated.accepted[0].triple.object, "blue-green");
    assert_eq!(updated.contributors.len(), 1);
}

#[tokio::test]
async fn closing_a_contributor_directly_invalidates_the_cached_answer() {
    let h = harness();
    h.orch
        .capture(&h.scope, significant("deploy", "strategy", "canary"))
        .await
        .unwrap();
    h.promote_and_consolidate().await;
    let first = h.orch.synthesize("deploy", &h.scope).await.unwrap();
    let SourceRef::Episode(episode_id) = first.contributors[0].clone() else {
        panic!("expected an episode contributor");
    };

    h.clock.advance(Duration::seconds(5));
    h.orch
        .stores()
        .l3
        .mark_superseded(&episode_id, h.clock.now(), None)
        .await
        .unwrap();

    let again = h.orch.synthesize("deploy", &h.scope).await.unwrap();
    assert!(!again.from_cache);
    assert!(again.contributors.is_empty());
    assert_eq!(h.orch.cache_stats().await.invalidations, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_batches_for_one_scope_are_rejected() {
    let h = harness_with(
        MemoryStores::in_memory(),
        ScriptedProvider::new().with_delay(std::time::Duration::from_millis(50)),
        LifecycleConfig::default(),
    );
    h.orch
        .capture(&h.scope, significant("api", "auth", "jwt"))
        .await
        .unwrap();
    h.orch.run_promotion_batch(&h.scope).await.unwrap();

    let window = h.orch.default_window();
    let (first, second) = tokio::join!(
        h.orch.run_consolidation_batch(&h.scope, &window),
        h.orch.run_consolidation_batch(&h.scope, &window)
    );
    assert_eq!(first.unwrap().succeeded, 1);
    assert_eq!(second.unwrap_err().kind(), ErrorKind::BatchInProgress);
    assert!(!h.orch.leases().is_held(EngineKind::Consolidation, &h.scope));
}

#[tokio::test(start_paused = true)]
async fn cancellation_keeps_finished_clusters_and_skips_the_rest() {
    let mut config = LifecycleConfig::default();
    config.consolidation.max_concurrency = 1;
    let h = harness_with(
        MemoryStores::in_memory(),
        ScriptedProvider::new().with_delay(std::time::Duration::from_millis(10)),
        config,
    );
    for subject in ["api", "db", "queue"] {
        h.orch
            .capture(&h.scope, significant(subject, "status", "healthy"))
            .await
            .unwrap();
        h.clock.advance(Duration::minutes(1));
    }
    h.orch.run_promotion_batch(&h.scope).await.unwrap();

    let cancel = CancelToken::new();
    let window = h.orch.default_window();
    let (result, _) = tokio::join!(
        h.orch
            .run_consolidation_batch_with_cancel(&h.scope, &window, &cancel),
        async {
            tokio::time::sleep(std::time::Duration::from_millis(45)).await;
            cancel.cancel();
        }
    );
    let result = result.unwrap();
    assert!(result.cancelled);
    assert_eq!(result.failed, 0);
    assert!(result.not_run >= 1);
    assert_eq!(result.succeeded + result.not_run, 3);
    assert!(h.provider.calls(ProviderOp::Summarize) < 3);

    // Finished clusters are complete; skipped facts stay open
    let episodes = h.orch.stores().l3.query(&ItemQuery::new()).await.unwrap();
    assert_eq!(episodes.len(), result.succeeded);
    for episode in &episodes {
        assert!(h.orch.stores().vector.contains(&episode.id).await.unwrap());
        assert!(h.orch.stores().graph.contains(&episode.id).await.unwrap());
    }
    let open = h
        .orch
        .stores()
        .l2
        .query(&ItemQuery::new().current_only())
        .await
        .unwrap();
    assert_eq!(open.len(), result.not_run);
}

async fn three_topic_harness(lease_ttl_secs: u64) -> Harness {
    let mut config = LifecycleConfig::default();
    config.consolidation.max_concurrency = 1;
    config.orchestrator.lease_ttl_secs = lease_ttl_secs;
    let h = harness_with(
        MemoryStores::in_memory(),
        ScriptedProvider::new().with_delay(std::time::Duration::from_millis(10)),
        config,
    );
    for subject in ["api", "db", "queue"] {
        h.orch
            .capture(&h.scope, significant(subject, "status", "healthy"))
            .await
            .unwrap();
        h.clock.advance(Duration::minutes(1));
    }
    h.orch.run_promotion_batch(&h.scope).await.unwrap();
    h
}

#[tokio::test(start_paused = true)]
async fn long_batch_keeps_its_lease_past_the_original_ttl() {
    let h = three_topic_harness(60).await;
    let window = h.orch.default_window();

    // Each cluster takes 30ms of provider time; the clock jumps 50s twice,
    // so the lease would have lapsed without renewal between clusters.
    let (result, second) = tokio::join!(
        h.orch.run_consolidation_batch(&h.scope, &window),
        async {
            tokio::time::sleep(std::time::Duration::from_millis(15)).await;
            h.clock.advance(Duration::seconds(50));
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            h.clock.advance(Duration::seconds(50));
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            h.orch
                .leases()
                .try_acquire(EngineKind::Consolidation, &h.scope)
                .map(|_| ())
        }
    );

    assert_eq!(second.unwrap_err().kind(), ErrorKind::BatchInProgress);
    let result = result.unwrap();
    assert!(!result.cancelled);
    assert_eq!(result.succeeded, 3);
    assert!(!h.orch.leases().is_held(EngineKind::Consolidation, &h.scope));
}

#[tokio::test(start_paused = true)]
async fn batch_stops_when_its_lease_is_taken_over() {
    let h = three_topic_harness(60).await;
    let window = h.orch.default_window();

    let (result, takeover) = tokio::join!(
        h.orch.run_consolidation_batch(&h.scope, &window),
        async {
            tokio::time::sleep(std::time::Duration::from_millis(15)).await;
            h.clock.advance(Duration::seconds(61));
            h.orch
                .leases()
                .try_acquire(EngineKind::Consolidation, &h.scope)
        }
    );

    let takeover = takeover.unwrap();
    let result = result.unwrap();
    assert!(result.cancelled);
    assert_eq!((result.succeeded, result.not_run), (1, 2));
    assert_eq!(h.provider.calls(ProviderOp::Summarize), 1);

    // The new holder keeps the lease after the stale batch returns
    assert!(h.orch.leases().is_held(EngineKind::Consolidation, &h.scope));
    drop(takeover);
    assert!(!h.orch.leases().is_held(EngineKind::Consolidation, &h.scope));
}

/// Contested `api auth` episode plus one promoted fact still awaiting
/// consolidation. Returns the pending fact's id.
async fn conflict_with_pending_fact(h: &Harness) -> FactId {
    h.orch
        .capture(&h.scope, significant("api", "auth", "basic"))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(1));
    h.orch
        .capture(&h.scope, significant("api", "auth", "jwt"))
        .await
        .unwrap();
    h.promote_and_consolidate().await;

    h.clock.advance(Duration::minutes(1));
    let pending = h
        .orch
        .capture(&h.scope, significant("api", "owner", "team-a"))
        .await
        .unwrap();
    let promoted = h.orch.run_promotion_batch(&h.scope).await.unwrap();
    assert_eq!(promoted.succeeded, 1);
    pending.id
}

fn reconsolidating_harness() -> Harness {
    let mut config = LifecycleConfig::default();
    config.orchestrator.reconsolidate_on_conflict = true;
    harness_with(MemoryStores::in_memory(), ScriptedProvider::new(), config)
}

#[tokio::test]
async fn conflicting_answer_triggers_reconsolidation() {
    let h = reconsolidating_harness();
    let pending = conflict_with_pending_fact(&h).await;
    let summaries = h.provider.calls(ProviderOp::Summarize);

    let result = h.orch.synthesize("api auth", &h.scope).await.unwrap();
    assert!(result.conflict);
    assert!(!result.from_cache);
    assert_eq!(h.provider.calls(ProviderOp::Summarize), summaries + 1);

    let fact = h.orch.stores().l2.get(&pending).await.unwrap();
    assert!(!fact.is_current());
    assert!(fact.superseded_by.is_some());
    assert!(!h.orch.leases().is_held(EngineKind::Consolidation, &h.scope));
}

#[tokio::test]
async fn reconsolidation_is_skipped_while_consolidation_lease_is_held() {
    let h = reconsolidating_harness();
    let pending = conflict_with_pending_fact(&h).await;
    let summaries = h.provider.calls(ProviderOp::Summarize);

    let held = h
        .orch
        .leases()
        .try_acquire(EngineKind::Consolidation, &h.scope)
        .unwrap();
    let result = h.orch.synthesize("api auth", &h.scope).await.unwrap();
    assert!(result.conflict);
    assert_eq!(h.provider.calls(ProviderOp::Summarize), summaries);
    assert!(h.orch.stores().l2.get(&pending).await.unwrap().is_current());
    drop(held);

    // A cached conflict does not trigger it either
    let cached = h.orch.synthesize("api auth", &h.scope).await.unwrap();
    assert!(cached.from_cache);
    assert_eq!(h.provider.calls(ProviderOp::Summarize), summaries);
}
