//! Test doubles: a deterministic provider and fault-injecting indexes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{ProviderError, StoreError};
use crate::memory::text::tokenize;
use crate::memory::{
    Episode, EpisodeGraph, EpisodeId, Fact, FactCandidate, GraphHit, GraphIndex,
    InMemoryGraphIndex, InMemoryTierStore, InMemoryVectorIndex, ItemQuery, Scope, Tier, TierItem,
    TierStore, Triple, VectorHit, VectorIndex,
};
use crate::provider::{KnowledgeCandidate, ReasoningProvider};

const EMBEDDING_DIMS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ProviderOp {
    Extract,
    Summarize,
    Embed,
    Graph,
    Synthesize,
}

#[derive(Default)]
struct Script {
    calls: HashMap<ProviderOp, u32>,
    failures: HashMap<ProviderOp, (u32, ProviderError)>,
    delay: Option<Duration>,
}

/// Provider whose outputs are pure functions of its inputs.
///
/// - `extract_facts`: one candidate per non-empty line; `a | b | c` lines carry a triple
/// - `summarize`: fact texts joined with `"; "`
/// - `embed`: hashed bag of tokens
/// - `extract_graph`: empty (engines fall back to assertion graphs)
/// - `synthesize`: title from shared entities, body from narratives
#[derive(Clone, Default)]
pub(crate) struct ScriptedProvider {
    script: Arc<Mutex<Script>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail_next(&self, op: ProviderOp, times: u32, error: ProviderError) {
        self.script.lock().unwrap().failures.insert(op, (times, error));
    }

    pub fn fail_always(&self, op: ProviderOp, error: ProviderError) {
        self.fail_next(op, u32::MAX, error);
    }

    /// Sleep before answering every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.script.lock().unwrap().delay = Some(delay);
        self
    }

    pub fn calls(&self, op: ProviderOp) -> u32 {
        self.script
            .lock()
            .unwrap()
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    async fn enter(&self, op: ProviderOp) -> Result<(), ProviderError> {
        let delay = {
            let mut script = self.script.lock().unwrap();
            *script.calls.entry(op).or_default() += 1;
            if let Some((remaining, error)) = script.failures.get_mut(&op) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    return Err(error.clone());
                }
            }
            script.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

pub(crate) fn embed_text(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIMS];
    for token in tokenize(text) {
        let bucket = token
            .bytes()
            .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
        v[bucket % EMBEDDING_DIMS] += 1.0;
    }
    if v.iter().all(|x| *x == 0.0) {
        v[0] = 1.0;
    }
    v
}

#[async_trait]
impl ReasoningProvider for ScriptedProvider {
    async fn extract_facts(&self, text: &str) -> Result<Vec<FactCandidate>, ProviderError> {
        self.enter(ProviderOp::Extract).await?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|line| {
                let parts: Vec<&str> = line.split('|').map(str::trim).collect();
                let candidate =
                    FactCandidate::new(parts.join(" ")).with_significance(0.9, 0.8, 0.7);
                if parts.len() == 3 {
                    candidate.with_triple(Triple::new(parts[0], parts[1], parts[2]))
                } else {
                    candidate
                }
            })
            .collect())
    }

    async fn summarize(&self, facts: &[Fact]) -> Result<String, ProviderError> {
        self.enter(ProviderOp::Summarize).await?;
        Ok(facts
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join("; "))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.enter(ProviderOp::Embed).await?;
        Ok(embed_text(text))
    }

    async fn extract_graph(&self, _narrative: &str) -> Result<EpisodeGraph, ProviderError> {
        self.enter(ProviderOp::Graph).await?;
        Ok(EpisodeGraph::default())
    }

    async fn synthesize(&self, episodes: &[Episode]) -> Result<KnowledgeCandidate, ProviderError> {
        self.enter(ProviderOp::Synthesize).await?;
        let mut shared: Option<BTreeSet<String>> = None;
        for episode in episodes {
            let names: BTreeSet<String> = episode.entities.iter().cloned().collect();
            shared = Some(match shared {
                Some(acc) => acc.intersection(&names).cloned().collect(),
                None => names,
            });
        }
        let shared = shared.unwrap_or_default();
        let title = format!(
            "Pattern: {}",
            shared.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        let body = episodes
            .iter()
            .map(|e| e.narrative.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let confidence = if episodes.is_empty() {
            0.5
        } else {
            episodes.iter().map(|e| e.confidence).sum::<f64>() / episodes.len() as f64
        };
        let mut assertions = Vec::new();
        for episode in episodes {
            for a in &episode.assertions {
                if !assertions.contains(&a.triple) {
                    assertions.push(a.triple.clone());
                }
            }
        }
        Ok(KnowledgeCandidate {
            title,
            body,
            tags: shared,
            confidence,
            assertions,
        })
    }
}

/// Remaining injected failures; `u32::MAX` means always.
#[derive(Default)]
pub(crate) struct Faults(AtomicU32);

impl Faults {
    pub fn set(&self, times: u32) {
        self.0.store(times, Ordering::SeqCst);
    }

    fn trip(&self) -> bool {
        let current = self.0.load(Ordering::SeqCst);
        if current == 0 {
            return false;
        }
        if current != u32::MAX {
            self.0.store(current - 1, Ordering::SeqCst);
        }
        true
    }
}

/// Vector index with injectable write and delete failures.
#[derive(Default)]
pub(crate) struct FaultyVectorIndex {
    pub inner: InMemoryVectorIndex,
    pub fail_upserts: Faults,
    pub fail_deletes: Faults,
}

#[async_trait]
impl VectorIndex for FaultyVectorIndex {
    async fn upsert(
        &self,
        id: &EpisodeId,
        scope: &Scope,
        vector: &[f32],
    ) -> Result<(), StoreError> {
        if self.fail_upserts.trip() {
            return Err(StoreError::connection("vector index unavailable"));
        }
        self.inner.upsert(id, scope, vector).await
    }

    async fn delete(&self, id: &EpisodeId) -> Result<bool, StoreError> {
        if self.fail_deletes.trip() {
            return Err(StoreError::connection("vector index unavailable"));
        }
        self.inner.delete(id).await
    }

    async fn contains(&self, id: &EpisodeId) -> Result<bool, StoreError> {
        self.inner.contains(id).await
    }

    async fn search(
        &self,
        scope: &Scope,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>, StoreError> {
        self.inner.search(scope, vector, k).await
    }
}

/// Graph index with injectable write failures.
#[derive(Default)]
pub(crate) struct FaultyGraphIndex {
    pub inner: InMemoryGraphIndex,
    pub fail_writes: Faults,
}

#[async_trait]
impl GraphIndex for FaultyGraphIndex {
    async fn write(
        &self,
        id: &EpisodeId,
        scope: &Scope,
        graph: &EpisodeGraph,
    ) -> Result<(), StoreError> {
        if self.fail_writes.trip() {
            return Err(StoreError::connection("graph index unavailable"));
        }
        self.inner.write(id, scope, graph).await
    }

    async fn delete(&self, id: &EpisodeId) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn contains(&self, id: &EpisodeId) -> Result<bool, StoreError> {
        self.inner.contains(id).await
    }

    async fn episodes_for_entities(
        &self,
        scope: &Scope,
        entities: &[String],
    ) -> Result<Vec<GraphHit>, StoreError> {
        self.inner.episodes_for_entities(scope, entities).await
    }
}

/// Tier store whose supersession can be made to fail.
pub(crate) struct FaultyTierStore<T: TierItem> {
    pub inner: InMemoryTierStore<T>,
    pub fail_supersedes: Faults,
}

impl<T: TierItem> FaultyTierStore<T> {
    pub fn new(tier: Tier) -> Self {
        Self {
            inner: InMemoryTierStore::new(tier),
            fail_supersedes: Faults::default(),
        }
    }
}

#[async_trait]
impl<T: TierItem> TierStore<T> for FaultyTierStore<T> {
    fn tier(&self) -> Tier {
        self.inner.tier()
    }

    async fn put(&self, item: &T) -> Result<T::Id, StoreError> {
        self.inner.put(item).await
    }

    async fn get(&self, id: &T::Id) -> Result<T, StoreError> {
        self.inner.get(id).await
    }

    async fn query(&self, query: &ItemQuery) -> Result<Vec<T>, StoreError> {
        self.inner.query(query).await
    }

    async fn mark_superseded(
        &self,
        id: &T::Id,
        valid_to: DateTime<Utc>,
        superseded_by: Option<EpisodeId>,
    ) -> Result<(), StoreError> {
        if self.fail_supersedes.trip() {
            return Err(StoreError::connection("tier store unavailable"));
        }
        self.inner.mark_superseded(id, valid_to, superseded_by).await
    }

    async fn record_access(&self, id: &T::Id, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.record_access(id, at).await
    }
}
