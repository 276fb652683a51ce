//! In-process adapters for every store port.
//!
//! Useful for tests, single-process deployments and as the reference
//! behaviour other adapters are checked against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StoreError;

use super::ports::*;
use super::text::cosine;
use super::types::*;

/// Tier store backed by an ordered map.
pub struct InMemoryTierStore<T: TierItem> {
    tier: Tier,
    items: Arc<RwLock<BTreeMap<T::Id, T>>>,
}

impl<T: TierItem> InMemoryTierStore<T> {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            items: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Number of stored items.
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl<T: TierItem> TierStore<T> for InMemoryTierStore<T> {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn put(&self, item: &T) -> Result<T::Id, StoreError> {
        let mut items = self.items.write().await;
        items.insert(item.id().clone(), item.clone());
        Ok(item.id().clone())
    }

    async fn get(&self, id: &T::Id) -> Result<T, StoreError> {
        let items = self.items.read().await;
        items
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(T::KIND, id))
    }

    async fn query(&self, query: &ItemQuery) -> Result<Vec<T>, StoreError> {
        let items = self.items.read().await;
        let mut matched: Vec<&T> = items.values().filter(|i| query.matches(*i)).collect();
        matched.sort_by(|a, b| {
            a.recorded_at()
                .cmp(&b.recorded_at())
                .then_with(|| a.id().cmp(b.id()))
        });

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_superseded(
        &self,
        id: &T::Id,
        valid_to: DateTime<Utc>,
        superseded_by: Option<EpisodeId>,
    ) -> Result<(), StoreError> {
        let mut items = self.items.write().await;
        let item = items
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(T::KIND, id))?;
        close_item(item, valid_to, superseded_by)
    }

    async fn record_access(&self, id: &T::Id, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut items = self.items.write().await;
        let item = items
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(T::KIND, id))?;
        item.touch(at);
        Ok(())
    }
}

/// Brute-force cosine vector index.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    vectors: RwLock<HashMap<EpisodeId, (Scope, Vec<f32>)>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.vectors.read().await.len()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(
        &self,
        id: &EpisodeId,
        scope: &Scope,
        vector: &[f32],
    ) -> Result<(), StoreError> {
        if vector.is_empty() {
            return Err(StoreError::conflict(id, "empty embedding"));
        }
        self.vectors
            .write()
            .await
            .insert(id.clone(), (scope.clone(), vector.to_vec()));
        Ok(())
    }

    async fn delete(&self, id: &EpisodeId) -> Result<bool, StoreError> {
        Ok(self.vectors.write().await.remove(id).is_some())
    }

    async fn contains(&self, id: &EpisodeId) -> Result<bool, StoreError> {
        Ok(self.vectors.read().await.contains_key(id))
    }

    async fn search(
        &self,
        scope: &Scope,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>, StoreError> {
        let vectors = self.vectors.read().await;
        let mut hits: Vec<VectorHit> = vectors
            .iter()
            .filter(|(_, (s, _))| s == scope)
            .map(|(id, (_, v))| VectorHit {
                episode_id: id.clone(),
                similarity: cosine(vector, v),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.episode_id.cmp(&b.episode_id))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

/// Adjacency-map graph index keyed by normalized entity name.
#[derive(Default)]
pub struct InMemoryGraphIndex {
    inner: RwLock<GraphState>,
}

#[derive(Default)]
struct GraphState {
    episodes: HashMap<EpisodeId, (Scope, EpisodeGraph)>,
    by_entity: HashMap<(Scope, String), Vec<EpisodeId>>,
}

impl InMemoryGraphIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.episodes.len()
    }

    /// Graph stored for an episode.
    pub async fn graph(&self, id: &EpisodeId) -> Option<EpisodeGraph> {
        self.inner
            .read()
            .await
            .episodes
            .get(id)
            .map(|(_, g)| g.clone())
    }
}

impl GraphState {
    fn unlink(&mut self, id: &EpisodeId) -> bool {
        let Some((scope, graph)) = self.episodes.remove(id) else {
            return false;
        };
        for name in graph.entity_names() {
            let key = (scope.clone(), name);
            if let Some(ids) = self.by_entity.get_mut(&key) {
                ids.retain(|e| e != id);
                if ids.is_empty() {
                    self.by_entity.remove(&key);
                }
            }
        }
        true
    }
}

#[async_trait]
impl GraphIndex for InMemoryGraphIndex {
    async fn write(
        &self,
        id: &EpisodeId,
        scope: &Scope,
        graph: &EpisodeGraph,
    ) -> Result<(), StoreError> {
        if graph.entities.is_empty() {
            return Err(StoreError::conflict(id, "graph has no entities"));
        }
        let mut state = self.inner.write().await;
        state.unlink(id);
        for name in graph.entity_names() {
            state
                .by_entity
                .entry((scope.clone(), name))
                .or_default()
                .push(id.clone());
        }
        state
            .episodes
            .insert(id.clone(), (scope.clone(), graph.clone()));
        Ok(())
    }

    async fn delete(&self, id: &EpisodeId) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.unlink(id))
    }

    async fn contains(&self, id: &EpisodeId) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.episodes.contains_key(id))
    }

    async fn episodes_for_entities(
        &self,
        scope: &Scope,
        entities: &[String],
    ) -> Result<Vec<GraphHit>, StoreError> {
        let state = self.inner.read().await;
        let mut counts: BTreeMap<EpisodeId, usize> = BTreeMap::new();
        for name in entities {
            if let Some(ids) = state.by_entity.get(&(scope.clone(), normalize(name))) {
                for id in ids {
                    *counts.entry(id.clone()).or_default() += 1;
                }
            }
        }
        let mut hits: Vec<GraphHit> = counts
            .into_iter()
            .map(|(episode_id, matched)| GraphHit {
                episode_id,
                matched,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.matched
                .cmp(&a.matched)
                .then_with(|| a.episode_id.cmp(&b.episode_id))
        });
        Ok(hits)
    }
}
