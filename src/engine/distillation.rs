//! L3 → L4 distillation.
//!
//! Eligible episodes (old enough, or flagged resolved, and not yet cited
//! by any document) are grouped into patterns by a [`PatternMiner`]. The
//! reasoning provider turns each pattern into a document candidate. A
//! candidate close enough to an existing document only extends that
//! document's provenance; otherwise it becomes a new document.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::DistillationConfig;
use crate::error::{Error, ProviderError, Result, StoreError};
use crate::memory::text::{jaccard, tokenize};
use crate::memory::{
    query_all, DocumentId, Episode, EpisodeId, ItemQuery, KnowledgeDocument, Scope, TierStore,
    Validity,
};
use crate::provider::{KnowledgeCandidate, ReasoningProvider};

use super::batch::{BatchResult, EngineKind};
use super::cancel::CancelToken;

/// Episodes that share a recurring pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodePattern {
    /// Stable identifier used in reports
    pub key: String,
    /// Entities recurring across the episodes
    pub entities: Vec<String>,
    /// Member episodes in derivation order
    pub episode_ids: Vec<EpisodeId>,
}

/// Pattern-mining policy for distillation.
#[async_trait]
pub trait PatternMiner: Send + Sync {
    async fn mine(&self, episodes: &[Episode]) -> Result<Vec<EpisodePattern>>;
}

/// Groups episodes connected through shared entities.
///
/// Two episodes are linked when they mention a common entity; each
/// connected group with at least `min_support` episodes is a pattern.
#[derive(Debug, Clone)]
pub struct EntityCooccurrenceMiner {
    min_support: usize,
}

impl EntityCooccurrenceMiner {
    pub fn new(min_support: usize) -> Self {
        Self {
            min_support: min_support.max(1),
        }
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

#[async_trait]
impl PatternMiner for EntityCooccurrenceMiner {
    async fn mine(&self, episodes: &[Episode]) -> Result<Vec<EpisodePattern>> {
        let mut ordered: Vec<&Episode> = episodes.iter().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut parent: Vec<usize> = (0..ordered.len()).collect();
        let mut first_seen: HashMap<&str, usize> = HashMap::new();
        for (idx, episode) in ordered.iter().enumerate() {
            for entity in &episode.entities {
                match first_seen.get(entity.as_str()) {
                    Some(&other) => {
                        let (a, b) = (find(&mut parent, idx), find(&mut parent, other));
                        if a != b {
                            parent[a.max(b)] = a.min(b);
                        }
                    }
                    None => {
                        first_seen.insert(entity.as_str(), idx);
                    }
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<&Episode>> = BTreeMap::new();
        for idx in 0..ordered.len() {
            let root = find(&mut parent, idx);
            groups.entry(root).or_default().push(ordered[idx]);
        }

        Ok(groups
            .into_values()
            .filter(|members| members.len() >= self.min_support)
            .map(|members| {
                let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
                for episode in &members {
                    let unique: BTreeSet<&str> =
                        episode.entities.iter().map(String::as_str).collect();
                    for entity in unique {
                        *counts.entry(entity).or_default() += 1;
                    }
                }
                let entities: Vec<String> = counts
                    .into_iter()
                    .filter(|(_, n)| *n >= 2)
                    .map(|(e, _)| e.to_string())
                    .collect();
                EpisodePattern {
                    key: format!("pattern:{}", entities.join("+")),
                    entities,
                    episode_ids: members.iter().map(|e| e.id.clone()).collect(),
                }
            })
            .collect())
    }
}

/// Distillation engine.
pub struct DistillationEngine {
    l3: Arc<dyn TierStore<Episode>>,
    l4: Arc<dyn TierStore<KnowledgeDocument>>,
    provider: Arc<dyn ReasoningProvider>,
    miner: Arc<dyn PatternMiner>,
    config: DistillationConfig,
    clock: Arc<dyn Clock>,
}

impl DistillationEngine {
    pub fn new(
        l3: Arc<dyn TierStore<Episode>>,
        l4: Arc<dyn TierStore<KnowledgeDocument>>,
        provider: Arc<dyn ReasoningProvider>,
        config: DistillationConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            l3,
            l4,
            provider,
            miner: Arc::new(EntityCooccurrenceMiner::new(config.min_support)),
            config,
            clock,
        })
    }

    /// Replace the pattern-mining policy.
    pub fn with_miner(mut self, miner: Arc<dyn PatternMiner>) -> Self {
        self.miner = miner;
        self
    }

    /// Current episodes of the scope that may be distilled now.
    pub async fn eligible_episodes(&self, scope: &Scope) -> Result<Vec<Episode>> {
        let now = self.clock.now();
        let min_age = self.config.min_episode_age();

        let cited: HashSet<EpisodeId> = self
            .current_documents(scope)
            .await?
            .into_iter()
            .flat_map(|d| d.provenance)
            .collect();

        let mut episodes: Vec<Episode> =
            query_all(self.l3.as_ref(), &ItemQuery::new().scope(scope).current_only())
                .await?
                .into_iter()
                .filter(|e| e.resolved || now - e.created_at >= min_age)
                .filter(|e| !cited.contains(&e.id))
                .collect();
        episodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        episodes.truncate(self.config.max_episodes_per_batch);
        Ok(episodes)
    }

    async fn current_documents(&self, scope: &Scope) -> Result<Vec<KnowledgeDocument>> {
        Ok(query_all(self.l4.as_ref(), &ItemQuery::new().scope(scope).current_only()).await?)
    }

    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn run_batch(&self, scope: &Scope, cancel: &CancelToken) -> Result<BatchResult> {
        let mut result =
            BatchResult::new(EngineKind::Distillation, scope.clone(), self.clock.now());

        let episodes = self.eligible_episodes(scope).await?;
        if episodes.is_empty() {
            debug!("No episodes eligible for distillation");
            return Ok(result.finish(self.clock.now()));
        }
        let by_id: HashMap<EpisodeId, Episode> =
            episodes.iter().map(|e| (e.id.clone(), e.clone())).collect();

        let patterns = self.miner.mine(&episodes).await?;
        info!(
            "Distilling {} patterns from {} episodes",
            patterns.len(),
            episodes.len()
        );

        let semaphore = Semaphore::new(self.config.max_concurrency);
        let semaphore = &semaphore;
        let by_id_ref = &by_id;
        let candidates = join_all(patterns.iter().map(|pattern| async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return None;
            };
            if !cancel.checkpoint() {
                return None;
            }
            let members: Vec<Episode> = pattern
                .episode_ids
                .iter()
                .filter_map(|id| by_id_ref.get(id).cloned())
                .collect();
            Some(self.synthesize_candidate(&members).await)
        }))
        .await;

        let mut documents = self.current_documents(scope).await?;
        let mut not_run = 0;
        for (pattern, candidate) in patterns.iter().zip(candidates) {
            let Some(candidate) = candidate else {
                not_run += 1;
                continue;
            };
            if !cancel.checkpoint() {
                not_run += 1;
                continue;
            }
            let outcome = match candidate {
                Ok(candidate) => self.write(scope, pattern, candidate, &mut documents).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(id) => result.record_success(Some(id.to_string())),
                Err(e) => {
                    warn!(pattern = %pattern.key, error = %e, "Distillation failed");
                    result.record_failure(&pattern.key, &e);
                }
            }
        }
        if not_run > 0 {
            info!("Distillation cancelled with {} patterns remaining", not_run);
            result.record_cancelled(not_run);
        }

        let result = result.finish(self.clock.now());
        info!(
            attempted = result.attempted,
            succeeded = result.succeeded,
            failed = result.failed,
            "Distillation finished"
        );
        Ok(result)
    }

    async fn synthesize_candidate(&self, episodes: &[Episode]) -> Result<KnowledgeCandidate> {
        let candidate = self.provider.synthesize(episodes).await?;
        candidate.validate()?;
        Ok(candidate)
    }

    /// Store a candidate as a new document or merge it into a near-duplicate.
    async fn write(
        &self,
        scope: &Scope,
        pattern: &EpisodePattern,
        candidate: KnowledgeCandidate,
        documents: &mut Vec<KnowledgeDocument>,
    ) -> Result<DocumentId> {
        let provenance = self.verified_provenance(pattern).await?;
        let now = self.clock.now();

        let tokens = candidate_tokens(&candidate.title, &candidate.body, &candidate.tags);
        let nearest = documents
            .iter()
            .enumerate()
            .map(|(idx, d)| (idx, jaccard(&tokens, &candidate_tokens(&d.title, &d.body, &d.tags))))
            .filter(|(_, sim)| *sim >= self.config.dedup_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)));

        if let Some((idx, similarity)) = nearest {
            let mut merged = documents[idx].clone();
            let added = merged.append_provenance(&provenance, now);
            if added > 0 {
                self.l4.put(&merged).await?;
                documents[idx] = merged.clone();
            }
            debug!(document_id = %merged.id, similarity, added, "Merged into existing document");
            return Ok(merged.id);
        }

        let document = KnowledgeDocument {
            id: DocumentId::new(),
            scope: scope.clone(),
            title: candidate.title,
            body: candidate.body,
            provenance,
            tags: candidate.tags,
            confidence: candidate.confidence,
            assertions: candidate.assertions,
            validity: Validity::open(now),
            created_at: now,
            updated_at: now,
        };
        self.l4.put(&document).await?;
        debug!(document_id = %document.id, "Created knowledge document");
        let id = document.id.clone();
        documents.push(document);
        Ok(id)
    }

    /// Pattern episodes that exist in L3; empty provenance is an error.
    async fn verified_provenance(&self, pattern: &EpisodePattern) -> Result<Vec<EpisodeId>> {
        let mut provenance = Vec::with_capacity(pattern.episode_ids.len());
        for (id, found) in pattern
            .episode_ids
            .iter()
            .zip(self.l3.batch_get(&pattern.episode_ids).await)
        {
            match found {
                Ok(_) => provenance.push(id.clone()),
                Err(StoreError::NotFound { .. }) => {
                    warn!(episode_id = %id, "Dropping missing episode from provenance")
                }
                Err(e) => return Err(e.into()),
            }
        }
        if provenance.is_empty() {
            return Err(Error::from(ProviderError::MalformedResponse(format!(
                "{} has no existing source episodes",
                pattern.key
            ))));
        }
        Ok(provenance)
    }
}

fn candidate_tokens(title: &str, body: &str, tags: &BTreeSet<String>) -> BTreeSet<String> {
    let mut tokens = tokenize(title);
    tokens.extend(tokenize(body));
    for tag in tags {
        tokens.extend(tokenize(tag));
    }
    tokens
}
