//! L2 → L3 consolidation.
//!
//! Current working-memory facts in a window are grouped by a pluggable
//! [`FactClusterer`], summarized by the reasoning provider and written as
//! episodes. Each episode is indexed twice, as an embedding and as an
//! entity graph, through [`DualIndexWriter`]: both representations exist or
//! neither does. Member facts are closed last, pointing at the episode.
//!
//! ## Steps per cluster
//!
//! 1. summarize a bounded prompt of member facts
//! 2. embed the narrative, extract its graph
//! 3. collect current same-topic episodes with an overlapping window
//! 4. vector write, then graph write (compensating delete + retry on failure)
//! 5. store the episode record
//! 6. close the superseded episodes, then the member facts

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::ConsolidationConfig;
use crate::error::{Error, ErrorKind, ProviderError, Result, StoreError};
use crate::memory::{
    query_all, Assertion, Episode, EpisodeGraph, EpisodeId, Fact, FactId, GraphIndex, ItemQuery,
    Scope, TierStore, TimeWindow, Validity, VectorIndex,
};
use crate::provider::ReasoningProvider;

use super::batch::{BatchResult, EngineKind};
use super::cancel::CancelToken;

/// Grouping policy for consolidation.
///
/// Implementations may return overlapping or incomplete groupings; the
/// engine keeps each fact in the earliest group that claims it and leaves
/// unclaimed facts for a later batch.
#[async_trait]
pub trait FactClusterer: Send + Sync {
    async fn cluster(&self, facts: &[Fact]) -> Result<Vec<Vec<FactId>>>;
}

/// Groups facts by topic (normalized triple subject), then splits each
/// topic wherever consecutive facts are further apart than `max_gap`.
#[derive(Debug, Clone)]
pub struct TopicWindowClusterer {
    max_gap: chrono::Duration,
}

impl TopicWindowClusterer {
    pub fn new(max_gap: chrono::Duration) -> Self {
        Self { max_gap }
    }

    pub fn from_config(config: &ConsolidationConfig) -> Self {
        Self::new(config.max_cluster_gap())
    }
}

#[async_trait]
impl FactClusterer for TopicWindowClusterer {
    async fn cluster(&self, facts: &[Fact]) -> Result<Vec<Vec<FactId>>> {
        let mut by_topic: BTreeMap<Option<String>, Vec<&Fact>> = BTreeMap::new();
        for fact in facts {
            by_topic.entry(fact.topic()).or_default().push(fact);
        }

        let mut clusters = Vec::new();
        for (_, mut members) in by_topic {
            members.sort_by(|a, b| fact_order(a, b));
            let mut current: Vec<FactId> = Vec::new();
            let mut last: Option<DateTime<Utc>> = None;
            for fact in members {
                let at = fact.validity.valid_from;
                if let Some(prev) = last {
                    if at - prev > self.max_gap && !current.is_empty() {
                        clusters.push(std::mem::take(&mut current));
                    }
                }
                current.push(fact.id.clone());
                last = Some(at);
            }
            if !current.is_empty() {
                clusters.push(current);
            }
        }
        Ok(clusters)
    }
}

fn fact_order(a: &Fact, b: &Fact) -> std::cmp::Ordering {
    a.validity
        .valid_from
        .cmp(&b.validity.valid_from)
        .then_with(|| a.id.cmp(&b.id))
}

/// A normalized group of facts to consolidate into one episode.
#[derive(Debug, Clone, PartialEq)]
pub struct FactCluster {
    /// Shared topic when every member has the same one
    pub topic: Option<String>,
    pub window: TimeWindow,
    /// Members ordered by `(valid_from, id)`
    pub facts: Vec<Fact>,
}

impl FactCluster {
    fn new(facts: Vec<Fact>) -> Option<Self> {
        let first = facts.first()?;
        let start = first.validity.valid_from;
        let end = facts
            .iter()
            .map(|f| f.validity.valid_from)
            .max()
            .unwrap_or(start);
        let topic = first.topic();
        let topic = if facts.iter().all(|f| f.topic() == topic) {
            topic
        } else {
            None
        };
        Some(Self {
            topic,
            window: TimeWindow { start, end },
            facts,
        })
    }

    /// Stable identifier used in batch reports.
    pub fn label(&self) -> String {
        match self.facts.first() {
            Some(f) => format!("cluster:{}", f.id),
            None => "cluster:empty".to_string(),
        }
    }

    pub fn fact_ids(&self) -> Vec<FactId> {
        self.facts.iter().map(|f| f.id.clone()).collect()
    }
}

/// Turn a policy's raw grouping into disjoint, deterministically ordered clusters.
///
/// Groups are ordered by their earliest member (timestamp, then id) and
/// each fact stays in the first group that claims it. Unknown ids are
/// ignored.
pub fn normalize_clusters(facts: &[Fact], raw: Vec<Vec<FactId>>) -> Vec<FactCluster> {
    let by_id: HashMap<&FactId, &Fact> = facts.iter().map(|f| (&f.id, f)).collect();

    let mut groups: Vec<Vec<&Fact>> = raw
        .iter()
        .map(|ids| {
            let mut members: Vec<&Fact> =
                ids.iter().filter_map(|id| by_id.get(id).copied()).collect();
            members.sort_by(|a, b| fact_order(a, b));
            members.dedup_by(|a, b| a.id == b.id);
            members
        })
        .filter(|members| !members.is_empty())
        .collect();
    groups.sort_by(|a, b| {
        fact_order(a[0], b[0])
            .then_with(|| a.len().cmp(&b.len()))
            .then_with(|| a.iter().map(|f| &f.id).cmp(b.iter().map(|f| &f.id)))
    });

    let mut claimed: HashSet<&FactId> = HashSet::new();
    let mut clusters: Vec<FactCluster> = groups
        .into_iter()
        .filter_map(|members| {
            let owned: Vec<Fact> = members
                .into_iter()
                .filter(|f| claimed.insert(&f.id))
                .cloned()
                .collect();
            FactCluster::new(owned)
        })
        .collect();
    clusters.sort_by(|a, b| fact_order(&a.facts[0], &b.facts[0]));
    clusters
}

/// Writes an episode's vector and graph representations as a unit.
///
/// The vector goes first. If the graph write then fails, the vector is
/// deleted before the next attempt; if that delete fails too the episode
/// is reported as [`Error::InconsistentIndexState`] and not retried.
pub struct DualIndexWriter {
    vector: Arc<dyn VectorIndex>,
    graph: Arc<dyn GraphIndex>,
    retry_budget: u32,
}

impl DualIndexWriter {
    pub fn new(
        vector: Arc<dyn VectorIndex>,
        graph: Arc<dyn GraphIndex>,
        retry_budget: u32,
    ) -> Self {
        Self {
            vector,
            graph,
            retry_budget: retry_budget.max(1),
        }
    }

    pub async fn write(
        &self,
        id: &EpisodeId,
        scope: &Scope,
        embedding: &[f32],
        graph: &EpisodeGraph,
    ) -> Result<()> {
        let mut last_error = String::new();
        for attempt in 1..=self.retry_budget {
            if let Err(e) = self.vector.upsert(id, scope, embedding).await {
                warn!(episode_id = %id, attempt, error = %e, "Vector write failed");
                last_error = e.to_string();
                continue;
            }
            match self.graph.write(id, scope, graph).await {
                Ok(()) => {
                    debug!(episode_id = %id, attempt, "Episode dual-indexed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        episode_id = %id,
                        attempt,
                        error = %e,
                        "Graph write failed, rolling back vector"
                    );
                    last_error = e.to_string();
                    self.delete_vector(id).await?;
                }
            }
        }
        Err(Error::IndexWriteFailed {
            episode_id: id.to_string(),
            attempts: self.retry_budget,
            last_error,
        })
    }

    /// Remove both representations of an episode.
    pub async fn remove(&self, id: &EpisodeId) -> Result<()> {
        self.delete_vector(id).await?;
        let mut last: Option<StoreError> = None;
        for _ in 0..self.retry_budget {
            match self.graph.delete(id).await {
                Ok(_) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }
        let detail = format!(
            "graph rollback failed: {}",
            last.map(|e| e.to_string()).unwrap_or_default()
        );
        error!(episode_id = %id, "{}", detail);
        Err(Error::inconsistent_index(id, detail))
    }

    async fn delete_vector(&self, id: &EpisodeId) -> Result<()> {
        let mut last: Option<StoreError> = None;
        for _ in 0..self.retry_budget {
            match self.vector.delete(id).await {
                Ok(_) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }
        let detail = format!(
            "vector rollback failed: {}",
            last.map(|e| e.to_string()).unwrap_or_default()
        );
        error!(episode_id = %id, "{}", detail);
        Err(Error::inconsistent_index(id, detail))
    }
}

enum ClusterRun {
    NotRun,
    Done(Result<Episode>),
}

/// Consolidation engine.
pub struct ConsolidationEngine {
    l2: Arc<dyn TierStore<Fact>>,
    l3: Arc<dyn TierStore<Episode>>,
    writer: DualIndexWriter,
    provider: Arc<dyn ReasoningProvider>,
    clusterer: Arc<dyn FactClusterer>,
    config: ConsolidationConfig,
    clock: Arc<dyn Clock>,
}

impl ConsolidationEngine {
    pub fn new(
        l2: Arc<dyn TierStore<Fact>>,
        l3: Arc<dyn TierStore<Episode>>,
        vector: Arc<dyn VectorIndex>,
        graph: Arc<dyn GraphIndex>,
        provider: Arc<dyn ReasoningProvider>,
        config: ConsolidationConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            l2,
            l3,
            writer: DualIndexWriter::new(vector, graph, config.index_retry_budget),
            provider,
            clusterer: Arc::new(TopicWindowClusterer::from_config(&config)),
            config,
            clock,
        })
    }

    /// Replace the clustering policy.
    pub fn with_clusterer(mut self, clusterer: Arc<dyn FactClusterer>) -> Self {
        self.clusterer = clusterer;
        self
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Consolidate the scope's current L2 facts whose `valid_from` falls in `window`.
    #[instrument(skip_all, fields(scope = %scope, start = %window.start, end = %window.end))]
    pub async fn run_batch(
        &self,
        scope: &Scope,
        window: &TimeWindow,
        cancel: &CancelToken,
    ) -> Result<BatchResult> {
        let mut result =
            BatchResult::new(EngineKind::Consolidation, scope.clone(), self.clock.now());

        let query = ItemQuery::new()
            .scope(scope)
            .current_only()
            .valid_from_in(*window);
        let facts = query_all(self.l2.as_ref(), &query).await?;
        if facts.is_empty() {
            debug!("No facts to consolidate");
            return Ok(result.finish(self.clock.now()));
        }

        let raw = self.clusterer.cluster(&facts).await?;
        let clusters = normalize_clusters(&facts, raw);
        info!(
            "Consolidating {} facts in {} clusters",
            facts.len(),
            clusters.len()
        );

        let semaphore = Semaphore::new(self.config.max_concurrency);
        let semaphore = &semaphore;
        let runs = join_all(clusters.iter().map(|cluster| async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return ClusterRun::NotRun;
            };
            if !cancel.checkpoint() {
                return ClusterRun::NotRun;
            }
            ClusterRun::Done(self.consolidate_cluster(scope, cluster).await)
        }))
        .await;

        let mut not_run = 0;
        for (cluster, run) in clusters.iter().zip(runs) {
            match run {
                ClusterRun::NotRun => not_run += 1,
                ClusterRun::Done(Ok(episode)) => {
                    result.record_success(Some(episode.id.to_string()))
                }
                ClusterRun::Done(Err(e)) => {
                    let label = cluster.label();
                    if e.kind() == ErrorKind::InconsistentIndexState {
                        error!(cluster = %label, error = %e, "Cluster left index inconsistent");
                    } else {
                        warn!(cluster = %label, error = %e, "Cluster consolidation failed");
                    }
                    result.record_failure(cluster.label(), &e);
                }
            }
        }
        if not_run > 0 {
            info!("Consolidation cancelled with {} clusters remaining", not_run);
            result.record_cancelled(not_run);
        }

        let result = result.finish(self.clock.now());
        info!(
            attempted = result.attempted,
            succeeded = result.succeeded,
            failed = result.failed,
            "Consolidation finished"
        );
        Ok(result)
    }

    /// Consolidate one cluster into an episode.
    pub async fn consolidate_cluster(
        &self,
        scope: &Scope,
        cluster: &FactCluster,
    ) -> Result<Episode> {
        let prompt = self.prompt_facts(cluster);
        let narrative = self.provider.summarize(&prompt).await?;
        if narrative.trim().is_empty() {
            return Err(
                ProviderError::MalformedResponse("summarize: empty narrative".into()).into(),
            );
        }
        let embedding = self.provider.embed(&narrative).await?;
        if embedding.is_empty() {
            return Err(ProviderError::MalformedResponse("embed: empty embedding".into()).into());
        }
        let extracted = self.provider.extract_graph(&narrative).await?;

        let mut assertions: Vec<Assertion> = cluster
            .facts
            .iter()
            .filter_map(|f| {
                f.triple.as_ref().map(|t| Assertion {
                    triple: t.clone(),
                    fact_id: Some(f.id.clone()),
                    valid_from: f.validity.valid_from,
                    certainty: f.certainty,
                })
            })
            .collect();

        let prior = self.overlapping_episodes(scope, cluster).await?;
        let own_slots: HashSet<(String, String)> =
            assertions.iter().map(|a| a.triple.slot()).collect();
        for episode in &prior {
            for assertion in &episode.assertions {
                let slot = assertion.triple.slot();
                if !own_slots.contains(&slot) && !assertions.contains(assertion) {
                    assertions.push(assertion.clone());
                }
            }
        }

        let mut graph = EpisodeGraph::from_assertions(&assertions);
        graph.merge(extracted);
        if let Some(ref topic) = cluster.topic {
            graph.add_entity(topic, None);
        }
        if graph.entities.is_empty() {
            return Err(ProviderError::MalformedResponse(
                "no entities for graph representation".into(),
            )
            .into());
        }

        let now = self.clock.now();
        let confidence =
            cluster.facts.iter().map(|f| f.certainty).sum::<f64>() / cluster.facts.len() as f64;
        let episode = Episode {
            id: EpisodeId::new(),
            scope: scope.clone(),
            topic: cluster.topic.clone(),
            window: cluster.window,
            fact_ids: cluster.fact_ids(),
            narrative,
            assertions,
            entities: graph.entity_names(),
            validity: Validity::open(cluster.window.start),
            superseded_by: None,
            supersedes: prior.iter().map(|e| e.id.clone()).collect(),
            resolved: false,
            confidence,
            created_at: now,
            updated_at: now,
        };

        self.writer
            .write(&episode.id, scope, &embedding, &graph)
            .await?;
        if let Err(e) = self.l3.put(&episode).await {
            warn!(
                episode_id = %episode.id,
                error = %e,
                "Episode record write failed, removing index entries"
            );
            self.writer.remove(&episode.id).await?;
            return Err(e.into());
        }

        if let Err(e) = self.link(&episode, &prior, &cluster.facts, now).await {
            warn!(episode_id = %episode.id, error = %e, "Supersession failed, withdrawing episode");
            self.withdraw(&episode, now).await?;
            return Err(e);
        }
        debug!(
            episode_id = %episode.id,
            facts = episode.fact_ids.len(),
            supersedes = episode.supersedes.len(),
            "Episode written"
        );
        Ok(episode)
    }

    /// Close the prior episodes and member facts in favour of `episode`.
    ///
    /// Stops at the first failure after restoring everything it already
    /// closed, so the cluster either moves to the new episode as a whole
    /// or stays where it was.
    async fn link(
        &self,
        episode: &Episode,
        prior: &[Episode],
        facts: &[Fact],
        now: DateTime<Utc>,
    ) -> Result<()> {
        for (closed, old) in prior.iter().enumerate() {
            let valid_to = now.max(old.validity.valid_from);
            if let Err(e) = self
                .l3
                .mark_superseded(&old.id, valid_to, Some(episode.id.clone()))
                .await
            {
                self.restore(&prior[..closed], &[]).await;
                return Err(e.into());
            }
        }
        if let Err((closed, e)) = self.supersede_facts(episode, facts, now).await {
            self.restore(prior, &facts[..closed]).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Put back the original, still-current records.
    async fn restore(&self, episodes: &[Episode], facts: &[Fact]) {
        for old in episodes {
            if let Err(e) = self.l3.put(old).await {
                error!(episode_id = %old.id, error = %e, "Could not reopen superseded episode");
            }
        }
        for fact in facts {
            if let Err(e) = self.l2.put(fact).await {
                error!(fact_id = %fact.id, error = %e, "Could not reopen superseded fact");
            }
        }
    }

    /// Take a written episode back out of the index and close its record.
    async fn withdraw(&self, episode: &Episode, now: DateTime<Utc>) -> Result<()> {
        self.writer.remove(&episode.id).await?;
        let valid_to = now.max(episode.validity.valid_from);
        if let Err(e) = self.l3.mark_superseded(&episode.id, valid_to, None).await {
            error!(episode_id = %episode.id, error = %e, "Withdrawn episode left current");
            return Err(Error::inconsistent_index(
                &episode.id,
                format!("withdrawn episode left current: {}", e),
            ));
        }
        Ok(())
    }

    fn prompt_facts(&self, cluster: &FactCluster) -> Vec<Fact> {
        cluster
            .facts
            .iter()
            .take(self.config.max_prompt_facts)
            .map(|f| {
                let mut f = f.clone();
                if let Some((idx, _)) = f.text.char_indices().nth(self.config.max_fact_chars) {
                    f.text.truncate(idx);
                }
                f
            })
            .collect()
    }

    async fn overlapping_episodes(
        &self,
        scope: &Scope,
        cluster: &FactCluster,
    ) -> Result<Vec<Episode>> {
        let Some(ref topic) = cluster.topic else {
            return Ok(Vec::new());
        };
        let query = ItemQuery::new().scope(scope).current_only();
        Ok(query_all(self.l3.as_ref(), &query)
            .await?
            .into_iter()
            .filter(|e| e.topic.as_ref() == Some(topic) && e.window.overlaps(&cluster.window))
            .collect())
    }

    /// Close member facts in order. On failure reports how many were
    /// closed before it.
    async fn supersede_facts(
        &self,
        episode: &Episode,
        facts: &[Fact],
        now: DateTime<Utc>,
    ) -> std::result::Result<(), (usize, StoreError)> {
        let budget = self.config.supersession_retry_budget;
        for (closed, fact) in facts.iter().enumerate() {
            let valid_to = now.max(fact.validity.valid_from);
            let mut attempt = 1;
            loop {
                match self
                    .l2
                    .mark_superseded(&fact.id, valid_to, Some(episode.id.clone()))
                    .await
                {
                    Ok(()) => break,
                    Err(e @ StoreError::Conflict { .. }) => return Err((closed, e)),
                    Err(e) if attempt >= budget => return Err((closed, e)),
                    Err(e) => {
                        debug!(fact_id = %fact.id, attempt, error = %e, "Retrying supersession");
                        attempt += 1;
                    }
                }
            }
        }
        Ok(())
    }
}
