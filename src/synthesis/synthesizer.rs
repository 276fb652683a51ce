//! Query-time synthesis over L3 episodes and L4 documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::SynthesisConfig;
use crate::error::{Result, StoreError};
use crate::memory::text::{jaccard, tokenize};
use crate::memory::{
    normalize, query_all, ContextBlock, ContextItem, Episode, EpisodeId, GraphIndex, ItemQuery,
    KnowledgeDocument, Scope, SourceRef, TierItem, TierStore, VectorIndex,
};
use crate::provider::ReasoningProvider;

use super::cache::{content_fingerprint, CacheEntry, CacheKey, ContributorStamp, SynthesisCache};
use super::policy::{Claim, Conflict, ConflictPolicy, MetadataFirstPolicy, Resolution};

/// Longest entity phrase looked up in the graph index.
const MAX_ENTITY_WORDS: usize = 3;

/// Answer to a synthesis query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub query: String,
    pub scope: Scope,
    pub answer: String,
    /// Episodes and documents that made it into the context
    pub contributors: Vec<SourceRef>,
    /// Preferred claim per `(subject, predicate)` slot
    pub accepted: Vec<Claim>,
    pub conflict: bool,
    pub conflicts: Vec<Conflict>,
    pub context: ContextBlock,
    pub from_cache: bool,
    pub generated_at: DateTime<Utc>,
}

impl SynthesisResult {
    /// Every source named by any conflict.
    pub fn conflict_sources(&self) -> Vec<SourceRef> {
        let mut sources: Vec<SourceRef> =
            self.conflicts.iter().flat_map(|c| c.sources()).collect();
        sources.sort();
        sources.dedup();
        sources
    }
}

/// A retrieved item with its ranking signals folded into a score.
#[derive(Debug)]
struct Ranked {
    source: SourceRef,
    text: String,
    score: f64,
    revision: DateTime<Utc>,
    fingerprint: String,
    claims: Vec<Claim>,
}

/// Merges episodes and documents into an answer, surfacing disagreements.
pub struct KnowledgeSynthesizer {
    l3: Arc<dyn TierStore<Episode>>,
    l4: Arc<dyn TierStore<KnowledgeDocument>>,
    vector: Arc<dyn VectorIndex>,
    graph: Arc<dyn GraphIndex>,
    provider: Arc<dyn ReasoningProvider>,
    policy: Arc<dyn ConflictPolicy>,
    cache: SynthesisCache,
    config: SynthesisConfig,
    clock: Arc<dyn Clock>,
}

impl KnowledgeSynthesizer {
    pub fn new(
        l3: Arc<dyn TierStore<Episode>>,
        l4: Arc<dyn TierStore<KnowledgeDocument>>,
        vector: Arc<dyn VectorIndex>,
        graph: Arc<dyn GraphIndex>,
        provider: Arc<dyn ReasoningProvider>,
        config: SynthesisConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = SynthesisCache::new(config.cache_ttl(), config.cache_capacity, clock.clone());
        Ok(Self {
            l3,
            l4,
            vector,
            graph,
            provider,
            policy: Arc::new(MetadataFirstPolicy),
            cache,
            config,
            clock,
        })
    }

    /// Replace the conflict resolution policy.
    pub fn with_policy(mut self, policy: Arc<dyn ConflictPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn cache(&self) -> &SynthesisCache {
        &self.cache
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn synthesize(&self, query: &str, scope: &Scope) -> Result<SynthesisResult> {
        let key = CacheKey::generate(query, scope);
        if let Some(entry) = self.cache.get(&key).await {
            if self.is_fresh(&entry).await? {
                self.cache.record_hit(&key).await;
                debug!(key = %key, "Synthesis cache hit");
                let mut result = entry.result;
                result.from_cache = true;
                return Ok(result);
            }
            debug!(key = %key, "Cached synthesis has changed contributors");
            self.cache.invalidate(&key).await;
        }
        self.cache.record_miss().await;

        let (episodes, documents) = tokio::join!(
            self.rank_episodes(query, scope),
            self.rank_documents(query, scope)
        );
        let mut ranked = episodes?;
        ranked.extend(documents?);
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.source.cmp(&b.source))
        });

        let mut context = ContextBlock::new(scope.clone(), query, self.config.context_max_chars);
        let mut stamps = Vec::new();
        let mut claims = Vec::new();
        for candidate in ranked {
            let item = ContextItem {
                source: candidate.source.clone(),
                text: candidate.text,
                score: candidate.score,
            };
            if !context.push(item) {
                debug!(source = %candidate.source, "Item exceeds remaining context budget");
                continue;
            }
            stamps.push(ContributorStamp {
                source: candidate.source,
                revision: candidate.revision,
                fingerprint: candidate.fingerprint,
            });
            claims.extend(candidate.claims);
        }

        let resolution = self.policy.resolve(claims);
        if resolution.has_conflict() {
            info!(
                conflicts = resolution.conflicts.len(),
                policy = self.policy.name(),
                "Synthesis found conflicting claims"
            );
        }

        let now = self.clock.now();
        let answer = render_answer(query, &context, &resolution);
        let result = SynthesisResult {
            query: query.to_string(),
            scope: scope.clone(),
            answer,
            contributors: context.sources(),
            conflict: resolution.has_conflict(),
            accepted: resolution.accepted,
            conflicts: resolution.conflicts,
            context,
            from_cache: false,
            generated_at: now,
        };
        self.cache
            .insert(CacheEntry::new(key, result.clone(), stamps, now))
            .await;
        Ok(result)
    }

    /// Whether every contributor still exists, is current and is unchanged.
    async fn is_fresh(&self, entry: &CacheEntry) -> Result<bool> {
        let mut episodes = (Vec::new(), Vec::new());
        let mut documents = (Vec::new(), Vec::new());
        for stamp in &entry.contributors {
            match &stamp.source {
                SourceRef::Episode(id) => {
                    episodes.0.push(id.clone());
                    episodes.1.push(stamp);
                }
                SourceRef::Document(id) => {
                    documents.0.push(id.clone());
                    documents.1.push(stamp);
                }
                SourceRef::Fact(_) => {}
            }
        }

        let found = self.l3.batch_get(&episodes.0).await;
        for (found, stamp) in found.into_iter().zip(episodes.1) {
            if !unchanged(found, stamp)? {
                return Ok(false);
            }
        }
        let found = self.l4.batch_get(&documents.0).await;
        for (found, stamp) in found.into_iter().zip(documents.1) {
            if !unchanged(found, stamp)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn rank_episodes(&self, query: &str, scope: &Scope) -> Result<Vec<Ranked>> {
        let k = self.config.max_candidates;
        let query_tokens = tokenize(query);

        let mut similarity: Vec<(EpisodeId, f64)> = match self.provider.embed(query).await {
            Ok(embedding) => self
                .vector
                .search(scope, &embedding, k)
                .await?
                .into_iter()
                .map(|hit| (hit.episode_id, hit.similarity.max(0.0)))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Query embedding failed, falling back to text search");
                query_all(
                    self.l3.as_ref(),
                    &ItemQuery::new().scope(scope).current_only().text(query),
                )
                .await?
                .into_iter()
                .map(|ep| {
                    let sim = jaccard(&query_tokens, &tokenize(&ep.searchable_text()));
                    (ep.id, sim)
                })
                .collect()
            }
        };
        similarity.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        similarity.truncate(k);

        let entities = query_entities(query);
        let mut graph_hits = if entities.is_empty() {
            Vec::new()
        } else {
            self.graph.episodes_for_entities(scope, &entities).await?
        };
        graph_hits.sort_by(|a, b| {
            b.matched
                .cmp(&a.matched)
                .then_with(|| a.episode_id.cmp(&b.episode_id))
        });
        graph_hits.truncate(k);
        let max_matched = graph_hits.iter().map(|h| h.matched).max().unwrap_or(1).max(1);

        let mut signals: HashMap<EpisodeId, (f64, f64)> = HashMap::new();
        for (id, sim) in similarity {
            signals.entry(id).or_default().0 = sim;
        }
        for hit in graph_hits {
            signals.entry(hit.episode_id).or_default().1 = hit.matched as f64 / max_matched as f64;
        }

        let mut ids: Vec<EpisodeId> = signals.keys().cloned().collect();
        ids.sort();
        let now = self.clock.now();
        let mut ranked = Vec::with_capacity(ids.len());
        for (id, found) in ids.iter().zip(self.l3.batch_get(&ids).await) {
            let episode = match found {
                Ok(episode) => episode,
                Err(StoreError::NotFound { .. }) => {
                    debug!(episode_id = %id, "Index entry without episode record");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if !episode.is_current() || &episode.scope != scope {
                continue;
            }
            let (sim, overlap) = signals.get(id).copied().unwrap_or_default();
            let revision = episode.revision();
            ranked.push(Ranked {
                source: SourceRef::Episode(episode.id.clone()),
                score: self.config.search_weights.combine(
                    sim,
                    overlap,
                    self.freshness(revision, now),
                ),
                revision,
                fingerprint: content_fingerprint(&episode)?,
                claims: episode_claims(&episode),
                text: episode.narrative,
            });
        }
        Ok(ranked)
    }

    async fn rank_documents(&self, query: &str, scope: &Scope) -> Result<Vec<Ranked>> {
        let query_tokens = tokenize(query);
        let entities: BTreeSet<String> = query_entities(query).into_iter().collect();
        let now = self.clock.now();

        let documents = query_all(
            self.l4.as_ref(),
            &ItemQuery::new().scope(scope).current_only().text(query),
        )
        .await?;

        let mut ranked = documents
            .into_iter()
            .map(|doc| -> Result<Ranked> {
                let sim = jaccard(&query_tokens, &tokenize(&doc.searchable_text()));
                let overlap = if doc.tags.is_empty() {
                    0.0
                } else {
                    let hits = doc
                        .tags
                        .iter()
                        .filter(|t| entities.contains(&normalize(t)))
                        .count();
                    hits as f64 / doc.tags.len() as f64
                };
                let revision = doc.revision();
                let fingerprint = content_fingerprint(&doc)?;
                let claims = doc
                    .assertions
                    .iter()
                    .map(|triple| Claim {
                        triple: triple.clone(),
                        source: SourceRef::Document(doc.id.clone()),
                        valid_from: doc.validity.valid_from,
                        confidence: doc.confidence,
                    })
                    .collect();
                Ok(Ranked {
                    source: SourceRef::Document(doc.id.clone()),
                    text: format!("{}: {}", doc.title, doc.body),
                    score: self.config.search_weights.combine(
                        sim,
                        overlap,
                        self.freshness(revision, now),
                    ),
                    revision,
                    fingerprint,
                    claims,
                })
            })
            .collect::<Result<Vec<Ranked>>>()?;
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.source.cmp(&b.source))
        });
        ranked.truncate(self.config.max_candidates);
        Ok(ranked)
    }

    /// Exponential decay in [0, 1] halving every `freshness_half_life_secs`.
    fn freshness(&self, revision: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age = (now - revision).num_seconds().max(0) as f64;
        0.5f64.powf(age / self.config.freshness_half_life_secs as f64)
    }
}

fn unchanged<T: TierItem + Serialize>(
    found: std::result::Result<T, StoreError>,
    stamp: &ContributorStamp,
) -> Result<bool> {
    match found {
        Ok(item) => Ok(item.validity().is_current()
            && item.revision() <= stamp.revision
            && content_fingerprint(&item)? == stamp.fingerprint),
        Err(StoreError::NotFound { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn episode_claims(episode: &Episode) -> Vec<Claim> {
    episode
        .assertions
        .iter()
        .map(|a| Claim {
            triple: a.triple.clone(),
            source: match &a.fact_id {
                Some(id) => SourceRef::Fact(id.clone()),
                None => SourceRef::Episode(episode.id.clone()),
            },
            valid_from: a.valid_from,
            confidence: a.certainty,
        })
        .collect()
}

/// Candidate entity names: every run of up to three query words.
fn query_entities(query: &str) -> Vec<String> {
    let words: Vec<String> = query
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    let mut names = BTreeSet::new();
    for n in 1..=MAX_ENTITY_WORDS {
        for window in words.windows(n) {
            names.insert(window.join(" "));
        }
    }
    names.into_iter().collect()
}

fn render_answer(query: &str, context: &ContextBlock, resolution: &Resolution) -> String {
    if context.is_empty() {
        return format!("No stored knowledge matches \"{}\".", query);
    }
    let mut lines: Vec<String> = resolution
        .accepted
        .iter()
        .map(|c| format!("- {}", c.triple))
        .collect();
    for conflict in &resolution.conflicts {
        let alternatives: Vec<String> = conflict
            .claims
            .iter()
            .map(|c| format!("{} ({})", c.triple.object, c.source))
            .collect();
        lines.push(format!(
            "! {} {} is disputed: {}; preferring {}",
            conflict.subject,
            conflict.predicate,
            alternatives.join(", "),
            conflict.winner.triple.object
        ));
    }
    if !lines.is_empty() {
        lines.push(String::new());
    }
    lines.push("Sources:".to_string());
    lines.push(context.render());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ProviderError;
    use crate::memory::{
        Assertion, DocumentId, EpisodeGraph, FactId, InMemoryGraphIndex, InMemoryTierStore,
        InMemoryVectorIndex, Tier, TimeWindow, Triple, Validity,
    };
    use crate::testing::{embed_text, ProviderOp, ScriptedProvider};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    struct Fixture {
        synth: KnowledgeSynthesizer,
        l3: Arc<InMemoryTierStore<Episode>>,
        l4: Arc<InMemoryTierStore<KnowledgeDocument>>,
        vector: Arc<InMemoryVectorIndex>,
        graph: Arc<InMemoryGraphIndex>,
        provider: ScriptedProvider,
        clock: Arc<ManualClock>,
        scope: Scope,
    }

    fn fixture() -> Fixture {
        let l3 = Arc::new(InMemoryTierStore::new(Tier::Episodic));
        let l4 = Arc::new(InMemoryTierStore::new(Tier::Semantic));
        let vector = Arc::new(InMemoryVectorIndex::new());
        let graph = Arc::new(InMemoryGraphIndex::new());
        let provider = ScriptedProvider::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let synth = KnowledgeSynthesizer::new(
            l3.clone(),
            l4.clone(),
            vector.clone(),
            graph.clone(),
            Arc::new(provider.clone()),
            SynthesisConfig::default(),
            clock.clone(),
        )
        .unwrap();
        Fixture {
            synth,
            l3,
            l4,
            vector,
            graph,
            provider,
            clock,
            scope: Scope::new("agent"),
        }
    }

    impl Fixture {
        async fn episode(&self, narrative: &str, triples: &[(&str, &str, &str, i64)]) -> Episode {
            let now = self.clock.now();
            let assertions: Vec<Assertion> = triples
                .iter()
                .map(|(s, p, o, offset)| Assertion {
                    triple: Triple::new(*s, *p, *o),
                    fact_id: Some(FactId::new()),
                    valid_from: now + Duration::minutes(*offset),
                    certainty: 0.8,
                })
                .collect();
            let graph = EpisodeGraph::from_assertions(&assertions);
            let episode = Episode {
                id: EpisodeId::new(),
                scope: self.scope.clone(),
                topic: None,
                window: TimeWindow::ending_at(now, Duration::hours(1)),
                fact_ids: assertions.iter().filter_map(|a| a.fact_id.clone()).collect(),
                narrative: narrative.to_string(),
                entities: graph.entity_names(),
                assertions,
                validity: Validity::open(now),
                superseded_by: None,
                supersedes: Vec::new(),
                resolved: false,
                confidence: 0.8,
                created_at: now,
                updated_at: now,
            };
            self.vector
                .upsert(&episode.id, &self.scope, &embed_text(narrative))
                .await
                .unwrap();
            self.graph
                .write(&episode.id, &self.scope, &graph)
                .await
                .unwrap();
            self.l3.put(&episode).await.unwrap();
            episode
        }
    }

    #[tokio::test]
    async fn test_conflicting_assertions_are_reported_with_both_sources() {
        let fx = fixture();
        let episode = fx
            .episode(
                "api auth basic; api auth jwt",
                &[("api", "auth", "basic", 0), ("api", "auth", "jwt", 5)],
            )
            .await;

        let result = fx.synth.synthesize("api auth", &fx.scope).await.unwrap();
        assert!(result.conflict);
        assert_eq!(result.contributors, vec![SourceRef::Episode(episode.id.clone())]);

        let mut expected: Vec<SourceRef> = episode
            .assertions
            .iter()
            .map(|a| SourceRef::Fact(a.fact_id.clone().unwrap()))
            .collect();
        expected.sort();
        assert_eq!(result.conflict_sources(), expected);
        assert_eq!(result.conflicts[0].winner.triple.object, "jwt");
        assert!(result.answer.contains("is disputed"));
    }

    #[tokio::test]
    async fn test_second_query_is_served_from_cache() {
        let fx = fixture();
        fx.episode("deploy uses canary", &[("deploy", "uses", "canary", 0)])
            .await;

        let first = fx.synth.synthesize("deploy", &fx.scope).await.unwrap();
        let second = fx.synth.synthesize("  Deploy ", &fx.scope).await.unwrap();
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.answer, first.answer);
        assert!(!second.conflict);
        assert_eq!(fx.provider.calls(ProviderOp::Embed), 1);

        let stats = fx.synth.cache().stats().await;
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_closed_contributor_invalidates_cache_entry() {
        let fx = fixture();
        let old = fx
            .episode("deploy uses canary", &[("deploy", "uses", "canary", 0)])
            .await;
        fx.synth.synthesize("deploy", &fx.scope).await.unwrap();

        fx.clock.advance(Duration::seconds(10));
        fx.l3
            .mark_superseded(&old.id, fx.clock.now(), None)
            .await
            .unwrap();
        let new = fx
            .episode("deploy uses blue green", &[("deploy", "uses", "blue green", 0)])
            .await;

        let result = fx.synth.synthesize("deploy", &fx.scope).await.unwrap();
        assert!(!result.from_cache);
        assert_eq!(result.contributors, vec![SourceRef::Episode(new.id)]);
        assert_eq!(result.accepted[0].triple.object, "blue green");
        assert_eq!(fx.synth.cache().stats().await.invalidations, 1);
    }

    #[tokio::test]
    async fn test_contributor_rewritten_at_same_instant_invalidates_cache_entry() {
        let fx = fixture();
        let mut episode = fx
            .episode("deploy uses canary", &[("deploy", "uses", "canary", 0)])
            .await;
        fx.synth.synthesize("deploy", &fx.scope).await.unwrap();

        // Rewritten without the clock moving, so timestamps alone cannot tell
        episode.narrative = "deploy uses rolling".to_string();
        episode.assertions[0].triple = Triple::new("deploy", "uses", "rolling");
        fx.l3.put(&episode).await.unwrap();

        let result = fx.synth.synthesize("deploy", &fx.scope).await.unwrap();
        assert!(!result.from_cache);
        assert_eq!(result.accepted[0].triple.object, "rolling");
        assert_eq!(fx.synth.cache().stats().await.invalidations, 1);
    }

    #[tokio::test]
    async fn test_cache_entry_expires_after_ttl() {
        let fx = fixture();
        fx.episode("deploy uses canary", &[("deploy", "uses", "canary", 0)])
            .await;
        fx.synth.synthesize("deploy", &fx.scope).await.unwrap();

        fx.clock
            .advance(Duration::seconds(fx.synth.config().cache_ttl_secs as i64));
        let result = fx.synth.synthesize("deploy", &fx.scope).await.unwrap();
        assert!(!result.from_cache);
        assert_eq!(fx.synth.cache().stats().await.expirations, 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_text_search() {
        let fx = fixture();
        let episode = fx
            .episode("deploy uses canary", &[("deploy", "uses", "canary", 0)])
            .await;
        fx.provider.fail_always(
            ProviderOp::Embed,
            ProviderError::Unavailable("embedding service down".into()),
        );

        let result = fx.synth.synthesize("canary", &fx.scope).await.unwrap();
        assert_eq!(result.contributors, vec![SourceRef::Episode(episode.id)]);
    }

    #[tokio::test]
    async fn test_documents_contribute_and_agreeing_claims_do_not_conflict() {
        let fx = fixture();
        let episode = fx
            .episode("deploy uses canary", &[("deploy", "uses", "canary", 0)])
            .await;
        let now = fx.clock.now();
        let doc = KnowledgeDocument {
            id: DocumentId::new(),
            scope: fx.scope.clone(),
            title: "Deploy practice".to_string(),
            body: "Deploys roll out through a canary".to_string(),
            provenance: vec![episode.id.clone()],
            tags: ["deploy".to_string()].into_iter().collect(),
            confidence: 0.9,
            assertions: vec![Triple::new("Deploy", "uses", "Canary")],
            validity: Validity::open(now),
            created_at: now,
            updated_at: now,
        };
        fx.l4.put(&doc).await.unwrap();

        let result = fx.synth.synthesize("deploy", &fx.scope).await.unwrap();
        assert!(!result.conflict);
        assert_eq!(result.contributors.len(), 2);
        assert!(result.contributors.contains(&SourceRef::Document(doc.id)));
        assert_eq!(result.accepted.len(), 1);
    }

    #[tokio::test]
    async fn test_other_scopes_are_not_searched() {
        let fx = fixture();
        fx.episode("deploy uses canary", &[("deploy", "uses", "canary", 0)])
            .await;

        let result = fx
            .synth
            .synthesize("deploy", &Scope::new("someone-else"))
            .await
            .unwrap();
        assert!(result.contributors.is_empty());
        assert!(result.answer.starts_with("No stored knowledge"));
    }

    #[test]
    fn test_query_entities_cover_short_phrases() {
        assert_eq!(
            query_entities("Who owns the API gateway?"),
            vec![
                "api",
                "api gateway",
                "gateway",
                "owns",
                "owns the",
                "owns the api",
                "the",
                "the api",
                "the api gateway",
                "who",
                "who owns",
                "who owns the",
            ]
        );
    }
}
