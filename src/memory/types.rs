//! Core types for the tiered memory model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random ID.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from a UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from string.
            pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a fact.
    FactId
);
uuid_id!(
    /// Unique identifier for an episode.
    EpisodeId
);
uuid_id!(
    /// Unique identifier for a knowledge document.
    DocumentId
);

/// Memory tier, in increasing order of durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// L1: raw captured facts
    ActiveContext = 1,
    /// L2: facts that passed the significance filter
    Working = 2,
    /// L3: consolidated episodes
    Episodic = 3,
    /// L4: distilled knowledge
    Semantic = 4,
}

impl Tier {
    /// Get the next more durable tier.
    pub fn next(&self) -> Option<Tier> {
        match self {
            Self::ActiveContext => Some(Self::Working),
            Self::Working => Some(Self::Episodic),
            Self::Episodic => Some(Self::Semantic),
            Self::Semantic => None,
        }
    }

    /// Short label (`L1` .. `L4`).
    pub fn label(&self) -> &'static str {
        match self {
            Self::ActiveContext => "L1",
            Self::Working => "L2",
            Self::Episodic => "L3",
            Self::Semantic => "L4",
        }
    }

    pub(crate) fn from_level(level: i64) -> Option<Tier> {
        match level {
            1 => Some(Self::ActiveContext),
            2 => Some(Self::Working),
            3 => Some(Self::Episodic),
            4 => Some(Self::Semantic),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Owning scope of an item: an agent, session or namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope(pub String);

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Scope {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Bi-temporal validity interval.
///
/// `valid_to = None` means the item is currently valid. A closed interval
/// always satisfies `valid_to >= valid_from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl Validity {
    /// An open interval starting at `valid_from`.
    pub fn open(valid_from: DateTime<Utc>) -> Self {
        Self {
            valid_from,
            valid_to: None,
        }
    }

    /// Whether the interval is still open.
    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Whether the item was valid at `at` (half-open: `[from, to)`).
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_to.map_or(true, |to| to > at)
    }

    /// Latest timestamp recorded on the interval.
    pub fn latest(&self) -> DateTime<Utc> {
        self.valid_to.map_or(self.valid_from, |to| to.max(self.valid_from))
    }
}

/// Subject/predicate/object claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl Triple {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }

    /// Case- and whitespace-insensitive `(subject, predicate)` key.
    pub fn slot(&self) -> (String, String) {
        (normalize(&self.subject), normalize(&self.predicate))
    }

    /// Normalized object value.
    pub fn value(&self) -> String {
        normalize(&self.object)
    }
}

impl std::fmt::Display for Triple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.subject, self.predicate, self.object)
    }
}

/// Lowercase and collapse whitespace.
pub fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extraction result that has not yet been captured into L1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactCandidate {
    pub text: String,
    #[serde(default)]
    pub triple: Option<Triple>,
    pub certainty: f64,
    pub impact: f64,
    pub criticality: f64,
    #[serde(default)]
    pub source_ref: Option<String>,
    /// When the claim became true; defaults to capture time
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
}

impl FactCandidate {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            triple: None,
            certainty: 0.5,
            impact: 0.5,
            criticality: 0.5,
            source_ref: None,
            valid_from: None,
        }
    }

    pub fn with_triple(mut self, triple: Triple) -> Self {
        self.triple = Some(triple);
        self
    }

    pub fn with_significance(mut self, certainty: f64, impact: f64, criticality: f64) -> Self {
        self.certainty = certainty;
        self.impact = impact;
        self.criticality = criticality;
        self
    }

    pub fn with_source(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    pub fn with_valid_from(mut self, at: DateTime<Utc>) -> Self {
        self.valid_from = Some(at);
        self
    }
}

/// Atomic extracted claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub scope: Scope,
    pub text: String,
    pub triple: Option<Triple>,
    pub certainty: f64,
    pub impact: f64,
    pub criticality: f64,
    /// Last computed CIAR score
    pub ciar_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub validity: Validity,
    /// Episode that consolidated this fact
    pub superseded_by: Option<EpisodeId>,
    pub source_ref: Option<String>,
    pub access_count: u64,
    /// `None` until the fact is first read back
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Set once the fact has been written to working memory
    pub promoted_at: Option<DateTime<Utc>>,
    /// When promotion last scored the fact without promoting it
    #[serde(default)]
    pub scored_at: Option<DateTime<Utc>>,
}

impl Fact {
    /// Capture a candidate as a new fact.
    pub fn capture(scope: Scope, candidate: FactCandidate, now: DateTime<Utc>) -> Self {
        Self {
            id: FactId::new(),
            scope,
            text: candidate.text,
            triple: candidate.triple,
            certainty: candidate.certainty,
            impact: candidate.impact,
            criticality: candidate.criticality,
            ciar_score: None,
            created_at: now,
            validity: Validity::open(candidate.valid_from.unwrap_or(now)),
            superseded_by: None,
            source_ref: candidate.source_ref,
            access_count: 0,
            last_accessed_at: None,
            promoted_at: None,
            scored_at: None,
        }
    }

    /// Whether the fact is part of "current state".
    pub fn is_current(&self) -> bool {
        self.validity.is_current()
    }

    pub fn is_promoted(&self) -> bool {
        self.promoted_at.is_some()
    }

    /// Never scored, or read back since the last score.
    ///
    /// Age decay only lowers a score, so a fact that missed the threshold
    /// can only reach it again through a new access.
    pub fn needs_scoring(&self) -> bool {
        match (self.scored_at, self.last_accessed_at) {
            (None, _) => true,
            (Some(scored), Some(accessed)) => accessed > scored,
            (Some(_), None) => false,
        }
    }

    /// Topic key used for clustering: the normalized subject when present.
    pub fn topic(&self) -> Option<String> {
        self.triple.as_ref().map(|t| normalize(&t.subject))
    }
}

/// Closed time interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < start {
            return Err(Error::invalid_config(format!(
                "time window end {} precedes start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// Window ending at `end` and spanning `length`.
    pub fn ending_at(end: DateTime<Utc>, length: chrono::Duration) -> Self {
        Self {
            start: end - length,
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Structured claim carried by an episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub triple: Triple,
    /// Fact the claim came from, when known
    pub fact_id: Option<FactId>,
    pub valid_from: DateTime<Utc>,
    pub certainty: f64,
}

/// Named entity in an episode graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
}

/// Directed labelled relation between two entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub source: String,
    pub label: String,
    pub target: String,
}

/// Graph representation of an episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeGraph {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

impl EpisodeGraph {
    /// Build a graph from structured assertions.
    pub fn from_assertions(assertions: &[Assertion]) -> Self {
        let mut graph = Self::default();
        for assertion in assertions {
            let t = &assertion.triple;
            graph.add_entity(&t.subject, None);
            graph.add_entity(&t.object, None);
            graph.add_relation(&t.subject, &t.predicate, &t.object);
        }
        graph
    }

    /// Add an entity if not already present (by normalized name).
    pub fn add_entity(&mut self, name: &str, kind: Option<String>) {
        let key = normalize(name);
        if key.is_empty() || self.entities.iter().any(|e| normalize(&e.name) == key) {
            return;
        }
        self.entities.push(Entity {
            name: name.trim().to_string(),
            kind,
        });
    }

    pub fn add_relation(&mut self, source: &str, label: &str, target: &str) {
        let relation = Relation {
            source: source.trim().to_string(),
            label: label.trim().to_string(),
            target: target.trim().to_string(),
        };
        if !self.relations.contains(&relation) {
            self.relations.push(relation);
        }
    }

    /// Merge another graph into this one.
    pub fn merge(&mut self, other: EpisodeGraph) {
        for entity in other.entities {
            self.add_entity(&entity.name, entity.kind);
        }
        for relation in other.relations {
            self.add_relation(&relation.source, &relation.label, &relation.target);
        }
    }

    /// Normalized entity names, sorted.
    pub fn entity_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self.entities.iter().map(|e| normalize(&e.name)).collect();
        names.into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

/// Consolidated cluster of facts covering a bounded time window.
///
/// The embedding lives in the vector index and the graph in the graph
/// index; the record keeps the structured metadata both were built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub scope: Scope,
    /// Clustering key the episode was built from
    pub topic: Option<String>,
    pub window: TimeWindow,
    /// Non-owning references to member facts (never empty)
    pub fact_ids: Vec<FactId>,
    pub narrative: String,
    pub assertions: Vec<Assertion>,
    /// Normalized entity names from the graph representation
    pub entities: Vec<String>,
    pub validity: Validity,
    pub superseded_by: Option<EpisodeId>,
    /// Earlier episodes this one closed
    pub supersedes: Vec<EpisodeId>,
    /// Explicitly flagged as resolved and eligible for distillation
    pub resolved: bool,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Episode {
    pub fn is_current(&self) -> bool {
        self.validity.is_current()
    }
}

/// Distilled, reusable knowledge with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: DocumentId,
    pub scope: Scope,
    pub title: String,
    pub body: String,
    /// Source episodes in derivation order (never empty)
    pub provenance: Vec<EpisodeId>,
    pub tags: BTreeSet<String>,
    pub confidence: f64,
    pub assertions: Vec<Triple>,
    pub validity: Validity,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeDocument {
    /// Append episodes to the provenance list, skipping ones already present.
    ///
    /// Returns the number of episodes added.
    pub fn append_provenance(&mut self, episodes: &[EpisodeId], now: DateTime<Utc>) -> usize {
        let mut added = 0;
        for id in episodes {
            if !self.provenance.contains(id) {
                self.provenance.push(id.clone());
                added += 1;
            }
        }
        if added > 0 {
            self.updated_at = now;
        }
        added
    }
}

/// Reference to a stored item of any tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SourceRef {
    Fact(FactId),
    Episode(EpisodeId),
    Document(DocumentId),
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fact(id) => write!(f, "fact:{}", id),
            Self::Episode(id) => write!(f, "episode:{}", id),
            Self::Document(id) => write!(f, "document:{}", id),
        }
    }
}

/// One retrieved item inside a [`ContextBlock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub source: SourceRef,
    pub text: String,
    pub score: f64,
}

/// Request-scoped assembly of retrieved items for a reasoning call.
///
/// Never persisted; owned by the request that built it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBlock {
    pub scope: Scope,
    pub query: String,
    pub items: Vec<ContextItem>,
    max_chars: usize,
}

impl ContextBlock {
    pub fn new(scope: Scope, query: impl Into<String>, max_chars: usize) -> Self {
        Self {
            scope,
            query: query.into(),
            items: Vec::new(),
            max_chars,
        }
    }

    /// Add an item if it fits the character budget. Returns whether it was added.
    pub fn push(&mut self, item: ContextItem) -> bool {
        if self.char_count() + item.text.len() > self.max_chars {
            return false;
        }
        self.items.push(item);
        true
    }

    pub fn char_count(&self) -> usize {
        self.items.iter().map(|i| i.text.len()).sum()
    }

    pub fn sources(&self) -> Vec<SourceRef> {
        self.items.iter().map(|i| i.source.clone()).collect()
    }

    /// Render as a numbered list for prompting.
    pub fn render(&self) -> String {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| format!("[{}] ({}) {}", i + 1, item.source, item.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Relative weights for hybrid retrieval. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSearchWeights", into = "RawSearchWeights")]
pub struct SearchWeights {
    vector: f64,
    graph: f64,
    recency: f64,
}

#[derive(Serialize, Deserialize)]
struct RawSearchWeights {
    vector: f64,
    graph: f64,
    recency: f64,
}

impl SearchWeights {
    /// Allowed deviation of the weight sum from 1.0.
    pub const TOLERANCE: f64 = 0.01;

    pub fn new(vector: f64, graph: f64, recency: f64) -> Result<Self> {
        for (name, w) in [("vector", vector), ("graph", graph), ("recency", recency)] {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::invalid_config(format!(
                    "search weight {} must be a non-negative number, got {}",
                    name, w
                )));
            }
        }
        let sum = vector + graph + recency;
        if (sum - 1.0).abs() > Self::TOLERANCE {
            return Err(Error::invalid_config(format!(
                "search weights must sum to 1.0 (got {:.3})",
                sum
            )));
        }
        Ok(Self {
            vector,
            graph,
            recency,
        })
    }

    pub fn vector(&self) -> f64 {
        self.vector
    }

    pub fn graph(&self) -> f64 {
        self.graph
    }

    pub fn recency(&self) -> f64 {
        self.recency
    }

    /// Weighted combination of the three signals.
    pub fn combine(&self, similarity: f64, graph_overlap: f64, freshness: f64) -> f64 {
        self.vector * similarity + self.graph * graph_overlap + self.recency * freshness
    }
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            vector: 0.5,
            graph: 0.3,
            recency: 0.2,
        }
    }
}

impl TryFrom<RawSearchWeights> for SearchWeights {
    type Error = Error;

    fn try_from(raw: RawSearchWeights) -> Result<Self> {
        Self::new(raw.vector, raw.graph, raw.recency)
    }
}

impl From<SearchWeights> for RawSearchWeights {
    fn from(w: SearchWeights) -> Self {
        Self {
            vector: w.vector,
            graph: w.graph,
            recency: w.recency,
        }
    }
}
