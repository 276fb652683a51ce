//! Abstract store contracts for the four tiers and the two episode indexes.
//!
//! Concrete backends implement these traits; the engines only ever see
//! `Arc<dyn ...>` handles. Every single-item write must be atomic, batches
//! are not transactional and report per-item results.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::hash::Hash;

use crate::error::StoreError;

use super::text::tokenize;
use super::types::*;

/// An item that can live in a tier store.
pub trait TierItem: Clone + Send + Sync + 'static {
    type Id: Clone + Eq + Hash + Ord + Display + Send + Sync + 'static;

    /// Item kind used in error messages.
    const KIND: &'static str;

    fn id(&self) -> &Self::Id;
    fn scope(&self) -> &Scope;
    fn validity(&self) -> &Validity;

    /// Record creation time, used for ordering.
    fn recorded_at(&self) -> DateTime<Utc>;

    /// Latest change to the item (validity or content append).
    fn revision(&self) -> DateTime<Utc>;

    /// Text matched by [`ItemQuery::text`].
    fn searchable_text(&self) -> String;

    /// Close the validity interval.
    fn close(&mut self, valid_to: DateTime<Utc>, superseded_by: Option<EpisodeId>);

    /// Record a read. Items without access tracking ignore it.
    fn touch(&mut self, _at: DateTime<Utc>) {}
}

impl TierItem for Fact {
    type Id = FactId;
    const KIND: &'static str = "fact";

    fn id(&self) -> &FactId {
        &self.id
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn validity(&self) -> &Validity {
        &self.validity
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn revision(&self) -> DateTime<Utc> {
        self.validity.latest().max(self.created_at)
    }

    fn searchable_text(&self) -> String {
        match &self.triple {
            Some(t) => format!("{} {}", self.text, t),
            None => self.text.clone(),
        }
    }

    fn close(&mut self, valid_to: DateTime<Utc>, superseded_by: Option<EpisodeId>) {
        self.validity.valid_to = Some(valid_to);
        self.superseded_by = superseded_by;
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed_at = Some(at);
    }
}

impl TierItem for Episode {
    type Id = EpisodeId;
    const KIND: &'static str = "episode";

    fn id(&self) -> &EpisodeId {
        &self.id
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn validity(&self) -> &Validity {
        &self.validity
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn revision(&self) -> DateTime<Utc> {
        self.validity.latest().max(self.updated_at)
    }

    fn searchable_text(&self) -> String {
        let mut text = self.narrative.clone();
        for a in &self.assertions {
            text.push(' ');
            text.push_str(&a.triple.to_string());
        }
        text
    }

    fn close(&mut self, valid_to: DateTime<Utc>, superseded_by: Option<EpisodeId>) {
        self.validity.valid_to = Some(valid_to);
        self.superseded_by = superseded_by;
        self.updated_at = self.updated_at.max(valid_to);
    }
}

impl TierItem for KnowledgeDocument {
    type Id = DocumentId;
    const KIND: &'static str = "knowledge document";

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn validity(&self) -> &Validity {
        &self.validity
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn revision(&self) -> DateTime<Utc> {
        self.validity.latest().max(self.updated_at)
    }

    fn searchable_text(&self) -> String {
        let tags: Vec<&str> = self.tags.iter().map(|t| t.as_str()).collect();
        format!("{} {} {}", self.title, self.body, tags.join(" "))
    }

    fn close(&mut self, valid_to: DateTime<Utc>, _superseded_by: Option<EpisodeId>) {
        self.validity.valid_to = Some(valid_to);
        self.updated_at = self.updated_at.max(valid_to);
    }
}

/// Query criteria shared by all tier stores.
///
/// Results are ordered by `(recorded_at, id)` so that `offset`/`limit`
/// paging is restartable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemQuery {
    pub scope: Option<Scope>,
    /// Only items with an open validity interval
    pub current_only: bool,
    /// Only items valid at this instant
    pub as_of: Option<DateTime<Utc>>,
    /// Only items whose `valid_from` falls in this window
    pub valid_from_in: Option<TimeWindow>,
    /// Only items recorded at or before this instant
    pub recorded_before: Option<DateTime<Utc>>,
    /// Only items sharing at least one content token with this text
    pub text: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ItemQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(mut self, scope: &Scope) -> Self {
        self.scope = Some(scope.clone());
        self
    }

    pub fn current_only(mut self) -> Self {
        self.current_only = true;
        self
    }

    pub fn as_of(mut self, at: DateTime<Utc>) -> Self {
        self.as_of = Some(at);
        self
    }

    pub fn valid_from_in(mut self, window: TimeWindow) -> Self {
        self.valid_from_in = Some(window);
        self
    }

    pub fn recorded_before(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_before = Some(at);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Whether an item satisfies every filter (paging excluded).
    pub fn matches<T: TierItem>(&self, item: &T) -> bool {
        if let Some(ref scope) = self.scope {
            if item.scope() != scope {
                return false;
            }
        }
        let validity = item.validity();
        if self.current_only && !validity.is_current() {
            return false;
        }
        if let Some(at) = self.as_of {
            if !validity.is_valid_at(at) {
                return false;
            }
        }
        if let Some(window) = self.valid_from_in {
            if !window.contains(validity.valid_from) {
                return false;
            }
        }
        if let Some(before) = self.recorded_before {
            if item.recorded_at() > before {
                return false;
            }
        }
        if let Some(ref text) = self.text {
            let wanted = tokenize(text);
            if !wanted.is_empty() {
                let have = tokenize(&item.searchable_text());
                if wanted.is_disjoint(&have) {
                    return false;
                }
            }
        }
        true
    }
}

/// Read/write contract for one tier.
#[async_trait]
pub trait TierStore<T: TierItem>: Send + Sync {
    /// Tier served by this store.
    fn tier(&self) -> Tier;

    /// Insert or replace an item.
    async fn put(&self, item: &T) -> Result<T::Id, StoreError>;

    /// Fetch an item by id.
    async fn get(&self, id: &T::Id) -> Result<T, StoreError>;

    /// Items matching the criteria, ordered by `(recorded_at, id)`.
    async fn query(&self, query: &ItemQuery) -> Result<Vec<T>, StoreError>;

    /// Close an item's validity interval.
    ///
    /// Fails with `Conflict` when the item is already closed or `valid_to`
    /// precedes `valid_from`.
    async fn mark_superseded(
        &self,
        id: &T::Id,
        valid_to: DateTime<Utc>,
        superseded_by: Option<EpisodeId>,
    ) -> Result<(), StoreError>;

    /// Update access tracking for an item.
    async fn record_access(&self, id: &T::Id, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Put several items; each succeeds or fails on its own.
    async fn batch_put(&self, items: &[T]) -> Vec<Result<T::Id, StoreError>> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            results.push(self.put(item).await);
        }
        results
    }

    /// Get several items; each succeeds or fails on its own.
    async fn batch_get(&self, ids: &[T::Id]) -> Vec<Result<T, StoreError>> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.get(id).await);
        }
        results
    }
}

/// Page size used by [`query_all`].
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Drain a query by paging through the store.
pub async fn query_all<T: TierItem>(
    store: &dyn TierStore<T>,
    query: &ItemQuery,
) -> Result<Vec<T>, StoreError> {
    let page_size = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
    let mut offset = query.offset.unwrap_or(0);
    let mut items = Vec::new();
    loop {
        let page = store
            .query(&query.clone().offset(offset).limit(page_size))
            .await?;
        let len = page.len();
        items.extend(page);
        if len < page_size {
            return Ok(items);
        }
        offset += len;
    }
}

/// Check and apply a validity closure in place.
pub(crate) fn close_item<T: TierItem>(
    item: &mut T,
    valid_to: DateTime<Utc>,
    superseded_by: Option<EpisodeId>,
) -> Result<(), StoreError> {
    let validity = item.validity();
    if !validity.is_current() {
        return Err(StoreError::conflict(item.id(), "already superseded"));
    }
    if valid_to < validity.valid_from {
        return Err(StoreError::conflict(
            item.id(),
            format!(
                "valid_to {} precedes valid_from {}",
                valid_to, validity.valid_from
            ),
        ));
    }
    item.close(valid_to, superseded_by);
    Ok(())
}

/// Nearest-neighbour hit from a vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub episode_id: EpisodeId,
    pub similarity: f64,
}

/// Entity-match hit from a graph index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphHit {
    pub episode_id: EpisodeId,
    /// Number of requested entities linked to the episode
    pub matched: usize,
}

/// Similarity index over episode embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, id: &EpisodeId, scope: &Scope, vector: &[f32])
        -> Result<(), StoreError>;

    /// Remove an embedding. Returns whether it existed.
    async fn delete(&self, id: &EpisodeId) -> Result<bool, StoreError>;

    async fn contains(&self, id: &EpisodeId) -> Result<bool, StoreError>;

    /// Top `k` episodes of `scope` by similarity, best first.
    async fn search(
        &self,
        scope: &Scope,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>, StoreError>;
}

/// Relational index over episode entities.
#[async_trait]
pub trait GraphIndex: Send + Sync {
    async fn write(
        &self,
        id: &EpisodeId,
        scope: &Scope,
        graph: &EpisodeGraph,
    ) -> Result<(), StoreError>;

    /// Remove an episode's nodes and edges. Returns whether it existed.
    async fn delete(&self, id: &EpisodeId) -> Result<bool, StoreError>;

    async fn contains(&self, id: &EpisodeId) -> Result<bool, StoreError>;

    /// Episodes of `scope` linked to any of the normalized entity names,
    /// most matches first.
    async fn episodes_for_entities(
        &self,
        scope: &Scope,
        entities: &[String],
    ) -> Result<Vec<GraphHit>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fact(scope: &str, text: &str, at: DateTime<Utc>) -> Fact {
        Fact::capture(Scope::new(scope), FactCandidate::new(text), at)
    }

    #[test]
    fn test_query_matches_scope_and_validity() {
        let now = Utc::now();
        let mut f = fact("a", "cache warmed", now);

        assert!(ItemQuery::new().scope(&Scope::new("a")).matches(&f));
        assert!(!ItemQuery::new().scope(&Scope::new("b")).matches(&f));

        close_item(&mut f, now + Duration::minutes(1), None).unwrap();
        assert!(!ItemQuery::new().current_only().matches(&f));
        assert!(ItemQuery::new().as_of(now).matches(&f));
        assert!(!ItemQuery::new().as_of(now + Duration::minutes(2)).matches(&f));
    }

    #[test]
    fn test_query_text_and_window() {
        let now = Utc::now();
        let f = fact("a", "The cache was warmed at boot", now);

        assert!(ItemQuery::new().text("cache").matches(&f));
        assert!(!ItemQuery::new().text("database").matches(&f));

        let window = TimeWindow::ending_at(now, Duration::hours(1));
        assert!(ItemQuery::new().valid_from_in(window).matches(&f));
        let past = TimeWindow::ending_at(now - Duration::hours(2), Duration::hours(1));
        assert!(!ItemQuery::new().valid_from_in(past).matches(&f));
    }

    #[test]
    fn test_close_item_rejects_double_close_and_inverted_interval() {
        let now = Utc::now();
        let mut f = fact("a", "x", now);

        let err = close_item(&mut f, now - Duration::seconds(1), None).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let ep = EpisodeId::new();
        close_item(&mut f, now, Some(ep.clone())).unwrap();
        assert_eq!(f.superseded_by, Some(ep));
        assert_eq!(f.validity.valid_to, Some(now));

        let err = close_item(&mut f, now, None).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }
}
