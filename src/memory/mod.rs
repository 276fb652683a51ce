//! Tiered memory model and store ports.
//!
//! Items move through four tiers of increasing durability:
//!
//! - **L1 Active context**: raw captured [`Fact`]s
//! - **L2 Working memory**: facts that passed the CIAR significance filter
//! - **L3 Episodic memory**: [`Episode`]s, dual-indexed in a [`VectorIndex`] and a [`GraphIndex`]
//! - **L4 Semantic memory**: distilled [`KnowledgeDocument`]s with provenance
//!
//! Every durable item carries a bi-temporal [`Validity`] interval; superseded
//! items are closed, never deleted.
//!
//! ## Example
//!
//! ```rust,ignore
//! use memory_lifecycle::memory::{InMemoryTierStore, ItemQuery, TierStore, Fact, Tier};
//!
//! let l2 = InMemoryTierStore::<Fact>::new(Tier::Working);
//! l2.put(&fact).await?;
//!
//! let current = l2.query(&ItemQuery::new().scope(&scope).current_only()).await?;
//! ```

mod in_memory;
mod ports;
mod schema;
mod sqlite;
pub mod text;
mod types;

pub use in_memory::{InMemoryGraphIndex, InMemoryTierStore, InMemoryVectorIndex};
pub use ports::{
    query_all, GraphHit, GraphIndex, ItemQuery, TierItem, TierStore, VectorHit, VectorIndex,
    DEFAULT_PAGE_SIZE,
};
pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use sqlite::SqliteFactStore;
pub use types::{
    normalize, Assertion, ContextBlock, ContextItem, DocumentId, Entity, Episode, EpisodeGraph,
    EpisodeId, Fact, FactCandidate, FactId, KnowledgeDocument, Relation, Scope, SearchWeights,
    SourceRef, Tier, TimeWindow, Triple, Validity,
};
