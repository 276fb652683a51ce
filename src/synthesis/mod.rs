//! Query-time knowledge synthesis.
//!
//! The [`KnowledgeSynthesizer`] searches L3 episodes (vector and graph
//! index) and L4 documents in parallel, ranks them with the configured
//! [`SearchWeights`](crate::memory::SearchWeights), and resolves the claims
//! they make. Contradictions are returned as data on the result, never as
//! errors. Answers are cached per (query, scope) with a TTL; an entry is
//! only served while every contributor is unchanged.

mod cache;
mod policy;
mod synthesizer;

pub use cache::{CacheEntry, CacheKey, CacheStats, ContributorStamp, SynthesisCache};
pub use policy::{Claim, Conflict, ConflictPolicy, MetadataFirstPolicy, Resolution};
pub use synthesizer::{KnowledgeSynthesizer, SynthesisResult};
