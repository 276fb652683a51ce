//! # memory-lifecycle
//!
//! A tiered memory engine for agents. Observations enter active context
//! (L1) and move down the hierarchy as they prove significant:
//!
//! - **Scoring**: CIAR significance (certainty × impact × criticality,
//!   decayed by age, boosted by recent access)
//! - **Promotion** (L1 → L2): facts scoring above the scope threshold
//! - **Consolidation** (L2 → L3): time-windowed clusters of facts become
//!   episodes indexed in both a vector and a graph index
//! - **Distillation** (L3 → L4): recurring patterns across episodes become
//!   knowledge documents with provenance
//! - **Synthesis**: query-time merge of L3 and L4 with explicit conflict
//!   reporting and a revision-checked TTL cache
//! - **Orchestrator**: per-scope leases, cycles and scheduling
//!
//! Every item carries a bi-temporal validity interval. Superseded items
//! are closed, never deleted.
//!
//! ## Example
//!
//! ```rust,ignore
//! use memory_lifecycle::{
//!     CancelToken, LifecycleConfig, LifecycleOrchestrator, MemoryStores, Scope, SystemClock,
//! };
//!
//! let orchestrator = LifecycleOrchestrator::new(
//!     MemoryStores::in_memory(),
//!     provider,
//!     LifecycleConfig::load("lifecycle.json")?,
//!     Arc::new(SystemClock),
//! )?;
//!
//! let scope = Scope::new("agent-1");
//! orchestrator.ingest_text(&scope, "api | auth | jwt").await?;
//! orchestrator.run_cycle(&scope, &CancelToken::new()).await;
//!
//! let answer = orchestrator.synthesize("how does the api authenticate?", &scope).await?;
//! if answer.conflict {
//!     println!("conflicting sources: {:?}", answer.conflict_sources());
//! }
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod provider;
pub mod scoring;
pub mod synthesis;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LifecycleConfig;
pub use engine::{
    BatchResult, BatchStatus, CancelToken, ConsolidationEngine, DistillationEngine, EngineKind,
    PromotionEngine,
};
pub use error::{Error, ErrorKind, Result};
pub use memory::{
    Episode, EpisodeId, Fact, FactCandidate, FactId, KnowledgeDocument, Scope, SearchWeights,
    Tier, TimeWindow, Triple, Validity,
};
pub use orchestrator::{CycleReport, LeaseTable, LifecycleOrchestrator, MemoryStores};
pub use provider::{HttpReasoningProvider, ReasoningProvider, ResilientProvider};
pub use scoring::{CiarScore, CiarScorer};
pub use synthesis::{KnowledgeSynthesizer, SynthesisResult};
