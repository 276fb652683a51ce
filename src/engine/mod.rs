//! Tier transition engines.
//!
//! Each engine moves knowledge one tier down the hierarchy:
//!
//! - [`PromotionEngine`]: L1 → L2, gated by the CIAR score
//! - [`ConsolidationEngine`]: L2 → L3, clustering facts into episodes
//!   written to both the vector and graph index
//! - [`DistillationEngine`]: L3 → L4, mining patterns across episodes
//!
//! Engines never raise per-item failures. A batch always returns a
//! [`BatchResult`]; only failures that prevent the batch from starting
//! (store unreachable, invalid configuration) surface as errors.
//!
//! ## Example
//!
//! ```rust,ignore
//! use memory_lifecycle::engine::{CancelToken, PromotionEngine};
//!
//! let engine = PromotionEngine::new(l1, l2, &scoring, promotion, clock)?;
//! let result = engine.run_batch(&scope, &CancelToken::new()).await?;
//! println!("promoted {} of {}", result.succeeded, result.attempted);
//! ```

mod batch;
mod cancel;
mod consolidation;
mod distillation;
mod promotion;

pub use batch::{BatchResult, BatchStatus, EngineKind};
pub use cancel::{CancelToken, KeepAlive};
pub use consolidation::{
    normalize_clusters, ConsolidationEngine, DualIndexWriter, FactCluster, FactClusterer,
    TopicWindowClusterer,
};
pub use distillation::{DistillationEngine, EntityCooccurrenceMiner, EpisodePattern, PatternMiner};
pub use promotion::{PromotionEngine, PromotionOutcome};
