//! Significance scoring.
//!
//! The CIAR score decides whether a captured fact is significant enough to
//! move from active context into working memory.
//!
//! ## Example
//!
//! ```rust,ignore
//! use memory_lifecycle::scoring::CiarScorer;
//!
//! let scorer = CiarScorer::default();
//! let score = scorer.score(0.9, 0.8, 0.7, created_at, None, now)?;
//! assert!(score.value >= 0.4);
//! ```

mod ciar;
mod proptest;

pub use ciar::{CiarScore, CiarScorer};
