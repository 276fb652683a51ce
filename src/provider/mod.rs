//! External reasoning capability.
//!
//! The engines never parse natural language themselves. Extraction,
//! summarization, embedding, graph extraction and synthesis are delegated to
//! a [`ReasoningProvider`]. Production deployments wrap the transport
//! ([`HttpReasoningProvider`]) in a [`ResilientProvider`] so every call gets
//! a timeout, bounded retries and a circuit breaker.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use memory_lifecycle::provider::{HttpProviderConfig, HttpReasoningProvider, ResilientProvider};
//!
//! let http = HttpReasoningProvider::new(HttpProviderConfig::new("http://reasoner:8080"))?;
//! let provider = ResilientProvider::new(Arc::new(http), config.provider.clone())?;
//! ```

mod http;
mod port;
mod resilient;

pub use http::{HttpProviderConfig, HttpReasoningProvider};
pub use port::{KnowledgeCandidate, ReasoningProvider};
pub use resilient::{BreakerStatus, ResilientProvider};
