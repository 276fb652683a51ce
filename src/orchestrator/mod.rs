//! Scheduling and coordination of the lifecycle engines.
//!
//! [`LifecycleOrchestrator`] owns one instance of each engine and the
//! synthesizer, and guards every batch with a lease from the
//! [`LeaseTable`] so that a scope never has two batches of the same engine
//! in flight. Batches across scopes run in parallel.
//!
//! ## Example
//!
//! ```rust,ignore
//! use memory_lifecycle::orchestrator::{LifecycleOrchestrator, MemoryStores};
//!
//! let orchestrator = LifecycleOrchestrator::new(
//!     MemoryStores::in_memory(),
//!     provider,
//!     LifecycleConfig::default(),
//!     Arc::new(SystemClock),
//! )?;
//! orchestrator.ingest_text(&scope, "api | auth | jwt").await?;
//! let report = orchestrator.run_cycle(&scope, &CancelToken::new()).await;
//! ```

mod lease;
mod lifecycle;

pub use lease::{LeaseGuard, LeaseKey, LeaseTable};
pub use lifecycle::{CycleReport, LifecycleOrchestrator, MemoryStores};
