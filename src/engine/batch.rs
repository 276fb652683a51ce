//! Batch outcome reporting shared by the three transition engines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, ItemError, Result};
use crate::memory::Scope;

/// One of the three lifecycle transition engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// L1 → L2
    Promotion,
    /// L2 → L3
    Consolidation,
    /// L3 → L4
    Distillation,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Promotion => "promotion",
            Self::Consolidation => "consolidation",
            Self::Distillation => "distillation",
        };
        write!(f, "{}", s)
    }
}

/// Aggregate outcome of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Nothing to do
    Empty,
    FullSuccess,
    PartialSuccess,
    TotalFailure,
}

/// Structured result of one engine batch.
///
/// Per-item failures are recorded here, never raised. `attempted` counts
/// units of work that actually ran; units skipped by cancellation are
/// counted in `not_run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub engine: EngineKind,
    pub scope: Scope,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Ran but intentionally left in place (e.g. below threshold)
    pub skipped: usize,
    pub not_run: usize,
    /// Identifiers of items written by the batch
    pub written: Vec<String>,
    pub errors: Vec<ItemError>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchResult {
    pub fn new(engine: EngineKind, scope: Scope, started_at: DateTime<Utc>) -> Self {
        Self {
            engine,
            scope,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            not_run: 0,
            written: Vec::new(),
            errors: Vec::new(),
            cancelled: false,
            started_at,
            finished_at: started_at,
        }
    }

    /// Record a successful unit; `written` is the id of the item it produced, if any.
    pub fn record_success(&mut self, written: Option<String>) {
        self.attempted += 1;
        self.succeeded += 1;
        if let Some(id) = written {
            self.written.push(id);
        }
    }

    pub fn record_skip(&mut self) {
        self.attempted += 1;
        self.skipped += 1;
    }

    pub fn record_failure(&mut self, item: impl ToString, error: &Error) {
        self.attempted += 1;
        self.failed += 1;
        self.errors.push(error.to_item_error(item));
    }

    /// Mark the batch cancelled with `remaining` units left undone.
    pub fn record_cancelled(&mut self, remaining: usize) {
        self.cancelled = true;
        self.not_run += remaining;
    }

    pub fn finish(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = at;
        self
    }

    pub fn status(&self) -> BatchStatus {
        if self.attempted == 0 {
            BatchStatus::Empty
        } else if self.failed == 0 {
            BatchStatus::FullSuccess
        } else if self.failed == self.attempted {
            BatchStatus::TotalFailure
        } else {
            BatchStatus::PartialSuccess
        }
    }

    /// Whether any unit left the dual index half-written.
    pub fn has_inconsistency(&self) -> bool {
        self.errors
            .iter()
            .any(|e| e.kind == ErrorKind::InconsistentIndexState)
    }

    /// Convert per-item failures into an aggregate error.
    pub fn into_result(self) -> Result<Self> {
        if self.failed > 0 {
            return Err(Error::PartialBatchFailure {
                attempted: self.attempted,
                failed: self.failed,
                errors: self.errors,
            });
        }
        Ok(self)
    }
}
