//! Conflict detection and resolution over retrieved claims.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::memory::{SourceRef, Triple};

/// A single statement found in a retrieved item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub triple: Triple,
    /// Finest-grained item the statement came from
    pub source: SourceRef,
    pub valid_from: DateTime<Utc>,
    pub confidence: f64,
}

/// Disagreeing claims about one `(subject, predicate)` slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub subject: String,
    pub predicate: String,
    /// Every claim for the slot, preferred first
    pub claims: Vec<Claim>,
    pub winner: Claim,
}

impl Conflict {
    /// Distinct sources taking part in the conflict.
    pub fn sources(&self) -> Vec<SourceRef> {
        let mut sources: Vec<SourceRef> = self.claims.iter().map(|c| c.source.clone()).collect();
        sources.sort();
        sources.dedup();
        sources
    }

    /// Distinct normalized values, preferred first.
    pub fn values(&self) -> Vec<String> {
        let mut values: Vec<String> = Vec::new();
        for claim in &self.claims {
            let value = claim.triple.value();
            if !values.contains(&value) {
                values.push(value);
            }
        }
        values
    }
}

/// Outcome of resolving a set of claims.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// One preferred claim per slot, in slot order
    pub accepted: Vec<Claim>,
    pub conflicts: Vec<Conflict>,
}

impl Resolution {
    pub fn has_conflict(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Policy deciding which claim wins a contested slot.
///
/// A policy may pick any winner but must report every contested slot.
pub trait ConflictPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn resolve(&self, claims: Vec<Claim>) -> Resolution;
}

/// Prefers the later `valid_from`, then the higher confidence.
///
/// Remaining ties fall to the smaller source reference so the outcome
/// does not depend on retrieval order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataFirstPolicy;

impl MetadataFirstPolicy {
    fn preference(a: &Claim, b: &Claim) -> Ordering {
        b.valid_from
            .cmp(&a.valid_from)
            .then_with(|| b.confidence.total_cmp(&a.confidence))
            .then_with(|| a.source.cmp(&b.source))
            .then_with(|| a.triple.value().cmp(&b.triple.value()))
    }
}

impl ConflictPolicy for MetadataFirstPolicy {
    fn name(&self) -> &str {
        "metadata_first"
    }

    fn resolve(&self, claims: Vec<Claim>) -> Resolution {
        let mut slots: BTreeMap<(String, String), Vec<Claim>> = BTreeMap::new();
        for claim in claims {
            let entry = slots.entry(claim.triple.slot()).or_default();
            let duplicate = entry
                .iter()
                .any(|c| c.source == claim.source && c.triple.value() == claim.triple.value());
            if !duplicate {
                entry.push(claim);
            }
        }

        let mut resolution = Resolution::default();
        for ((subject, predicate), mut claims) in slots {
            claims.sort_by(Self::preference);
            let winner = claims[0].clone();
            let contested = claims.iter().any(|c| c.triple.value() != winner.triple.value());
            if contested {
                resolution.conflicts.push(Conflict {
                    subject,
                    predicate,
                    claims,
                    winner: winner.clone(),
                });
            }
            resolution.accepted.push(winner);
        }
        resolution
    }
}
