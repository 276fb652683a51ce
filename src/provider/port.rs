//! Reasoning provider contract and candidate types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ProviderError;
use crate::memory::{Episode, EpisodeGraph, Fact, FactCandidate, Triple};

/// Provider output for a distilled knowledge document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeCandidate {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub confidence: f64,
    #[serde(default)]
    pub assertions: Vec<Triple>,
}

impl KnowledgeCandidate {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            tags: BTreeSet::new(),
            confidence: 0.5,
            assertions: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Reject candidates the distillation engine cannot store.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.title.trim().is_empty() && self.body.trim().is_empty() {
            return Err(ProviderError::MalformedResponse(
                "knowledge candidate has neither title nor body".to_string(),
            ));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(ProviderError::MalformedResponse(format!(
                "knowledge candidate confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// External extraction, summarization, embedding and synthesis capability.
///
/// Calls behave like network requests: they may be slow, fail transiently
/// or return unusable output. Wrap implementations in
/// [`ResilientProvider`](super::ResilientProvider) to apply the retry policy.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    /// Extract fact candidates from free text.
    async fn extract_facts(&self, text: &str) -> Result<Vec<FactCandidate>, ProviderError>;

    /// Summarize a cluster of facts into a narrative.
    async fn summarize(&self, facts: &[Fact]) -> Result<String, ProviderError>;

    /// Embed text into a vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Extract entities and relations from a narrative.
    async fn extract_graph(&self, narrative: &str) -> Result<EpisodeGraph, ProviderError>;

    /// Synthesize a knowledge document candidate from related episodes.
    async fn synthesize(&self, episodes: &[Episode]) -> Result<KnowledgeCandidate, ProviderError>;
}
