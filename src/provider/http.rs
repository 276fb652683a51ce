//! JSON-over-HTTP reasoning provider.
//!
//! Every capability is a `POST {base_url}/{endpoint}` with a JSON body:
//!
//! | Endpoint | Request | Response |
//! |---|---|---|
//! | `extract` | `{"text"}` | `{"facts": [FactCandidate]}` |
//! | `summarize` | `{"facts": [{"id","text","triple"}]}` | `{"narrative"}` |
//! | `embed` | `{"text"}` | `{"embedding": [f32]}` |
//! | `graph` | `{"narrative"}` | `EpisodeGraph` |
//! | `synthesize` | `{"episodes": [EpisodeBrief]}` | `KnowledgeCandidate` |
//!
//! An `EpisodeBrief` carries `id`, `narrative`, `entities` and `assertions`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, ProviderError, Result};
use crate::memory::{Episode, EpisodeGraph, Fact, FactCandidate, Triple};

use super::port::{KnowledgeCandidate, ReasoningProvider};

/// Connection settings for [`HttpReasoningProvider`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    pub base_url: String,
    /// Sent as a bearer token when present
    #[serde(default)]
    pub api_key: Option<String>,
    /// Transport-level timeout, independent of the retry policy
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

impl HttpProviderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Reasoning provider reached over HTTP.
pub struct HttpReasoningProvider {
    config: HttpProviderConfig,
    http: Client,
}

impl HttpReasoningProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(Error::invalid_config("provider base_url must not be empty"));
        }
        if config.timeout_secs == 0 {
            return Err(Error::invalid_config("provider timeout_secs must be > 0"));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::invalid_config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    async fn post<B, R>(&self, endpoint: &str, body: &B) -> std::result::Result<R, ProviderError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = self.url(endpoint);
        let mut request = self.http.post(&url).json(body);
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("Failed to read response: {}", e)))?;
        debug!(endpoint, status = status.as_u16(), bytes = text.len(), "Provider response");

        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| ProviderError::MalformedResponse(format!("{}: {}", endpoint, e)))
    }
}

/// Server errors and throttling are transient; other failures mean the
/// request itself was unusable.
fn status_error(status: StatusCode, body: &str) -> ProviderError {
    let detail = format!("{}: {}", status, truncate(body, 200));
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Unavailable(detail)
    } else {
        ProviderError::MalformedResponse(detail)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct ExtractResponse {
    facts: Vec<FactCandidate>,
}

#[derive(Serialize)]
struct SummarizeFact<'a> {
    id: String,
    text: &'a str,
    triple: Option<&'a Triple>,
}

#[derive(Serialize)]
struct SummarizeRequest<'a> {
    facts: Vec<SummarizeFact<'a>>,
}

#[derive(Deserialize)]
struct SummarizeResponse {
    narrative: String,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct GraphRequest<'a> {
    narrative: &'a str,
}

#[derive(Serialize)]
struct SynthesizeEpisode<'a> {
    id: String,
    narrative: &'a str,
    entities: &'a [String],
    assertions: Vec<&'a Triple>,
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    episodes: Vec<SynthesizeEpisode<'a>>,
}

#[async_trait]
impl ReasoningProvider for HttpReasoningProvider {
    async fn extract_facts(
        &self,
        text: &str,
    ) -> std::result::Result<Vec<FactCandidate>, ProviderError> {
        let response: ExtractResponse = self.post("extract", &TextRequest { text }).await?;
        Ok(response.facts)
    }

    async fn summarize(&self, facts: &[Fact]) -> std::result::Result<String, ProviderError> {
        let request = SummarizeRequest {
            facts: facts
                .iter()
                .map(|f| SummarizeFact {
                    id: f.id.to_string(),
                    text: &f.text,
                    triple: f.triple.as_ref(),
                })
                .collect(),
        };
        let response: SummarizeResponse = self.post("summarize", &request).await?;
        Ok(response.narrative)
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
        let response: EmbedResponse = self.post("embed", &TextRequest { text }).await?;
        if response.embedding.is_empty() {
            return Err(ProviderError::MalformedResponse(
                "embed: empty embedding".to_string(),
            ));
        }
        Ok(response.embedding)
    }

    async fn extract_graph(
        &self,
        narrative: &str,
    ) -> std::result::Result<EpisodeGraph, ProviderError> {
        self.post("graph", &GraphRequest { narrative }).await
    }

    async fn synthesize(
        &self,
        episodes: &[Episode],
    ) -> std::result::Result<KnowledgeCandidate, ProviderError> {
        let request = SynthesizeRequest {
            episodes: episodes
                .iter()
                .map(|e| SynthesizeEpisode {
                    id: e.id.to_string(),
                    narrative: &e.narrative,
                    entities: &e.entities,
                    assertions: e.assertions.iter().map(|a| &a.triple).collect(),
                })
                .collect(),
        };
        self.post("synthesize", &request).await
    }
}
