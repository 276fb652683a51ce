//! Timeout, retry and circuit-breaker policy for provider calls.

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::{ProviderError, Result};
use crate::memory::{Episode, EpisodeGraph, Fact, FactCandidate};

use super::port::{KnowledgeCandidate, ReasoningProvider};

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker state as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    Closed,
    /// Cooling down; calls are rejected
    Open,
    /// Cooldown elapsed; the next call is a trial
    HalfOpen,
}

/// Wraps a provider with per-call timeouts, bounded exponential backoff
/// and a consecutive-failure circuit breaker.
///
/// Every attempt runs under `call_timeout`; a timed-out attempt counts as a
/// failure. After `breaker_failure_threshold` consecutive failures the
/// breaker opens for `breaker_cooldown_ms` and calls fail immediately with
/// [`ProviderError::CircuitOpen`].
pub struct ResilientProvider {
    inner: Arc<dyn ReasoningProvider>,
    config: ProviderConfig,
    breaker: Mutex<BreakerState>,
}

impl ResilientProvider {
    pub fn new(inner: Arc<dyn ReasoningProvider>, config: ProviderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner,
            config,
            breaker: Mutex::new(BreakerState::default()),
        })
    }

    pub fn status(&self) -> BreakerStatus {
        let state = self.lock_breaker();
        match state.opened_at {
            Some(at) if self.cooling_down(at) => BreakerStatus::Open,
            Some(_) => BreakerStatus::HalfOpen,
            None => BreakerStatus::Closed,
        }
    }

    fn lock_breaker(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        // Breaker state stays consistent even if a holder panicked
        self.breaker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let ms = self
            .config
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(ms)
    }

    fn cooling_down(&self, opened_at: Instant) -> bool {
        opened_at.elapsed() < Duration::from_millis(self.config.breaker_cooldown_ms)
    }

    fn admit(&self) -> std::result::Result<(), ProviderError> {
        let state = self.lock_breaker();
        match state.opened_at {
            Some(at) if self.cooling_down(at) => Err(ProviderError::CircuitOpen),
            _ => Ok(()),
        }
    }

    fn record_success(&self) {
        let mut state = self.lock_breaker();
        if state.opened_at.is_some() {
            debug!("Provider circuit breaker closed");
        }
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    /// Record a failure; returns true when the breaker is now open.
    fn record_failure(&self, operation: &str) -> bool {
        let mut state = self.lock_breaker();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let half_open = state.opened_at.is_some();
        if half_open || state.consecutive_failures >= self.config.breaker_failure_threshold {
            state.opened_at = Some(Instant::now());
            warn!(
                operation,
                failures = state.consecutive_failures,
                cooldown_ms = self.config.breaker_cooldown_ms,
                "Provider circuit breaker opened"
            );
            return true;
        }
        false
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        mut f: F,
    ) -> std::result::Result<T, ProviderError>
    where
        T: Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, ProviderError>> + Send,
    {
        self.admit()?;

        let timeout = self.config.call_timeout();
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    duration_ms: self.config.call_timeout_ms,
                }),
            };

            let error = match outcome {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) => e,
            };

            let opened = self.record_failure(operation);
            if opened || !error.is_retryable() || attempt >= self.config.max_retries {
                warn!(operation, attempt, error = %error, "Provider call failed");
                return Err(error);
            }

            let delay = self.backoff(attempt);
            debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying provider call"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl ReasoningProvider for ResilientProvider {
    async fn extract_facts(
        &self,
        text: &str,
    ) -> std::result::Result<Vec<FactCandidate>, ProviderError> {
        self.call("extract_facts", || self.inner.extract_facts(text))
            .await
    }

    async fn summarize(&self, facts: &[Fact]) -> std::result::Result<String, ProviderError> {
        self.call("summarize", || self.inner.summarize(facts)).await
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
        self.call("embed", || self.inner.embed(text)).await
    }

    async fn extract_graph(
        &self,
        narrative: &str,
    ) -> std::result::Result<EpisodeGraph, ProviderError> {
        self.call("extract_graph", || self.inner.extract_graph(narrative))
            .await
    }

    async fn synthesize(
        &self,
        episodes: &[Episode],
    ) -> std::result::Result<KnowledgeCandidate, ProviderError> {
        self.call("synthesize", || self.inner.synthesize(episodes))
            .await
    }
}
