//! Bounded-concurrency LLM invocation with retry and backoff.
//!
//! Every LLM call of a run goes through one [`LlmDriver`]. The driver holds a
//! semaphore of [`MAX_IN_FLIGHT`] permits, so no more than five requests are
//! outstanding at any instant no matter how many segments are scheduled.
//! A permit is held only while a request is on the wire; backoff sleeps
//! release it.
//!
//! Backoff:
//! - transient errors: 1s, 2s, 4s, ... capped at 32s
//! - rate limits: 60s, 120s, 240s, ... capped at 300s
//! - permanent errors: no retry

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{LlmClient, LlmError};
use crate::error::PipelineError;
use crate::prompt;

/// Hard bound on concurrent LLM requests across a run.
pub const MAX_IN_FLIGHT: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_initial_delay: Duration,
    pub rate_limit_max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            rate_limit_initial_delay: Duration::from_secs(60),
            rate_limit_max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, after `failures` consecutive failures
    /// (1-based) ending in `error`.
    pub fn delay_for(&self, error: &LlmError, failures: u32) -> Duration {
        let (base, cap) = if error.is_rate_limit() {
            (self.rate_limit_initial_delay, self.rate_limit_max_delay)
        } else {
            (self.initial_delay, self.max_delay)
        };
        let exp = failures.saturating_sub(1).min(16);
        base.saturating_mul(1u32 << exp).min(cap)
    }
}

pub struct LlmDriver {
    client: Arc<dyn LlmClient>,
    gate: Arc<Semaphore>,
    policy: RetryPolicy,
}

impl LlmDriver {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self::with_policy(client, RetryPolicy::default())
    }

    pub fn with_policy(client: Arc<dyn LlmClient>, policy: RetryPolicy) -> Self {
        Self {
            client,
            gate: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
            policy,
        }
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Requests currently on the wire.
    pub fn in_flight(&self) -> usize {
        MAX_IN_FLIGHT - self.gate.available_permits()
    }

    /// Complete `prompt`, retrying transient failures per the policy.
    pub async fn translate(&self, prompt: &str, context: &str) -> Result<String, PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let result = {
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| PipelineError::Cancelled)?;
                self.client.translate(prompt, context).await
            };

            let err = match result {
                Ok(text) => {
                    if attempt > 1 {
                        debug!(attempt, llm = self.client.name(), "LLM call succeeded after retry");
                    }
                    return Ok(text);
                }
                Err(err) => err,
            };

            if !err.is_transient() || attempt >= self.policy.max_attempts {
                warn!(
                    attempt,
                    llm = self.client.name(),
                    error = %err,
                    "LLM call failed"
                );
                return Err(PipelineError::TranslationFailed {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.policy.delay_for(&err, attempt);
            warn!(
                attempt,
                llm = self.client.name(),
                rate_limited = err.is_rate_limit(),
                delay_secs = delay.as_secs_f64(),
                error = %err,
                "LLM call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Render `template` with `values` and complete it through the gate.
    pub async fn process_with_prompt(
        &self,
        template: &str,
        values: &HashMap<String, String>,
    ) -> Result<String, PipelineError> {
        let rendered = prompt::render(template, values);
        self.translate(&rendered, "").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockClient;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let general = LlmError::Timeout;
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_for(&general, n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32]);

        let limited = LlmError::Other("rate limit exceeded".to_string());
        let delays: Vec<u64> = (1..=4).map(|n| policy.delay_for(&limited, n).as_secs()).collect();
        assert_eq!(delays, vec![60, 120, 240, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_with_growing_delays() {
        let mock = MockClient::new("ok").fail_times(3, "429 Too Many Requests: rate limit");
        let driver = LlmDriver::new(Arc::new(mock.clone()));

        let out = driver.translate("prompt", "").await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(mock.call_count(), 4);

        let instants = mock.call_instants();
        let gaps: Vec<Duration> = instants.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 3);
        assert!(gaps.windows(2).all(|w| w[0] < w[1]), "gaps {:?}", gaps);
        assert!(gaps[0] >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let mock = MockClient::new("ok").fail_times(10, "connection reset");
        let driver = LlmDriver::new(Arc::new(mock.clone()));

        let err = driver.translate("prompt", "").await.unwrap_err();
        match err {
            PipelineError::TranslationFailed { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(mock.call_count(), 5);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let mock = MockClient::new("ok").with_error("bad", 400, "invalid request");
        let driver = LlmDriver::new(Arc::new(mock.clone()));

        let err = driver.translate("a bad prompt", "").await.unwrap_err();
        assert!(matches!(err, PipelineError::TranslationFailed { attempts: 1, .. }));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_five_in_flight() {
        let mock = MockClient::new("ok").with_delay(Duration::from_millis(50));
        let driver = Arc::new(LlmDriver::new(Arc::new(mock.clone())));

        let mut handles = Vec::new();
        for i in 0..23 {
            let driver = driver.clone();
            handles.push(tokio::spawn(async move {
                driver.translate(&format!("prompt {i}"), "").await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(mock.call_count(), 23);
        assert!(mock.max_in_flight() <= MAX_IN_FLIGHT);
        assert_eq!(mock.max_in_flight(), MAX_IN_FLIGHT);
        assert_eq!(driver.in_flight(), 0);
    }
}
