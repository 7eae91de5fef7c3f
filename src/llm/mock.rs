//! Scripted in-process LLM for tests and dry runs.
//!
//! Responses are chosen by prompt substring; the first matching rule wins and
//! unmatched prompts get the default response. A rule with several responses
//! plays them in order and then repeats the last one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{LlmClient, LlmError};

#[derive(Debug, Clone)]
enum Reply {
    Text(Vec<String>),
    Error { status: u16, body: String },
}

#[derive(Debug)]
struct Rule {
    needle: String,
    reply: Reply,
    served: usize,
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub prompt: String,
    pub context: String,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct MockState {
    default_response: String,
    rules: Mutex<Vec<Rule>>,
    failures_left: Mutex<(usize, String)>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<MockCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable handle; clones share rules and call history.
#[derive(Debug, Clone)]
pub struct MockClient {
    state: Arc<MockState>,
}

impl MockClient {
    pub fn new(default_response: impl Into<String>) -> Self {
        Self {
            state: Arc::new(MockState {
                default_response: default_response.into(),
                ..MockState::default()
            }),
        }
    }

    /// Answer prompts containing `needle` with `response`.
    pub fn with_response(self, needle: &str, response: &str) -> Self {
        self.with_responses(needle, &[response])
    }

    /// Answer prompts containing `needle` with `responses` in turn.
    pub fn with_responses(self, needle: &str, responses: &[&str]) -> Self {
        let rule = Rule {
            needle: needle.to_string(),
            reply: Reply::Text(responses.iter().map(|r| r.to_string()).collect()),
            served: 0,
        };
        lock(&self.state.rules).push(rule);
        self
    }

    /// Fail prompts containing `needle` with an HTTP error.
    pub fn with_error(self, needle: &str, status: u16, body: &str) -> Self {
        let rule = Rule {
            needle: needle.to_string(),
            reply: Reply::Error {
                status,
                body: body.to_string(),
            },
            served: 0,
        };
        lock(&self.state.rules).push(rule);
        self
    }

    /// Fail the next `n` calls, whatever the prompt, with `message`.
    pub fn fail_times(self, n: usize, message: &str) -> Self {
        *lock(&self.state.failures_left) = (n, message.to_string());
        self
    }

    /// Sleep for `delay` inside every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.state.delay) = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        lock(&self.state.calls).len()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state.calls).clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.state.calls).iter().map(|c| c.prompt.clone()).collect()
    }

    pub fn call_instants(&self) -> Vec<Instant> {
        lock(&self.state.calls).iter().map(|c| c.at).collect()
    }

    /// Highest number of concurrent calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    fn respond(&self, prompt: &str) -> Result<String, LlmError> {
        {
            let mut failures = lock(&self.state.failures_left);
            if failures.0 > 0 {
                failures.0 -= 1;
                return Err(LlmError::Other(failures.1.clone()));
            }
        }

        let mut rules = lock(&self.state.rules);
        let Some(rule) = rules.iter_mut().find(|r| prompt.contains(&r.needle)) else {
            return Ok(self.state.default_response.clone());
        };
        match &rule.reply {
            Reply::Text(responses) => {
                let idx = rule.served.min(responses.len().saturating_sub(1));
                rule.served += 1;
                Ok(responses.get(idx).cloned().unwrap_or_default())
            }
            Reply::Error { status, body } => Err(LlmError::Http {
                status: *status,
                body: body.clone(),
            }),
        }
    }
}

#[async_trait]
impl LlmClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn translate(&self, prompt: &str, context: &str) -> Result<String, LlmError> {
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        lock(&self.state.calls).push(MockCall {
            prompt: prompt.to_string(),
            context: context.to_string(),
            at: Instant::now(),
        });

        let delay = *lock(&self.state.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.respond(prompt);

        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt;

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let mock = MockClient::new("default")
            .with_response("merge", "merged")
            .with_response("me", "me-rule");
        assert_eq!(mock.translate("please merge", "").await.unwrap(), "merged");
        assert_eq!(mock.translate("about me", "").await.unwrap(), "me-rule");
        assert_eq!(mock.translate("other", "").await.unwrap(), "default");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn sequences_repeat_last_response() {
        let mock = MockClient::new("").with_responses("x", &["one", "two"]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(mock.translate("x", "").await.unwrap());
        }
        assert_eq!(seen, vec!["one", "two", "two"]);
    }

    #[tokio::test]
    async fn fail_times_then_recovers() {
        let mock = MockClient::new("ok").fail_times(2, "rate limit");
        assert!(mock.translate("p", "").await.unwrap_err().is_rate_limit());
        assert!(mock.translate("p", "").await.is_err());
        assert_eq!(mock.translate("p", "").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn process_with_prompt_renders_template() {
        let mock = MockClient::new("done");
        let values = prompt::values([("text", "hello")]);
        mock.process_with_prompt("Say {text}", &values).await.unwrap();
        assert_eq!(mock.prompts(), vec!["Say hello".to_string()]);
    }

    #[tokio::test]
    async fn clones_share_history() {
        let mock = MockClient::new("ok");
        let other = mock.clone();
        other.translate("p", "ctx").await.unwrap();
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.calls()[0].context, "ctx");
    }
}
