//! LLM client abstraction and HTTP providers.
//!
//! Defines the [`LlmClient`] capability and three concrete backends:
//! - **[`OpenAiClient`]**: OpenAI-compatible `POST /chat/completions`.
//! - **[`ClaudeClient`]**: Anthropic `POST /messages`.
//! - **[`OllamaClient`]**: local Ollama `POST /api/generate`.
//!
//! Providers perform exactly one HTTP request per call. Retries, backoff and
//! the global concurrency gate live in [`driver::LlmDriver`].
//!
//! # Error classification
//!
//! - HTTP 429, or any error whose text mentions a rate limit or quota → rate limit
//! - HTTP 5xx, network errors, timeouts → transient
//! - other HTTP 4xx, empty completions, malformed JSON → permanent

pub mod driver;
pub mod mock;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::config::Config;
use crate::prompt;

pub use driver::{LlmDriver, RetryPolicy};
pub use mock::MockClient;

/// Per-request timeout shared by the HTTP backends.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const ANTHROPIC_VERSION: &str = "2023-06-01";
const CLAUDE_MAX_TOKENS: u32 = 4096;

const SYSTEM_PROMPT: &str =
    "You are a precise information extraction engine. Answer only with tab-separated lines.";

static STATUS_429: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b429\b").expect("valid regex"));

/// Errors from a single LLM request.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("empty response from model")]
    EmptyResponse,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Rate-limit classification by status code or error text.
    pub fn is_rate_limit(&self) -> bool {
        if let LlmError::Http { status: 429, .. } = self {
            return true;
        }
        let text = self.to_string().to_lowercase();
        ["rate limit", "rate_limit", "ratelimit", "too many requests", "quota"]
            .iter()
            .any(|needle| text.contains(needle))
            || STATUS_429.is_match(&text)
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        if self.is_rate_limit() {
            return true;
        }
        match self {
            LlmError::Http { status, .. } => *status >= 500,
            LlmError::Network(_) | LlmError::Timeout | LlmError::Other(_) => true,
            LlmError::EmptyResponse | LlmError::InvalidResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else if e.is_decode() {
            LlmError::InvalidResponse(e.to_string())
        } else {
            LlmError::Network(e.to_string())
        }
    }
}

/// A text-completion backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Backend identifier for logs (e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Complete `prompt`. A non-empty `context` is sent ahead of the prompt.
    async fn translate(&self, prompt: &str, context: &str) -> Result<String, LlmError>;

    /// Render `template` with `values` and complete it.
    async fn process_with_prompt(
        &self,
        template: &str,
        values: &HashMap<String, String>,
    ) -> Result<String, LlmError> {
        let rendered = prompt::render(template, values);
        self.translate(&rendered, "").await
    }
}

/// Build the client for `llm` (`openai`, `claude`, `ollama`) and `model`.
///
/// Checks the backend name and its API key first, so a misconfigured run
/// fails before any input is read.
pub fn create_client(config: &Config, llm: &str, model: &str) -> Result<Arc<dyn LlmClient>> {
    config.validate_llm(llm)?;
    let client: Arc<dyn LlmClient> = match llm {
        "openai" => Arc::new(OpenAiClient::new(
            &config.openai_api_url,
            config.openai_api_key.as_deref().unwrap_or_default(),
            model,
        )?),
        "claude" => Arc::new(ClaudeClient::new(
            &config.claude_api_url,
            config.claude_api_key.as_deref().unwrap_or_default(),
            model,
        )?),
        "ollama" => Arc::new(OllamaClient::new(&config.ollama_api_url, model)?),
        other => anyhow::bail!("Unknown LLM: {}", other),
    };
    tracing::debug!(llm, model, "Created LLM client");
    Ok(client)
}

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

/// Join look-behind context and prompt into one user message.
fn compose(prompt: &str, context: &str) -> String {
    if context.trim().is_empty() {
        prompt.to_string()
    } else {
        format!("{}\n\n{}", context, prompt)
    }
}

/// Send a request and decode a JSON body, mapping non-2xx to [`LlmError::Http`].
async fn send_json(request: reqwest::RequestBuilder) -> Result<serde_json::Value, LlmError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Http {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| LlmError::InvalidResponse(e.to_string()))
}

fn non_empty(text: &str) -> Result<String, LlmError> {
    if text.trim().is_empty() {
        Err(LlmError::EmptyResponse)
    } else {
        Ok(text.to_string())
    }
}

// ============ OpenAI ============

pub struct OpenAiClient {
    url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(url: &str, api_key: &str, model: &str) -> Result<Self> {
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            http: http_client()?,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn translate(&self, prompt: &str, context: &str) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": compose(prompt, context) },
            ],
            "temperature": 0.0,
        });
        let request = self
            .http
            .post(format!("{}/chat/completions", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);
        let json = send_json(request).await?;
        parse_openai_response(&json)
    }
}

/// Extract `choices[0].message.content`.
fn parse_openai_response(json: &serde_json::Value) -> Result<String, LlmError> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            LlmError::InvalidResponse("missing choices[0].message.content".to_string())
        })?;
    non_empty(content)
}

// ============ Claude ============

pub struct ClaudeClient {
    url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl ClaudeClient {
    pub fn new(url: &str, api_key: &str, model: &str) -> Result<Self> {
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            http: http_client()?,
        })
    }
}

#[async_trait]
impl LlmClient for ClaudeClient {
    fn name(&self) -> &str {
        "claude"
    }

    async fn translate(&self, prompt: &str, context: &str) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": CLAUDE_MAX_TOKENS,
            "system": SYSTEM_PROMPT,
            "messages": [
                { "role": "user", "content": compose(prompt, context) },
            ],
        });
        let request = self
            .http
            .post(format!("{}/messages", self.url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        let json = send_json(request).await?;
        parse_claude_response(&json)
    }
}

/// Concatenate the `text` blocks of `content[]`.
fn parse_claude_response(json: &serde_json::Value) -> Result<String, LlmError> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| LlmError::InvalidResponse("missing content array".to_string()))?;
    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();
    non_empty(&text)
}

// ============ Ollama ============

pub struct OllamaClient {
    url: String,
    model: String,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(url: &str, model: &str) -> Result<Self> {
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            http: http_client()?,
        })
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn translate(&self, prompt: &str, context: &str) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "system": SYSTEM_PROMPT,
            "prompt": compose(prompt, context),
            "stream": false,
        });
        let request = self
            .http
            .post(format!("{}/api/generate", self.url))
            .json(&body);
        let json = send_json(request).await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<String, LlmError> {
    let text = json
        .get("response")
        .and_then(|r| r.as_str())
        .ok_or_else(|| LlmError::InvalidResponse("missing response field".to_string()))?;
    non_empty(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_detected_from_status_and_text() {
        let by_status = LlmError::Http {
            status: 429,
            body: String::new(),
        };
        assert!(by_status.is_rate_limit());
        assert!(LlmError::Other("Rate limit reached for gpt-4o".into()).is_rate_limit());
        assert!(LlmError::Http {
            status: 403,
            body: "You exceeded your current quota".into()
        }
        .is_rate_limit());
        assert!(!LlmError::Timeout.is_rate_limit());
        assert!(LlmError::Other("upstream said 429".into()).is_rate_limit());
    }

    #[test]
    fn digits_containing_429_are_not_a_rate_limit() {
        let body = LlmError::Http {
            status: 400,
            body: "prompt has 14290 tokens, request req_84291".into(),
        };
        assert!(!body.is_rate_limit());
        assert!(!body.is_transient());
    }

    #[test]
    fn permanent_errors_are_not_transient() {
        assert!(!LlmError::Http {
            status: 400,
            body: "bad request".into()
        }
        .is_transient());
        assert!(!LlmError::EmptyResponse.is_transient());
        assert!(!LlmError::InvalidResponse("eof".into()).is_transient());
        assert!(LlmError::Http {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::Network("reset".into()).is_transient());
    }

    #[test]
    fn parses_openai_choices() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "Alice\tPerson\tengineer" } }]
        });
        assert_eq!(parse_openai_response(&json).unwrap(), "Alice\tPerson\tengineer");

        let empty = serde_json::json!({ "choices": [{ "message": { "content": "  " } }] });
        assert!(matches!(parse_openai_response(&empty), Err(LlmError::EmptyResponse)));

        let broken = serde_json::json!({ "error": "nope" });
        assert!(matches!(parse_openai_response(&broken), Err(LlmError::InvalidResponse(_))));
    }

    #[test]
    fn parses_claude_text_blocks() {
        let json = serde_json::json!({
            "content": [
                { "type": "text", "text": "Alice\tPerson\t" },
                { "type": "text", "text": "engineer" }
            ]
        });
        assert_eq!(parse_claude_response(&json).unwrap(), "Alice\tPerson\tengineer");
    }

    #[test]
    fn parses_ollama_response() {
        let json = serde_json::json!({ "response": "x\ty\tz", "done": true });
        assert_eq!(parse_ollama_response(&json).unwrap(), "x\ty\tz");
        assert!(parse_ollama_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn compose_prepends_context() {
        assert_eq!(compose("P", ""), "P");
        assert_eq!(compose("P", "C"), "C\n\nP");
    }

    #[test]
    fn create_client_checks_keys() {
        let mut config = Config::default();
        assert!(create_client(&config, "openai", "gpt-4o").is_err());
        assert!(create_client(&config, "mystery", "m").is_err());
        config.openai_api_key = Some("sk-test".to_string());
        let client = create_client(&config, "openai", "gpt-4o").unwrap();
        assert_eq!(client.name(), "openai");
        let client = create_client(&config, "ollama", "llama3").unwrap();
        assert_eq!(client.name(), "ollama");
    }
}
