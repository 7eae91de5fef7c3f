//! YAML configuration.
//!
//! The configuration is loaded once at program entry and passed by value or
//! reference into every component constructor. Environment variables
//! override file values after parsing.
//!
//! # Example
//!
//! ```yaml
//! default_llm: openai
//! default_model: gpt-4o
//! max_tokens: 2000
//! context_size: 1000
//! storage_type: local
//! include_positions: true
//! context_output: true
//! context_words: 30
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default configuration file looked up when neither `--config` nor
/// `ONTOLOGY_CONFIG_PATH` is given.
pub const DEFAULT_CONFIG_PATH: &str = "./config/ontology.yaml";

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_openai_api_url")]
    pub openai_api_url: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_claude_api_url")]
    pub claude_api_url: String,
    #[serde(default)]
    pub claude_api_key: Option<String>,
    #[serde(default = "default_ollama_api_url")]
    pub ollama_api_url: String,

    #[serde(default = "default_storage_type")]
    pub storage_type: String,
    #[serde(default)]
    pub s3: S3Config,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_context_size")]
    pub context_size: usize,
    #[serde(default = "default_llm")]
    pub default_llm: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_base_uri")]
    pub base_uri: String,

    #[serde(default = "default_true")]
    pub include_positions: bool,
    #[serde(default)]
    pub context_output: bool,
    #[serde(default = "default_context_words")]
    pub context_words: usize,

    /// SQLite file mirroring the ontology. In-memory when absent.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Appended to every enrichment prompt when non-empty.
    #[serde(default)]
    pub additional_prompt: Option<String>,
}

/// Object-store settings, used when `storage_type` is `s3`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct S3Config {
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: default_region(),
            endpoint: None,
            access_key: None,
            secret_key: None,
        }
    }
}

fn default_openai_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_claude_api_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}
fn default_ollama_api_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_storage_type() -> String {
    "local".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_max_tokens() -> usize {
    2000
}
fn default_context_size() -> usize {
    1000
}
fn default_llm() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_base_uri() -> String {
    "http://www.example.org/ontology#".to_string()
}
fn default_true() -> bool {
    true
}
fn default_context_words() -> usize {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_url: default_openai_api_url(),
            openai_api_key: None,
            claude_api_url: default_claude_api_url(),
            claude_api_key: None,
            ollama_api_url: default_ollama_api_url(),
            storage_type: default_storage_type(),
            s3: S3Config::default(),
            max_tokens: default_max_tokens(),
            context_size: default_context_size(),
            default_llm: default_llm(),
            default_model: default_model(),
            base_uri: default_base_uri(),
            include_positions: true,
            context_output: false,
            context_words: default_context_words(),
            database_path: None,
            additional_prompt: None,
        }
    }
}

/// LLM backends known to [`crate::llm::create_client`].
pub const KNOWN_LLMS: &[&str] = &["openai", "claude", "ollama"];

impl Config {
    /// Parse a YAML document. Does not apply environment overrides.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config =
            serde_yaml::from_str(content).with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    /// Apply the documented environment overrides using `lookup` to read
    /// variables, so tests can supply a fake environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("OPENAI_API_KEY") {
            self.openai_api_key = Some(v);
        }
        if let Some(v) = lookup("CLAUDE_API_KEY") {
            self.claude_api_key = Some(v);
        }
        if let Some(v) = lookup("S3_BUCKET") {
            self.s3.bucket = v;
        }
        if let Some(v) = lookup("S3_REGION") {
            self.s3.region = v;
        }
        if let Some(v) = lookup("S3_ENDPOINT") {
            self.s3.endpoint = Some(v);
        }
        if let Some(v) = lookup("S3_ACCESS_KEY") {
            self.s3.access_key = Some(v);
        }
        if let Some(v) = lookup("S3_SECRET_KEY") {
            self.s3.secret_key = Some(v);
        }
        if let Some(v) = lookup("ONTOLOGY_CONTEXT_OUTPUT") {
            self.context_output = parse_bool(&v)
                .with_context(|| format!("ONTOLOGY_CONTEXT_OUTPUT: invalid boolean '{}'", v))?;
        }
        if let Some(v) = lookup("ONTOLOGY_CONTEXT_WORDS") {
            self.context_words = v
                .trim()
                .parse()
                .with_context(|| format!("ONTOLOGY_CONTEXT_WORDS: invalid integer '{}'", v))?;
        }
        Ok(())
    }

    /// Startup validation of values that do not depend on the chosen LLM.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            bail!("max_tokens must be > 0");
        }
        if self.context_words == 0 {
            bail!("context_words must be > 0");
        }
        match self.storage_type.as_str() {
            "local" => {}
            "s3" => {
                if self.s3.bucket.is_empty() {
                    bail!("s3.bucket must be set when storage_type is 's3'");
                }
            }
            other => bail!(
                "Unknown storage type: '{}'. Must be local or s3.",
                other
            ),
        }
        Ok(())
    }

    /// Check that `llm` is a known backend and that its credentials exist.
    pub fn validate_llm(&self, llm: &str) -> Result<()> {
        match llm {
            "openai" => {
                if self.openai_api_key.as_deref().unwrap_or("").is_empty() {
                    bail!("OpenAI API key not configured (set openai_api_key or OPENAI_API_KEY)");
                }
            }
            "claude" => {
                if self.claude_api_key.as_deref().unwrap_or("").is_empty() {
                    bail!("Claude API key not configured (set claude_api_key or CLAUDE_API_KEY)");
                }
            }
            "ollama" => {}
            other => bail!(
                "Unknown LLM: '{}'. Must be one of: {}.",
                other,
                KNOWN_LLMS.join(", ")
            ),
        }
        Ok(())
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => bail!("not a boolean"),
    }
}

/// Resolve which config file to read: explicit path, then
/// `ONTOLOGY_CONFIG_PATH`, then [`DEFAULT_CONFIG_PATH`] when it exists.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    if let Ok(p) = std::env::var("ONTOLOGY_CONFIG_PATH") {
        if !p.is_empty() {
            return Some(PathBuf::from(p));
        }
    }
    let default = PathBuf::from(DEFAULT_CONFIG_PATH);
    default.exists().then_some(default)
}

/// Load, override from the process environment, and validate.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = match resolve_config_path(explicit) {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Config::from_yaml(&content)?
        }
        None => Config::default(),
    };

    config.apply_env_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}
