//! Pipeline error taxonomy.
//!
//! Every fatal or surfaced failure of an enrichment run maps onto one
//! [`PipelineError`] variant. Application glue wraps these in
//! `anyhow::Error` with additional context; library callers can match on the
//! variant to decide whether a failure is local to one segment or fatal to
//! the run.

use thiserror::Error;

use crate::llm::LlmError;

/// Errors raised by the enrichment pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing API key, invalid storage type, unknown model, bad flag value.
    #[error("configuration error: {0}")]
    Config(String),

    /// The input could not be read from storage.
    #[error("cannot read input {path}")]
    InputAccess {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// No parser is registered for the file extension.
    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),

    /// The canonical content is empty, so there is nothing to segment.
    #[error("invalid content: input is empty")]
    InvalidContent,

    /// The BPE encoder could not be initialised.
    #[error("tokenization failed: {0}")]
    Tokenization(String),

    /// The LLM call failed permanently or exhausted its retries.
    #[error("translation failed after {attempts} attempt(s)")]
    TranslationFailed {
        attempts: u32,
        #[source]
        source: LlmError,
    },

    /// An output artifact could not be written.
    #[error("cannot write output {path}")]
    StorageWrite {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// The merge step of a pass failed; the store keeps the previous result.
    #[error("merge step of pass {pass} failed")]
    MergeFailed {
        pass: usize,
        #[source]
        source: Box<PipelineError>,
    },

    /// The caller aborted the run; no output was written.
    #[error("enrichment run cancelled")]
    Cancelled,
}
