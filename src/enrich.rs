//! Multi-pass enrichment orchestrator.
//!
//! One run: load any existing ontology, read the input, then for each pass
//! fan the segments out to workers, merge their results with the previous
//! ontology, and finally write the artifacts.
//!
//! ```text
//! input ──▶ segments ──▶ worker × N (≤ 5 at a time) ──▶ results[i]
//!                                                          │
//!             previous TSV ◀── store ◀── merge prompt ◀────┘
//! ```
//!
//! Passes run strictly one after another; within a pass segment `i` always
//! lands in `results[i]` whatever the completion order. A failed segment
//! contributes an empty result and does not stop the pass. A failed merge
//! aborts the run before anything is written.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::error::PipelineError;
use crate::llm::LlmDriver;
use crate::models::Segment;
use crate::output::{write_outputs, OutputPlan};
use crate::parser::ParserRegistry;
use crate::position::PositionIndex;
use crate::processor::{apply_records, normalize_tsv, parse_tsv, SegmentProcessor};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::prompt::{self, PromptSet, ADDITIONAL_PROMPT_KEY};
use crate::segment::Segmenter;
use crate::sources;
use crate::storage::Storage;
use crate::store::OntologyStore;

/// Segment workers allowed to run at once within a pass.
pub const MAX_WORKERS: usize = 5;

/// Output formats with a built-in serialiser.
pub const SUPPORTED_FORMATS: &[&str] = &["tsv"];

/// Parameters of one enrichment run.
#[derive(Debug, Clone)]
pub struct EnrichOptions {
    pub input: String,
    pub output: String,
    pub passes: usize,
    pub existing_ontology: Option<String>,
    pub include_positions: bool,
    pub recursive: bool,
    pub context_output: bool,
    pub context_words: usize,
    pub format: String,
    pub max_tokens: usize,
    pub context_size: usize,
    pub additional_prompt: Option<String>,
}

impl EnrichOptions {
    /// Options for `input` → `output` with every other value from `config`.
    pub fn from_config(config: &Config, input: &str, output: &str) -> Self {
        Self {
            input: input.to_string(),
            output: output.to_string(),
            passes: 1,
            existing_ontology: None,
            include_positions: config.include_positions,
            recursive: false,
            context_output: config.context_output,
            context_words: config.context_words,
            format: "tsv".to_string(),
            max_tokens: config.max_tokens,
            context_size: config.context_size,
            additional_prompt: config.additional_prompt.clone(),
        }
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.passes == 0 {
            return Err(PipelineError::Config("passes must be at least 1".into()));
        }
        if self.max_tokens == 0 {
            return Err(PipelineError::Config("max_tokens must be positive".into()));
        }
        if !SUPPORTED_FORMATS.contains(&self.format.as_str()) {
            return Err(PipelineError::Config(format!(
                "unsupported output format '{}': expected one of {}",
                self.format,
                SUPPORTED_FORMATS.join(", ")
            )));
        }
        Ok(())
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichReport {
    pub passes: usize,
    /// Segment count of each pass.
    pub segments: Vec<usize>,
    /// Failed segment count of each pass.
    pub failed_segments: Vec<usize>,
    pub entities: usize,
    pub relations: usize,
    /// Artifacts written, TSV first.
    pub written: Vec<String>,
}

enum SegmentOutcome {
    Done(String),
    Failed,
    Skipped,
}

/// Runs enrichment passes against one store.
pub struct Enricher {
    driver: Arc<LlmDriver>,
    store: Arc<OntologyStore>,
    storage: Arc<dyn Storage>,
    prompts: PromptSet,
    registry: ParserRegistry,
    progress: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
}

impl Enricher {
    pub fn new(driver: Arc<LlmDriver>, store: Arc<OntologyStore>, storage: Arc<dyn Storage>) -> Self {
        Self {
            driver,
            store,
            storage,
            prompts: PromptSet::default(),
            registry: ParserRegistry::default(),
            progress: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Abort the run when `cancel` fires. Workers still waiting for a slot
    /// skip their segment; calls already on the wire finish.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Arc<OntologyStore> {
        &self.store
    }

    fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            warn!("Enrichment cancelled");
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    pub async fn run(&self, options: &EnrichOptions) -> Result<EnrichReport, PipelineError> {
        options.validate()?;
        let mut report = EnrichReport {
            passes: options.passes,
            ..EnrichReport::default()
        };

        let mut previous = String::new();
        if let Some(path) = &options.existing_ontology {
            let bytes = self
                .storage
                .read(path)
                .await
                .map_err(|source| PipelineError::InputAccess {
                    path: path.clone(),
                    source,
                })?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            self.store
                .load_tsv(&text, "existing")
                .await
                .map_err(|source| PipelineError::StorageWrite {
                    path: "ontology database".to_string(),
                    source,
                })?;
            previous = text;
        }

        let loaded = sources::load_input(
            self.storage.as_ref(),
            &self.registry,
            &options.input,
            options.recursive,
        )
        .await?;

        // The content is fixed for the whole run, so one index and one
        // segmentation serve every pass.
        let segmenter = Arc::new(Segmenter::new()?);
        let segments = Arc::new(segmenter.segment(loaded.content.as_bytes(), options.max_tokens)?);
        let index = Arc::new(PositionIndex::build(&loaded.content));

        for pass in 1..=options.passes {
            self.check_cancelled()?;
            let span = info_span!("pass", pass);
            let (merged, failed) = self
                .run_pass(pass, options, &segmenter, &segments, &index, &previous)
                .instrument(span)
                .await?;
            report.segments.push(segments.len());
            report.failed_segments.push(failed);
            previous = merged;
        }

        self.check_cancelled()?;
        let snapshot = self.store.snapshot().await;
        let plan = OutputPlan {
            output: &options.output,
            index: index.as_ref(),
            sources: &loaded.sources,
            passes: options.passes,
            context_output: options.context_output,
            context_words: options.context_words,
        };
        report.written = write_outputs(self.storage.as_ref(), &snapshot, &plan).await?;
        report.entities = snapshot.entity_count();
        report.relations = snapshot.relation_count();

        info!(
            passes = report.passes,
            entities = report.entities,
            relations = report.relations,
            "Enrichment complete"
        );
        Ok(report)
    }

    /// One pass: fan out, collect in order, merge. Returns the merged TSV
    /// and the number of failed segments.
    async fn run_pass(
        &self,
        pass: usize,
        options: &EnrichOptions,
        segmenter: &Arc<Segmenter>,
        segments: &Arc<Vec<Segment>>,
        index: &Arc<PositionIndex>,
        previous: &str,
    ) -> Result<(String, usize), PipelineError> {
        let total = segments.len();
        self.progress.report(ProgressEvent::Segmenting {
            pass,
            total_segments: total,
        });
        info!(segments = total, "Starting pass");

        let processor = Arc::new(
            SegmentProcessor::new(
                self.driver.clone(),
                self.store.clone(),
                index.clone(),
                self.prompts.enrichment.clone(),
            )
            .with_additional_prompt(options.additional_prompt.clone())
            .with_positions(options.include_positions),
        );
        let gate = Arc::new(Semaphore::new(MAX_WORKERS));
        let previous: Arc<str> = Arc::from(previous);

        let mut handles = Vec::with_capacity(total);
        for i in 0..total {
            let gate = gate.clone();
            let cancel = self.cancel.clone();
            let processor = processor.clone();
            let segmenter = segmenter.clone();
            let segments = segments.clone();
            let previous = previous.clone();
            let progress = self.progress.clone();
            let context_size = options.context_size;

            let task = async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return SegmentOutcome::Skipped,
                    permit = gate.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return SegmentOutcome::Skipped,
                    },
                };
                if cancel.is_cancelled() {
                    return SegmentOutcome::Skipped;
                }

                let context = segmenter.get_context(&segments, i, context_size);
                let result = processor.process(&segments[i], &context, &previous).await;
                progress.report(ProgressEvent::ProcessingSegment {
                    pass,
                    segment: i,
                    total,
                });
                match result {
                    Ok(tsv) => SegmentOutcome::Done(tsv),
                    Err(e) => {
                        warn!(error = %e, "Segment failed; continuing with an empty result");
                        SegmentOutcome::Failed
                    }
                }
            };
            handles.push(tokio::spawn(task.instrument(info_span!("segment", index = i))));
        }

        let mut results = vec![String::new(); total];
        let mut failed = 0usize;
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(SegmentOutcome::Done(tsv)) => results[i] = tsv,
                Ok(SegmentOutcome::Failed) => failed += 1,
                Ok(SegmentOutcome::Skipped) => {}
                Err(e) => {
                    error!(segment = i, error = %e, "Segment worker panicked");
                    failed += 1;
                }
            }
        }
        self.check_cancelled()?;

        self.progress.report(ProgressEvent::Merging { pass });
        let merged = self
            .merge(pass, options, index, previous.as_ref(), &results)
            .await
            .map_err(|e| PipelineError::MergeFailed {
                pass,
                source: Box::new(e),
            })?;

        info!(failed, "Pass complete");
        Ok((merged, failed))
    }

    async fn merge(
        &self,
        pass: usize,
        options: &EnrichOptions,
        index: &PositionIndex,
        previous: &str,
        results: &[String],
    ) -> Result<String, PipelineError> {
        let joined = results
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let mut values = prompt::values([
            ("previous_ontology", previous),
            ("new_ontology", joined.as_str()),
        ]);
        if let Some(extra) = &options.additional_prompt {
            values.insert(ADDITIONAL_PROMPT_KEY.to_string(), extra.clone());
        }

        let raw = self
            .driver
            .process_with_prompt(&self.prompts.merge, &values)
            .await?;
        let mut merged = normalize_tsv(&raw);
        if merged.trim().is_empty() {
            warn!(pass, "Merge returned nothing; keeping the concatenated segment results");
            merged = normalize_tsv(&joined);
        }

        let stats = apply_records(
            &self.store,
            index,
            &parse_tsv(&merged),
            options.include_positions,
            "merge",
        )
        .await?;
        debug!(
            entities = stats.entities,
            relations = stats.relations,
            skipped = stats.skipped,
            "Applied merged ontology"
        );
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockClient;
    use crate::storage_fs::LocalStorage;

    async fn enricher(mock: &MockClient) -> Enricher {
        let driver = Arc::new(LlmDriver::new(Arc::new(mock.clone())));
        let store = Arc::new(OntologyStore::open(None).await.unwrap());
        Enricher::new(driver, store, Arc::new(LocalStorage::new()))
    }

    fn options(input: &str, output: &str) -> EnrichOptions {
        EnrichOptions::from_config(&Config::default(), input, output)
    }

    #[tokio::test]
    async fn rejects_bad_options() {
        let mock = MockClient::new("");
        let e = enricher(&mock).await;

        let mut opts = options("in.txt", "out.tsv");
        opts.passes = 0;
        assert!(matches!(e.run(&opts).await, Err(PipelineError::Config(_))));

        let mut opts = options("in.txt", "out.tsv");
        opts.format = "rdf".into();
        assert!(matches!(e.run(&opts).await, Err(PipelineError::Config(_))));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_input_is_invalid_content() {
        let tmp = tempfile::TempDir::new().unwrap();
        let input = tmp.path().join("empty.txt");
        std::fs::write(&input, "   \n").unwrap();
        let output = tmp.path().join("out.tsv");

        let mock = MockClient::new("");
        let opts = options(&input.to_string_lossy(), &output.to_string_lossy());
        let err = enricher(&mock).await.run(&opts).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidContent));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn empty_merge_falls_back_to_segment_results() {
        let tmp = tempfile::TempDir::new().unwrap();
        let input = tmp.path().join("doc.txt");
        std::fs::write(&input, "Alice lives in Paris.").unwrap();
        let output = tmp.path().join("out.tsv");

        let mock = MockClient::new("")
            .with_response("enriching an existing ontology", "Alice\tPerson\ta resident");
        let e = enricher(&mock).await;
        let report = e
            .run(&options(&input.to_string_lossy(), &output.to_string_lossy()))
            .await
            .unwrap();

        assert_eq!(report.entities, 1);
        let tsv = std::fs::read_to_string(&output).unwrap();
        assert_eq!(tsv, "Alice\tPerson\ta resident\t0\n");
    }
}
