//! # Ontology Enricher CLI (`onto`)
//!
//! Builds an ontology from documents by asking an LLM, segment by segment,
//! and merging the answers over one or more passes.
//!
//! ## Usage
//!
//! ```bash
//! onto --config ./config/ontology.yaml enrich <input> [flags]
//! ```
//!
//! ## Examples
//!
//! ```bash
//! # One pass over a single document
//! onto enrich report.pdf --output out/report.tsv
//!
//! # Three passes over a directory tree, with positional context
//! onto enrich ./docs --recursive --passes 3 --context-output
//!
//! # Continue an existing ontology with a local model
//! onto enrich notes.md --existing-ontology out/notes.tsv --llm ollama --llm-model llama3
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ontology_enricher::config::{self, Config};
use ontology_enricher::enrich::{EnrichOptions, Enricher};
use ontology_enricher::llm::{self, LlmDriver};
use ontology_enricher::output::sibling_path;
use ontology_enricher::progress::ProgressMode;
use ontology_enricher::prompt::{PromptOverrides, PromptSet};
use ontology_enricher::storage::open_storage;
use ontology_enricher::store::OntologyStore;

/// Ontology Enricher: LLM-driven ontology extraction from documents.
#[derive(Parser)]
#[command(name = "onto", version, about = "Build and enrich ontologies from documents with an LLM")]
struct Cli {
    /// Path to the YAML configuration file.
    ///
    /// Falls back to `ONTOLOGY_CONFIG_PATH`, then `./config/ontology.yaml`,
    /// then built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long, global = true, conflicts_with = "silent")]
    debug: bool,

    /// Log errors only.
    #[arg(long, global = true)]
    silent: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract and enrich an ontology from a file or directory.
    Enrich {
        /// Input file or directory (defaults to the current directory).
        input_path: Option<String>,

        /// Output TSV path. Defaults to the input path with a `.tsv` extension.
        #[arg(long, short)]
        output: Option<String>,

        /// Output format. Only `tsv` has a built-in serialiser.
        #[arg(long, default_value = "tsv")]
        format: String,

        /// LLM backend: openai, claude or ollama (default from config).
        #[arg(long)]
        llm: Option<String>,

        /// Model name for the LLM backend (default from config).
        #[arg(long)]
        llm_model: Option<String>,

        /// Number of enrichment passes.
        #[arg(long, default_value_t = 1)]
        passes: usize,

        /// Descend into sub-directories of a directory input.
        #[arg(long)]
        recursive: bool,

        /// TSV ontology to start from.
        #[arg(long)]
        existing_ontology: Option<String>,

        /// Replace the entity extraction prompt with this file.
        ///
        /// Loaded and validated, but the enrichment passes only render the
        /// enrichment and merge prompts.
        #[arg(long)]
        entity_prompt: Option<String>,

        /// Replace the relation extraction prompt with this file.
        ///
        /// Loaded and validated, but not rendered by the enrichment passes.
        #[arg(long)]
        relation_prompt: Option<String>,

        /// Replace the enrichment prompt with this file.
        #[arg(long)]
        enrichment_prompt: Option<String>,

        /// Replace the merge prompt with this file.
        #[arg(long)]
        merge_prompt: Option<String>,

        /// Also write `<base>_context.json` with every entity occurrence.
        #[arg(long)]
        context_output: bool,

        /// Do not record entity positions.
        #[arg(long)]
        no_positions: bool,

        /// Progress on stderr: off, human or json (default: human on a TTY).
        #[arg(long)]
        progress: Option<ProgressMode>,
    },
}

fn init_tracing(debug: bool, silent: bool) {
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else if silent {
        tracing_subscriber::EnvFilter::new("error")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.silent);

    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Enrich {
            input_path,
            output,
            format,
            llm,
            llm_model,
            passes,
            recursive,
            existing_ontology,
            entity_prompt,
            relation_prompt,
            enrichment_prompt,
            merge_prompt,
            context_output,
            no_positions,
            progress,
        } => {
            let input = input_path.unwrap_or_else(|| ".".to_string());
            let output = output
                .unwrap_or_else(|| sibling_path(input.trim_end_matches('/'), ".tsv"));

            let mut options = EnrichOptions::from_config(&cfg, &input, &output);
            options.format = format;
            options.passes = passes;
            options.recursive = recursive;
            options.existing_ontology = existing_ontology;
            options.context_output = context_output || cfg.context_output;
            options.include_positions = cfg.include_positions && !no_positions;

            let overrides = PromptOverrides {
                entity_extraction: entity_prompt,
                relation_extraction: relation_prompt,
                enrichment: enrichment_prompt,
                merge: merge_prompt,
            };
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let llm = llm.unwrap_or_else(|| cfg.default_llm.clone());
            let model = llm_model.unwrap_or_else(|| cfg.default_model.clone());

            run_enrich(&cfg, &llm, &model, options, overrides, progress).await?;
        }
    }

    Ok(())
}

async fn run_enrich(
    cfg: &Config,
    llm: &str,
    model: &str,
    options: EnrichOptions,
    overrides: PromptOverrides,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    cfg.validate_llm(llm)?;
    let client = llm::create_client(cfg, llm, model)?;
    let driver = Arc::new(LlmDriver::new(client));
    let storage = open_storage(cfg)?;
    let store = Arc::new(
        OntologyStore::open(cfg.database_path.as_deref())
            .await
            .context("Failed to open ontology database")?,
    );
    let prompts = PromptSet::load(storage.as_ref(), &overrides).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight requests");
            on_signal.cancel();
        }
    });

    info!(
        input = %options.input,
        output = %options.output,
        llm,
        model,
        storage = storage.kind(),
        passes = options.passes,
        "Starting enrichment"
    );

    let enricher = Enricher::new(driver, store, storage)
        .with_prompts(prompts)
        .with_progress(progress.reporter())
        .with_cancellation(cancel);
    let report = enricher
        .run(&options)
        .await
        .with_context(|| format!("Enrichment of {} failed", options.input))?;

    for path in &report.written {
        println!("{}", path);
    }
    Ok(())
}
