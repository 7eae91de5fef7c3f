//! # Ontology Enricher
//!
//! Turns unstructured documents into an ontology (named entities plus typed,
//! weighted relations) by querying a large language model over segments of
//! the text and merging the answers across passes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌─────────┐   ┌───────────┐   ┌─────────────┐
//! │ Storage │──▶│ Parsers │──▶│ Segmenter │──▶│ Workers × 5 │──▶ LLM
//! │ FS / S3 │   └─────────┘   └───────────┘   └──────┬──────┘
//! └────▲────┘                                        ▼
//!      │        ┌────────┐    ┌───────┐       ┌─────────────┐
//!      └────────│ Output │◀───│ Merge │◀──────│ Store+SQLite│
//!               └────────┘    └───────┘       └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! onto enrich ./docs --recursive --passes 2 --output out/docs.tsv
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | YAML configuration and environment overrides |
//! | [`error`] | Pipeline error taxonomy |
//! | [`models`] | Entities, relations, segments, metadata |
//! | [`position`] | Word-position index with fuzzy name lookup |
//! | [`segment`] | Token-bounded segmentation and look-behind context |
//! | [`prompt`] | Stage templates and `{slot}` rendering |
//! | [`llm`] | LLM clients, retrying driver, scripted mock |
//! | [`store`] | In-memory ontology mirrored to SQLite |
//! | [`db`] / [`migrate`] | SQLite pool and schema |
//! | [`processor`] | Per-segment enrichment and TSV parsing |
//! | [`enrich`] | Multi-pass orchestration |
//! | [`output`] | TSV, context JSON, metadata manifest |
//! | [`parser`] | Document format parsers |
//! | [`sources`] | Input discovery and concatenation |
//! | [`storage`] | Storage capability ([`storage_fs`], [`storage_s3`]) |
//! | [`progress`] | Progress reporting on stderr |

pub mod config;
pub mod db;
pub mod enrich;
pub mod error;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod output;
pub mod parser;
pub mod position;
pub mod processor;
pub mod progress;
pub mod prompt;
pub mod segment;
pub mod sources;
pub mod storage;
pub mod storage_fs;
pub mod storage_s3;
pub mod store;
