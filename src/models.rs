//! Core data models used throughout the enrichment pipeline.
//!
//! These types represent the entities, relations, segments, and output
//! records that flow between the segmenter, the LLM driver, the ontology
//! store, and the output assembler.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical form of an entity name: trimmed, inner whitespace replaced by `_`.
///
/// The LLM is asked to write multi-word names with underscores; this keeps
/// `"Jean Dupont"` and `"Jean_Dupont"` on the same key.
pub fn canonical_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join("_")
}

/// A named thing discovered in the source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub description: String,
    /// Word indices into the canonical content. Duplicate-free, insertion order.
    pub positions: Vec<usize>,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(name: &str, entity_type: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            name: canonical_name(name),
            entity_type: entity_type.trim().to_string(),
            description: description.trim().to_string(),
            positions: Vec::new(),
            source: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_positions(mut self, positions: impl IntoIterator<Item = usize>) -> Self {
        self.merge_positions(positions);
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    /// Union `positions` into this entity, skipping ones already present.
    pub fn merge_positions(&mut self, positions: impl IntoIterator<Item = usize>) {
        let mut seen: HashSet<usize> = self.positions.iter().copied().collect();
        for p in positions {
            if seen.insert(p) {
                self.positions.push(p);
            }
        }
    }

    /// Positions in ascending order.
    pub fn sorted_positions(&self) -> Vec<usize> {
        let mut out = self.positions.clone();
        out.sort_unstable();
        out
    }
}

/// Direction of a relation between its source and target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
    Bidirectional,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
            Direction::Bidirectional => "bidirectional",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(Direction::Forward),
            "backward" => Ok(Direction::Backward),
            "bidirectional" => Ok(Direction::Bidirectional),
            other => Err(format!("unknown relation direction: '{}'", other)),
        }
    }
}

/// Unique key of a relation: `(source, type, target)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationKey {
    pub source: String,
    pub relation_type: String,
    pub target: String,
}

/// A typed directed link between two entity names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub source: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    pub target: String,
    pub description: String,
    pub weight: f64,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relation {
    pub fn new(source: &str, relation_type: &str, target: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            source: canonical_name(source),
            relation_type: relation_type.trim().to_string(),
            target: canonical_name(target),
            description: description.trim().to_string(),
            weight: 0.0,
            direction: Direction::Forward,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = if weight.is_finite() {
            weight.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn key(&self) -> RelationKey {
        RelationKey {
            source: self.source.clone(),
            relation_type: self.relation_type.clone(),
            target: self.target.clone(),
        }
    }
}

/// Inclusive range of word indices covered by one entity occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionRange {
    pub start: usize,
    pub end: usize,
    pub element: String,
}

/// Text window around one entity occurrence, as written to `_context.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub position: usize,
    pub file_id: String,
    pub file_position: usize,
    pub before: Vec<String>,
    pub after: Vec<String>,
    pub element: String,
    pub length: usize,
}

/// Token-bounded slice of the canonical content, by byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
    pub content: String,
}

/// Where one input file's words sit inside the concatenated content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpan {
    pub file_id: String,
    pub word_start: usize,
    pub word_count: usize,
}

/// Per-file entry of the `_meta.json` manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    pub path: String,
    pub directory: String,
    pub modified: DateTime<Utc>,
    pub size: u64,
    pub sha256: String,
    pub format_metadata: BTreeMap<String, String>,
}

/// The `_meta.json` manifest for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub source: FileMetadata,
    pub files: Vec<FileMetadata>,
    pub ontology_file: String,
    pub context_file: Option<String>,
    pub passes: usize,
    pub processed_at: DateTime<Utc>,
}
