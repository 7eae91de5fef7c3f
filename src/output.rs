//! Output assembly: ontology TSV, positional context JSON, metadata manifest.
//!
//! All artifacts go through [`Storage`]. Given an output path `out/onto.tsv`
//! the files written are:
//!
//! | File | Content |
//! |------|---------|
//! | `out/onto.tsv` | entity rows, then relation rows |
//! | `out/onto_context.json` | one [`ContextEntry`] per merged occurrence range (optional) |
//! | `out/onto_meta.json` | [`ProjectMetadata`] for the input |

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::models::{ContextEntry, PositionRange, ProjectMetadata};
use crate::position::{normalize, PositionIndex};
use crate::sources::{describe_file, SourceMap};
use crate::storage::Storage;
use crate::store::Ontology;

/// Render the ontology as TSV.
///
/// Entities: `name\ttype\tdescription\tpositions` with ascending
/// comma-separated positions. Relations: `source\ttype:weight\ttarget\tdescription`
/// with the weight truncated to an integer. A relation endpoint must be a
/// known entity or a name `index` finds in the content; relations with an
/// endpoint matching neither are left out.
pub fn render_tsv(ontology: &Ontology, index: &PositionIndex) -> String {
    let mut out = String::new();

    for entity in ontology.entities() {
        let positions = entity
            .sorted_positions()
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            entity.name, entity.entity_type, entity.description, positions
        ));
    }

    let (resolved, dangling) =
        ontology.partition_relations(|name| !index.find_positions(name).is_empty());
    for relation in &dangling {
        warn!(
            source = %relation.source,
            relation = %relation.relation_type,
            target = %relation.target,
            "Dropping relation with unresolved endpoint"
        );
    }
    for relation in resolved {
        out.push_str(&format!(
            "{}\t{}:{}\t{}\t{}\n",
            relation.source,
            relation.relation_type,
            relation.weight as i64,
            relation.target,
            relation.description
        ));
    }

    out
}

fn name_tokens(name: &str) -> Vec<String> {
    normalize(name)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Occurrence ranges of every entity over `words`.
///
/// Combines the stored positions (each spanning as many words as the name
/// has) with a fresh in-order scan for the name's words.
pub fn collect_ranges(ontology: &Ontology, words: &[String]) -> Vec<PositionRange> {
    let normalized: Vec<String> = words.iter().map(|w| normalize(w)).collect();
    let mut ranges = Vec::new();

    for entity in ontology.entities() {
        let tokens = name_tokens(&entity.name);
        if tokens.is_empty() {
            continue;
        }
        let span = tokens.len();

        for &start in &entity.positions {
            if start < words.len() {
                ranges.push(PositionRange {
                    start,
                    end: (start + span - 1).min(words.len() - 1),
                    element: entity.name.clone(),
                });
            }
        }

        if normalized.len() >= span {
            for start in 0..=normalized.len() - span {
                if normalized[start..start + span] == tokens[..] {
                    ranges.push(PositionRange {
                        start,
                        end: start + span - 1,
                        element: entity.name.clone(),
                    });
                }
            }
        }
    }

    ranges
}

/// Sort by start and merge ranges that overlap or touch. A merged range
/// keeps the longer of the two element names.
pub fn merge_overlapping_positions(mut ranges: Vec<PositionRange>) -> Vec<PositionRange> {
    ranges.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

    let mut merged: Vec<PositionRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end + 1 => {
                last.end = last.end.max(range.end);
                if range.element.len() > last.element.len() {
                    last.element = range.element;
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// One context entry per merged range, with up to `context_words` words on
/// either side. `before` never reaches back into the previous range.
pub fn build_context(
    ranges: &[PositionRange],
    words: &[String],
    sources: &SourceMap,
    context_words: usize,
) -> Vec<ContextEntry> {
    let mut entries = Vec::with_capacity(ranges.len());
    let mut floor = 0usize;

    for range in ranges {
        let before_start = range.start.saturating_sub(context_words).max(floor);
        let after_end = (range.end + 1 + context_words).min(words.len());
        let (file_id, file_position) = sources
            .locate(range.start)
            .map(|(id, pos)| (id.to_string(), pos))
            .unwrap_or_else(|| (String::new(), range.start));

        entries.push(ContextEntry {
            position: range.start,
            file_id,
            file_position,
            before: words[before_start.min(range.start)..range.start].to_vec(),
            after: words[(range.end + 1).min(words.len())..after_end].to_vec(),
            element: range.element.clone(),
            length: range.end - range.start + 1,
        });
        floor = range.end + 1;
    }

    entries
}

/// `base` with its extension replaced by `suffix`: `out/a.tsv` → `out/a_context.json`.
pub fn sibling_path(output: &str, suffix: &str) -> String {
    let name_start = output.rfind('/').map_or(0, |i| i + 1);
    let stem_end = match output[name_start..].rfind('.') {
        Some(i) if i > 0 => name_start + i,
        _ => output.len(),
    };
    format!("{}{}", &output[..stem_end], suffix)
}

pub fn context_path(output: &str) -> String {
    sibling_path(output, "_context.json")
}

pub fn metadata_path(output: &str) -> String {
    sibling_path(output, "_meta.json")
}

fn to_json<T: Serialize>(value: &T, path: &str) -> Result<Vec<u8>, PipelineError> {
    serde_json::to_vec_pretty(value).map_err(|e| PipelineError::StorageWrite {
        path: path.to_string(),
        source: e.into(),
    })
}

async fn write_artifact(storage: &dyn Storage, path: &str, data: &[u8]) -> Result<(), PipelineError> {
    storage
        .write(path, data)
        .await
        .map_err(|source| PipelineError::StorageWrite {
            path: path.to_string(),
            source,
        })
}

/// What to write for one run.
pub struct OutputPlan<'a> {
    pub output: &'a str,
    pub index: &'a PositionIndex,
    pub sources: &'a SourceMap,
    pub passes: usize,
    pub context_output: bool,
    pub context_words: usize,
}

/// Write every artifact and return the paths written.
pub async fn write_outputs(
    storage: &dyn Storage,
    ontology: &Ontology,
    plan: &OutputPlan<'_>,
) -> Result<Vec<String>, PipelineError> {
    let mut written = Vec::new();

    let tsv = render_tsv(ontology, plan.index);
    write_artifact(storage, plan.output, tsv.as_bytes()).await?;
    written.push(plan.output.to_string());

    let mut context_file = None;
    if plan.context_output {
        let words = plan.index.words();
        let ranges = merge_overlapping_positions(collect_ranges(ontology, words));
        let entries = build_context(&ranges, words, plan.sources, plan.context_words);
        let path = context_path(plan.output);
        write_artifact(storage, &path, &to_json(&entries, &path)?).await?;
        info!(path = %path, entries = entries.len(), "Wrote context file");
        context_file = Some(path.clone());
        written.push(path);
    }

    let meta_path = metadata_path(plan.output);
    let describe_err = |path: &str, source: anyhow::Error| PipelineError::InputAccess {
        path: path.to_string(),
        source,
    };
    let source = describe_file(storage, &plan.sources.root, Default::default())
        .await
        .map_err(|e| describe_err(&plan.sources.root, e))?;
    let mut files = Vec::with_capacity(plan.sources.files.len());
    for file in &plan.sources.files {
        let meta = describe_file(storage, &file.path, file.format_metadata.clone())
            .await
            .map_err(|e| describe_err(&file.path, e))?;
        files.push(meta);
    }
    let manifest = ProjectMetadata {
        source,
        files,
        ontology_file: plan.output.to_string(),
        context_file,
        passes: plan.passes,
        processed_at: Utc::now(),
    };
    write_artifact(storage, &meta_path, &to_json(&manifest, &meta_path)?).await?;
    written.push(meta_path);

    info!(
        output = plan.output,
        entities = ontology.entity_count(),
        relations = ontology.relation_count(),
        "Wrote ontology"
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, Relation, SourceSpan};

    fn words(text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    fn range(start: usize, end: usize, element: &str) -> PositionRange {
        PositionRange {
            start,
            end,
            element: element.to_string(),
        }
    }

    #[test]
    fn tsv_lines() {
        let mut onto = Ontology::default();
        onto.add_element(Entity::new("Paris", "City", "Capital").with_positions([9, 2, 5]));
        onto.add_element(Entity::new("France", "Country", "").with_positions([]));
        onto.add_relation(Relation::new("Paris", "capital_of", "France", "seat").with_weight(1.0));
        onto.add_relation(Relation::new("Paris", "twin_of", "Rome", "").with_weight(0.9));

        let index = PositionIndex::build("Paris is the capital of France");
        let tsv = render_tsv(&onto, &index);
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Paris\tCity\tCapital\t2,5,9",
                "France\tCountry\t\t",
                "Paris\tcapital_of:1\tFrance\tseat",
            ]
        );
    }

    #[test]
    fn weights_truncate() {
        let mut onto = Ontology::default();
        onto.add_element(Entity::new("A", "T", ""));
        onto.add_element(Entity::new("B", "T", ""));
        onto.add_relation(Relation::new("A", "near", "B", "").with_weight(0.8));
        let index = PositionIndex::build("");
        assert!(render_tsv(&onto, &index).contains("A\tnear:0\tB\t"));
    }

    #[test]
    fn relation_endpoints_resolve_through_the_content() {
        let mut onto = Ontology::default();
        onto.add_element(Entity::new("Alice", "knows", "Bob since 2020"));
        onto.add_relation(Relation::new("Alice", "knows", "Bob", "since 2020"));
        onto.add_relation(Relation::new("Alice", "knows", "Carol", ""));

        let index = PositionIndex::build("Alice met Bob in 2020.");
        let tsv = render_tsv(&onto, &index);
        assert!(tsv.contains("Alice\tknows:0\tBob\tsince 2020\n"));
        assert!(!tsv.contains("Carol"));
    }

    #[test]
    fn merges_overlaps_and_adjacent() {
        let merged = merge_overlapping_positions(vec![
            range(10, 10, "X"),
            range(0, 1, "New_York"),
            range(1, 1, "York"),
            range(2, 3, "City_Hall"),
            range(6, 6, "Y"),
        ]);
        assert_eq!(
            merged,
            vec![range(0, 3, "City_Hall"), range(6, 6, "Y"), range(10, 10, "X")]
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let once = merge_overlapping_positions(vec![range(4, 6, "a"), range(5, 9, "bb"), range(0, 0, "c")]);
        assert_eq!(merge_overlapping_positions(once.clone()), once);
    }

    #[test]
    fn ranges_from_positions_and_scan() {
        let w = words("I flew to New York. new york was busy");
        let mut onto = Ontology::default();
        onto.add_element(Entity::new("New York", "City", "").with_positions([3]));
        let merged = merge_overlapping_positions(collect_ranges(&onto, &w));
        assert_eq!(merged, vec![range(3, 6, "New_York")]);
    }

    #[test]
    fn context_clips_before_at_previous_range() {
        let w = words("a b c Paris d France e f");
        let sources = SourceMap {
            root: "in.txt".into(),
            files: vec![],
            spans: vec![SourceSpan {
                file_id: "f1".into(),
                word_start: 0,
                word_count: w.len(),
            }],
        };
        let ranges = vec![range(3, 3, "Paris"), range(5, 5, "France")];
        let entries = build_context(&ranges, &w, &sources, 2);

        assert_eq!(entries[0].before, vec!["b", "c"]);
        assert_eq!(entries[0].after, vec!["d", "France"]);
        assert_eq!(entries[1].before, vec!["d"]);
        assert_eq!(entries[1].after, vec!["e", "f"]);
        assert_eq!(entries[1].file_id, "f1");
        assert_eq!(entries[1].file_position, 5);
        assert_eq!(entries[1].length, 1);
    }

    #[test]
    fn context_json_keys() {
        let entry = ContextEntry {
            position: 1,
            file_id: "abc".into(),
            file_position: 1,
            before: vec!["<b>".into()],
            after: vec![],
            element: "X".into(),
            length: 1,
        };
        let json = String::from_utf8(to_json(&vec![entry], "x").unwrap()).unwrap();
        assert!(json.contains("\n  {\n    \"position\": 1,"));
        assert!(json.contains("\"file_position\""));
        assert!(json.contains("<b>"));
    }

    #[test]
    fn sibling_paths() {
        assert_eq!(context_path("out/onto.tsv"), "out/onto_context.json");
        assert_eq!(metadata_path("out/onto.tsv"), "out/onto_meta.json");
        assert_eq!(metadata_path("out.d/onto"), "out.d/onto_meta.json");
        assert_eq!(context_path(".hidden"), ".hidden_context.json");
    }
}
