//! Per-segment enrichment and LLM TSV interpretation.
//!
//! The model is asked for tab-separated lines, but real responses drift:
//! escaped `\t` sequences, code fences, header rows, space-separated
//! columns. [`normalize_tsv`] repairs what it can and drops the rest;
//! [`parse_line`] turns each surviving line into [`TsvRecord`]s.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::llm::LlmDriver;
use crate::models::{Entity, Relation, Segment};
use crate::position::PositionIndex;
use crate::prompt::{self, ADDITIONAL_PROMPT_KEY};
use crate::store::{split_weighted_type, OntologyStore};

/// One interpreted line of model output.
#[derive(Debug, Clone, PartialEq)]
pub enum TsvRecord {
    Entity {
        name: String,
        entity_type: String,
        description: String,
        /// Derived from a relation-shaped line rather than stated directly.
        from_relation: bool,
    },
    Relation {
        source: String,
        relation_type: String,
        weight: Option<f64>,
        target: String,
        description: String,
    },
    Invalid(String),
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_header(fields: &[String]) -> bool {
    let first = fields[0].to_ascii_lowercase();
    let second = fields[1].to_ascii_lowercase();
    matches!(first.as_str(), "name" | "source" | "entity")
        && matches!(second.as_str(), "type" | "relation_type" | "relation")
}

/// Split one raw line into cleaned fields, or `None` when it carries fewer
/// than three.
fn line_fields(line: &str) -> Option<Vec<String>> {
    let line = line.replace("\\t", "\t");
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with("```") {
        return None;
    }

    let fields: Vec<String> = if trimmed.contains('\t') {
        trimmed
            .split('\t')
            .map(collapse)
            .filter(|f| !f.is_empty())
            .collect()
    } else {
        let mut words = trimmed.split_whitespace();
        let first = words.next()?.to_string();
        let second = words.next()?.to_string();
        let rest = words.collect::<Vec<_>>().join(" ");
        vec![first, second, rest]
    };

    if fields.len() < 3 || fields.iter().take(3).any(|f| f.is_empty()) {
        return None;
    }
    if is_header(&fields) {
        return None;
    }
    Some(fields)
}

/// Clean raw model output into tab-separated lines of at least 3 fields.
pub fn normalize_tsv(raw: &str) -> String {
    let mut out = Vec::new();
    let mut rejected = 0usize;
    for line in raw.lines() {
        match line_fields(line) {
            Some(fields) => out.push(fields.join("\t")),
            None if line.trim().is_empty() => {}
            None => rejected += 1,
        }
    }
    if rejected > 0 {
        debug!(rejected, kept = out.len(), "Dropped unusable TSV lines");
    }
    out.join("\n")
}

/// Interpret one normalised line.
///
/// Three fields are an entity. Four or more are a relation
/// `(source, type, target, description...)`, and the same line also yields
/// an entity `(field1, field2, rest)`.
pub fn parse_line(line: &str) -> Vec<TsvRecord> {
    let fields: Vec<&str> = line.split('\t').collect();
    match fields.len() {
        0..=2 => vec![TsvRecord::Invalid(line.to_string())],
        3 => vec![TsvRecord::Entity {
            name: fields[0].to_string(),
            entity_type: fields[1].to_string(),
            description: fields[2].to_string(),
            from_relation: false,
        }],
        _ => {
            let (relation_type, weight) = split_weighted_type(fields[1]);
            vec![
                TsvRecord::Relation {
                    source: fields[0].to_string(),
                    relation_type,
                    weight,
                    target: fields[2].to_string(),
                    description: fields[3..].join(" "),
                },
                TsvRecord::Entity {
                    name: fields[0].to_string(),
                    entity_type: fields[1].to_string(),
                    description: fields[2..].join(" "),
                    from_relation: true,
                },
            ]
        }
    }
}

/// Parse every line of a normalised TSV block.
pub fn parse_tsv(tsv: &str) -> Vec<TsvRecord> {
    tsv.lines().flat_map(parse_line).collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyStats {
    pub entities: usize,
    pub relations: usize,
    pub skipped: usize,
}

/// Write `records` to the store, resolving entity positions through `index`
/// when `include_positions` is set.
///
/// Entities derived from relation-shaped lines are only inserted when no
/// entity of that name exists yet, so they never overwrite a stated type.
pub async fn apply_records(
    store: &OntologyStore,
    index: &PositionIndex,
    records: &[TsvRecord],
    include_positions: bool,
    source_tag: &str,
) -> Result<ApplyStats, PipelineError> {
    let mut stats = ApplyStats::default();

    for record in records {
        match record {
            TsvRecord::Entity {
                name,
                entity_type,
                description,
                from_relation,
            } => {
                let mut entity = Entity::new(name, entity_type, description).with_source(source_tag);
                if include_positions {
                    entity.merge_positions(index.find_positions(&entity.name));
                }
                let written = if *from_relation {
                    store.insert_entity_if_absent(entity).await
                } else {
                    store.upsert_entity(entity).await.map(|()| true)
                };
                let written = written.map_err(|source| PipelineError::StorageWrite {
                    path: "ontology database".to_string(),
                    source,
                })?;
                if written {
                    stats.entities += 1;
                } else {
                    stats.skipped += 1;
                }
            }
            TsvRecord::Relation {
                source,
                relation_type,
                weight,
                target,
                description,
            } => {
                let relation = Relation::new(source, relation_type, target, description)
                    .with_weight(weight.unwrap_or(0.0));
                store
                    .upsert_relation(relation)
                    .await
                    .map_err(|source| PipelineError::StorageWrite {
                        path: "ontology database".to_string(),
                        source,
                    })?;
                stats.relations += 1;
            }
            TsvRecord::Invalid(line) => {
                warn!(line = %line, "Ignoring invalid ontology line");
                stats.skipped += 1;
            }
        }
    }

    Ok(stats)
}

/// Runs the enrichment prompt for one segment and records its output.
pub struct SegmentProcessor {
    driver: Arc<LlmDriver>,
    store: Arc<OntologyStore>,
    index: Arc<PositionIndex>,
    template: String,
    additional_prompt: Option<String>,
    include_positions: bool,
}

impl SegmentProcessor {
    pub fn new(
        driver: Arc<LlmDriver>,
        store: Arc<OntologyStore>,
        index: Arc<PositionIndex>,
        template: String,
    ) -> Self {
        Self {
            driver,
            store,
            index,
            template,
            additional_prompt: None,
            include_positions: true,
        }
    }

    pub fn with_additional_prompt(mut self, extra: Option<String>) -> Self {
        self.additional_prompt = extra;
        self
    }

    pub fn with_positions(mut self, include: bool) -> Self {
        self.include_positions = include;
        self
    }

    /// Enrich `segment` given its look-behind `context` and the `previous`
    /// pass result. Returns the normalised TSV the model produced.
    pub async fn process(
        &self,
        segment: &Segment,
        context: &str,
        previous: &str,
    ) -> Result<String, PipelineError> {
        let mut values = prompt::values([
            ("previous_result", previous),
            ("text", segment.content.as_str()),
            ("context", context),
        ]);
        if let Some(extra) = &self.additional_prompt {
            values.insert(ADDITIONAL_PROMPT_KEY.to_string(), extra.clone());
        }

        let raw = self.driver.process_with_prompt(&self.template, &values).await?;
        let normalized = normalize_tsv(&raw);
        let records = parse_tsv(&normalized);
        let stats = apply_records(
            &self.store,
            &self.index,
            &records,
            self.include_positions,
            "enrichment",
        )
        .await?;

        debug!(
            start = segment.start,
            end = segment.end,
            entities = stats.entities,
            relations = stats.relations,
            "Processed segment"
        );
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockClient;
    use crate::prompt::ONTOLOGY_ENRICHMENT;

    #[test]
    fn normalizes_escapes_spaces_and_fences() {
        let raw = "```tsv\nname\ttype\tdescription\nAlice\\tPerson\\t  senior   engineer \n\
                   Bob Person works at  ACME\ntoo short\n\nCarol\t\tPerson\tdoctor\n```";
        let tsv = normalize_tsv(raw);
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Alice\tPerson\tsenior engineer",
                "Bob\tPerson\tworks at ACME",
                "Carol\tPerson\tdoctor",
            ]
        );
    }

    #[test]
    fn relation_lines_keep_all_fields() {
        let tsv = normalize_tsv("Alice\tknows\tBob\tsince   2020");
        assert_eq!(tsv, "Alice\tknows\tBob\tsince 2020");
    }

    #[test]
    fn three_fields_is_entity() {
        let records = parse_line("test\tConcept\ta trial");
        assert_eq!(
            records,
            vec![TsvRecord::Entity {
                name: "test".into(),
                entity_type: "Concept".into(),
                description: "a trial".into(),
                from_relation: false,
            }]
        );
    }

    #[test]
    fn four_fields_is_relation_and_entity() {
        let records = parse_line("Alice\tknows:1\tBob\tsince\t2020");
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            TsvRecord::Relation {
                source: "Alice".into(),
                relation_type: "knows".into(),
                weight: Some(1.0),
                target: "Bob".into(),
                description: "since 2020".into(),
            }
        );
        assert!(matches!(
            &records[1],
            TsvRecord::Entity { name, from_relation: true, .. } if name == "Alice"
        ));
        assert!(matches!(parse_line("a\tb")[0], TsvRecord::Invalid(_)));
    }

    #[tokio::test]
    async fn derived_entities_do_not_overwrite_stated_ones() {
        let store = OntologyStore::open(None).await.unwrap();
        let index = PositionIndex::build("Alice knows Bob");
        let records = parse_tsv("Alice\tPerson\tengineer\nAlice\tknows\tBob\tsince 2020");
        let stats = apply_records(&store, &index, &records, true, "test").await.unwrap();
        assert_eq!(stats.entities, 1);
        assert_eq!(stats.relations, 1);
        assert_eq!(stats.skipped, 1);

        let snap = store.snapshot().await;
        assert_eq!(snap.entity("Alice").unwrap().entity_type, "Person");
        assert_eq!(snap.entity("Alice").unwrap().positions, vec![0]);
    }

    #[tokio::test]
    async fn process_renders_prompt_and_stores_results() {
        let content = "This is a test. This is another test.";
        let mock = MockClient::new("test\tConcept\ta trial");
        let driver = Arc::new(LlmDriver::new(Arc::new(mock.clone())));
        let store = Arc::new(OntologyStore::open(None).await.unwrap());
        let index = Arc::new(PositionIndex::build(content));
        let processor = SegmentProcessor::new(
            driver,
            store.clone(),
            index,
            ONTOLOGY_ENRICHMENT.to_string(),
        )
        .with_additional_prompt(Some("Prefer English labels.".to_string()));

        let segment = Segment {
            start: 0,
            end: content.len(),
            content: content.to_string(),
        };
        let out = processor.process(&segment, "earlier text", "prev\tThing\tx").await.unwrap();
        assert_eq!(out, "test\tConcept\ta trial");

        let prompt = &mock.prompts()[0];
        assert!(prompt.contains(content));
        assert!(prompt.contains("earlier text"));
        assert!(prompt.contains("prev\tThing\tx"));
        assert!(prompt.ends_with("Additional instructions:\nPrefer English labels."));

        let snap = store.snapshot().await;
        assert_eq!(snap.entity("test").unwrap().sorted_positions(), vec![3, 7]);
    }

    #[tokio::test]
    async fn positions_can_be_disabled() {
        let mock = MockClient::new("test\tConcept\ta trial");
        let driver = Arc::new(LlmDriver::new(Arc::new(mock)));
        let store = Arc::new(OntologyStore::open(None).await.unwrap());
        let index = Arc::new(PositionIndex::build("a test"));
        let processor =
            SegmentProcessor::new(driver, store.clone(), index, ONTOLOGY_ENRICHMENT.to_string())
                .with_positions(false);
        let segment = Segment {
            start: 0,
            end: 6,
            content: "a test".to_string(),
        };
        processor.process(&segment, "", "").await.unwrap();
        assert!(store.snapshot().await.entity("test").unwrap().positions.is_empty());
    }
}
