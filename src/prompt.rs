//! Prompt templates and `{slot}` rendering.
//!
//! A template is plain text with `{name}` slots. [`render`] replaces every
//! slot whose name appears in the value map and leaves the rest literal.
//! The four pipeline stages each have a built-in template; any of them can
//! be replaced by a user-supplied file through [`PromptSet`].

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::storage::Storage;

/// Value key whose non-empty content is appended as an extra section.
pub const ADDITIONAL_PROMPT_KEY: &str = "additional_prompt";

pub const ENTITY_EXTRACTION: &str = "\
You are an expert ontologist. Extract every named entity from the text below.

Return one entity per line, as tab-separated values:
name<TAB>type<TAB>description

Rules:
- Replace spaces inside entity names with underscores (Jean Dupont -> Jean_Dupont).
- The type is a short class label such as Person, Organization, Place, Concept or Event.
- The description is one short sentence grounded in the text.
- Output only the TSV lines, with no header, numbering or commentary.

Text:
{text}";

pub const RELATION_EXTRACTION: &str = "\
You are an expert ontologist. Using the entities listed below, extract the
relations between them that the text states or clearly implies.

Entities:
{entities}

Return one relation per line, as tab-separated values:
source<TAB>type<TAB>target<TAB>description

Rules:
- source and target must be entity names exactly as listed (underscores included).
- The type is a short verb phrase in snake_case, such as works_for or located_in.
- Output only the TSV lines, with no header, numbering or commentary.

Text:
{text}";

pub const ONTOLOGY_ENRICHMENT: &str = "\
You are an expert ontologist enriching an existing ontology with a new passage
of a document.

Ontology built so far (may be empty):
{previous_result}

Preceding text, for context only:
{context}

New text to analyse:
{text}

Return the complete enriched ontology for the new text as tab-separated lines:
- entities: name<TAB>type<TAB>description
- relations: source<TAB>relation_type<TAB>target<TAB>description

Rules:
- Replace spaces inside entity names with underscores.
- Reuse the names of entities already present in the ontology when they refer to the same thing.
- Every relation endpoint must also appear as an entity line.
- Output only the TSV lines, with no header, numbering or commentary.";

pub const ONTOLOGY_MERGE: &str = "\
You are an expert ontologist. Merge the two ontologies below into a single
consistent ontology.

Previous ontology:
{previous_ontology}

New ontology:
{new_ontology}

Rules:
- Keep every entity of the previous ontology; merge duplicates that name the same thing.
- Prefer the more precise type and the more complete description.
- Keep every relation whose endpoints are kept entities.
- Use the same formats: name<TAB>type<TAB>description for entities and
  source<TAB>relation_type<TAB>target<TAB>description for relations.
- Output only the TSV lines, with no header, numbering or commentary.";

/// Fill `{name}` slots of `template` from `values`.
///
/// Unknown slots and unbalanced braces are copied through unchanged, and
/// substituted values are never scanned for further slots.
pub fn render(template: &str, values: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(|c| c == '}' || c == '{') {
            Some(close) if after.as_bytes()[close] == b'}' => {
                let name = &after[..close];
                match values.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);

    if let Some(extra) = values.get(ADDITIONAL_PROMPT_KEY) {
        if !extra.trim().is_empty() {
            out.push_str("\n\nAdditional instructions:\n");
            out.push_str(extra);
        }
    }

    out
}

/// Convenience for building a value map from string pairs.
pub fn values<'a, I>(pairs: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// The four stage templates in use for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    pub entity_extraction: String,
    pub relation_extraction: String,
    pub enrichment: String,
    pub merge: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            entity_extraction: ENTITY_EXTRACTION.to_string(),
            relation_extraction: RELATION_EXTRACTION.to_string(),
            enrichment: ONTOLOGY_ENRICHMENT.to_string(),
            merge: ONTOLOGY_MERGE.to_string(),
        }
    }
}

/// Template files that replace the built-in ones, by stage.
#[derive(Debug, Clone, Default)]
pub struct PromptOverrides {
    pub entity_extraction: Option<String>,
    pub relation_extraction: Option<String>,
    pub enrichment: Option<String>,
    pub merge: Option<String>,
}

impl PromptOverrides {
    /// Stages with an override that the enrichment passes never render.
    /// Only the enrichment and merge templates drive a run.
    pub fn unused_stages(&self) -> Vec<&'static str> {
        let mut unused = Vec::new();
        if self.entity_extraction.is_some() {
            unused.push("entity_extraction");
        }
        if self.relation_extraction.is_some() {
            unused.push("relation_extraction");
        }
        unused
    }
}

impl PromptSet {
    /// Built-in templates with every override file read through `storage`.
    pub async fn load(storage: &dyn Storage, overrides: &PromptOverrides) -> Result<Self, PipelineError> {
        for stage in overrides.unused_stages() {
            warn!(stage, "Prompt override is loaded but not used by the enrichment passes");
        }

        let mut set = Self::default();
        let slots = [
            (&overrides.entity_extraction, &mut set.entity_extraction),
            (&overrides.relation_extraction, &mut set.relation_extraction),
            (&overrides.enrichment, &mut set.enrichment),
            (&overrides.merge, &mut set.merge),
        ];
        for (path, template) in slots {
            let Some(path) = path else { continue };
            let bytes = storage
                .read(path)
                .await
                .map_err(|source| PipelineError::InputAccess {
                    path: path.clone(),
                    source,
                })?;
            *template = String::from_utf8_lossy(&bytes).into_owned();
            debug!(path = %path, "Loaded prompt template");
        }
        Ok(set)
    }
}
