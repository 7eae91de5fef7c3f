//! Word-position index over the canonical content.
//!
//! The content is tokenised on Unicode whitespace into a 0-based word
//! sequence. Every word, adjacent pair, and adjacent triplet is indexed under
//! its normalised form and its article variants, so that entity names
//! returned by the LLM (which writes spaces as underscores) resolve back to
//! the word indices where they occur.
//!
//! Lookup combines exact variant hits with an in-order approximate scan that
//! tolerates up to [`MAX_DISTANCE`] unrelated words between query tokens.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;

/// Maximum number of non-query words allowed between two consecutive query
/// tokens during approximate search.
pub const MAX_DISTANCE: usize = 5;

/// Leading-elision articles prepended when generating variants.
const ARTICLES: [&str; 4] = ["l'", "d'", "l ", "d "];

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{P}&&[^']]").expect("valid punctuation class"));

/// Normalise a term for indexing and lookup.
///
/// Lowercases, turns underscores into spaces, strips Unicode punctuation
/// except the apostrophe, collapses whitespace runs, and trims.
pub fn normalize(s: &str) -> String {
    let lowered = s.to_lowercase().replace('_', " ");
    let stripped = PUNCTUATION.replace_all(&lowered, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Raw (un-normalised) variants of a term: the term itself, its article
/// forms, and for underscore names the space-substituted copy with its
/// article forms.
pub fn variants(term: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(10);
    push_with_articles(&mut out, term);
    if term.contains('_') {
        push_with_articles(&mut out, &term.replace('_', " "));
    }
    out
}

fn push_with_articles(out: &mut Vec<String>, term: &str) {
    out.push(term.to_string());
    for article in ARTICLES {
        out.push(format!("{}{}", article, term));
    }
}

/// Normalised, deduplicated lookup keys for `term`, original form first.
fn lookup_keys(term: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    variants(term)
        .into_iter()
        .map(|v| normalize(&v))
        .filter(|k| !k.is_empty() && seen.insert(k.clone()))
        .collect()
}

/// Positional index over one version of the content.
#[derive(Debug, Default)]
pub struct PositionIndex {
    words: Vec<String>,
    normalized: Vec<String>,
    terms: HashMap<String, Vec<usize>>,
}

impl PositionIndex {
    /// Tokenise `content` and index words, pairs, and triplets.
    pub fn build(content: &str) -> Self {
        let words: Vec<String> = content.split_whitespace().map(str::to_string).collect();
        let normalized: Vec<String> = words.iter().map(|w| normalize(w)).collect();

        let mut index = Self {
            words,
            normalized,
            terms: HashMap::new(),
        };

        for i in 0..index.normalized.len() {
            for n in 1..=3 {
                if i + n > index.normalized.len() {
                    break;
                }
                let gram = index.normalized[i..i + n]
                    .iter()
                    .filter(|w| !w.is_empty())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" ");
                if gram.is_empty() {
                    continue;
                }
                index.insert_term(&gram, i);
            }
        }

        index
    }

    fn insert_term(&mut self, term: &str, position: usize) {
        for key in lookup_keys(term) {
            let entry = self.terms.entry(key).or_default();
            if entry.last() != Some(&position) {
                entry.push(position);
            }
        }
    }

    /// Raw whitespace-delimited words of the content.
    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Exact hits for one already-normalised key.
    pub fn lookup(&self, key: &str) -> &[usize] {
        self.terms.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolve an entity name to the ascending word indices where it occurs.
    pub fn find_positions(&self, name: &str) -> Vec<usize> {
        let mut found = BTreeSet::new();
        let keys = lookup_keys(name);

        for key in &keys {
            found.extend(self.lookup(key).iter().copied());
        }

        // Only the unmodified name gets the approximate scan.
        let original = normalize(name);
        if !original.is_empty() {
            found.extend(self.approximate_search(&original));
        }

        found.into_iter().collect()
    }

    /// Scan for the query tokens in order, allowing at most [`MAX_DISTANCE`]
    /// other words between consecutive matches. Returns start positions.
    fn approximate_search(&self, normalized_query: &str) -> Vec<usize> {
        let tokens: Vec<&str> = normalized_query.split(' ').collect();
        let Some(first) = tokens.first() else {
            return Vec::new();
        };

        let mut hits = Vec::new();
        for (start, word) in self.normalized.iter().enumerate() {
            if word != first {
                continue;
            }
            let mut matched = 1;
            let mut gap = 0;
            let mut cursor = start + 1;
            while matched < tokens.len() && cursor < self.normalized.len() {
                if self.normalized[cursor] == tokens[matched] {
                    matched += 1;
                    gap = 0;
                } else {
                    gap += 1;
                    if gap > MAX_DISTANCE {
                        break;
                    }
                }
                cursor += 1;
            }
            if matched == tokens.len() {
                hits.push(start);
            }
        }
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation_but_keeps_apostrophe() {
        assert_eq!(normalize("  Test. "), "test");
        assert_eq!(normalize("L'Homme,"), "l'homme");
        assert_eq!(normalize("Jean_Dupont"), "jean dupont");
        assert_eq!(normalize("«Bonjour»  le\tmonde!"), "bonjour le monde");
        assert_eq!(normalize("state-of-the-art"), "stateoftheart");
    }

    #[test]
    fn normalize_is_idempotent() {
        for s in [
            "Hello, World!",
            "l'école_Normale  Supérieure",
            "  __a__b__ ",
            "¿Qué? ¡Sí!",
            "İstanbul's “quotes”",
            "",
        ] {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "input {:?}", s);
        }
    }

    #[test]
    fn variants_cover_articles_and_underscores() {
        let v = variants("Jean_Dupont");
        assert!(v.contains(&"Jean_Dupont".to_string()));
        assert!(v.contains(&"l'Jean_Dupont".to_string()));
        assert!(v.contains(&"Jean Dupont".to_string()));
        assert!(v.contains(&"d Jean Dupont".to_string()));
        assert_eq!(v.len(), 10);
        assert_eq!(variants("fox").len(), 5);
    }

    #[test]
    fn finds_single_word_occurrences() {
        let index = PositionIndex::build("This is a test. This is another test.");
        assert_eq!(index.find_positions("test"), vec![3, 7]);
    }

    #[test]
    fn finds_underscore_names_via_bigrams() {
        let index = PositionIndex::build("Yesterday Jean Dupont met Marie Curie in Paris.");
        assert_eq!(index.find_positions("Jean_Dupont"), vec![1]);
        assert_eq!(index.find_positions("Marie_Curie"), vec![4]);
    }

    #[test]
    fn article_variants_match_elided_forms() {
        let index = PositionIndex::build("Il regarde l'horizon depuis d'Artagnan.");
        assert_eq!(index.find_positions("horizon"), vec![2]);
        assert_eq!(index.find_positions("Artagnan"), vec![4]);
    }

    #[test]
    fn approximate_search_tolerates_gaps() {
        let index = PositionIndex::build("the Bank of the very old and famous England closed");
        // "bank" ... "england" with 5 words in between ("of the very old and famous" is 6)
        assert!(index.find_positions("Bank_England").is_empty());
        let index = PositionIndex::build("the Bank of the very old England closed");
        assert_eq!(index.find_positions("Bank_England"), vec![1]);
    }

    #[test]
    fn missing_name_yields_nothing() {
        let index = PositionIndex::build("nothing to see here");
        assert!(index.find_positions("unicorn").is_empty());
        assert!(index.find_positions("...").is_empty());
    }

    #[test]
    fn every_word_finds_its_own_position() {
        let content = "Le chat de Marie dort. Le chien, lui, aboie! Marie rit; le chat fuit.";
        let index = PositionIndex::build(content);
        for (p, w) in content.split_whitespace().enumerate() {
            if normalize(w).is_empty() {
                continue;
            }
            assert!(
                index.find_positions(w).contains(&p),
                "word {:?} at {} not found",
                w,
                p
            );
        }
    }
}
