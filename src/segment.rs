//! Token-aware segmenter.
//!
//! Splits canonical content into [`Segment`]s whose `cl100k_base` token count
//! never exceeds `max_tokens`. Sentence boundaries (`.`, `!`, `?` followed by
//! whitespace) are preferred; an over-long sentence falls back to word
//! boundaries and an over-long word to character boundaries.
//!
//! Segments are contiguous byte ranges of the input: every unit carries its
//! trailing whitespace, so concatenating the segments reproduces the text.

use std::ops::Range;

use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::error::PipelineError;
use crate::models::Segment;

/// Granularity of the units packed into a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Sentence,
    Word,
    Char,
}

impl Level {
    fn finer(self) -> Option<Level> {
        match self {
            Level::Sentence => Some(Level::Word),
            Level::Word => Some(Level::Char),
            Level::Char => None,
        }
    }
}

pub struct Segmenter {
    bpe: CoreBPE,
}

impl Segmenter {
    pub fn new() -> Result<Self, PipelineError> {
        let bpe = cl100k_base().map_err(|e| PipelineError::Tokenization(e.to_string()))?;
        Ok(Self { bpe })
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Split `content` into token-bounded segments.
    ///
    /// Invalid UTF-8 is decoded lossily. Whitespace-only input is rejected
    /// with [`PipelineError::InvalidContent`]. A `max_tokens` of zero is
    /// treated as one.
    pub fn segment(&self, content: &[u8], max_tokens: usize) -> Result<Vec<Segment>, PipelineError> {
        let text = String::from_utf8_lossy(content);
        if text.trim().is_empty() {
            return Err(PipelineError::InvalidContent);
        }

        let max_tokens = max_tokens.max(1);
        let units = sentence_units(&text);
        let mut segments = Vec::new();
        self.pack(&text, &units, max_tokens, Level::Sentence, &mut segments);

        tracing::debug!(
            segments = segments.len(),
            bytes = text.len(),
            max_tokens,
            "Segmented content"
        );
        Ok(segments)
    }

    /// Greedily accumulate `units` while the candidate slice stays within
    /// `max_tokens`, descending to a finer level for units that never fit.
    fn pack(
        &self,
        text: &str,
        units: &[Range<usize>],
        max_tokens: usize,
        level: Level,
        out: &mut Vec<Segment>,
    ) {
        let mut current: Option<Range<usize>> = None;

        for unit in units {
            let start = current.as_ref().map_or(unit.start, |c| c.start);
            if self.count_tokens(&text[start..unit.end]) <= max_tokens {
                current = Some(start..unit.end);
                continue;
            }

            if let Some(done) = current.take() {
                push_segment(text, done, out);
            }

            if self.count_tokens(&text[unit.clone()]) <= max_tokens {
                current = Some(unit.clone());
                continue;
            }

            match level.finer() {
                Some(Level::Word) => {
                    let sub = word_units(text, unit.clone());
                    self.pack(text, &sub, max_tokens, Level::Word, out);
                }
                Some(Level::Char) => {
                    let sub = char_units(text, unit.clone());
                    self.pack(text, &sub, max_tokens, Level::Char, out);
                }
                // A single character that encodes to more than max_tokens.
                _ => push_segment(text, unit.clone(), out),
            }
        }

        if let Some(done) = current {
            push_segment(text, done, out);
        }
    }

    /// Look-behind context for segment `index`: preceding segments walking
    /// backwards, stopping before the cumulative token count would exceed
    /// `context_size`. Returned in document order.
    pub fn get_context(&self, segments: &[Segment], index: usize, context_size: usize) -> String {
        let mut parts: Vec<&str> = Vec::new();
        let mut used = 0;

        for segment in segments[..index.min(segments.len())].iter().rev() {
            let tokens = self.count_tokens(&segment.content);
            if used + tokens > context_size {
                break;
            }
            used += tokens;
            parts.push(&segment.content);
        }

        parts.reverse();
        parts.concat()
    }
}

fn push_segment(text: &str, range: Range<usize>, out: &mut Vec<Segment>) {
    let content = &text[range.clone()];
    if content.trim().is_empty() {
        return;
    }
    out.push(Segment {
        start: range.start,
        end: range.end,
        content: content.to_string(),
    });
}

/// Sentences end after `.`, `!` or `?` followed by whitespace or end of
/// text; the trailing whitespace run belongs to the sentence.
fn sentence_units(text: &str) -> Vec<Range<usize>> {
    let mut units = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        if !matches!(ch, '.' | '!' | '?') {
            continue;
        }
        let at_boundary = chars.peek().map_or(true, |&(_, c)| c.is_whitespace());
        if !at_boundary {
            continue;
        }
        let mut end = idx + ch.len_utf8();
        while let Some(&(j, c)) = chars.peek() {
            if !c.is_whitespace() {
                break;
            }
            end = j + c.len_utf8();
            chars.next();
        }
        units.push(start..end);
        start = end;
    }

    if start < text.len() {
        units.push(start..text.len());
    }
    units
}

/// Words of `range`, each with its trailing whitespace. Leading whitespace
/// stays with the first word.
fn word_units(text: &str, range: Range<usize>) -> Vec<Range<usize>> {
    let mut units = Vec::new();
    let mut unit_start = range.start;
    let mut seen_word = false;
    let mut prev_ws = false;

    for (i, c) in text[range.clone()].char_indices() {
        let abs = range.start + i;
        if c.is_whitespace() {
            prev_ws = true;
            continue;
        }
        if seen_word && prev_ws {
            units.push(unit_start..abs);
            unit_start = abs;
        }
        seen_word = true;
        prev_ws = false;
    }

    units.push(unit_start..range.end);
    units
}

fn char_units(text: &str, range: Range<usize>) -> Vec<Range<usize>> {
    text[range.clone()]
        .char_indices()
        .map(|(i, c)| {
            let abs = range.start + i;
            abs..abs + c.len_utf8()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter() -> Segmenter {
        Segmenter::new().unwrap()
    }

    #[test]
    fn empty_input_is_invalid() {
        let s = segmenter();
        assert!(matches!(s.segment(b"", 100), Err(PipelineError::InvalidContent)));
        assert!(matches!(s.segment(b"  \n\t ", 100), Err(PipelineError::InvalidContent)));
    }

    #[test]
    fn short_input_is_one_segment() {
        let s = segmenter();
        let text = "This is a test. This is another test.";
        let segments = s.segment(text.as_bytes(), 2000).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, 0);
        assert_eq!(segments[0].end, text.len());
        assert_eq!(segments[0].content, text);
    }

    #[test]
    fn prefers_sentence_boundaries() {
        let s = segmenter();
        let segments = s.segment(b"One two. Three four.", 5).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].content, "One two. ");
        assert_eq!(segments[1].content, "Three four.");
        assert_eq!(segments[1].start, segments[0].end);
    }

    #[test]
    fn every_segment_respects_token_bound() {
        let s = segmenter();
        let mut text = String::new();
        for i in 0..60 {
            text.push_str(&format!(
                "Sentence number {} talks about ontologies and entities. ",
                i
            ));
        }
        text.push_str("averyveryverylongwordwithoutanybreaksthatkeepsgoingandgoing ");
        text.push_str("and a trailing clause without a terminator");

        for max in [3, 8, 20, 64] {
            let segments = s.segment(text.as_bytes(), max).unwrap();
            assert!(segments.len() > 1);
            for seg in &segments {
                let tokens = s.count_tokens(&seg.content);
                assert!(
                    tokens <= max || seg.content.chars().count() == 1,
                    "segment {:?} has {} tokens > {}",
                    seg.content,
                    tokens,
                    max
                );
                assert_eq!(&text[seg.start..seg.end], seg.content);
            }
        }
    }

    #[test]
    fn segments_are_contiguous() {
        let s = segmenter();
        let text = "Première phrase, avec des accents. Deuxième phrase ici! \
                    Troisième? Oui, la troisième phrase est plus longue que les autres.";
        let segments = s.segment(text.as_bytes(), 6).unwrap();
        let joined: String = segments.iter().map(|seg| seg.content.as_str()).collect();
        assert_eq!(joined, text);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn context_walks_backwards_within_budget() {
        let s = segmenter();
        let segments: Vec<Segment> = ["Alpha one. ", "Beta two. ", "Gamma three. ", "Delta."]
            .iter()
            .scan(0, |offset, c| {
                let seg = Segment {
                    start: *offset,
                    end: *offset + c.len(),
                    content: c.to_string(),
                };
                *offset += c.len();
                Some(seg)
            })
            .collect();

        assert_eq!(s.get_context(&segments, 0, 1000), "");
        assert_eq!(s.get_context(&segments, 3, 1000), "Alpha one. Beta two. Gamma three. ");
        assert_eq!(s.get_context(&segments, 3, 0), "");

        let last = s.count_tokens("Gamma three. ");
        assert_eq!(s.get_context(&segments, 3, last), "Gamma three. ");
    }

    #[test]
    fn sentence_units_keep_trailing_whitespace() {
        let text = "  Hi there.  How are you?\nFine";
        let units = sentence_units(text);
        let parts: Vec<&str> = units.iter().map(|r| &text[r.clone()]).collect();
        assert_eq!(parts, vec!["  Hi there.  ", "How are you?\n", "Fine"]);
    }

    #[test]
    fn abbreviations_without_space_do_not_split() {
        let text = "Version 1.2 is out.";
        let units = sentence_units(text);
        assert_eq!(units.len(), 1);
    }
}
