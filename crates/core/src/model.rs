//! Data types shared by the segmenter, the translation client, the checkpoint
//! store and the reconstructor.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// One subtitle entry (index, time range in milliseconds, text lines).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedTextUnit {
    pub index: u32,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: Vec<String>,
}

impl TimedTextUnit {
    /// The entry text as a single string, lines joined by `\n`.
    pub fn joined_text(&self) -> String {
        self.text.join("\n")
    }
}

/// A piece of a [`TranslationUnit`] source text attributed to one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetSpan {
    /// Index of the [`TimedTextUnit`] this text came from.
    pub unit_index: u32,
    /// Byte range inside `TranslationUnit::source_text`.
    pub range: Range<usize>,
    /// Byte offset of `range.start` inside the entry's own text.
    pub local_offset: usize,
}

impl OffsetSpan {
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// The atomic item sent to the translation backend.
///
/// `spans` is the offset map back to the source entries. Bytes of
/// `source_text` not covered by any span are join separators inserted by the
/// segmenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationUnit {
    pub id: String,
    pub source_text: String,
    pub spans: Vec<OffsetSpan>,
}

impl TranslationUnit {
    /// Entry indices this unit was derived from, in order, without repeats.
    pub fn source_unit_indices(&self) -> Vec<u32> {
        let mut out: Vec<u32> = Vec::with_capacity(self.spans.len());
        for span in &self.spans {
            if out.last() != Some(&span.unit_index) {
                out.push(span.unit_index);
            }
        }
        out
    }

    /// Map a byte position of `source_text` back to `(entry index, local offset)`.
    /// Positions that fall on a join separator return `None`.
    pub fn locate(&self, pos: usize) -> Option<(u32, usize)> {
        self.spans
            .iter()
            .find(|s| s.range.contains(&pos))
            .map(|s| (s.unit_index, s.local_offset + (pos - s.range.start)))
    }

    /// Source text covered by `span`.
    pub fn span_text(&self, span: &OffsetSpan) -> &str {
        &self.source_text[span.range.clone()]
    }

    /// Whether there is anything worth sending to the backend.
    pub fn is_blank(&self) -> bool {
        self.source_text.trim().is_empty()
    }
}

/// Terminal status of one translated unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failed { reason: String },
}

/// Backend answer for one [`TranslationUnit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationResult {
    pub id: String,
    pub translated_text: String,
    pub status: ResultStatus,
}

impl TranslationResult {
    pub fn success(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            translated_text: text.into(),
            status: ResultStatus::Success,
        }
    }

    /// A failed result never carries translated text.
    pub fn failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            translated_text: String::new(),
            status: ResultStatus::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ResultStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> TranslationUnit {
        // "ab" from entry 1, separator, "cd" from entry 2
        TranslationUnit {
            id: "t".into(),
            source_text: "ab cd".into(),
            spans: vec![
                OffsetSpan {
                    unit_index: 1,
                    range: 0..2,
                    local_offset: 3,
                },
                OffsetSpan {
                    unit_index: 2,
                    range: 3..5,
                    local_offset: 0,
                },
            ],
        }
    }

    #[test]
    fn locates_positions_through_offset_map() {
        let u = unit();
        assert_eq!(u.locate(1), Some((1, 4)));
        assert_eq!(u.locate(2), None);
        assert_eq!(u.locate(4), Some((2, 1)));
        assert_eq!(u.source_unit_indices(), vec![1, 2]);
    }

    #[test]
    fn failed_result_serializes_reason_without_text() {
        let r = TranslationResult::failed("x", "empty translation");
        assert!(!r.is_success());
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"kind\":\"failed\""));
        let back: TranslationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
