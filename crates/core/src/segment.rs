//! Sentence segmentation of subtitle entries into translation units.
//!
//! In split mode consecutive entries are joined into a rolling buffer which is
//! cut at sentence terminators or before it would exceed the backend request
//! size. Every byte appended to the buffer is recorded in an [`OffsetSpan`], so
//! the reconstructor never has to re-scan text to find where an entry went.

use crate::error::SegmentationError;
use crate::model::{OffsetSpan, TimedTextUnit, TranslationUnit};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use tracing::{debug, trace};

/// How entries are grouped into translation units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentMode {
    /// One translation unit per entry.
    Naive,
    /// Sentence-aligned units spanning as many entries as a sentence needs.
    Split,
}

/// Grouping mode plus the limits segmentation works within.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOptions {
    pub mode: SegmentMode,
    /// Join entries with a space (word-separated languages) or directly.
    pub space: bool,
    /// Maximum characters in one unit's source text.
    pub max_chars: usize,
}

/// Split `units` into translation units according to `opts`.
pub fn segment(units: &[TimedTextUnit], opts: &SegmentOptions) -> Vec<TranslationUnit> {
    trace!("segment units={} mode={:?}", units.len(), opts.mode);
    let mut buf = Buffer::new(opts.max_chars.max(1));
    for unit in units {
        let text = unit.joined_text();
        let pieces = match opts.mode {
            SegmentMode::Naive => vec![Piece {
                range: 0..text.len(),
                ends_sentence: false,
            }],
            SegmentMode::Split => sentence_pieces(&text),
        };
        for (n, piece) in pieces.into_iter().enumerate() {
            let part = &text[piece.range.clone()];
            let joins = n == 0 && opts.space && !buf.text.is_empty() && !part.is_empty();
            buf.append(unit.index, part, piece.range.start, joins);
            if piece.ends_sentence {
                buf.flush();
            }
        }
        if opts.mode == SegmentMode::Naive {
            buf.flush();
        }
    }
    buf.flush();
    debug!("segmented {} entries into {} units", units.len(), buf.out.len());
    buf.out
}

/// Check that the offset map reproduces every entry's text byte for byte.
pub fn verify(
    units: &[TimedTextUnit],
    segments: &[TranslationUnit],
) -> Result<(), SegmentationError> {
    let mut rebuilt: HashMap<u32, String> = HashMap::new();
    for tu in segments {
        for span in &tu.spans {
            let piece = tu.source_text.get(span.range.clone()).ok_or_else(|| SegmentationError {
                index: span.unit_index,
                message: format!("span {:?} outside unit {}", span.range, tu.id),
            })?;
            let acc = rebuilt.entry(span.unit_index).or_default();
            if acc.len() != span.local_offset {
                return Err(SegmentationError {
                    index: span.unit_index,
                    message: format!(
                        "span in {} starts at {} but {} bytes precede it",
                        tu.id,
                        span.local_offset,
                        acc.len()
                    ),
                });
            }
            acc.push_str(piece);
        }
    }
    for unit in units {
        match rebuilt.get(&unit.index) {
            Some(text) if *text == unit.joined_text() => {}
            Some(_) => {
                return Err(SegmentationError {
                    index: unit.index,
                    message: "mapped text differs from the entry".into(),
                })
            }
            None => {
                return Err(SegmentationError {
                    index: unit.index,
                    message: "entry is not referenced by any unit".into(),
                })
            }
        }
    }
    Ok(())
}

/// Rebuild one entry's source text from the offset maps.
pub fn source_text_of(segments: &[TranslationUnit], index: u32) -> String {
    segments
        .iter()
        .flat_map(|tu| {
            tu.spans
                .iter()
                .filter(move |s| s.unit_index == index)
                .map(move |s| tu.span_text(s))
        })
        .collect()
}

/// Rolling buffer that turns appended text into translation units.
struct Buffer {
    max_chars: usize,
    text: String,
    chars: usize,
    spans: Vec<OffsetSpan>,
    out: Vec<TranslationUnit>,
}

impl Buffer {
    fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            text: String::new(),
            chars: 0,
            spans: Vec::new(),
            out: Vec::new(),
        }
    }

    /// Append `part` of entry `index`, flushing first when it would not fit.
    /// A part longer than the limit on its own is cut at whitespace; all but
    /// its last piece become units immediately.
    fn append(&mut self, index: u32, part: &str, local_offset: usize, joins: bool) {
        let part_chars = part.chars().count();
        let mut joins = joins;
        if !self.text.is_empty() && self.chars + part_chars + usize::from(joins) > self.max_chars {
            self.flush();
            joins = false;
        }
        if part_chars <= self.max_chars {
            self.push(index, part, local_offset, joins);
            return;
        }
        let cuts = split_at_whitespace(part, self.max_chars);
        let last = cuts.len() - 1;
        for (n, range) in cuts.into_iter().enumerate() {
            self.push(index, &part[range.clone()], local_offset + range.start, false);
            if n < last {
                self.flush();
            }
        }
    }

    fn push(&mut self, index: u32, part: &str, local_offset: usize, joins: bool) {
        if joins {
            self.text.push(' ');
            self.chars += 1;
        }
        let start = self.text.len();
        self.text.push_str(part);
        self.chars += part.chars().count();
        self.spans.push(OffsetSpan {
            unit_index: index,
            range: start..self.text.len(),
            local_offset,
        });
    }

    fn flush(&mut self) {
        if self.spans.is_empty() {
            return;
        }
        let id = format!("tu-{:05}", self.out.len() + 1);
        self.out.push(TranslationUnit {
            id,
            source_text: std::mem::take(&mut self.text),
            spans: std::mem::take(&mut self.spans),
        });
        self.chars = 0;
    }
}

/// A byte range of an entry's text, possibly closing a sentence.
#[derive(Debug, PartialEq, Eq)]
struct Piece {
    range: Range<usize>,
    ends_sentence: bool,
}

/// Cut `text` after each sentence terminator. Whitespace following a
/// terminator stays with the sentence it ends. Empty text yields one empty
/// piece so the entry still gets a span.
fn sentence_pieces(text: &str) -> Vec<Piece> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < chars.len() {
        let (pos, c) = chars[i];
        if !is_terminator(c) {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < chars.len() && (is_terminator(chars[j].1) || is_closer(chars[j].1)) {
            j += 1;
        }
        let wide = chars[i..j].iter().any(|&(_, c)| is_wide_terminator(c));
        let at_end = j == chars.len();
        let spaced = !at_end && chars[j].1.is_whitespace();
        let lone_dot = c == '.' && j == i + 1;
        let boundary = wide
            || ((at_end || spaced) && !(lone_dot && is_abbreviation(&text[start..pos])));
        if boundary {
            while j < chars.len() && chars[j].1.is_whitespace() {
                j += 1;
            }
            let end = chars.get(j).map(|&(p, _)| p).unwrap_or(text.len());
            pieces.push(Piece {
                range: start..end,
                ends_sentence: true,
            });
            start = end;
        }
        i = j;
    }
    if start < text.len() || pieces.is_empty() {
        pieces.push(Piece {
            range: start..text.len(),
            ends_sentence: false,
        });
    }
    pieces
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '?' | '!') || is_wide_terminator(c)
}

fn is_wide_terminator(c: char) -> bool {
    matches!(c, '。' | '？' | '！' | '…')
}

fn is_closer(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '”' | '’' | '」' | '』')
}

/// Words whose trailing dot does not end a sentence: single letters (`A.`),
/// title-like pairs (`Mr.`, `Dr.`) and dotted abbreviations (`e.g.`).
fn is_abbreviation(before: &str) -> bool {
    let word = before.rsplit(char::is_whitespace).next().unwrap_or("");
    let letters: Vec<char> = word.chars().collect();
    match letters.as_slice() {
        [a] => a.is_alphabetic(),
        [a, b] => a.is_ascii_uppercase() && b.is_ascii_lowercase(),
        _ => {
            word.contains('.')
                && word
                    .split('.')
                    .all(|p| p.chars().count() == 1 && p.chars().all(char::is_alphanumeric))
        }
    }
}

/// Cut `text` into ranges of at most `max_chars` characters, preferring to
/// end each range just after whitespace.
fn split_at_whitespace(text: &str, max_chars: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while text[start..].chars().count() > max_chars {
        let rest = &text[start..];
        let limit = rest
            .char_indices()
            .nth(max_chars)
            .map(|(p, _)| p)
            .unwrap_or(rest.len());
        let cut = rest[..limit]
            .char_indices()
            .filter(|&(_, c)| c.is_whitespace())
            .map(|(p, c)| p + c.len_utf8())
            .last()
            .filter(|&p| p > 0)
            .unwrap_or(limit);
        ranges.push(start..start + cut);
        start += cut;
    }
    ranges.push(start..text.len());
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(index: u32, text: &str) -> TimedTextUnit {
        TimedTextUnit {
            index,
            start_ms: u64::from(index) * 1000,
            end_ms: u64::from(index) * 1000 + 900,
            text: if text.is_empty() {
                Vec::new()
            } else {
                text.split('\n').map(str::to_string).collect()
            },
        }
    }

    fn split(space: bool, max_chars: usize) -> SegmentOptions {
        SegmentOptions {
            mode: SegmentMode::Split,
            space,
            max_chars,
        }
    }

    fn texts(tus: &[TranslationUnit]) -> Vec<&str> {
        tus.iter().map(|t| t.source_text.as_str()).collect()
    }

    #[test]
    fn joins_entries_into_one_sentence() {
        let units = vec![unit(1, "Coding has been"), unit(2, "the bread and butter.")];
        let tus = segment(&units, &split(true, 3500));
        assert_eq!(texts(&tus), vec!["Coding has been the bread and butter."]);
        assert_eq!(tus[0].source_unit_indices(), vec![1, 2]);
        assert_eq!(tus[0].locate(15), None);
        assert_eq!(tus[0].locate(16), Some((2, 0)));
    }

    #[test]
    fn joins_without_space_when_policy_says_so() {
        let units = vec![unit(1, "今天"), unit(2, "很好。")];
        let tus = segment(&units, &split(false, 3500));
        assert_eq!(texts(&tus), vec!["今天很好。"]);
    }

    #[test]
    fn naive_mode_keeps_one_unit_per_entry() {
        let units = vec![unit(1, "Hello. Bye."), unit(2, ""), unit(3, "two\nlines")];
        let opts = SegmentOptions {
            mode: SegmentMode::Naive,
            space: true,
            max_chars: 3500,
        };
        let tus = segment(&units, &opts);
        assert_eq!(texts(&tus), vec!["Hello. Bye.", "", "two\nlines"]);
        for (tu, u) in tus.iter().zip(&units) {
            assert_eq!(tu.source_unit_indices(), vec![u.index]);
        }
    }

    #[test]
    fn cuts_inside_an_entry_and_keeps_trailing_fragment() {
        let units = vec![unit(1, "Yes. How are"), unit(2, "you? I am"), unit(3, "fine")];
        let tus = segment(&units, &split(true, 3500));
        assert_eq!(texts(&tus), vec!["Yes. ", "How are you? ", "I am fine"]);
        assert_eq!(tus[1].source_unit_indices(), vec![1, 2]);
    }

    #[test]
    fn abbreviations_and_decimals_do_not_end_sentences() {
        let units = vec![unit(1, "Mr. Smith paid 3.5 dollars, e.g. a lot."), unit(2, "Next.")];
        let tus = segment(&units, &split(true, 3500));
        assert_eq!(
            texts(&tus),
            vec!["Mr. Smith paid 3.5 dollars, e.g. a lot.", "Next."]
        );
    }

    #[test]
    fn closing_quotes_and_ellipsis_stay_with_the_sentence() {
        let units = vec![unit(1, "He said \"stop.\" Then... nothing")];
        let tus = segment(&units, &split(true, 3500));
        assert_eq!(texts(&tus), vec!["He said \"stop.\" ", "Then... ", "nothing"]);
    }

    #[test]
    fn wide_terminators_split_without_whitespace() {
        let units = vec![unit(1, "你好。我很好！谢谢")];
        let tus = segment(&units, &split(false, 3500));
        assert_eq!(texts(&tus), vec!["你好。", "我很好！", "谢谢"]);
    }

    #[test]
    fn empty_entry_is_mapped_into_the_containing_unit() {
        let units = vec![unit(1, "Wait"), unit(2, ""), unit(3, "for me.")];
        let tus = segment(&units, &split(true, 3500));
        assert_eq!(texts(&tus), vec!["Wait for me."]);
        assert_eq!(tus[0].source_unit_indices(), vec![1, 2, 3]);
        let empty = &tus[0].spans[1];
        assert!(empty.is_empty());
        assert_eq!(empty.range.start, 4);
    }

    #[test]
    fn trailing_empty_entry_gets_its_own_unit() {
        let units = vec![unit(1, "Done."), unit(2, "")];
        let tus = segment(&units, &split(true, 3500));
        assert_eq!(texts(&tus), vec!["Done.", ""]);
        assert_eq!(tus[1].source_unit_indices(), vec![2]);
        assert!(tus[1].is_blank());
    }

    #[test]
    fn oversize_entry_is_cut_at_whitespace() {
        let units = vec![unit(1, "aaa bbb ccc ddd")];
        let tus = segment(&units, &split(true, 8));
        assert_eq!(texts(&tus), vec!["aaa bbb ", "ccc ddd"]);
        assert!(tus.iter().all(|t| t.source_unit_indices() == vec![1]));
        assert_eq!(tus[1].spans[0].local_offset, 8);
    }

    #[test]
    fn oversize_word_is_cut_hard() {
        let units = vec![unit(1, "abcdefghij")];
        let tus = segment(&units, &split(false, 4));
        assert_eq!(texts(&tus), vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn buffer_flushes_before_it_would_overflow() {
        let units = vec![unit(1, "one two"), unit(2, "three")];
        let tus = segment(&units, &split(true, 12));
        assert_eq!(texts(&tus), vec!["one two", "three"]);
    }

    #[test]
    fn sentence_exactly_at_limit_keeps_its_terminator() {
        let units = vec![unit(1, "Hello you."), unit(2, "Fine.")];
        let tus = segment(&units, &split(true, 10));
        assert_eq!(texts(&tus), vec!["Hello you.", "Fine."]);

        let units = vec![unit(1, "Hi"), unit(2, "Hello you.")];
        let tus = segment(&units, &split(true, 10));
        assert_eq!(texts(&tus), vec!["Hi", "Hello you."]);
    }

    #[test]
    fn segmentation_is_lossless_for_mixed_input() {
        let units = vec![
            unit(1, "  Leading space. And more"),
            unit(2, ""),
            unit(3, "multi\nline entry! Yes?"),
            unit(4, "über naïve café… 終わり。次"),
            unit(5, "a very long entry that goes on and on without stopping"),
            unit(6, "Dr. No"),
            unit(7, ""),
        ];
        for mode in [SegmentMode::Naive, SegmentMode::Split] {
            for space in [true, false] {
                for max_chars in [1, 5, 16, 3500] {
                    let opts = SegmentOptions {
                        mode,
                        space,
                        max_chars,
                    };
                    let tus = segment(&units, &opts);
                    verify(&units, &tus).unwrap();
                    for u in &units {
                        assert_eq!(source_text_of(&tus, u.index), u.joined_text());
                    }
                    for tu in &tus {
                        assert!(tu.source_text.chars().count() <= max_chars.max(1));
                    }
                }
            }
        }
    }

    #[test]
    fn verify_rejects_a_broken_map() {
        let units = vec![unit(1, "Hello")];
        let mut tus = segment(&units, &split(true, 3500));
        tus[0].spans[0].range = 0..3;
        assert!(verify(&units, &tus).is_err());
        tus[0].spans.clear();
        let err = verify(&units, &tus).unwrap_err();
        assert_eq!(err.index, 1);
    }
}
