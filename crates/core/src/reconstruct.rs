//! Rebuild timed entries from translated units.
//!
//! A unit that covers several entries has its translation cut proportionally
//! to how much source text each entry contributed, snapping to spaces when the
//! join policy says the language separates words.

use crate::model::{TimedTextUnit, TranslationResult, TranslationUnit};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{trace, warn};

/// Which lines end up in an output entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    Both,
    TranslationOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructOptions {
    pub display: DisplayMode,
    pub space: bool,
    /// In `Both` mode put the original lines above the translation.
    pub original_first: bool,
}

/// Output entries plus the indices that fell back to source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconstruction {
    pub units: Vec<TimedTextUnit>,
    pub flagged: Vec<u32>,
}

/// Produce translated entries with the same index and timing as `original`.
/// Units whose result is missing or failed contribute their source text and
/// flag every entry they touch.
pub fn reconstruct(
    original: &[TimedTextUnit],
    results: &HashMap<String, TranslationResult>,
    segments: &[TranslationUnit],
    opts: &ReconstructOptions,
) -> Reconstruction {
    trace!("reconstruct entries={} units={}", original.len(), segments.len());
    let mut fragments: HashMap<u32, Vec<String>> = HashMap::new();
    let mut flagged = BTreeSet::new();
    for tu in segments {
        match results.get(&tu.id) {
            Some(r) if r.is_success() => {
                for (index, text) in distribute(tu, &r.translated_text, opts.space) {
                    fragments.entry(index).or_default().push(text);
                }
            }
            other => {
                let reason = other
                    .map(|r| format!("{:?}", r.status))
                    .unwrap_or_else(|| "no result".to_string());
                warn!("{} keeps source text: {}", tu.id, reason);
                for span in &tu.spans {
                    if !span.is_empty() {
                        flagged.insert(span.unit_index);
                    }
                    fragments
                        .entry(span.unit_index)
                        .or_default()
                        .push(tu.span_text(span).trim().to_string());
                }
            }
        }
    }

    let glue = if opts.space { " " } else { "" };
    let units = original
        .iter()
        .map(|unit| {
            let translated = fragments
                .remove(&unit.index)
                .unwrap_or_default()
                .into_iter()
                .filter(|f| !f.is_empty())
                .collect::<Vec<_>>()
                .join(glue);
            let translated: Vec<String> = if translated.is_empty() {
                Vec::new()
            } else {
                translated.split('\n').map(str::to_string).collect()
            };
            let text = match opts.display {
                DisplayMode::TranslationOnly => translated,
                DisplayMode::Both if opts.original_first => {
                    unit.text.iter().cloned().chain(translated).collect()
                }
                DisplayMode::Both => translated.into_iter().chain(unit.text.iter().cloned()).collect(),
            };
            TimedTextUnit {
                index: unit.index,
                start_ms: unit.start_ms,
                end_ms: unit.end_ms,
                text,
            }
        })
        .collect();
    Reconstruction {
        units,
        flagged: flagged.into_iter().collect(),
    }
}

/// Cut `translated` into one trimmed fragment per span of `tu`.
fn distribute(tu: &TranslationUnit, translated: &str, space: bool) -> Vec<(u32, String)> {
    let chars: Vec<char> = translated.chars().collect();
    let weighted: Vec<usize> = tu
        .spans
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_empty())
        .map(|(n, _)| n)
        .collect();
    let total = tu.source_text.chars().count().max(1);
    let mut cuts: HashMap<usize, (usize, usize)> = HashMap::new();
    let mut last = 0;
    for (k, &n) in weighted.iter().enumerate() {
        let end = if k + 1 == weighted.len() {
            chars.len()
        } else {
            let consumed = tu.source_text[..tu.spans[n].range.end].chars().count();
            let at = chars.len() * consumed / total;
            // Leave at least one char for this span and each one after it.
            let remaining = weighted.len() - k - 1;
            let (lo, hi) = (last + 1, chars.len().saturating_sub(remaining));
            if lo > hi {
                at.clamp(last, chars.len())
            } else {
                let at = at.clamp(lo, hi);
                let snapped = if space { nearest_space(&chars, at) } else { at };
                let keeps_text = |cut: usize| chars[last..cut].iter().any(|c| !c.is_whitespace());
                if (lo..=hi).contains(&snapped) && keeps_text(snapped) {
                    snapped
                } else {
                    at
                }
            }
        };
        cuts.insert(n, (last, end));
        last = end;
    }
    tu.spans
        .iter()
        .enumerate()
        .map(|(n, span)| {
            let text = cuts
                .get(&n)
                .map(|&(a, b)| chars[a..b].iter().collect::<String>().trim().to_string())
                .unwrap_or_default();
            (span.unit_index, text)
        })
        .collect()
}

/// Position just after the whitespace closest to `at`.
fn nearest_space(chars: &[char], at: usize) -> usize {
    let at = at.min(chars.len());
    let left = chars[..at].iter().rposition(|c| c.is_whitespace());
    let right = chars[at..].iter().position(|c| c.is_whitespace());
    match (left, right) {
        (None, None) => at,
        (None, Some(r)) => at + r + 1,
        (Some(l), None) => l + 1,
        (Some(l), Some(r)) if at - l > r => at + r + 1,
        (Some(l), Some(_)) => l + 1,
    }
}
