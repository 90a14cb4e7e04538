//! SRT reading and writing.
//! Timestamps are kept as milliseconds and only rendered back to SRT notation.

use crate::checkpoint::write_atomic;
use crate::error::{FileError, ParseError};
use crate::model::TimedTextUnit;
use std::fs;
use std::path::Path;
use tracing::trace;

/// Parse SRT text into entries.
/// Indices must be strictly increasing and every entry needs `start <= end`.
pub fn parse(input: &str) -> Result<Vec<TimedTextUnit>, ParseError> {
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    let mut units: Vec<TimedTextUnit> = Vec::new();
    let mut lines = input.lines().enumerate().map(|(n, l)| (n + 1, l));
    loop {
        let (line_no, index_line) = match lines.next() {
            Some((_, l)) if l.trim().is_empty() => continue,
            Some((n, l)) => (n, l.trim()),
            None => break,
        };
        let index: u32 = index_line
            .parse()
            .map_err(|_| ParseError::new(line_no, format!("bad index {index_line:?}")))?;
        if let Some(prev) = units.last() {
            if index <= prev.index {
                return Err(ParseError::new(
                    line_no,
                    format!("index {index} does not follow {}", prev.index),
                ));
            }
        }
        let (time_no, time_line) = lines
            .next()
            .ok_or_else(|| ParseError::new(line_no + 1, "missing time"))?;
        let (start_ms, end_ms) =
            parse_times(time_line.trim()).map_err(|m| ParseError::new(time_no, m))?;
        if start_ms > end_ms {
            return Err(ParseError::new(time_no, "entry ends before it starts"));
        }
        let mut text = Vec::new();
        for (_, line) in lines.by_ref() {
            if line.trim().is_empty() {
                break;
            }
            text.push(line.to_string());
        }
        units.push(TimedTextUnit {
            index,
            start_ms,
            end_ms,
            text,
        });
    }
    Ok(units)
}

/// Format entries back to SRT text.
pub fn format(units: &[TimedTextUnit]) -> String {
    let mut out = String::new();
    for unit in units {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            unit.index,
            format_time(unit.start_ms),
            format_time(unit.end_ms),
            unit.text.join("\n")
        ));
    }
    out
}

/// Read and parse an SRT file.
pub fn read_file(path: &Path) -> Result<Vec<TimedTextUnit>, FileError> {
    trace!("read_file path={}", path.display());
    let content = fs::read_to_string(path).map_err(|source| FileError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse(&content)?)
}

/// Write entries to `path`, replacing any existing file atomically.
pub fn write_file(path: &Path, units: &[TimedTextUnit]) -> Result<(), FileError> {
    trace!("write_file path={}", path.display());
    write_atomic(path, format(units).as_bytes()).map_err(|source| FileError::Write {
        path: path.display().to_string(),
        source,
    })
}

/// Parse a time range like `00:00:01,000 --> 00:00:02,000` to milliseconds.
fn parse_times(line: &str) -> Result<(u64, u64), String> {
    let mut parts = line.split("-->");
    let start = parts.next().ok_or("no start")?;
    let end = parts.next().ok_or("no end")?;
    Ok((parse_time(start.trim())?, parse_time(end.trim())?))
}

/// Parse `HH:MM:SS,mmm` (or `HH:MM:SS.mmm`) into milliseconds.
fn parse_time(t: &str) -> Result<u64, String> {
    let parts: Vec<&str> = t.split([':', ',', '.']).collect();
    if parts.len() != 4 {
        return Err(format!("bad time {t:?}"));
    }
    let mut nums = [0u64; 4];
    for (slot, part) in nums.iter_mut().zip(&parts) {
        *slot = part.parse().map_err(|_| format!("bad time {t:?}"))?;
    }
    let [h, m, s, ms] = nums;
    if m > 59 || s > 59 || ms > 999 {
        return Err(format!("time field out of range in {t:?}"));
    }
    h.checked_mul(3_600_000)
        .and_then(|v| v.checked_add(m * 60_000 + s * 1000 + ms))
        .ok_or_else(|| format!("time {t:?} is too large"))
}

/// Format milliseconds back to `HH:MM:SS,mmm`.
fn format_time(ms: u64) -> String {
    let h = ms / 3_600_000;
    let m = (ms % 3_600_000) / 60_000;
    let s = (ms % 60_000) / 1000;
    let ms = ms % 1000;
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}
