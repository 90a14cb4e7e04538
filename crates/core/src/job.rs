//! Translation of a single subtitle file, resumable at chunk granularity.

use crate::checkpoint::CheckpointStore;
use crate::config::TranslateConfig;
use crate::error::{FileError, RetryError};
use crate::model::{TranslationResult, TranslationUnit};
use crate::reconstruct::reconstruct;
use crate::segment::{segment, verify};
use crate::srt;
use crate::translate::retry::RetryingTranslator;
use crate::translate::Translator;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// One input file and where its translation goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileJob {
    /// Stable key for checkpoints and batch state.
    pub file_id: String,
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Result of a file that reached its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutcome {
    pub output: PathBuf,
    pub total_units: usize,
    pub failed_units: usize,
    /// Entries that kept source text because a unit failed.
    pub flagged: Vec<u32>,
}

/// Segment, translate, checkpoint and reconstruct one file at a time.
pub struct FilePipeline<T> {
    translator: Arc<RetryingTranslator<T>>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: Arc<TranslateConfig>,
}

impl<T> Clone for FilePipeline<T> {
    fn clone(&self) -> Self {
        Self {
            translator: self.translator.clone(),
            checkpoints: self.checkpoints.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: Translator> FilePipeline<T> {
    pub fn new(
        translator: Arc<RetryingTranslator<T>>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: Arc<TranslateConfig>,
    ) -> Self {
        Self {
            translator,
            checkpoints,
            config,
        }
    }

    pub fn config(&self) -> &TranslateConfig {
        &self.config
    }

    /// Translate `job`, stopping at the next suspension point once `stop`
    /// fires. Every chunk is checkpointed before the next one is requested.
    pub async fn run(
        &self,
        job: &FileJob,
        stop: &CancellationToken,
    ) -> Result<FileOutcome, FileError> {
        let cfg = &*self.config;
        info!("processing {}", job.input.display());
        let original = srt::read_file(&job.input)?;
        let segments = segment(&original, &cfg.segment_options());
        verify(&original, &segments)?;

        let fp = fingerprint(cfg, &segments);
        if !cfg.resume {
            self.checkpoints.remove(&job.file_id)?;
        }
        let record = self.checkpoints.begin(&job.file_id, &fp, segments.len())?;
        let mut completed = record.completed;
        let mut results: HashMap<String, TranslationResult> =
            record.results_by_id.into_iter().collect();
        if !completed.is_empty() {
            info!(
                "{}: resuming with {}/{} units already translated",
                job.file_id,
                completed.len(),
                segments.len()
            );
        }

        let (blank, pending): (Vec<_>, Vec<_>) = segments
            .iter()
            .filter(|u| !completed.contains(&u.id))
            .cloned()
            .partition(TranslationUnit::is_blank);
        if !blank.is_empty() {
            let local: Vec<_> = blank
                .iter()
                .map(|u| TranslationResult::success(&u.id, ""))
                .collect();
            self.checkpoints.record_chunk(&job.file_id, &local)?;
            absorb(&mut completed, &mut results, local);
        }

        let chunks = chunk_units(pending, cfg.max_request_chars, cfg.max_units_per_request);
        let total = segments.len();
        let delay = Duration::from_millis(cfg.chunk_delay_ms);
        let mut last_ms = None;
        for (n, chunk) in chunks.iter().enumerate() {
            if n > 0 && !delay.is_zero() {
                tokio::select! {
                    _ = stop.cancelled() => return Err(RetryError::Cancelled.into()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let started = Instant::now();
            let translated = self
                .translator
                .translate_until(chunk, &cfg.src_lang, &cfg.target_lang, &completed, stop)
                .await?;
            self.checkpoints.record_chunk(&job.file_id, &translated)?;
            absorb(&mut completed, &mut results, translated);

            let elapsed = started.elapsed().as_millis();
            info!(
                "{}: chunk {}/{} done in {} ms, completed {}%",
                job.file_id,
                n + 1,
                chunks.len(),
                elapsed,
                completed.len() * 100 / total.max(1)
            );
            if let Some(prev) = last_ms {
                let remaining = chunks.len() - n - 1;
                if remaining > 0 {
                    let estimate = estimate_remaining(prev, elapsed, remaining, delay);
                    info!("ETA: {}", format_eta(estimate));
                }
            }
            last_ms = Some(elapsed);
        }

        let failed_units = segments
            .iter()
            .filter(|u| !results.get(&u.id).is_some_and(|r| r.is_success()))
            .count();
        if failed_units > 0 && cfg.abort_on_failure {
            return Err(FileError::UnitsFailed {
                failed: failed_units,
                total,
            });
        }

        let rebuilt = reconstruct(&original, &results, &segments, &cfg.reconstruct_options());
        if !rebuilt.flagged.is_empty() {
            warn!(
                "{}: entries {:?} kept their original text",
                job.file_id, rebuilt.flagged
            );
        }
        srt::write_file(&job.output, &rebuilt.units)?;
        info!("wrote {}", job.output.display());
        if cfg.discard_checkpoints && failed_units == 0 {
            self.checkpoints.remove(&job.file_id)?;
        }
        Ok(FileOutcome {
            output: job.output.clone(),
            total_units: total,
            failed_units,
            flagged: rebuilt.flagged,
        })
    }
}

fn absorb(
    completed: &mut BTreeSet<String>,
    results: &mut HashMap<String, TranslationResult>,
    batch: Vec<TranslationResult>,
) {
    for r in batch {
        if r.is_success() {
            completed.insert(r.id.clone());
        }
        results.insert(r.id.clone(), r);
    }
}

/// Identify a segmentation so checkpoints are only applied to the input and
/// settings that produced them.
pub fn fingerprint(cfg: &TranslateConfig, segments: &[TranslationUnit]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{:?}|{}|{}|{}|{}",
            cfg.mode, cfg.space, cfg.max_request_chars, cfg.src_lang, cfg.target_lang
        )
        .as_bytes(),
    );
    for tu in segments {
        hasher.update(tu.id.as_bytes());
        hasher.update([0]);
        hasher.update(tu.source_text.as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

/// Group units into requests bounded by total characters and unit count.
fn chunk_units(
    units: Vec<TranslationUnit>,
    max_chars: usize,
    max_units: usize,
) -> Vec<Vec<TranslationUnit>> {
    trace!("chunk_units units={} max_chars={max_chars} max_units={max_units}", units.len());
    let mut chunks = Vec::new();
    let mut current: Vec<TranslationUnit> = Vec::new();
    let mut chars = 0;
    for unit in units {
        let n = unit.source_text.chars().count();
        if !current.is_empty() && (current.len() >= max_units || chars + n > max_chars) {
            chunks.push(std::mem::take(&mut current));
            chars = 0;
        }
        chars += n;
        current.push(unit);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    debug!("split pending units into {} requests", chunks.len());
    chunks
}

/// Estimate remaining milliseconds from the last two chunk durations.
fn estimate_remaining(prev_ms: u128, curr_ms: u128, remaining: usize, pause: Duration) -> u128 {
    trace!(
        "estimate_remaining prev_ms={} curr_ms={} remaining={}",
        prev_ms,
        curr_ms,
        remaining
    );
    let avg = (prev_ms + curr_ms) / 2;
    (avg + pause.as_millis()) * remaining as u128
}

/// Format a duration in milliseconds as "X minute Y seconds".
fn format_eta(ms: u128) -> String {
    let total_secs = ms / 1000;
    let minutes = total_secs / 60;
    let seconds = total_secs % 60;
    if minutes > 0 {
        format!(
            "{} minute{} {} second{}",
            minutes,
            if minutes == 1 { "" } else { "s" },
            seconds,
            if seconds == 1 { "" } else { "s" }
        )
    } else {
        format!("{} second{}", seconds, if seconds == 1 { "" } else { "s" })
    }
}
