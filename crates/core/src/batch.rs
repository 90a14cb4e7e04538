//! Multi-file runs with persistent per-file status.
//!
//! Files run through a [`FilePipeline`] with bounded parallelism. Sustained
//! rate limiting pauses the whole batch and fatal backend or checkpoint
//! errors halt it; either way every file still ends up with a status and a
//! later invocation picks up from the batch state and checkpoints.

use crate::checkpoint::write_atomic;
use crate::config::TranslateConfig;
use crate::error::{CheckpointError, Disposition};
use crate::job::{FileJob, FilePipeline};
use crate::translate::Translator;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where one file stands across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    InProgress,
    Done { output: PathBuf },
    Paused { reason: String },
    Failed { reason: String },
}

/// Persisted batch progress, keyed by file id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchState {
    pub files: BTreeMap<String, FileStatus>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Shared [`BatchState`]; every transition is made and persisted under one lock.
pub struct BatchStateStore {
    path: Option<PathBuf>,
    state: tokio::sync::Mutex<BatchState>,
}

impl BatchStateStore {
    /// State that lives only as long as the run.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: tokio::sync::Mutex::new(BatchState::default()),
        }
    }

    /// Load the state file at `path`, or start empty when `resume` is off or
    /// nothing is there yet. A file that exists but cannot be read is an
    /// error.
    pub fn open(path: impl Into<PathBuf>, resume: bool) -> Result<Self, CheckpointError> {
        let path = path.into();
        let state = if resume {
            match fs::read_to_string(&path) {
                Ok(text) => match serde_json::from_str::<BatchState>(&text) {
                    Ok(state) => {
                        info!("loaded batch state with {} files", state.files.len());
                        state
                    }
                    Err(e) => {
                        warn!("ignoring unreadable batch state {}: {e}", path.display());
                        BatchState::default()
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => BatchState::default(),
                Err(source) => {
                    return Err(CheckpointError::Io {
                        file_id: path.display().to_string(),
                        source,
                    })
                }
            }
        } else {
            BatchState::default()
        };
        Ok(Self {
            path: Some(path),
            state: tokio::sync::Mutex::new(state),
        })
    }

    pub async fn status(&self, file_id: &str) -> Option<FileStatus> {
        self.state.lock().await.files.get(file_id).cloned()
    }

    pub async fn snapshot(&self) -> BatchState {
        self.state.lock().await.clone()
    }

    pub async fn set(&self, file_id: &str, status: FileStatus) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().await;
        debug!("{file_id} -> {status:?}");
        state.files.insert(file_id.to_string(), status);
        state.last_updated = Some(Utc::now());
        if let Some(path) = &self.path {
            let io_err = |source| CheckpointError::Io {
                file_id: path.display().to_string(),
                source,
            };
            let text = serde_json::to_vec_pretty(&*state).map_err(|e| io_err(e.into()))?;
            write_atomic(path, &text).map_err(io_err)?;
        }
        Ok(())
    }
}

/// Final state of one file in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub file_id: String,
    pub status: FileStatus,
    pub flagged: Vec<u32>,
    pub failed_units: usize,
    /// Done in an earlier run and not touched in this one.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub files: Vec<FileReport>,
    /// Why the run stopped early on a fatal error.
    pub halted: Option<String>,
}

impl BatchReport {
    fn count(&self, pred: impl Fn(&FileStatus) -> bool) -> usize {
        self.files.iter().filter(|f| pred(&f.status)).count()
    }

    /// 0 when every file is done, 1 when any failed, otherwise 2 when any is
    /// paused pending another run.
    pub fn exit_code(&self) -> u8 {
        if self.count(|s| matches!(s, FileStatus::Failed { .. })) > 0 {
            1
        } else if self.count(|s| !matches!(s, FileStatus::Done { .. })) > 0 {
            2
        } else {
            0
        }
    }

    pub fn log_summary(&self) {
        for f in &self.files {
            match &f.status {
                FileStatus::Done { output } if f.skipped => {
                    info!("{}: done earlier ({})", f.file_id, output.display())
                }
                FileStatus::Done { output } if f.flagged.is_empty() => {
                    info!("{}: done -> {}", f.file_id, output.display())
                }
                FileStatus::Done { output } => warn!(
                    "{}: done -> {} ({} units untranslated, entries {:?})",
                    f.file_id,
                    output.display(),
                    f.failed_units,
                    f.flagged
                ),
                FileStatus::Paused { reason } => warn!("{}: paused: {reason}", f.file_id),
                FileStatus::Failed { reason } => error!("{}: failed: {reason}", f.file_id),
                other => warn!("{}: {other:?}", f.file_id),
            }
        }
        if let Some(reason) = &self.halted {
            error!("run halted: {reason}");
        }
        info!(
            "{} files: {} done, {} paused, {} failed",
            self.files.len(),
            self.count(|s| matches!(s, FileStatus::Done { .. })),
            self.count(|s| matches!(s, FileStatus::Paused { .. })),
            self.count(|s| matches!(s, FileStatus::Failed { .. }))
        );
    }
}

/// Output file name for `input`, e.g. `ep1_en_zh-CN_both.srt`.
pub fn output_name(input: &Path, cfg: &TranslateConfig) -> String {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    format!("{stem}_{}.srt", cfg.output_suffix())
}

/// Batch state file for a language pair inside `output_dir`.
pub fn state_path(output_dir: &Path, cfg: &TranslateConfig) -> PathBuf {
    output_dir.join(format!(
        "batch_state_{}_{}.json",
        cfg.src_lang, cfg.target_lang
    ))
}

/// Files in `input_dir` matching `pattern`, sorted by name. Our own outputs
/// are left out so an in-place batch does not translate them again.
pub fn discover_jobs(
    input_dir: &Path,
    output_dir: &Path,
    pattern: &str,
    cfg: &TranslateConfig,
) -> Result<Vec<FileJob>> {
    if !input_dir.is_dir() {
        bail!("input directory does not exist: {}", input_dir.display());
    }
    let own_suffix = format!("_{}.srt", cfg.output_suffix());
    let mut names = Vec::new();
    for entry in fs::read_dir(input_dir)
        .with_context(|| format!("cannot list {}", input_dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if wildcard_match(pattern, &name) && !name.ends_with(&own_suffix) {
            names.push(name);
        }
    }
    names.sort();
    info!("found {} subtitle files to translate", names.len());
    Ok(names
        .into_iter()
        .map(|name| {
            let input = input_dir.join(&name);
            let file_id = output_name(&input, cfg);
            FileJob {
                output: output_dir.join(&file_id),
                file_id,
                input,
            }
        })
        .collect())
}

/// Match `name` against a pattern where `*` is any run and `?` any one char.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ni));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ni = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Drives files through the pipeline and records their status.
pub struct BatchOrchestrator<T> {
    pipeline: FilePipeline<T>,
    state: Arc<BatchStateStore>,
    cancel: CancellationToken,
}

impl<T: Translator> BatchOrchestrator<T> {
    /// `cancel` is the operator's stop signal; the batch derives its own pause
    /// token from it.
    pub fn new(
        pipeline: FilePipeline<T>,
        state: Arc<BatchStateStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            state,
            cancel,
        }
    }

    /// Run `jobs` in order with at most `workers` files in flight. Reports
    /// come back in input order.
    pub async fn run(&self, jobs: &[FileJob]) -> BatchReport {
        let stop = self.cancel.child_token();
        let halted = Mutex::new(None);
        let workers = self.pipeline.config().workers.max(1);
        info!("translating {} files with {} workers", jobs.len(), workers);
        let files = stream::iter(jobs)
            .map(|job| self.run_one(job, &stop, &halted))
            .buffered(workers)
            .collect::<Vec<_>>()
            .await;
        let halted = halted.into_inner().unwrap_or_else(PoisonError::into_inner);
        BatchReport { files, halted }
    }

    async fn run_one(
        &self,
        job: &FileJob,
        stop: &CancellationToken,
        halted: &Mutex<Option<String>>,
    ) -> FileReport {
        let mut report = FileReport {
            file_id: job.file_id.clone(),
            status: FileStatus::Pending,
            flagged: Vec::new(),
            failed_units: 0,
            skipped: false,
        };
        if let Some(FileStatus::Done { output }) = self.state.status(&job.file_id).await {
            info!("skipping {}: already translated", job.file_id);
            report.status = FileStatus::Done { output };
            report.skipped = true;
            return report;
        }
        if stop.is_cancelled() {
            let reason = halted
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(|r| format!("run halted: {r}"))
                .unwrap_or_else(|| "batch paused before start".to_string());
            report.status = FileStatus::Paused { reason };
            self.settle(&mut report, stop, halted).await;
            return report;
        }
        if let Err(e) = self.state.set(&job.file_id, FileStatus::InProgress).await {
            halt(halted, stop, e.to_string());
            report.status = FileStatus::Failed {
                reason: e.to_string(),
            };
            return report;
        }
        report.status = match self.pipeline.run(job, stop).await {
            Ok(outcome) => {
                report.flagged = outcome.flagged;
                report.failed_units = outcome.failed_units;
                FileStatus::Done {
                    output: outcome.output,
                }
            }
            Err(err) => {
                let reason = err.to_string();
                match err.disposition() {
                    Disposition::FailFile => {
                        error!("{} failed: {reason}", job.file_id);
                        FileStatus::Failed { reason }
                    }
                    Disposition::Pause => {
                        warn!("pausing batch at {}: {reason}", job.file_id);
                        stop.cancel();
                        FileStatus::Paused { reason }
                    }
                    Disposition::Halt => {
                        halt(halted, stop, format!("{}: {reason}", job.file_id));
                        FileStatus::Failed { reason }
                    }
                }
            }
        };
        self.settle(&mut report, stop, halted).await;
        report
    }

    /// Persist the report's status; a state that cannot be saved halts the run.
    async fn settle(
        &self,
        report: &mut FileReport,
        stop: &CancellationToken,
        halted: &Mutex<Option<String>>,
    ) {
        if let Err(e) = self.state.set(&report.file_id, report.status.clone()).await {
            halt(halted, stop, e.to_string());
        }
    }
}

fn halt(halted: &Mutex<Option<String>>, stop: &CancellationToken, reason: String) {
    error!("halting run: {reason}");
    halted
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_or_insert(reason);
    stop.cancel();
}
