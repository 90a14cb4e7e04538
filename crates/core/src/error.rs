//! Error types for the translation pipeline.
//!
//! Each layer has its own enum; [`FileError`] composes them for one file and
//! decides whether the batch keeps going, pauses, or halts.

use thiserror::Error;

/// Malformed subtitle input. Fatal for the file, the batch moves on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// The segmenter produced a mapping that does not reproduce an entry's text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("entry {index} cannot be mapped back losslessly: {message}")]
pub struct SegmentationError {
    pub index: u32,
    pub message: String,
}

/// Failure of a single call to the translation backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    /// Throttling, server errors, timeouts, broken responses.
    #[error("retryable backend failure{}: {message}", status_suffix(.status))]
    Retryable {
        status: Option<u16>,
        message: String,
    },

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("unsupported language pair: {0}")]
    UnsupportedLanguage(String),

    #[error("malformed request: {0}")]
    BadRequest(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl TranslateError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// Outcome of the retry controller when it gives up on a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    #[error("backend error: {0}")]
    Fatal(TranslateError),

    #[error("rate limit persisted after {attempts} attempts: {last}")]
    RateLimitExhausted { attempts: u32, last: TranslateError },

    #[error("cancelled")]
    Cancelled,
}

/// The checkpoint store cannot durably record progress.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O for {file_id}: {source}")]
    Io {
        file_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint for {file_id} is unreadable: {source}")]
    Corrupt {
        file_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything that can end the processing of one file early.
#[derive(Error, Debug)]
pub enum FileError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Segmentation(#[from] SegmentationError),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("{failed} of {total} units failed to translate")]
    UnitsFailed { failed: usize, total: usize },

    #[error("cannot write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// What the batch does after a file ends with a [`FileError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Mark the file failed and continue with the next one.
    FailFile,
    /// Keep the checkpoint and suspend the whole batch.
    Pause,
    /// Mark the file failed and stop the run.
    Halt,
}

impl FileError {
    pub fn disposition(&self) -> Disposition {
        match self {
            FileError::Retry(RetryError::RateLimitExhausted { .. })
            | FileError::Retry(RetryError::Cancelled) => Disposition::Pause,
            FileError::Retry(RetryError::Fatal(_)) | FileError::Checkpoint(_) => Disposition::Halt,
            FileError::Segmentation(_) => Disposition::Halt,
            FileError::Read { .. }
            | FileError::Parse(_)
            | FileError::UnitsFailed { .. }
            | FileError::Write { .. } => Disposition::FailFile,
        }
    }
}
