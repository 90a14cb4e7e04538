//! Run configuration, loadable from a JSON file with every field defaulted.

use crate::reconstruct::{DisplayMode, ReconstructOptions};
use crate::segment::{SegmentMode, SegmentOptions};
use crate::translate::retry::RetryPolicy;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:5000/translate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateConfig {
    pub src_lang: String,
    pub target_lang: String,
    pub mode: SegmentMode,
    /// Keep the original lines next to the translation.
    pub both: bool,
    pub original_first: bool,
    /// The languages separate words with spaces.
    pub space: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub request_timeout_ms: u64,
    pub resume: bool,
    pub max_request_chars: usize,
    pub max_units_per_request: usize,
    pub workers: usize,
    /// Pause between two requests of the same file.
    pub chunk_delay_ms: u64,
    /// Fail a file when any unit could not be translated.
    pub abort_on_failure: bool,
    /// Delete a file's checkpoint once its output is written.
    pub discard_checkpoints: bool,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            src_lang: "en".into(),
            target_lang: "zh-CN".into(),
            mode: SegmentMode::Split,
            both: true,
            original_first: false,
            space: false,
            max_retries: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter: 0.1,
            request_timeout_ms: 10_000,
            resume: true,
            max_request_chars: 3_500,
            max_units_per_request: 50,
            workers: 1,
            chunk_delay_ms: 1_000,
            abort_on_failure: false,
            discard_checkpoints: false,
            endpoint: DEFAULT_ENDPOINT.into(),
            api_key: None,
        }
    }
}

impl TranslateConfig {
    /// Read a JSON config; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("loading config from {}", path.display());
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            bail!("max_retries must be at least 1");
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.base_delay_ms > self.max_delay_ms {
            bail!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms,
                self.max_delay_ms
            );
        }
        if self.max_request_chars == 0 || self.max_units_per_request == 0 {
            bail!("request size limits must be positive");
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            bail!("jitter must be within [0, 1], got {}", self.jitter);
        }
        if self.src_lang.trim().is_empty() || self.target_lang.trim().is_empty() {
            bail!("source and target languages are required");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_ratio: self.jitter,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn segment_options(&self) -> SegmentOptions {
        SegmentOptions {
            mode: self.mode,
            space: self.space,
            max_chars: self.max_request_chars,
        }
    }

    pub fn reconstruct_options(&self) -> ReconstructOptions {
        ReconstructOptions {
            display: if self.both {
                DisplayMode::Both
            } else {
                DisplayMode::TranslationOnly
            },
            space: self.space,
            original_first: self.original_first,
        }
    }

    /// Suffix distinguishing outputs of different language pairs and modes.
    pub fn output_suffix(&self) -> String {
        format!(
            "{}_{}_{}",
            self.src_lang,
            self.target_lang,
            if self.both { "both" } else { "only" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(&path, r#"{"target_lang": "pt-BR", "mode": "naive", "workers": 3}"#).unwrap();
        let cfg = TranslateConfig::from_file(&path).unwrap();
        assert_eq!(cfg.target_lang, "pt-BR");
        assert_eq!(cfg.mode, SegmentMode::Naive);
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.src_lang, "en");
        assert_eq!(cfg.max_retries, 5);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_nonsense() {
        let mut cfg = TranslateConfig {
            max_retries: 0,
            ..TranslateConfig::default()
        };
        assert!(cfg.validate().is_err());
        cfg.max_retries = 2;
        cfg.base_delay_ms = 10;
        cfg.max_delay_ms = 5;
        assert!(cfg.validate().is_err());
        cfg.max_delay_ms = 10;
        cfg.jitter = 1.5;
        assert!(cfg.validate().is_err());
        cfg.jitter = 0.0;
        cfg.workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn malformed_file_names_the_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ nope").unwrap();
        let err = TranslateConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("bad.json"));
    }

    #[test]
    fn derived_options() {
        let cfg = TranslateConfig {
            both: false,
            space: true,
            ..TranslateConfig::default()
        };
        assert_eq!(cfg.reconstruct_options().display, DisplayMode::TranslationOnly);
        assert_eq!(cfg.segment_options().max_chars, 3_500);
        assert_eq!(cfg.retry_policy().base_delay, Duration::from_secs(2));
        assert_eq!(cfg.output_suffix(), "en_zh-CN_only");
    }
}
