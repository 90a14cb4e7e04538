//! Binary entry point for the subtitle translator.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use subtrans_core::batch::{discover_jobs, state_path, BatchOrchestrator, BatchStateStore};
use subtrans_core::checkpoint::JsonCheckpointStore;
use subtrans_core::config::TranslateConfig;
use subtrans_core::job::{FileJob, FilePipeline};
use subtrans_core::segment::SegmentMode;
use subtrans_core::translate::http::HttpTranslator;
use subtrans_core::translate::retry::RetryingTranslator;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Naive,
    Split,
}

/// Command line options for the binary.
#[derive(Parser)]
#[command(version, about = "Translate SRT subtitles through a translation service")]
struct Cli {
    /// SRT file, or a directory with --batch.
    input: PathBuf,

    /// Output SRT file, or output directory with --batch.
    output: PathBuf,

    /// Translate every matching file in the input directory.
    #[arg(long)]
    batch: bool,

    /// File name pattern used with --batch.
    #[arg(long, default_value = "*.srt")]
    pattern: String,

    #[arg(short = 's', long = "src")]
    src_lang: Option<String>,

    #[arg(short = 't', long = "target")]
    target_lang: Option<String>,

    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Drop the original lines from the output.
    #[arg(long)]
    only_translation: bool,

    /// Languages separate words with spaces.
    #[arg(long)]
    space: bool,

    /// Ignore existing checkpoints and batch state.
    #[arg(long)]
    no_resume: bool,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    max_retries: Option<u32>,

    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long, env = "SUBTRANS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// JSON file with translation settings; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose debug and trace logs.
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn settings(&self) -> Result<TranslateConfig> {
        let mut cfg = match &self.config {
            Some(path) => TranslateConfig::from_file(path)?,
            None => TranslateConfig::default(),
        };
        if let Some(src) = &self.src_lang {
            cfg.src_lang = src.clone();
        }
        if let Some(target) = &self.target_lang {
            cfg.target_lang = target.clone();
        }
        if let Some(mode) = self.mode {
            cfg.mode = match mode {
                Mode::Naive => SegmentMode::Naive,
                Mode::Split => SegmentMode::Split,
            };
        }
        if self.only_translation {
            cfg.both = false;
        }
        if self.space {
            cfg.space = true;
        }
        if self.no_resume {
            cfg.resume = false;
        }
        if let Some(workers) = self.workers {
            cfg.workers = workers;
        }
        if let Some(max_retries) = self.max_retries {
            cfg.max_retries = max_retries;
        }
        if let Some(endpoint) = &self.endpoint {
            cfg.endpoint = endpoint.clone();
        }
        if self.api_key.is_some() {
            cfg.api_key = self.api_key.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Application entry point which parses CLI args and performs actions.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let filter = if cli.debug {
        EnvFilter::try_new("subtrans=trace,subtrans_core=trace,info")?
    } else {
        EnvFilter::try_new("subtrans=info,subtrans_core=info,warn")?
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = cli.settings()?;
    let (jobs, out_dir) = if cli.batch {
        fs::create_dir_all(&cli.output)
            .with_context(|| format!("cannot create {}", cli.output.display()))?;
        let jobs = discover_jobs(&cli.input, &cli.output, &cli.pattern, &cfg)?;
        (jobs, cli.output.clone())
    } else {
        (vec![single_job(&cli.input, &cli.output)?], parent_dir(&cli.output))
    };
    if jobs.is_empty() {
        warn!("nothing to translate in {}", cli.input.display());
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, saving progress before exit");
            on_interrupt.cancel();
        }
    });

    let backend = HttpTranslator::new(
        cfg.endpoint.clone(),
        cfg.api_key.clone(),
        cfg.retry_policy().request_timeout,
    )?;
    let translator = RetryingTranslator::new(backend, cfg.retry_policy(), cancel.clone());
    let state = if cli.batch {
        BatchStateStore::open(state_path(&out_dir, &cfg), cfg.resume)?
    } else {
        BatchStateStore::in_memory()
    };
    info!(
        "translating {} -> {} ({:?} mode)",
        cfg.src_lang, cfg.target_lang, cfg.mode
    );
    let pipeline = FilePipeline::new(
        Arc::new(translator),
        Arc::new(JsonCheckpointStore::new(&out_dir)),
        Arc::new(cfg),
    );
    let report = BatchOrchestrator::new(pipeline, Arc::new(state), cancel)
        .run(&jobs)
        .await;
    report.log_summary();
    Ok(ExitCode::from(report.exit_code()))
}

/// Job for a single file; the checkpoint is keyed by the output name.
fn single_job(input: &Path, output: &Path) -> Result<FileJob> {
    if !input.is_file() {
        bail!("input file does not exist: {}", input.display());
    }
    let file_id = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("output {} has no file name", output.display()))?;
    Ok(FileJob {
        file_id,
        input: input.to_path_buf(),
        output: output.to_path_buf(),
    })
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
