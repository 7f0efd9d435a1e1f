use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use molmirror::config::{self, JobConfig, SourceConfig};
use molmirror::engine::IngestionOrchestrator;
use molmirror::engine::state::ProgressEvent;
use molmirror::networking;
use molmirror::storage::{CheckpointStore, SourceCheckpoint, TargetStatus};
use molmirror::util::{format_bytes, progress_percent};

#[derive(Parser, Debug)]
#[command(
    name = "molmirror",
    author,
    version,
    about = "Mirror chemical-structure archives from remote manifests into a local cache"
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch every source in the job, resuming where earlier runs stopped.
    Download {
        #[arg(short, long)]
        config: PathBuf,
        /// Only run these sources (repeatable).
        #[arg(short, long = "source")]
        sources: Vec<String>,
    },
    /// Print each source's checkpoint state as JSON.
    Status {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Forget a source's checkpoint so the next run starts over.
    Clear {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long = "source", required = true)]
        sources: Vec<String>,
    },
}

#[derive(Serialize)]
struct SourceStatus<'a> {
    source_id: &'a str,
    source_complete: bool,
    pending: usize,
    in_progress: usize,
    verified: usize,
    failed: usize,
    checkpoint: &'a SourceCheckpoint,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli.command)) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<ExitCode, molmirror::Error> {
    match command {
        Command::Download { config, sources } => {
            let job = config::load_config(&config)?;
            let selected = select_sources(&job, &sources)?;
            download(job, selected).await
        }
        Command::Status { config } => {
            let job = config::load_config(&config)?;
            status(&job)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Clear { config, sources } => {
            let job = config::load_config(&config)?;
            let selected = select_sources(&job, &sources)?;
            let mut store = CheckpointStore::new(job.checkpoint_dir.clone());
            for source in &selected {
                if !store.clear(&source.id)? {
                    info!("clear: {} had no checkpoint", source.id);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn select_sources(job: &JobConfig, wanted: &[String]) -> Result<Vec<SourceConfig>, molmirror::Error> {
    if wanted.is_empty() {
        return Ok(job.sources.clone());
    }
    wanted
        .iter()
        .map(|id| {
            job.sources
                .iter()
                .find(|source| &source.id == id)
                .cloned()
                .ok_or_else(|| {
                    molmirror::error::ConfigError::Invalid(format!("unknown source '{id}'")).into()
                })
        })
        .collect()
}

async fn download(job: JobConfig, sources: Vec<SourceConfig>) -> Result<ExitCode, molmirror::Error> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight chunks and saving progress");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(report_progress(rx));

    let transfer = networking::backend_for(&job);
    let orchestrator = IngestionOrchestrator::new(job, transfer, cancel).with_events(tx);
    let summary = orchestrator.run(&sources).await;
    drop(orchestrator);
    if let Err(err) = reporter.await {
        warn!("progress reporter stopped early: {err}");
    }

    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{json}"),
        Err(err) => error!("failed to render run summary: {err}"),
    }
    Ok(if summary.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn report_progress(mut rx: mpsc::UnboundedReceiver<ProgressEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::SourceState { source_id, state } => {
                info!("{source_id}: {}", state.label());
            }
            ProgressEvent::TargetStarted { target, attempt } if attempt > 1 => {
                info!("{target}: retrying (attempt {attempt})");
            }
            ProgressEvent::TargetStarted { target, .. } => debug!("{target}: starting"),
            ProgressEvent::TargetProgress {
                target,
                downloaded,
                total,
                speed,
            } => debug!(
                "{target}: {:.1}% ({}) at {speed}",
                progress_percent(downloaded, total),
                format_bytes(downloaded)
            ),
            ProgressEvent::TargetVerified { target, bytes } => {
                debug!("{target}: verified ({})", format_bytes(bytes));
            }
            ProgressEvent::TargetFailed { target, error } => warn!("{target}: {error}"),
        }
    }
}

fn status(job: &JobConfig) -> Result<(), molmirror::Error> {
    let mut store = CheckpointStore::new(job.checkpoint_dir.clone());
    for source in &job.sources {
        store.load(&source.id)?;
    }
    let report: Vec<SourceStatus<'_>> = job
        .sources
        .iter()
        .filter_map(|source| store.snapshot(&source.id))
        .map(|checkpoint| SourceStatus {
            source_id: &checkpoint.source_id,
            source_complete: checkpoint.source_complete,
            pending: checkpoint.count(TargetStatus::Pending),
            in_progress: checkpoint.count(TargetStatus::InProgress),
            verified: checkpoint.count(TargetStatus::Verified),
            failed: checkpoint.count(TargetStatus::Failed),
            checkpoint,
        })
        .collect();
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(err) => error!("failed to render status: {err}"),
    }
    Ok(())
}
