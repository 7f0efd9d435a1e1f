//! Per-source ingestion runs.
//!
//! A run walks one source through manifest loading, credential resolution,
//! deduplication, checkpoint filtering and bounded-parallel transfer. Each
//! target goes transfer, then verify, then checkpoint update, in that order,
//! while holding one of the driver's slots.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

use crate::checksum::{self, Verification};
use crate::config::{ChecksumConfig, JobConfig, MissingChecksum, SourceConfig};
use crate::credentials;
use crate::dedup;
use crate::engine::models::{Dialect, DownloadTarget, SidecarRef, TargetId};
use crate::engine::state::{ProgressEvent, SourceState};
use crate::engine::summary::{FailedTarget, JobSummary, SourceSummary, summarize_cache};
use crate::error::{CheckpointError, Error, ManifestError, TransferError};
use crate::manifest::{self, ParseContext};
use crate::networking::{ProgressFn, Transfer, TransferDriver};
use crate::storage::{CheckpointEntry, CheckpointStore, TargetStatus};
use crate::util::{CancelFlag, cancel_requested, format_bytes};

pub mod models;
pub mod state;
pub mod summary;

type Events = Option<mpsc::UnboundedSender<ProgressEvent>>;

pub struct IngestionOrchestrator {
    config: Arc<JobConfig>,
    driver: TransferDriver,
    store: Arc<Mutex<CheckpointStore>>,
    cancel: CancelFlag,
    events: Events,
}

/// Shared by every target task of one source.
struct TargetContext {
    driver: TransferDriver,
    store: Arc<Mutex<CheckpointStore>>,
    cancel: CancelFlag,
    events: Events,
    missing_checksum: MissingChecksum,
}

enum TargetOutcome {
    Verified {
        bytes_transferred: u64,
        checksum_skipped: bool,
    },
    Failed(String),
    Interrupted,
}

impl IngestionOrchestrator {
    pub fn new(config: JobConfig, transfer: Arc<dyn Transfer>, cancel: CancelFlag) -> Self {
        let driver = TransferDriver::from_config(&config, transfer);
        let store = CheckpointStore::new(config.checkpoint_dir.clone());
        Self {
            config: Arc::new(config),
            driver,
            store: Arc::new(Mutex::new(store)),
            cancel,
            events: None,
        }
    }

    /// Stream [`ProgressEvent`]s to `sender` while running.
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn store(&self) -> Arc<Mutex<CheckpointStore>> {
        Arc::clone(&self.store)
    }

    /// Run every source concurrently. A source that aborts does not affect
    /// the others.
    pub async fn run(&self, sources: &[SourceConfig]) -> JobSummary {
        let started = Instant::now();
        info!(
            "ingest: starting {} source(s), {} parallel transfer(s) x {} connection(s)",
            sources.len(),
            self.driver.max_parallel(),
            self.config.transfer.connections
        );
        let summaries = join_all(sources.iter().map(|source| self.run_source(source))).await;
        let bytes_transferred = summaries.iter().map(|s| s.bytes_transferred).sum();
        let job = JobSummary {
            sources: summaries,
            bytes_transferred,
            elapsed_ms: elapsed_ms(started),
        };
        info!(
            "ingest: finished in {:.1}s, {} transferred{}",
            started.elapsed().as_secs_f32(),
            format_bytes(job.bytes_transferred),
            if job.has_failures() { " with failures" } else { "" }
        );
        job
    }

    pub async fn run_source(&self, source: &SourceConfig) -> SourceSummary {
        let started = Instant::now();
        let mut summary = SourceSummary::new(&source.id);
        let mut state = SourceState::NotStarted;

        if let Err(err) = self.execute(source, &mut summary, &mut state).await {
            error!("ingest: {}: aborted: {err}", source.id);
            self.advance(&source.id, &mut state, SourceState::Aborted);
            summary.error = Some(err.to_string());
        }
        summary.state = state;
        summary.elapsed_ms = elapsed_ms(started);

        let cache_dir = self.config.source_cache_dir(source);
        summary.cache = tokio::task::spawn_blocking(move || summarize_cache(&cache_dir))
            .await
            .unwrap_or_default();

        info!(
            "ingest: {}: {} - {} verified, {} skipped, {} failed, {} pending, {} transferred in {:.1}s",
            source.id,
            summary.state.label(),
            summary.verified,
            summary.skipped,
            summary.failed,
            summary.pending,
            format_bytes(summary.bytes_transferred),
            started.elapsed().as_secs_f32()
        );
        for failed in &summary.failed_targets {
            warn!("ingest: {}: failed {}: {}", source.id, failed.target, failed.error);
        }
        summary
    }

    async fn execute(
        &self,
        source: &SourceConfig,
        summary: &mut SourceSummary,
        state: &mut SourceState,
    ) -> Result<(), Error> {
        let source_id = source.id.clone();
        let (complete, entries, verified) = with_store(&self.store, move |store| {
            let checkpoint = store.load(&source_id)?;
            Ok((
                checkpoint.source_complete,
                checkpoint.entries.len(),
                checkpoint.count(TargetStatus::Verified),
            ))
        })
        .await?;
        if complete {
            summary.targets = entries;
            summary.skipped = verified;
            info!("ingest: {}: already complete, skipping", source.id);
            self.advance(&source.id, state, SourceState::Complete);
            return Ok(());
        }

        let cache_dir = self.config.source_cache_dir(source);
        let bytes = tokio::fs::read(&source.manifest)
            .await
            .map_err(|err| ManifestError::Io {
                path: source.manifest.clone(),
                source: err,
            })?;
        let content = manifest::decode(&bytes);
        let dialect = source
            .dialect
            .unwrap_or_else(|| manifest::detect_dialect(&content));
        self.advance(&source.id, state, SourceState::ManifestLoaded);

        let ctx = ParseContext {
            source_id: &source.id,
            cache_dir: &cache_dir,
            base_url: source.base_url.as_deref(),
            archive_suffixes: &source.archive_suffixes,
        };
        let parsed = manifest::parse(dialect, &content, &ctx);
        summary.malformed_lines = parsed.errors.len();
        let parsed = parsed.require_targets(&source.id)?;

        let default_credentials = source.credentials.as_ref().and_then(|c| c.resolve());
        let targets = credentials::resolve(
            &source.id,
            parsed.targets,
            default_credentials.as_ref(),
            source.require_auth,
            parsed.credential_errors,
        )?;
        let mut targets = dedup::dedupe(targets);
        probe_sidecars(&mut targets, dialect, &source.checksum);
        summary.targets = targets.len();
        self.advance(&source.id, state, SourceState::TargetsResolved);

        let (work, skipped) = with_store(&self.store, move |store| {
            let mut work = Vec::with_capacity(targets.len());
            let mut fresh = Vec::new();
            let mut skipped = 0usize;
            for target in targets {
                match store.get(&target.id) {
                    Some(entry) if entry.is_verified() => {
                        if !is_complete_artifact(&target.local_path) {
                            warn!(
                                "ingest: {} is verified in the checkpoint but missing from {}",
                                target.id,
                                target.local_path.display()
                            );
                        }
                        skipped += 1;
                    }
                    Some(_) => work.push(target),
                    None => {
                        fresh.push(target.id.clone());
                        work.push(target);
                    }
                }
            }
            store.register(fresh)?;
            Ok((work, skipped))
        })
        .await?;
        summary.skipped += skipped;
        debug!(
            "ingest: {}: {} to fetch, {} already verified",
            source.id,
            work.len(),
            summary.skipped
        );

        self.advance(&source.id, state, SourceState::Transferring);
        let ctx = Arc::new(TargetContext {
            driver: self.driver.clone(),
            store: Arc::clone(&self.store),
            cancel: Arc::clone(&self.cancel),
            events: self.events.clone(),
            missing_checksum: source.checksum.missing,
        });
        let mut tasks = JoinSet::new();
        let mut undispatched = 0usize;
        let mut queue = work.into_iter();
        while let Some(target) = queue.next() {
            if cancel_requested(&self.cancel) {
                undispatched = 1 + queue.len();
                break;
            }
            let permit = self.driver.acquire_slot().await?;
            let ctx = Arc::clone(&ctx);
            tasks.spawn(async move {
                let id = target.id.clone();
                let outcome = process_target(&ctx, target).await;
                drop(permit);
                (id, outcome)
            });
        }

        self.advance(&source.id, state, SourceState::Verifying);
        summary.pending += undispatched;
        while let Some(joined) = tasks.join_next().await {
            let (id, outcome) = match joined {
                Ok(result) => result,
                Err(err) => {
                    error!("ingest: {}: target task panicked: {err}", source.id);
                    summary.failed += 1;
                    continue;
                }
            };
            match outcome {
                TargetOutcome::Verified {
                    bytes_transferred,
                    checksum_skipped,
                } => {
                    summary.verified += 1;
                    summary.bytes_transferred += bytes_transferred;
                    if checksum_skipped {
                        summary.checksum_skipped += 1;
                    }
                }
                TargetOutcome::Failed(error) => {
                    summary.failed += 1;
                    summary.failed_targets.push(FailedTarget {
                        target: id.path,
                        error,
                    });
                }
                TargetOutcome::Interrupted => summary.pending += 1,
            }
        }
        summary.failed_targets.sort_by(|a, b| a.target.cmp(&b.target));

        if cancel_requested(&self.cancel) && summary.pending > 0 {
            self.advance(&source.id, state, SourceState::Aborted);
            summary.error = Some(TransferError::Cancelled.to_string());
            return Ok(());
        }
        if summary.failed == 0 && summary.pending == 0 {
            let source_id = source.id.clone();
            let marked =
                with_store(&self.store, move |store| store.mark_source_complete(&source_id)).await?;
            if !marked {
                warn!(
                    "ingest: {}: checkpoint holds entries no longer in the manifest; \
                     clear it to enable the completed-source fast path",
                    source.id
                );
            }
            self.advance(&source.id, state, SourceState::Complete);
        } else {
            self.advance(&source.id, state, SourceState::PartialFailure);
        }
        Ok(())
    }

    fn advance(&self, source_id: &str, state: &mut SourceState, next: SourceState) {
        if !state.can_advance_to(next) {
            warn!(
                "ingest: {source_id}: unexpected transition {} -> {}",
                state.label(),
                next.label()
            );
        }
        debug!("ingest: {source_id}: {} -> {}", state.label(), next.label());
        *state = next;
        emit(
            &self.events,
            ProgressEvent::SourceState {
                source_id: source_id.to_owned(),
                state: next,
            },
        );
    }
}

/// Attach `<url>.<algorithm>` sidecars to targets the manifest did not pair.
/// Listings are left alone: they only pair anchors they actually contain.
fn probe_sidecars(targets: &mut [DownloadTarget], dialect: Dialect, checksum: &ChecksumConfig) {
    if !checksum.probe_sidecar || dialect == Dialect::Listing {
        return;
    }
    for target in targets {
        if target.expected_checksum.is_none() && target.sidecar.is_none() {
            target.sidecar = Some(SidecarRef {
                url: format!(
                    "{}{}",
                    target.remote_url,
                    checksum.algorithm.sidecar_suffix()
                ),
                algorithm: checksum.algorithm,
            });
        }
    }
}

async fn process_target(ctx: &TargetContext, target: DownloadTarget) -> TargetOutcome {
    let id = target.id.clone();
    let key = id.clone();
    let started = with_store(&ctx.store, move |store| {
        let entry = store
            .get(&key)
            .cloned()
            .unwrap_or_else(|| CheckpointEntry::pending(key))
            .started();
        store.upsert(entry.clone())?;
        Ok(entry)
    })
    .await;
    let entry = match started {
        Ok(entry) => entry,
        Err(err) => {
            error!("ingest: {id}: {err}");
            return TargetOutcome::Failed(err.to_string());
        }
    };

    let record = checksum::resolve_record(&target, &ctx.driver, &ctx.cancel).await;
    if record.is_none() && ctx.missing_checksum == MissingChecksum::Require {
        if cancel_requested(&ctx.cancel) {
            return TargetOutcome::Interrupted;
        }
        let reason = "no checksum available and the source requires one".to_owned();
        return finish(ctx, &id, entry.failed(0, reason.clone()), TargetOutcome::Failed(reason))
            .await;
    }

    let events = &ctx.events;
    let progress = |downloaded: u64, total: Option<u64>, speed: &str| {
        emit(
            events,
            ProgressEvent::TargetProgress {
                target: id.clone(),
                downloaded,
                total,
                speed: speed.to_owned(),
            },
        );
    };
    let mut request = ctx.driver.request(
        &target.remote_url,
        &target.local_path,
        target.credentials.as_ref(),
    );
    let progress_fn: ProgressFn<'_> = &progress;
    request.progress = Some(progress_fn);

    let mut attempts = 0u32;
    let result = {
        let mut on_attempt = |attempt: u32| {
            attempts = attempt;
            emit(
                events,
                ProgressEvent::TargetStarted {
                    target: id.clone(),
                    attempt,
                },
            );
        };
        ctx.driver
            .fetch_with_retry(&request, &ctx.cancel, record.as_ref(), &mut on_attempt)
            .await
    };

    match result {
        Ok(delivery) => {
            let size = delivery.outcome.bytes_on_disk;
            emit(
                events,
                ProgressEvent::TargetVerified {
                    target: id.clone(),
                    bytes: size,
                },
            );
            finish(
                ctx,
                &id,
                entry.verified(delivery.attempts, size),
                TargetOutcome::Verified {
                    bytes_transferred: delivery.bytes_transferred,
                    checksum_skipped: delivery.verification == Verification::Skipped,
                },
            )
            .await
        }
        Err(TransferError::Cancelled) => {
            debug!("ingest: {id}: interrupted; will resume next run");
            finish(
                ctx,
                &id,
                entry.interrupted(attempts),
                TargetOutcome::Interrupted,
            )
            .await
        }
        Err(err) => {
            let message = format!("{}: {err}", err.kind());
            emit(
                events,
                ProgressEvent::TargetFailed {
                    target: id.clone(),
                    error: message.clone(),
                },
            );
            finish(
                ctx,
                &id,
                entry.failed(attempts, message.clone()),
                TargetOutcome::Failed(message),
            )
            .await
        }
    }
}

/// Record the verdict; a checkpoint write failure turns it into a failure.
async fn finish(
    ctx: &TargetContext,
    id: &TargetId,
    entry: CheckpointEntry,
    outcome: TargetOutcome,
) -> TargetOutcome {
    match with_store(&ctx.store, move |store| store.upsert(entry)).await {
        Ok(()) => outcome,
        Err(err) => {
            error!("ingest: {id}: {err}");
            TargetOutcome::Failed(err.to_string())
        }
    }
}

/// Run `op` against the store on the blocking pool; checkpoint writes fsync.
async fn with_store<T, F>(store: &Arc<Mutex<CheckpointStore>>, op: F) -> Result<T, CheckpointError>
where
    F: FnOnce(&mut CheckpointStore) -> Result<T, CheckpointError> + Send + 'static,
    T: Send + 'static,
{
    let mut guard = Arc::clone(store).lock_owned().await;
    let dir = guard.dir().to_path_buf();
    tokio::task::spawn_blocking(move || op(&mut guard))
        .await
        .map_err(|err| CheckpointError::Io {
            path: dir,
            source: io::Error::other(err.to_string()),
        })?
}

fn emit(events: &Events, event: ProgressEvent) {
    if let Some(sender) = events {
        let _ = sender.send(event);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Whether `path` is a finished artifact rather than an in-progress one.
pub fn is_complete_artifact(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_none_or(|ext| ext != "part" && ext != "aria2")
}
