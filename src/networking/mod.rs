//! Transfer capability boundary and the retrying driver around it.
//!
//! A [`Transfer`] moves one URL to one local path and reports a typed
//! outcome. [`HttpTransfer`] does this in-process with range requests,
//! [`Aria2Transfer`] hands it to an `aria2c` subprocess. The
//! [`TransferDriver`] adds bounded parallelism, retries with backoff and
//! post-transfer digest checks on top of either.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::checksum::{self, Verification};
use crate::config::{JobConfig, RetryPolicy, TransferBackend};
use crate::engine::models::{ChecksumRecord, Credentials};
use crate::error::TransferError;
use crate::util::{CancelFlag, cancel_requested, format_bytes};

mod aria2;
mod http;

pub use aria2::Aria2Transfer;
pub use http::HttpTransfer;

const PART_SUFFIX: &str = ".part";
const CANCEL_POLL: Duration = Duration::from_millis(200);

/// Progress callback: (bytes on disk, expected total, speed text).
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>, &str) + Send + Sync);

/// Everything a backend needs to move one file.
#[derive(Clone, Copy)]
pub struct TransferRequest<'a> {
    pub url: &'a str,
    pub destination: &'a Path,
    pub credentials: Option<&'a Credentials>,
    /// Connections the backend may open for this one file.
    pub connections: u32,
    /// Continue from an existing `.part` file instead of starting over.
    pub resume: bool,
    pub expected_size: Option<u64>,
    pub progress: Option<ProgressFn<'a>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Final size of the file at the destination.
    pub bytes_on_disk: u64,
    /// Bytes moved over the wire by this call.
    pub bytes_transferred: u64,
    /// The destination was already complete; nothing was fetched.
    pub already_present: bool,
}

/// Result of a driver-level fetch: the last transfer plus how it checked out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub outcome: TransferOutcome,
    pub verification: Verification,
    pub attempts: u32,
    /// Bytes transferred across every attempt, including discarded ones.
    pub bytes_transferred: u64,
}

#[async_trait]
pub trait Transfer: Send + Sync {
    /// Move `request.url` to `request.destination`.
    ///
    /// Implementations write to [`part_path`] and only rename onto the
    /// destination once the file is complete.
    async fn fetch(
        &self,
        request: &TransferRequest<'_>,
        cancel: &CancelFlag,
    ) -> Result<TransferOutcome, TransferError>;
}

/// In-progress location for `destination`: same directory, `.part` suffix.
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(PART_SUFFIX);
    destination.with_file_name(name)
}

/// Build the backend selected by the job configuration.
pub fn backend_for(config: &JobConfig) -> Arc<dyn Transfer> {
    match config.transfer.backend {
        TransferBackend::Http => Arc::new(HttpTransfer::new(config.transfer.timeout())),
        TransferBackend::Aria2 => Arc::new(Aria2Transfer::new(&config.transfer)),
    }
}

#[derive(Clone)]
pub struct TransferDriver {
    transfer: Arc<dyn Transfer>,
    slots: Arc<Semaphore>,
    max_parallel: usize,
    retry: RetryPolicy,
    connections: u32,
}

impl TransferDriver {
    pub fn new(
        transfer: Arc<dyn Transfer>,
        max_parallel: usize,
        retry: RetryPolicy,
        connections: u32,
    ) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            transfer,
            slots: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
            retry,
            connections: connections.max(1),
        }
    }

    pub fn from_config(config: &JobConfig, transfer: Arc<dyn Transfer>) -> Self {
        Self::new(
            transfer,
            config.max_parallel_transfers,
            config.retry.clone(),
            config.transfer.connections,
        )
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Wait for one of the `max_parallel` target slots. Hold the permit for
    /// the whole transfer, verify and checkpoint sequence.
    pub async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, TransferError> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| TransferError::Cancelled)
    }

    pub fn request<'a>(
        &self,
        url: &'a str,
        destination: &'a Path,
        credentials: Option<&'a Credentials>,
    ) -> TransferRequest<'a> {
        TransferRequest {
            url,
            destination,
            credentials,
            connections: self.connections,
            resume: true,
            expected_size: None,
            progress: None,
        }
    }

    /// Fetch and check one file, retrying transient failures and digest
    /// mismatches under the configured policy.
    ///
    /// `on_attempt` is called with the 1-based attempt number before each try.
    pub async fn fetch_with_retry(
        &self,
        request: &TransferRequest<'_>,
        cancel: &CancelFlag,
        expected: Option<&ChecksumRecord>,
        on_attempt: &mut (dyn FnMut(u32) + Send),
    ) -> Result<Delivery, TransferError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut bytes_transferred = 0u64;
        let mut attempt = 0u32;

        loop {
            if cancel_requested(cancel) {
                return Err(TransferError::Cancelled);
            }
            attempt += 1;
            on_attempt(attempt);

            let result = match self.fetch_once(request, cancel).await {
                Ok(outcome) => {
                    bytes_transferred += outcome.bytes_transferred;
                    self.check(request.destination, expected)
                        .await
                        .map(|verification| (outcome, verification))
                }
                Err(err) => Err(err),
            };

            let err = match result {
                Ok((outcome, verification)) => {
                    return Ok(Delivery {
                        outcome,
                        verification,
                        attempts: attempt,
                        bytes_transferred,
                    });
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!("transfer: {} failed permanently: {err}", request.url);
                return Err(err);
            }
            if attempt >= max_attempts {
                return Err(TransferError::ExhaustedRetries {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            let delay = backoff_delay(&self.retry, attempt);
            warn!(
                "transfer: {} attempt {attempt}/{max_attempts} failed ({err}); retrying in {:.1}s",
                request.url,
                delay.as_secs_f32()
            );
            sleep_unless_cancelled(delay, cancel).await?;
        }
    }

    /// One attempt, skipping the backend when the destination is already
    /// complete.
    async fn fetch_once(
        &self,
        request: &TransferRequest<'_>,
        cancel: &CancelFlag,
    ) -> Result<TransferOutcome, TransferError> {
        if let Ok(meta) = tokio::fs::metadata(request.destination).await
            && meta.is_file()
            && request.expected_size.is_none_or(|size| size == meta.len())
        {
            debug!(
                "transfer: {} already present ({})",
                request.destination.display(),
                format_bytes(meta.len())
            );
            return Ok(TransferOutcome {
                bytes_on_disk: meta.len(),
                bytes_transferred: 0,
                already_present: true,
            });
        }

        let outcome = self.transfer.fetch(request, cancel).await?;
        info!(
            "transfer: {} -> {} ({})",
            request.url,
            request.destination.display(),
            format_bytes(outcome.bytes_on_disk)
        );
        Ok(outcome)
    }

    /// Compare the delivered file against `expected`. A mismatching file is
    /// removed so the next attempt starts clean.
    async fn check(
        &self,
        destination: &Path,
        expected: Option<&ChecksumRecord>,
    ) -> Result<Verification, TransferError> {
        let verification = checksum::verify(destination, expected)
            .await
            .map_err(|err| TransferError::Disk(err.to_string()))?;
        match verification {
            Verification::Mismatch { expected, actual } => {
                warn!(
                    "transfer: {} failed verification (expected {expected}, got {actual}); discarding",
                    destination.display()
                );
                if let Err(err) = tokio::fs::remove_file(destination).await {
                    return Err(TransferError::Disk(format!(
                        "unable to discard corrupt {}: {err}",
                        destination.display()
                    )));
                }
                Err(TransferError::ChecksumMismatch { expected, actual })
            }
            other => Ok(other),
        }
    }
}

/// Delay before attempt `attempt + 1`: exponential from the initial backoff,
/// capped, with up to half of it randomised when jitter is on.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let base = policy
        .initial_backoff_ms
        .saturating_mul(1u64 << exponent)
        .min(policy.max_backoff_ms);
    let millis = if policy.jitter && base > 1 {
        let half = base / 2;
        half + rand::rng().random_range(0..=base - half)
    } else {
        base
    };
    Duration::from_millis(millis)
}

async fn sleep_unless_cancelled(delay: Duration, cancel: &CancelFlag) -> Result<(), TransferError> {
    let mut remaining = delay;
    while !remaining.is_zero() {
        if cancel_requested(cancel) {
            return Err(TransferError::Cancelled);
        }
        let step = remaining.min(CANCEL_POLL);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
    Ok(())
}
