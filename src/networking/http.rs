use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, warn};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::TransferError;
use crate::util::{CancelFlag, cancel_requested, format_speed};

use super::{Transfer, TransferOutcome, TransferRequest, part_path};

const PROGRESS_TICK: f32 = 0.2;

/// Single-connection HTTP(S) backend that resumes `.part` files with
/// `Range` requests.
#[derive(Clone)]
pub struct HttpTransfer {
    client: Client,
}

impl HttpTransfer {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|err| {
                warn!("http transfer: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn fetch(
        &self,
        request: &TransferRequest<'_>,
        cancel: &CancelFlag,
    ) -> Result<TransferOutcome, TransferError> {
        let part = part_path(request.destination);
        if let Some(parent) = part.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::Disk(format!("failed to create download dir: {e}")))?;
        }

        let offset = if request.resume {
            fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        let mut builder = self.client.get(request.url);
        if offset > 0 {
            debug!("http transfer: resuming {} at byte {offset}", request.url);
            builder = builder.header(RANGE, format!("bytes={offset}-"));
        }
        if let Some(creds) = request.credentials {
            builder = builder.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // The partial file is not a prefix the server recognises.
            let _ = fs::remove_file(&part).await;
            return Err(TransferError::network(format!(
                "{} rejected resume at byte {offset}; restarting",
                request.url
            )));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransferError::Auth(format!("{} returned {status}", request.url)));
        }
        if status.is_client_error() {
            return Err(TransferError::permanent(format!(
                "{} returned {status}",
                request.url
            )));
        }
        if !status.is_success() {
            return Err(TransferError::network(format!(
                "{} returned {status}",
                request.url
            )));
        }

        let append = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let mut file = if append {
            OpenOptions::new().append(true).open(&part).await
        } else {
            File::create(&part).await
        }
        .map_err(|e| TransferError::Disk(format!("failed to open {}: {e}", part.display())))?;

        let start = if append { offset } else { 0 };
        let total = response
            .content_length()
            .map(|len| len + start)
            .or(request.expected_size);
        let mut stream = response.bytes_stream();
        let mut downloaded = start;
        let mut last_tick = Instant::now();
        let mut last_bytes = downloaded;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = file.flush().await;
                    return Err(TransferError::network(format!(
                        "stream error after {downloaded} bytes: {err}"
                    )));
                }
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::Disk(format!("write error: {e}")))?;
            downloaded += chunk.len() as u64;

            if cancel_requested(cancel) {
                file.flush()
                    .await
                    .map_err(|e| TransferError::Disk(format!("flush error: {e}")))?;
                debug!(
                    "http transfer: cancelled {} with {downloaded} bytes kept in {}",
                    request.url,
                    part.display()
                );
                return Err(TransferError::Cancelled);
            }

            let since = last_tick.elapsed().as_secs_f32();
            let first_chunk = last_bytes == start;
            if first_chunk || since > PROGRESS_TICK {
                let speed = format_speed((downloaded - last_bytes) as f32 / since.max(PROGRESS_TICK));
                if let Some(progress) = request.progress {
                    progress(downloaded, total, &speed);
                }
                last_tick = Instant::now();
                last_bytes = downloaded;
            }
        }

        file.flush()
            .await
            .map_err(|e| TransferError::Disk(format!("flush error: {e}")))?;
        drop(file);

        if let Some(total) = total
            && downloaded < total
        {
            return Err(TransferError::network(format!(
                "download incomplete: received {downloaded} of {total} bytes"
            )));
        }

        fs::rename(&part, request.destination).await.map_err(|e| {
            TransferError::Disk(format!(
                "failed to move {} into place: {e}",
                part.display()
            ))
        })?;
        if let Some(progress) = request.progress {
            progress(downloaded, total, "0 B/s");
        }

        Ok(TransferOutcome {
            bytes_on_disk: downloaded,
            bytes_transferred: downloaded - start,
            already_present: false,
        })
    }
}

fn classify(err: reqwest::Error) -> TransferError {
    if err.is_builder() {
        TransferError::permanent(format!("invalid request: {err}"))
    } else {
        TransferError::network(format!("request failed: {err}"))
    }
}
