use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::config::TransferOptions;
use crate::error::TransferError;
use crate::util::{CancelFlag, cancel_requested};

use super::{CANCEL_POLL, Transfer, TransferOutcome, TransferRequest, part_path};

/// Multi-connection backend driving an `aria2c` subprocess.
///
/// aria2 keeps its own `.aria2` control file next to the `.part` output, so
/// an interrupted transfer resumes segment-wise on the next call.
#[derive(Clone, Debug)]
pub struct Aria2Transfer {
    binary: PathBuf,
    split: u32,
    min_split_size: String,
    timeout: Duration,
}

impl Aria2Transfer {
    pub fn new(options: &TransferOptions) -> Self {
        Self {
            binary: options.aria2_path.clone(),
            split: options.split.max(1),
            min_split_size: options.min_split_size.clone(),
            timeout: options.timeout(),
        }
    }

    /// Global options. The URI, output name and credentials go through the
    /// input file on stdin so secrets never show up in the process list.
    fn build_args(&self, request: &TransferRequest<'_>, dir: &Path) -> Vec<String> {
        let connections = request.connections.max(1);
        vec![
            format!("--continue={}", request.resume),
            "--auto-file-renaming=false".to_owned(),
            "--allow-overwrite=true".to_owned(),
            "--console-log-level=error".to_owned(),
            "--summary-interval=0".to_owned(),
            format!("--dir={}", dir.display()),
            format!("--max-connection-per-server={connections}"),
            format!("--split={}", self.split.max(connections)),
            format!("--min-split-size={}", self.min_split_size),
            // Retries belong to the driver so they share one budget.
            "--max-tries=1".to_owned(),
            "--input-file=-".to_owned(),
        ]
    }

    /// aria2 input-file entry: the URI followed by indented per-URI options.
    fn input_file(request: &TransferRequest<'_>, out: &str) -> Result<String, TransferError> {
        let mut input = format!("{}\n  out={out}\n", request.url);
        if let Some(creds) = request.credentials {
            if [&creds.username, &creds.password]
                .iter()
                .any(|value| value.contains(['\n', '\r']))
            {
                return Err(TransferError::Auth(format!(
                    "credentials for {} contain a line break",
                    request.url
                )));
            }
            let scheme = if request.url.starts_with("ftp://") {
                "ftp"
            } else {
                "http"
            };
            input.push_str(&format!("  {scheme}-user={}\n", creds.username));
            input.push_str(&format!("  {scheme}-passwd={}\n", creds.password));
        }
        Ok(input)
    }
}

#[async_trait]
impl Transfer for Aria2Transfer {
    async fn fetch(
        &self,
        request: &TransferRequest<'_>,
        cancel: &CancelFlag,
    ) -> Result<TransferOutcome, TransferError> {
        let part = part_path(request.destination);
        let (Some(dir), Some(out)) = (part.parent(), part.file_name()) else {
            return Err(TransferError::Disk(format!(
                "invalid destination {}",
                request.destination.display()
            )));
        };
        fs::create_dir_all(dir)
            .await
            .map_err(|e| TransferError::Disk(format!("failed to create download dir: {e}")))?;
        let start = fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);

        let args = self.build_args(request, dir);
        let input = Self::input_file(request, &out.to_string_lossy())?;
        info!(
            "aria2 transfer: {} with {} connection(s)",
            request.url,
            request.connections.max(1)
        );
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransferError::permanent(format!(
                    "failed to run {}: {e}",
                    self.binary.display()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| TransferError::network(format!("failed to feed aria2c: {e}")))?;
            // Dropping the handle closes the pipe; aria2 starts at EOF.
        }

        let stderr = child.stderr.take();
        let stderr_reader = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut text).await;
            }
            text
        });

        let started = Instant::now();
        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| TransferError::network(format!("aria2c wait failed: {e}")))?;
                }
                _ = tokio::time::sleep(CANCEL_POLL) => {
                    if cancel_requested(cancel) {
                        let _ = child.kill().await;
                        debug!("aria2 transfer: cancelled {}; keeping {}", request.url, part.display());
                        return Err(TransferError::Cancelled);
                    }
                    if started.elapsed() > self.timeout {
                        let _ = child.kill().await;
                        return Err(TransferError::network(format!(
                            "{} timed out after {}s",
                            request.url,
                            self.timeout.as_secs()
                        )));
                    }
                }
            }
        };
        let stderr = stderr_reader.await.unwrap_or_default();

        if !status.success() {
            return Err(classify_exit(status, request.url, stderr.trim()));
        }

        let size = fs::metadata(&part)
            .await
            .map(|m| m.len())
            .map_err(|e| TransferError::Disk(format!("aria2c left no output: {e}")))?;
        fs::rename(&part, request.destination).await.map_err(|e| {
            TransferError::Disk(format!("failed to move {} into place: {e}", part.display()))
        })?;
        Ok(TransferOutcome {
            bytes_on_disk: size,
            bytes_transferred: size.saturating_sub(start),
            already_present: false,
        })
    }
}

/// Map aria2's documented exit codes onto the transfer taxonomy.
fn classify_exit(status: ExitStatus, url: &str, stderr: &str) -> TransferError {
    let code = status.code();
    let detail = if stderr.is_empty() {
        format!("aria2c exited with {status} for {url}")
    } else {
        format!("aria2c exited with {status} for {url}: {stderr}")
    };
    match code {
        Some(24) => TransferError::Auth(detail),
        Some(9 | 15 | 16 | 17 | 18) => TransferError::Disk(detail),
        Some(3) => TransferError::permanent(detail),
        _ => TransferError::network(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::models::Credentials;

    fn backend() -> Aria2Transfer {
        Aria2Transfer::new(&TransferOptions {
            split: 4,
            min_split_size: "5M".into(),
            ..TransferOptions::default()
        })
    }

    fn request<'a>(url: &'a str, dest: &'a Path, creds: Option<&'a Credentials>) -> TransferRequest<'a> {
        TransferRequest {
            url,
            destination: dest,
            credentials: creds,
            connections: 8,
            resume: true,
            expected_size: None,
            progress: None,
        }
    }

    #[test]
    fn builds_resumable_multi_connection_args() {
        let creds = Credentials::new("gpcr", "xtal");
        let dest = Path::new("/cache/zinc/H04/H04M500.smi.gz");
        let url = "http://files.docking.org/2D/H0/H04M500.smi.gz";

        let args = backend().build_args(
            &request(url, dest, Some(&creds)),
            Path::new("/cache/zinc/H04"),
        );

        for expected in [
            "--continue=true",
            "--dir=/cache/zinc/H04",
            "--max-connection-per-server=8",
            "--split=8",
            "--min-split-size=5M",
            "--max-tries=1",
            "--input-file=-",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }
        assert!(!args.iter().any(|a| a.contains("xtal") || a.contains("gpcr")));
        assert!(!args.iter().any(|a| a.contains(url)));
    }

    #[test]
    fn credentials_travel_in_the_input_file() {
        let creds = Credentials::new("gpcr", "xtal");
        let url = "http://files.docking.org/2D/H0/H04M500.smi.gz";
        let dest = Path::new("/c/H04M500.smi.gz");

        let input =
            Aria2Transfer::input_file(&request(url, dest, Some(&creds)), "H04M500.smi.gz.part")
                .unwrap();

        assert_eq!(
            input,
            format!("{url}\n  out=H04M500.smi.gz.part\n  http-user=gpcr\n  http-passwd=xtal\n")
        );
        let anonymous = Aria2Transfer::input_file(&request(url, dest, None), "x.part").unwrap();
        assert!(!anonymous.contains("user="));
    }

    #[test]
    fn ftp_urls_use_ftp_credentials() {
        let creds = Credentials::new("anonymous", "me@example.org");
        let input = Aria2Transfer::input_file(
            &request("ftp://ftp.ebi.ac.uk/pub/chembl_34.sdf.gz", Path::new("/c/x"), Some(&creds)),
            "x.part",
        )
        .unwrap();
        assert!(input.contains("  ftp-user=anonymous\n"));
        assert!(!input.contains("http-user"));
    }

    #[test]
    fn rejects_credentials_that_would_break_the_input_file() {
        let creds = Credentials::new("gpcr", "xtal\n  dir=/etc");
        let err = Aria2Transfer::input_file(
            &request("http://x.test/a.smi", Path::new("/c/a.smi"), Some(&creds)),
            "a.smi.part",
        )
        .unwrap_err();
        assert_eq!(err.kind(), "auth_error");
    }

    #[cfg(unix)]
    #[test]
    fn maps_exit_codes_onto_error_kinds() {
        use std::os::unix::process::ExitStatusExt;

        let status = |code: i32| ExitStatus::from_raw(code << 8);
        assert_eq!(classify_exit(status(24), "u", "").kind(), "auth_error");
        assert_eq!(classify_exit(status(9), "u", "").kind(), "disk_error");
        assert!(!classify_exit(status(3), "u", "").is_retryable());
        assert!(classify_exit(status(6), "u", "net down").is_retryable());
    }
}
