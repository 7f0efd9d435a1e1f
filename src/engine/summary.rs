use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;
use walkdir::WalkDir;

use crate::engine::state::SourceState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailedTarget {
    pub target: String,
    pub error: String,
}

/// What a cache directory currently holds. In-progress `.part` files and
/// aria2 control files are not counted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheSummary {
    pub path: PathBuf,
    pub file_count: usize,
    pub total_bytes: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SourceSummary {
    pub source_id: String,
    pub state: SourceState,
    /// Unique targets after deduplication.
    pub targets: usize,
    /// Verified during this run.
    pub verified: usize,
    /// Already verified by an earlier run and left untouched.
    pub skipped: usize,
    pub failed: usize,
    /// Never reached a verdict, e.g. because the run was cancelled.
    pub pending: usize,
    /// Verified without a digest to compare against.
    pub checksum_skipped: usize,
    pub malformed_lines: usize,
    pub bytes_transferred: u64,
    pub elapsed_ms: u64,
    pub failed_targets: Vec<FailedTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSummary>,
}

impl SourceSummary {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_owned(),
            state: SourceState::NotStarted,
            targets: 0,
            verified: 0,
            skipped: 0,
            failed: 0,
            pending: 0,
            checksum_skipped: 0,
            malformed_lines: 0,
            bytes_transferred: 0,
            elapsed_ms: 0,
            failed_targets: Vec::new(),
            error: None,
            cache: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.state,
            SourceState::PartialFailure | SourceState::Aborted
        )
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct JobSummary {
    pub sources: Vec<SourceSummary>,
    pub bytes_transferred: u64,
    pub elapsed_ms: u64,
}

impl JobSummary {
    pub fn has_failures(&self) -> bool {
        self.sources.iter().any(SourceSummary::is_failure)
    }
}

pub fn summarize_cache(dir: &Path) -> Option<CacheSummary> {
    if !dir.is_dir() {
        return None;
    }
    let mut summary = CacheSummary {
        path: dir.to_path_buf(),
        file_count: 0,
        total_bytes: 0,
    };
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.ends_with(".part") || name.ends_with(".aria2") {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => {
                summary.file_count += 1;
                summary.total_bytes += meta.len();
            }
            Err(err) => debug!("cache summary: skipping {}: {err}", entry.path().display()),
        }
    }
    Some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_finished_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("H04")).unwrap();
        std::fs::write(dir.path().join("H04/H04M500.smi.gz"), b"12345").unwrap();
        std::fs::write(dir.path().join("H04/H04M400.smi.gz.part"), b"12").unwrap();
        std::fs::write(dir.path().join("chembl.sdf.gz"), b"123").unwrap();

        let summary = summarize_cache(dir.path()).unwrap();
        assert_eq!(summary.file_count, 2);
        assert_eq!(summary.total_bytes, 8);
        assert!(summarize_cache(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn failures_drive_exit_status() {
        let mut ok = SourceSummary::new("a");
        ok.state = SourceState::Complete;
        let mut job = JobSummary {
            sources: vec![ok],
            bytes_transferred: 0,
            elapsed_ms: 0,
        };
        assert!(!job.has_failures());

        let mut partial = SourceSummary::new("b");
        partial.state = SourceState::PartialFailure;
        job.sources.push(partial);
        assert!(job.has_failures());
    }
}
