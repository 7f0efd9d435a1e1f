//! Durable per-source checkpoints.
//!
//! One JSON document per source lives at `<checkpoint_dir>/<source_id>.json`.
//! Every mutation rewrites the document through a temp file in the same
//! directory followed by an atomic rename, so readers only ever see a whole
//! snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::engine::models::TargetId;
use crate::error::CheckpointError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Pending,
    InProgress,
    Verified,
    Failed,
}

impl TargetStatus {
    pub fn label(self) -> &'static str {
        match self {
            TargetStatus::Pending => "pending",
            TargetStatus::InProgress => "in_progress",
            TargetStatus::Verified => "verified",
            TargetStatus::Failed => "failed",
        }
    }

    /// Forward-only, except that a failed target may be retried. An entry
    /// left `in_progress` by an interrupted run may start again.
    pub fn can_transition_to(self, next: TargetStatus) -> bool {
        use TargetStatus::*;
        matches!(
            (self, next),
            (Pending, Pending | InProgress)
                | (InProgress, InProgress | Verified | Failed)
                | (Failed, Failed | InProgress)
                | (Verified, Verified)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub target_id: TargetId,
    pub status: TargetStatus,
    /// Attempts across every run, not just the latest.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl CheckpointEntry {
    pub fn pending(target_id: TargetId) -> Self {
        Self {
            target_id,
            status: TargetStatus::Pending,
            attempts: 0,
            last_error: None,
            completed_at: None,
            size_bytes: None,
        }
    }

    pub fn started(mut self) -> Self {
        self.status = TargetStatus::InProgress;
        self
    }

    pub fn verified(mut self, attempts: u32, size_bytes: u64) -> Self {
        self.status = TargetStatus::Verified;
        self.attempts += attempts;
        self.last_error = None;
        self.completed_at = Some(Utc::now());
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn failed(mut self, attempts: u32, error: impl Into<String>) -> Self {
        self.status = TargetStatus::Failed;
        self.attempts += attempts;
        self.last_error = Some(error.into());
        self
    }

    /// The run stopped mid-transfer; the entry stays `in_progress` and
    /// resumes next time.
    pub fn interrupted(mut self, attempts: u32) -> Self {
        self.attempts += attempts;
        self
    }

    pub fn is_verified(&self) -> bool {
        self.status == TargetStatus::Verified
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCheckpoint {
    pub source_id: String,
    pub source_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Keyed by target path so the file is stable across runs.
    #[serde(default)]
    pub entries: BTreeMap<String, CheckpointEntry>,
}

impl SourceCheckpoint {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_owned(),
            source_complete: false,
            completed_at: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn count(&self, status: TargetStatus) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.status == status)
            .count()
    }
}

/// Checkpoint documents for every source touched by this process.
///
/// Not internally synchronised; share it as
/// `Arc<tokio::sync::Mutex<CheckpointStore>>` so writers are serialised.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    sources: HashMap<String, SourceCheckpoint>,
    /// Bytes last read from or written to disk, per source.
    on_disk: HashMap<String, Vec<u8>>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sources: HashMap::new(),
            on_disk: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, source_id: &str) -> PathBuf {
        self.dir.join(format!("{source_id}.json"))
    }

    /// Load a source's checkpoint, starting fresh when none exists.
    ///
    /// A file that does not parse is moved aside as
    /// `<source>.json.corrupt-<timestamp>` rather than discarded.
    pub fn load(&mut self, source_id: &str) -> Result<&SourceCheckpoint, CheckpointError> {
        if !self.sources.contains_key(source_id) {
            let checkpoint = self.read_from_disk(source_id)?;
            self.sources.insert(source_id.to_owned(), checkpoint);
        }
        self.sources
            .get(source_id)
            .ok_or_else(|| CheckpointError::Io {
                path: self.path_for(source_id),
                source: io::Error::other("checkpoint vanished after load"),
            })
    }

    fn read_from_disk(&mut self, source_id: &str) -> Result<SourceCheckpoint, CheckpointError> {
        let path = self.path_for(source_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("checkpoint: no checkpoint for {source_id} yet");
                return Ok(SourceCheckpoint::new(source_id));
            }
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };

        match serde_json::from_slice::<SourceCheckpoint>(&bytes) {
            Ok(checkpoint) if checkpoint.source_id == source_id => {
                debug!(
                    "checkpoint: loaded {source_id} ({} entries, complete={})",
                    checkpoint.entries.len(),
                    checkpoint.source_complete
                );
                self.on_disk.insert(source_id.to_owned(), bytes);
                Ok(checkpoint)
            }
            Ok(other) => {
                self.quarantine(
                    &path,
                    &format!("belongs to source '{}'", other.source_id),
                )?;
                Ok(SourceCheckpoint::new(source_id))
            }
            Err(err) => {
                self.quarantine(&path, &err.to_string())?;
                Ok(SourceCheckpoint::new(source_id))
            }
        }
    }

    fn quarantine(&self, path: &Path, reason: &str) -> Result<(), CheckpointError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".corrupt-{stamp}"));
        let moved = PathBuf::from(name);
        fs::rename(path, &moved).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        warn!(
            "checkpoint: {} is invalid ({reason}); moved to {} and starting fresh",
            path.display(),
            moved.display()
        );
        Ok(())
    }

    pub fn get(&self, target_id: &TargetId) -> Option<&CheckpointEntry> {
        self.sources
            .get(&target_id.source_id)?
            .entries
            .get(&target_id.path)
    }

    pub fn snapshot(&self, source_id: &str) -> Option<&SourceCheckpoint> {
        self.sources.get(source_id)
    }

    pub fn is_source_complete(&self, source_id: &str) -> bool {
        self.sources
            .get(source_id)
            .is_some_and(|checkpoint| checkpoint.source_complete)
    }

    /// Insert or replace an entry and write the source's checkpoint.
    pub fn upsert(&mut self, entry: CheckpointEntry) -> Result<(), CheckpointError> {
        let source_id = entry.target_id.source_id.clone();
        self.load(&source_id)?;
        let Some(checkpoint) = self.sources.get_mut(&source_id) else {
            return Ok(());
        };

        if let Some(existing) = checkpoint.entries.get(&entry.target_id.path) {
            if existing == &entry {
                return Ok(());
            }
            if !existing.status.can_transition_to(entry.status) {
                return Err(CheckpointError::Transition {
                    target: entry.target_id.to_string(),
                    from: existing.status.label(),
                    to: entry.status.label(),
                });
            }
        }
        if entry.status != TargetStatus::Verified {
            checkpoint.source_complete = false;
            checkpoint.completed_at = None;
        }
        checkpoint
            .entries
            .insert(entry.target_id.path.clone(), entry);
        self.persist(&source_id)
    }

    /// Add a `pending` entry for every id not yet tracked, then write each
    /// touched source once. Returns how many entries were added.
    pub fn register<I>(&mut self, ids: I) -> Result<usize, CheckpointError>
    where
        I: IntoIterator<Item = TargetId>,
    {
        let mut added = 0usize;
        let mut touched: Vec<String> = Vec::new();
        for id in ids {
            self.load(&id.source_id)?;
            let Some(checkpoint) = self.sources.get_mut(&id.source_id) else {
                continue;
            };
            if checkpoint.entries.contains_key(&id.path) {
                continue;
            }
            checkpoint.source_complete = false;
            checkpoint.completed_at = None;
            if !touched.contains(&id.source_id) {
                touched.push(id.source_id.clone());
            }
            checkpoint
                .entries
                .insert(id.path.clone(), CheckpointEntry::pending(id));
            added += 1;
        }
        for source_id in &touched {
            self.persist(source_id)?;
        }
        if added > 0 {
            debug!("checkpoint: registered {added} new target(s)");
        }
        Ok(added)
    }

    /// Flag a source whose every entry is verified. Returns `false` and
    /// leaves the checkpoint alone otherwise.
    pub fn mark_source_complete(&mut self, source_id: &str) -> Result<bool, CheckpointError> {
        self.load(source_id)?;
        let Some(checkpoint) = self.sources.get_mut(source_id) else {
            return Ok(false);
        };
        let all_verified =
            !checkpoint.entries.is_empty() && checkpoint.entries.values().all(CheckpointEntry::is_verified);
        if !all_verified {
            return Ok(false);
        }
        if !checkpoint.source_complete {
            checkpoint.source_complete = true;
            checkpoint.completed_at = Some(Utc::now());
            info!("checkpoint: source {source_id} complete");
        }
        self.persist(source_id)?;
        Ok(true)
    }

    /// Write every loaded source whose snapshot differs from disk.
    pub fn save(&mut self) -> Result<(), CheckpointError> {
        let ids: Vec<String> = self.sources.keys().cloned().collect();
        for source_id in ids {
            self.persist(&source_id)?;
        }
        Ok(())
    }

    /// Explicit cache-clear: forget a source's checkpoint entirely.
    pub fn clear(&mut self, source_id: &str) -> Result<bool, CheckpointError> {
        self.sources.remove(source_id);
        self.on_disk.remove(source_id);
        let path = self.path_for(source_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("checkpoint: cleared {}", path.display());
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }

    fn persist(&mut self, source_id: &str) -> Result<(), CheckpointError> {
        let Some(checkpoint) = self.sources.get(source_id) else {
            return Ok(());
        };
        let mut bytes =
            serde_json::to_vec_pretty(checkpoint).map_err(|source| CheckpointError::Serialize {
                source_id: source_id.to_owned(),
                source,
            })?;
        bytes.push(b'\n');
        if self.on_disk.get(source_id) == Some(&bytes) {
            return Ok(());
        }

        let path = self.path_for(source_id);
        write_atomic(&self.dir, &path, &bytes)?;
        self.on_disk.insert(source_id.to_owned(), bytes);
        Ok(())
    }
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let io_err = |source: io::Error| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|err| io_err(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(path: &str) -> TargetId {
        TargetId::new("chembl", path)
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::new(dir.path());
        store.load("chembl").unwrap();
        let entry = CheckpointEntry::pending(id("chembl_34.sdf.gz")).started();
        store.upsert(entry.clone()).unwrap();
        store.upsert(entry.verified(2, 1_024)).unwrap();

        let mut reopened = CheckpointStore::new(dir.path());
        let checkpoint = reopened.load("chembl").unwrap();
        let stored = &checkpoint.entries["chembl_34.sdf.gz"];
        assert_eq!(stored.status, TargetStatus::Verified);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.size_bytes, Some(1_024));
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn registers_new_targets_in_one_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::new(dir.path());
        store
            .upsert(CheckpointEntry::pending(id("a")).started().verified(1, 1))
            .unwrap();

        let ids = (0..2_000).map(|n| id(&format!("part_{n:05}.sdf.gz")));
        let added = store.register(ids.chain([id("a")])).unwrap();

        assert_eq!(added, 2_000);
        let mut reopened = CheckpointStore::new(dir.path());
        let checkpoint = reopened.load("chembl").unwrap();
        assert_eq!(checkpoint.entries.len(), 2_001);
        assert_eq!(checkpoint.count(TargetStatus::Pending), 2_000);
        assert!(checkpoint.entries["a"].is_verified());
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);

        assert_eq!(store.register([id("part_00000.sdf.gz")]).unwrap(), 0);
    }

    #[test]
    fn rejects_backwards_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::new(dir.path());
        let entry = CheckpointEntry::pending(id("a")).started().verified(1, 1);
        store.upsert(entry.clone()).unwrap();

        let err = store
            .upsert(CheckpointEntry::pending(id("a")))
            .unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Transition {
                from: "verified",
                to: "pending",
                ..
            }
        ));

        let failed = CheckpointEntry::pending(id("b")).started().failed(3, "timeout");
        store.upsert(failed.clone()).unwrap();
        store.upsert(failed.started()).unwrap();
    }

    #[test]
    fn completes_only_when_everything_is_verified() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::new(dir.path());
        store
            .upsert(CheckpointEntry::pending(id("a")).started().verified(1, 1))
            .unwrap();
        store.upsert(CheckpointEntry::pending(id("b"))).unwrap();
        assert!(!store.mark_source_complete("chembl").unwrap());
        assert!(!store.is_source_complete("chembl"));

        let started = CheckpointEntry::pending(id("b")).started();
        store.upsert(started.clone()).unwrap();
        store.upsert(started.verified(1, 1)).unwrap();
        assert!(store.mark_source_complete("chembl").unwrap());
        assert!(store.is_source_complete("chembl"));
    }

    #[test]
    fn unchanged_snapshots_are_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::new(dir.path());
        store
            .upsert(CheckpointEntry::pending(id("a")).started().verified(1, 1))
            .unwrap();
        store.mark_source_complete("chembl").unwrap();
        let path = store.path_for("chembl");
        let before = fs::read(&path).unwrap();
        let modified = fs::metadata(&path).unwrap().modified().unwrap();

        let mut reopened = CheckpointStore::new(dir.path());
        reopened.load("chembl").unwrap();
        reopened.mark_source_complete("chembl").unwrap();
        reopened.save().unwrap();

        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), modified);
    }

    #[test]
    fn quarantines_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("chembl.json"), b"{\"source_id\": \"chem").unwrap();

        let mut store = CheckpointStore::new(dir.path());
        let checkpoint = store.load("chembl").unwrap();
        assert!(checkpoint.entries.is_empty());

        let quarantined: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("chembl.json.corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);
        assert!(!dir.path().join("chembl.json").exists());
    }

    #[test]
    fn clear_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::new(dir.path());
        store.upsert(CheckpointEntry::pending(id("a"))).unwrap();
        assert!(store.clear("chembl").unwrap());
        assert!(!store.path_for("chembl").exists());
        assert!(!store.clear("chembl").unwrap());
        assert!(store.get(&id("a")).is_none());
    }
}
