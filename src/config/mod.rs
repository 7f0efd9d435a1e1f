//! Ingestion job configuration.
//!
//! Jobs are described in YAML under a top-level `job` key:
//!
//! ```yaml
//! job:
//!   cache_dir: ./downloads
//!   checkpoint_dir: ./checkpoints
//!   max_parallel_transfers: 4
//!   transfer:
//!     backend: aria2
//!     connections: 8
//!   sources:
//!     - id: zinc-h04
//!       manifest: manifests/ZINC-downloader-2D-smi.wget
//!       dialect: command
//! ```

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::models::{ChecksumAlgorithm, Credentials, Dialect};
use crate::error::ConfigError;

#[derive(Debug, Deserialize)]
struct JobFile {
    job: JobConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct JobConfig {
    #[serde(default = "crate::env::cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "crate::env::checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_parallel_transfers")]
    pub max_parallel_transfers: usize,
    #[serde(default)]
    pub transfer: TransferOptions,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub sources: Vec<SourceConfig>,
}

impl JobConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_transfers == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_transfers must be greater than zero".into(),
            ));
        }
        if self.transfer.connections == 0 {
            return Err(ConfigError::Invalid(
                "transfer.connections must be greater than zero".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(ConfigError::Invalid("source ids must not be empty".into()));
            }
            if source.id.contains(['/', '\\']) {
                return Err(ConfigError::Invalid(format!(
                    "source id '{}' must not contain path separators",
                    source.id
                )));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "source ids must be unique ('{}' repeats)",
                    source.id
                )));
            }
        }
        Ok(())
    }

    /// Cache directory holding one source's archives.
    pub fn source_cache_dir(&self, source: &SourceConfig) -> PathBuf {
        self.cache_dir
            .join(source.cache_subdir.as_deref().unwrap_or(&source.id))
    }
}

fn default_parallel_transfers() -> usize {
    4
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferBackend {
    /// In-process HTTP client with range-request resume.
    #[default]
    Http,
    /// `aria2c` subprocess for multi-connection transfers.
    Aria2,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    pub backend: TransferBackend,
    /// Connections per transfer. Multiplies with `max_parallel_transfers`.
    pub connections: u32,
    pub split: u32,
    pub min_split_size: String,
    pub timeout_secs: u64,
    pub aria2_path: PathBuf,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            backend: TransferBackend::Http,
            connections: 4,
            split: 4,
            min_split_size: "1M".into(),
            timeout_secs: 30 * 60,
            aria2_path: PathBuf::from("aria2c"),
        }
    }
}

impl TransferOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingChecksum {
    /// Accept the archive unverified.
    #[default]
    Skip,
    /// Record the target as failed.
    Require,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChecksumConfig {
    pub algorithm: ChecksumAlgorithm,
    /// Look for `<url>.<algorithm>` next to archives the manifest did not
    /// pair with a sidecar. Directory listings only pair anchors they contain.
    pub probe_sidecar: bool,
    pub missing: MissingChecksum,
}

impl Default for ChecksumConfig {
    fn default() -> Self {
        Self {
            algorithm: ChecksumAlgorithm::Md5,
            probe_sidecar: true,
            missing: MissingChecksum::Skip,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CredentialConfig {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Environment variable holding the password; wins over `password`.
    #[serde(default)]
    pub password_env: Option<String>,
}

impl CredentialConfig {
    pub fn resolve(&self) -> Option<Credentials> {
        if self.username.is_empty() {
            return None;
        }
        let password = self
            .password_env
            .as_deref()
            .and_then(|name| env::var(name).ok())
            .or_else(|| self.password.clone())
            .unwrap_or_default();
        Some(Credentials::new(self.username.clone(), password))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub manifest: PathBuf,
    #[serde(default)]
    pub dialect: Option<Dialect>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_archive_suffixes")]
    pub archive_suffixes: Vec<String>,
    #[serde(default)]
    pub cache_subdir: Option<String>,
    #[serde(default)]
    pub credentials: Option<CredentialConfig>,
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default)]
    pub checksum: ChecksumConfig,
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, manifest: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            manifest: manifest.into(),
            dialect: None,
            base_url: None,
            archive_suffixes: default_archive_suffixes(),
            cache_subdir: None,
            credentials: None,
            require_auth: false,
            checksum: ChecksumConfig::default(),
        }
    }
}

fn default_archive_suffixes() -> Vec<String> {
    [".sdf.gz", ".sdf", ".smi.gz", ".smi", ".txt.gz", ".txt"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

/// Load and validate a job definition from a YAML file.
pub fn load_config(path: &Path) -> Result<JobConfig, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&String::from_utf8_lossy(&bytes))
}

pub fn parse_config(text: &str) -> Result<JobConfig, ConfigError> {
    let file: JobFile = serde_yaml::from_str(text)?;
    file.job.validate()?;
    Ok(file.job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_with_defaults() {
        let job = parse_config(
            r#"
job:
  cache_dir: /data/cache
  checkpoint_dir: /data/checkpoints
  sources:
    - id: chembl
      manifest: chembl.txt
      dialect: plain
"#,
        )
        .unwrap();

        assert_eq!(job.max_parallel_transfers, 4);
        assert_eq!(job.transfer.backend, TransferBackend::Http);
        assert_eq!(job.retry, RetryPolicy::default());
        let source = &job.sources[0];
        assert_eq!(source.dialect, Some(Dialect::Plain));
        assert!(source.checksum.probe_sidecar);
        assert_eq!(
            job.source_cache_dir(source),
            PathBuf::from("/data/cache/chembl")
        );
    }

    #[test]
    fn parses_transfer_and_credentials() {
        let job = parse_config(
            r#"
job:
  max_parallel_transfers: 2
  transfer:
    backend: aria2
    connections: 16
  retry:
    max_attempts: 3
  sources:
    - id: zinc
      manifest: zinc.wget
      cache_subdir: zinc-2d
      require_auth: true
      credentials:
        username: gpcr
        password: xtal
      checksum:
        missing: require
"#,
        )
        .unwrap();

        assert_eq!(job.transfer.backend, TransferBackend::Aria2);
        assert_eq!(job.transfer.connections, 16);
        assert_eq!(job.transfer.split, 4);
        assert_eq!(job.retry.max_attempts, 3);
        assert_eq!(job.retry.initial_backoff_ms, 2_000);
        let source = &job.sources[0];
        assert!(source.require_auth);
        assert_eq!(source.checksum.missing, MissingChecksum::Require);
        let creds = source.credentials.as_ref().and_then(|c| c.resolve()).unwrap();
        assert_eq!(creds, Credentials::new("gpcr", "xtal"));
        assert!(job.source_cache_dir(source).ends_with("zinc-2d"));
    }

    #[test]
    fn rejects_duplicate_source_ids() {
        let err = parse_config(
            r#"
job:
  sources:
    - id: pubchem
      manifest: a.html
    - id: pubchem
      manifest: b.html
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unique"));
    }

    #[test]
    fn rejects_zero_parallelism() {
        let err = parse_config(
            r#"
job:
  max_parallel_transfers: 0
  sources: []
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
