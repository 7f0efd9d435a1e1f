use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Problems found while reading a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// A single line could not be turned into a target. Soft: the rest of the
    /// manifest is still read.
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    /// No target survived a full pass. Hard: aborts the source.
    #[error("manifest for source '{source_id}' produced no download targets")]
    Empty { source_id: String },
    #[error("unable to read manifest {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("malformed credential on line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("source '{source_id}' requires authentication but {target} has no credentials")]
    Missing { source_id: String, target: String },
}

/// Failure taxonomy reported by the transfer capability.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {reason}")]
    Network { reason: String, transient: bool },
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("disk error: {0}")]
    Disk(String),
    /// The bytes arrived but do not match the expected digest.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        last: Box<TransferError>,
    },
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
            transient: true,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
            transient: false,
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Network {
                transient: true,
                ..
            } | TransferError::ChecksumMismatch { .. }
        )
    }

    /// Short machine-friendly label used in summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Network { .. } => "network_error",
            TransferError::Auth(_) => "auth_error",
            TransferError::Disk(_) => "disk_error",
            TransferError::ChecksumMismatch { .. } => "checksum_mismatch",
            TransferError::ExhaustedRetries { .. } => "exhausted_retries",
            TransferError::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("checksum read error for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize checkpoint for '{source_id}': {source}")]
    Serialize {
        source_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("illegal status transition for {target}: {from} -> {to}")]
    Transition {
        target: String,
        from: &'static str,
        to: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid ingestion config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(TransferError::network("reset").is_retryable());
        assert!(
            TransferError::ChecksumMismatch {
                expected: "aa".into(),
                actual: "bb".into(),
            }
            .is_retryable()
        );
        assert!(!TransferError::permanent("404").is_retryable());
        assert!(!TransferError::Auth("401".into()).is_retryable());
        assert!(!TransferError::Disk("full".into()).is_retryable());
        assert!(!TransferError::Cancelled.is_retryable());
    }

    #[test]
    fn exhausted_retries_reports_last_failure() {
        let err = TransferError::ExhaustedRetries {
            attempts: 3,
            last: Box::new(TransferError::network("timed out")),
        };
        assert_eq!(err.kind(), "exhausted_retries");
        assert_eq!(
            err.to_string(),
            "gave up after 3 attempts: network error: timed out"
        );
    }
}
