use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identity key of a download target: the owning source plus the
/// `/`-separated path relative to that source's cache directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId {
    pub source_id: String,
    pub path: String,
}

impl TargetId {
    pub fn new(source_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.path)
    }
}

/// Basic-auth credential bundle. Not serialisable; `Debug` redacts the
/// password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn label(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    /// File suffix of a sidecar carrying this digest, including the dot.
    pub fn sidecar_suffix(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => ".md5",
            ChecksumAlgorithm::Sha256 => ".sha256",
        }
    }

    /// Length of the lowercase hex digest.
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Md5 => 32,
            ChecksumAlgorithm::Sha256 => 64,
        }
    }

    pub fn from_sidecar_name(name: &str) -> Option<(Self, &str)> {
        [ChecksumAlgorithm::Md5, ChecksumAlgorithm::Sha256]
            .into_iter()
            .find_map(|algorithm| {
                name.strip_suffix(algorithm.sidecar_suffix())
                    .filter(|stem| !stem.is_empty())
                    .map(|stem| (algorithm, stem))
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    pub algorithm: ChecksumAlgorithm,
    pub expected_digest: String,
}

impl ChecksumRecord {
    pub fn new(algorithm: ChecksumAlgorithm, digest: &str) -> Self {
        Self {
            algorithm,
            expected_digest: digest.trim().to_ascii_lowercase(),
        }
    }
}

/// A remote digest file that has not been fetched yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarRef {
    pub url: String,
    pub algorithm: ChecksumAlgorithm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Shell lines embedding a `wget`/`curl` invocation.
    Command,
    /// HTML directory listing.
    Listing,
    /// One URL per line.
    Plain,
}

/// One archive to mirror.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadTarget {
    pub id: TargetId,
    pub remote_url: String,
    pub local_path: PathBuf,
    pub credentials: Option<Credentials>,
    pub expected_checksum: Option<ChecksumRecord>,
    pub sidecar: Option<SidecarRef>,
    /// Manifest line the target came from, for diagnostics.
    pub line: usize,
}

impl DownloadTarget {
    pub fn file_name(&self) -> &str {
        self.id
            .path
            .rsplit('/')
            .next()
            .unwrap_or(self.id.path.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::new("gpcr", "xtal");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("gpcr"));
        assert!(!rendered.contains("xtal"));
    }

    #[test]
    fn recognises_sidecar_names() {
        assert_eq!(
            ChecksumAlgorithm::from_sidecar_name("chunk.sdf.gz.md5"),
            Some((ChecksumAlgorithm::Md5, "chunk.sdf.gz"))
        );
        assert_eq!(
            ChecksumAlgorithm::from_sidecar_name("a.sha256"),
            Some((ChecksumAlgorithm::Sha256, "a"))
        );
        assert_eq!(ChecksumAlgorithm::from_sidecar_name(".md5"), None);
        assert_eq!(ChecksumAlgorithm::from_sidecar_name("a.sdf.gz"), None);
    }
}
