//! Integrity checks for downloaded archives.

use std::fmt::Write as _;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::engine::models::{ChecksumAlgorithm, ChecksumRecord, DownloadTarget};
use crate::error::ChecksumError;
use crate::networking::TransferDriver;
use crate::util::CancelFlag;

const READ_BUF: usize = 64 * 1024;

/// Result of comparing a file against its expected digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verification {
    Verified,
    Mismatch { expected: String, actual: String },
    /// No digest was available to compare against.
    Skipped,
}

/// Extract the digest from sidecar content.
///
/// Accepts `md5sum` output (`<hex>  <name>`), BSD style
/// (`MD5 (<name>) = <hex>`) and bare digests.
pub fn parse_sidecar(content: &str, algorithm: ChecksumAlgorithm) -> Option<ChecksumRecord> {
    content
        .split(|c: char| c.is_whitespace() || c == '=')
        .map(|token| token.trim_start_matches('*'))
        .find(|token| {
            token.len() == algorithm.hex_len() && token.chars().all(|c| c.is_ascii_hexdigit())
        })
        .map(|digest| ChecksumRecord::new(algorithm, digest))
}

/// Stream `path` through the given hash. Runs on the blocking pool.
pub async fn digest_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, ChecksumError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || match algorithm {
        ChecksumAlgorithm::Md5 => hash_file::<Md5>(&owned),
        ChecksumAlgorithm::Sha256 => hash_file::<Sha256>(&owned),
    })
    .await
    .map_err(|err| ChecksumError::Io {
        path: path.to_path_buf(),
        source: io::Error::other(err),
    })?
}

fn hash_file<D: Digest>(path: &Path) -> Result<String, ChecksumError> {
    let io_err = |source: io::Error| ChecksumError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::open(path).map_err(io_err)?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let read = file.read(&mut buf).map_err(io_err)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

pub async fn verify(path: &Path, record: Option<&ChecksumRecord>) -> Result<Verification, ChecksumError> {
    let Some(record) = record else {
        return Ok(Verification::Skipped);
    };
    let actual = digest_file(path, record.algorithm).await?;
    if actual == record.expected_digest {
        debug!("checksum: {} {} ok", path.display(), record.algorithm.label());
        Ok(Verification::Verified)
    } else {
        Ok(Verification::Mismatch {
            expected: record.expected_digest.clone(),
            actual,
        })
    }
}

/// Local path a target's sidecar is stored at.
pub fn sidecar_path(target: &DownloadTarget, algorithm: ChecksumAlgorithm) -> PathBuf {
    let mut name = target.local_path.clone().into_os_string();
    name.push(algorithm.sidecar_suffix());
    PathBuf::from(name)
}

/// Work out the digest a target should be checked against.
///
/// Inline declarations win. Otherwise the sidecar is fetched through the
/// driver (or reused if an earlier run left it on disk). Any failure along
/// the way is logged and yields `None`, which downgrades verification to
/// [`Verification::Skipped`].
pub async fn resolve_record(
    target: &DownloadTarget,
    driver: &TransferDriver,
    cancel: &CancelFlag,
) -> Option<ChecksumRecord> {
    if let Some(record) = &target.expected_checksum {
        return Some(record.clone());
    }
    let sidecar = target.sidecar.as_ref()?;
    let local = sidecar_path(target, sidecar.algorithm);

    let cached = tokio::fs::metadata(&local)
        .await
        .map(|meta| meta.len() > 0)
        .unwrap_or(false);
    if !cached {
        let request = driver.request(&sidecar.url, &local, target.credentials.as_ref());
        if let Err(err) = driver.fetch_with_retry(&request, cancel, None, &mut |_: u32| {}).await {
            warn!(
                "checksum: {}: sidecar {} unavailable ({err}); verification skipped",
                target.id, sidecar.url
            );
            return None;
        }
    }

    let content = match tokio::fs::read(&local).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("checksum: unable to read {}: {err}", local.display());
            return None;
        }
    };
    let record = parse_sidecar(&String::from_utf8_lossy(&content), sidecar.algorithm);
    if record.is_none() {
        warn!(
            "checksum: {}: {} holds no {} digest; verification skipped",
            target.id,
            local.display(),
            sidecar.algorithm.label()
        );
        discard_sidecar(&local).await;
    }
    record
}

/// Remove an unusable sidecar so the next run fetches it again. Returns
/// whether the path is gone.
async fn discard_sidecar(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            warn!(
                "checksum: unable to discard {} ({err}); it will be reused until removed",
                path.display()
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::engine::models::{SidecarRef, TargetId};
    use crate::error::TransferError;
    use crate::networking::{Transfer, TransferOutcome, TransferRequest};

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";
    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn parses_common_sidecar_layouts() {
        let gnu = parse_sidecar(
            &format!("{EMPTY_MD5}  Compound_000000001_000500000.sdf.gz\n"),
            ChecksumAlgorithm::Md5,
        );
        let bsd = parse_sidecar(
            &format!("MD5 (Compound_000000001_000500000.sdf.gz) = {EMPTY_MD5}"),
            ChecksumAlgorithm::Md5,
        );
        let bare = parse_sidecar(&EMPTY_MD5.to_uppercase(), ChecksumAlgorithm::Md5);

        for record in [gnu, bsd, bare] {
            assert_eq!(record.unwrap().expected_digest, EMPTY_MD5);
        }
        assert!(parse_sidecar("<html>404</html>", ChecksumAlgorithm::Md5).is_none());
    }

    #[tokio::test]
    async fn verifies_matching_and_mismatching_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        let good = ChecksumRecord::new(ChecksumAlgorithm::Sha256, HELLO_SHA256);
        assert_eq!(
            verify(&path, Some(&good)).await.unwrap(),
            Verification::Verified
        );

        let bad = ChecksumRecord::new(ChecksumAlgorithm::Md5, EMPTY_MD5);
        assert!(matches!(
            verify(&path, Some(&bad)).await.unwrap(),
            Verification::Mismatch { .. }
        ));
        assert_eq!(verify(&path, None).await.unwrap(), Verification::Skipped);
    }

    /// Serves the same sidecar body for every request.
    struct SidecarServer(String);

    #[async_trait]
    impl Transfer for SidecarServer {
        async fn fetch(
            &self,
            request: &TransferRequest<'_>,
            _cancel: &CancelFlag,
        ) -> Result<TransferOutcome, TransferError> {
            std::fs::write(request.destination, &self.0).unwrap();
            Ok(TransferOutcome {
                bytes_on_disk: self.0.len() as u64,
                bytes_transferred: self.0.len() as u64,
                already_present: false,
            })
        }
    }

    #[tokio::test]
    async fn garbage_sidecar_is_discarded_and_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let target = DownloadTarget {
            id: TargetId::new("pubchem", "Compound_1.sdf.gz"),
            remote_url: "https://x.test/Compound_1.sdf.gz".into(),
            local_path: dir.path().join("Compound_1.sdf.gz"),
            credentials: None,
            expected_checksum: None,
            sidecar: Some(SidecarRef {
                url: "https://x.test/Compound_1.sdf.gz.md5".into(),
                algorithm: ChecksumAlgorithm::Md5,
            }),
            line: 1,
        };
        let local = sidecar_path(&target, ChecksumAlgorithm::Md5);
        std::fs::write(&local, "<html>404</html>").unwrap();
        let server = SidecarServer(format!("{EMPTY_MD5}  Compound_1.sdf.gz\n"));
        let driver = TransferDriver::new(Arc::new(server), 1, RetryPolicy::default(), 1);
        let cancel = Arc::new(AtomicBool::new(false));

        assert!(resolve_record(&target, &driver, &cancel).await.is_none());
        assert!(!local.exists());

        let record = resolve_record(&target, &driver, &cancel).await.unwrap();
        assert_eq!(record.expected_digest, EMPTY_MD5);
    }

    #[tokio::test]
    async fn reports_sidecars_it_cannot_discard() {
        let dir = tempfile::tempdir().unwrap();
        let stuck = dir.path().join("a.sdf.gz.md5");
        std::fs::create_dir_all(stuck.join("inner")).unwrap();
        let loose = dir.path().join("b.sdf.gz.md5");
        std::fs::write(&loose, "junk").unwrap();

        assert!(!discard_sidecar(&stuck).await);
        assert!(stuck.exists());
        assert!(discard_sidecar(&loose).await);
        assert!(discard_sidecar(&loose).await);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let record = ChecksumRecord::new(ChecksumAlgorithm::Md5, EMPTY_MD5);
        let err = verify(Path::new("/nonexistent/file"), Some(&record))
            .await
            .unwrap_err();
        assert!(matches!(err, ChecksumError::Io { .. }));
    }
}
