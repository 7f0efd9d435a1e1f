//! Newline-delimited URL lists (ChEMBL link files, ZINC `.uri` files).
//!
//! A line may carry an inline digest after the URL, `md5:<hex>` or
//! `sha256=<hex>`.

use crate::engine::models::{ChecksumAlgorithm, ChecksumRecord};
use crate::error::ManifestError;

use super::{ParseContext, ParsedManifest, build_target};

pub(super) fn parse(content: &str, ctx: &ParseContext<'_>) -> ParsedManifest {
    let mut parsed = ParsedManifest::default();

    for (index, raw) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(url) = fields.next() else {
            continue;
        };

        let mut target = match build_target(ctx, url, None, line_no) {
            Ok(target) => target,
            Err(err) => {
                parsed.errors.push(err);
                continue;
            }
        };
        if let Some(declared) = fields.next() {
            match inline_checksum(declared) {
                Some(record) => target.expected_checksum = Some(record),
                None => {
                    parsed.errors.push(ManifestError::Parse {
                        line: line_no,
                        reason: format!("unrecognised checksum declaration '{declared}'"),
                    });
                    continue;
                }
            }
        }
        parsed.targets.push(target);
    }

    parsed
}

fn inline_checksum(declared: &str) -> Option<ChecksumRecord> {
    let (label, digest) = declared.split_once([':', '='])?;
    let algorithm = match label.to_ascii_lowercase().as_str() {
        "md5" => ChecksumAlgorithm::Md5,
        "sha256" => ChecksumAlgorithm::Sha256,
        _ => return None,
    };
    let is_hex = digest.len() == algorithm.hex_len()
        && digest.chars().all(|c| c.is_ascii_hexdigit());
    is_hex.then(|| ChecksumRecord::new(algorithm, digest))
}
