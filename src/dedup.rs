use std::collections::HashMap;
use std::collections::hash_map::Entry;

use log::{debug, warn};

use crate::engine::models::{ChecksumAlgorithm, DownloadTarget, SidecarRef, TargetId};

/// Collapse raw manifest targets into one unit of work per artifact.
///
/// Digest sidecars listed as their own lines are folded into the archive they
/// describe. Entries sharing an identity key are merged field by field, so
/// whichever sighting carried credentials or checksum data wins. First-seen
/// order is preserved.
pub fn dedupe(targets: Vec<DownloadTarget>) -> Vec<DownloadTarget> {
    let total = targets.len();
    let mut order: Vec<TargetId> = Vec::with_capacity(total);
    let mut merged: HashMap<TargetId, DownloadTarget> = HashMap::with_capacity(total);
    let mut sidecars: Vec<(TargetId, SidecarRef)> = Vec::new();

    for target in targets {
        if let Some((algorithm, _)) = ChecksumAlgorithm::from_sidecar_name(target.file_name()) {
            if let Some(archive) = target.id.path.strip_suffix(algorithm.sidecar_suffix()) {
                let archive_id = TargetId::new(target.id.source_id.clone(), archive);
                sidecars.push((
                    archive_id,
                    SidecarRef {
                        url: target.remote_url,
                        algorithm,
                    },
                ));
                continue;
            }
        }

        match merged.entry(target.id.clone()) {
            Entry::Vacant(slot) => {
                order.push(target.id.clone());
                slot.insert(target);
            }
            Entry::Occupied(mut slot) => merge(slot.get_mut(), target),
        }
    }

    for (archive_id, sidecar) in sidecars {
        match merged.get_mut(&archive_id) {
            Some(archive) => {
                if archive.sidecar.is_none() {
                    archive.sidecar = Some(sidecar);
                }
            }
            None => warn!(
                "dedup: dropping checksum file {} with no matching archive",
                sidecar.url
            ),
        }
    }

    let unique: Vec<DownloadTarget> = order
        .into_iter()
        .filter_map(|id| merged.remove(&id))
        .collect();
    debug!("dedup: {total} raw entries -> {} targets", unique.len());
    unique
}

fn merge(existing: &mut DownloadTarget, other: DownloadTarget) {
    if existing.remote_url != other.remote_url {
        debug!(
            "dedup: {} listed from both {} and {}; keeping the first",
            existing.id, existing.remote_url, other.remote_url
        );
    }
    if existing.credentials.is_none() {
        existing.credentials = other.credentials;
    }
    if existing.expected_checksum.is_none() {
        existing.expected_checksum = other.expected_checksum;
    }
    if existing.sidecar.is_none() {
        existing.sidecar = other.sidecar;
    }
}
