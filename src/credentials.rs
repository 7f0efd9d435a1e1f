use log::{debug, warn};

use crate::engine::models::{Credentials, DownloadTarget};
use crate::error::CredentialError;

/// Attach authentication to each target.
///
/// Credentials embedded in the manifest line win over the source-level
/// default; with neither the request goes out unauthenticated. Malformed
/// embedded credentials are warnings unless the source requires auth.
pub fn resolve(
    source_id: &str,
    mut targets: Vec<DownloadTarget>,
    source_default: Option<&Credentials>,
    require_auth: bool,
    embedded_errors: Vec<CredentialError>,
) -> Result<Vec<DownloadTarget>, CredentialError> {
    if let Some(first) = embedded_errors.into_iter().next() {
        if require_auth {
            return Err(first);
        }
        warn!("credentials: {source_id}: {first}; continuing without embedded credentials");
    }

    let mut inherited = 0usize;
    for target in &mut targets {
        if target.credentials.is_none()
            && let Some(default) = source_default
        {
            target.credentials = Some(default.clone());
            inherited += 1;
        }
        if require_auth && target.credentials.is_none() {
            return Err(CredentialError::Missing {
                source_id: source_id.to_owned(),
                target: target.id.path.clone(),
            });
        }
    }
    debug!(
        "credentials: {source_id}: {} targets, {inherited} using source credentials",
        targets.len()
    );
    Ok(targets)
}
