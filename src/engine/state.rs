use serde::Serialize;

use crate::engine::models::TargetId;

// Lifecycle of one source within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceState {
    NotStarted,
    ManifestLoaded,
    TargetsResolved,
    Transferring,
    Verifying,
    Complete,
    PartialFailure,
    /// A hard per-source error (unreadable or empty manifest, mandatory
    /// credentials missing). Other sources are unaffected.
    Aborted,
}

impl SourceState {
    pub fn label(self) -> &'static str {
        match self {
            SourceState::NotStarted => "not_started",
            SourceState::ManifestLoaded => "manifest_loaded",
            SourceState::TargetsResolved => "targets_resolved",
            SourceState::Transferring => "transferring",
            SourceState::Verifying => "verifying",
            SourceState::Complete => "complete",
            SourceState::PartialFailure => "partial_failure",
            SourceState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SourceState::Complete | SourceState::PartialFailure | SourceState::Aborted
        )
    }

    /// Whether moving to `next` follows the run's forward order.
    pub fn can_advance_to(self, next: SourceState) -> bool {
        use SourceState::*;
        match (self, next) {
            (_, Aborted) => !self.is_terminal(),
            (NotStarted, ManifestLoaded) => true,
            // A completed source short-circuits straight to its verdict.
            (NotStarted, Complete) => true,
            (ManifestLoaded, TargetsResolved) => true,
            (TargetsResolved, Transferring) => true,
            (Transferring, Verifying) => true,
            (Verifying, Complete | PartialFailure) => true,
            _ => false,
        }
    }
}

// Progress notifications streamed to whoever drives the run.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    SourceState {
        source_id: String,
        state: SourceState,
    },
    TargetStarted {
        target: TargetId,
        attempt: u32,
    },
    TargetProgress {
        target: TargetId,
        downloaded: u64,
        total: Option<u64>,
        speed: String,
    },
    TargetVerified {
        target: TargetId,
        bytes: u64,
    },
    TargetFailed {
        target: TargetId,
        error: String,
    },
}
