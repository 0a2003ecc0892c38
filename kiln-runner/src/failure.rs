//! Failure classification for crashed or unspawnable dev servers

use kiln_core::FailureReason;
use std::path::Path;
use std::time::Duration;

use crate::defaults::IMMEDIATE_CRASH_WINDOW;

/// A classified failure, attached to the record and surfaced in events.
#[derive(Debug, Clone)]
pub struct FailureDiagnosis {
    pub reason: FailureReason,
    pub message: String,
    pub suggestion: &'static str,
}

impl FailureDiagnosis {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            suggestion: reason.suggestion(),
        }
    }
}

/// Map a raw process error into exactly one failure reason.
///
/// Checked in priority order: error-text patterns first, then the state of
/// the working directory on disk, then process uptime. `raw_error` is
/// whatever text the failure produced: the spawn error string, or the
/// stderr captured during the diagnostic window.
pub fn classify(raw_error: &str, working_directory: &Path, uptime: Duration) -> FailureDiagnosis {
    let text = raw_error.to_lowercase();

    let reason = if text.contains("eaddrinuse") || text.contains("address already in use") {
        FailureReason::PortInUse
    } else if text.contains("command not found")
        || text.contains("enoent")
        || text.contains("no such file or directory")
    {
        FailureReason::CommandNotFound
    } else if text.contains("eacces") || text.contains("permission denied") {
        FailureReason::PermissionDenied
    } else if !working_directory.exists() {
        FailureReason::DirectoryMissing
    } else if uptime < IMMEDIATE_CRASH_WINDOW {
        FailureReason::ImmediateCrash
    } else {
        FailureReason::Unknown
    };

    let message = if raw_error.trim().is_empty() {
        format!("dev server failed: {reason}")
    } else {
        raw_error.trim().to_string()
    };

    FailureDiagnosis::new(reason, message)
}
