//! Error types for device enumeration and drive operations.
//!
//! Enumeration and probe failures degrade gracefully (empty list, zero usage).
//! Operation failures are scoped to a single device and surfaced to the caller.

use std::path::PathBuf;

use thiserror::Error;

use super::models::DeviceAction;

/// The block device enumeration tool could not produce a usable listing.
#[derive(Debug, Error)]
pub enum ExternalToolError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {code}: {stderr}")]
    Exit {
        program: PathBuf,
        code: String,
        stderr: String,
    },

    #[error("failed to parse {program} output: {source}")]
    Parse {
        program: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Filesystem usage could not be queried for a mount point.
#[derive(Debug, Error)]
#[error("usage query failed for {mount_point}: {source}")]
pub struct ProbeError {
    pub mount_point: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// A partition failed to unmount. Partitions listed in `unmounted` were
/// already released before the failure and stay unmounted.
#[derive(Debug, Clone, Error)]
#[error("failed to unmount {partition}: {message}")]
pub struct UnmountError {
    pub partition: String,
    pub message: String,
    pub unmounted: Vec<String>,
}

/// Broad classification of a copy tool failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneFailure {
    PermissionDenied,
    NoSpace,
    NoSuchDevice,
    Other,
}

impl CloneFailure {
    /// Classify the copy tool's diagnostic output.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            Self::PermissionDenied
        } else if lower.contains("no space left") {
            Self::NoSpace
        } else if lower.contains("no such file or directory") || lower.contains("no such device") {
            Self::NoSuchDevice
        } else {
            Self::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission denied",
            Self::NoSpace => "no space left on destination",
            Self::NoSuchDevice => "source or destination not found",
            Self::Other => "copy failed",
        }
    }
}

/// The copy tool exited unsuccessfully.
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", kind.as_str())]
pub struct CloneError {
    pub kind: CloneFailure,
    pub exit_code: Option<i32>,
    pub message: String,
}

/// Errors returned by unmount and clone operations.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device {device} is busy ({action})")]
    DeviceBusy { device: String, action: DeviceAction },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Unmount(#[from] UnmountError),

    #[error(transparent)]
    Clone(#[from] CloneError),

    #[error("operation cancelled")]
    Cancelled,
}

impl OperationError {
    /// Cancellation is user-requested and not reported as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_permission_denied() {
        let msg = "dd: failed to open '/dev/sdb': Permission denied";
        assert_eq!(CloneFailure::classify(msg), CloneFailure::PermissionDenied);
    }

    #[test]
    fn classify_no_space() {
        let msg = "dd: error writing '/mnt/out.img': No space left on device";
        assert_eq!(CloneFailure::classify(msg), CloneFailure::NoSpace);
    }

    #[test]
    fn classify_unknown() {
        assert_eq!(CloneFailure::classify("something odd"), CloneFailure::Other);
    }

    #[test]
    fn clone_error_display_includes_kind_and_message() {
        let err = CloneError {
            kind: CloneFailure::PermissionDenied,
            exit_code: Some(1),
            message: "dd: failed to open '/dev/sdb': Permission denied".to_string(),
        };
        let text = err.to_string();
        assert!(text.starts_with("permission denied: "));
        assert!(text.contains("/dev/sdb"));
    }
}
