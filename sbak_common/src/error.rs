// sbak_common is the main sbak library implementing the backup engine logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::bytes::format_bytes;
use crate::pipeline::Stage;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// An `Error` describes why a backup run (or one of its preparatory
/// operations) could not complete. Every variant carries enough context
/// to diagnose the failure without re-running the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The run lock is held by another live process or the lock file
    /// cannot be used.
    #[error("cannot acquire run lock at {}: {reason}", .path.display())]
    LockUnavailable { path: PathBuf, reason: String },

    /// A required filesystem is not mounted at the expected path.
    /// The engine never mounts anything itself.
    #[error("{} is not a mount point", .path.display())]
    MountMissing { path: PathBuf },

    /// A snapshot create, delete or enumeration failed.
    #[error("snapshot {operation} failed for {}", .path.display())]
    SnapshotOperationFailed {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The destination does not have room for the estimated transfer
    /// plus the safety buffer.
    #[error(
        "insufficient space on destination: {} required, {} available",
        format_bytes(*.required),
        format_bytes(*.available)
    )]
    InsufficientSpace { required: u64, available: u64 },

    /// An allow-listed external tool is not installed.
    #[error("required tool `{tool}` not found at {}", .path.display())]
    DependencyMissing { tool: String, path: PathBuf },

    /// The destination copy does not carry the identifier of the snapshot
    /// that was sent to it.
    #[error(
        "identifier mismatch for {snapshot}: source has {source_id}, destination recorded {}",
        .received_id.as_deref().unwrap_or("none")
    )]
    IdentifierMismatch {
        snapshot: String,
        source_id: String,
        received_id: Option<String>,
    },

    /// An external tool exited unsuccessfully.
    #[error("command {argv:?} failed with exit code {exit_code:?}: {stderr}")]
    CommandFailed {
        argv: Vec<String>,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Caller-supplied input was rejected before reaching the OS.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A stage of the send/receive pipeline failed.
    #[error("{stage} stage failed with exit code {exit_code:?}: {stderr}")]
    StreamFailed {
        stage: Stage,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// A bounded operation did not finish within its deadline.
    #[error("{operation} timed out after {}s", .limit.as_secs())]
    Timeout { operation: String, limit: Duration },

    /// Removing a leftover artifact failed. Only reported alongside the
    /// primary error, never in place of it.
    #[error("cleanup of {} failed: {detail}", .path.display())]
    CleanupFailed { path: PathBuf, detail: String },

    /// The cancel signal was observed at a suspension point.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// A primary failure carrying the errors its cleanup produced.
    /// The suppressed errors never replace the primary; they exist for
    /// diagnostics only.
    #[error("{primary}")]
    WithSuppressed {
        #[source]
        primary: Box<Error>,
        suppressed: Vec<Error>,
    },
}

impl Error {
    /// Attaches errors produced while cleaning up after this error.
    /// The receiver stays the primary failure; attaching nothing is a
    /// no-op, and repeated attachment extends the existing list instead
    /// of nesting.
    pub fn with_suppressed(self, mut extra: Vec<Error>) -> Self {
        if extra.is_empty() {
            return self;
        }

        match self {
            Self::WithSuppressed {
                primary,
                mut suppressed,
            } => {
                suppressed.append(&mut extra);
                Self::WithSuppressed {
                    primary,
                    suppressed,
                }
            }
            primary => Self::WithSuppressed {
                primary: Box::new(primary),
                suppressed: extra,
            },
        }
    }

    /// The error that failed the run, without any attached cleanup
    /// failures.
    pub fn primary(&self) -> &Error {
        match self {
            Self::WithSuppressed { primary, .. } => primary,
            other => other,
        }
    }

    /// The errors cleanup produced after the primary failure.
    pub fn suppressed(&self) -> &[Error] {
        match self {
            Self::WithSuppressed { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Suggested operator action for errors that have a standard remedy.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::WithSuppressed { primary, .. } => primary.suggestion(),
            Self::LockUnavailable { .. } => Some(
                "another run may be active; if none is, remove the lock file manually and retry",
            ),
            Self::MountMissing { .. } => Some("mount the filesystem and retry"),
            Self::InsufficientSpace { .. } => {
                Some("free space on the destination or prune old snapshots")
            }
            Self::DependencyMissing { .. } => Some("install the missing tool"),
            Self::IdentifierMismatch { .. } => Some(
                "run `btrfs scrub` on the destination, then take a fresh full backup",
            ),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_space_reports_both_sizes() {
        let err = Error::InsufficientSpace {
            required: 3 * 1024 * 1024 * 1024,
            available: 100 * 1024 * 1024,
        };

        let msg = err.to_string();
        assert!(msg.contains("3.0 GiB required"));
        assert!(msg.contains("100.0 MiB available"));
    }

    #[test]
    fn identifier_mismatch_reports_missing_received_id() {
        let err = Error::IdentifierMismatch {
            snapshot: "data.2025-01-01T00:00:00Z".to_string(),
            source_id: "11111111-2222-3333-4444-555555555555".to_string(),
            received_id: None,
        };

        assert!(err.to_string().contains("destination recorded none"));
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn only_remediable_kinds_have_suggestions() {
        assert!(Error::InvalidInput("x".to_string()).suggestion().is_none());
        assert!(Error::Interrupted("signal".to_string()).suggestion().is_none());
    }

    #[test]
    fn suppressed_causes_ride_on_the_primary() {
        let primary = Error::InsufficientSpace {
            required: 2,
            available: 1,
        };
        let cleanup = Error::CleanupFailed {
            path: "/mnt/backup/data.2025-01-01T00:00:00Z".into(),
            detail: "busy".to_string(),
        };

        let combined = primary.with_suppressed(vec![cleanup]);

        assert!(matches!(
            combined.primary(),
            Error::InsufficientSpace { .. }
        ));
        assert_eq!(combined.suppressed().len(), 1);
        // The message stays the primary's.
        assert!(combined.to_string().contains("insufficient space"));
    }

    #[test]
    fn attaching_nothing_is_a_no_op() {
        let primary = Error::MountMissing {
            path: "/mnt/backup".into(),
        };

        let same = primary.with_suppressed(Vec::new());

        assert!(matches!(same, Error::MountMissing { .. }));
        assert!(same.suppressed().is_empty());
    }

    #[test]
    fn repeated_attachment_extends_instead_of_nesting() {
        let combined = Error::MountMissing {
            path: "/mnt/backup".into(),
        }
        .with_suppressed(vec![Error::CleanupFailed {
            path: "/a".into(),
            detail: "x".to_string(),
        }])
        .with_suppressed(vec![Error::CleanupFailed {
            path: "/b".into(),
            detail: "y".to_string(),
        }]);

        assert!(matches!(combined.primary(), Error::MountMissing { .. }));
        assert_eq!(combined.suppressed().len(), 2);
    }

    #[test]
    fn suggestion_looks_through_suppressed_causes() {
        let combined = Error::InsufficientSpace {
            required: 2,
            available: 1,
        }
        .with_suppressed(vec![Error::CleanupFailed {
            path: "/x".into(),
            detail: "busy".to_string(),
        }]);

        assert!(combined.suggestion().is_some());
    }
}
