//! Error taxonomy shared by the storage seam and the sync engine.
//!
//! Storage engines map their raw error identifiers onto `StoreError`; the
//! sync engine wraps whatever escapes an operation in `SyncError`, which is
//! what callers render as a short status label.

use crate::fs::FsError;
use std::fmt;
use thiserror::Error;

/// Failure kinds surfaced by a versioned storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Remote unreachable during fetch or push.
    #[error("network unavailable: {0}")]
    TransientNetwork(String),

    /// A merge could not be resolved automatically.
    #[error("merge conflict in {} path(s)", paths.len())]
    MergeConflict { paths: Vec<String> },

    /// The index still holds conflicts from an earlier merge.
    #[error("unmerged paths: {}", paths.join(", "))]
    UnmergedPaths { paths: Vec<String> },

    /// The remote advanced past our local tip.
    #[error("push rejected: {0}")]
    PushRejected(String),

    /// A file, ref, object or config value is absent.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("storage error: {0}")]
    Other(String),
}

impl StoreError {
    /// Merge conflicts are steady-state events, not aborts.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::MergeConflict { .. } | StoreError::UnmergedPaths { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Fs(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The user-facing operations of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Bootstrap,
    Load,
    Publish,
    Pull,
    ResetToRemote,
    Save,
    Create,
    Delete,
    History,
    Markers,
}

impl Operation {
    /// Short verb used in status labels ("push failed", "pull failed").
    pub fn verb(self) -> &'static str {
        match self {
            Operation::Bootstrap => "bootstrap",
            Operation::Load => "load",
            Operation::Publish => "push",
            Operation::Pull => "pull",
            Operation::ResetToRemote => "reset",
            Operation::Save => "save",
            Operation::Create => "create",
            Operation::Delete => "delete",
            Operation::History => "history",
            Operation::Markers => "status",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// An operation failed; committed state was left untouched.
    #[error("{operation} failed: {source}")]
    Failed {
        operation: Operation,
        #[source]
        source: StoreError,
    },

    #[error("no note is open")]
    NoOpenNote,
}

impl SyncError {
    pub fn failed(operation: Operation, source: impl Into<StoreError>) -> Self {
        SyncError::Failed {
            operation,
            source: source.into(),
        }
    }

    /// Short human-readable status label; never a raw error chain.
    pub fn label(&self) -> String {
        match self {
            SyncError::Failed { source, .. } if source.is_conflict() => "merge conflict".to_string(),
            SyncError::Failed { operation, .. } => format!("{} failed", operation.verb()),
            SyncError::NoOpenNote => "no note open".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_short_status_strings() {
        let err = SyncError::failed(Operation::Publish, StoreError::Other("boom".into()));
        assert_eq!(err.label(), "push failed");

        let err = SyncError::failed(Operation::Pull, StoreError::TransientNetwork("dns".into()));
        assert_eq!(err.label(), "pull failed");

        let err = SyncError::failed(
            Operation::Pull,
            StoreError::MergeConflict {
                paths: vec!["notes/a.md".into()],
            },
        );
        assert_eq!(err.label(), "merge conflict");
    }

    #[test]
    fn test_not_found_includes_filesystem_absence() {
        assert!(StoreError::NotFound("refs/heads/main".into()).is_not_found());
        assert!(StoreError::from(FsError::NotFound("notes/a.md".into())).is_not_found());
        assert!(!StoreError::Other("x".into()).is_not_found());
    }
}
