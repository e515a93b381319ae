//! Error types for espejo operations.

use thiserror::Error;

/// Errors that can occur during espejo operations.
#[derive(Error, Debug)]
pub enum EspejoError {
    /// I/O error during read/write operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Patch stream references an out-of-range block or runs short.
    #[error("invalid patch: {reason}")]
    InvalidPatch {
        /// What made the patch unusable.
        reason: String,
    },

    /// Sink state no longer matches what the caller announced.
    #[error("precondition failed: {reason}")]
    Precondition {
        /// What diverged.
        reason: String,
    },

    /// Another mutation is in flight for the same path.
    #[error("path is busy: {path}")]
    Busy {
        /// Canonical form of the contended path.
        path: String,
    },

    /// Cooperative cancellation observed.
    #[error("operation cancelled")]
    Cancelled,

    /// Malformed path, unknown hasher, over-long literal, and friends.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Path does not exist in the store.
    #[error("not found: {path}")]
    NotFound {
        /// Canonical form of the missing path.
        path: String,
    },

    /// One or more per-file operations failed during a sync run.
    #[error("{0}")]
    Sync(SyncFailures),
}

impl EspejoError {
    /// Build an `InvalidPatch` error from anything displayable.
    pub fn invalid_patch(reason: impl Into<String>) -> Self {
        Self::InvalidPatch {
            reason: reason.into(),
        }
    }

    /// Build a `Precondition` error from anything displayable.
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::Precondition {
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the operation as-is.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// The transport code this error maps onto.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::InvalidArgument(_) | Self::InvalidPatch { .. } => ErrorCode::InvalidArgument,
            Self::Precondition { .. } => ErrorCode::FailedPrecondition,
            Self::Busy { .. } => ErrorCode::Unavailable,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Io(_) | Self::Sync(_) => ErrorCode::Internal,
        }
    }
}

/// Result type for espejo operations.
pub type Result<T> = std::result::Result<T, EspejoError>;

/// Transport-level error codes the RPC layer maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No such path.
    NotFound,
    /// The request itself is malformed.
    InvalidArgument,
    /// Server state diverged from what the request assumed.
    FailedPrecondition,
    /// Transient contention; retry.
    Unavailable,
    /// The request was cancelled.
    Cancelled,
    /// Everything else.
    Internal,
}

/// Per-file failures collected over a sync run.
///
/// Successful files stay applied; this carries only what went wrong.
#[derive(Debug)]
pub struct SyncFailures {
    /// `(path, error)` pairs, one per failed file operation.
    pub failures: Vec<(String, EspejoError)>,
}

impl std::fmt::Display for SyncFailures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} file operation(s) failed", self.failures.len())?;
        for (path, err) in &self.failures {
            write!(f, "; {path}: {err}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = EspejoError::Io(io_err);
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn error_display_invalid_patch() {
        let err = EspejoError::invalid_patch("block 9 out of range (max 3)");
        assert!(err.to_string().contains("invalid patch"));
        assert!(err.to_string().contains("block 9"));
    }

    #[test]
    fn error_display_precondition() {
        let err = EspejoError::precondition("file sum diverged");
        assert!(err.to_string().contains("precondition failed"));
    }

    #[test]
    fn error_display_busy() {
        let err = EspejoError::Busy {
            path: "a/b".to_string(),
        };
        assert!(err.to_string().contains("busy"));
        assert!(err.to_string().contains("a/b"));
    }

    #[test]
    fn busy_is_retriable() {
        let busy = EspejoError::Busy {
            path: String::new(),
        };
        assert!(busy.is_retriable());
        assert!(!EspejoError::Cancelled.is_retriable());
    }

    #[test]
    fn code_mapping() {
        assert_eq!(
            EspejoError::NotFound {
                path: "x".to_string()
            }
            .code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            EspejoError::InvalidArgument("bad".to_string()).code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            EspejoError::precondition("sum").code(),
            ErrorCode::FailedPrecondition
        );
        assert_eq!(
            EspejoError::Busy {
                path: String::new()
            }
            .code(),
            ErrorCode::Unavailable
        );
        assert_eq!(EspejoError::Cancelled.code(), ErrorCode::Cancelled);
        assert_eq!(
            EspejoError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom")).code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn sync_failures_display() {
        let failures = SyncFailures {
            failures: vec![
                ("a/b".to_string(), EspejoError::Cancelled),
                (
                    "c".to_string(),
                    EspejoError::Busy {
                        path: "c".to_string(),
                    },
                ),
            ],
        };
        let msg = EspejoError::Sync(failures).to_string();
        assert!(msg.contains("2 file operation(s) failed"));
        assert!(msg.contains("a/b"));
    }

    #[test]
    fn result_type_ok() {
        let result: Result<i32> = Ok(42);
        assert_eq!(result.unwrap_or(0), 42);
    }
}
