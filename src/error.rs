use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

/// Failure taxonomy for overlay operations.
///
/// Everything except `InvariantViolation` is an ordinary, caller-recoverable
/// failure that the FUSE adapter translates to an errno. `InvariantViolation`
/// signals a bug in the overlay core itself; the operation that raised it is
/// aborted before any store mutation becomes visible.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("{path}: not a {expected}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
