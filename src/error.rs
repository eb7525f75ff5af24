//! Error taxonomy of the engine.
//!
//! Every failure surfaced to a caller is one of these kinds; the string code
//! is stable and used verbatim in the CLI JSON envelope (and is what an RPC
//! layer would map onto its own status codes).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The request violates a validation constraint. No side effects.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown job id.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The operation is not valid in the job's current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The caller's role does not permit the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Cgroup files absent, controllers not delegated, or kernel too old.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// A launch or stop exceeded its bound.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Unexpected syscall failure, a process that refused to die, or a
    /// worker panic.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Error {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found(id: impl Into<String>) -> Error {
        Error::NotFound(id.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Error {
        Error::FailedPrecondition(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Error {
        Error::PermissionDenied(msg.into())
    }

    pub fn resource_unavailable(msg: impl Into<String>) -> Error {
        Error::ResourceUnavailable(msg.into())
    }

    pub fn deadline_exceeded(msg: impl Into<String>) -> Error {
        Error::DeadlineExceeded(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Error {
        Error::Internal(msg.into())
    }

    /// Stable machine-readable code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::FailedPrecondition(_) => "failed_precondition",
            Error::PermissionDenied(_) => "permission_denied",
            Error::ResourceUnavailable(_) => "resource_unavailable",
            Error::DeadlineExceeded(_) => "deadline_exceeded",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether a caller may retry the identical request and plausibly see a
    /// different outcome.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::ResourceUnavailable(_) | Error::DeadlineExceeded(_) | Error::Internal(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Internal(e.to_string())
    }
}
