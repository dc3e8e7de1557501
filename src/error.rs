//! Error taxonomy shared by the runtime port, job variants and the pipeline.
//!
//! Every error that crosses a port boundary is classified into one of the
//! kinds below before a job variant or middleware ever sees it; variants
//! never see raw runtime types.

use std::fmt;

/// A runtime-port error, classified at the adapter boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("network not found: {0}")]
    NetworkNotFound(String),
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    #[error("exec not found: {0}")]
    ExecNotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("cancelled")]
    Cancelled,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("max runtime exceeded")]
    MaxTimeRunning,
    #[error("command exited with status {0}")]
    NonZeroExit(i64),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// The generic classification a [`RuntimeError`] belongs to, used for
/// `Is`-comparison: a typed not-found variant matches the generic
/// `NotFound` kind the same way it matches its own kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Unauthorized,
    Forbidden,
    Timeout,
    Cancelled,
    ConnectionFailed,
    MaxTimeRunning,
    NonZeroExit,
    Unexpected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::ContainerNotFound(_)
            | RuntimeError::ImageNotFound(_)
            | RuntimeError::NetworkNotFound(_)
            | RuntimeError::ServiceNotFound(_)
            | RuntimeError::ExecNotFound(_) => ErrorKind::NotFound,
            RuntimeError::Conflict(_) => ErrorKind::Conflict,
            RuntimeError::Unauthorized(_) => ErrorKind::Unauthorized,
            RuntimeError::Forbidden(_) => ErrorKind::Forbidden,
            RuntimeError::Timeout(_) => ErrorKind::Timeout,
            RuntimeError::Cancelled => ErrorKind::Cancelled,
            RuntimeError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            RuntimeError::MaxTimeRunning => ErrorKind::MaxTimeRunning,
            RuntimeError::NonZeroExit(_) => ErrorKind::NonZeroExit,
            RuntimeError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    pub fn exit_code(&self) -> Option<i64> {
        match self {
            RuntimeError::NonZeroExit(code) => Some(*code),
            _ => None,
        }
    }

    /// Whether a job's retry policy is *permitted* to retry this error at
    /// all, independent of whether `MaxRetries` has been exhausted.
    ///
    /// `Cancelled` and `Timeout` are always terminal. `NonZeroExit`
    /// and `ConnectionFailed` are always retryable. The remaining kinds
    /// are retryable only if the job opted into retries at all
    /// (`max_retries > 0`), which the caller supplies.
    pub fn is_retryable(&self, max_retries: u32) -> bool {
        match self.kind() {
            ErrorKind::Cancelled | ErrorKind::Timeout => false,
            ErrorKind::NonZeroExit | ErrorKind::ConnectionFailed => true,
            ErrorKind::Unauthorized
            | ErrorKind::Forbidden
            | ErrorKind::Conflict
            | ErrorKind::NotFound => max_retries > 0,
            ErrorKind::MaxTimeRunning | ErrorKind::Unexpected => max_retries > 0,
        }
    }
}

/// Errors returned synchronously by [`crate::scheduler::Scheduler`] mutation
/// methods. Never swallowed; always surfaced to the caller.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("job '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("job '{0}' not found")]
    NotFound(String),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Errors raised by a [`crate::sources::JobSource`] while discovering
/// desired state.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("malformed job declaration for '{0}': {1}")]
    Malformed(String, String),
    #[error("security policy violation: {0}")]
    SecurityPolicyViolation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_not_found_matches_generic_kind() {
        let e = RuntimeError::ContainerNotFound("abc".into());
        assert!(e.is_not_found());
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn cancelled_and_timeout_are_never_retryable() {
        assert!(!RuntimeError::Cancelled.is_retryable(10));
        assert!(!RuntimeError::Timeout("t".into()).is_retryable(10));
    }

    #[test]
    fn non_zero_exit_and_connection_failed_always_retryable() {
        assert!(RuntimeError::NonZeroExit(1).is_retryable(0));
        assert!(RuntimeError::ConnectionFailed("x".into()).is_retryable(0));
    }

    #[test]
    fn conflict_retryable_only_with_policy() {
        let e = RuntimeError::Conflict("busy".into());
        assert!(!e.is_retryable(0));
        assert!(e.is_retryable(1));
    }
}
