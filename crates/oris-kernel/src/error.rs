//! Error taxonomy (spec.md §7): a small set of kinds every component maps
//! into, rather than component-specific error enums leaking across crates.

use thiserror::Error;

/// Stable classification used by callers to decide whether to retry,
/// surface to a user, or treat as a bug.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown run, node, or lease id.
    NotFound,
    /// A conditional state transition's guard rejected the request.
    PreconditionFailed,
    /// Lease acquisition lost a race; recovered internally by the scheduler.
    Contention,
    /// Transport/store unavailability; retried with backoff at the caller.
    Transient,
    /// Misconfiguration; refuses to serve.
    Fatal,
    /// Opaque failure surfaced verbatim from the agent executor.
    ExecutorError,
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct KernelError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl KernelError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionFailed, message)
    }

    pub fn contention(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Contention, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn executor_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutorError, message)
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
