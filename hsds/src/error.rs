use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

/// An error kind paired with the span trace active where it was raised.
#[derive(Debug)]
pub struct HsdsError<E> {
    pub kind: E,
    pub context: SpanTrace,
}

impl<E> HsdsError<E> {
    pub fn new(kind: E) -> Self {
        Self::with_context(kind, SpanTrace::capture())
    }

    pub fn with_context(kind: E, context: SpanTrace) -> Self {
        Self { kind, context }
    }

    pub fn kind(&self) -> &E {
        &self.kind
    }

    pub fn span(&self) -> &SpanTrace {
        &self.context
    }

    /// Re-wrap the kind into an outer error type, keeping the original span trace.
    pub fn inject<F>(self, wrap: impl FnOnce(E) -> F) -> HsdsError<F> {
        HsdsError::with_context(wrap(self.kind), self.context)
    }
}

impl<E: Display> std::fmt::Display for HsdsError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)?;
        write!(f, "\n\ncontext:\n{}\n", self.context)?;
        Ok(())
    }
}

impl<E: std::error::Error + 'static> std::error::Error for HsdsError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }

    fn cause(&self) -> Option<&dyn std::error::Error> {
        self.source()
    }
}

/// The kinds of failure a caller of the chunk engine has to tell apart.
///
/// Every fatal error surfaced by the engine maps to exactly one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    InvalidIdentifier,
    InvalidSelection,
    NotFound,
    AccessDenied,
    CacheExhausted,
    Codec,
    UnsupportedOperation,
    Internal,
}

impl ErrorCategory {
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCategory::InvalidIdentifier
            | ErrorCategory::InvalidSelection
            | ErrorCategory::UnsupportedOperation => 400,
            ErrorCategory::NotFound => 404,
            ErrorCategory::AccessDenied => 403,
            ErrorCategory::CacheExhausted => 503,
            ErrorCategory::Codec | ErrorCategory::Internal => 500,
        }
    }

    /// Only capacity failures are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::CacheExhausted)
    }
}
