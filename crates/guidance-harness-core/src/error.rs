//! Error taxonomy shared by the rule store, job queue, and retrieval engine.
//!
//! | Type | Raised by | Handling |
//! |------|-----------|----------|
//! | [`ValidationError`] | rule authoring | rejected synchronously, never enqueued |
//! | [`ProviderError`] | embedding providers | recorded on the job (retry or fail) |
//! | [`Error`] | service layer | surfaced to the caller |
//!
//! Lost claims and compare-and-set mismatches are not errors: they surface
//! as `None` or [`Transition::Lost`](crate::jobs::Transition::Lost).

use thiserror::Error;

/// Result alias for service-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A rule failed one of its field invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("title must not be empty")]
    EmptyTitle,

    #[error("guidance text must not be empty")]
    EmptyGuidance,

    #[error("at least one context is required")]
    NoContexts,

    #[error(
        "malformed slug '{0}': use lowercase letters, digits and single hyphens (at most 64 characters)"
    )]
    MalformedSlug(String),

    #[error("unknown priority '{0}': must be one of low, medium, high, critical")]
    UnknownPriority(String),

    #[error(
        "unknown category '{0}': must be one of architecture, security, performance, testing, ai-ml, ux, devops, data"
    )]
    UnknownCategory(String),

    #[error("unknown retrieval mode '{0}': use auto, keyword, or vector")]
    UnknownMode(String),
}

/// Failure reported by an embedding provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Timeout, rate limit, network failure, or 5xx. Retried with backoff.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Malformed input, unsupported text, or a client error. Never retried.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// The provider returned a vector of unexpected length.
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl ProviderError {
    /// Whether the job that hit this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Service-level error returned by [`RuleBook`](crate::rules::RuleBook),
/// [`EmbeddingQueue`](crate::queue::EmbeddingQueue), and the retrieval engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("a rule with slug '{slug}' already exists in scope {scope}")]
    DuplicateSlug { slug: String, scope: String },

    #[error("rule not found: {0}")]
    RuleNotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Backend failure (database, lock poisoning, serialization).
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl Error {
    /// Recover a typed error that a store raised through `anyhow`, such as
    /// a slug collision caught by a unique index.
    pub fn from_store(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(typed) => typed,
            Err(other) => Error::Store(other),
        }
    }
}
