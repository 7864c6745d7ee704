use std::time::Duration;
use thiserror::Error;
use xpgate_core::{Fingerprint, ValidationError};

/// Failure talking to a cache or ledger backing store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("corrupt entry under '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// The store could not be reached, as opposed to answering with garbage.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Errors surfaced by [`DecisionEngine::decide`](crate::DecisionEngine::decide).
///
/// Cloneable so one failed computation can be reported to every caller that
/// waited on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("transaction '{transaction_id}' was already decided with a different payload")]
    ConflictingReplay { transaction_id: String },
    #[error("in-flight decision for {fingerprint} failed: {cause}")]
    ConcurrentComputeFailure {
        fingerprint: Fingerprint,
        cause: String,
    },
    #[error("gave up waiting for the in-flight decision for {0}")]
    WaitTimeout(Fingerprint),
    #[error("decision computation aborted: {0}")]
    ComputeAborted(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Whether the same request may succeed when sent again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::ConflictingReplay { .. } => false,
            Self::ConcurrentComputeFailure { .. }
            | Self::WaitTimeout(_)
            | Self::ComputeAborted(_)
            | Self::Store(_) => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
