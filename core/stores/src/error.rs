use memory_weave_schemas::Backend;
use thiserror::Error;

/// Error taxonomy for the store adapters.
///
/// `Unavailable` aborts only operations touching that backend; callers are
/// expected to keep driving the other backends and report the gap.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{backend} store unavailable: {message}")]
    Unavailable { backend: Backend, message: String },

    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("invalid predicate {0:?}")]
    InvalidPredicate(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn unavailable(backend: Backend, message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            backend,
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
