use std::convert::Infallible;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Key '{0}' holds a value of the wrong type")]
    WrongType(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Update of '{key}' failed after {attempts} attempts")]
    RetriesExhausted { key: String, attempts: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Record '{0}' already exists")]
    AlreadyExists(String),

    #[error("Aggregate '{0}' has no enabled lifespan rule")]
    UnboundedLifespan(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl StoreError {
    /// Returns `true` for failures a caller may retry at a higher level
    /// (the enclosing request), as opposed to data or logic errors.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. } | Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

/// Error wrapper for the read-modify-write API, which can fail at two levels:
/// - store/engine (`StoreError`), including exhausted conflict retries
/// - the caller's mutation function (`E`), returned unchanged and never retried
#[derive(Debug)]
pub enum UpdateError<E> {
    /// Engine or store failure.
    Store(StoreError),
    /// The mutation function rejected the change.
    Mutator(E),
}

impl<E> UpdateError<E> {
    /// Returns the mutator error, if that is what this is.
    pub fn into_mutator(self) -> Option<E> {
        match self {
            Self::Mutator(err) => Some(err),
            Self::Store(_) => None,
        }
    }

    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::Store(StoreError::RetriesExhausted { .. }))
    }
}

impl<E> From<StoreError> for UpdateError<E> {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl<E: fmt::Display> fmt::Display for UpdateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::Mutator(err) => write!(f, "{err}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for UpdateError<E> {}

impl From<UpdateError<StoreError>> for StoreError {
    fn from(err: UpdateError<StoreError>) -> Self {
        match err {
            UpdateError::Store(err) | UpdateError::Mutator(err) => err,
        }
    }
}

impl From<UpdateError<Infallible>> for StoreError {
    fn from(err: UpdateError<Infallible>) -> Self {
        match err {
            UpdateError::Store(err) => err,
            UpdateError::Mutator(never) => match never {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let exhausted = StoreError::RetriesExhausted {
            key: "ks:sessions:r1:s1".into(),
            attempts: 8,
        };
        assert!(exhausted.is_retryable());
        assert!(StoreError::Transport("connection reset".into()).is_retryable());
        assert!(!StoreError::Codec("truncated payload".into()).is_retryable());
    }

    #[test]
    fn test_exhausted_message_names_attempts() {
        let err = StoreError::RetriesExhausted {
            key: "ks:sessions:r1:s1".into(),
            attempts: 8,
        };
        assert_eq!(
            err.to_string(),
            "Update of 'ks:sessions:r1:s1' failed after 8 attempts"
        );
    }

    #[test]
    fn test_update_error_flattens_store_mutator() {
        let err: UpdateError<StoreError> =
            UpdateError::Mutator(StoreError::AlreadyExists("k".into()));
        assert!(matches!(StoreError::from(err), StoreError::AlreadyExists(_)));
    }
}
