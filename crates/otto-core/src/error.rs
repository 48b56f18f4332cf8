//! Otto error taxonomy.
//!
//! Mutation-API errors are a separate typed error (`TaskMutationError` in the
//! scheduler crate) so they can carry stable machine-readable codes; everything
//! else funnels through `OttoError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OttoError {
    /// Persistence-layer failure (SQLite open, query, constraint).
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration load/parse failure.
    #[error("config error: {0}")]
    Config(String),

    /// Chat transport failure (expected under retry; never fatal to the queue).
    #[error("transport error: {0}")]
    Transport(String),

    /// Caller-supplied input rejected before any write.
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OttoError>;
