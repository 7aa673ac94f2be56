//! Quarantine store error types.

/// Errors produced by [`QuarantineStore`](crate::QuarantineStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure with the operation that raised it.
    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("quarantine store lock poisoned")]
    LockPoisoned,
}

impl StateError {
    pub(crate) fn backend_context(context: &'static str, source: rusqlite::Error) -> Self {
        Self::Backend { context, source }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
