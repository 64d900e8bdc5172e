//! Store error type.

use relay_core::LogError;

/// Errors raised by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `SQLite` reported a failure.
    #[error("database error: {0}")]
    Database(String),

    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored value could not be decoded.
    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        /// Table name.
        table: &'static str,
        /// Column name.
        column: &'static str,
        /// Underlying decode failure.
        detail: String,
    },

    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(e.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for LogError {
    fn from(e: StoreError) -> Self {
        LogError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_row_display() {
        let err = StoreError::CorruptRow {
            table: "messages",
            column: "sent_at",
            detail: "bad timestamp".into(),
        };
        assert_eq!(err.to_string(), "corrupt row in messages.sent_at: bad timestamp");
    }

    #[test]
    fn store_error_converts_to_log_error() {
        let err: LogError = StoreError::Database("locked".into()).into();
        assert!(err.0.contains("locked"));
    }
}
