//! Persistence error types.

use thiserror::Error;

/// Result type for persistence operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur in the persistence layer.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database server rejected an operation.
    #[error("database server error: code = {code}, state = {state}, message = {message}")]
    Server {
        code: u16,
        state: String,
        message: String,
    },

    /// A connection could not be established. The daemon loops on this with
    /// backoff; it is never surfaced to producers.
    #[error("database connection failed: {0}")]
    Connect(String),

    /// The transport to the server failed mid-session.
    #[error("database i/o error: {0}")]
    Io(String),

    /// An object failed to serialize or populate itself. The connection
    /// itself is still usable.
    #[error("object data error: {0}")]
    Data(String),
}

impl DbError {
    /// True when the connection is in an indeterminate state and must be
    /// discarded.
    pub fn discards_connection(&self) -> bool {
        !matches!(self, DbError::Data(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_and_transport_errors_discard_the_connection() {
        let server = DbError::Server {
            code: 1062,
            state: "23000".to_owned(),
            message: "Duplicate entry".to_owned(),
        };
        assert!(server.discards_connection());
        assert!(DbError::Io("broken pipe".to_owned()).discards_connection());
        assert!(DbError::Connect("refused".to_owned()).discards_connection());
        assert!(!DbError::Data("missing column".to_owned()).discards_connection());
    }
}
