//! Socket core error types.

use thiserror::Error;

/// Result type for socket operations.
pub type NetResult<T> = Result<T, NetError>;

/// Errors that can occur in the socket I/O core.
#[derive(Debug, Error)]
pub enum NetError {
    /// A kernel call failed; the POSIX error number is available through
    /// [`std::io::Error::raw_os_error`].
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A framing-layer collaborator rejected the byte stream. The pump treats
    /// this as a session-shutdown cause.
    #[error("protocol error: {0}")]
    Protocol(String),
}
