//! Server error types

use thiserror::Error;

/// Protocol and connection errors
#[derive(Error, Debug)]
pub enum ServerError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error during handshake or certificate loading
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connection closed by the peer
    #[error("Connection closed")]
    ConnectionClosed,

    /// Line exceeded the framing limit
    #[error("Line too long ({0} bytes)")]
    LineTooLong(usize),

    /// Malformed article range
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Malformed message (bad header block, missing required headers)
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Backing store is temporarily unreachable
    ///
    /// Engines translate this to `403` (NNTP) or
    /// `BAD Archive server temporarily offline` (IMAP) and keep the
    /// connection open.
    #[error("Archive server temporarily offline")]
    StoreUnavailable,

    /// Configuration error detected at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result type alias using ServerError
pub type Result<T> = std::result::Result<T, ServerError>;
