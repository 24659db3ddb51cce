//! Error types for the RMI library

use thiserror::Error;

/// Result type alias for RMI operations
pub type Result<T> = std::result::Result<T, RmiError>;

/// Error types for RMI operations
#[derive(Error, Debug)]
pub enum RmiError {
    /// Client is not connected
    #[error("Not connected")]
    NotConnected,

    /// Inbound frame exceeds the caller's size cap
    #[error("Frame size exceeds limit")]
    FrameTooLarge,

    /// Overall read deadline expired
    #[error("Timed out waiting for server response")]
    Timeout,

    /// Peer closed the connection mid-frame
    #[error("Connection closed by server")]
    ConnectionClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation interrupted by a stop request
    #[error("Operation cancelled")]
    Cancelled,

    /// Peer violated the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Payload could not be decoded (PNG, listing, version text)
    #[error("Decode error: {0}")]
    Decode(String),

    /// Server credential config is missing or malformed
    #[error("Config error: {0}")]
    Config(String),
}
