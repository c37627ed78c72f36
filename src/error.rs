//! Error types for Obscura.

use thiserror::Error;

/// Result type alias using Obscura's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Obscura operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A framed message was malformed or truncated on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An empty message (no bytes, no descriptors) was submitted for sending.
    #[error("empty message rejected at send boundary")]
    EmptyMessage,

    /// The channel is not bound to a socket endpoint.
    #[error("channel is not bound")]
    NotConnected,

    /// The channel is already bound to a socket endpoint.
    #[error("channel is already bound")]
    AlreadyBound,

    /// The isolated process or its channel could not be established.
    #[error("failed to connect isolation channel: {0}")]
    Connect(String),

    /// The isolated process could not be launched.
    #[error("failed to spawn process: {0}")]
    Spawn(std::io::Error),

    /// The peer process exited or the channel broke mid-call.
    #[error("peer disconnected")]
    Disconnected,

    /// A buffer added to a request names no stream.
    #[error("buffer does not reference a valid stream")]
    InvalidStream,

    /// The request already holds a buffer for this stream.
    #[error("stream already has a buffer in this request")]
    StreamAlreadyBound,

    /// The request contains no buffers and cannot be queued.
    #[error("request contains no buffers")]
    EmptyRequest,

    /// The process is already running.
    #[error("process is already running")]
    Busy,

    /// A caller-imposed deadline elapsed before the reply arrived.
    #[error("operation timed out")]
    Timeout,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
