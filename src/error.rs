//! Error types for the meshlink library.

use thiserror::Error;

/// The main error type for meshlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection establishment failed (unreachable host, missing port, ...).
    #[error("connection failed: {message}")]
    Connection { message: String },

    /// The connection dropped while requests were outstanding.
    ///
    /// Every pending request observes this error; none are left hanging.
    #[error("connection lost")]
    ConnectionLost,

    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Protocol error from the device or a malformed payload.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Request timed out waiting for its correlated response.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,

    /// Internal channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

/// Frame-level errors.
///
/// These are always recovered locally by the decoder's resynchronization
/// logic and never propagate past the read loop.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The two magic bytes at the frame start did not match.
    #[error("bad frame magic: 0x{0:02x} 0x{1:02x}")]
    BadMagic(u8, u8),

    /// Declared payload length is implausible (zero or above the maximum).
    #[error("implausible frame length {len} (max {max})")]
    BadLength { len: usize, max: usize },
}

/// Result type alias for meshlink operations.
pub type Result<T> = std::result::Result<T, Error>;
