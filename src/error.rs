//! Error types for PeerVault.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// PeerVault error kinds. Each variant maps to a single recovery action
/// (drop the peer, retry, propagate to the caller, ...) as described in the
/// wire/store/transport contracts.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake or AEAD authentication failed")]
    AuthFailed,

    #[error("handshake timestamp outside allowed skew")]
    Stale,

    #[error("frame exceeds maximum size")]
    FrameTooLarge,

    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("malformed control message: {0}")]
    Decode(String),

    #[error("key not found")]
    NotFound,

    #[error("concurrent stream limit exceeded")]
    LimitExceeded,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("operation timed out")]
    Timeout,

    #[error("ciphertext too short to contain nonce and tag")]
    Truncated,

    #[error("file exceeds configured maximum size")]
    SizeLimitExceeded,

    #[error("key rotation in progress, retry")]
    KeyRotationInProgress,

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource manager is shut down")]
    ShuttingDown,
}
