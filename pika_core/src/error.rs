//! Unified error handling for pika.
//!
//! Every fallible operation in the crate returns [`PikaResult`]. Each error
//! carries a kind plus a human-readable message; there is no retry logic
//! inside the library, and a [`PikaError::Timeout`] never leaves partial
//! state behind. Destructors cannot report failure and log instead.

use thiserror::Error;

/// Main error type for pika operations
#[derive(Debug, Error)]
pub enum PikaError {
    /// Shared-memory open/size/map failures and backing-name validation
    #[error("shared buffer error: {0}")]
    SharedBuffer(String),

    /// Mutex/condition-variable/semaphore initialization or operation
    /// failures, including use before initialization
    #[error("synchronization primitive error: {0}")]
    SyncPrimitive(String),

    /// Ring-buffer misuse or layout problems: misaligned base, parameter
    /// mismatch on re-attach, zero-copy access on the lock-free ring,
    /// foreign slot pointers
    #[error("ring buffer error: {0}")]
    RingBuffer(String),

    /// Channel-level configuration errors
    #[error("channel error: {0}")]
    Channel(String),

    /// A blocking operation's deadline expired. Queue state is untouched.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Fallback for errors that fit no other kind
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl PikaError {
    /// Create a shared-buffer error with a custom message
    pub fn shared_buffer<S: Into<String>>(msg: S) -> Self {
        PikaError::SharedBuffer(msg.into())
    }

    /// Create a synchronization-primitive error
    pub fn sync_primitive<S: Into<String>>(msg: S) -> Self {
        PikaError::SyncPrimitive(msg.into())
    }

    /// Create a ring-buffer error
    pub fn ring_buffer<S: Into<String>>(msg: S) -> Self {
        PikaError::RingBuffer(msg.into())
    }

    /// Create a channel configuration error
    pub fn channel<S: Into<String>>(msg: S) -> Self {
        PikaError::Channel(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        PikaError::Timeout(msg.into())
    }

    /// True if this error is the timeout kind
    pub fn is_timeout(&self) -> bool {
        matches!(self, PikaError::Timeout(_))
    }
}

/// Convenience type alias for Results using PikaError
pub type PikaResult<T> = std::result::Result<T, PikaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_render_with_prefix() {
        let err = PikaError::ring_buffer("buffer is not aligned");
        assert_eq!(err.to_string(), "ring buffer error: buffer is not aligned");
        assert!(!err.is_timeout());
        assert!(PikaError::timeout("receive").is_timeout());
    }
}
