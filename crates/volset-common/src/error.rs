//! Error types for volset
//!
//! This module defines the error taxonomy shared by the storage and
//! engine crates.

use thiserror::Error;

/// Common result type for volset operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for volset
#[derive(Debug, Error)]
pub enum Error {
    // On-disk format errors
    #[error("format error: {0}")]
    Format(String),

    #[error("sequence conflict: structure carries {found}, set committed {committed}")]
    SequenceConflict { found: u32, committed: u32 },

    #[error("format version {found} unsupported, need at least {required}")]
    VersionUnsupported { found: u32, required: u32 },

    // Device errors
    #[error("I/O failure on {device}: {message}")]
    Io { device: String, message: String },

    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    // Allocation errors
    #[error("insufficient space: required {required} bytes, available {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },

    // State errors
    #[error("member state error: {0}")]
    MemberState(String),

    #[error("set not found: {0}")]
    SetNotFound(String),

    #[error("member not found: {0}")]
    MemberNotFound(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    // Caller errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a format error
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Create an I/O failure for a named device
    pub fn io(device: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Io {
            device: device.into(),
            message: message.to_string(),
        }
    }

    /// Create a member state error
    pub fn member_state(msg: impl Into<String>) -> Self {
        Self::MemberState(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SetNotFound(_) | Self::MemberNotFound(_) | Self::VolumeNotFound(_)
        )
    }

    /// Check if this error came from a device rather than from metadata
    #[must_use]
    pub fn is_device_failure(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::DiskIo(_))
    }

    /// Check if this error marks leftovers of an interrupted update
    #[must_use]
    pub fn is_debris(&self) -> bool {
        matches!(self, Self::SequenceConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::io("md0", "short read").is_device_failure());
        assert!(Error::DiskIo(std::io::Error::other("boom")).is_device_failure());
        assert!(!Error::format("bad magic").is_device_failure());
        assert!(Error::SequenceConflict { found: 5, committed: 4 }.is_debris());
        assert!(Error::VolumeNotFound("v".into()).is_not_found());
        assert!(!Error::member_state("stripe").is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = Error::InsufficientSpace {
            required: 100,
            available: 10,
        };
        assert_eq!(
            err.to_string(),
            "insufficient space: required 100 bytes, available 10 bytes"
        );
        assert_eq!(
            Error::io("disk1", "EIO").to_string(),
            "I/O failure on disk1: EIO"
        );
    }
}
