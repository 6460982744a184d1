#![forbid(unsafe_code)]
//! Error types for HexFS.
//!
//! Defines `HexfsError` and a `Result<T>` alias used throughout the
//! workspace. Every variant maps to a POSIX errno for FUSE response codes.

use thiserror::Error;

/// Unified error type for all HexFS operations.
#[derive(Debug, Error)]
pub enum HexfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Chunk failed authentication or carries impossible contents.
    #[error("integrity failure at chunk {index}: {detail}")]
    Integrity { index: u64, detail: &'static str },

    #[error("not found")]
    NotFound,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("file exists")]
    Exists,

    #[error("no space left on device")]
    NoSpace,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("too many links")]
    TooManyLinks,

    #[error("permission denied")]
    PermissionDenied,

    #[error("read-only file system")]
    ReadOnly,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("no data or hole at or after offset")]
    NoSeekTarget,

    #[error("attribute not found")]
    NoAttribute,

    #[error("buffer too small")]
    Range,

    #[error("container state is inconsistent")]
    BadContainer,

    /// Raised after the emergency flag is set and rollback failed.
    #[error("state is not recoverable")]
    Unrecoverable,
}

impl HexfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Integrity { .. } => libc::EIO,
            Self::NotFound => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::NoSpace => libc::ENOSPC,
            Self::QuotaExceeded => libc::EDQUOT,
            Self::TooManyLinks => libc::EMLINK,
            Self::PermissionDenied => libc::EACCES,
            Self::ReadOnly => libc::EROFS,
            Self::InvalidArgument => libc::EINVAL,
            Self::NoSeekTarget => libc::ENXIO,
            Self::NoAttribute => libc::ENODATA,
            Self::Range => libc::ERANGE,
            Self::BadContainer => libc::EBADF,
            Self::Unrecoverable => libc::ENOTRECOVERABLE,
        }
    }

    /// Build from a raw OS errno (host syscall failures).
    #[must_use]
    pub fn from_errno(errno: libc::c_int) -> Self {
        Self::Io(std::io::Error::from_raw_os_error(errno))
    }
}

/// Result alias using `HexfsError`.
pub type Result<T> = std::result::Result<T, HexfsError>;

// ── Emergency latch ─────────────────────────────────────────────────────────

use std::sync::atomic::{AtomicU8, Ordering};

/// Why the emergency latch was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyKind {
    /// An internal invariant was violated.
    Bug,
    /// The host system failed during a rollback or cleanup path.
    SystemFailure,
}

/// Sticky degradation signal, one per filesystem instance.
///
/// Once raised, every mutating operation is demoted to `EROFS` until the
/// process exits; read-only operations continue to work. The latch never
/// clears.
#[derive(Debug, Default)]
pub struct Emergency {
    state: AtomicU8,
}

impl Emergency {
    const NONE: u8 = 0;
    const BUG: u8 = 1;
    const SYSTEM_FAILURE: u8 = 2;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the flag. A later raise never downgrades an earlier one.
    pub fn raise(&self, kind: EmergencyKind) {
        let value = match kind {
            EmergencyKind::Bug => Self::BUG,
            EmergencyKind::SystemFailure => Self::SYSTEM_FAILURE,
        };
        let _ = self
            .state
            .compare_exchange(Self::NONE, value, Ordering::SeqCst, Ordering::SeqCst);
    }

    #[must_use]
    pub fn kind(&self) -> Option<EmergencyKind> {
        match self.state.load(Ordering::SeqCst) {
            Self::BUG => Some(EmergencyKind::Bug),
            Self::SYSTEM_FAILURE => Some(EmergencyKind::SystemFailure),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.kind().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_taxonomy() {
        assert_eq!(HexfsError::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(HexfsError::NotDirectory.to_errno(), libc::ENOTDIR);
        assert_eq!(HexfsError::IsDirectory.to_errno(), libc::EISDIR);
        assert_eq!(HexfsError::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(HexfsError::NameTooLong.to_errno(), libc::ENAMETOOLONG);
        assert_eq!(HexfsError::Exists.to_errno(), libc::EEXIST);
        assert_eq!(HexfsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(HexfsError::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(HexfsError::NoSeekTarget.to_errno(), libc::ENXIO);
        assert_eq!(HexfsError::NoAttribute.to_errno(), libc::ENODATA);
        assert_eq!(HexfsError::Range.to_errno(), libc::ERANGE);
        assert_eq!(HexfsError::Unrecoverable.to_errno(), libc::ENOTRECOVERABLE);
        assert_eq!(HexfsError::BadContainer.to_errno(), libc::EBADF);
    }

    #[test]
    fn io_error_preserves_raw_errno() {
        let err = HexfsError::from_errno(libc::ENOMEM);
        assert_eq!(err.to_errno(), libc::ENOMEM);
    }

    #[test]
    fn io_error_without_raw_code_degrades_to_eio() {
        let err = HexfsError::Io(std::io::Error::other("synthetic"));
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn emergency_latch_is_sticky_and_keeps_first_cause() {
        let emergency = Emergency::new();
        assert!(!emergency.is_raised());
        emergency.raise(EmergencyKind::SystemFailure);
        assert_eq!(emergency.kind(), Some(EmergencyKind::SystemFailure));
        // A later raise does not overwrite the first cause.
        emergency.raise(EmergencyKind::Bug);
        assert_eq!(emergency.kind(), Some(EmergencyKind::SystemFailure));
    }

    #[test]
    fn integrity_maps_to_eio() {
        let err = HexfsError::Integrity {
            index: 7,
            detail: "authentication failed",
        };
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(err.to_string().contains("chunk 7"));
    }
}
