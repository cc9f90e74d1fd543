//! Error types for dagstore.
//!
//! One crate-wide error enum; every fallible operation returns
//! [`DgsResult`]. Numeric codes are stable across releases so embedders
//! that persist or compare them can rely on the values.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type DgsResult<T> = Result<T, DgsError>;

/// Errors surfaced by the store.
///
/// Mutating operations are all-or-nothing: when one of these is returned,
/// any allocations made along the way have already been released.
#[derive(Debug, Error)]
pub enum DgsError {
    /// The file is not a dagstore database: bad magic or version, wrong
    /// geometry, not a regular file, or an I/O failure while opening.
    #[error("invalid database: {reason}")]
    InvalidDb { reason: String },

    /// Growing the file would exceed the maximum database size.
    #[error("maximum database size exceeded")]
    TooLarge,

    /// I/O failure outside of open (growth, flush).
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// A single allocation request that no amount of file growth can
    /// satisfy (larger than the single-chunk ceiling).
    #[error("allocation of {size} bytes failed")]
    Alloc { size: u64 },
}

impl DgsError {
    /// Stable numeric code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            DgsError::InvalidDb { .. } => ErrorCode::InvalidDb,
            DgsError::TooLarge => ErrorCode::TooLarge,
            DgsError::Io(_) => ErrorCode::Io,
            DgsError::Alloc { .. } => ErrorCode::Alloc,
        }
    }

    pub(crate) fn invalid_db(reason: impl Into<String>) -> Self {
        DgsError::InvalidDb { reason: reason.into() }
    }
}

/// Stable numeric error codes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum ErrorCode {
    /// No error.
    None = 0,
    /// Header/magic mismatch, unsupported version, non-regular file, or
    /// I/O failure during open.
    InvalidDb = 1,
    /// Growth would exceed the maximum database size.
    TooLarge = 2,
    /// Read/write/map failure outside of open.
    Io = 3,
    /// Allocation request that cannot be satisfied.
    Alloc = 4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(DgsError::invalid_db("x").code(), ErrorCode::InvalidDb);
        assert_eq!(DgsError::TooLarge.code(), ErrorCode::TooLarge);
        assert_eq!(DgsError::Alloc { size: 1 }.code(), ErrorCode::Alloc);
        assert_eq!(
            DgsError::Io(io::Error::other("boom")).code(),
            ErrorCode::Io
        );

        assert_eq!(ErrorCode::None as u32, 0);
        assert_eq!(ErrorCode::InvalidDb as u32, 1);
        assert_eq!(ErrorCode::TooLarge as u32, 2);
        assert_eq!(ErrorCode::Io as u32, 3);
        assert_eq!(ErrorCode::Alloc as u32, 4);
    }

    #[test]
    fn test_error_display() {
        let e = DgsError::invalid_db("bad magic");
        assert_eq!(e.to_string(), "invalid database: bad magic");

        let e = DgsError::Alloc { size: 4096 };
        assert_eq!(e.to_string(), "allocation of 4096 bytes failed");
    }
}
