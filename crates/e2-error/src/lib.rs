#![forbid(unsafe_code)]
//! Error types for e2fs.
//!
//! # Error Taxonomy
//!
//! e2fs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `e2-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `E2Error` | `e2-error` (this crate) | Errors returned by the channel, the engine and the mount surface |
//!
//! `e2-error` does not depend on `e2-types`; the `ParseError` to `E2Error`
//! conversion lives in `e2-core`, which sees both.
//!
//! ## Two code ranges
//!
//! Every error has a numeric [`E2Error::code`]. Errors that already carry an
//! operating-system errno (`Os`, `Io`) report that errno and sit below
//! [`EXT2_ET_BASE`]. Library errors report `EXT2_ET_BASE + ordinal` and go
//! through the translation table in [`E2Error::to_errno`]:
//!
//! | Variant | errno | Logged to superblock |
//! |---------|-------|----------------------|
//! | `NoMemory`, `DbOutOfMemory` | `ENOMEM` | no |
//! | `InvalidArgument`, `LlseekFailed` | `EINVAL` | no |
//! | `NoDirectory` | `ENOTDIR` | no |
//! | `FileNotFound` | `ENOENT` | no |
//! | `DirNoSpace` | `ENOSPC` | **yes** |
//! | `TooSmall`, `BlockAllocFail`, `InodeAllocFail`, `EaNoSpace` | `ENOSPC` | no |
//! | `SymlinkLoop` | `EMLINK` | no |
//! | `FileTooBig` | `EFBIG` | no |
//! | `FileExists`, `DbExists` | `EEXIST` | no |
//! | `MmpFailed`, `MmpFsckOn` | `EBUSY` | no |
//! | `EaKeyNotFound` | `ENOENT` | no |
//! | `MagicMismatch` | `EFAULT` | no |
//! | `Unimplemented` | `ENOTSUP` | no |
//! | every other library variant | `EIO` | **yes** |
//!
//! The mapping is exhaustive (no wildcard arms) so adding a variant is a
//! compile error until its errno and log class are assigned.

use thiserror::Error;

/// First code of the library's private error range.
pub const EXT2_ET_BASE: i64 = 2_133_571_328;

/// Unified error type for all e2fs operations.
#[derive(Debug, Error)]
pub enum E2Error {
    /// Device adapter I/O failure; carries the OS errno when there is one.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Plain errno produced outside the library range.
    #[error("os error {0}")]
    Os(i32),

    #[error("memory allocation failed")]
    NoMemory,

    #[error("database out of memory")]
    DbOutOfMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("seek failed")]
    LlseekFailed,

    #[error("not a directory")]
    NoDirectory,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("no free space in the directory")]
    DirNoSpace,

    #[error("too small to hold the requested structure")]
    TooSmall,

    #[error("could not allocate block")]
    BlockAllocFail,

    #[error("could not allocate inode")]
    InodeAllocFail,

    #[error("insufficient space to store extended attribute data")]
    EaNoSpace,

    #[error("too many symbolic links encountered")]
    SymlinkLoop,

    #[error("file too big")]
    FileTooBig,

    #[error("file exists")]
    FileExists,

    #[error("database entry exists")]
    DbExists,

    #[error("multiple-mount protection check failed")]
    MmpFailed,

    #[error("filesystem is being checked by another node")]
    MmpFsckOn,

    #[error("extended attribute key not found")]
    EaKeyNotFound,

    /// A handle carried the wrong structure magic.
    #[error("wrong magic number for file handle")]
    MagicMismatch,

    #[error("unimplemented operation")]
    Unimplemented,

    #[error("operation not supported for this channel")]
    OpNotSupported,

    /// The device returned fewer bytes than requested.
    #[error("short read at block {block}: wanted {expected} bytes, got {actual}")]
    ShortRead {
        block: u64,
        expected: usize,
        actual: usize,
    },

    #[error("short write at block {block}: wanted {expected} bytes, wrote {actual}")]
    ShortWrite {
        block: u64,
        expected: usize,
        actual: usize,
    },

    /// Inline-data expansion was requested for an inode without inline data.
    #[error("inode does not have inline data")]
    NoInlineData,

    #[error("no space for inline data")]
    InlineDataNoSpace,

    /// On-disk metadata corruption detected at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Metadata checksum does not match the stored value.
    #[error("checksum mismatch in {what} at block {block}")]
    ChecksumMismatch { what: &'static str, block: u64 },

    /// Not an ext2 filesystem, or an unknown revision.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("illegal inode number {0}")]
    BadInodeNum(u64),

    #[error("illegal block number {0}")]
    BadBlockNum(u64),

    #[error("read-only filesystem")]
    ReadOnly,
}

impl E2Error {
    /// Translate into the POSIX errno a VFS caller understands.
    ///
    /// OS-range errors pass through unchanged.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Os(errno) => *errno,
            Self::NoMemory | Self::DbOutOfMemory => libc::ENOMEM,
            Self::InvalidArgument(_) | Self::LlseekFailed => libc::EINVAL,
            Self::NoDirectory => libc::ENOTDIR,
            Self::FileNotFound(_) | Self::EaKeyNotFound => libc::ENOENT,
            Self::DirNoSpace
            | Self::TooSmall
            | Self::BlockAllocFail
            | Self::InodeAllocFail
            | Self::EaNoSpace => libc::ENOSPC,
            Self::SymlinkLoop => libc::EMLINK,
            Self::FileTooBig => libc::EFBIG,
            Self::FileExists | Self::DbExists => libc::EEXIST,
            Self::MmpFailed | Self::MmpFsckOn => libc::EBUSY,
            Self::MagicMismatch => libc::EFAULT,
            Self::Unimplemented => libc::ENOTSUP,
            Self::OpNotSupported
            | Self::ShortRead { .. }
            | Self::ShortWrite { .. }
            | Self::NoInlineData
            | Self::InlineDataNoSpace
            | Self::Corruption { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Format(_)
            | Self::Parse(_)
            | Self::UnsupportedFeature(_)
            | Self::BadInodeNum(_)
            | Self::BadBlockNum(_)
            | Self::ReadOnly => libc::EIO,
        }
    }

    /// Whether this error is a "real" filesystem error that must be recorded
    /// in the superblock error log.
    #[must_use]
    pub fn is_logged(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::Os(_)
            | Self::NoMemory
            | Self::DbOutOfMemory
            | Self::InvalidArgument(_)
            | Self::LlseekFailed
            | Self::NoDirectory
            | Self::FileNotFound(_)
            | Self::TooSmall
            | Self::BlockAllocFail
            | Self::InodeAllocFail
            | Self::EaNoSpace
            | Self::SymlinkLoop
            | Self::FileTooBig
            | Self::FileExists
            | Self::DbExists
            | Self::MmpFailed
            | Self::MmpFsckOn
            | Self::EaKeyNotFound
            | Self::MagicMismatch
            | Self::Unimplemented => false,
            Self::DirNoSpace
            | Self::OpNotSupported
            | Self::ShortRead { .. }
            | Self::ShortWrite { .. }
            | Self::NoInlineData
            | Self::InlineDataNoSpace
            | Self::Corruption { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Format(_)
            | Self::Parse(_)
            | Self::UnsupportedFeature(_)
            | Self::BadInodeNum(_)
            | Self::BadBlockNum(_)
            | Self::ReadOnly => true,
        }
    }

    /// Numeric code as stored in the superblock error record.
    ///
    /// OS-range errors return their errno; library errors return
    /// `EXT2_ET_BASE + ordinal`.
    #[must_use]
    pub fn code(&self) -> i64 {
        let ordinal: i64 = match self {
            Self::Io(_) | Self::Os(_) => return i64::from(self.to_errno()),
            Self::MagicMismatch => 1,
            Self::BadBlockNum(_) => 2,
            Self::BadInodeNum(_) => 3,
            Self::ShortRead { .. } => 4,
            Self::ShortWrite { .. } => 5,
            Self::DirNoSpace => 6,
            Self::TooSmall => 7,
            Self::BlockAllocFail => 8,
            Self::InodeAllocFail => 9,
            Self::NoDirectory => 10,
            Self::FileNotFound(_) => 11,
            Self::FileExists => 12,
            Self::SymlinkLoop => 13,
            Self::FileTooBig => 14,
            Self::NoMemory => 15,
            Self::InvalidArgument(_) => 16,
            Self::LlseekFailed => 17,
            Self::Unimplemented => 18,
            Self::OpNotSupported => 19,
            Self::DbOutOfMemory => 20,
            Self::DbExists => 21,
            Self::MmpFailed => 22,
            Self::MmpFsckOn => 23,
            Self::EaKeyNotFound => 24,
            Self::EaNoSpace => 25,
            Self::NoInlineData => 26,
            Self::InlineDataNoSpace => 27,
            Self::Corruption { .. } => 28,
            Self::ChecksumMismatch { .. } => 29,
            Self::Format(_) => 30,
            Self::Parse(_) => 31,
            Self::UnsupportedFeature(_) => 32,
            Self::ReadOnly => 33,
        };
        EXT2_ET_BASE + ordinal
    }
}

/// Result alias using `E2Error`.
pub type Result<T> = std::result::Result<T, E2Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_translation_table() {
        let cases: Vec<(E2Error, libc::c_int, bool)> = vec![
            (E2Error::NoMemory, libc::ENOMEM, false),
            (E2Error::DbOutOfMemory, libc::ENOMEM, false),
            (E2Error::InvalidArgument("x".into()), libc::EINVAL, false),
            (E2Error::LlseekFailed, libc::EINVAL, false),
            (E2Error::NoDirectory, libc::ENOTDIR, false),
            (E2Error::FileNotFound("x".into()), libc::ENOENT, false),
            (E2Error::DirNoSpace, libc::ENOSPC, true),
            (E2Error::TooSmall, libc::ENOSPC, false),
            (E2Error::BlockAllocFail, libc::ENOSPC, false),
            (E2Error::InodeAllocFail, libc::ENOSPC, false),
            (E2Error::EaNoSpace, libc::ENOSPC, false),
            (E2Error::SymlinkLoop, libc::EMLINK, false),
            (E2Error::FileTooBig, libc::EFBIG, false),
            (E2Error::FileExists, libc::EEXIST, false),
            (E2Error::DbExists, libc::EEXIST, false),
            (E2Error::MmpFailed, libc::EBUSY, false),
            (E2Error::MmpFsckOn, libc::EBUSY, false),
            (E2Error::EaKeyNotFound, libc::ENOENT, false),
            (E2Error::MagicMismatch, libc::EFAULT, false),
            (E2Error::Unimplemented, libc::ENOTSUP, false),
            (E2Error::OpNotSupported, libc::EIO, true),
            (
                E2Error::ShortRead {
                    block: 1,
                    expected: 1024,
                    actual: 0,
                },
                libc::EIO,
                true,
            ),
            (
                E2Error::ShortWrite {
                    block: 1,
                    expected: 1024,
                    actual: 12,
                },
                libc::EIO,
                true,
            ),
            (E2Error::NoInlineData, libc::EIO, true),
            (E2Error::InlineDataNoSpace, libc::EIO, true),
            (
                E2Error::Corruption {
                    block: 7,
                    detail: "bad rec_len".into(),
                },
                libc::EIO,
                true,
            ),
            (
                E2Error::ChecksumMismatch {
                    what: "inode",
                    block: 9,
                },
                libc::EIO,
                true,
            ),
            (E2Error::Format("bad magic".into()), libc::EIO, true),
            (E2Error::Parse("short".into()), libc::EIO, true),
            (E2Error::UnsupportedFeature("x".into()), libc::EIO, true),
            (E2Error::BadInodeNum(0), libc::EIO, true),
            (E2Error::BadBlockNum(0), libc::EIO, true),
            (E2Error::ReadOnly, libc::EIO, true),
        ];

        for (error, expected_errno, logged) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
            assert_eq!(error.is_logged(), *logged, "wrong log class for {error:?}");
            assert!(error.code() > EXT2_ET_BASE, "{error:?} must be a library code");
        }
    }

    #[test]
    fn os_range_errors_pass_through_unlogged() {
        let raw = E2Error::Io(std::io::Error::from_raw_os_error(libc::EPERM));
        assert_eq!(raw.to_errno(), libc::EPERM);
        assert!(!raw.is_logged());
        assert_eq!(raw.code(), i64::from(libc::EPERM));

        let synthetic = E2Error::Io(std::io::Error::other("device gone"));
        assert_eq!(synthetic.to_errno(), libc::EIO);
        assert!(!synthetic.is_logged());

        let os = E2Error::Os(libc::EROFS);
        assert_eq!(os.to_errno(), libc::EROFS);
        assert!(os.code() < EXT2_ET_BASE);
    }

    #[test]
    fn library_codes_are_distinct() {
        let codes = [
            E2Error::MagicMismatch.code(),
            E2Error::DirNoSpace.code(),
            E2Error::Unimplemented.code(),
            E2Error::NoInlineData.code(),
            E2Error::ReadOnly.code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn display_formatting() {
        let err = E2Error::Corruption {
            block: 42,
            detail: "bad checksum".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: bad checksum"
        );
        let short = E2Error::ShortRead {
            block: 3,
            expected: 1024,
            actual: 512,
        };
        assert_eq!(
            short.to_string(),
            "short read at block 3: wanted 1024 bytes, got 512"
        );
        assert_eq!(E2Error::ReadOnly.to_string(), "read-only filesystem");
    }
}
