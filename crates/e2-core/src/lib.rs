#![forbid(unsafe_code)]
//! ext2 metadata engine.
//!
//! [`Ext2Fs`] ties the block channel to the on-disk codec: it loads the
//! superblock and group descriptors, reads and writes inodes, allocates
//! blocks and inodes, walks and edits directories, and carries inline data
//! through its lifecycle. [`Mount`] adds the mount-argument check, root
//! acquisition and the [`FsOps`] request surface, whose errors pass through
//! the superblock error log before reaching the caller.
//!
//! # Locking
//!
//! Superblock and descriptor state sits behind a short-held mutex. Every
//! operation that changes metadata also holds the engine's single writer
//! lock for its whole duration, so there is at most one metadata mutator
//! at a time. Readers never take the writer lock.

mod alloc;
mod bmap;
mod dir;
mod errlog;
mod file;
mod fs;
mod inline;
pub mod mkfs;
mod mount;
mod ops;
mod xattr;

pub use dir::DirIterAction;
pub use fs::{Ext2Fs, OpenOptions};
pub use mkfs::{FormatOptions, format};
pub use mount::{EXT2_ARGS_MAGIC, Mount, MountArgs, RootSlot, Vnode};
pub use ops::{DirEntry, FileType, FsOps, InodeAttr, StatFs};
pub use xattr::XattrHandle;

use e2_error::E2Error;
use e2_types::{BlockNumber, ParseError};

/// Report a codec failure at `block` as structure corruption.
#[must_use]
pub fn parse_error_to_e2(err: &ParseError, block: BlockNumber) -> E2Error {
    E2Error::Corruption {
        block: block.0,
        detail: err.to_string(),
    }
}

pub(crate) trait ParseResultExt<T> {
    fn or_corrupt(self, block: BlockNumber) -> e2_error::Result<T>;
}

impl<T> ParseResultExt<T> for Result<T, ParseError> {
    fn or_corrupt(self, block: BlockNumber) -> e2_error::Result<T> {
        self.map_err(|e| parse_error_to_e2(&e, block))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_become_corruption() {
        let err = ParseError::InvalidMagic {
            expected: 0xEF53,
            actual: 0,
        };
        let mapped = parse_error_to_e2(&err, BlockNumber(7));
        assert!(matches!(mapped, E2Error::Corruption { block: 7, .. }));
        assert_eq!(mapped.to_errno(), libc_eio());
    }

    fn libc_eio() -> i32 {
        E2Error::Format(String::new()).to_errno()
    }
}
