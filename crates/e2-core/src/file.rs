//! Read path: file contents, symlink targets and path resolution.

use crate::fs::Ext2Fs;
use e2_error::{E2Error, Result};
use e2_ondisk::Inode;
use e2_types::{EXT4_EXTENTS_FL, InodeNumber};
use std::collections::VecDeque;
use tracing::trace;

/// Symlinks followed during one resolution before giving up.
const MAX_SYMLINKS: u32 = 8;

fn components(path: &[u8]) -> VecDeque<Vec<u8>> {
    path.split(|&b| b == b'/')
        .filter(|c| !c.is_empty() && *c != b".")
        .map(<[u8]>::to_vec)
        .collect()
}

impl Ext2Fs {
    /// Symlink target stored directly in `i_block`; a short target may
    /// still sit in a data block, so the block count decides.
    pub(crate) fn target_in_i_block(&self, inode: &Inode) -> bool {
        let xattr_sectors = if inode.file_acl != 0 {
            self.sectors_per_block()
        } else {
            0
        };
        inode.is_fast_symlink()
            && inode.flags & EXT4_EXTENTS_FL == 0
            && inode.blocks.saturating_sub(xattr_sectors) == 0
    }

    /// Read up to `len` bytes of `ino` starting at `offset`.
    ///
    /// Reads stop at `i_size`; holes read as zeros. Directories are
    /// refused, use [`Ext2Fs::dir_iterate`] for those.
    pub fn read_file(&self, ino: InodeNumber, offset: u64, len: usize) -> Result<Vec<u8>> {
        let inode = self.read_inode(ino)?;
        if inode.is_dir() {
            return Err(E2Error::InvalidArgument(format!("inode {} is a directory", ino.0)));
        }
        if offset >= inode.size || len == 0 {
            return Ok(Vec::new());
        }
        let end = inode.size.min(offset.saturating_add(len as u64));
        let want = usize::try_from(end - offset).map_err(|_| E2Error::FileTooBig)?;

        if inode.has_inline_data() || self.target_in_i_block(&inode) {
            let data = if inode.has_inline_data() {
                self.inline_data_get(ino)?
            } else {
                inode.i_block_bytes().to_vec()
            };
            let start = usize::try_from(offset).map_err(|_| E2Error::FileTooBig)?;
            let mut out = data.get(start..).unwrap_or_default().to_vec();
            out.resize(want, 0);
            return Ok(out);
        }

        let bs = u64::from(self.geo.block_size);
        let mut out = Vec::with_capacity(want);
        let mut pos = offset;
        while pos < end {
            let lblk = pos / bs;
            let within = (pos % bs) as usize;
            let take = (bs - pos % bs).min(end - pos) as usize;
            match self.bmap(ino, &inode, lblk)? {
                Some(pblk) => {
                    let block = self.channel.read_block(pblk)?;
                    out.extend_from_slice(&block[within..within + take]);
                }
                None => {
                    trace!(target: "e2fs::file", event = "hole", ino = ino.0, lblk);
                    out.resize(out.len() + take, 0);
                }
            }
            pos += take as u64;
        }
        Ok(out)
    }

    /// Target of symlink `ino`.
    pub fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let inode = self.read_inode(ino)?;
        if !inode.is_symlink() {
            return Err(E2Error::InvalidArgument(format!("inode {} is not a symlink", ino.0)));
        }
        let len = usize::try_from(inode.size).map_err(|_| E2Error::FileTooBig)?;
        self.read_file(ino, 0, len)
    }

    /// Resolve an absolute or root-relative `path` to an inode.
    ///
    /// Symlinks are followed, including in the final component.
    pub fn namei(&self, path: &[u8]) -> Result<InodeNumber> {
        let mut pending = components(path);
        let mut cur = InodeNumber::ROOT;
        let mut followed = 0;
        while let Some(name) = pending.pop_front() {
            let next = self.lookup(cur, &name)?.ok_or_else(|| {
                E2Error::FileNotFound(String::from_utf8_lossy(&name).into_owned())
            })?;
            if !self.read_inode(next)?.is_symlink() {
                cur = next;
                continue;
            }
            followed += 1;
            if followed > MAX_SYMLINKS {
                return Err(E2Error::SymlinkLoop);
            }
            let target = self.readlink(next)?;
            if target.first() == Some(&b'/') {
                cur = InodeNumber::ROOT;
            }
            let mut expanded = components(&target);
            expanded.extend(pending.drain(..));
            pending = expanded;
        }
        Ok(cur)
    }
}
