//! VFS-facing request surface.

use crate::fs::Ext2Fs;
use crate::mount::Vnode;
use e2_error::{E2Error, Result};
use e2_ondisk::{FileType as DirFileType, Inode, TimeField};
use e2_types::{EXT2_NAME_LEN, InodeNumber};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

// ── VFS semantics layer ─────────────────────────────────────────────────────

/// File type as reported to the VFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

/// Inode attributes returned by [`FsOps::getattr`] and [`FsOps::lookup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    /// File size in bytes.
    pub size: u64,
    /// Number of 512-byte blocks allocated.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Creation time; the epoch when the inode has no room for it.
    pub crtime: SystemTime,
    pub kind: FileType,
    /// Lower 12 bits of the mode.
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Device number for block and character devices.
    pub rdev: u32,
    /// Preferred I/O size.
    pub blksize: u32,
}

/// A directory entry returned by [`FsOps::readdir`].
///
/// `offset` is the cookie to pass back to continue after this entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub offset: u64,
    pub kind: FileType,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Name as UTF-8 (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Volume statistics returned by [`FsOps::statfs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    /// Free blocks available to unprivileged users.
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
}

/// Operations a VFS adapter issues against a mounted volume.
///
/// Errors carry [`E2Error::to_errno`] for the adapter to return. Operations
/// a backend does not provide fall back to `Unimplemented` (`ENOTSUP`).
pub trait FsOps: Send + Sync {
    /// The root directory vnode.
    fn root(&self) -> Result<Arc<Vnode>>;

    /// Attributes of `ino`.
    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr>;

    /// Attributes of `name` in `parent`.
    ///
    /// A missing name is `FileNotFound`; a non-directory parent is
    /// `NoDirectory`.
    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr>;

    /// Entries of directory `ino` after cookie `offset` (0 starts over). An
    /// empty result is the end of the directory.
    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>>;

    /// Up to `size` bytes of `ino` from `offset`; short at end of file.
    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>>;

    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>>;

    fn statfs(&self) -> Result<StatFs>;

    /// Write back dirty metadata and cached blocks.
    fn sync(&self) -> Result<()>;

    fn mkdir(&self, _parent: InodeNumber, _name: &OsStr, _mode: u16) -> Result<InodeAttr> {
        Err(E2Error::Unimplemented)
    }

    fn unlink(&self, _parent: InodeNumber, _name: &OsStr) -> Result<()> {
        Err(E2Error::Unimplemented)
    }

    fn getxattr(&self, _ino: InodeNumber, _name: &str) -> Result<Vec<u8>> {
        Err(E2Error::Unimplemented)
    }

    fn listxattr(&self, _ino: InodeNumber) -> Result<Vec<String>> {
        Err(E2Error::Unimplemented)
    }

    fn setxattr(&self, _ino: InodeNumber, _name: &str, _value: &[u8]) -> Result<()> {
        Err(E2Error::Unimplemented)
    }

    fn write(&self, _ino: InodeNumber, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(E2Error::Unimplemented)
    }
}

// ── Conversions ─────────────────────────────────────────────────────────────

fn system_time(inode: &Inode, field: TimeField) -> SystemTime {
    inode.timestamp(field).to_system_time().unwrap_or(UNIX_EPOCH)
}

/// Map an inode mode to the VFS file type.
#[must_use]
pub(crate) fn inode_file_type(inode: &Inode) -> FileType {
    if inode.is_dir() {
        FileType::Directory
    } else if inode.is_symlink() {
        FileType::Symlink
    } else if inode.is_blkdev() {
        FileType::BlockDevice
    } else if inode.is_chrdev() {
        FileType::CharDevice
    } else if inode.is_fifo() {
        FileType::Fifo
    } else if inode.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

/// Map a directory-entry type to the VFS file type. `Unknown` means the
/// volume does not record types; the caller must stat the inode.
pub(crate) fn dir_entry_file_type(ft: DirFileType) -> Option<FileType> {
    match ft {
        DirFileType::RegFile => Some(FileType::RegularFile),
        DirFileType::Dir => Some(FileType::Directory),
        DirFileType::Symlink => Some(FileType::Symlink),
        DirFileType::Blkdev => Some(FileType::BlockDevice),
        DirFileType::Chrdev => Some(FileType::CharDevice),
        DirFileType::Fifo => Some(FileType::Fifo),
        DirFileType::Sock => Some(FileType::Socket),
        DirFileType::Unknown => None,
    }
}

impl Ext2Fs {
    /// VFS attributes of `ino`.
    pub fn inode_attr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        let inode = self.read_inode(ino)?;
        Ok(self.inode_to_attr(ino, &inode))
    }

    pub(crate) fn inode_to_attr(&self, ino: InodeNumber, inode: &Inode) -> InodeAttr {
        let kind = inode_file_type(inode);
        let blocks = if inode.is_huge_file() {
            inode.blocks.saturating_mul(self.sectors_per_block())
        } else {
            inode.blocks
        };
        // Old-style device numbers live in block[0], new-style in block[1].
        let rdev = match kind {
            FileType::BlockDevice | FileType::CharDevice => {
                if inode.block[0] != 0 {
                    inode.block[0]
                } else {
                    inode.block[1]
                }
            }
            _ => 0,
        };
        InodeAttr {
            ino,
            size: inode.size,
            blocks,
            atime: system_time(inode, TimeField::Atime),
            mtime: system_time(inode, TimeField::Mtime),
            ctime: system_time(inode, TimeField::Ctime),
            crtime: system_time(inode, TimeField::Crtime),
            kind,
            perm: inode.permission_bits(),
            nlink: u32::from(inode.links_count),
            uid: inode.uid,
            gid: inode.gid,
            rdev,
            blksize: self.geo.block_size,
        }
    }

    /// Entries of `dir` from cookie `offset`, each carrying the cookie of
    /// the entry after it.
    pub fn readdir_from(&self, dir: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        let raw = self.read_dir(dir)?;
        let mut out = Vec::with_capacity(raw.len());
        for (idx, entry) in raw.into_iter().enumerate().skip(usize::try_from(offset).unwrap_or(usize::MAX)) {
            let ino = InodeNumber(u64::from(entry.inode));
            let kind = match dir_entry_file_type(DirFileType::from_raw(entry.file_type)) {
                Some(kind) => kind,
                None => inode_file_type(&self.read_inode(ino)?),
            };
            out.push(DirEntry {
                ino,
                offset: idx as u64 + 1,
                kind,
                name: entry.name,
            });
        }
        Ok(out)
    }

    /// Volume statistics from the in-memory superblock.
    #[must_use]
    pub fn statfs(&self) -> StatFs {
        let meta = self.meta.lock();
        let sb = &meta.sb;
        StatFs {
            blocks: u64::from(sb.blocks_count),
            bfree: u64::from(sb.free_blocks_count),
            bavail: u64::from(sb.free_blocks_count.saturating_sub(sb.r_blocks_count)),
            files: u64::from(sb.inodes_count),
            ffree: u64::from(sb.free_inodes_count),
            bsize: self.geo.block_size,
            namelen: EXT2_NAME_LEN as u32,
        }
    }
}
