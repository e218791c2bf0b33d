//! Conversion between the little-endian disk layout and the native layout of
//! a big-endian host.
//!
//! Each routine byte-swaps exactly the multi-byte fields the codec models
//! and leaves everything else alone, so converting to native and back
//! returns the original bytes. `i_block` contents that are raw bytes
//! (extent roots, inline data, fast symlink targets) are never swapped.

use crate::dir::DirBlock;
use crate::group::GroupDesc;
use crate::inode::Inode;
use crate::superblock::Superblock;
use e2_types::{ByteOrder, ParseError};

/// Direction of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapDirection {
    /// Disk (little-endian) to big-endian native.
    ToNative,
    /// Big-endian native back to disk.
    ToDisk,
}

impl SwapDirection {
    fn orders(self) -> (ByteOrder, ByteOrder) {
        match self {
            Self::ToNative => (ByteOrder::Little, ByteOrder::Big),
            Self::ToDisk => (ByteOrder::Big, ByteOrder::Little),
        }
    }
}

pub fn swap_superblock(region: &[u8], dir: SwapDirection) -> Result<Vec<u8>, ParseError> {
    let (from, to) = dir.orders();
    Superblock::decode(region, from)?.encode(to)
}

pub fn swap_group_desc(
    bytes: &[u8],
    desc_size: u16,
    dir: SwapDirection,
) -> Result<Vec<u8>, ParseError> {
    let (from, to) = dir.orders();
    GroupDesc::decode(bytes, desc_size, from)?.encode(to)
}

pub fn swap_inode(raw: &[u8], dir: SwapDirection) -> Result<Vec<u8>, ParseError> {
    let (from, to) = dir.orders();
    Inode::decode(raw, from)?.encode(to)
}

/// Swap every record header (inode, `rec_len`, name-length word) of a
/// directory block, deleted records included.
pub fn swap_dir_block(
    block: &[u8],
    block_size: u32,
    filetype: bool,
    dir: SwapDirection,
) -> Result<Vec<u8>, ParseError> {
    let (from, to) = dir.orders();
    DirBlock::decode(block, block_size, filetype, from)?.encode(to)
}
