#![forbid(unsafe_code)]
//! Shared vocabulary for the e2fs workspace: unit-carrying newtypes,
//! on-disk constants, byte-order helpers and checked group arithmetic.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const EXT2_SUPERBLOCK_OFFSET: usize = 1024;
pub const EXT2_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Inode size of revision-0 filesystems, and the fixed "base" part of larger inodes.
pub const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;
/// First non-reserved inode on revision-0 filesystems.
pub const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;
pub const EXT2_GOOD_OLD_REV: u32 = 0;
pub const EXT2_DYNAMIC_REV: u32 = 1;

pub const EXT2_MIN_DESC_SIZE: u16 = 32;
pub const EXT2_MIN_DESC_SIZE_64BIT: u16 = 64;

/// Block-map slots in `i_block`.
pub const EXT2_NDIR_BLOCKS: usize = 12;
pub const EXT2_IND_BLOCK: usize = 12;
pub const EXT2_DIND_BLOCK: usize = 13;
pub const EXT2_TIND_BLOCK: usize = 14;
pub const EXT2_N_BLOCKS: usize = 15;

pub const EXT2_NAME_LEN: usize = 255;

/// Bytes of inline payload that live in `i_block`.
pub const EXT4_MIN_INLINE_DATA_SIZE: usize = 60;
/// An inline directory stores only the parent inode number where `..` would be.
pub const EXT4_INLINE_DATA_DOTDOT_SIZE: usize = 4;

/// Directory-block checksum tail: 12 bytes at the end of each leaf block.
pub const EXT2_DIR_TAIL_SIZE: usize = 12;
pub const EXT2_DIR_TAIL_FILE_TYPE: u8 = 0xDE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Validated block size (must be a power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1024, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a buffer length.
    #[must_use]
    pub fn bytes(self) -> usize {
        self.0 as usize
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Convert a byte offset to a block number (truncating).
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> BlockNumber {
        BlockNumber(byte_offset >> u64::from(self.shift()))
    }

    /// Convert a block number to a byte offset.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }
}

/// Block group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Multiply by a scalar, returning `None` on overflow.
    #[must_use]
    pub fn checked_mul(self, factor: u64) -> Option<Self> {
        self.0.checked_mul(factor).map(Self)
    }

    /// Narrow to `usize`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        usize::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Byte order ──────────────────────────────────────────────────────────────

/// Byte order of an in-memory structure image.
///
/// The disk is always little-endian. `Big` models the native layout a
/// big-endian host keeps after swapping every multi-byte field, so the
/// codec can be exercised against both host flavors on any machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    /// The order of the machine this code is running on.
    #[must_use]
    pub fn host() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    #[inline]
    pub fn read_u16(self, data: &[u8], offset: usize) -> Result<u16, ParseError> {
        let raw = read_fixed::<2>(data, offset)?;
        Ok(match self {
            Self::Little => u16::from_le_bytes(raw),
            Self::Big => u16::from_be_bytes(raw),
        })
    }

    #[inline]
    pub fn read_u32(self, data: &[u8], offset: usize) -> Result<u32, ParseError> {
        let raw = read_fixed::<4>(data, offset)?;
        Ok(match self {
            Self::Little => u32::from_le_bytes(raw),
            Self::Big => u32::from_be_bytes(raw),
        })
    }

    #[inline]
    pub fn read_u64(self, data: &[u8], offset: usize) -> Result<u64, ParseError> {
        let raw = read_fixed::<8>(data, offset)?;
        Ok(match self {
            Self::Little => u64::from_le_bytes(raw),
            Self::Big => u64::from_be_bytes(raw),
        })
    }

    #[inline]
    pub fn write_u16(self, data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        ensure_slice_mut(data, offset, 2)?.copy_from_slice(&bytes);
        Ok(())
    }

    #[inline]
    pub fn write_u32(self, data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        ensure_slice_mut(data, offset, 4)?.copy_from_slice(&bytes);
        Ok(())
    }

    #[inline]
    pub fn write_u64(self, data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        ensure_slice_mut(data, offset, 8)?.copy_from_slice(&bytes);
        Ok(())
    }
}

// ── Slice helpers ───────────────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    ByteOrder::Little.read_u16(data, offset)
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    ByteOrder::Little.read_u32(data, offset)
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    ByteOrder::Little.read_u64(data, offset)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ByteOrder::Little.write_u16(data, offset, value)
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ByteOrder::Little.write_u32(data, offset, value)
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

#[must_use]
pub fn ext2_block_size_from_log(log_block_size: u32) -> Option<u32> {
    let shift = 10_u32.checked_add(log_block_size)?;
    1_u32.checked_shl(shift)
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InodeNumber {
    pub const BAD_BLOCKS: Self = Self(1);
    pub const ROOT: Self = Self(2);
    pub const JOURNAL: Self = Self(8);

    /// Narrow to the 32-bit on-disk width.
    pub fn to_u32(self) -> Result<u32, ParseError> {
        u32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "inode_number",
        })
    }
}

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Narrow to `u32`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_u32(self) -> Result<u32, ParseError> {
        u32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "block_number",
        })
    }
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u16 = 0o010_000;
/// Character device.
pub const S_IFCHR: u16 = 0o020_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Block device.
pub const S_IFBLK: u16 = 0o060_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140_000;

// ── Inode flags (i_flags) ───────────────────────────────────────────────────

/// Immutable file.
pub const EXT2_IMMUTABLE_FL: u32 = 0x0000_0010;
/// Append-only file.
pub const EXT2_APPEND_FL: u32 = 0x0000_0020;
/// Do not update access time.
pub const EXT2_NOATIME_FL: u32 = 0x0000_0080;
/// Hash-indexed directory.
pub const EXT2_INDEX_FL: u32 = 0x0000_1000;
/// Set to each huge file.
pub const EXT4_HUGE_FILE_FL: u32 = 0x0004_0000;
/// Inode uses extents.
pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
/// Inode used for large EA.
pub const EXT4_EA_INODE_FL: u32 = 0x0020_0000;
/// Inode has inline data.
pub const EXT4_INLINE_DATA_FL: u32 = 0x1000_0000;

/// Maximum fast symlink target size (stored in the inode's i_block area).
pub const EXT2_FAST_SYMLINK_MAX: usize = 60;

// ── Extended attribute name indices ─────────────────────────────────────────

/// User extended attributes (user.*)
pub const EXT2_XATTR_INDEX_USER: u8 = 1;
/// POSIX ACL access.
pub const EXT2_XATTR_INDEX_POSIX_ACL_ACCESS: u8 = 2;
/// POSIX ACL default.
pub const EXT2_XATTR_INDEX_POSIX_ACL_DEFAULT: u8 = 3;
/// Trusted extended attributes (trusted.*)
pub const EXT2_XATTR_INDEX_TRUSTED: u8 = 4;
/// Lustre (reserved).
pub const EXT2_XATTR_INDEX_LUSTRE: u8 = 5;
/// Security extended attributes (security.*)
pub const EXT2_XATTR_INDEX_SECURITY: u8 = 6;
/// System extended attributes (system.*), home of `system.data`.
pub const EXT2_XATTR_INDEX_SYSTEM: u8 = 7;
/// System richacl.
pub const EXT2_XATTR_INDEX_RICHACL: u8 = 8;

/// Magic number opening xattr blocks and the in-inode xattr area.
pub const EXT2_XATTR_MAGIC: u32 = 0xEA02_0000;

/// Name suffix (under `system.`) of the inline-data overflow attribute.
pub const INLINE_DATA_XATTR_NAME: &str = "data";

// ── Free-standing checked arithmetic functions ──────────────────────────────

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Compute the block group that contains a given block.
///
/// `first_data_block` is 1 for 1K-block filesystems and 0 otherwise.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // group count is u32
pub fn block_to_group(
    block: BlockNumber,
    blocks_per_group: u32,
    first_data_block: u32,
) -> GroupNumber {
    let adjusted = block.0.saturating_sub(u64::from(first_data_block));
    GroupNumber((adjusted / u64::from(blocks_per_group)) as u32)
}

/// Index of a block within its group's block bitmap.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn block_index_in_group(block: BlockNumber, blocks_per_group: u32, first_data_block: u32) -> u32 {
    let adjusted = block.0.saturating_sub(u64::from(first_data_block));
    (adjusted % u64::from(blocks_per_group)) as u32
}

/// Compute the first block of a given block group.
#[must_use]
pub fn group_first_block(
    group: GroupNumber,
    blocks_per_group: u32,
    first_data_block: u32,
) -> Option<BlockNumber> {
    let offset = u64::from(group.0).checked_mul(u64::from(blocks_per_group))?;
    offset
        .checked_add(u64::from(first_data_block))
        .map(BlockNumber)
}

/// Compute the inode's block group from its inode number.
///
/// Inode numbers are 1-indexed; group assignment uses `(ino - 1) / inodes_per_group`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn inode_to_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    GroupNumber(((ino.0.saturating_sub(1)) / u64::from(inodes_per_group)) as u32)
}

/// Compute the index of an inode within its block group.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // modulo by u32 always fits in u32
pub fn inode_index_in_group(ino: InodeNumber, inodes_per_group: u32) -> u32 {
    ((ino.0.saturating_sub(1)) % u64::from(inodes_per_group)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(
            ByteOrder::Big.read_u16(&bytes, 0).expect("u16"),
            0x3412,
            "big-endian view reads the bytes in the other order"
        );
    }

    #[test]
    fn test_write_helpers_round_trip() {
        let mut buf = [0_u8; 8];
        for order in [ByteOrder::Little, ByteOrder::Big] {
            order.write_u32(&mut buf, 2, 0xDEAD_BEEF).expect("write");
            assert_eq!(order.read_u32(&buf, 2).expect("read"), 0xDEAD_BEEF);
        }
        assert!(write_le_u32(&mut buf, 6, 1).is_err());
    }

    #[test]
    fn test_ensure_slice_reports_shortfall() {
        let data = [0_u8; 4];
        assert_eq!(
            ensure_slice(&data, 2, 4),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 2,
                actual: 2,
            })
        );
    }

    #[test]
    fn test_trim_nul_padded() {
        let raw = b"e2fs\0\0\0\0";
        assert_eq!(trim_nul_padded(raw), "e2fs");
    }

    #[test]
    fn test_ext2_block_size_from_log() {
        assert_eq!(ext2_block_size_from_log(0), Some(1024));
        assert_eq!(ext2_block_size_from_log(1), Some(2048));
        assert_eq!(ext2_block_size_from_log(2), Some(4096));
        assert_eq!(ext2_block_size_from_log(40), None);
    }

    #[test]
    fn test_block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(1024).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert_eq!(BlockSize::new(4096).unwrap().get(), 4096);
        assert_eq!(BlockSize::new(4096).unwrap().shift(), 12);

        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(512).is_err());
        assert!(BlockSize::new(131_072).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn test_block_size_conversions() {
        let bs = BlockSize::new(1024).unwrap();
        assert_eq!(bs.byte_to_block(0), BlockNumber(0));
        assert_eq!(bs.byte_to_block(1024), BlockNumber(1));
        assert_eq!(bs.byte_to_block(2047), BlockNumber(1));
        assert_eq!(bs.block_to_byte(BlockNumber(100)), Some(102_400));
        assert_eq!(bs.block_to_byte(BlockNumber(u64::MAX)), None);
    }

    #[test]
    fn test_inode_group_math() {
        assert_eq!(inode_to_group(InodeNumber(1), 2048), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(2048), 2048), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(2049), 2048), GroupNumber(1));

        assert_eq!(inode_index_in_group(InodeNumber(1), 2048), 0);
        assert_eq!(inode_index_in_group(InodeNumber(2), 2048), 1);
        assert_eq!(inode_index_in_group(InodeNumber(2049), 2048), 0);
    }

    #[test]
    fn test_block_group_math() {
        // 1K blocks, first_data_block = 1, 8192 blocks per group
        assert_eq!(block_to_group(BlockNumber(1), 8192, 1), GroupNumber(0));
        assert_eq!(block_to_group(BlockNumber(8192), 8192, 1), GroupNumber(0));
        assert_eq!(block_to_group(BlockNumber(8193), 8192, 1), GroupNumber(1));
        assert_eq!(block_index_in_group(BlockNumber(8193), 8192, 1), 0);
        assert_eq!(block_index_in_group(BlockNumber(10), 8192, 1), 9);
        assert_eq!(
            group_first_block(GroupNumber(1), 8192, 1),
            Some(BlockNumber(8193))
        );

        // 4K blocks, first_data_block = 0
        assert_eq!(block_to_group(BlockNumber(32768), 32768, 0), GroupNumber(1));
        assert_eq!(
            group_first_block(GroupNumber(0), 32768, 0),
            Some(BlockNumber(0))
        );
    }

    #[test]
    fn test_inode_number_narrowing() {
        assert_eq!(InodeNumber(42).to_u32(), Ok(42));
        assert!(InodeNumber(u64::from(u32::MAX) + 1).to_u32().is_err());
        assert_eq!(InodeNumber::ROOT, InodeNumber(2));
    }

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_down(4097, 4096), Some(4096));
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_up(0, 512), Some(0));
        assert_eq!(align_up(u64::MAX, 4096), None);
        assert_eq!(align_down(100, 0), None);
        assert_eq!(align_down(100, 3), None);
    }

    #[test]
    fn test_u64_narrowing() {
        assert_eq!(u64_to_u32(u64::from(u32::MAX), "test"), Ok(u32::MAX));
        assert!(u64_to_u32(u64::from(u32::MAX) + 1, "test").is_err());
        assert_eq!(u64_to_usize(42, "test"), Ok(42));
    }
}
