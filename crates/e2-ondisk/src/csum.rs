//! Metadata checksums.
//!
//! Every function works on disk-order (little-endian) bytes. CRC32C values
//! follow the kernel's chaining convention, `crc32c_append(seed, data)`;
//! the legacy group descriptor checksum is CRC16 (reflected 0x8005).

use crate::extent::EXTENT_ENTRY_LEN;
use crate::group::GD_CHECKSUM_OFFSET;
use crate::inode::{I_CHECKSUM_HI_OFFSET, I_CHECKSUM_LO_OFFSET, I_EXTRA_ISIZE_OFFSET};
use crate::superblock::{IncompatFeatures, SUPERBLOCK_CHECKSUM_OFFSET, Superblock};
use crate::xattr::XATTR_BLOCK_CHECKSUM_OFFSET;
use e2_types::{
    EXT2_GOOD_OLD_INODE_SIZE, ParseError, read_le_u16, read_le_u32, write_le_u16, write_le_u32,
};

use crc32c::crc32c_append;

fn mismatch(field: &'static str, reason: &'static str) -> ParseError {
    ParseError::InvalidField { field, reason }
}

fn need(data: &[u8], needed: usize) -> Result<(), ParseError> {
    if data.len() < needed {
        return Err(ParseError::InsufficientData {
            needed,
            offset: 0,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Filesystem-wide checksum seed.
#[must_use]
pub fn csum_seed(sb: &Superblock) -> u32 {
    if sb.has_incompat(IncompatFeatures::CSUM_SEED) {
        sb.checksum_seed
    } else {
        crc32c_append(!0_u32, &sb.uuid)
    }
}

/// Seed for per-inode structures: chained over the inode number and generation.
#[must_use]
pub fn inode_seed(seed: u32, ino: u32, generation: u32) -> u32 {
    let s = crc32c_append(seed, &ino.to_le_bytes());
    crc32c_append(s, &generation.to_le_bytes())
}

// ── Superblock ──────────────────────────────────────────────────────────────

pub fn superblock_checksum(region: &[u8]) -> Result<u32, ParseError> {
    need(region, SUPERBLOCK_CHECKSUM_OFFSET + 4)?;
    Ok(crc32c_append(!0_u32, &region[..SUPERBLOCK_CHECKSUM_OFFSET]))
}

pub fn set_superblock_checksum(region: &mut [u8]) -> Result<u32, ParseError> {
    let csum = superblock_checksum(region)?;
    write_le_u32(region, SUPERBLOCK_CHECKSUM_OFFSET, csum)?;
    Ok(csum)
}

pub fn verify_superblock_checksum(region: &[u8]) -> Result<(), ParseError> {
    if superblock_checksum(region)? != read_le_u32(region, SUPERBLOCK_CHECKSUM_OFFSET)? {
        return Err(mismatch("s_checksum", "superblock CRC32C mismatch"));
    }
    Ok(())
}

// ── Group descriptors ───────────────────────────────────────────────────────

/// CRC16 as used by `uninit_bg`/`gdt_csum`.
#[must_use]
pub fn crc16(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
        }
    }
    crc
}

/// Checksum for descriptor `group`, or `None` when neither
/// `metadata_csum` nor `gdt_csum` is enabled.
#[allow(clippy::cast_possible_truncation)]
pub fn group_desc_checksum(
    sb: &Superblock,
    group: u32,
    raw_gd: &[u8],
) -> Result<Option<u16>, ParseError> {
    let ds = usize::from(sb.group_desc_size());
    need(raw_gd, ds)?;
    let le_group = group.to_le_bytes();
    let after = GD_CHECKSUM_OFFSET + 2;

    if sb.has_metadata_csum() {
        let mut csum = crc32c_append(csum_seed(sb), &le_group);
        csum = crc32c_append(csum, &raw_gd[..GD_CHECKSUM_OFFSET]);
        csum = crc32c_append(csum, &[0, 0]);
        if after < ds {
            csum = crc32c_append(csum, &raw_gd[after..ds]);
        }
        return Ok(Some((csum & 0xFFFF) as u16));
    }
    if sb.has_group_desc_csum() {
        let mut crc = crc16(!0, &sb.uuid);
        crc = crc16(crc, &le_group);
        crc = crc16(crc, &raw_gd[..GD_CHECKSUM_OFFSET]);
        if after < ds {
            crc = crc16(crc, &raw_gd[after..ds]);
        }
        return Ok(Some(crc));
    }
    Ok(None)
}

/// Store the descriptor checksum in place; a no-op without a checksum feature.
pub fn set_group_desc_checksum(
    sb: &Superblock,
    group: u32,
    raw_gd: &mut [u8],
) -> Result<(), ParseError> {
    if let Some(csum) = group_desc_checksum(sb, group, raw_gd)? {
        write_le_u16(raw_gd, GD_CHECKSUM_OFFSET, csum)?;
    }
    Ok(())
}

pub fn verify_group_desc_checksum(
    sb: &Superblock,
    group: u32,
    raw_gd: &[u8],
) -> Result<(), ParseError> {
    match group_desc_checksum(sb, group, raw_gd)? {
        Some(expected) if expected != read_le_u16(raw_gd, GD_CHECKSUM_OFFSET)? => Err(mismatch(
            "bg_checksum",
            "group descriptor checksum mismatch",
        )),
        _ => Ok(()),
    }
}

/// Bitmap checksum over the first `bytes` of `bitmap`.
#[must_use]
pub fn bitmap_checksum(seed: u32, bitmap: &[u8], bytes: usize) -> u32 {
    crc32c_append(seed, &bitmap[..bytes.min(bitmap.len())])
}

// ── Inodes ──────────────────────────────────────────────────────────────────

fn inode_has_csum_hi(raw: &[u8]) -> bool {
    raw.len() >= I_CHECKSUM_HI_OFFSET + 2
        && read_le_u16(raw, I_EXTRA_ISIZE_OFFSET).is_ok_and(|extra| {
            usize::from(EXT2_GOOD_OLD_INODE_SIZE) + usize::from(extra) >= I_CHECKSUM_HI_OFFSET + 2
        })
}

/// Checksum of a whole on-disk inode record with both checksum fields
/// treated as zero. Truncated to 16 bits when the record has no room for
/// `i_checksum_hi`.
pub fn inode_checksum(raw: &[u8], seed: u32, ino: u32) -> Result<u32, ParseError> {
    let base = usize::from(EXT2_GOOD_OLD_INODE_SIZE);
    need(raw, base)?;
    let generation = read_le_u32(raw, 0x64)?;
    let mut csum = inode_seed(seed, ino, generation);

    csum = crc32c_append(csum, &raw[..I_CHECKSUM_LO_OFFSET]);
    csum = crc32c_append(csum, &[0, 0]);
    csum = crc32c_append(csum, &raw[I_CHECKSUM_LO_OFFSET + 2..base]);

    if raw.len() > base {
        if inode_has_csum_hi(raw) {
            csum = crc32c_append(csum, &raw[base..I_CHECKSUM_HI_OFFSET]);
            csum = crc32c_append(csum, &[0, 0]);
            csum = crc32c_append(csum, &raw[I_CHECKSUM_HI_OFFSET + 2..]);
        } else {
            csum = crc32c_append(csum, &raw[base..]);
        }
    }

    if !inode_has_csum_hi(raw) {
        csum &= 0xFFFF;
    }
    Ok(csum)
}

#[allow(clippy::cast_possible_truncation)]
pub fn set_inode_checksum(raw: &mut [u8], seed: u32, ino: u32) -> Result<u32, ParseError> {
    let csum = inode_checksum(raw, seed, ino)?;
    write_le_u16(raw, I_CHECKSUM_LO_OFFSET, csum as u16)?;
    if inode_has_csum_hi(raw) {
        write_le_u16(raw, I_CHECKSUM_HI_OFFSET, (csum >> 16) as u16)?;
    }
    Ok(csum)
}

pub fn verify_inode_checksum(raw: &[u8], seed: u32, ino: u32) -> Result<(), ParseError> {
    let lo = u32::from(read_le_u16(raw, I_CHECKSUM_LO_OFFSET)?);
    let hi = if inode_has_csum_hi(raw) {
        u32::from(read_le_u16(raw, I_CHECKSUM_HI_OFFSET)?)
    } else {
        0
    };
    if inode_checksum(raw, seed, ino)? != lo | (hi << 16) {
        return Err(mismatch("i_checksum", "inode CRC32C mismatch"));
    }
    Ok(())
}

// ── Directory blocks ────────────────────────────────────────────────────────

/// Checksum of a leaf directory block, covering everything before the
/// tail's checksum word.
pub fn dir_block_checksum(
    block: &[u8],
    seed: u32,
    ino: u32,
    generation: u32,
) -> Result<u32, ParseError> {
    need(block, 12)?;
    let tail_off = block.len() - 4;
    Ok(crc32c_append(inode_seed(seed, ino, generation), &block[..tail_off]))
}

pub fn set_dir_block_checksum(
    block: &mut [u8],
    seed: u32,
    ino: u32,
    generation: u32,
) -> Result<(), ParseError> {
    let csum = dir_block_checksum(block, seed, ino, generation)?;
    let off = block.len() - 4;
    write_le_u32(block, off, csum)
}

pub fn verify_dir_block_checksum(
    block: &[u8],
    seed: u32,
    ino: u32,
    generation: u32,
) -> Result<(), ParseError> {
    let expected = dir_block_checksum(block, seed, ino, generation)?;
    if expected != read_le_u32(block, block.len() - 4)? {
        return Err(mismatch("det_checksum", "directory block CRC32C mismatch"));
    }
    Ok(())
}

// ── Extended attribute blocks ───────────────────────────────────────────────

/// Checksum of an external attribute block at physical block `blocknr`.
pub fn xattr_block_checksum(block: &[u8], seed: u32, blocknr: u64) -> Result<u32, ParseError> {
    need(block, XATTR_BLOCK_CHECKSUM_OFFSET + 4)?;
    let mut csum = crc32c_append(seed, &blocknr.to_le_bytes());
    csum = crc32c_append(csum, &block[..XATTR_BLOCK_CHECKSUM_OFFSET]);
    csum = crc32c_append(csum, &[0, 0, 0, 0]);
    Ok(crc32c_append(csum, &block[XATTR_BLOCK_CHECKSUM_OFFSET + 4..]))
}

pub fn set_xattr_block_checksum(block: &mut [u8], seed: u32, blocknr: u64) -> Result<(), ParseError> {
    let csum = xattr_block_checksum(block, seed, blocknr)?;
    write_le_u32(block, XATTR_BLOCK_CHECKSUM_OFFSET, csum)
}

pub fn verify_xattr_block_checksum(block: &[u8], seed: u32, blocknr: u64) -> Result<(), ParseError> {
    if xattr_block_checksum(block, seed, blocknr)? != read_le_u32(block, XATTR_BLOCK_CHECKSUM_OFFSET)? {
        return Err(mismatch("h_checksum", "xattr block CRC32C mismatch"));
    }
    Ok(())
}

// ── Extent blocks ───────────────────────────────────────────────────────────

/// Checksum of a non-root extent node. The checksum word follows the last
/// possible entry (`eh_max`).
pub fn extent_block_checksum(
    block: &[u8],
    seed: u32,
    ino: u32,
    generation: u32,
) -> Result<(u32, usize), ParseError> {
    let max = usize::from(read_le_u16(block, 0x04)?);
    let tail = EXTENT_ENTRY_LEN * (max + 1);
    need(block, tail + 4)?;
    Ok((crc32c_append(inode_seed(seed, ino, generation), &block[..tail]), tail))
}

pub fn verify_extent_block_checksum(
    block: &[u8],
    seed: u32,
    ino: u32,
    generation: u32,
) -> Result<(), ParseError> {
    let (expected, tail) = extent_block_checksum(block, seed, ino, generation)?;
    if expected != read_le_u32(block, tail)? {
        return Err(mismatch("eb_checksum", "extent block CRC32C mismatch"));
    }
    Ok(())
}
