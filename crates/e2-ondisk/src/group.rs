use e2_types::{ByteOrder, EXT2_MIN_DESC_SIZE, EXT2_MIN_DESC_SIZE_64BIT, ParseError};
use serde::{Deserialize, Serialize};

/// `bg_flags`: inode table and bitmap are not initialized.
pub const EXT2_BG_INODE_UNINIT: u16 = 0x0001;
/// `bg_flags`: block bitmap is not initialized.
pub const EXT2_BG_BLOCK_UNINIT: u16 = 0x0002;
/// `bg_flags`: inode table is zeroed.
pub const EXT2_BG_INODE_ZEROED: u16 = 0x0004;

/// Offset of `bg_checksum` within a group descriptor.
pub const GD_CHECKSUM_OFFSET: usize = 0x1E;

/// A block group descriptor, 32 bytes classic or 64 bytes with the 64bit feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub flags: u16,
    pub exclude_bitmap: u64,
    pub block_bitmap_csum: u32,
    pub inode_bitmap_csum: u32,
    pub itable_unused: u32,
    pub checksum: u16,

    #[serde(skip)]
    raw: Vec<u8>,
}

impl GroupDesc {
    /// A descriptor with every field zero, sized for `desc_size`.
    #[must_use]
    pub fn zeroed(desc_size: u16) -> Self {
        Self {
            block_bitmap: 0,
            inode_bitmap: 0,
            inode_table: 0,
            free_blocks_count: 0,
            free_inodes_count: 0,
            used_dirs_count: 0,
            flags: 0,
            exclude_bitmap: 0,
            block_bitmap_csum: 0,
            inode_bitmap_csum: 0,
            itable_unused: 0,
            checksum: 0,
            raw: vec![0; usize::from(desc_size.max(EXT2_MIN_DESC_SIZE))],
        }
    }

    pub fn decode(bytes: &[u8], desc_size: u16, order: ByteOrder) -> Result<Self, ParseError> {
        let ds = usize::from(desc_size);
        if ds < usize::from(EXT2_MIN_DESC_SIZE) {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "descriptor size must be >= 32",
            });
        }
        if bytes.len() < ds {
            return Err(ParseError::InsufficientData {
                needed: ds,
                offset: 0,
                actual: bytes.len(),
            });
        }
        let bytes = &bytes[..ds];
        let u16_at = |off| order.read_u16(bytes, off).map(u32::from);
        let u32_at = |off| order.read_u32(bytes, off).map(u64::from);

        let mut gd = Self {
            block_bitmap: u32_at(0x00)?,
            inode_bitmap: u32_at(0x04)?,
            inode_table: u32_at(0x08)?,
            free_blocks_count: u16_at(0x0C)?,
            free_inodes_count: u16_at(0x0E)?,
            used_dirs_count: u16_at(0x10)?,
            flags: order.read_u16(bytes, 0x12)?,
            exclude_bitmap: u32_at(0x14)?,
            block_bitmap_csum: u16_at(0x18)?,
            inode_bitmap_csum: u16_at(0x1A)?,
            itable_unused: u16_at(0x1C)?,
            checksum: order.read_u16(bytes, GD_CHECKSUM_OFFSET)?,
            raw: bytes.to_vec(),
        };

        if ds >= usize::from(EXT2_MIN_DESC_SIZE_64BIT) {
            gd.block_bitmap |= u32_at(0x20)? << 32;
            gd.inode_bitmap |= u32_at(0x24)? << 32;
            gd.inode_table |= u32_at(0x28)? << 32;
            gd.free_blocks_count |= u16_at(0x2C)? << 16;
            gd.free_inodes_count |= u16_at(0x2E)? << 16;
            gd.used_dirs_count |= u16_at(0x30)? << 16;
            gd.itable_unused |= u16_at(0x32)? << 16;
            gd.exclude_bitmap |= u32_at(0x34)? << 32;
            gd.block_bitmap_csum |= u16_at(0x38)? << 16;
            gd.inode_bitmap_csum |= u16_at(0x3A)? << 16;
        }
        Ok(gd)
    }

    /// Encode back into the descriptor's own size.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, order: ByteOrder) -> Result<Vec<u8>, ParseError> {
        let mut out = self.raw.clone();
        let buf = out.as_mut_slice();
        let lo16 = |v: u32| (v & 0xFFFF) as u16;
        let lo32 = |v: u64| (v & 0xFFFF_FFFF) as u32;

        order.write_u32(buf, 0x00, lo32(self.block_bitmap))?;
        order.write_u32(buf, 0x04, lo32(self.inode_bitmap))?;
        order.write_u32(buf, 0x08, lo32(self.inode_table))?;
        order.write_u16(buf, 0x0C, lo16(self.free_blocks_count))?;
        order.write_u16(buf, 0x0E, lo16(self.free_inodes_count))?;
        order.write_u16(buf, 0x10, lo16(self.used_dirs_count))?;
        order.write_u16(buf, 0x12, self.flags)?;
        order.write_u32(buf, 0x14, lo32(self.exclude_bitmap))?;
        order.write_u16(buf, 0x18, lo16(self.block_bitmap_csum))?;
        order.write_u16(buf, 0x1A, lo16(self.inode_bitmap_csum))?;
        order.write_u16(buf, 0x1C, lo16(self.itable_unused))?;
        order.write_u16(buf, GD_CHECKSUM_OFFSET, self.checksum)?;

        if buf.len() >= usize::from(EXT2_MIN_DESC_SIZE_64BIT) {
            order.write_u32(buf, 0x20, (self.block_bitmap >> 32) as u32)?;
            order.write_u32(buf, 0x24, (self.inode_bitmap >> 32) as u32)?;
            order.write_u32(buf, 0x28, (self.inode_table >> 32) as u32)?;
            order.write_u16(buf, 0x2C, (self.free_blocks_count >> 16) as u16)?;
            order.write_u16(buf, 0x2E, (self.free_inodes_count >> 16) as u16)?;
            order.write_u16(buf, 0x30, (self.used_dirs_count >> 16) as u16)?;
            order.write_u16(buf, 0x32, (self.itable_unused >> 16) as u16)?;
            order.write_u32(buf, 0x34, (self.exclude_bitmap >> 32) as u32)?;
            order.write_u16(buf, 0x38, (self.block_bitmap_csum >> 16) as u16)?;
            order.write_u16(buf, 0x3A, (self.inode_bitmap_csum >> 16) as u16)?;
        }
        Ok(out)
    }

    #[must_use]
    pub fn desc_size(&self) -> usize {
        self.raw.len()
    }

    #[must_use]
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Equal when both encode to the same descriptor bytes, so preserved bytes the
/// model does not name count too.
impl PartialEq for GroupDesc {
    fn eq(&self, other: &Self) -> bool {
        self.encode(ByteOrder::Little).ok() == other.encode(ByteOrder::Little).ok()
    }
}

impl Eq for GroupDesc {}
