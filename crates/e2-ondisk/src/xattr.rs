use e2_types::{
    EXT2_XATTR_INDEX_POSIX_ACL_ACCESS, EXT2_XATTR_INDEX_POSIX_ACL_DEFAULT,
    EXT2_XATTR_INDEX_SECURITY, EXT2_XATTR_INDEX_SYSTEM, EXT2_XATTR_INDEX_TRUSTED,
    EXT2_XATTR_INDEX_USER, EXT2_XATTR_MAGIC, ParseError, read_le_u16, read_le_u32, write_le_u32,
};
use serde::{Deserialize, Serialize};

/// Size of an external attribute block header.
pub const XATTR_BLOCK_HEADER_LEN: usize = 32;
/// Size of the in-inode attribute area header (the magic word).
pub const XATTR_IBODY_HEADER_LEN: usize = 4;
/// Fixed part of an attribute entry, before the name.
pub const XATTR_ENTRY_HEADER_LEN: usize = 16;
/// Offset of `h_checksum` within the block header.
pub const XATTR_BLOCK_CHECKSUM_OFFSET: usize = 0x10;

/// Namespace prefixes by name index. Longest prefixes first within a shared stem.
pub const XATTR_PREFIXES: &[(u8, &str)] = &[
    (EXT2_XATTR_INDEX_USER, "user."),
    (EXT2_XATTR_INDEX_POSIX_ACL_ACCESS, "system.posix_acl_access"),
    (EXT2_XATTR_INDEX_POSIX_ACL_DEFAULT, "system.posix_acl_default"),
    (EXT2_XATTR_INDEX_TRUSTED, "trusted."),
    (EXT2_XATTR_INDEX_SECURITY, "security."),
    (EXT2_XATTR_INDEX_SYSTEM, "system."),
];

/// Header of an external attribute block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XattrHeader {
    pub magic: u32,
    pub refcount: u32,
    pub blocks: u32,
    pub hash: u32,
    pub checksum: u32,
}

impl XattrHeader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: EXT2_XATTR_MAGIC,
            refcount: 1,
            blocks: 1,
            hash: 0,
            checksum: 0,
        }
    }

    pub fn decode(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < XATTR_BLOCK_HEADER_LEN {
            return Err(ParseError::InsufficientData {
                needed: XATTR_BLOCK_HEADER_LEN,
                offset: 0,
                actual: block.len(),
            });
        }
        let magic = read_le_u32(block, 0x00)?;
        if magic != EXT2_XATTR_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_XATTR_MAGIC),
                actual: u64::from(magic),
            });
        }
        Ok(Self {
            magic,
            refcount: read_le_u32(block, 0x04)?,
            blocks: read_le_u32(block, 0x08)?,
            hash: read_le_u32(block, 0x0C)?,
            checksum: read_le_u32(block, XATTR_BLOCK_CHECKSUM_OFFSET)?,
        })
    }

    /// Write the header into the first 32 bytes of `block`; reserved words are zeroed.
    pub fn encode_into(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if block.len() < XATTR_BLOCK_HEADER_LEN {
            return Err(ParseError::InsufficientData {
                needed: XATTR_BLOCK_HEADER_LEN,
                offset: 0,
                actual: block.len(),
            });
        }
        block[..XATTR_BLOCK_HEADER_LEN].fill(0);
        write_le_u32(block, 0x00, self.magic)?;
        write_le_u32(block, 0x04, self.refcount)?;
        write_le_u32(block, 0x08, self.blocks)?;
        write_le_u32(block, 0x0C, self.hash)?;
        write_le_u32(block, XATTR_BLOCK_CHECKSUM_OFFSET, self.checksum)
    }
}

impl Default for XattrHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded extended attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XattrEntry {
    pub name_index: u8,
    /// Name without the namespace prefix.
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    /// Inode holding the value, for values stored out of line; 0 otherwise.
    pub value_inum: u32,
    pub hash: u32,
}

impl XattrEntry {
    /// Name with its namespace prefix.
    #[must_use]
    pub fn full_name(&self) -> String {
        let prefix = XATTR_PREFIXES
            .iter()
            .find(|(idx, _)| *idx == self.name_index)
            .map_or("unknown.", |(_, p)| p);
        format!("{prefix}{}", String::from_utf8_lossy(&self.name))
    }

    /// Bytes the entry header and padded name take in the entry table.
    #[must_use]
    pub fn entry_size(&self) -> usize {
        (XATTR_ENTRY_HEADER_LEN + self.name.len() + 3) & !3
    }

    /// Bytes the value takes, padded to 4.
    #[must_use]
    pub fn value_size_padded(&self) -> usize {
        if self.value_inum != 0 {
            0
        } else {
            (self.value.len() + 3) & !3
        }
    }
}

/// Decode an entry table.
///
/// `entries` starts at the first entry; `values` is the buffer that entry
/// `value_offs` fields are relative to (the block for external blocks, the
/// area after the magic for in-inode attributes). The table ends at a zero
/// name length and index, or where no full header fits.
pub fn parse_xattr_entries(entries: &[u8], values: &[u8]) -> Result<Vec<XattrEntry>, ParseError> {
    let mut out = Vec::new();
    let mut offset = 0_usize;

    loop {
        if offset + 4 > entries.len() {
            break;
        }
        let name_len = entries[offset];
        let name_index = entries[offset + 1];
        if name_len == 0 && name_index == 0 {
            break;
        }
        if offset + XATTR_ENTRY_HEADER_LEN > entries.len() {
            break;
        }

        let value_offs = usize::from(read_le_u16(entries, offset + 2)?);
        let value_inum = read_le_u32(entries, offset + 4)?;
        let value_size = usize::try_from(read_le_u32(entries, offset + 8)?)
            .map_err(|_| ParseError::IntegerConversion {
                field: "xattr_value_size",
            })?;
        let hash = read_le_u32(entries, offset + 12)?;

        let name_start = offset + XATTR_ENTRY_HEADER_LEN;
        let name_end = name_start + usize::from(name_len);
        let name = entries
            .get(name_start..name_end)
            .ok_or(ParseError::InvalidField {
                field: "xattr_name",
                reason: "name extends past data boundary",
            })?
            .to_vec();

        let value = if value_inum == 0 && value_size > 0 {
            values
                .get(value_offs..value_offs + value_size)
                .ok_or(ParseError::InvalidField {
                    field: "xattr_value",
                    reason: "value extends past data boundary",
                })?
                .to_vec()
        } else {
            Vec::new()
        };

        out.push(XattrEntry {
            name_index,
            name,
            value,
            value_inum,
            hash,
        });
        offset = (name_end + 3) & !3;
    }

    Ok(out)
}

/// Decode the in-inode attribute area (the bytes after `128 + extra_isize`).
///
/// An area without the magic holds no attributes.
pub fn parse_ibody_xattrs(area: &[u8]) -> Result<Vec<XattrEntry>, ParseError> {
    if area.len() < XATTR_IBODY_HEADER_LEN || read_le_u32(area, 0)? != EXT2_XATTR_MAGIC {
        return Ok(Vec::new());
    }
    let body = &area[XATTR_IBODY_HEADER_LEN..];
    parse_xattr_entries(body, body)
}

/// Decode an external attribute block.
pub fn parse_block_xattrs(block: &[u8]) -> Result<(XattrHeader, Vec<XattrEntry>), ParseError> {
    let header = XattrHeader::decode(block)?;
    let entries = parse_xattr_entries(&block[XATTR_BLOCK_HEADER_LEN..], block)?;
    Ok((header, entries))
}
