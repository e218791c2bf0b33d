use e2_types::{ParseError, read_le_u16, read_le_u32, write_le_u16, write_le_u32};
use serde::{Deserialize, Serialize};

pub const EXT4_EXTENT_MAGIC: u16 = 0xF30A;
/// Largest length of an initialized extent.
pub const EXT_INIT_MAX_LEN: u16 = 1 << 15;
/// Size of the header and of each entry.
pub const EXTENT_ENTRY_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentHeader {
    pub magic: u16,
    pub entries: u16,
    pub max_entries: u16,
    pub depth: u16,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub logical_block: u32,
    pub raw_len: u16,
    pub physical_start: u64,
}

impl Extent {
    #[must_use]
    pub fn is_unwritten(self) -> bool {
        self.raw_len > EXT_INIT_MAX_LEN
    }

    #[must_use]
    pub fn actual_len(self) -> u16 {
        if self.raw_len <= EXT_INIT_MAX_LEN {
            self.raw_len
        } else {
            self.raw_len - EXT_INIT_MAX_LEN
        }
    }

    /// Physical block for `lblk` if this extent covers it.
    #[must_use]
    pub fn map(self, lblk: u32) -> Option<u64> {
        let end = u64::from(self.logical_block) + u64::from(self.actual_len());
        (lblk >= self.logical_block && u64::from(lblk) < end)
            .then(|| self.physical_start + u64::from(lblk - self.logical_block))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentIndex {
    pub logical_block: u32,
    pub leaf_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentTree {
    Leaf(Vec<Extent>),
    Index(Vec<ExtentIndex>),
}

/// Decode an extent node (the inode's 60-byte root or a tree block).
pub fn parse_extent_tree(bytes: &[u8]) -> Result<(ExtentHeader, ExtentTree), ParseError> {
    if bytes.len() < EXTENT_ENTRY_LEN {
        return Err(ParseError::InsufficientData {
            needed: EXTENT_ENTRY_LEN,
            offset: 0,
            actual: bytes.len(),
        });
    }

    let header = ExtentHeader {
        magic: read_le_u16(bytes, 0x00)?,
        entries: read_le_u16(bytes, 0x02)?,
        max_entries: read_le_u16(bytes, 0x04)?,
        depth: read_le_u16(bytes, 0x06)?,
        generation: read_le_u32(bytes, 0x08)?,
    };

    if header.magic != EXT4_EXTENT_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(EXT4_EXTENT_MAGIC),
            actual: u64::from(header.magic),
        });
    }
    if header.entries > header.max_entries {
        return Err(ParseError::InvalidField {
            field: "eh_entries",
            reason: "entries exceed max",
        });
    }

    let count = usize::from(header.entries);
    let needed = EXTENT_ENTRY_LEN * (count + 1);
    if bytes.len() < needed {
        return Err(ParseError::InsufficientData {
            needed,
            offset: EXTENT_ENTRY_LEN,
            actual: bytes.len(),
        });
    }

    let bases = (1..=count).map(|i| i * EXTENT_ENTRY_LEN);
    if header.depth == 0 {
        let extents = bases
            .map(|base| {
                let start_hi = u64::from(read_le_u16(bytes, base + 6)?);
                let start_lo = u64::from(read_le_u32(bytes, base + 8)?);
                Ok(Extent {
                    logical_block: read_le_u32(bytes, base)?,
                    raw_len: read_le_u16(bytes, base + 4)?,
                    physical_start: start_lo | (start_hi << 32),
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok((header, ExtentTree::Leaf(extents)))
    } else {
        let indexes = bases
            .map(|base| {
                let leaf_lo = u64::from(read_le_u32(bytes, base + 4)?);
                let leaf_hi = u64::from(read_le_u16(bytes, base + 8)?);
                Ok(ExtentIndex {
                    logical_block: read_le_u32(bytes, base)?,
                    leaf_block: leaf_lo | (leaf_hi << 32),
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok((header, ExtentTree::Index(indexes)))
    }
}

/// Encode a depth-0 root holding `extents` into the inode's 60 `i_block` bytes.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_leaf_root(extents: &[Extent], generation: u32) -> Result<[u8; 60], ParseError> {
    let max = 60 / EXTENT_ENTRY_LEN - 1;
    if extents.len() > max {
        return Err(ParseError::InvalidField {
            field: "eh_entries",
            reason: "more extents than fit in the inode root",
        });
    }
    let mut out = [0_u8; 60];
    write_le_u16(&mut out, 0x00, EXT4_EXTENT_MAGIC)?;
    write_le_u16(&mut out, 0x02, extents.len() as u16)?;
    write_le_u16(&mut out, 0x04, max as u16)?;
    write_le_u16(&mut out, 0x06, 0)?;
    write_le_u32(&mut out, 0x08, generation)?;
    for (i, ext) in extents.iter().enumerate() {
        let base = (i + 1) * EXTENT_ENTRY_LEN;
        write_le_u32(&mut out, base, ext.logical_block)?;
        write_le_u16(&mut out, base + 4, ext.raw_len)?;
        write_le_u16(&mut out, base + 6, (ext.physical_start >> 32) as u16)?;
        write_le_u32(&mut out, base + 8, ext.physical_start as u32)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_root_round_trip() {
        let extents = [
            Extent {
                logical_block: 0,
                raw_len: 4,
                physical_start: 100,
            },
            Extent {
                logical_block: 10,
                raw_len: EXT_INIT_MAX_LEN + 2,
                physical_start: 0x1_0000_0200,
            },
        ];
        let root = encode_leaf_root(&extents, 7).expect("encode");
        let (header, tree) = parse_extent_tree(&root).expect("parse");
        assert_eq!(header.max_entries, 4);
        assert_eq!(header.generation, 7);
        assert_eq!(tree, ExtentTree::Leaf(extents.to_vec()));
        assert!(extents[1].is_unwritten());
        assert_eq!(extents[1].actual_len(), 2);
    }

    #[test]
    fn extent_maps_covered_blocks_only() {
        let ext = Extent {
            logical_block: 8,
            raw_len: 3,
            physical_start: 500,
        };
        assert_eq!(ext.map(8), Some(500));
        assert_eq!(ext.map(10), Some(502));
        assert_eq!(ext.map(11), None);
        assert_eq!(ext.map(7), None);
    }

    #[test]
    fn rejects_bad_magic_and_overfull_root() {
        assert!(parse_extent_tree(&[0_u8; 60]).is_err());
        let five = vec![
            Extent {
                logical_block: 0,
                raw_len: 1,
                physical_start: 1,
            };
            5
        ];
        assert!(encode_leaf_root(&five, 0).is_err());
    }
}
