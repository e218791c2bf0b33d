#![forbid(unsafe_code)]
//! Extended attributes (xattr).
//!
//! Namespace routing between full names (`user.color`) and the on-disk
//! `(name_index, suffix)` pair, entry and block hashing, and the writer
//! side of the format: packing a set of attributes into the in-inode area
//! first and a single external block second.
//!
//! Decoding lives in `e2_ondisk::xattr`; this crate produces images that
//! decoder reads back.

use e2_error::{E2Error, Result};
use e2_ondisk::XattrEntry;
use e2_ondisk::xattr::{
    XATTR_BLOCK_HEADER_LEN, XATTR_ENTRY_HEADER_LEN, XATTR_IBODY_HEADER_LEN, XATTR_PREFIXES,
    XattrHeader,
};
use e2_types::{
    EXT2_XATTR_INDEX_POSIX_ACL_ACCESS, EXT2_XATTR_INDEX_POSIX_ACL_DEFAULT, EXT2_XATTR_INDEX_SYSTEM,
    EXT2_XATTR_MAGIC, INLINE_DATA_XATTR_NAME,
};

/// Bytes that terminate an entry table.
const ENTRY_TABLE_END: usize = 4;

// ── Naming ──────────────────────────────────────────────────────────────────

/// Split a full attribute name into its namespace index and suffix.
///
/// The longest matching prefix wins, so `system.posix_acl_access` maps to
/// its own index with an empty suffix. Names under an unknown namespace
/// keep index 0 and the whole name.
#[must_use]
pub fn split_name(full: &str) -> (u8, &[u8]) {
    XATTR_PREFIXES
        .iter()
        .filter(|(_, prefix)| full.starts_with(prefix))
        .max_by_key(|(_, prefix)| prefix.len())
        .map_or((0, full.as_bytes()), |(idx, prefix)| {
            (*idx, &full.as_bytes()[prefix.len()..])
        })
}

/// Whether `entry` is the `system.data` attribute that carries inline data.
#[must_use]
pub fn is_inline_data(entry: &XattrEntry) -> bool {
    entry.name_index == EXT2_XATTR_INDEX_SYSTEM && entry.name == INLINE_DATA_XATTR_NAME.as_bytes()
}

/// Build an entry from a full name and value, hash included.
pub fn make_entry(full_name: &str, value: &[u8]) -> Result<XattrEntry> {
    let (name_index, name) = split_name(full_name);
    if name.len() > usize::from(u8::MAX) {
        return Err(E2Error::InvalidArgument(format!(
            "xattr name too long: {} bytes",
            name.len()
        )));
    }
    let acl = matches!(
        name_index,
        EXT2_XATTR_INDEX_POSIX_ACL_ACCESS | EXT2_XATTR_INDEX_POSIX_ACL_DEFAULT
    );
    if name.is_empty() && !acl {
        return Err(E2Error::InvalidArgument(format!(
            "xattr name has no suffix: {full_name:?}"
        )));
    }
    Ok(XattrEntry {
        name_index,
        name: name.to_vec(),
        value: value.to_vec(),
        value_inum: 0,
        hash: entry_hash(name, value),
    })
}

// ── Hashing ─────────────────────────────────────────────────────────────────

fn signed_byte(b: u8) -> u32 {
    u32::from_ne_bytes(i32::from(i8::from_ne_bytes([b])).to_ne_bytes())
}

/// Entry hash over the name suffix and the value padded to 4 bytes.
///
/// Name bytes are folded in as signed chars, as Linux computes them.
#[must_use]
pub fn entry_hash(name: &[u8], value: &[u8]) -> u32 {
    let mut hash = 0_u32;
    for &b in name {
        hash = hash.rotate_left(5) ^ signed_byte(b);
    }
    for chunk in value.chunks(4) {
        let mut word = [0_u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        hash = hash.rotate_left(16) ^ u32::from_le_bytes(word);
    }
    hash
}

/// Block hash over the entry hashes in table order; zero if any entry is
/// unhashed.
#[must_use]
pub fn block_hash(entries: &[XattrEntry]) -> u32 {
    let mut hash = 0_u32;
    for entry in entries {
        if entry.hash == 0 {
            return 0;
        }
        hash = hash.rotate_left(16) ^ entry.hash;
    }
    hash
}

// ── Sizing ──────────────────────────────────────────────────────────────────

fn entry_cost(entry: &XattrEntry) -> usize {
    entry.entry_size() + entry.value_size_padded()
}

/// Bytes an in-inode area needs for `entries`, magic and terminator included.
#[must_use]
pub fn ibody_required(entries: &[XattrEntry]) -> usize {
    if entries.is_empty() {
        return 0;
    }
    XATTR_IBODY_HEADER_LEN + ENTRY_TABLE_END + entries.iter().map(entry_cost).sum::<usize>()
}

/// Bytes an external block needs for `entries`, header and terminator included.
#[must_use]
pub fn block_required(entries: &[XattrEntry]) -> usize {
    XATTR_BLOCK_HEADER_LEN + ENTRY_TABLE_END + entries.iter().map(entry_cost).sum::<usize>()
}

/// Bytes still free in an in-inode area of `area_len` holding `entries`.
#[must_use]
pub fn ibody_free(area_len: usize, entries: &[XattrEntry]) -> usize {
    let used = if entries.is_empty() {
        XATTR_IBODY_HEADER_LEN + ENTRY_TABLE_END
    } else {
        ibody_required(entries)
    };
    area_len.saturating_sub(used)
}

// ── Packing ─────────────────────────────────────────────────────────────────

/// Where each attribute of a set ends up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    pub ibody: Vec<XattrEntry>,
    pub block: Vec<XattrEntry>,
}

impl Placement {
    /// Whether an external block is needed.
    #[must_use]
    pub fn needs_block(&self) -> bool {
        !self.block.is_empty()
    }
}

/// Distribute `entries` between the in-inode area and one external block.
///
/// `system.data` is placed first so inline data stays in the inode; the
/// rest keep their order and go into the inode while they fit. What is
/// left must fit one block of `block_size`, else [`E2Error::EaNoSpace`].
pub fn pack(entries: &[XattrEntry], ibody_len: usize, block_size: usize) -> Result<Placement> {
    let mut ordered: Vec<&XattrEntry> = entries.iter().collect();
    ordered.sort_by_key(|e| !is_inline_data(e));

    let mut placement = Placement::default();
    let mut ibody_used = XATTR_IBODY_HEADER_LEN + ENTRY_TABLE_END;
    for entry in ordered {
        if entry.value_inum != 0 {
            return Err(E2Error::UnsupportedFeature(
                "xattr values stored in inodes".to_owned(),
            ));
        }
        let cost = entry_cost(entry);
        if placement.block.is_empty() && ibody_used + cost <= ibody_len {
            ibody_used += cost;
            placement.ibody.push(entry.clone());
        } else {
            placement.block.push(entry.clone());
        }
    }
    if placement.needs_block() && block_required(&placement.block) > block_size {
        return Err(E2Error::EaNoSpace);
    }
    Ok(placement)
}

/// Lay out an entry table and its values.
///
/// Entries are written from `table_start`, values from the end of `buf`
/// downward. Value offsets are relative to `base`.
fn write_table(buf: &mut [u8], table_start: usize, base: usize, entries: &[XattrEntry]) -> Result<()> {
    let mut off = table_start;
    let mut value_end = buf.len();
    for entry in entries {
        let name_len = u8::try_from(entry.name.len())
            .map_err(|_| E2Error::InvalidArgument("xattr name too long".to_owned()))?;
        let padded = entry.value_size_padded();
        let value_start = value_end
            .checked_sub(padded)
            .filter(|&start| start >= off + entry.entry_size() + ENTRY_TABLE_END)
            .ok_or(E2Error::EaNoSpace)?;
        let value_offs = if entry.value.is_empty() {
            0
        } else {
            u16::try_from(value_start - base).map_err(|_| E2Error::EaNoSpace)?
        };
        let value_size = u32::try_from(entry.value.len()).map_err(|_| E2Error::EaNoSpace)?;

        buf[off] = name_len;
        buf[off + 1] = entry.name_index;
        buf[off + 2..off + 4].copy_from_slice(&value_offs.to_le_bytes());
        buf[off + 4..off + 8].copy_from_slice(&entry.value_inum.to_le_bytes());
        buf[off + 8..off + 12].copy_from_slice(&value_size.to_le_bytes());
        buf[off + 12..off + 16].copy_from_slice(&entry.hash.to_le_bytes());
        let name_start = off + XATTR_ENTRY_HEADER_LEN;
        buf[name_start..name_start + entry.name.len()].copy_from_slice(&entry.name);
        buf[value_start..value_start + entry.value.len()].copy_from_slice(&entry.value);

        off += entry.entry_size();
        value_end = value_start;
    }
    Ok(())
}

/// Encode the in-inode attribute area (`area_len` bytes after the extra
/// inode fields). An empty set yields an all-zero area.
pub fn encode_ibody(area_len: usize, entries: &[XattrEntry]) -> Result<Vec<u8>> {
    let mut area = vec![0_u8; area_len];
    if entries.is_empty() {
        return Ok(area);
    }
    if ibody_required(entries) > area_len {
        return Err(E2Error::EaNoSpace);
    }
    area[..4].copy_from_slice(&EXT2_XATTR_MAGIC.to_le_bytes());
    write_table(&mut area, XATTR_IBODY_HEADER_LEN, XATTR_IBODY_HEADER_LEN, entries)?;
    Ok(area)
}

/// Encode an external attribute block with a refcount of one.
///
/// Entries are sorted by index, name length and name. The checksum word is
/// left zero for the caller to fill.
pub fn encode_block(block_size: usize, entries: &[XattrEntry]) -> Result<Vec<u8>> {
    if block_required(entries) > block_size {
        return Err(E2Error::EaNoSpace);
    }
    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| {
        (a.name_index, a.name.len(), &a.name).cmp(&(b.name_index, b.name.len(), &b.name))
    });

    let mut block = vec![0_u8; block_size];
    let header = XattrHeader {
        hash: block_hash(&sorted),
        ..XattrHeader::new()
    };
    header
        .encode_into(&mut block)
        .map_err(|e| E2Error::Format(e.to_string()))?;
    write_table(&mut block, XATTR_BLOCK_HEADER_LEN, 0, &sorted)?;
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2_ondisk::{parse_block_xattrs, parse_ibody_xattrs};
    use e2_types::EXT2_XATTR_INDEX_USER;

    fn entry(name: &str, value: &[u8]) -> XattrEntry {
        make_entry(name, value).expect("entry")
    }

    #[test]
    fn names_route_to_the_longest_prefix() {
        assert_eq!(split_name("user.color"), (EXT2_XATTR_INDEX_USER, &b"color"[..]));
        assert_eq!(split_name("system.data"), (EXT2_XATTR_INDEX_SYSTEM, &b"data"[..]));
        assert_eq!(
            split_name("system.posix_acl_access"),
            (EXT2_XATTR_INDEX_POSIX_ACL_ACCESS, &b""[..])
        );
        assert_eq!(split_name("odd.name"), (0, &b"odd.name"[..]));
        assert!(make_entry("user.", b"x").is_err());
        assert!(make_entry("system.posix_acl_access", b"x").is_ok());
    }

    #[test]
    fn entry_hash_matches_known_values() {
        // "data" with an empty value, as written for an empty inline directory.
        let mut expect = 0_u32;
        for &b in b"data" {
            expect = (expect << 5) ^ (expect >> 27) ^ u32::from(b);
        }
        assert_eq!(entry_hash(b"data", b""), expect);

        // One value word folds in little-endian.
        let h = entry_hash(b"", b"\x01\x00\x00\x00");
        assert_eq!(h, 1);
        // High-bit name bytes sign-extend.
        assert_eq!(entry_hash(&[0x80], b""), 0xFFFF_FF80);
    }

    #[test]
    fn block_hash_is_zero_when_an_entry_is_unhashed() {
        let mut a = entry("user.a", b"1");
        let b = entry("user.b", b"2");
        assert_ne!(block_hash(&[a.clone(), b.clone()]), 0);
        a.hash = 0;
        assert_eq!(block_hash(&[a, b]), 0);
    }

    #[test]
    fn ibody_encoding_reads_back() {
        let entries = vec![entry("system.data", b""), entry("user.color", b"blue")];
        let area = encode_ibody(96, &entries).expect("encode");
        let parsed = parse_ibody_xattrs(&area).expect("parse");
        assert_eq!(parsed, entries);
        assert_eq!(ibody_free(96, &entries), 96 - ibody_required(&entries));
    }

    #[test]
    fn block_encoding_sorts_and_hashes() {
        let entries = vec![entry("user.zeta", b"last"), entry("user.a", b"first")];
        let block = encode_block(1024, &entries).expect("encode");
        let (header, parsed) = parse_block_xattrs(&block).expect("parse");
        assert_eq!(header.refcount, 1);
        assert_eq!(parsed[0].full_name(), "user.a");
        assert_eq!(parsed[1].value, b"last");
        assert_eq!(header.hash, block_hash(&parsed));
    }

    #[test]
    fn pack_prefers_the_inode_and_keeps_inline_data_there() {
        let entries = vec![
            entry("user.big", &[7_u8; 64]),
            entry("system.data", &[1_u8; 20]),
        ];
        let placement = pack(&entries, 100, 1024).expect("pack");
        assert_eq!(placement.ibody.len(), 1);
        assert!(is_inline_data(&placement.ibody[0]));
        assert_eq!(placement.block.len(), 1);
        assert_eq!(placement.block[0].full_name(), "user.big");
    }

    #[test]
    fn pack_reports_no_space() {
        let entries = vec![entry("user.huge", &[0_u8; 2000])];
        assert!(matches!(pack(&entries, 0, 1024), Err(E2Error::EaNoSpace)));
        assert!(matches!(encode_ibody(32, &entries), Err(E2Error::EaNoSpace)));
    }

    #[test]
    fn empty_set_clears_the_area() {
        let area = encode_ibody(32, &[]).expect("encode");
        assert!(area.iter().all(|&b| b == 0));
        assert!(!pack(&[], 32, 1024).expect("pack").needs_block());
    }

    proptest::proptest! {
        #[test]
        fn packed_sets_decode_to_the_same_attributes(
            values in proptest::collection::vec(proptest::collection::vec(proptest::num::u8::ANY, 0..120), 0..12),
            ibody_len in 0_usize..160,
        ) {
            let entries: Vec<XattrEntry> = values
                .iter()
                .enumerate()
                .map(|(i, v)| entry(&format!("user.attr{i}"), v))
                .collect();
            match pack(&entries, ibody_len, 1024) {
                Ok(placement) => {
                    let area = encode_ibody(ibody_len, &placement.ibody).expect("ibody");
                    let mut found = parse_ibody_xattrs(&area).expect("parse ibody");
                    if placement.needs_block() {
                        let block = encode_block(1024, &placement.block).expect("block");
                        found.extend(parse_block_xattrs(&block).expect("parse block").1);
                    }
                    found.sort_by(|a, b| a.name.cmp(&b.name));
                    let mut want = entries.clone();
                    want.sort_by(|a, b| a.name.cmp(&b.name));
                    proptest::prop_assert_eq!(found, want);
                }
                Err(E2Error::EaNoSpace) => {
                    proptest::prop_assert!(block_required(&entries) > 1024);
                }
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
    }
}
