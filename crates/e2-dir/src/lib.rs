#![forbid(unsafe_code)]
//! Directory block editing.
//!
//! Works in place on disk-order (little-endian) directory blocks: entry
//! creation and deletion with `rec_len` splitting and coalescing, `.`/`..`
//! initialization, the metadata_csum tail record, and conversion of an
//! inline directory into a full block.

use e2_error::{E2Error, Result};
use e2_ondisk::dir::DIR_ENTRY_HEADER_LEN;
use e2_ondisk::{
    DirBlockIter, DirEntry, FileType, dir_rec_len, init_dir_tail, rec_len_from_disk,
    rec_len_to_disk,
};
use e2_types::{
    EXT2_DIR_TAIL_SIZE, EXT2_NAME_LEN, EXT4_INLINE_DATA_DOTDOT_SIZE, read_le_u16, read_le_u32,
};

/// How entries are laid out in a directory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirLayout {
    pub block_size: u32,
    /// Entries carry a file-type byte.
    pub filetype: bool,
    /// The last 12 bytes hold a checksum tail (metadata_csum).
    pub csum_tail: bool,
}

impl DirLayout {
    /// Bytes available to entries.
    #[must_use]
    pub fn usable(&self) -> usize {
        let len = self.block_size as usize;
        if self.csum_tail {
            len - EXT2_DIR_TAIL_SIZE
        } else {
            len
        }
    }
}

fn corrupt(detail: &str) -> E2Error {
    E2Error::Corruption {
        block: 0,
        detail: detail.to_owned(),
    }
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(E2Error::InvalidArgument(
            "directory entry name cannot be empty".to_owned(),
        ));
    }
    if name.len() > EXT2_NAME_LEN {
        return Err(E2Error::InvalidArgument(
            "directory entry name exceeds 255 bytes".to_owned(),
        ));
    }
    Ok(())
}

/// One record header as found on disk.
#[derive(Debug, Clone, Copy)]
struct Record {
    offset: usize,
    inode: u32,
    rec_len: usize,
    name_len: usize,
}

/// Walk the record chain of the usable area, validating every header.
fn records(block: &[u8], layout: DirLayout) -> Result<Vec<Record>> {
    let usable = layout.usable().min(block.len());
    let mut out = Vec::new();
    let mut off = 0_usize;
    while off + DIR_ENTRY_HEADER_LEN <= usable {
        let raw = read_le_u16(block, off + 4).map_err(|_| corrupt("unreadable rec_len"))?;
        let rec_len = rec_len_from_disk(raw, layout.block_size) as usize;
        if rec_len < DIR_ENTRY_HEADER_LEN || rec_len % 4 != 0 {
            return Err(corrupt("invalid directory entry rec_len"));
        }
        let end = off
            .checked_add(rec_len)
            .filter(|&end| end <= usable)
            .ok_or_else(|| corrupt("directory entry exceeds block boundary"))?;
        let inode = read_le_u32(block, off).map_err(|_| corrupt("unreadable inode"))?;
        let name_len = if layout.filetype {
            usize::from(block[off + 6])
        } else {
            usize::from(read_le_u16(block, off + 6).map_err(|_| corrupt("unreadable name_len"))?)
        };
        if inode != 0 && dir_rec_len(name_len) as usize > rec_len {
            return Err(corrupt("directory entry name length exceeds rec_len"));
        }
        out.push(Record {
            offset: off,
            inode,
            rec_len,
            name_len,
        });
        off = end;
    }
    Ok(out)
}

fn set_rec_len(block: &mut [u8], offset: usize, rec_len: usize, layout: DirLayout) -> Result<()> {
    let len = u32::try_from(rec_len).map_err(|_| corrupt("rec_len overflow"))?;
    let raw = rec_len_to_disk(len, layout.block_size).map_err(|e| corrupt(&e.to_string()))?;
    block[offset + 4..offset + 6].copy_from_slice(&raw.to_le_bytes());
    Ok(())
}

/// Write one record header plus name at `offset`, zeroing the slack.
pub fn write_entry(
    block: &mut [u8],
    layout: DirLayout,
    offset: usize,
    ino: u32,
    rec_len: usize,
    file_type: FileType,
    name: &[u8],
) -> Result<()> {
    let end = offset
        .checked_add(rec_len)
        .filter(|&end| end <= block.len())
        .ok_or_else(|| corrupt("directory entry exceeds block boundary"))?;
    if rec_len < dir_rec_len(name.len()) as usize {
        return Err(E2Error::Format(
            "directory entry rec_len smaller than minimum".to_owned(),
        ));
    }
    let name_len = u16::try_from(name.len())
        .map_err(|_| E2Error::Format("directory entry name too long".to_owned()))?;

    block[offset..offset + 4].copy_from_slice(&ino.to_le_bytes());
    set_rec_len(block, offset, rec_len, layout)?;
    if layout.filetype {
        block[offset + 6] = u8::try_from(name_len).unwrap_or(u8::MAX);
        block[offset + 7] = file_type.to_raw();
    } else {
        block[offset + 6..offset + 8].copy_from_slice(&name_len.to_le_bytes());
    }
    let name_start = offset + DIR_ENTRY_HEADER_LEN;
    block[name_start..name_start + name.len()].copy_from_slice(name);
    block[name_start + name.len()..end].fill(0);
    Ok(())
}

/// Add an entry to a single directory block.
///
/// Reuses a deleted record that is large enough, otherwise splits the slack
/// off a live one. Returns the offset of the new entry, or
/// [`E2Error::DirNoSpace`] when nothing fits.
pub fn add_entry(
    block: &mut [u8],
    layout: DirLayout,
    ino: u32,
    name: &[u8],
    file_type: FileType,
) -> Result<usize> {
    if ino == 0 {
        return Err(E2Error::InvalidArgument(
            "directory entry inode cannot be zero".to_owned(),
        ));
    }
    validate_name(name)?;
    let need = dir_rec_len(name.len()) as usize;

    for rec in records(block, layout)? {
        if rec.inode == 0 {
            if rec.rec_len >= need {
                write_entry(block, layout, rec.offset, ino, rec.rec_len, file_type, name)?;
                return Ok(rec.offset);
            }
            continue;
        }
        let actual = dir_rec_len(rec.name_len) as usize;
        let slack = rec.rec_len - actual;
        if slack >= need {
            set_rec_len(block, rec.offset, actual, layout)?;
            let new_off = rec.offset + actual;
            write_entry(block, layout, new_off, ino, slack, file_type, name)?;
            return Ok(new_off);
        }
    }
    Err(E2Error::DirNoSpace)
}

/// Remove the entry called `name`.
///
/// The record is folded into its predecessor; the first record of a block
/// is only marked deleted. Returns whether an entry was removed.
pub fn remove_entry(block: &mut [u8], layout: DirLayout, name: &[u8]) -> Result<bool> {
    validate_name(name)?;
    let mut prev: Option<Record> = None;
    for rec in records(block, layout)? {
        let name_start = rec.offset + DIR_ENTRY_HEADER_LEN;
        if rec.inode != 0 && block[name_start..name_start + rec.name_len] == *name {
            if let Some(prev) = prev {
                set_rec_len(block, prev.offset, prev.rec_len + rec.rec_len, layout)?;
            }
            block[rec.offset..rec.offset + 4].fill(0);
            return Ok(true);
        }
        prev = Some(rec);
    }
    Ok(false)
}

/// Find a live entry by name.
pub fn find_entry(block: &[u8], layout: DirLayout, name: &[u8]) -> Result<Option<DirEntry>> {
    for entry in DirBlockIter::new(block, layout.block_size, layout.filetype) {
        let entry = entry.map_err(|e| corrupt(&e.to_string()))?;
        if entry.name == name {
            return Ok(Some(entry.to_owned()));
        }
    }
    Ok(None)
}

/// Initialize an empty directory block with `.` and `..`.
pub fn init_dir_block(block: &mut [u8], layout: DirLayout, self_ino: u32, parent_ino: u32) -> Result<()> {
    let usable = layout.usable();
    let dot_len = dir_rec_len(1) as usize;
    if block.len() != layout.block_size as usize || usable < dot_len + dir_rec_len(2) as usize {
        return Err(E2Error::TooSmall);
    }
    block.fill(0);
    write_entry(block, layout, 0, self_ino, dot_len, FileType::Dir, b".")?;
    write_entry(block, layout, dot_len, parent_ino, usable - dot_len, FileType::Dir, b"..")?;
    if layout.csum_tail {
        init_dir_tail(block).map_err(|e| corrupt(&e.to_string()))?;
    }
    Ok(())
}

/// Initialize an empty block that holds no entries yet (one deleted record
/// spanning the usable area), as used when a directory grows.
pub fn init_empty_block(block: &mut [u8], layout: DirLayout) -> Result<()> {
    if block.len() != layout.block_size as usize {
        return Err(E2Error::TooSmall);
    }
    block.fill(0);
    set_rec_len(block, 0, layout.usable(), layout)?;
    if layout.csum_tail {
        init_dir_tail(block).map_err(|e| corrupt(&e.to_string()))?;
    }
    Ok(())
}

/// Lay out the contents of an inline directory as a full block.
///
/// `inline` is the in-inode area followed by any `system.data` value: the
/// parent inode in its first four bytes, then packed records. The result
/// starts with `.` and `..`, carries the records over, and stretches the
/// last one to the end of the usable area.
pub fn inline_to_dir_block(inline: &[u8], layout: DirLayout, self_ino: u32) -> Result<Vec<u8>> {
    if inline.len() < EXT4_INLINE_DATA_DOTDOT_SIZE {
        return Err(corrupt("inline directory shorter than its parent field"));
    }
    let bs = layout.block_size as usize;
    let usable = layout.usable();
    let dot_len = dir_rec_len(1) as usize;
    let dotdot_len = dir_rec_len(2) as usize;
    let head = dot_len + dotdot_len;
    let body = &inline[EXT4_INLINE_DATA_DOTDOT_SIZE..];
    if head + body.len() > usable {
        return Err(E2Error::DirNoSpace);
    }

    let mut block = vec![0_u8; bs];
    let parent = read_le_u32(inline, 0).map_err(|_| corrupt("inline parent"))?;
    write_entry(&mut block, layout, 0, self_ino, dot_len, FileType::Dir, b".")?;
    write_entry(&mut block, layout, dot_len, parent, dotdot_len, FileType::Dir, b"..")?;
    block[head..head + body.len()].copy_from_slice(body);

    // Walk the copied records to find the last one.
    let end = head + body.len();
    let mut last = dot_len;
    let mut off = head;
    while off < end {
        let raw = read_le_u16(&block, off + 4).map_err(|_| corrupt("inline rec_len"))?;
        let rec_len = rec_len_from_disk(raw, layout.block_size) as usize;
        if rec_len < DIR_ENTRY_HEADER_LEN || off + rec_len > end {
            return Err(corrupt("inline directory record overruns its area"));
        }
        last = off;
        off += rec_len;
    }
    let last_len = usable - last;
    set_rec_len(&mut block, last, last_len, layout)?;
    if layout.csum_tail {
        init_dir_tail(&mut block).map_err(|e| corrupt(&e.to_string()))?;
    }
    Ok(block)
}

/// Live entries of a block, `.` and `..` included.
pub fn live_entries(block: &[u8], layout: DirLayout) -> Result<Vec<DirEntry>> {
    DirBlockIter::new(block, layout.block_size, layout.filetype)
        .map(|entry| {
            entry
                .map(|e| e.to_owned())
                .map_err(|e| corrupt(&e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2_ondisk::has_dir_tail;

    const PLAIN: DirLayout = DirLayout {
        block_size: 1024,
        filetype: true,
        csum_tail: false,
    };
    const CSUM: DirLayout = DirLayout {
        block_size: 1024,
        filetype: true,
        csum_tail: true,
    };

    fn names(block: &[u8], layout: DirLayout) -> Vec<String> {
        live_entries(block, layout)
            .expect("entries")
            .iter()
            .map(DirEntry::name_str)
            .collect()
    }

    fn rec_lens_sum(block: &[u8], layout: DirLayout) -> usize {
        records(block, layout)
            .expect("records")
            .iter()
            .map(|r| r.rec_len)
            .sum()
    }

    #[test]
    fn init_dir_block_contains_dot_and_dotdot() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, PLAIN, 11, 2).expect("init");
        let entries = live_entries(&block, PLAIN).expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b".".to_vec());
        assert_eq!(entries[0].inode, 11);
        assert_eq!(entries[1].name, b"..".to_vec());
        assert_eq!(entries[1].inode, 2);
        assert_eq!(entries[1].rec_len, 1012);
    }

    #[test]
    fn csum_layout_reserves_the_tail() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, CSUM, 11, 2).expect("init");
        assert!(has_dir_tail(&block));
        assert_eq!(rec_lens_sum(&block, CSUM), 1024 - EXT2_DIR_TAIL_SIZE);
        add_entry(&mut block, CSUM, 12, b"file", FileType::RegFile).expect("add");
        assert!(has_dir_tail(&block));
        assert_eq!(rec_lens_sum(&block, CSUM), 1024 - EXT2_DIR_TAIL_SIZE);
    }

    #[test]
    fn add_entry_splits_live_slot_slack() {
        let mut block = vec![0_u8; 1024];
        write_entry(&mut block, PLAIN, 0, 2, 1024, FileType::Dir, b".").expect("seed");
        let off = add_entry(&mut block, PLAIN, 33, b"hello", FileType::RegFile).expect("add");
        assert_eq!(off, 12);
        assert_eq!(names(&block, PLAIN), vec![".", "hello"]);
        let found = find_entry(&block, PLAIN, b"hello").expect("find").expect("present");
        assert_eq!(found.inode, 33);
        assert_eq!(found.file_type(), FileType::RegFile);
    }

    #[test]
    fn full_block_reports_dir_no_space() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, PLAIN, 2, 2).expect("init");
        let name = [b'x'; 200];
        let mut added = 0;
        loop {
            let mut n = name;
            n[0] = b'a' + added;
            match add_entry(&mut block, PLAIN, 100 + u32::from(added), &n, FileType::RegFile) {
                Ok(_) => added += 1,
                Err(E2Error::DirNoSpace) => break,
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(added, 4);
        assert_eq!(rec_lens_sum(&block, PLAIN), 1024);
    }

    #[test]
    fn remove_coalesces_into_previous_and_reuses_space() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, PLAIN, 2, 2).expect("init");
        add_entry(&mut block, PLAIN, 20, b"a", FileType::RegFile).expect("a");
        add_entry(&mut block, PLAIN, 21, b"b", FileType::RegFile).expect("b");
        assert!(remove_entry(&mut block, PLAIN, b"a").expect("remove"));
        assert!(!remove_entry(&mut block, PLAIN, b"a").expect("gone"));
        assert_eq!(names(&block, PLAIN), vec![".", "..", "b"]);
        assert_eq!(rec_lens_sum(&block, PLAIN), 1024);

        let off = add_entry(&mut block, PLAIN, 22, b"c", FileType::RegFile).expect("c");
        assert_eq!(off, 24);
    }

    #[test]
    fn removing_the_first_entry_marks_it_deleted() {
        let mut block = vec![0_u8; 1024];
        write_entry(&mut block, PLAIN, 0, 5, 1024, FileType::RegFile, b"only").expect("seed");
        assert!(remove_entry(&mut block, PLAIN, b"only").expect("remove"));
        assert!(live_entries(&block, PLAIN).expect("entries").is_empty());
        let off = add_entry(&mut block, PLAIN, 6, b"next", FileType::RegFile).expect("reuse");
        assert_eq!(off, 0);
    }

    #[test]
    fn without_filetype_the_name_length_is_sixteen_bits() {
        let layout = DirLayout {
            filetype: false,
            ..PLAIN
        };
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, layout, 2, 2).expect("init");
        assert_eq!(block[7], 0);
        add_entry(&mut block, layout, 9, b"plain", FileType::RegFile).expect("add");
        let entry = find_entry(&block, layout, b"plain").expect("find").expect("present");
        assert_eq!(entry.file_type, 0);
    }

    #[test]
    fn bad_arguments_are_rejected() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, PLAIN, 2, 2).expect("init");
        assert!(add_entry(&mut block, PLAIN, 0, b"x", FileType::RegFile).is_err());
        assert!(add_entry(&mut block, PLAIN, 3, b"", FileType::RegFile).is_err());
        assert!(add_entry(&mut block, PLAIN, 3, &[b'n'; 256], FileType::RegFile).is_err());
        let mut small = vec![0_u8; 16];
        assert!(matches!(
            init_dir_block(&mut small, PLAIN, 2, 2),
            Err(E2Error::TooSmall)
        ));
    }

    #[test]
    fn corrupt_rec_len_is_reported() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, PLAIN, 2, 2).expect("init");
        block[4..6].copy_from_slice(&6_u16.to_le_bytes());
        assert!(matches!(
            add_entry(&mut block, PLAIN, 3, b"x", FileType::RegFile),
            Err(E2Error::Corruption { .. })
        ));
    }

    fn inline_area(parent: u32, entries: &[(u32, &[u8])], len: usize) -> Vec<u8> {
        let mut area = vec![0_u8; len];
        area[..4].copy_from_slice(&parent.to_le_bytes());
        let mut off = 4;
        for (i, (ino, name)) in entries.iter().enumerate() {
            let rec = if i + 1 == entries.len() {
                len - off
            } else {
                dir_rec_len(name.len()) as usize
            };
            write_entry(&mut area, PLAIN, off, *ino, rec, FileType::RegFile, name).expect("entry");
            off += rec;
        }
        area
    }

    #[test]
    fn inline_directory_converts_to_a_block() {
        let area = inline_area(2, &[(12, b"alpha"), (13, b"beta")], 60);
        let block = inline_to_dir_block(&area, CSUM, 40).expect("convert");
        assert_eq!(names(&block, CSUM), vec![".", "..", "alpha", "beta"]);
        let entries = live_entries(&block, CSUM).expect("entries");
        assert_eq!(entries[0].inode, 40);
        assert_eq!(entries[1].inode, 2);
        assert_eq!(entries[1].rec_len, 12);
        assert_eq!(rec_lens_sum(&block, CSUM), 1024 - EXT2_DIR_TAIL_SIZE);
        assert!(has_dir_tail(&block));
    }

    #[test]
    fn empty_inline_directory_converts() {
        let mut area = vec![0_u8; 60];
        area[..4].copy_from_slice(&7_u32.to_le_bytes());
        area[8..10].copy_from_slice(&56_u16.to_le_bytes());
        let block = inline_to_dir_block(&area, PLAIN, 30).expect("convert");
        assert_eq!(names(&block, PLAIN), vec![".", ".."]);
        assert_eq!(rec_lens_sum(&block, PLAIN), 1024);
    }

    proptest::proptest! {
        #[test]
        fn edits_preserve_record_chain(ops in proptest::collection::vec((proptest::bool::ANY, 0_u8..24), 1..80)) {
            let mut block = vec![0_u8; 1024];
            init_dir_block(&mut block, CSUM, 2, 2).expect("init");
            let mut present = std::collections::BTreeSet::new();
            for (add, id) in ops {
                let name = format!("entry-{id:02}-{}", "x".repeat(usize::from(id) * 3));
                if add {
                    if present.contains(&id) {
                        continue;
                    }
                    match add_entry(&mut block, CSUM, 100 + u32::from(id), name.as_bytes(), FileType::RegFile) {
                        Ok(_) => { present.insert(id); }
                        Err(E2Error::DirNoSpace) => {}
                        Err(other) => panic!("unexpected {other:?}"),
                    }
                } else {
                    let removed = remove_entry(&mut block, CSUM, name.as_bytes()).expect("remove");
                    proptest::prop_assert_eq!(removed, present.remove(&id));
                }
                proptest::prop_assert_eq!(rec_lens_sum(&block, CSUM), 1024 - EXT2_DIR_TAIL_SIZE);
                proptest::prop_assert!(has_dir_tail(&block));
            }
            proptest::prop_assert_eq!(live_entries(&block, CSUM).expect("entries").len(), present.len() + 2);
        }
    }
}
