use e2_types::{
    ByteOrder, EXT2_DIR_TAIL_FILE_TYPE, EXT2_DIR_TAIL_SIZE, ParseError, S_IFBLK, S_IFCHR, S_IFDIR,
    S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, ensure_slice, read_le_u16, read_le_u32,
    write_le_u32,
};
use serde::{Deserialize, Serialize};

/// Size of the fixed entry header (inode, rec_len, name_len, file_type).
pub const DIR_ENTRY_HEADER_LEN: usize = 8;

/// Largest encodable record length on 64 KiB blocks.
const EXT2_MAX_REC_LEN: u16 = 0xFFFF;

/// File type hint stored in a directory entry when the filetype feature is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        self as u8
    }

    /// Derive the hint from an inode's `i_mode`.
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    /// The `S_IF*` bits for this type, or 0 for `Unknown`.
    #[must_use]
    pub fn to_mode_bits(self) -> u16 {
        match self {
            Self::Unknown => 0,
            Self::RegFile => S_IFREG,
            Self::Dir => S_IFDIR,
            Self::Chrdev => S_IFCHR,
            Self::Blkdev => S_IFBLK,
            Self::Fifo => S_IFIFO,
            Self::Sock => S_IFSOCK,
            Self::Symlink => S_IFLNK,
        }
    }
}

// ── Record length helpers ───────────────────────────────────────────────────

/// Minimum record length for a name of `name_len` bytes (4-byte aligned).
#[must_use]
pub fn dir_rec_len(name_len: usize) -> u32 {
    let len = (DIR_ENTRY_HEADER_LEN + name_len + 3) & !3;
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Decode an on-disk `rec_len`. Blocks of 64 KiB and more fold the high
/// bits into the low two.
#[must_use]
pub fn rec_len_from_disk(raw: u16, block_size: u32) -> u32 {
    let len = u32::from(raw);
    if block_size < 65_536 {
        return len;
    }
    if raw == EXT2_MAX_REC_LEN || raw == 0 {
        return block_size;
    }
    (len & 0xFFFC) | ((len & 0x3) << 16)
}

/// Encode a record length for disk.
pub fn rec_len_to_disk(len: u32, block_size: u32) -> Result<u16, ParseError> {
    if len > block_size || len & 3 != 0 {
        return Err(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "record length unaligned or larger than the block",
        });
    }
    if let Ok(small) = u16::try_from(len) {
        return Ok(small);
    }
    if len == block_size {
        return Ok(if block_size == 65_536 { EXT2_MAX_REC_LEN } else { 0 });
    }
    let folded = (len & 0xFFFC) | ((len >> 16) & 0x3);
    u16::try_from(folded).map_err(|_| ParseError::IntegerConversion { field: "de_rec_len" })
}

/// Split the 16-bit word at entry offset 6 into `(name_len, file_type)`.
///
/// With the filetype feature the high byte is the type hint; without it
/// the word is one 16-bit name length.
#[must_use]
pub fn split_name_len(word: u16, filetype: bool) -> (u16, u8) {
    if filetype {
        let [lo, hi] = word.to_le_bytes();
        (u16::from(lo), hi)
    } else {
        (word, 0)
    }
}

#[must_use]
fn join_name_len(name_len: u16, file_type: u8, filetype: bool) -> u16 {
    if filetype {
        (name_len & 0xFF) | (u16::from(file_type) << 8)
    } else {
        name_len
    }
}

// ── Owned entries ───────────────────────────────────────────────────────────

/// A directory record, live (`inode != 0`) or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Byte offset of the record within its block.
    pub offset: usize,
    pub inode: u32,
    pub rec_len: u32,
    pub name_len: u16,
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Bytes this entry needs, independent of its `rec_len`.
    #[must_use]
    pub fn actual_size(&self) -> u32 {
        dir_rec_len(usize::from(self.name_len))
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        FileType::from_raw(self.file_type)
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inode != 0
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// Room inside an existing record that can take a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirSlot {
    /// Offset of the record that owns the space.
    pub offset: usize,
    /// That record's current `rec_len`.
    pub rec_len: u32,
    /// Bytes used by the existing entry; 0 when the record is deleted.
    pub used: u32,
}

impl DirSlot {
    /// Offset at which the new entry would start.
    #[must_use]
    pub fn insert_at(&self) -> usize {
        self.offset + self.used as usize
    }

    /// Free bytes available to the new entry.
    #[must_use]
    pub fn free(&self) -> u32 {
        self.rec_len - self.used
    }
}

/// A decoded directory block that re-encodes byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirBlock {
    pub block_size: u32,
    pub filetype: bool,
    /// Every record in physical order, including deleted ones.
    pub entries: Vec<DirEntry>,
    /// Checksum from the trailing tail record, when present.
    pub tail_checksum: Option<u32>,
    raw: Vec<u8>,
}

impl DirBlock {
    /// Decode a block laid out in `order`.
    pub fn decode(
        block: &[u8],
        block_size: u32,
        filetype: bool,
        order: ByteOrder,
    ) -> Result<Self, ParseError> {
        let mut entries = Vec::new();
        let mut tail_checksum = None;
        let mut offset = 0_usize;

        while offset + DIR_ENTRY_HEADER_LEN <= block.len() {
            let inode = order.read_u32(block, offset)?;
            let rec_len = rec_len_from_disk(order.read_u16(block, offset + 4)?, block_size);
            let word = order.read_u16(block, offset + 6)?;
            let entry_end = checked_entry_end(offset, rec_len, block.len())?;

            if is_tail(inode, rec_len, word) && entry_end == block.len() {
                tail_checksum = Some(read_le_u32(block, offset + 8)?);
                break;
            }

            let (name_len, file_type) = split_name_len(word, filetype);
            let name_end = offset + DIR_ENTRY_HEADER_LEN + usize::from(name_len);
            if inode != 0 && name_end > entry_end {
                return Err(ParseError::InvalidField {
                    field: "de_name_len",
                    reason: "name extends past rec_len",
                });
            }
            let name = block
                .get(offset + DIR_ENTRY_HEADER_LEN..name_end.min(entry_end))
                .unwrap_or(&[])
                .to_vec();
            entries.push(DirEntry {
                offset,
                inode,
                rec_len,
                name_len,
                file_type,
                name,
            });
            offset = entry_end;
        }

        Ok(Self {
            block_size,
            filetype,
            entries,
            tail_checksum,
            raw: block.to_vec(),
        })
    }

    /// Encode back to a block in `order`.
    pub fn encode(&self, order: ByteOrder) -> Result<Vec<u8>, ParseError> {
        let mut out = self.raw.clone();
        for entry in &self.entries {
            order.write_u32(&mut out, entry.offset, entry.inode)?;
            order.write_u16(
                &mut out,
                entry.offset + 4,
                rec_len_to_disk(entry.rec_len, self.block_size)?,
            )?;
            order.write_u16(
                &mut out,
                entry.offset + 6,
                join_name_len(entry.name_len, entry.file_type, self.filetype),
            )?;
            let start = entry.offset + DIR_ENTRY_HEADER_LEN;
            let dst = out
                .get_mut(start..start + entry.name.len())
                .ok_or(ParseError::InvalidField {
                    field: "de_name",
                    reason: "name extends past block",
                })?;
            dst.copy_from_slice(&entry.name);
        }
        if let Some(csum) = self.tail_checksum {
            let off = out.len().saturating_sub(EXT2_DIR_TAIL_SIZE);
            write_le_u32(&mut out, off + 8, csum)?;
        }
        Ok(out)
    }

    /// Live entries only.
    pub fn live(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().filter(|e| e.is_live())
    }

    /// First record with room for an entry of `needed` bytes.
    #[must_use]
    pub fn find_space(&self, needed: u32) -> Option<DirSlot> {
        self.entries.iter().find_map(|e| {
            let used = if e.is_live() { e.actual_size() } else { 0 };
            (e.rec_len >= used + needed).then_some(DirSlot {
                offset: e.offset,
                rec_len: e.rec_len,
                used,
            })
        })
    }
}

fn is_tail(inode: u32, rec_len: u32, word: u16) -> bool {
    inode == 0
        && rec_len as usize == EXT2_DIR_TAIL_SIZE
        && word == u16::from(EXT2_DIR_TAIL_FILE_TYPE) << 8
}

fn checked_entry_end(offset: usize, rec_len: u32, block_len: usize) -> Result<usize, ParseError> {
    if (rec_len as usize) < DIR_ENTRY_HEADER_LEN {
        return Err(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "directory entry rec_len < 8",
        });
    }
    match offset.checked_add(rec_len as usize) {
        Some(end) if end <= block_len => Ok(end),
        Some(_) => Err(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "directory entry extends past block boundary",
        }),
        None => Err(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "overflow",
        }),
    }
}

// ── Checksum tail ───────────────────────────────────────────────────────────

/// Whether the last 12 bytes of a disk-order block are a checksum tail.
#[must_use]
pub fn has_dir_tail(block: &[u8]) -> bool {
    let Some(off) = block.len().checked_sub(EXT2_DIR_TAIL_SIZE) else {
        return false;
    };
    let inode = read_le_u32(block, off).unwrap_or(1);
    let rec_len = read_le_u16(block, off + 4).map_or(0, u32::from);
    let word = read_le_u16(block, off + 6).unwrap_or(0);
    is_tail(inode, rec_len, word)
}

/// Write an empty checksum tail into the last 12 bytes of a disk-order block.
pub fn init_dir_tail(block: &mut [u8]) -> Result<(), ParseError> {
    let off = block
        .len()
        .checked_sub(EXT2_DIR_TAIL_SIZE)
        .ok_or(ParseError::InsufficientData {
            needed: EXT2_DIR_TAIL_SIZE,
            offset: 0,
            actual: block.len(),
        })?;
    let tail = &mut block[off..];
    tail.fill(0);
    tail[4..6].copy_from_slice(&12_u16.to_le_bytes());
    tail[7] = EXT2_DIR_TAIL_FILE_TYPE;
    Ok(())
}

// ── Zero-allocation iterator ────────────────────────────────────────────────

/// A borrowed live entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryRef<'a> {
    pub offset: usize,
    pub inode: u32,
    pub rec_len: u32,
    pub name_len: u16,
    pub file_type: FileType,
    pub name: &'a [u8],
}

impl DirEntryRef<'_> {
    #[must_use]
    pub fn to_owned(&self) -> DirEntry {
        DirEntry {
            offset: self.offset,
            inode: self.inode,
            rec_len: self.rec_len,
            name_len: self.name_len,
            file_type: self.file_type.to_raw(),
            name: self.name.to_vec(),
        }
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// Iterator over the live entries of a disk-order directory block.
///
/// Deleted records are skipped and iteration stops at the checksum tail.
/// The first malformed record yields an error and ends iteration.
pub struct DirBlockIter<'a> {
    block: &'a [u8],
    block_size: u32,
    filetype: bool,
    offset: usize,
    tail: Option<u32>,
    done: bool,
}

impl<'a> DirBlockIter<'a> {
    #[must_use]
    pub fn new(block: &'a [u8], block_size: u32, filetype: bool) -> Self {
        Self {
            block,
            block_size,
            filetype,
            offset: 0,
            tail: None,
            done: false,
        }
    }

    /// Iterate a buffer that starts part-way into a logical record area,
    /// such as the entries of an inline directory.
    #[must_use]
    pub fn with_start(block: &'a [u8], block_size: u32, filetype: bool, start: usize) -> Self {
        Self {
            offset: start,
            ..Self::new(block, block_size, filetype)
        }
    }

    /// Checksum from the tail record, once iteration has reached it.
    #[must_use]
    pub fn checksum_tail(&self) -> Option<u32> {
        self.tail
    }

    fn fail(&mut self, err: ParseError) -> Option<Result<DirEntryRef<'a>, ParseError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for DirBlockIter<'a> {
    type Item = Result<DirEntryRef<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.offset + DIR_ENTRY_HEADER_LEN > self.block.len() {
                return None;
            }
            let header = match ensure_slice(self.block, self.offset, DIR_ENTRY_HEADER_LEN) {
                Ok(h) => h,
                Err(e) => return self.fail(e),
            };
            let inode = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let rec_len = rec_len_from_disk(u16::from_le_bytes([header[4], header[5]]), self.block_size);
            let word = u16::from_le_bytes([header[6], header[7]]);

            let entry_end = match checked_entry_end(self.offset, rec_len, self.block.len()) {
                Ok(end) => end,
                Err(e) => return self.fail(e),
            };

            if is_tail(inode, rec_len, word) {
                self.tail = read_le_u32(self.block, self.offset + 8).ok();
                self.done = true;
                return None;
            }

            if inode == 0 {
                self.offset = entry_end;
                continue;
            }

            let (name_len, file_type) = split_name_len(word, self.filetype);
            let name_start = self.offset + DIR_ENTRY_HEADER_LEN;
            let name_end = name_start + usize::from(name_len);
            if name_end > entry_end {
                return self.fail(ParseError::InvalidField {
                    field: "de_name_len",
                    reason: "name extends past rec_len",
                });
            }

            let entry = DirEntryRef {
                offset: self.offset,
                inode,
                rec_len,
                name_len,
                file_type: FileType::from_raw(file_type),
                name: &self.block[name_start..name_end],
            };
            self.offset = entry_end;
            return Some(Ok(entry));
        }
    }
}
