use e2_types::{
    ByteOrder, EXT2_FAST_SYMLINK_MAX, EXT2_GOOD_OLD_INODE_SIZE, EXT2_INDEX_FL, EXT2_N_BLOCKS,
    EXT4_EXTENTS_FL, EXT4_HUGE_FILE_FL, EXT4_INLINE_DATA_FL, ParseError, S_IFBLK, S_IFCHR,
    S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
};
use serde::{Deserialize, Serialize};

/// Offset of `i_block` (15 words, 60 bytes).
pub const I_BLOCK_OFFSET: usize = 0x28;
/// Offset of `i_extra_isize` (first field past the 128-byte base).
pub const I_EXTRA_ISIZE_OFFSET: usize = 0x80;
/// Offset of `i_checksum_lo` (osd2 area).
pub const I_CHECKSUM_LO_OFFSET: usize = 0x7C;
/// Offset of `i_checksum_hi` (extended area).
pub const I_CHECKSUM_HI_OFFSET: usize = 0x82;

const BASE: usize = EXT2_GOOD_OLD_INODE_SIZE as usize;

/// Which of the four inode timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeField {
    Atime,
    Ctime,
    Mtime,
    Crtime,
}

impl TimeField {
    fn base_offset(self) -> usize {
        match self {
            Self::Atime => 0x08,
            Self::Ctime => 0x0C,
            Self::Mtime => 0x10,
            Self::Crtime => 0x90,
        }
    }

    fn extra_offset(self) -> usize {
        match self {
            Self::Ctime => 0x84,
            Self::Mtime => 0x88,
            Self::Atime => 0x8C,
            Self::Crtime => 0x94,
        }
    }
}

/// Seconds since the epoch (34-bit range with the epoch extension) plus nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nsec: u32,
}

impl Timestamp {
    #[must_use]
    pub fn new(secs: i64, nsec: u32) -> Self {
        Self { secs, nsec }
    }

    /// Decode a base seconds field plus an optional extra field.
    ///
    /// The base is sign-extended; the low two bits of `extra` add multiples
    /// of 2^32 seconds and the upper 30 bits are nanoseconds.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn decode(base: u32, extra: Option<u32>) -> Self {
        let secs = i64::from(base as i32);
        match extra {
            Some(extra) => Self {
                secs: secs + (i64::from(extra & 0x3) << 32),
                nsec: extra >> 2,
            },
            None => Self { secs, nsec: 0 },
        }
    }

    /// Split into `(base, extra)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub fn encode(self) -> (u32, u32) {
        let base = self.secs as u32;
        let epoch = ((self.secs - i64::from(base as i32)) >> 32) as u32 & 0x3;
        (base, epoch | (self.nsec << 2))
    }

    /// Convert to `SystemTime`; `None` when out of range.
    #[must_use]
    pub fn to_system_time(self) -> Option<std::time::SystemTime> {
        use std::time::{Duration, UNIX_EPOCH};
        if self.secs >= 0 {
            let secs = u64::try_from(self.secs).ok()?;
            UNIX_EPOCH.checked_add(Duration::new(secs, self.nsec))
        } else {
            let abs = u64::try_from(self.secs.checked_neg()?).ok()?;
            UNIX_EPOCH
                .checked_sub(Duration::new(abs, 0))?
                .checked_add(Duration::new(0, self.nsec))
        }
    }
}

/// Whether `i_block` holds raw bytes (extent root, inline data, fast
/// symlink target) rather than block-number words.
///
/// Raw bytes are never byte-swapped on big-endian hosts.
#[must_use]
pub fn i_block_holds_bytes(mode: u16, flags: u32, size: u64) -> bool {
    if flags & (EXT4_EXTENTS_FL | EXT4_INLINE_DATA_FL) != 0 {
        return true;
    }
    mode & S_IFMT == S_IFLNK && size > 0 && size < EXT2_FAST_SYMLINK_MAX as u64
}

/// An inode record.
///
/// `raw` holds the full on-disk record (`inode_size` bytes) so fields past
/// the modeled ones survive read-modify-write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inode {
    // ── Base 128-byte area ──────────────────────────────────────────────
    pub mode: u16,
    pub uid: u32,
    pub size: u64,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u32,
    pub links_count: u16,
    pub blocks: u64,
    pub flags: u32,
    pub version: u32,
    pub block: [u32; EXT2_N_BLOCKS],
    pub generation: u32,
    pub file_acl: u64,
    pub faddr: u32,
    pub checksum: u32,

    // ── Extended area (present when extra_isize covers it) ──────────────
    pub extra_isize: u16,
    pub ctime_extra: u32,
    pub mtime_extra: u32,
    pub atime_extra: u32,
    pub crtime: u32,
    pub crtime_extra: u32,
    pub version_hi: u32,
    pub projid: u32,

    #[serde(skip)]
    raw: Vec<u8>,
}

impl Inode {
    /// A zeroed record of `inode_size` bytes with `extra_isize` set.
    #[must_use]
    pub fn zeroed(inode_size: u16, extra_isize: u16) -> Self {
        let len = usize::from(inode_size.max(EXT2_GOOD_OLD_INODE_SIZE));
        let extra_isize = if len > BASE { extra_isize } else { 0 };
        Self {
            mode: 0,
            uid: 0,
            size: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
            gid: 0,
            links_count: 0,
            blocks: 0,
            flags: 0,
            version: 0,
            block: [0; EXT2_N_BLOCKS],
            generation: 0,
            file_acl: 0,
            faddr: 0,
            checksum: 0,
            extra_isize,
            ctime_extra: 0,
            mtime_extra: 0,
            atime_extra: 0,
            crtime: 0,
            crtime_extra: 0,
            version_hi: 0,
            projid: 0,
            raw: vec![0; len],
        }
    }

    /// Decode an inode record laid out in `order`.
    #[allow(clippy::similar_names)]
    pub fn decode(bytes: &[u8], order: ByteOrder) -> Result<Self, ParseError> {
        if bytes.len() < BASE {
            return Err(ParseError::InsufficientData {
                needed: BASE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        let u16_at = |off| order.read_u16(bytes, off);
        let u32_at = |off| order.read_u32(bytes, off);

        let mode = u16_at(0x00)?;
        let flags = u32_at(0x20)?;
        let size = u64::from(u32_at(0x04)?) | (u64::from(u32_at(0x6C)?) << 32);

        let word_order = if i_block_holds_bytes(mode, flags, size) {
            ByteOrder::Little
        } else {
            order
        };
        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = word_order.read_u32(bytes, I_BLOCK_OFFSET + i * 4)?;
        }

        let extra_isize = if bytes.len() >= I_EXTRA_ISIZE_OFFSET + 2 {
            u16_at(I_EXTRA_ISIZE_OFFSET)?
        } else {
            0
        };
        let fits = |off: usize, len: usize| extra_fits(bytes.len(), extra_isize, off, len);
        let extra32 = |off: usize| -> Result<u32, ParseError> {
            if fits(off, 4) { u32_at(off) } else { Ok(0) }
        };

        let checksum_hi = if fits(I_CHECKSUM_HI_OFFSET, 2) {
            u32::from(u16_at(I_CHECKSUM_HI_OFFSET)?)
        } else {
            0
        };

        Ok(Self {
            mode,
            uid: u32::from(u16_at(0x02)?) | (u32::from(u16_at(0x78)?) << 16),
            size,
            atime: u32_at(0x08)?,
            ctime: u32_at(0x0C)?,
            mtime: u32_at(0x10)?,
            dtime: u32_at(0x14)?,
            gid: u32::from(u16_at(0x18)?) | (u32::from(u16_at(0x7A)?) << 16),
            links_count: u16_at(0x1A)?,
            blocks: u64::from(u32_at(0x1C)?) | (u64::from(u16_at(0x74)?) << 32),
            flags,
            version: u32_at(0x24)?,
            block,
            generation: u32_at(0x64)?,
            file_acl: u64::from(u32_at(0x68)?) | (u64::from(u16_at(0x76)?) << 32),
            faddr: u32_at(0x70)?,
            checksum: u32::from(u16_at(I_CHECKSUM_LO_OFFSET)?) | (checksum_hi << 16),

            extra_isize,
            ctime_extra: extra32(TimeField::Ctime.extra_offset())?,
            mtime_extra: extra32(TimeField::Mtime.extra_offset())?,
            atime_extra: extra32(TimeField::Atime.extra_offset())?,
            crtime: extra32(TimeField::Crtime.base_offset())?,
            crtime_extra: extra32(TimeField::Crtime.extra_offset())?,
            version_hi: extra32(0x98)?,
            projid: extra32(0x9C)?,

            raw: bytes.to_vec(),
        })
    }

    /// Encode back into a record of the same size, in `order`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, order: ByteOrder) -> Result<Vec<u8>, ParseError> {
        let mut out = self.raw.clone();
        let buf = out.as_mut_slice();
        let len = buf.len();

        order.write_u16(buf, 0x00, self.mode)?;
        order.write_u16(buf, 0x02, self.uid as u16)?;
        order.write_u32(buf, 0x04, self.size as u32)?;
        order.write_u32(buf, 0x08, self.atime)?;
        order.write_u32(buf, 0x0C, self.ctime)?;
        order.write_u32(buf, 0x10, self.mtime)?;
        order.write_u32(buf, 0x14, self.dtime)?;
        order.write_u16(buf, 0x18, self.gid as u16)?;
        order.write_u16(buf, 0x1A, self.links_count)?;
        order.write_u32(buf, 0x1C, self.blocks as u32)?;
        order.write_u32(buf, 0x20, self.flags)?;
        order.write_u32(buf, 0x24, self.version)?;

        let word_order = if i_block_holds_bytes(self.mode, self.flags, self.size) {
            ByteOrder::Little
        } else {
            order
        };
        for (i, word) in self.block.iter().enumerate() {
            word_order.write_u32(buf, I_BLOCK_OFFSET + i * 4, *word)?;
        }

        order.write_u32(buf, 0x64, self.generation)?;
        order.write_u32(buf, 0x68, self.file_acl as u32)?;
        order.write_u32(buf, 0x6C, (self.size >> 32) as u32)?;
        order.write_u32(buf, 0x70, self.faddr)?;
        order.write_u16(buf, 0x74, (self.blocks >> 32) as u16)?;
        order.write_u16(buf, 0x76, (self.file_acl >> 32) as u16)?;
        order.write_u16(buf, 0x78, (self.uid >> 16) as u16)?;
        order.write_u16(buf, 0x7A, (self.gid >> 16) as u16)?;
        order.write_u16(buf, I_CHECKSUM_LO_OFFSET, self.checksum as u16)?;

        if len >= I_EXTRA_ISIZE_OFFSET + 2 {
            order.write_u16(buf, I_EXTRA_ISIZE_OFFSET, self.extra_isize)?;
        }
        let fits = |off: usize, n: usize| extra_fits(len, self.extra_isize, off, n);
        if fits(I_CHECKSUM_HI_OFFSET, 2) {
            order.write_u16(buf, I_CHECKSUM_HI_OFFSET, (self.checksum >> 16) as u16)?;
        }
        for (off, value) in [
            (TimeField::Ctime.extra_offset(), self.ctime_extra),
            (TimeField::Mtime.extra_offset(), self.mtime_extra),
            (TimeField::Atime.extra_offset(), self.atime_extra),
            (TimeField::Crtime.base_offset(), self.crtime),
            (TimeField::Crtime.extra_offset(), self.crtime_extra),
            (0x98, self.version_hi),
            (0x9C, self.projid),
        ] {
            if fits(off, 4) {
                order.write_u32(buf, off, value)?;
            }
        }
        Ok(out)
    }

    /// On-disk record size.
    #[must_use]
    pub fn record_size(&self) -> usize {
        self.raw.len()
    }

    /// Whether a field at `offset..offset+len` lies inside this inode's
    /// declared extra area.
    #[must_use]
    pub fn field_fits(&self, offset: usize, len: usize) -> bool {
        extra_fits(self.raw.len(), self.extra_isize, offset, len)
    }

    /// Bytes past `128 + extra_isize`: the in-inode extended attribute area.
    #[must_use]
    pub fn ibody_xattr_area(&self) -> &[u8] {
        let start = BASE + usize::from(self.extra_isize);
        self.raw.get(start..).unwrap_or(&[])
    }

    /// Replace the in-inode extended attribute area; `area` must match its length.
    pub fn set_ibody_xattr_area(&mut self, area: &[u8]) -> Result<(), ParseError> {
        let start = BASE + usize::from(self.extra_isize);
        let Some(dst) = self.raw.get_mut(start..) else {
            return Err(ParseError::InvalidField {
                field: "i_extra_isize",
                reason: "extra area exceeds inode size",
            });
        };
        if dst.len() != area.len() {
            return Err(ParseError::InvalidField {
                field: "xattr_ibody",
                reason: "area length mismatch",
            });
        }
        dst.copy_from_slice(area);
        Ok(())
    }

    // ── Timestamps ──────────────────────────────────────────────────────

    /// Read a timestamp, applying the extra field only when it fits.
    #[must_use]
    pub fn timestamp(&self, field: TimeField) -> Timestamp {
        let base = match field {
            TimeField::Atime => self.atime,
            TimeField::Ctime => self.ctime,
            TimeField::Mtime => self.mtime,
            TimeField::Crtime => {
                if !self.field_fits(field.base_offset(), 4) {
                    return Timestamp::default();
                }
                self.crtime
            }
        };
        let extra = self
            .field_fits(field.extra_offset(), 4)
            .then(|| self.extra_value(field));
        Timestamp::decode(base, extra)
    }

    /// Store a timestamp. Nanoseconds and the epoch are dropped when the
    /// inode has no room for the extra field.
    pub fn set_timestamp(&mut self, field: TimeField, ts: Timestamp) {
        let (base, extra) = ts.encode();
        let extra_fits = self.field_fits(field.extra_offset(), 4);
        match field {
            TimeField::Atime => self.atime = base,
            TimeField::Ctime => self.ctime = base,
            TimeField::Mtime => self.mtime = base,
            TimeField::Crtime => {
                if !self.field_fits(field.base_offset(), 4) {
                    return;
                }
                self.crtime = base;
            }
        }
        if extra_fits {
            match field {
                TimeField::Atime => self.atime_extra = extra,
                TimeField::Ctime => self.ctime_extra = extra,
                TimeField::Mtime => self.mtime_extra = extra,
                TimeField::Crtime => self.crtime_extra = extra,
            }
        }
    }

    fn extra_value(&self, field: TimeField) -> u32 {
        match field {
            TimeField::Atime => self.atime_extra,
            TimeField::Ctime => self.ctime_extra,
            TimeField::Mtime => self.mtime_extra,
            TimeField::Crtime => self.crtime_extra,
        }
    }

    // ── i_block views ───────────────────────────────────────────────────

    /// The 60 bytes of `i_block` in disk order.
    #[must_use]
    pub fn i_block_bytes(&self) -> [u8; 60] {
        let mut out = [0_u8; 60];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.block.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Overwrite `i_block` from disk-order bytes.
    pub fn set_i_block_bytes(&mut self, bytes: &[u8; 60]) {
        for (word, chunk) in self.block.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }

    // ── Flags ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn uses_extents(&self) -> bool {
        (self.flags & EXT4_EXTENTS_FL) != 0
    }

    #[must_use]
    pub fn has_inline_data(&self) -> bool {
        (self.flags & EXT4_INLINE_DATA_FL) != 0
    }

    #[must_use]
    pub fn is_huge_file(&self) -> bool {
        (self.flags & EXT4_HUGE_FILE_FL) != 0
    }

    #[must_use]
    pub fn has_htree_index(&self) -> bool {
        (self.flags & EXT2_INDEX_FL) != 0
    }

    // ── File type detection ─────────────────────────────────────────────

    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type_mode() == S_IFLNK
    }

    #[must_use]
    pub fn is_chrdev(&self) -> bool {
        self.file_type_mode() == S_IFCHR
    }

    #[must_use]
    pub fn is_blkdev(&self) -> bool {
        self.file_type_mode() == S_IFBLK
    }

    #[must_use]
    pub fn is_fifo(&self) -> bool {
        self.file_type_mode() == S_IFIFO
    }

    #[must_use]
    pub fn is_socket(&self) -> bool {
        self.file_type_mode() == S_IFSOCK
    }

    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        self.mode & 0o7777
    }

    /// A symlink whose target lives in `i_block`.
    #[must_use]
    pub fn is_fast_symlink(&self) -> bool {
        self.is_symlink()
            && !self.has_inline_data()
            && self.size > 0
            && self.size < EXT2_FAST_SYMLINK_MAX as u64
    }

    /// Target bytes of a fast symlink.
    #[must_use]
    pub fn fast_symlink_target(&self) -> Option<Vec<u8>> {
        if !self.is_fast_symlink() {
            return None;
        }
        let len = usize::try_from(self.size).ok()?;
        Some(self.i_block_bytes()[..len].to_vec())
    }
}

fn extra_fits(record_len: usize, extra_isize: u16, offset: usize, len: usize) -> bool {
    let end = offset + len;
    record_len >= end && BASE + usize::from(extra_isize) >= end
}

/// Equal when both encode to the same record, so preserved bytes the
/// model does not name count too.
impl PartialEq for Inode {
    fn eq(&self, other: &Self) -> bool {
        self.encode(ByteOrder::Little).ok() == other.encode(ByteOrder::Little).ok()
    }
}

impl Eq for Inode {}
