use e2_types::{
    ByteOrder, EXT2_DYNAMIC_REV, EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE,
    EXT2_GOOD_OLD_REV, EXT2_MIN_DESC_SIZE, EXT2_MIN_DESC_SIZE_64BIT, EXT2_SUPER_MAGIC,
    EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE, GroupNumber, ParseError, ensure_slice,
    ensure_slice_mut, ext2_block_size_from_log, read_fixed, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

// ── Feature flags ───────────────────────────────────────────────────────────

/// Compatible feature flags (`s_feature_compat`).
///
/// These are advisory; unknown bits are safe to ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompatFeatures(pub u32);

impl CompatFeatures {
    pub const DIR_PREALLOC: Self = Self(0x0001);
    pub const IMAGIC_INODES: Self = Self(0x0002);
    pub const HAS_JOURNAL: Self = Self(0x0004);
    pub const EXT_ATTR: Self = Self(0x0008);
    pub const RESIZE_INODE: Self = Self(0x0010);
    pub const DIR_INDEX: Self = Self(0x0020);
    pub const SPARSE_SUPER2: Self = Self(0x0200);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "DIR_PREALLOC"),
        (0x0002, "IMAGIC_INODES"),
        (0x0004, "HAS_JOURNAL"),
        (0x0008, "EXT_ATTR"),
        (0x0010, "RESIZE_INODE"),
        (0x0020, "DIR_INDEX"),
        (0x0200, "SPARSE_SUPER2"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Return names of all set flags.
    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for CompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Incompatible feature flags (`s_feature_incompat`).
///
/// Bits outside [`IncompatFeatures::SUPPORTED`] refuse the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IncompatFeatures(pub u32);

impl IncompatFeatures {
    pub const COMPRESSION: Self = Self(0x0001);
    pub const FILETYPE: Self = Self(0x0002);
    pub const RECOVER: Self = Self(0x0004);
    pub const JOURNAL_DEV: Self = Self(0x0008);
    pub const META_BG: Self = Self(0x0010);
    pub const EXTENTS: Self = Self(0x0040);
    pub const BIT64: Self = Self(0x0080);
    pub const MMP: Self = Self(0x0100);
    pub const FLEX_BG: Self = Self(0x0200);
    pub const EA_INODE: Self = Self(0x0400);
    pub const DIRDATA: Self = Self(0x1000);
    pub const CSUM_SEED: Self = Self(0x2000);
    pub const LARGEDIR: Self = Self(0x4000);
    pub const INLINE_DATA: Self = Self(0x8000);
    pub const ENCRYPT: Self = Self(0x10000);
    pub const CASEFOLD: Self = Self(0x20000);

    /// Bits this engine can mount with.
    pub const SUPPORTED: Self = Self(
        Self::FILETYPE.0
            | Self::RECOVER.0
            | Self::EXTENTS.0
            | Self::BIT64.0
            | Self::FLEX_BG.0
            | Self::CSUM_SEED.0
            | Self::INLINE_DATA.0,
    );

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "COMPRESSION"),
        (0x0002, "FILETYPE"),
        (0x0004, "RECOVER"),
        (0x0008, "JOURNAL_DEV"),
        (0x0010, "META_BG"),
        (0x0040, "EXTENTS"),
        (0x0080, "64BIT"),
        (0x0100, "MMP"),
        (0x0200, "FLEX_BG"),
        (0x0400, "EA_INODE"),
        (0x1000, "DIRDATA"),
        (0x2000, "CSUM_SEED"),
        (0x4000, "LARGEDIR"),
        (0x8000, "INLINE_DATA"),
        (0x10000, "ENCRYPT"),
        (0x20000, "CASEFOLD"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    /// Bits set on disk that this engine cannot mount with.
    #[must_use]
    pub fn unsupported_bits(self) -> u32 {
        self.0 & !Self::SUPPORTED.0
    }
}

impl std::fmt::Display for IncompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Read-only compatible feature flags (`s_feature_ro_compat`).
///
/// Unknown bits force a read-only mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoCompatFeatures(pub u32);

impl RoCompatFeatures {
    pub const SPARSE_SUPER: Self = Self(0x0001);
    pub const LARGE_FILE: Self = Self(0x0002);
    pub const BTREE_DIR: Self = Self(0x0004);
    pub const HUGE_FILE: Self = Self(0x0008);
    pub const GDT_CSUM: Self = Self(0x0010);
    pub const DIR_NLINK: Self = Self(0x0020);
    pub const EXTRA_ISIZE: Self = Self(0x0040);
    pub const QUOTA: Self = Self(0x0100);
    pub const BIGALLOC: Self = Self(0x0200);
    pub const METADATA_CSUM: Self = Self(0x0400);

    /// Bits this engine can write with.
    pub const SUPPORTED: Self = Self(
        Self::SPARSE_SUPER.0
            | Self::LARGE_FILE.0
            | Self::HUGE_FILE.0
            | Self::GDT_CSUM.0
            | Self::DIR_NLINK.0
            | Self::EXTRA_ISIZE.0
            | Self::METADATA_CSUM.0,
    );

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "SPARSE_SUPER"),
        (0x0002, "LARGE_FILE"),
        (0x0004, "BTREE_DIR"),
        (0x0008, "HUGE_FILE"),
        (0x0010, "GDT_CSUM"),
        (0x0020, "DIR_NLINK"),
        (0x0040, "EXTRA_ISIZE"),
        (0x0100, "QUOTA"),
        (0x0200, "BIGALLOC"),
        (0x0400, "METADATA_CSUM"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    #[must_use]
    pub fn unsupported_bits(self) -> u32 {
        self.0 & !Self::SUPPORTED.0
    }
}

impl std::fmt::Display for RoCompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

// ── Shared flag helpers ─────────────────────────────────────────────────────

fn describe_flags(bits: u32, known: &[(u32, &'static str)]) -> Vec<&'static str> {
    known
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Format a bitmask as a pipe-separated list of flag names.
///
/// Example output: `FILETYPE|EXTENTS` or `(none)` when zero.
/// Unknown bits are appended as hex, e.g. `FILETYPE|0x80000000`.
fn format_flags(
    f: &mut std::fmt::Formatter<'_>,
    bits: u32,
    known: &[(u32, &'static str)],
) -> std::fmt::Result {
    if bits == 0 {
        return f.write_str("(none)");
    }
    let mut first = true;
    let mut remaining = bits;
    for &(bit, name) in known {
        if remaining & bit != 0 {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            remaining &= !bit;
            first = false;
        }
    }
    if remaining != 0 {
        if !first {
            f.write_str("|")?;
        }
        write!(f, "0x{remaining:X}")?;
    }
    Ok(())
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// `s_state` bit: cleanly unmounted.
pub const EXT2_VALID_FS: u16 = 0x0001;
/// `s_state` bit: errors detected.
pub const EXT2_ERROR_FS: u16 = 0x0002;

/// One of the two error records the superblock keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub time: u32,
    pub ino: u32,
    pub line: u32,
    /// Historically a block number; the engine stores the error code here.
    pub block: u64,
    pub func: [u8; 32],
}

impl ErrorRecord {
    /// Function (source file) name without NUL padding.
    #[must_use]
    pub fn func_name(&self) -> String {
        trim_nul_padded(&self.func)
    }

    /// Copy `name` into the fixed-size field, truncating like `strncpy`.
    pub fn set_func_name(&mut self, name: &str) {
        self.func = [0; 32];
        let bytes = name.as_bytes();
        let len = bytes.len().min(self.func.len());
        self.func[..len].copy_from_slice(&bytes[..len]);
    }
}

const FIRST_ERROR_TIME: usize = 0x198;
const FIRST_ERROR_INO: usize = 0x19C;
const FIRST_ERROR_BLOCK: usize = 0x1A0;
const FIRST_ERROR_FUNC: usize = 0x1A8;
const FIRST_ERROR_LINE: usize = 0x1C8;
const LAST_ERROR_TIME: usize = 0x1CC;
const LAST_ERROR_INO: usize = 0x1D0;
const LAST_ERROR_LINE: usize = 0x1D4;
const LAST_ERROR_BLOCK: usize = 0x1D8;
const LAST_ERROR_FUNC: usize = 0x1E0;

/// Offset of `s_checksum` within the superblock.
pub const SUPERBLOCK_CHECKSUM_OFFSET: usize = 0x3FC;

/// The in-memory superblock.
///
/// Counters are the 32-bit fields of the classic layout. The raw region is
/// kept so [`Superblock::encode`] reproduces every byte the model does not
/// name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Superblock {
    // ── Counts & geometry ───────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_cluster_size: u32,
    pub blocks_per_group: u32,
    pub clusters_per_group: u32,
    pub inodes_per_group: u32,

    // ── Mount bookkeeping ───────────────────────────────────────────────
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub errors: u16,
    pub minor_rev_level: u16,
    pub lastcheck: u32,
    pub checkinterval: u32,
    pub creator_os: u32,
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,

    // ── Dynamic revision ────────────────────────────────────────────────
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: CompatFeatures,
    pub feature_incompat: IncompatFeatures,
    pub feature_ro_compat: RoCompatFeatures,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub last_mounted: Vec<u8>,
    pub reserved_gdt_blocks: u16,

    // ── Directory hashing & descriptors ─────────────────────────────────
    pub hash_seed: [u32; 4],
    pub def_hash_version: u8,
    pub desc_size: u16,
    pub default_mount_opts: u32,
    pub first_meta_bg: u32,
    pub mkfs_time: u32,
    pub min_extra_isize: u16,
    pub want_extra_isize: u16,
    pub flags: u32,

    // ── Error log ───────────────────────────────────────────────────────
    pub error_count: u32,
    pub first_error: ErrorRecord,
    pub last_error: ErrorRecord,

    // ── Checksums ───────────────────────────────────────────────────────
    pub checksum_type: u8,
    pub checksum_seed: u32,
    pub checksum: u32,

    #[serde(skip)]
    raw: Vec<u8>,
}

impl Superblock {
    /// Decode a 1024-byte superblock region laid out in `order`.
    #[allow(clippy::too_many_lines)]
    pub fn decode(region: &[u8], order: ByteOrder) -> Result<Self, ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }
        let region = &region[..EXT2_SUPERBLOCK_SIZE];

        let u16_at = |off: usize| order.read_u16(region, off);
        let u32_at = |off: usize| order.read_u32(region, off);
        let u64_at = |off: usize| order.read_u64(region, off);
        let u8_at = |off: usize| ensure_slice(region, off, 1).map(|b| b[0]);

        let magic = u16_at(0x38)?;
        if magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let read_error = |time, ino, line, block, func| -> Result<ErrorRecord, ParseError> {
            Ok(ErrorRecord {
                time: u32_at(time)?,
                ino: u32_at(ino)?,
                line: u32_at(line)?,
                block: u64_at(block)?,
                func: read_fixed::<32>(region, func)?,
            })
        };

        Ok(Self {
            inodes_count: u32_at(0x00)?,
            blocks_count: u32_at(0x04)?,
            r_blocks_count: u32_at(0x08)?,
            free_blocks_count: u32_at(0x0C)?,
            free_inodes_count: u32_at(0x10)?,
            first_data_block: u32_at(0x14)?,
            log_block_size: u32_at(0x18)?,
            log_cluster_size: u32_at(0x1C)?,
            blocks_per_group: u32_at(0x20)?,
            clusters_per_group: u32_at(0x24)?,
            inodes_per_group: u32_at(0x28)?,

            mtime: u32_at(0x2C)?,
            wtime: u32_at(0x30)?,
            mnt_count: u16_at(0x34)?,
            max_mnt_count: u16_at(0x36)?,
            magic,
            state: u16_at(0x3A)?,
            errors: u16_at(0x3C)?,
            minor_rev_level: u16_at(0x3E)?,
            lastcheck: u32_at(0x40)?,
            checkinterval: u32_at(0x44)?,
            creator_os: u32_at(0x48)?,
            rev_level: u32_at(0x4C)?,
            def_resuid: u16_at(0x50)?,
            def_resgid: u16_at(0x52)?,

            first_ino: u32_at(0x54)?,
            inode_size: u16_at(0x58)?,
            block_group_nr: u16_at(0x5A)?,
            feature_compat: CompatFeatures(u32_at(0x5C)?),
            feature_incompat: IncompatFeatures(u32_at(0x60)?),
            feature_ro_compat: RoCompatFeatures(u32_at(0x64)?),
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: read_fixed::<16>(region, 0x78)?,
            last_mounted: ensure_slice(region, 0x88, 64)?.to_vec(),
            reserved_gdt_blocks: u16_at(0xCE)?,

            hash_seed: [u32_at(0xEC)?, u32_at(0xF0)?, u32_at(0xF4)?, u32_at(0xF8)?],
            def_hash_version: u8_at(0xFC)?,
            desc_size: u16_at(0xFE)?,
            default_mount_opts: u32_at(0x100)?,
            first_meta_bg: u32_at(0x104)?,
            mkfs_time: u32_at(0x108)?,
            min_extra_isize: u16_at(0x15C)?,
            want_extra_isize: u16_at(0x15E)?,
            flags: u32_at(0x160)?,

            error_count: u32_at(0x194)?,
            first_error: read_error(
                FIRST_ERROR_TIME,
                FIRST_ERROR_INO,
                FIRST_ERROR_LINE,
                FIRST_ERROR_BLOCK,
                FIRST_ERROR_FUNC,
            )?,
            last_error: read_error(
                LAST_ERROR_TIME,
                LAST_ERROR_INO,
                LAST_ERROR_LINE,
                LAST_ERROR_BLOCK,
                LAST_ERROR_FUNC,
            )?,

            checksum_type: u8_at(0x175)?,
            checksum_seed: u32_at(0x270)?,
            checksum: u32_at(SUPERBLOCK_CHECKSUM_OFFSET)?,

            raw: region.to_vec(),
        })
    }

    /// Decode the superblock from a full disk image (always little-endian).
    pub fn decode_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(image, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE)?;
        Self::decode(region, ByteOrder::Little)
    }

    /// Encode into a 1024-byte region laid out in `order`.
    #[allow(clippy::too_many_lines)]
    pub fn encode(&self, order: ByteOrder) -> Result<Vec<u8>, ParseError> {
        let mut out = if self.raw.len() == EXT2_SUPERBLOCK_SIZE {
            self.raw.clone()
        } else {
            vec![0_u8; EXT2_SUPERBLOCK_SIZE]
        };
        let buf = out.as_mut_slice();

        for (off, value) in [
            (0x00, self.inodes_count),
            (0x04, self.blocks_count),
            (0x08, self.r_blocks_count),
            (0x0C, self.free_blocks_count),
            (0x10, self.free_inodes_count),
            (0x14, self.first_data_block),
            (0x18, self.log_block_size),
            (0x1C, self.log_cluster_size),
            (0x20, self.blocks_per_group),
            (0x24, self.clusters_per_group),
            (0x28, self.inodes_per_group),
            (0x2C, self.mtime),
            (0x30, self.wtime),
            (0x40, self.lastcheck),
            (0x44, self.checkinterval),
            (0x48, self.creator_os),
            (0x4C, self.rev_level),
            (0x54, self.first_ino),
            (0x5C, self.feature_compat.0),
            (0x60, self.feature_incompat.0),
            (0x64, self.feature_ro_compat.0),
            (0xEC, self.hash_seed[0]),
            (0xF0, self.hash_seed[1]),
            (0xF4, self.hash_seed[2]),
            (0xF8, self.hash_seed[3]),
            (0x100, self.default_mount_opts),
            (0x104, self.first_meta_bg),
            (0x108, self.mkfs_time),
            (0x160, self.flags),
            (0x194, self.error_count),
            (FIRST_ERROR_TIME, self.first_error.time),
            (FIRST_ERROR_INO, self.first_error.ino),
            (FIRST_ERROR_LINE, self.first_error.line),
            (LAST_ERROR_TIME, self.last_error.time),
            (LAST_ERROR_INO, self.last_error.ino),
            (LAST_ERROR_LINE, self.last_error.line),
            (0x270, self.checksum_seed),
            (SUPERBLOCK_CHECKSUM_OFFSET, self.checksum),
        ] {
            order.write_u32(buf, off, value)?;
        }

        for (off, value) in [
            (0x34, self.mnt_count),
            (0x36, self.max_mnt_count),
            (0x38, self.magic),
            (0x3A, self.state),
            (0x3C, self.errors),
            (0x3E, self.minor_rev_level),
            (0x50, self.def_resuid),
            (0x52, self.def_resgid),
            (0x58, self.inode_size),
            (0x5A, self.block_group_nr),
            (0xCE, self.reserved_gdt_blocks),
            (0xFE, self.desc_size),
            (0x15C, self.min_extra_isize),
            (0x15E, self.want_extra_isize),
        ] {
            order.write_u16(buf, off, value)?;
        }

        order.write_u64(buf, FIRST_ERROR_BLOCK, self.first_error.block)?;
        order.write_u64(buf, LAST_ERROR_BLOCK, self.last_error.block)?;

        ensure_slice_mut(buf, 0x68, 16)?.copy_from_slice(&self.uuid);
        ensure_slice_mut(buf, 0x78, 16)?.copy_from_slice(&self.volume_name);
        let mounted = ensure_slice_mut(buf, 0x88, 64)?;
        mounted.fill(0);
        let len = self.last_mounted.len().min(64);
        mounted[..len].copy_from_slice(&self.last_mounted[..len]);
        ensure_slice_mut(buf, FIRST_ERROR_FUNC, 32)?.copy_from_slice(&self.first_error.func);
        ensure_slice_mut(buf, LAST_ERROR_FUNC, 32)?.copy_from_slice(&self.last_error.func);
        ensure_slice_mut(buf, 0xFC, 1)?[0] = self.def_hash_version;
        ensure_slice_mut(buf, 0x175, 1)?[0] = self.checksum_type;

        Ok(out)
    }

    /// Build a superblock from scratch (formatter path).
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            magic: EXT2_SUPER_MAGIC,
            last_mounted: vec![0; 64],
            raw: vec![0; EXT2_SUPERBLOCK_SIZE],
            ..Self::default()
        }
    }

    // ── Feature queries ─────────────────────────────────────────────────

    #[must_use]
    pub fn has_compat(&self, mask: CompatFeatures) -> bool {
        (self.feature_compat.0 & mask.0) != 0
    }

    #[must_use]
    pub fn has_incompat(&self, mask: IncompatFeatures) -> bool {
        (self.feature_incompat.0 & mask.0) != 0
    }

    #[must_use]
    pub fn has_ro_compat(&self, mask: RoCompatFeatures) -> bool {
        (self.feature_ro_compat.0 & mask.0) != 0
    }

    /// Whether directory entries carry a file-type byte.
    #[must_use]
    pub fn has_filetype(&self) -> bool {
        self.has_incompat(IncompatFeatures::FILETYPE)
    }

    /// Whether this superblock uses metadata checksums (crc32c).
    #[must_use]
    pub fn has_metadata_csum(&self) -> bool {
        self.has_ro_compat(RoCompatFeatures::METADATA_CSUM)
    }

    /// Whether group descriptors carry any checksum (crc16 or crc32c).
    #[must_use]
    pub fn has_group_desc_csum(&self) -> bool {
        self.has_metadata_csum() || self.has_ro_compat(RoCompatFeatures::GDT_CSUM)
    }

    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.has_incompat(IncompatFeatures::BIT64)
    }

    // ── Geometry ────────────────────────────────────────────────────────

    /// Block size in bytes, or `None` for a nonsensical shift.
    #[must_use]
    pub fn block_size(&self) -> Option<u32> {
        ext2_block_size_from_log(self.log_block_size)
    }

    /// Inode record size (128 on revision-0 filesystems).
    #[must_use]
    pub fn inode_size(&self) -> u16 {
        if self.rev_level == EXT2_GOOD_OLD_REV {
            EXT2_GOOD_OLD_INODE_SIZE
        } else {
            self.inode_size
        }
    }

    /// First inode available to ordinary files.
    #[must_use]
    pub fn first_ino(&self) -> u32 {
        if self.rev_level == EXT2_GOOD_OLD_REV {
            EXT2_GOOD_OLD_FIRST_INO
        } else {
            self.first_ino
        }
    }

    #[must_use]
    pub fn group_desc_size(&self) -> u16 {
        if self.is_64bit() {
            self.desc_size.max(EXT2_MIN_DESC_SIZE_64BIT)
        } else {
            EXT2_MIN_DESC_SIZE
        }
    }

    /// Number of block groups in this filesystem.
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        self.blocks_count
            .saturating_sub(self.first_data_block)
            .div_ceil(self.blocks_per_group)
    }

    /// Blocks occupied by each group's inode table.
    #[must_use]
    pub fn inode_table_blocks(&self) -> u32 {
        let Some(bs) = self.block_size() else {
            return 0;
        };
        let per_block = bs / u32::from(self.inode_size().max(1));
        if per_block == 0 {
            return 0;
        }
        self.inodes_per_group.div_ceil(per_block)
    }

    /// Blocks usable by unprivileged writers: free minus reserved, clamped at zero.
    #[must_use]
    pub fn available_blocks(&self) -> u32 {
        self.free_blocks_count.saturating_sub(self.r_blocks_count)
    }

    /// Byte offset of group `group`'s descriptor relative to the descriptor table start.
    #[must_use]
    pub fn group_desc_offset(&self, group: GroupNumber) -> u64 {
        u64::from(group.0) * u64::from(self.group_desc_size())
    }

    /// Block holding the first group descriptor.
    #[must_use]
    pub fn group_desc_table_block(&self) -> u64 {
        u64::from(self.first_data_block) + 1
    }

    #[must_use]
    pub fn volume_name(&self) -> String {
        trim_nul_padded(&self.volume_name)
    }

    #[must_use]
    pub fn last_mounted(&self) -> String {
        trim_nul_padded(&self.last_mounted)
    }

    /// Check geometry before any of it is used for arithmetic.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.rev_level > EXT2_DYNAMIC_REV {
            return Err(ParseError::InvalidField {
                field: "s_rev_level",
                reason: "unknown revision",
            });
        }
        let Some(block_size) = self.block_size().filter(|bs| (1024..=65536).contains(bs))
        else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "block size out of range",
            });
        };
        if self.blocks_per_group == 0 || self.blocks_per_group > block_size * 8 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "must be in 1..=8*block_size",
            });
        }
        if self.inodes_per_group == 0 || self.inodes_per_group > block_size * 8 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "must be in 1..=8*block_size",
            });
        }
        let inode_size = u32::from(self.inode_size());
        if inode_size < u32::from(EXT2_GOOD_OLD_INODE_SIZE)
            || !inode_size.is_power_of_two()
            || inode_size > block_size
        {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two in 128..=block_size",
            });
        }
        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "beyond end of filesystem",
            });
        }
        if self.is_64bit() && self.desc_size != 0 && !self.desc_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "must be a power of two",
            });
        }
        Ok(())
    }
}

/// Equal when both encode to the same region, so preserved bytes the
/// model does not name count too.
impl PartialEq for Superblock {
    fn eq(&self, other: &Self) -> bool {
        self.encode(ByteOrder::Little).ok() == other.encode(ByteOrder::Little).ok()
    }
}

impl Eq for Superblock {}
