//! Minimal ext2 formatter.
//!
//! Lays out groups, bitmaps and inode tables, writes the primary
//! superblock and descriptor table (plus sparse backups), then opens the
//! result to create the root directory and `lost+found`.

use crate::ParseResultExt;
use crate::fs::{Ext2Fs, OpenOptions, now_secs};
use e2_alloc::{FsGeometry, bitmap_mark_tail, bitmap_set, reserved_blocks_in_group};
use e2_block::{ByteDevice, IoChannel, IoChannelOptions};
use e2_error::{E2Error, Result};
use e2_ondisk::csum::{bitmap_checksum, csum_seed, set_group_desc_checksum, set_superblock_checksum};
use e2_ondisk::group::EXT2_BG_INODE_ZEROED;
use e2_ondisk::superblock::EXT2_VALID_FS;
use e2_ondisk::{
    CompatFeatures, FileType, GroupDesc, IncompatFeatures, RoCompatFeatures, Superblock,
};
use e2_types::{
    BlockNumber, ByteOrder, EXT2_DYNAMIC_REV, EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE,
    EXT2_MIN_DESC_SIZE, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE, GroupNumber, InodeNumber,
    S_IFDIR,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// `s_errors`: continue after an error.
const ERRORS_CONTINUE: u16 = 1;
/// `s_def_hash_version`: half MD4.
const HASH_HALF_MD4: u8 = 1;
/// `s_checksum_type`: crc32c.
const CHECKSUM_CRC32C: u8 = 1;
/// Smallest inode table worth formatting.
const MIN_INODES_PER_GROUP: u32 = 16;
/// Smallest volume the formatter accepts, in blocks.
const MIN_BLOCKS: u32 = 64;
/// A trailing group needs this many data blocks beyond its metadata to be kept.
const MIN_TAIL_DATA_BLOCKS: u32 = 50;

/// Formatter parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Block size in bytes; a power of two from 1024 to 65536.
    pub block_size: u32,
    /// Blocks per group; defaults to eight times the block size.
    pub blocks_per_group: Option<u32>,
    /// Filesystem size in blocks; defaults to the whole device.
    pub blocks_count: Option<u32>,
    pub inode_size: u16,
    /// Bytes of space per inode when sizing inode tables.
    pub bytes_per_inode: u32,
    /// Percentage of blocks reserved for the superuser.
    pub reserved_percent: u8,
    pub volume_name: String,
    /// Volume UUID; derived from the format time when unset.
    pub uuid: Option<[u8; 16]>,
    pub filetype: bool,
    pub extents: bool,
    pub inline_data: bool,
    pub metadata_csum: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks_per_group: None,
            blocks_count: None,
            inode_size: EXT2_GOOD_OLD_INODE_SIZE,
            bytes_per_inode: 4096,
            reserved_percent: 5,
            volume_name: String::new(),
            uuid: None,
            filetype: true,
            extents: false,
            inline_data: false,
            metadata_csum: false,
        }
    }
}

impl FormatOptions {
    fn validate(&self) -> Result<()> {
        let bs = self.block_size;
        if !bs.is_power_of_two() || !(1024..=65536).contains(&bs) {
            return Err(E2Error::InvalidArgument(format!("block size {bs}")));
        }
        let isz = u32::from(self.inode_size);
        if !isz.is_power_of_two() || isz < u32::from(EXT2_GOOD_OLD_INODE_SIZE) || isz > bs {
            return Err(E2Error::InvalidArgument(format!("inode size {isz}")));
        }
        if self.inline_data && isz == u32::from(EXT2_GOOD_OLD_INODE_SIZE) {
            return Err(E2Error::InvalidArgument(
                "inline data needs inodes larger than 128 bytes".to_owned(),
            ));
        }
        if let Some(bpg) = self.blocks_per_group {
            if bpg == 0 || bpg % 8 != 0 || bpg > bs * 8 {
                return Err(E2Error::InvalidArgument(format!("blocks per group {bpg}")));
            }
        }
        if self.bytes_per_inode < 1024 || self.reserved_percent > 50 {
            return Err(E2Error::InvalidArgument(
                "bytes per inode or reserved percentage out of range".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Mix the format time and size into a stable-looking UUID.
fn derive_uuid(seed: u64) -> [u8; 16] {
    let mut state = seed ^ 0x9E37_79B9_7F4A_7C15;
    let mut next = || {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    };
    let mut uuid = [0_u8; 16];
    uuid[..8].copy_from_slice(&next().to_le_bytes());
    uuid[8..].copy_from_slice(&next().to_le_bytes());
    // RFC 4122 version 4, variant 1.
    uuid[6] = (uuid[6] & 0x0F) | 0x40;
    uuid[8] = (uuid[8] & 0x3F) | 0x80;
    uuid
}

fn inodes_per_group(opts: &FormatOptions, blocks_in_first_group: u32) -> u32 {
    let bs = opts.block_size;
    let per_block = bs / u32::from(opts.inode_size);
    let step = per_block.max(8);
    let wanted = u64::from(blocks_in_first_group) * u64::from(bs) / u64::from(opts.bytes_per_inode);
    let wanted = u32::try_from(wanted).unwrap_or(u32::MAX).max(MIN_INODES_PER_GROUP);
    let rounded = wanted.div_ceil(step).saturating_mul(step);
    rounded.min(bs * 8 / step * step)
}

/// Build the superblock for `opts` on a device of `device_len` bytes.
fn plan_superblock(opts: &FormatOptions, device_len: u64) -> Result<Superblock> {
    let bs = opts.block_size;
    let device_blocks = u32::try_from(device_len / u64::from(bs)).unwrap_or(u32::MAX);
    let blocks_count = opts.blocks_count.unwrap_or(device_blocks);
    if blocks_count > device_blocks {
        return Err(E2Error::InvalidArgument(format!(
            "{blocks_count} blocks requested, device holds {device_blocks}"
        )));
    }
    if blocks_count < MIN_BLOCKS {
        return Err(E2Error::TooSmall);
    }
    let first_data_block = u32::from(bs == 1024);
    let blocks_per_group = opts.blocks_per_group.unwrap_or(bs * 8);
    let first_group_blocks = blocks_count
        .saturating_sub(first_data_block)
        .min(blocks_per_group);
    let ipg = inodes_per_group(opts, first_group_blocks);

    let now = now_secs();
    let mut sb = Superblock::zeroed();
    sb.blocks_count = blocks_count;
    sb.r_blocks_count =
        u32::try_from(u64::from(blocks_count) * u64::from(opts.reserved_percent) / 100).unwrap_or(0);
    sb.first_data_block = first_data_block;
    sb.log_block_size = bs.trailing_zeros() - 10;
    sb.log_cluster_size = sb.log_block_size;
    sb.blocks_per_group = blocks_per_group;
    sb.clusters_per_group = blocks_per_group;
    sb.inodes_per_group = ipg;
    sb.inodes_count = ipg.saturating_mul(sb.groups_count());
    sb.wtime = now;
    sb.mkfs_time = now;
    sb.lastcheck = now;
    sb.max_mnt_count = u16::MAX;
    sb.state = EXT2_VALID_FS;
    sb.errors = ERRORS_CONTINUE;
    sb.rev_level = EXT2_DYNAMIC_REV;
    sb.first_ino = EXT2_GOOD_OLD_FIRST_INO;
    sb.inode_size = opts.inode_size;
    if opts.inode_size > EXT2_GOOD_OLD_INODE_SIZE {
        sb.min_extra_isize = 32;
        sb.want_extra_isize = 32;
    }

    sb.feature_compat = CompatFeatures::EXT_ATTR;
    let mut incompat = 0;
    if opts.filetype {
        incompat |= IncompatFeatures::FILETYPE.0;
    }
    if opts.extents {
        incompat |= IncompatFeatures::EXTENTS.0;
    }
    if opts.inline_data {
        incompat |= IncompatFeatures::INLINE_DATA.0;
    }
    sb.feature_incompat = IncompatFeatures(incompat);
    let mut ro_compat = RoCompatFeatures::SPARSE_SUPER.0 | RoCompatFeatures::LARGE_FILE.0;
    if opts.metadata_csum {
        ro_compat |= RoCompatFeatures::METADATA_CSUM.0;
        sb.checksum_type = CHECKSUM_CRC32C;
    }
    if opts.inode_size > EXT2_GOOD_OLD_INODE_SIZE {
        ro_compat |= RoCompatFeatures::EXTRA_ISIZE.0;
    }
    sb.feature_ro_compat = RoCompatFeatures(ro_compat);

    sb.uuid = opts
        .uuid
        .unwrap_or_else(|| derive_uuid((u64::from(now) << 32) ^ device_len));
    for (i, word) in sb.hash_seed.iter_mut().enumerate() {
        let chunk = [sb.uuid[i * 4], sb.uuid[i * 4 + 1], sb.uuid[i * 4 + 2], sb.uuid[i * 4 + 3]];
        *word = u32::from_le_bytes(chunk).rotate_left(13) ^ 0x5bd1_e995;
    }
    sb.def_hash_version = HASH_HALF_MD4;
    let name = opts.volume_name.as_bytes();
    let len = name.len().min(sb.volume_name.len());
    sb.volume_name[..len].copy_from_slice(&name[..len]);

    sb.validate_geometry().or_corrupt(BlockNumber(1))?;
    drop_short_tail_group(&mut sb)?;
    Ok(sb)
}

/// Shrink the volume to whole groups when the last group could not hold
/// its own metadata plus a little data.
fn drop_short_tail_group(sb: &mut Superblock) -> Result<()> {
    let geo = FsGeometry::from_superblock(sb)?;
    if geo.group_count < 2 {
        return Ok(());
    }
    let last = GroupNumber(geo.group_count - 1);
    let tail = geo.blocks_in_group(last);
    let mut overhead = 2 + geo.inode_table_blocks();
    if geo.group_has_superblock(last) {
        overhead += 1 + geo.desc_blocks(EXT2_MIN_DESC_SIZE);
    }
    if tail >= overhead + MIN_TAIL_DATA_BLOCKS {
        return Ok(());
    }
    sb.blocks_count -= tail;
    sb.inodes_count = sb.inodes_per_group.saturating_mul(sb.groups_count());
    sb.r_blocks_count = sb.r_blocks_count.min(sb.blocks_count / 2);
    debug!(target: "e2fs::mkfs", event = "tail_group_dropped", blocks = tail);
    Ok(())
}

/// Group descriptors with their metadata placed; counters left for
/// [`fill_bitmaps`].
fn plan_groups(sb: &Superblock, geo: &FsGeometry) -> Result<Vec<GroupDesc>> {
    let gdt_blocks = geo.desc_blocks(EXT2_MIN_DESC_SIZE);
    let itb = geo.inode_table_blocks();
    let mut groups = Vec::with_capacity(geo.group_count as usize);
    for g in 0..geo.group_count {
        let group = GroupNumber(g);
        let start = geo.group_first_block(group).0;
        let meta_start = if geo.group_has_superblock(group) {
            start + 1 + u64::from(gdt_blocks)
        } else {
            start
        };
        let overhead = meta_start - start + 2 + u64::from(itb);
        if overhead >= u64::from(geo.blocks_in_group(group)) {
            return Err(E2Error::TooSmall);
        }
        let mut gd = GroupDesc::zeroed(sb.group_desc_size());
        gd.block_bitmap = meta_start;
        gd.inode_bitmap = meta_start + 1;
        gd.inode_table = meta_start + 2;
        groups.push(gd);
    }
    Ok(groups)
}

/// Build both bitmaps of every group and set the descriptor counters.
/// Inodes below `first_ino` are marked in use, except the root, which the
/// directory code allocates.
fn fill_bitmaps(
    sb: &Superblock,
    geo: &FsGeometry,
    groups: &mut [GroupDesc],
) -> Vec<(Vec<u8>, Vec<u8>)> {
    let bs = geo.block_size as usize;
    let gdt_blocks = geo.desc_blocks(EXT2_MIN_DESC_SIZE);
    let seed = csum_seed(sb);
    let csum = sb.has_metadata_csum();
    let gd_csum = sb.has_group_desc_csum();
    let root_index = u32::try_from(InodeNumber::ROOT.0 - 1).unwrap_or(1);
    let mut out = Vec::with_capacity(groups.len());
    for (g, gd) in groups.iter_mut().enumerate() {
        let group = GroupNumber(u32::try_from(g).unwrap_or(u32::MAX));
        let mut block_bitmap = vec![0_u8; bs];
        let reserved = reserved_blocks_in_group(geo, gd, group, gdt_blocks);
        for &rel in &reserved {
            bitmap_set(&mut block_bitmap, rel);
        }
        let in_group = geo.blocks_in_group(group);
        bitmap_mark_tail(&mut block_bitmap, in_group);
        gd.free_blocks_count = in_group - u32::try_from(reserved.len()).unwrap_or(in_group);

        let mut inode_bitmap = vec![0_u8; bs];
        let mut used = 0;
        if g == 0 {
            for idx in (0..geo.first_ino.saturating_sub(1)).filter(|&i| i != root_index) {
                bitmap_set(&mut inode_bitmap, idx);
                used += 1;
            }
        }
        bitmap_mark_tail(&mut inode_bitmap, geo.inodes_per_group);
        gd.free_inodes_count = geo.inodes_per_group - used;

        if gd_csum {
            gd.flags |= EXT2_BG_INODE_ZEROED;
            gd.itable_unused = if g == 0 {
                geo.inodes_per_group - geo.first_ino.saturating_sub(1)
            } else {
                geo.inodes_per_group
            };
        }
        if csum {
            gd.block_bitmap_csum =
                bitmap_checksum(seed, &block_bitmap, (geo.blocks_per_group / 8) as usize);
            gd.inode_bitmap_csum =
                bitmap_checksum(seed, &inode_bitmap, (geo.inodes_per_group / 8) as usize);
        }
        out.push((block_bitmap, inode_bitmap));
    }
    out
}

fn write_layout(
    channel: &IoChannel,
    sb: &Superblock,
    geo: &FsGeometry,
    groups: &[GroupDesc],
    bitmaps: &[(Vec<u8>, Vec<u8>)],
) -> Result<()> {
    let bs = geo.block_size as usize;
    let ds = usize::from(sb.group_desc_size());
    let gdt_blocks = geo.desc_blocks(EXT2_MIN_DESC_SIZE);
    let mut gdt = vec![0_u8; gdt_blocks as usize * bs];
    for (g, gd) in groups.iter().enumerate() {
        let group = u32::try_from(g).unwrap_or(u32::MAX);
        let mut raw = gd.encode(ByteOrder::Little).or_corrupt(BlockNumber(0))?;
        set_group_desc_checksum(sb, group, &mut raw).or_corrupt(BlockNumber(0))?;
        gdt[g * ds..(g + 1) * ds].copy_from_slice(&raw[..ds]);
    }

    for (g, (gd, (block_bitmap, inode_bitmap))) in groups.iter().zip(bitmaps).enumerate() {
        let group = GroupNumber(u32::try_from(g).unwrap_or(u32::MAX));
        if geo.group_has_superblock(group) {
            let start = geo.group_first_block(group).0;
            let mut copy = sb.clone();
            copy.block_group_nr = u16::try_from(g).unwrap_or(u16::MAX);
            write_superblock_copy(channel, &copy, start, bs)?;
            let count = i64::from(gdt_blocks);
            channel.write_blocks(BlockNumber(start + 1), count, &gdt)?;
        }
        channel.write_block(BlockNumber(gd.block_bitmap), block_bitmap)?;
        channel.write_block(BlockNumber(gd.inode_bitmap), inode_bitmap)?;
        channel.zero_blocks(BlockNumber(gd.inode_table), u64::from(geo.inode_table_blocks()))?;
        debug!(target: "e2fs::mkfs", event = "group_written", group = g, itable = gd.inode_table);
    }
    Ok(())
}

/// Write a superblock copy for the group starting at `start`. The primary
/// copy sits at byte 1024 whatever the block size.
fn write_superblock_copy(channel: &IoChannel, sb: &Superblock, start: u64, bs: usize) -> Result<()> {
    let (block, within) = if start <= u64::from(sb.first_data_block) {
        (
            BlockNumber((EXT2_SUPERBLOCK_OFFSET / bs) as u64),
            EXT2_SUPERBLOCK_OFFSET % bs,
        )
    } else {
        (BlockNumber(start), 0)
    };
    let mut region = sb.encode(ByteOrder::Little).or_corrupt(block)?;
    if sb.has_metadata_csum() {
        set_superblock_checksum(&mut region).or_corrupt(block)?;
    }
    let mut buf = vec![0_u8; bs];
    buf[within..within + EXT2_SUPERBLOCK_SIZE].copy_from_slice(&region);
    channel.write_block(block, &buf)
}

/// Create root (inode 2) and `lost+found` (the first ordinary inode).
fn make_root(fs: &Ext2Fs) -> Result<()> {
    let m = fs.begin_mutation()?;
    let root = InodeNumber::ROOT;
    fs.make_dir_inode(&m, root, root, 0o755, false)?;
    let lost = fs.new_inode(root, S_IFDIR | 0o700)?;
    fs.make_dir_inode(&m, lost, root, 0o700, false)?;
    fs.link_in(&m, root, b"lost+found", lost, FileType::Dir)?;
    let mut root_inode = fs.read_inode(root)?;
    root_inode.links_count += 1;
    fs.write_inode_in(&m, root, &root_inode)?;
    debug!(target: "e2fs::mkfs", event = "root_created", lost_found = lost.0);
    Ok(())
}

/// Format `device` as an empty ext2 volume.
pub fn format(device: Arc<dyn ByteDevice>, opts: &FormatOptions) -> Result<()> {
    opts.validate()?;
    if device.is_read_only() {
        return Err(E2Error::ReadOnly);
    }
    let sb = plan_superblock(opts, device.len_bytes())?;
    let geo = FsGeometry::from_superblock(&sb)?;
    let mut groups = plan_groups(&sb, &geo)?;
    let bitmaps = fill_bitmaps(&sb, &geo, &mut groups);

    let mut sb = sb;
    sb.free_blocks_count = groups.iter().map(|gd| gd.free_blocks_count).sum();
    sb.free_inodes_count = groups.iter().map(|gd| gd.free_inodes_count).sum();

    let channel = IoChannel::open(Arc::clone(&device), IoChannelOptions::default());
    channel.set_block_size(geo.block_size)?;
    write_layout(&channel, &sb, &geo, &groups, &bitmaps)?;
    channel.close()?;

    let fs = Ext2Fs::open(device, &OpenOptions::default())?;
    make_root(&fs)?;
    let sb = fs.superblock();
    fs.close()?;
    info!(
        target: "e2fs::mkfs",
        event = "formatted",
        block_size = geo.block_size,
        blocks = sb.blocks_count,
        inodes = sb.inodes_count,
        groups = geo.group_count,
        free_blocks = sb.free_blocks_count
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{formatted, open};
    use e2_alloc::bitmap_get;

    #[test]
    fn one_mebibyte_volume_layout() {
        let dev = formatted(&FormatOptions::default(), 1024 * 1024);
        let fs = open(&dev);
        let sb = fs.superblock();
        assert_eq!(sb.blocks_count, 1024);
        assert_eq!(sb.first_data_block, 1);
        assert_eq!(fs.geometry().group_count, 1);
        assert_eq!(sb.inodes_count, 256);
        assert_eq!(sb.r_blocks_count, 51);
        assert_eq!(sb.error_count, 0);
        assert_eq!(fs.lookup(InodeNumber::ROOT, b"lost+found").expect("lookup"), Some(InodeNumber(11)));

        let gd = fs.group_desc(GroupNumber(0)).expect("gd");
        assert_eq!(gd.used_dirs_count, 2);
        assert_eq!(gd.free_inodes_count, 256 - 11);
        assert_eq!(sb.free_blocks_count, gd.free_blocks_count);
        // Superblock, GDT, two bitmaps, 32 table blocks, two directories.
        assert_eq!(gd.free_blocks_count, 1023 - (1 + 1 + 2 + 32 + 2));
    }

    #[test]
    fn bitmaps_match_counters() {
        let dev = formatted(&FormatOptions::default(), 512 * 1024);
        let fs = open(&dev);
        let gd = fs.group_desc(GroupNumber(0)).expect("gd");
        let blocks = fs.read_block_bitmap(GroupNumber(0)).expect("block bitmap");
        let in_group = fs.geometry().blocks_in_group(GroupNumber(0));
        let used = (0..in_group).filter(|&i| bitmap_get(&blocks, i)).count();
        assert_eq!(in_group - u32::try_from(used).expect("fits"), gd.free_blocks_count);

        let inodes = fs.read_inode_bitmap(GroupNumber(0)).expect("inode bitmap");
        let ipg = fs.geometry().inodes_per_group;
        let used = (0..ipg).filter(|&i| bitmap_get(&inodes, i)).count();
        assert_eq!(ipg - u32::try_from(used).expect("fits"), gd.free_inodes_count);
        assert!(bitmap_get(&inodes, 1), "root is allocated");
        assert!(bitmap_get(&inodes, 10), "lost+found is allocated");
    }

    #[test]
    fn multi_group_volume_with_sparse_backups() {
        let opts = FormatOptions {
            blocks_per_group: Some(256),
            ..FormatOptions::default()
        };
        let dev = formatted(&opts, 1024 * 1024);
        let fs = open(&dev);
        let geo = fs.geometry().clone();
        assert_eq!(geo.group_count, 4);
        let groups = fs.group_descs();
        let sb = fs.superblock();
        assert_eq!(groups.iter().map(|g| g.free_blocks_count).sum::<u32>(), sb.free_blocks_count);
        assert_eq!(groups.iter().map(|g| g.free_inodes_count).sum::<u32>(), sb.free_inodes_count);

        // Group 1 carries a backup superblock; group 2 does not.
        assert_eq!(groups[1].block_bitmap, geo.group_first_block(GroupNumber(1)).0 + 2);
        assert_eq!(groups[2].block_bitmap, geo.group_first_block(GroupNumber(2)).0);
        let image = dev.snapshot();
        let backup_at = usize::try_from(geo.group_first_block(GroupNumber(1)).0 * 1024).expect("fits");
        let backup = Superblock::decode(&image[backup_at..backup_at + 1024], ByteOrder::Little)
            .expect("backup");
        assert_eq!(backup.block_group_nr, 1);
        assert_eq!(backup.uuid, sb.uuid);
    }

    #[test]
    fn larger_blocks_keep_the_superblock_at_byte_1024() {
        let opts = FormatOptions {
            block_size: 4096,
            ..FormatOptions::default()
        };
        let dev = formatted(&opts, 4 * 1024 * 1024);
        let image = dev.snapshot();
        let sb = Superblock::decode_from_image(&image).expect("sb");
        assert_eq!(sb.block_size(), Some(4096));
        assert_eq!(sb.first_data_block, 0);
        let fs = open(&dev);
        assert_eq!(fs.lookup(InodeNumber::ROOT, b"lost+found").expect("lookup"), Some(InodeNumber(11)));
    }

    #[test]
    fn checksummed_volume_opens_clean() {
        let opts = FormatOptions {
            inode_size: 256,
            metadata_csum: true,
            volume_name: "scratch".to_owned(),
            ..FormatOptions::default()
        };
        let dev = formatted(&opts, 1024 * 1024);
        let fs = open(&dev);
        let sb = fs.superblock();
        assert!(sb.has_metadata_csum());
        assert_eq!(sb.volume_name(), "scratch");
        assert_eq!(fs.read_dir(InodeNumber::ROOT).expect("root").len(), 3);
        fs.read_block_bitmap(GroupNumber(0)).expect("bitmap csum");
    }

    #[test]
    fn rejects_bad_options_and_tiny_devices() {
        let bad = FormatOptions {
            inline_data: true,
            ..FormatOptions::default()
        };
        let dev: Arc<dyn ByteDevice> = Arc::new(e2_block::MemoryByteDevice::new(1024 * 1024));
        assert!(matches!(format(Arc::clone(&dev), &bad), Err(E2Error::InvalidArgument(_))));

        let odd = FormatOptions {
            block_size: 3000,
            ..FormatOptions::default()
        };
        assert!(matches!(format(Arc::clone(&dev), &odd), Err(E2Error::InvalidArgument(_))));

        let tiny: Arc<dyn ByteDevice> = Arc::new(e2_block::MemoryByteDevice::new(16 * 1024));
        assert!(matches!(format(tiny, &FormatOptions::default()), Err(E2Error::TooSmall)));
    }

    #[test]
    fn short_tail_group_is_dropped() {
        let opts = FormatOptions {
            blocks_per_group: Some(256),
            ..FormatOptions::default()
        };
        // 1 + 3 * 256 blocks leaves a 20-block fourth group.
        let dev = formatted(&opts, (1 + 3 * 256 + 20) * 1024);
        let fs = open(&dev);
        assert_eq!(fs.geometry().group_count, 3);
        assert_eq!(fs.superblock().blocks_count, 1 + 3 * 256);
    }

    #[test]
    fn uuid_is_version_four() {
        let uuid = derive_uuid(42);
        assert_eq!(uuid[6] >> 4, 4);
        assert_eq!(uuid[8] >> 6, 0b10);
        assert_ne!(derive_uuid(42), derive_uuid(43));
    }
}
