//! The engine handle: open, superblock and descriptor I/O, inode I/O, flush.

use crate::ParseResultExt;
use e2_alloc::FsGeometry;
use e2_block::{ByteDevice, IoChannel, IoChannelOptions};
use e2_dir::DirLayout;
use e2_error::{E2Error, Result};
use e2_ondisk::csum::{
    csum_seed, set_group_desc_checksum, set_inode_checksum, set_superblock_checksum,
    verify_group_desc_checksum, verify_inode_checksum, verify_superblock_checksum,
};
use e2_ondisk::{
    CompatFeatures, GroupDesc, IncompatFeatures, Inode, RoCompatFeatures, Superblock,
};
use e2_types::{
    BlockNumber, ByteOrder, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE, GroupNumber,
    InodeNumber,
};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Options controlling how a volume is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Refuse every metadata change.
    pub read_only: bool,
    /// Skip geometry and checksum verification. For recovery and
    /// diagnostics only.
    pub skip_validation: bool,
    /// Cache and transfer options for the block channel.
    pub channel: IoChannelOptions,
}

/// Mutable filesystem-wide metadata.
#[derive(Debug)]
pub(crate) struct Meta {
    pub(crate) sb: Superblock,
    pub(crate) groups: Vec<GroupDesc>,
    pub(crate) sb_dirty: bool,
    pub(crate) gd_dirty: bool,
}

/// Proof that the caller holds the writer lock.
pub(crate) struct Mutation<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Feature bits the engine branches on, fixed at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Features {
    pub(crate) filetype: bool,
    pub(crate) extents: bool,
    pub(crate) inline_data: bool,
    pub(crate) ext_attr: bool,
}

/// An open ext2 volume.
pub struct Ext2Fs {
    pub(crate) channel: IoChannel,
    pub(crate) meta: Mutex<Meta>,
    writer: Mutex<()>,
    pub(crate) geo: FsGeometry,
    pub(crate) csum_seed: u32,
    pub(crate) metadata_csum: bool,
    pub(crate) features: Features,
    verify: bool,
    read_only: bool,
}

impl std::fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext2Fs")
            .field("geometry", &self.geo)
            .field("read_only", &self.read_only)
            .field("metadata_csum", &self.metadata_csum)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

pub(crate) fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

fn checksum_mismatch(what: &'static str, block: BlockNumber) -> E2Error {
    E2Error::ChecksumMismatch {
        what,
        block: block.0,
    }
}

impl Ext2Fs {
    // ── Open / close ────────────────────────────────────────────────────

    /// Open the volume on `device`.
    ///
    /// The superblock is read through the channel at a 1 KiB block size,
    /// checked, and then the channel switches to the filesystem block size
    /// and the descriptor table is loaded. Unknown incompatible features
    /// refuse the open; unknown read-only-compatible features force a
    /// read-only open.
    pub fn open(device: Arc<dyn ByteDevice>, options: &OpenOptions) -> Result<Self> {
        let device_read_only = device.is_read_only();
        let channel = IoChannel::open(device, options.channel);
        let sb_size = u32::try_from(EXT2_SUPERBLOCK_SIZE).unwrap_or(1024);
        channel.set_block_size(sb_size)?;
        let sb_block = BlockNumber((EXT2_SUPERBLOCK_OFFSET / EXT2_SUPERBLOCK_SIZE) as u64);
        let region = channel.read_block(sb_block)?;
        let sb = Superblock::decode(&region, ByteOrder::Little).or_corrupt(sb_block)?;

        let unknown = sb.feature_incompat.unsupported_bits();
        if unknown != 0 {
            return Err(E2Error::UnsupportedFeature(format!(
                "incompatible features {:#x} ({})",
                unknown,
                IncompatFeatures(unknown)
            )));
        }
        let ro_unknown = sb.feature_ro_compat.unsupported_bits();
        if ro_unknown != 0 && !options.read_only {
            warn!(
                target: "e2fs::mount",
                event = "ro_compat_forces_read_only",
                features = %RoCompatFeatures(ro_unknown)
            );
        }
        if sb.has_incompat(IncompatFeatures::RECOVER) {
            warn!(target: "e2fs::mount", event = "journal_needs_recovery");
        }

        let verify = !options.skip_validation;
        if verify {
            sb.validate_geometry().or_corrupt(sb_block)?;
            if sb.has_metadata_csum() && verify_superblock_checksum(&region).is_err() {
                return Err(checksum_mismatch("superblock", sb_block));
            }
        }

        let geo = FsGeometry::from_superblock(&sb)?;
        channel.set_block_size(geo.block_size)?;

        let groups = load_group_descs(&channel, &sb, &geo, verify)?;
        let read_only = options.read_only || ro_unknown != 0 || device_read_only;
        let features = Features {
            filetype: sb.has_filetype(),
            extents: sb.has_incompat(IncompatFeatures::EXTENTS),
            inline_data: sb.has_incompat(IncompatFeatures::INLINE_DATA),
            ext_attr: sb.has_compat(CompatFeatures::EXT_ATTR),
        };

        info!(
            target: "e2fs::mount",
            event = "open",
            block_size = geo.block_size,
            groups = geo.group_count,
            inodes = geo.total_inodes,
            read_only,
            volume = %sb.volume_name()
        );

        Ok(Self {
            channel,
            csum_seed: csum_seed(&sb),
            metadata_csum: sb.has_metadata_csum(),
            meta: Mutex::new(Meta {
                sb,
                groups,
                sb_dirty: false,
                gd_dirty: false,
            }),
            writer: Mutex::new(()),
            geo,
            features,
            verify,
            read_only,
        })
    }

    /// Write back dirty metadata and flush the channel.
    pub fn flush(&self) -> Result<()> {
        if !self.read_only {
            let (sb, groups, gd_dirty) = {
                let mut meta = self.meta.lock();
                if !meta.sb_dirty && !meta.gd_dirty {
                    drop(meta);
                    return self.channel.flush();
                }
                meta.sb.wtime = now_secs();
                let snapshot = (meta.sb.clone(), meta.groups.clone(), meta.gd_dirty);
                meta.sb_dirty = false;
                meta.gd_dirty = false;
                snapshot
            };
            let written = self.write_metadata(&sb, &groups, gd_dirty);
            if written.is_err() {
                let mut meta = self.meta.lock();
                meta.sb_dirty = true;
                meta.gd_dirty |= gd_dirty;
            }
            written?;
        }
        self.channel.flush()
    }

    /// Flush and release the volume.
    pub fn close(self) -> Result<()> {
        self.flush()?;
        info!(target: "e2fs::mount", event = "close");
        self.channel.close()
    }

    fn write_metadata(&self, sb: &Superblock, groups: &[GroupDesc], gd_dirty: bool) -> Result<()> {
        if gd_dirty {
            self.write_group_descs(sb, groups)?;
        }
        self.write_superblock_image(sb)
    }

    /// Write the in-memory superblock to disk now, bypassing the dirty flags.
    pub(crate) fn write_superblock(&self) -> Result<()> {
        let sb = self.meta.lock().sb.clone();
        self.write_superblock_image(&sb)?;
        self.channel.flush()
    }

    fn write_superblock_image(&self, sb: &Superblock) -> Result<()> {
        let bs = self.geo.block_size as usize;
        let block = BlockNumber((EXT2_SUPERBLOCK_OFFSET / bs) as u64);
        let within = EXT2_SUPERBLOCK_OFFSET % bs;
        let mut region = sb.encode(ByteOrder::Little).or_corrupt(block)?;
        if self.metadata_csum {
            set_superblock_checksum(&mut region).or_corrupt(block)?;
        }
        let mut buf = self.channel.read_block(block)?;
        buf[within..within + EXT2_SUPERBLOCK_SIZE].copy_from_slice(&region);
        debug!(target: "e2fs::meta", event = "superblock_write", block = block.0);
        self.channel.write_block(block, &buf)
    }

    fn write_group_descs(&self, sb: &Superblock, groups: &[GroupDesc]) -> Result<()> {
        let bs = self.geo.block_size as usize;
        let ds = usize::from(sb.group_desc_size());
        let per_block = (bs / ds).max(1);
        let first = sb.group_desc_table_block();
        for (chunk_idx, chunk) in groups.chunks(per_block).enumerate() {
            let blk = BlockNumber(first + chunk_idx as u64);
            let mut buf = self.channel.read_block(blk)?;
            for (i, gd) in chunk.iter().enumerate() {
                let group = u32::try_from(chunk_idx * per_block + i)
                    .map_err(|_| E2Error::Format("group count overflow".to_owned()))?;
                let mut raw = gd.encode(ByteOrder::Little).or_corrupt(blk)?;
                set_group_desc_checksum(sb, group, &mut raw).or_corrupt(blk)?;
                buf[i * ds..(i + 1) * ds].copy_from_slice(&raw[..ds]);
            }
            self.channel.write_block(blk, &buf)?;
        }
        debug!(target: "e2fs::meta", event = "gdt_write", groups = groups.len());
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.geo.block_size
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn channel(&self) -> &IoChannel {
        &self.channel
    }

    /// Snapshot of the in-memory superblock.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.meta.lock().sb.clone()
    }

    /// Snapshot of one group descriptor.
    #[must_use]
    pub fn group_desc(&self, group: GroupNumber) -> Option<GroupDesc> {
        self.meta.lock().groups.get(group.0 as usize).cloned()
    }

    /// Snapshot of every group descriptor.
    #[must_use]
    pub fn group_descs(&self) -> Vec<GroupDesc> {
        self.meta.lock().groups.clone()
    }

    /// Directory block layout for this volume.
    #[must_use]
    pub fn dir_layout(&self) -> DirLayout {
        DirLayout {
            block_size: self.geo.block_size,
            filetype: self.features.filetype,
            csum_tail: self.metadata_csum,
        }
    }

    /// 512-byte sectors per filesystem block, the unit of `i_blocks`.
    pub(crate) fn sectors_per_block(&self) -> u64 {
        u64::from(self.geo.block_size / 512)
    }

    pub(crate) fn verify_checksums(&self) -> bool {
        self.verify && self.metadata_csum
    }

    /// Take the writer lock; fails on a read-only volume.
    pub(crate) fn begin_mutation(&self) -> Result<Mutation<'_>> {
        if self.read_only {
            return Err(E2Error::ReadOnly);
        }
        Ok(Mutation {
            _guard: self.writer.lock(),
        })
    }

    pub(crate) fn mark_dirty(&self) {
        let mut meta = self.meta.lock();
        meta.sb_dirty = true;
        meta.gd_dirty = true;
    }

    // ── Inode I/O ───────────────────────────────────────────────────────

    fn locate_inode(&self, ino: InodeNumber) -> Result<(BlockNumber, usize)> {
        let (group, index) = self
            .geo
            .inode_location(ino)
            .ok_or(E2Error::BadInodeNum(ino.0))?;
        let table = self
            .meta
            .lock()
            .groups
            .get(group.0 as usize)
            .map(|gd| gd.inode_table)
            .ok_or(E2Error::BadInodeNum(ino.0))?;
        let bs = u64::from(self.geo.block_size);
        let byte = u64::from(index) * u64::from(self.geo.inode_size);
        let within = usize::try_from(byte % bs).map_err(|_| E2Error::BadInodeNum(ino.0))?;
        Ok((BlockNumber(table + byte / bs), within))
    }

    pub(crate) fn ino32(ino: InodeNumber) -> Result<u32> {
        u32::try_from(ino.0).map_err(|_| E2Error::BadInodeNum(ino.0))
    }

    /// Read inode `ino` from its inode-table block.
    pub fn read_inode(&self, ino: InodeNumber) -> Result<Inode> {
        let (block, within) = self.locate_inode(ino)?;
        let isz = usize::from(self.geo.inode_size);
        let buf = self.channel.read_block(block)?;
        let raw = buf.get(within..within + isz).ok_or_else(|| E2Error::Corruption {
            block: block.0,
            detail: "inode record past end of block".to_owned(),
        })?;
        if self.verify_checksums()
            && raw.iter().any(|&b| b != 0)
            && verify_inode_checksum(raw, self.csum_seed, Self::ino32(ino)?).is_err()
        {
            return Err(checksum_mismatch("inode", block));
        }
        Inode::decode(raw, ByteOrder::Little).or_corrupt(block)
    }

    /// Write inode `ino`, preserving every byte of the on-disk record the
    /// model does not name.
    pub fn write_inode(&self, ino: InodeNumber, inode: &Inode) -> Result<()> {
        let m = self.begin_mutation()?;
        self.write_inode_in(&m, ino, inode)
    }

    pub(crate) fn write_inode_in(&self, _: &Mutation<'_>, ino: InodeNumber, inode: &Inode) -> Result<()> {
        let (block, within) = self.locate_inode(ino)?;
        let isz = usize::from(self.geo.inode_size);
        let mut raw = inode.encode(ByteOrder::Little).or_corrupt(block)?;
        if raw.len() != isz {
            return Err(E2Error::InvalidArgument(format!(
                "inode record is {} bytes, volume uses {isz}",
                raw.len()
            )));
        }
        if self.metadata_csum {
            set_inode_checksum(&mut raw, self.csum_seed, Self::ino32(ino)?).or_corrupt(block)?;
        }
        let mut buf = self.channel.read_block(block)?;
        buf[within..within + isz].copy_from_slice(&raw);
        debug!(target: "e2fs::inode", event = "write", ino = ino.0, block = block.0);
        self.channel.write_block(block, &buf)
    }

    /// A zeroed inode record sized for this volume.
    #[must_use]
    pub fn new_inode_record(&self) -> Inode {
        let extra = if self.geo.inode_size > 128 {
            self.meta.lock().sb.want_extra_isize.max(32)
        } else {
            0
        };
        Inode::zeroed(self.geo.inode_size, extra)
    }
}

fn load_group_descs(
    channel: &IoChannel,
    sb: &Superblock,
    geo: &FsGeometry,
    verify: bool,
) -> Result<Vec<GroupDesc>> {
    let ds = sb.group_desc_size();
    let per_block = (geo.block_size / u32::from(ds)).max(1);
    let first = sb.group_desc_table_block();
    let mut groups = Vec::with_capacity(geo.group_count as usize);
    let mut buf = Vec::new();
    for group in 0..geo.group_count {
        let blk = BlockNumber(first + u64::from(group / per_block));
        if group % per_block == 0 {
            buf = channel.read_block(blk)?;
        }
        let start = (group % per_block) as usize * usize::from(ds);
        let raw = buf.get(start..start + usize::from(ds)).ok_or_else(|| E2Error::Corruption {
            block: blk.0,
            detail: "group descriptor past end of block".to_owned(),
        })?;
        if verify && sb.has_group_desc_csum() && verify_group_desc_checksum(sb, group, raw).is_err() {
            return Err(checksum_mismatch("group descriptor", blk));
        }
        groups.push(GroupDesc::decode(raw, ds, ByteOrder::Little).or_corrupt(blk)?);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{formatted, open, small_fs};
    use crate::FormatOptions;
    use e2_block::MemoryByteDevice;
    use e2_types::S_IFDIR;

    #[test]
    fn open_reads_superblock_and_descriptors() {
        let (_dev, fs) = small_fs();
        let sb = fs.superblock();
        assert_eq!(fs.block_size(), 1024);
        assert_eq!(sb.blocks_count, 1024);
        assert_eq!(fs.group_descs().len(), 1);
        let total_free: u32 = fs.group_descs().iter().map(|g| g.free_blocks_count).sum();
        assert_eq!(total_free, sb.free_blocks_count);
        let root = fs.read_inode(InodeNumber::ROOT).expect("root");
        assert_eq!(root.mode & 0o170_000, S_IFDIR);
    }

    #[test]
    fn garbage_device_is_corruption() {
        let dev: Arc<dyn ByteDevice> = Arc::new(MemoryByteDevice::new(64 * 1024));
        let err = Ext2Fs::open(dev, &OpenOptions::default()).expect_err("no magic");
        assert!(matches!(err, E2Error::Corruption { block: 1, .. }));
    }

    fn patch_superblock(dev: &MemoryByteDevice, f: impl FnOnce(&mut Superblock)) {
        let image = dev.snapshot();
        let mut sb = Superblock::decode_from_image(&image).expect("sb");
        f(&mut sb);
        let region = sb.encode(ByteOrder::Little).expect("encode");
        let mut buf = region.clone();
        if sb.has_metadata_csum() {
            set_superblock_checksum(&mut buf).expect("csum");
        }
        dev.write_at(1024, &buf).expect("write");
    }

    #[test]
    fn unknown_incompat_feature_refuses_open() {
        let dev = formatted(&FormatOptions::default(), 512 * 1024);
        patch_superblock(&dev, |sb| sb.feature_incompat.0 |= 0x0001);
        let shared: Arc<dyn ByteDevice> = dev.clone();
        let err = Ext2Fs::open(shared, &OpenOptions::default()).expect_err("compression");
        assert!(matches!(err, E2Error::UnsupportedFeature(_)));
    }

    #[test]
    fn unknown_ro_compat_feature_forces_read_only() {
        let dev = formatted(&FormatOptions::default(), 512 * 1024);
        patch_superblock(&dev, |sb| sb.feature_ro_compat.0 |= 0x0200);
        let fs = open(&dev);
        assert!(fs.is_read_only());
        let root = fs.read_inode(InodeNumber::ROOT).expect("root");
        assert!(matches!(
            fs.write_inode(InodeNumber::ROOT, &root),
            Err(E2Error::ReadOnly)
        ));
    }

    #[test]
    fn write_inode_preserves_unmodeled_extra_bytes() {
        let opts = FormatOptions {
            inode_size: 256,
            ..FormatOptions::default()
        };
        let dev = formatted(&opts, 1024 * 1024);
        let fs = open(&dev);
        let (block, within) = fs.locate_inode(InodeNumber(5)).expect("locate");
        let offset = block.0 * 1024 + within as u64 + 0xC0;
        dev.write_at(offset, &[0xAB; 16]).expect("poke");

        // Reopen so the poke is not shadowed by the cache.
        drop(fs);
        let fs = open(&dev);
        let mut inode = fs.read_inode(InodeNumber(5)).expect("read");
        inode.mode = 0o100_644;
        inode.size = 42;
        fs.write_inode(InodeNumber(5), &inode).expect("write");
        fs.flush().expect("flush");

        let mut tail = [0_u8; 16];
        dev.read_at(offset, &mut tail).expect("read back");
        assert_eq!(tail, [0xAB; 16]);
        assert_eq!(fs.read_inode(InodeNumber(5)).expect("again").size, 42);
    }

    #[test]
    fn bad_inode_numbers_are_rejected() {
        let (_dev, fs) = small_fs();
        assert!(matches!(fs.read_inode(InodeNumber(0)), Err(E2Error::BadInodeNum(0))));
        let past = u64::from(fs.geometry().total_inodes) + 1;
        assert!(matches!(fs.read_inode(InodeNumber(past)), Err(E2Error::BadInodeNum(_))));
    }

    #[test]
    fn metadata_checksums_are_verified() {
        let opts = FormatOptions {
            inode_size: 256,
            metadata_csum: true,
            ..FormatOptions::default()
        };
        let dev = formatted(&opts, 1024 * 1024);
        let fs = open(&dev);
        fs.read_inode(InodeNumber::ROOT).expect("root verifies");
        let (block, within) = fs.locate_inode(InodeNumber::ROOT).expect("locate");
        drop(fs);

        // Flip a byte in the root inode's mtime.
        let offset = block.0 * 1024 + within as u64 + 0x10;
        let mut byte = [0_u8; 1];
        dev.read_at(offset, &mut byte).expect("read");
        byte[0] ^= 0xFF;
        dev.write_at(offset, &byte).expect("write");

        let fs = open(&dev);
        assert!(matches!(
            fs.read_inode(InodeNumber::ROOT),
            Err(E2Error::ChecksumMismatch { what: "inode", .. })
        ));

        let shared: Arc<dyn ByteDevice> = dev.clone();
        let lenient = Ext2Fs::open(
            shared,
            &OpenOptions {
                skip_validation: true,
                ..OpenOptions::default()
            },
        )
        .expect("open");
        lenient.read_inode(InodeNumber::ROOT).expect("unverified read");
    }

    #[test]
    fn flush_persists_dirty_counters() {
        let (dev, fs) = small_fs();
        {
            let mut meta = fs.meta.lock();
            meta.sb.mnt_count = 7;
            meta.groups[0].used_dirs_count = 9;
            meta.sb_dirty = true;
            meta.gd_dirty = true;
        }
        fs.flush().expect("flush");
        drop(fs);
        let fs = open(&dev);
        assert_eq!(fs.superblock().mnt_count, 7);
        assert_eq!(fs.group_desc(GroupNumber(0)).expect("gd").used_dirs_count, 9);
    }
}
