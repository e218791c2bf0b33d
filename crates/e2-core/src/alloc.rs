//! Block and inode allocation against the on-disk bitmaps.
//!
//! Searching and committing are separate steps: [`Ext2Fs::new_block`] and
//! [`Ext2Fs::new_inode`] only find a free bit, and the `*_alloc_stats`
//! calls flip it and move the counters. Callers hold the writer lock across
//! both.

use crate::fs::{Ext2Fs, Meta, Mutation};
use e2_alloc::{
    AllocStats, bitmap_clear, bitmap_mark_tail, bitmap_set, find_free_block, find_free_inode,
    group_search_order, reserved_blocks_in_group,
};
use e2_error::{E2Error, Result};
use e2_ondisk::GroupDesc;
use e2_ondisk::csum::bitmap_checksum;
use e2_ondisk::group::{EXT2_BG_BLOCK_UNINIT, EXT2_BG_INODE_UNINIT};
use e2_types::{BlockNumber, GroupNumber, InodeNumber};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitmapKind {
    Block,
    Inode,
}

impl BitmapKind {
    fn name(self) -> &'static str {
        match self {
            Self::Block => "block bitmap",
            Self::Inode => "inode bitmap",
        }
    }
}

/// Counters one `*_alloc_stats` call may move, restored when its bitmap
/// never reaches the channel.
struct CounterSnapshot {
    group: usize,
    desc: GroupDesc,
    free_blocks: u32,
    free_inodes: u32,
}

impl CounterSnapshot {
    fn take(meta: &Meta, group: GroupNumber) -> Option<Self> {
        let idx = group.0 as usize;
        Some(Self {
            group: idx,
            desc: meta.groups.get(idx)?.clone(),
            free_blocks: meta.sb.free_blocks_count,
            free_inodes: meta.sb.free_inodes_count,
        })
    }

    fn restore(self, meta: &mut Meta) {
        meta.groups[self.group] = self.desc;
        meta.sb.free_blocks_count = self.free_blocks;
        meta.sb.free_inodes_count = self.free_inodes;
    }
}

impl Ext2Fs {
    /// Write a bitmap whose counters are already applied. On failure the
    /// counters are restored and `original` is offered to the channel
    /// again, since a failed write-through still leaves the new image
    /// cached.
    fn commit_bitmap(
        &self,
        blk: BlockNumber,
        bitmap: &[u8],
        original: &[u8],
        snapshot: Option<CounterSnapshot>,
    ) -> Result<()> {
        let Err(err) = self.channel.write_block(blk, bitmap) else {
            return Ok(());
        };
        warn!(target: "e2fs::alloc", event = "bitmap_write_failed", block = blk.0, error = %err);
        if let Err(again) = self.channel.write_block(blk, original) {
            debug!(target: "e2fs::alloc", event = "bitmap_restore_deferred", block = blk.0, error = %again);
        }
        if let Some(snapshot) = snapshot {
            snapshot.restore(&mut self.meta.lock());
        }
        Err(err)
    }

    fn group_desc_or_err(&self, group: GroupNumber) -> Result<GroupDesc> {
        self.group_desc(group)
            .ok_or_else(|| E2Error::InvalidArgument(format!("group {} out of range", group.0)))
    }

    fn bitmap_bytes(&self, kind: BitmapKind) -> usize {
        let bits = match kind {
            BitmapKind::Block => self.geo.blocks_per_group,
            BitmapKind::Inode => self.geo.inodes_per_group,
        };
        (bits / 8) as usize
    }

    /// Stored checksums are truncated to 16 bits in 32-byte descriptors.
    fn bitmap_csum_matches(&self, stored: u32, computed: u32) -> bool {
        if self.superblock().group_desc_size() >= 64 {
            stored == computed
        } else {
            stored & 0xFFFF == computed & 0xFFFF
        }
    }

    fn read_bitmap(&self, kind: BitmapKind, group: GroupNumber) -> Result<(BlockNumber, Vec<u8>)> {
        let gd = self.group_desc_or_err(group)?;
        let bs = self.geo.block_size as usize;
        match kind {
            BitmapKind::Block => {
                let blk = BlockNumber(gd.block_bitmap);
                if gd.has_flag(EXT2_BG_BLOCK_UNINIT) {
                    let sb = self.superblock();
                    let gdt_blocks = self.geo.desc_blocks(sb.group_desc_size())
                        + u32::from(sb.reserved_gdt_blocks);
                    let mut bitmap = vec![0_u8; bs];
                    for rel in reserved_blocks_in_group(&self.geo, &gd, group, gdt_blocks) {
                        bitmap_set(&mut bitmap, rel);
                    }
                    bitmap_mark_tail(&mut bitmap, self.geo.blocks_in_group(group));
                    return Ok((blk, bitmap));
                }
                let bitmap = self.channel.read_block(blk)?;
                self.verify_bitmap(kind, &gd, &bitmap, blk)?;
                Ok((blk, bitmap))
            }
            BitmapKind::Inode => {
                let blk = BlockNumber(gd.inode_bitmap);
                if gd.has_flag(EXT2_BG_INODE_UNINIT) {
                    let mut bitmap = vec![0_u8; bs];
                    bitmap_mark_tail(&mut bitmap, self.geo.inodes_per_group);
                    return Ok((blk, bitmap));
                }
                let bitmap = self.channel.read_block(blk)?;
                self.verify_bitmap(kind, &gd, &bitmap, blk)?;
                Ok((blk, bitmap))
            }
        }
    }

    fn verify_bitmap(&self, kind: BitmapKind, gd: &GroupDesc, bitmap: &[u8], blk: BlockNumber) -> Result<()> {
        if !self.verify_checksums() {
            return Ok(());
        }
        let stored = match kind {
            BitmapKind::Block => gd.block_bitmap_csum,
            BitmapKind::Inode => gd.inode_bitmap_csum,
        };
        let computed = bitmap_checksum(self.csum_seed, bitmap, self.bitmap_bytes(kind));
        if self.bitmap_csum_matches(stored, computed) {
            Ok(())
        } else {
            Err(E2Error::ChecksumMismatch {
                what: kind.name(),
                block: blk.0,
            })
        }
    }

    /// Read `group`'s block bitmap, synthesizing it for an uninitialized group.
    pub fn read_block_bitmap(&self, group: GroupNumber) -> Result<Vec<u8>> {
        self.read_bitmap(BitmapKind::Block, group).map(|(_, bitmap)| bitmap)
    }

    /// Read `group`'s inode bitmap, synthesizing it for an uninitialized group.
    pub fn read_inode_bitmap(&self, group: GroupNumber) -> Result<Vec<u8>> {
        self.read_bitmap(BitmapKind::Inode, group).map(|(_, bitmap)| bitmap)
    }

    // ── Blocks ──────────────────────────────────────────────────────────

    /// Find a free block, preferring `goal` and its group. Nothing is marked.
    pub fn new_block(&self, goal: Option<BlockNumber>) -> Result<BlockNumber> {
        let start = goal
            .and_then(|g| self.geo.absolute_to_group_block(g))
            .map_or(GroupNumber(0), |(g, _)| g);
        for group in group_search_order(start, self.geo.group_count) {
            let free = self
                .group_desc(group)
                .map_or(0, |gd| gd.free_blocks_count);
            if free == 0 {
                continue;
            }
            let bitmap = self.read_block_bitmap(group)?;
            if let Some(blk) = find_free_block(&bitmap, &self.geo, group, goal) {
                debug!(target: "e2fs::alloc", event = "new_block", block = blk.0, group = group.0);
                return Ok(blk);
            }
        }
        Err(E2Error::BlockAllocFail)
    }

    /// Mark `blk` in use (`inuse > 0`) or free (`inuse < 0`) and move the
    /// group and superblock counters with it.
    pub(crate) fn block_alloc_stats(&self, _: &Mutation<'_>, blk: BlockNumber, inuse: i32) -> Result<()> {
        let (group, rel) = self
            .geo
            .absolute_to_group_block(blk)
            .ok_or(E2Error::BadBlockNum(blk.0))?;
        let (bitmap_blk, mut bitmap) = self.read_bitmap(BitmapKind::Block, group)?;
        let original = bitmap.clone();
        let was_set = if inuse > 0 {
            bitmap_set(&mut bitmap, rel)
        } else {
            bitmap_clear(&mut bitmap, rel)
        };
        if was_set == (inuse > 0) {
            warn!(
                target: "e2fs::alloc",
                event = "block_bitmap_already",
                block = blk.0,
                in_use = was_set
            );
        }
        let csum = bitmap_checksum(self.csum_seed, &bitmap, self.bitmap_bytes(BitmapKind::Block));
        let snapshot = {
            let mut meta = self.meta.lock();
            let meta = &mut *meta;
            let snapshot = CounterSnapshot::take(meta, group);
            AllocStats::new(&mut meta.sb, &mut meta.groups).apply_block_delta(group, -inuse)?;
            if self.metadata_csum {
                meta.groups[group.0 as usize].block_bitmap_csum = csum;
            }
            meta.sb_dirty = true;
            meta.gd_dirty = true;
            snapshot
        };
        debug!(target: "e2fs::alloc", event = "block_stats", block = blk.0, inuse);
        self.commit_bitmap(bitmap_blk, &bitmap, &original, snapshot)
    }

    /// Find, mark and account a block in one step.
    pub(crate) fn alloc_block(&self, m: &Mutation<'_>, goal: Option<BlockNumber>) -> Result<BlockNumber> {
        let blk = self.new_block(goal)?;
        self.block_alloc_stats(m, blk, 1)?;
        Ok(blk)
    }

    // ── Inodes ──────────────────────────────────────────────────────────

    /// Find a free inode, starting in `dir`'s group. Nothing is marked.
    ///
    /// `mode` is accepted for the directory-spreading policy; this
    /// allocator places every inode near its parent.
    pub fn new_inode(&self, dir: InodeNumber, _mode: u16) -> Result<InodeNumber> {
        let start = self
            .geo
            .inode_location(dir)
            .map_or(GroupNumber(0), |(g, _)| g);
        for group in group_search_order(start, self.geo.group_count) {
            let free = self
                .group_desc(group)
                .map_or(0, |gd| gd.free_inodes_count);
            if free == 0 {
                continue;
            }
            let bitmap = self.read_inode_bitmap(group)?;
            if let Some(ino) = find_free_inode(&bitmap, &self.geo, group) {
                debug!(target: "e2fs::alloc", event = "new_inode", ino = ino.0, group = group.0);
                return Ok(ino);
            }
        }
        Err(E2Error::InodeAllocFail)
    }

    /// Mark `ino` in use (`inuse > 0`) or free (`inuse < 0`); directories
    /// also move the group's used-directory count.
    pub(crate) fn inode_alloc_stats(
        &self,
        _: &Mutation<'_>,
        ino: InodeNumber,
        inuse: i32,
        is_dir: bool,
    ) -> Result<()> {
        let (group, index) = self
            .geo
            .inode_location(ino)
            .ok_or(E2Error::BadInodeNum(ino.0))?;
        let (bitmap_blk, mut bitmap) = self.read_bitmap(BitmapKind::Inode, group)?;
        let original = bitmap.clone();
        let was_set = if inuse > 0 {
            bitmap_set(&mut bitmap, index)
        } else {
            bitmap_clear(&mut bitmap, index)
        };
        if was_set == (inuse > 0) {
            warn!(
                target: "e2fs::alloc",
                event = "inode_bitmap_already",
                ino = ino.0,
                in_use = was_set
            );
        }
        let csum = bitmap_checksum(self.csum_seed, &bitmap, self.bitmap_bytes(BitmapKind::Inode));
        let ipg = self.geo.inodes_per_group;
        let snapshot = {
            let mut meta = self.meta.lock();
            let meta = &mut *meta;
            let snapshot = CounterSnapshot::take(meta, group);
            let track_unused = meta.sb.has_group_desc_csum();
            AllocStats::new(&mut meta.sb, &mut meta.groups)
                .apply_inode_delta(group, -inuse, is_dir)?;
            let gd = &mut meta.groups[group.0 as usize];
            if track_unused && inuse > 0 && ipg.saturating_sub(gd.itable_unused) <= index {
                gd.itable_unused = ipg - index - 1;
            }
            if self.metadata_csum {
                gd.inode_bitmap_csum = csum;
            }
            meta.sb_dirty = true;
            meta.gd_dirty = true;
            snapshot
        };
        debug!(target: "e2fs::alloc", event = "inode_stats", ino = ino.0, inuse, is_dir);
        self.commit_bitmap(bitmap_blk, &bitmap, &original, snapshot)
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{formatted, open, small_fs};
    use crate::{Ext2Fs, FormatOptions, OpenOptions};
    use e2_alloc::bitmap_get;
    use e2_block::{ByteDevice, FaultKind, IoChannelOptions};
    use e2_error::E2Error;
    use e2_types::{BlockNumber, GroupNumber, InodeNumber};
    use std::sync::Arc;

    fn free_totals(fs: &crate::Ext2Fs) -> (u32, u32, u32, u32) {
        let sb = fs.superblock();
        let gds = fs.group_descs();
        (
            sb.free_blocks_count,
            gds.iter().map(|g| g.free_blocks_count).sum(),
            sb.free_inodes_count,
            gds.iter().map(|g| g.free_inodes_count).sum(),
        )
    }

    #[test]
    fn block_allocation_moves_both_counters() {
        let (_dev, fs) = small_fs();
        let before = free_totals(&fs);
        let m = fs.begin_mutation().expect("writer");
        let blk = fs.new_block(None).expect("free block");
        fs.block_alloc_stats(&m, blk, 1).expect("mark");
        let mid = free_totals(&fs);
        assert_eq!(mid.0, before.0 - 1);
        assert_eq!(mid.0, mid.1);
        let (group, rel) = fs.geometry().absolute_to_group_block(blk).expect("group");
        assert!(bitmap_get(&fs.read_block_bitmap(group).expect("bitmap"), rel));

        // The next search must skip the block just taken.
        assert_ne!(fs.new_block(Some(blk)).expect("next"), blk);

        fs.block_alloc_stats(&m, blk, -1).expect("free");
        assert_eq!(free_totals(&fs), before);
    }

    #[test]
    fn goal_is_honoured_when_free() {
        let (_dev, fs) = small_fs();
        let first = fs.new_block(None).expect("free");
        let goal = BlockNumber(first.0 + 50);
        assert_eq!(fs.new_block(Some(goal)).expect("goal"), goal);
    }

    #[test]
    fn exhausting_blocks_reports_alloc_fail() {
        let (_dev, fs) = small_fs();
        let m = fs.begin_mutation().expect("writer");
        let mut taken = 0_u32;
        loop {
            match fs.new_block(None) {
                Ok(blk) => {
                    fs.block_alloc_stats(&m, blk, 1).expect("mark");
                    taken += 1;
                }
                Err(err) => {
                    assert!(matches!(err, E2Error::BlockAllocFail));
                    break;
                }
            }
        }
        assert!(taken > 0);
        assert_eq!(fs.superblock().free_blocks_count, 0);
    }

    #[test]
    fn counter_overflow_applies_nothing() {
        let (_dev, fs) = small_fs();
        let m = fs.begin_mutation().expect("writer");
        let sb = fs.superblock();
        // Push the free counter to its ceiling so one more free overflows.
        {
            let mut meta = fs.meta.lock();
            meta.sb.free_blocks_count = u32::MAX;
        }
        let blk = fs.new_block(None).expect("free");
        let err = fs.block_alloc_stats(&m, blk, -1).expect_err("overflow");
        assert!(matches!(err, E2Error::Corruption { .. }));
        assert_eq!(
            fs.group_desc(GroupNumber(0)).expect("gd").free_blocks_count,
            sb.free_blocks_count
        );
    }

    #[test]
    fn failed_bitmap_write_leaves_counters_and_bitmap_agreeing() {
        let dev = formatted(&FormatOptions::default(), 1024 * 1024);
        let shared: Arc<dyn ByteDevice> = dev.clone();
        let options = OpenOptions {
            channel: IoChannelOptions {
                writethrough: true,
                ..IoChannelOptions::default()
            },
            ..OpenOptions::default()
        };
        let fs = Ext2Fs::open(shared, &options).expect("open");
        let before = free_totals(&fs);
        let bitmap_blk = fs.group_desc(GroupNumber(0)).expect("gd").block_bitmap;
        let at = bitmap_blk * 1024;
        dev.inject_write_fault(at..at + 1024, FaultKind::Fail);

        let blk = {
            let m = fs.begin_mutation().expect("writer");
            let blk = fs.new_block(None).expect("free block");
            let err = fs.block_alloc_stats(&m, blk, 1).expect_err("bitmap write fails");
            assert!(matches!(err, E2Error::Io(_)));
            blk
        };
        assert_eq!(free_totals(&fs), before);
        let (group, rel) = fs.geometry().absolute_to_group_block(blk).expect("group");
        assert!(!bitmap_get(&fs.read_block_bitmap(group).expect("bitmap"), rel));

        dev.clear_faults();
        fs.flush().expect("flush");
        drop(fs);
        let fs = open(&dev);
        assert_eq!(free_totals(&fs), before);
        assert!(!bitmap_get(&fs.read_block_bitmap(group).expect("bitmap"), rel));
    }

    #[test]
    fn inode_allocation_tracks_dirs_and_skips_reserved() {
        let (_dev, fs) = small_fs();
        let m = fs.begin_mutation().expect("writer");
        let ino = fs.new_inode(InodeNumber::ROOT, 0o040_755).expect("inode");
        assert!(ino.0 >= u64::from(fs.geometry().first_ino));
        let dirs = fs.group_desc(GroupNumber(0)).expect("gd").used_dirs_count;
        fs.inode_alloc_stats(&m, ino, 1, true).expect("mark");
        let gd = fs.group_desc(GroupNumber(0)).expect("gd");
        assert_eq!(gd.used_dirs_count, dirs + 1);
        assert_ne!(fs.new_inode(InodeNumber::ROOT, 0o100_644).expect("next"), ino);
        fs.inode_alloc_stats(&m, ino, -1, true).expect("free");
        assert_eq!(fs.group_desc(GroupNumber(0)).expect("gd").used_dirs_count, dirs);
    }

    #[test]
    fn checksummed_bitmaps_stay_verifiable() {
        let opts = FormatOptions {
            inode_size: 256,
            metadata_csum: true,
            ..FormatOptions::default()
        };
        let dev = formatted(&opts, 1024 * 1024);
        let fs = open(&dev);
        {
            let m = fs.begin_mutation().expect("writer");
            let blk = fs.alloc_block(&m, None).expect("alloc");
            assert!(blk.0 > 0);
        }
        fs.flush().expect("flush");
        drop(fs);
        let fs = open(&dev);
        fs.read_block_bitmap(GroupNumber(0)).expect("bitmap verifies");
        fs.read_inode_bitmap(GroupNumber(0)).expect("bitmap verifies");
    }
}
