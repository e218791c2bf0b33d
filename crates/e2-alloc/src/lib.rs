#![forbid(unsafe_code)]
//! Block and inode bitmaps plus free-space accounting.
//!
//! Pure functions over decoded metadata: nothing here touches a device. The
//! engine in `e2-core` reads bitmaps through the channel, calls into this
//! crate, and writes the results back.
//!
//! ## Layers
//!
//! 1. **Bitmap**: bit manipulation on block/inode bitmap bytes.
//! 2. **Geometry**: group arithmetic derived from the superblock.
//! 3. **Accounting**: [`AllocStats`] moves group and superblock counters
//!    together, refusing any change that would underflow or overflow.

use e2_error::{E2Error, Result};
use e2_ondisk::group::{EXT2_BG_BLOCK_UNINIT, EXT2_BG_INODE_UNINIT};
use e2_ondisk::{GroupDesc, RoCompatFeatures, Superblock};
use e2_types::{BlockNumber, GroupNumber, InodeNumber};
use tracing::trace;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice. Bits past the end read as set.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    bitmap
        .get(byte_idx)
        .is_none_or(|byte| (byte >> (idx % 8)) & 1 == 1)
}

/// Set bit `idx`; returns the previous value.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let Some(byte) = bitmap.get_mut(byte_idx) else {
        return true;
    };
    let mask = 1 << (idx % 8);
    let was = *byte & mask != 0;
    *byte |= mask;
    was
}

/// Clear bit `idx`; returns the previous value.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let Some(byte) = bitmap.get_mut(byte_idx) else {
        return false;
    };
    let mask = 1 << (idx % 8);
    let was = *byte & mask != 0;
    *byte &= !mask;
    was
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free: u32 = bitmap
        .iter()
        .take(full_bytes)
        .map(|byte| byte.count_zeros())
        .sum();

    if remainder > 0 {
        if let Some(&byte) = bitmap.get(full_bytes) {
            free += (0..remainder).filter(|bit| (byte >> bit) & 1 == 0).count() as u32;
        }
    }
    free
}

/// First free bit in `0..count`, searching from `start` and wrapping.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    let start = if start >= count { 0 } else { start };
    (start..count)
        .chain(0..start)
        .find(|&idx| !bitmap_get(bitmap, idx))
}

/// Mark the padding bits past `count` as in use, up to the end of the
/// bitmap block. ext2 requires this for the last (short) group.
pub fn bitmap_mark_tail(bitmap: &mut [u8], count: u32) {
    let total = u32::try_from(bitmap.len().saturating_mul(8)).unwrap_or(u32::MAX);
    for idx in count..total {
        bitmap_set(bitmap, idx);
    }
}

// ── Filesystem geometry ─────────────────────────────────────────────────────

/// Group arithmetic needed by the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsGeometry {
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_inodes: u32,
    pub first_data_block: u32,
    pub group_count: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    pub sparse_super: bool,
}

impl FsGeometry {
    /// Derive geometry from a validated superblock.
    pub fn from_superblock(sb: &Superblock) -> Result<Self> {
        let block_size = sb
            .block_size()
            .ok_or_else(|| E2Error::Format("invalid s_log_block_size".to_owned()))?;
        if sb.blocks_per_group == 0 || sb.inodes_per_group == 0 {
            return Err(E2Error::Format("zero blocks or inodes per group".to_owned()));
        }
        Ok(Self {
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            block_size,
            total_blocks: sb.blocks_count,
            total_inodes: sb.inodes_count,
            first_data_block: sb.first_data_block,
            group_count: sb.groups_count(),
            inode_size: sb.inode_size(),
            first_ino: sb.first_ino(),
            sparse_super: sb.has_ro_compat(RoCompatFeatures::SPARSE_SUPER),
        })
    }

    /// First block of `group`.
    #[must_use]
    pub fn group_first_block(&self, group: GroupNumber) -> BlockNumber {
        BlockNumber(
            u64::from(self.first_data_block)
                + u64::from(group.0) * u64::from(self.blocks_per_group),
        )
    }

    /// Number of blocks in a specific group (the last group may be shorter).
    #[must_use]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let start = self.group_first_block(group).0;
        let remaining = u64::from(self.total_blocks).saturating_sub(start);
        u32::try_from(remaining.min(u64::from(self.blocks_per_group))).unwrap_or(0)
    }

    /// Number of inodes in a specific group.
    #[must_use]
    pub fn inodes_in_group(&self, group: GroupNumber) -> u32 {
        let start = u64::from(group.0) * u64::from(self.inodes_per_group);
        let remaining = u64::from(self.total_inodes).saturating_sub(start);
        u32::try_from(remaining.min(u64::from(self.inodes_per_group))).unwrap_or(0)
    }

    /// Absolute block number for a relative block within a group.
    #[must_use]
    pub fn group_block_to_absolute(&self, group: GroupNumber, rel_block: u32) -> BlockNumber {
        BlockNumber(self.group_first_block(group).0 + u64::from(rel_block))
    }

    /// Convert an absolute block to `(group, relative_block)`; `None` when the
    /// block lies outside the data area.
    #[must_use]
    pub fn absolute_to_group_block(&self, block: BlockNumber) -> Option<(GroupNumber, u32)> {
        if block.0 < u64::from(self.first_data_block) || block.0 >= u64::from(self.total_blocks) {
            return None;
        }
        let rel = block.0 - u64::from(self.first_data_block);
        let group = u32::try_from(rel / u64::from(self.blocks_per_group)).ok()?;
        let offset = u32::try_from(rel % u64::from(self.blocks_per_group)).ok()?;
        Some((GroupNumber(group), offset))
    }

    /// Group and index of an inode; `None` for 0 or numbers past the end.
    #[must_use]
    pub fn inode_location(&self, ino: InodeNumber) -> Option<(GroupNumber, u32)> {
        if ino.0 == 0 || ino.0 > u64::from(self.total_inodes) {
            return None;
        }
        let zero_based = ino.0 - 1;
        let group = u32::try_from(zero_based / u64::from(self.inodes_per_group)).ok()?;
        let index = u32::try_from(zero_based % u64::from(self.inodes_per_group)).ok()?;
        Some((GroupNumber(group), index))
    }

    /// Inode number of index `index` in `group`.
    #[must_use]
    pub fn inode_number(&self, group: GroupNumber, index: u32) -> InodeNumber {
        InodeNumber(u64::from(group.0) * u64::from(self.inodes_per_group) + u64::from(index) + 1)
    }

    /// Blocks occupied by each group's inode table.
    #[must_use]
    pub fn inode_table_blocks(&self) -> u32 {
        let per_block = self.block_size / u32::from(self.inode_size.max(1));
        if per_block == 0 {
            return 0;
        }
        self.inodes_per_group.div_ceil(per_block)
    }

    /// Blocks holding the whole group descriptor table.
    #[must_use]
    pub fn desc_blocks(&self, desc_size: u16) -> u32 {
        let per_block = self.block_size / u32::from(desc_size.max(1));
        if per_block == 0 {
            return 0;
        }
        self.group_count.div_ceil(per_block)
    }

    /// Whether `group` carries a superblock backup.
    #[must_use]
    pub fn group_has_superblock(&self, group: GroupNumber) -> bool {
        let g = group.0;
        if g <= 1 || !self.sparse_super {
            return true;
        }
        [3_u32, 5, 7].iter().any(|&base| is_power_of(g, base))
    }
}

fn is_power_of(mut n: u32, base: u32) -> bool {
    while n % base == 0 {
        n /= base;
    }
    n == 1
}

/// Relative offsets within `group` occupied by metadata: superblock and
/// descriptor copies, both bitmaps and the inode table. Sorted, unique.
#[must_use]
pub fn reserved_blocks_in_group(
    geo: &FsGeometry,
    gd: &GroupDesc,
    group: GroupNumber,
    gdt_blocks: u32,
) -> Vec<u32> {
    let start = geo.group_first_block(group).0;
    let len = u64::from(geo.blocks_in_group(group));
    let mut reserved = Vec::new();
    let mut add_abs = |abs: u64| {
        if abs >= start && abs - start < len {
            if let Ok(rel) = u32::try_from(abs - start) {
                reserved.push(rel);
            }
        }
    };

    if geo.group_has_superblock(group) {
        for i in 0..=u64::from(gdt_blocks) {
            add_abs(start + i);
        }
    }
    add_abs(gd.block_bitmap);
    add_abs(gd.inode_bitmap);
    for i in 0..u64::from(geo.inode_table_blocks()) {
        add_abs(gd.inode_table + i);
    }

    reserved.sort_unstable();
    reserved.dedup();
    reserved
}

// ── Search ──────────────────────────────────────────────────────────────────

/// Groups in search order: `start` first, then the rest with wrap-around.
pub fn group_search_order(start: GroupNumber, group_count: u32) -> impl Iterator<Item = GroupNumber> {
    let start = if start.0 < group_count { start.0 } else { 0 };
    (start..group_count).chain(0..start).map(GroupNumber)
}

/// Free block in `group`'s bitmap, searching from `goal` when it falls in
/// the group. Returns the absolute block number.
#[must_use]
pub fn find_free_block(
    bitmap: &[u8],
    geo: &FsGeometry,
    group: GroupNumber,
    goal: Option<BlockNumber>,
) -> Option<BlockNumber> {
    let count = geo.blocks_in_group(group);
    let start = goal
        .and_then(|goal| geo.absolute_to_group_block(goal))
        .filter(|(g, _)| *g == group)
        .map_or(0, |(_, rel)| rel);
    bitmap_find_free(bitmap, count, start).map(|rel| geo.group_block_to_absolute(group, rel))
}

/// Free inode in `group`'s bitmap, never handing out the reserved inodes
/// below `first_ino`.
#[must_use]
pub fn find_free_inode(bitmap: &[u8], geo: &FsGeometry, group: GroupNumber) -> Option<InodeNumber> {
    let count = geo.inodes_in_group(group);
    let base = u64::from(group.0) * u64::from(geo.inodes_per_group);
    let reserved = u64::from(geo.first_ino.saturating_sub(1)).saturating_sub(base);
    let first = u32::try_from(reserved).map_or(count, |r| r.min(count));
    (first..count)
        .find(|&idx| !bitmap_get(bitmap, idx))
        .map(|idx| geo.inode_number(group, idx))
}

// ── Accounting ──────────────────────────────────────────────────────────────

/// Paired updates of group-descriptor and superblock counters.
///
/// Every method checks the whole change before touching anything, so a
/// refused update leaves both sides as they were.
#[derive(Debug)]
pub struct AllocStats<'a> {
    sb: &'a mut Superblock,
    groups: &'a mut [GroupDesc],
}

fn apply_delta(value: u32, delta: i32) -> Option<u32> {
    if delta >= 0 {
        value.checked_add(delta.unsigned_abs())
    } else {
        value.checked_sub(delta.unsigned_abs())
    }
}

impl<'a> AllocStats<'a> {
    pub fn new(sb: &'a mut Superblock, groups: &'a mut [GroupDesc]) -> Self {
        Self { sb, groups }
    }

    fn group_index(&self, group: GroupNumber) -> Result<usize> {
        let idx = group.0 as usize;
        if idx >= self.groups.len() {
            return Err(E2Error::InvalidArgument(format!("group {} out of range", group.0)));
        }
        Ok(idx)
    }

    fn underflow(group: GroupNumber, what: &str) -> E2Error {
        E2Error::Corruption {
            block: 0,
            detail: format!("{what} count out of range in group {}", group.0),
        }
    }

    /// Blocks allocated (`delta < 0`) or freed (`delta > 0`) in `group`.
    pub fn apply_block_delta(&mut self, group: GroupNumber, delta: i32) -> Result<()> {
        let idx = self.group_index(group)?;
        let gd_free = apply_delta(self.groups[idx].free_blocks_count, delta)
            .ok_or_else(|| Self::underflow(group, "group free block"))?;
        let sb_free = apply_delta(self.sb.free_blocks_count, delta)
            .ok_or_else(|| Self::underflow(group, "superblock free block"))?;

        let gd = &mut self.groups[idx];
        gd.free_blocks_count = gd_free;
        gd.flags &= !EXT2_BG_BLOCK_UNINIT;
        self.sb.free_blocks_count = sb_free;
        trace!(target: "e2fs::alloc", event = "block_delta", group = group.0, delta, free = sb_free);
        Ok(())
    }

    /// Inodes allocated (`delta < 0`) or freed (`delta > 0`) in `group`;
    /// directories also move `used_dirs` the other way.
    pub fn apply_inode_delta(&mut self, group: GroupNumber, delta: i32, is_dir: bool) -> Result<()> {
        let idx = self.group_index(group)?;
        let gd_free = apply_delta(self.groups[idx].free_inodes_count, delta)
            .ok_or_else(|| Self::underflow(group, "group free inode"))?;
        let sb_free = apply_delta(self.sb.free_inodes_count, delta)
            .ok_or_else(|| Self::underflow(group, "superblock free inode"))?;
        let dirs = if is_dir {
            delta
                .checked_neg()
                .and_then(|d| apply_delta(self.groups[idx].used_dirs_count, d))
                .ok_or_else(|| Self::underflow(group, "used directory"))?
        } else {
            self.groups[idx].used_dirs_count
        };

        let gd = &mut self.groups[idx];
        gd.free_inodes_count = gd_free;
        gd.used_dirs_count = dirs;
        gd.flags &= !EXT2_BG_INODE_UNINIT;
        self.sb.free_inodes_count = sb_free;
        trace!(target: "e2fs::alloc", event = "inode_delta", group = group.0, delta, is_dir, free = sb_free);
        Ok(())
    }

    /// Recount free totals from the group descriptors into the superblock.
    pub fn resync_superblock(&mut self) {
        self.sb.free_blocks_count = self.groups.iter().map(|gd| gd.free_blocks_count).sum();
        self.sb.free_inodes_count = self.groups.iter().map(|gd| gd.free_inodes_count).sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn geometry() -> FsGeometry {
        FsGeometry {
            blocks_per_group: 8192,
            inodes_per_group: 2048,
            block_size: 1024,
            total_blocks: 20_000,
            total_inodes: 6144,
            first_data_block: 1,
            group_count: 3,
            inode_size: 128,
            first_ino: 11,
            sparse_super: true,
        }
    }

    fn filesystem(groups: u32) -> (Superblock, Vec<GroupDesc>) {
        let mut sb = Superblock::zeroed();
        let mut gds = Vec::new();
        for _ in 0..groups {
            let mut gd = GroupDesc::zeroed(32);
            gd.free_blocks_count = 100;
            gd.free_inodes_count = 50;
            gds.push(gd);
        }
        sb.free_blocks_count = 100 * groups;
        sb.free_inodes_count = 50 * groups;
        (sb, gds)
    }

    #[test]
    fn bitmap_bits_round_trip() {
        let mut bm = [0_u8; 4];
        assert!(!bitmap_set(&mut bm, 9));
        assert!(bitmap_set(&mut bm, 9));
        assert!(bitmap_get(&bm, 9));
        assert_eq!(bm[1], 0b0000_0010);
        assert!(bitmap_clear(&mut bm, 9));
        assert!(!bitmap_get(&bm, 9));
        assert!(bitmap_get(&bm, 40), "past the end reads as used");
    }

    #[test]
    fn count_free_honors_partial_bytes() {
        let bm = [0xFF, 0b0000_0101];
        assert_eq!(bitmap_count_free(&bm, 8), 0);
        assert_eq!(bitmap_count_free(&bm, 11), 1);
        assert_eq!(bitmap_count_free(&bm, 16), 6);
    }

    #[test]
    fn find_free_wraps_around() {
        let mut bm = [0xFF_u8; 2];
        bitmap_clear(&mut bm, 2);
        assert_eq!(bitmap_find_free(&bm, 16, 5), Some(2));
        assert_eq!(bitmap_find_free(&bm, 16, 99), Some(2));
        bitmap_set(&mut bm, 2);
        assert_eq!(bitmap_find_free(&bm, 16, 0), None);
    }

    #[test]
    fn tail_padding_is_marked_used() {
        let mut bm = [0_u8; 2];
        bitmap_mark_tail(&mut bm, 10);
        assert_eq!(bm, [0x00, 0b1111_1100]);
    }

    #[test]
    fn geometry_maps_blocks_and_inodes() {
        let geo = geometry();
        assert_eq!(geo.blocks_in_group(GroupNumber(2)), 20_000 - 1 - 2 * 8192);
        assert_eq!(
            geo.absolute_to_group_block(BlockNumber(8193)),
            Some((GroupNumber(1), 0))
        );
        assert_eq!(geo.absolute_to_group_block(BlockNumber(0)), None);
        assert_eq!(geo.absolute_to_group_block(BlockNumber(20_000)), None);
        assert_eq!(geo.inode_location(InodeNumber(2049)), Some((GroupNumber(1), 0)));
        assert_eq!(geo.inode_location(InodeNumber(0)), None);
        assert_eq!(geo.inode_number(GroupNumber(1), 0), InodeNumber(2049));
        assert_eq!(geo.inode_table_blocks(), 256);
    }

    #[test]
    fn sparse_super_backups() {
        let mut geo = geometry();
        geo.group_count = 50;
        let with: Vec<u32> = (0..50)
            .filter(|&g| geo.group_has_superblock(GroupNumber(g)))
            .collect();
        assert_eq!(with, vec![0, 1, 3, 5, 7, 9, 25, 27, 49]);
        geo.sparse_super = false;
        assert!(geo.group_has_superblock(GroupNumber(2)));
    }

    #[test]
    fn reserved_blocks_cover_metadata() {
        let geo = geometry();
        let mut gd = GroupDesc::zeroed(32);
        gd.block_bitmap = 3;
        gd.inode_bitmap = 4;
        gd.inode_table = 5;
        let reserved = reserved_blocks_in_group(&geo, &gd, GroupNumber(0), 1);
        assert_eq!(reserved.first(), Some(&0));
        assert_eq!(reserved.len(), 2 + 2 + 256);
        assert_eq!(reserved.last(), Some(&(5 + 255 - 1)));
    }

    #[test]
    fn free_block_search_starts_at_goal() {
        let geo = geometry();
        let mut bm = vec![0_u8; 1024];
        for i in 0..100 {
            bitmap_set(&mut bm, i);
        }
        assert_eq!(
            find_free_block(&bm, &geo, GroupNumber(0), None),
            Some(BlockNumber(101))
        );
        assert_eq!(
            find_free_block(&bm, &geo, GroupNumber(0), Some(BlockNumber(500))),
            Some(BlockNumber(500))
        );
        assert_eq!(
            find_free_block(&bm, &geo, GroupNumber(1), Some(BlockNumber(500))),
            Some(BlockNumber(8193 + 100))
        );
    }

    #[test]
    fn free_inode_skips_reserved_range() {
        let geo = geometry();
        let bm = vec![0_u8; 256];
        assert_eq!(find_free_inode(&bm, &geo, GroupNumber(0)), Some(InodeNumber(11)));
        assert_eq!(find_free_inode(&bm, &geo, GroupNumber(1)), Some(InodeNumber(2049)));
    }

    #[test]
    fn block_delta_moves_both_counters() {
        let (mut sb, mut gds) = filesystem(2);
        let mut stats = AllocStats::new(&mut sb, &mut gds);
        stats.apply_block_delta(GroupNumber(1), -3).expect("alloc");
        stats.apply_block_delta(GroupNumber(1), 1).expect("free");
        assert_eq!(gds[1].free_blocks_count, 98);
        assert_eq!(sb.free_blocks_count, 198);
    }

    #[test]
    fn underflow_changes_nothing() {
        let (mut sb, mut gds) = filesystem(2);
        sb.free_blocks_count = 2;
        let mut stats = AllocStats::new(&mut sb, &mut gds);
        assert!(matches!(
            stats.apply_block_delta(GroupNumber(0), -5),
            Err(E2Error::Corruption { .. })
        ));
        assert_eq!(gds[0].free_blocks_count, 100);
        assert_eq!(sb.free_blocks_count, 2);
    }

    #[test]
    fn directory_inodes_move_used_dirs() {
        let (mut sb, mut gds) = filesystem(1);
        let mut stats = AllocStats::new(&mut sb, &mut gds);
        stats.apply_inode_delta(GroupNumber(0), -1, true).expect("mkdir");
        stats.apply_inode_delta(GroupNumber(0), -1, false).expect("create");
        assert!(stats.apply_inode_delta(GroupNumber(0), 1, true).is_ok());
        assert!(matches!(
            stats.apply_inode_delta(GroupNumber(0), 1, true),
            Err(E2Error::Corruption { .. })
        ));
        assert!(stats.apply_inode_delta(GroupNumber(4), -1, false).is_err());
        assert_eq!(gds[0].used_dirs_count, 0);
        assert_eq!(gds[0].free_inodes_count, 49);
        assert_eq!(sb.free_inodes_count, 49);
    }

    proptest! {
        #[test]
        fn group_sums_track_superblock(deltas in proptest::collection::vec((0_u32..3, -4_i32..=4), 0..64)) {
            let (mut sb, mut gds) = filesystem(3);
            let mut stats = AllocStats::new(&mut sb, &mut gds);
            for (group, delta) in deltas {
                let _ = stats.apply_block_delta(GroupNumber(group), delta);
            }
            let sum: u32 = gds.iter().map(|gd| gd.free_blocks_count).sum();
            prop_assert_eq!(sum, sb.free_blocks_count);
        }
    }
}
