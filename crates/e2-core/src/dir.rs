//! Directory iteration, lookup and editing, for block and inline directories.

use crate::ParseResultExt;
use crate::fs::{Ext2Fs, Mutation, now_secs};
use e2_dir::{DirLayout, add_entry, init_dir_block, init_empty_block, remove_entry};
use e2_error::{E2Error, Result};
use e2_ondisk::csum::{set_dir_block_checksum, verify_dir_block_checksum};
use e2_ondisk::{DirBlockIter, DirEntry, FileType, Inode, has_dir_tail};
use e2_types::{
    BlockNumber, EXT4_EXTENTS_FL, EXT4_INLINE_DATA_DOTDOT_SIZE, EXT4_INLINE_DATA_FL,
    EXT4_MIN_INLINE_DATA_SIZE, InodeNumber, S_IFDIR,
};
use tracing::debug;

/// What a directory-iteration callback wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirIterAction {
    Continue,
    Abort,
}

/// Bytes of `i_block` that hold records in an inline directory.
const INLINE_BODY: usize = EXT4_MIN_INLINE_DATA_SIZE - EXT4_INLINE_DATA_DOTDOT_SIZE;

fn dot_entry(name: &[u8], ino: u64) -> DirEntry {
    DirEntry {
        offset: 0,
        inode: u32::try_from(ino).unwrap_or(0),
        rec_len: 12,
        name_len: u16::try_from(name.len()).unwrap_or(0),
        file_type: FileType::Dir.to_raw(),
        name: name.to_vec(),
    }
}

pub(crate) fn inline_parent(inode: &Inode) -> u32 {
    inode.block[0]
}

impl Ext2Fs {
    /// Layout of an existing block; the tail is detected rather than assumed.
    fn layout_for(&self, block: &[u8]) -> DirLayout {
        DirLayout {
            csum_tail: has_dir_tail(block),
            ..self.dir_layout()
        }
    }

    fn inline_layout(&self, len: usize) -> DirLayout {
        DirLayout {
            block_size: u32::try_from(len).unwrap_or(0),
            filetype: self.features.filetype,
            csum_tail: false,
        }
    }

    fn read_dir_block(&self, ino: InodeNumber, inode: &Inode, blk: BlockNumber) -> Result<Vec<u8>> {
        let block = self.channel.read_block(blk)?;
        if self.verify_checksums()
            && has_dir_tail(&block)
            && verify_dir_block_checksum(&block, self.csum_seed, Self::ino32(ino)?, inode.generation)
                .is_err()
        {
            return Err(E2Error::ChecksumMismatch {
                what: "directory block",
                block: blk.0,
            });
        }
        Ok(block)
    }

    pub(crate) fn write_dir_block(&self, ino: InodeNumber, inode: &Inode, blk: BlockNumber, block: &mut [u8]) -> Result<()> {
        if self.metadata_csum && has_dir_tail(block) {
            set_dir_block_checksum(block, self.csum_seed, Self::ino32(ino)?, inode.generation)
                .or_corrupt(blk)?;
        }
        self.channel.write_block(blk, block)
    }

    fn dir_inode(&self, dir: InodeNumber) -> Result<Inode> {
        let inode = self.read_inode(dir)?;
        if !inode.is_dir() {
            return Err(E2Error::NoDirectory);
        }
        Ok(inode)
    }

    fn dir_block_count(&self, inode: &Inode) -> u64 {
        inode.size.div_ceil(u64::from(self.geo.block_size))
    }

    // ── Iteration ───────────────────────────────────────────────────────

    /// Call `f` on every live entry of `dir`: blocks in logical order,
    /// entries in on-disk order. Inline directories report `.` and `..`
    /// first.
    pub fn dir_iterate<F>(&self, dir: InodeNumber, mut f: F) -> Result<()>
    where
        F: FnMut(&DirEntry) -> DirIterAction,
    {
        let inode = self.dir_inode(dir)?;
        if inode.has_inline_data() {
            return self.inline_dir_iterate(dir, &inode, f);
        }
        for lblk in 0..self.dir_block_count(&inode) {
            let Some(pblk) = self.bmap(dir, &inode, lblk)? else {
                continue;
            };
            let block = self.read_dir_block(dir, &inode, pblk)?;
            for entry in DirBlockIter::new(&block, self.geo.block_size, self.features.filetype) {
                let entry = entry.or_corrupt(pblk)?.to_owned();
                if f(&entry) == DirIterAction::Abort {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn inline_dir_iterate<F>(&self, dir: InodeNumber, inode: &Inode, mut f: F) -> Result<()>
    where
        F: FnMut(&DirEntry) -> DirIterAction,
    {
        let synthesized = [
            dot_entry(b".", dir.0),
            dot_entry(b"..", u64::from(inline_parent(inode))),
        ];
        for entry in &synthesized {
            if f(entry) == DirIterAction::Abort {
                return Ok(());
            }
        }

        let ib = inode.i_block_bytes();
        let body = &ib[EXT4_INLINE_DATA_DOTDOT_SIZE..];
        let ea = self.inline_xattr(dir)?;
        for area in [body, ea.as_slice()] {
            if area.is_empty() {
                continue;
            }
            let len = u32::try_from(area.len()).map_err(|_| E2Error::InlineDataNoSpace)?;
            for entry in DirBlockIter::new(area, len, self.features.filetype) {
                let entry = entry.or_corrupt(BlockNumber(0))?.to_owned();
                if f(&entry) == DirIterAction::Abort {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Every live entry of `dir`.
    pub fn read_dir(&self, dir: InodeNumber) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        self.dir_iterate(dir, |entry| {
            out.push(entry.clone());
            DirIterAction::Continue
        })?;
        Ok(out)
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    /// Resolve `name` in `dir`. A missing name is `Ok(None)`.
    pub fn lookup(&self, dir: InodeNumber, name: &[u8]) -> Result<Option<InodeNumber>> {
        let inode = self.dir_inode(dir)?;
        match name {
            b"." => return Ok(Some(dir)),
            b".." => return self.parent_of(dir, &inode),
            _ => {}
        }
        let mut found = None;
        self.dir_iterate(dir, |entry| {
            if entry.name == name {
                found = Some(InodeNumber(u64::from(entry.inode)));
                DirIterAction::Abort
            } else {
                DirIterAction::Continue
            }
        })?;
        Ok(found)
    }

    /// `..` of `dir`: the inline parent field, or the second record of the
    /// first block.
    fn parent_of(&self, dir: InodeNumber, inode: &Inode) -> Result<Option<InodeNumber>> {
        if inode.has_inline_data() {
            return Ok(Some(InodeNumber(u64::from(inline_parent(inode)))));
        }
        let Some(pblk) = self.bmap(dir, inode, 0)? else {
            return Ok(None);
        };
        let block = self.read_dir_block(dir, inode, pblk)?;
        for entry in DirBlockIter::new(&block, self.geo.block_size, self.features.filetype).take(2) {
            let entry = entry.or_corrupt(pblk)?;
            if entry.is_dotdot() {
                return Ok(Some(InodeNumber(u64::from(entry.inode))));
            }
        }
        Ok(None)
    }

    // ── Editing ─────────────────────────────────────────────────────────

    /// Add `name -> ino` to `dir`, growing the directory when every block
    /// is full.
    pub fn link(&self, dir: InodeNumber, name: &[u8], ino: InodeNumber, file_type: FileType) -> Result<()> {
        let m = self.begin_mutation()?;
        self.link_in(&m, dir, name, ino, file_type)
    }

    pub(crate) fn link_in(
        &self,
        m: &Mutation<'_>,
        dir: InodeNumber,
        name: &[u8],
        ino: InodeNumber,
        file_type: FileType,
    ) -> Result<()> {
        let mut inode = self.dir_inode(dir)?;
        let target = Self::ino32(ino)?;
        if inode.has_inline_data() {
            if self.inline_dir_link(m, dir, &mut inode, name, target, file_type)? {
                return Ok(());
            }
            debug!(target: "e2fs::dir", event = "inline_dir_full", dir = dir.0);
            self.inline_data_expand_in(m, dir)?;
            inode = self.dir_inode(dir)?;
        }

        let nblocks = self.dir_block_count(&inode);
        let mut last = None;
        for lblk in 0..nblocks {
            let Some(pblk) = self.bmap(dir, &inode, lblk)? else {
                continue;
            };
            last = Some(pblk);
            let mut block = self.read_dir_block(dir, &inode, pblk)?;
            let layout = self.layout_for(&block);
            match add_entry(&mut block, layout, target, name, file_type) {
                Ok(_) => {
                    debug!(target: "e2fs::dir", event = "link", dir = dir.0, ino = ino.0, block = pblk.0);
                    return self.write_dir_block(dir, &inode, pblk, &mut block);
                }
                Err(E2Error::DirNoSpace) => {}
                Err(err) => return Err(err),
            }
        }

        // Every block is full: append one.
        let layout = self.dir_layout();
        let mut block = vec![0_u8; self.geo.block_size as usize];
        init_empty_block(&mut block, layout)?;
        add_entry(&mut block, layout, target, name, file_type)?;
        let pblk = self.alloc_block(m, last)?;
        if let Err(err) = self.set_bmap(&mut inode, nblocks, pblk) {
            self.block_alloc_stats(m, pblk, -1)?;
            return Err(err);
        }
        self.write_dir_block(dir, &inode, pblk, &mut block)?;
        inode.size += u64::from(self.geo.block_size);
        inode.blocks += self.sectors_per_block();
        debug!(target: "e2fs::dir", event = "grow", dir = dir.0, block = pblk.0, lblk = nblocks);
        self.write_inode_in(m, dir, &inode)
    }

    /// Try the in-inode records, then the `system.data` records. `false`
    /// when neither has room.
    fn inline_dir_link(
        &self,
        m: &Mutation<'_>,
        dir: InodeNumber,
        inode: &mut Inode,
        name: &[u8],
        target: u32,
        file_type: FileType,
    ) -> Result<bool> {
        let mut ib = inode.i_block_bytes();
        match add_entry(
            &mut ib[EXT4_INLINE_DATA_DOTDOT_SIZE..],
            self.inline_layout(INLINE_BODY),
            target,
            name,
            file_type,
        ) {
            Ok(_) => {
                inode.set_i_block_bytes(&ib);
                self.write_inode_in(m, dir, inode)?;
                return Ok(true);
            }
            Err(E2Error::DirNoSpace) => {}
            Err(err) => return Err(err),
        }

        let mut ea = self.inline_xattr(dir)?;
        if ea.is_empty() {
            return Ok(false);
        }
        let ea_layout = self.inline_layout(ea.len());
        match add_entry(&mut ea, ea_layout, target, name, file_type) {
            Ok(_) => {
                self.set_inline_xattr(m, dir, &ea)?;
                Ok(true)
            }
            Err(E2Error::DirNoSpace) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remove `name` from `dir` and drop one link from the inode it names.
    /// The last link frees the inode, its data blocks and its attribute
    /// block. Directories are refused with `EISDIR`.
    pub fn unlink(&self, dir: InodeNumber, name: &[u8]) -> Result<()> {
        let m = self.begin_mutation()?;
        self.unlink_in(&m, dir, name)
    }

    pub(crate) fn unlink_in(&self, m: &Mutation<'_>, dir: InodeNumber, name: &[u8]) -> Result<()> {
        if name == b"." || name == b".." {
            return Err(E2Error::InvalidArgument(
                "cannot unlink . or ..".to_owned(),
            ));
        }
        let missing = || E2Error::FileNotFound(String::from_utf8_lossy(name).into_owned());
        let target = self.lookup(dir, name)?.ok_or_else(missing)?;
        let mut inode = self.read_inode(target)?;
        if inode.is_dir() {
            return Err(E2Error::Os(libc::EISDIR));
        }
        if !self.remove_name(m, dir, name)? {
            return Err(missing());
        }
        self.drop_link(m, target, &mut inode)
    }

    /// Delete the entry for `name`; `false` when there is none.
    fn remove_name(&self, m: &Mutation<'_>, dir: InodeNumber, name: &[u8]) -> Result<bool> {
        let mut inode = self.dir_inode(dir)?;
        if inode.has_inline_data() {
            let mut ib = inode.i_block_bytes();
            if remove_entry(
                &mut ib[EXT4_INLINE_DATA_DOTDOT_SIZE..],
                self.inline_layout(INLINE_BODY),
                name,
            )? {
                inode.set_i_block_bytes(&ib);
                self.write_inode_in(m, dir, &inode)?;
                return Ok(true);
            }
            let mut ea = self.inline_xattr(dir)?;
            let ea_layout = self.inline_layout(ea.len());
            if !ea.is_empty() && remove_entry(&mut ea, ea_layout, name)? {
                self.set_inline_xattr(m, dir, &ea)?;
                return Ok(true);
            }
            return Ok(false);
        }
        for lblk in 0..self.dir_block_count(&inode) {
            let Some(pblk) = self.bmap(dir, &inode, lblk)? else {
                continue;
            };
            let mut block = self.read_dir_block(dir, &inode, pblk)?;
            let layout = self.layout_for(&block);
            if remove_entry(&mut block, layout, name)? {
                debug!(target: "e2fs::dir", event = "unlink", dir = dir.0, block = pblk.0);
                self.write_dir_block(dir, &inode, pblk, &mut block)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drop one link from `ino`; at zero the inode and everything it owns
    /// go back to the allocator.
    fn drop_link(&self, m: &Mutation<'_>, ino: InodeNumber, inode: &mut Inode) -> Result<()> {
        let now = now_secs();
        inode.links_count = inode.links_count.saturating_sub(1);
        inode.ctime = now;
        if inode.links_count > 0 {
            return self.write_inode_in(m, ino, inode);
        }
        if inode.file_acl != 0 {
            self.xattr_block_release(m, BlockNumber(inode.file_acl))?;
            inode.file_acl = 0;
        }
        self.release_blocks(m, ino, inode)?;
        inode.blocks = 0;
        inode.dtime = now;
        self.write_inode_in(m, ino, inode)?;
        self.inode_alloc_stats(m, ino, -1, false)?;
        debug!(target: "e2fs::dir", event = "inode_freed", ino = ino.0);
        Ok(())
    }

    // ── mkdir ───────────────────────────────────────────────────────────

    /// Create directory `name` under `parent`.
    ///
    /// With the inline_data feature and room in the inode, the new
    /// directory starts inline; otherwise it gets one block.
    pub fn mkdir(&self, parent: InodeNumber, name: &[u8], mode: u16) -> Result<InodeNumber> {
        let m = self.begin_mutation()?;
        self.dir_inode(parent)?;
        if self.lookup(parent, name)?.is_some() {
            return Err(E2Error::FileExists);
        }
        let ino = self.new_inode(parent, S_IFDIR | mode)?;
        let block = self.make_dir_inode(&m, ino, parent, mode, true)?;
        if let Err(err) = self.link_in(&m, parent, name, ino, FileType::Dir) {
            if let Some(blk) = block {
                self.block_alloc_stats(&m, blk, -1)?;
            }
            self.inode_alloc_stats(&m, ino, -1, true)?;
            return Err(err);
        }
        let mut parent_inode = self.read_inode(parent)?;
        parent_inode.links_count = parent_inode.links_count.saturating_add(1);
        self.write_inode_in(&m, parent, &parent_inode)?;
        debug!(target: "e2fs::dir", event = "mkdir", parent = parent.0, ino = ino.0);
        Ok(ino)
    }

    /// Write a fresh directory inode `ino` whose `..` is `parent` and mark
    /// it allocated. Returns the data block, if one was allocated.
    pub(crate) fn make_dir_inode(
        &self,
        m: &Mutation<'_>,
        ino: InodeNumber,
        parent: InodeNumber,
        mode: u16,
        allow_inline: bool,
    ) -> Result<Option<BlockNumber>> {
        let now = now_secs();
        let mut inode = self.new_inode_record();
        inode.mode = S_IFDIR | (mode & 0o7777);
        inode.links_count = 2;
        inode.atime = now;
        inode.ctime = now;
        inode.mtime = now;
        let parent32 = Self::ino32(parent)?;

        let inline =
            allow_inline && self.features.inline_data && !inode.ibody_xattr_area().is_empty();
        let block = if inline {
            inode.flags |= EXT4_INLINE_DATA_FL;
            let mut ib = [0_u8; EXT4_MIN_INLINE_DATA_SIZE];
            ib[..4].copy_from_slice(&parent32.to_le_bytes());
            init_empty_block(&mut ib[EXT4_INLINE_DATA_DOTDOT_SIZE..], self.inline_layout(INLINE_BODY))?;
            inode.set_i_block_bytes(&ib);
            inode.size = EXT4_MIN_INLINE_DATA_SIZE as u64;
            self.write_inode_in(m, ino, &inode)?;
            self.inline_data_init_in(m, ino)?;
            None
        } else {
            let goal = self
                .geo
                .inode_location(ino)
                .map(|(group, _)| self.geo.group_first_block(group));
            let blk = self.alloc_block(m, goal)?;
            let mut buf = vec![0_u8; self.geo.block_size as usize];
            init_dir_block(&mut buf, self.dir_layout(), Self::ino32(ino)?, parent32)?;
            if self.features.extents {
                inode.flags |= EXT4_EXTENTS_FL;
            }
            self.set_bmap(&mut inode, 0, blk)?;
            inode.size = u64::from(self.geo.block_size);
            inode.blocks = self.sectors_per_block();
            self.write_dir_block(ino, &inode, blk, &mut buf)?;
            self.write_inode_in(m, ino, &inode)?;
            Some(blk)
        };
        self.inode_alloc_stats(m, ino, 1, true)?;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FormatOptions;
    use crate::testutil::{formatted, open, regular_file, small_fs};
    use e2_alloc::bitmap_get;
    use e2_types::{EXT2_IND_BLOCK, GroupNumber, write_le_u32};

    fn names(fs: &Ext2Fs, dir: InodeNumber) -> Vec<String> {
        fs.read_dir(dir)
            .expect("read_dir")
            .iter()
            .map(DirEntry::name_str)
            .collect()
    }

    #[test]
    fn root_lists_dot_dotdot_and_lost_found() {
        let (_dev, fs) = small_fs();
        assert_eq!(names(&fs, InodeNumber::ROOT), vec![".", "..", "lost+found"]);
        assert_eq!(fs.lookup(InodeNumber::ROOT, b"..").expect("dotdot"), Some(InodeNumber::ROOT));
        assert_eq!(fs.lookup(InodeNumber::ROOT, b".").expect("dot"), Some(InodeNumber::ROOT));
        assert_eq!(fs.lookup(InodeNumber::ROOT, b"missing").expect("lookup"), None);
    }

    #[test]
    fn iteration_stops_on_abort() {
        let (_dev, fs) = small_fs();
        let mut seen = 0;
        fs.dir_iterate(InodeNumber::ROOT, |_| {
            seen += 1;
            DirIterAction::Abort
        })
        .expect("iterate");
        assert_eq!(seen, 1);
    }

    #[test]
    fn non_directories_are_rejected() {
        let (_dev, fs) = small_fs();
        let mut file = fs.new_inode_record();
        file.mode = 0o100_644;
        file.links_count = 1;
        fs.write_inode(InodeNumber(12), &file).expect("file");
        assert!(matches!(fs.read_dir(InodeNumber(12)), Err(E2Error::NoDirectory)));
        assert!(matches!(fs.lookup(InodeNumber(12), b"x"), Err(E2Error::NoDirectory)));
    }

    #[test]
    fn mkdir_links_and_counts() {
        let (_dev, fs) = small_fs();
        let root_links = fs.read_inode(InodeNumber::ROOT).expect("root").links_count;
        let dirs = fs.group_descs()[0].used_dirs_count;
        let ino = fs.mkdir(InodeNumber::ROOT, b"sub", 0o755).expect("mkdir");
        assert_eq!(fs.lookup(InodeNumber::ROOT, b"sub").expect("lookup"), Some(ino));
        assert_eq!(fs.lookup(ino, b"..").expect("parent"), Some(InodeNumber::ROOT));
        assert_eq!(names(&fs, ino), vec![".", ".."]);
        assert_eq!(fs.read_inode(InodeNumber::ROOT).expect("root").links_count, root_links + 1);
        assert_eq!(fs.group_descs()[0].used_dirs_count, dirs + 1);
        assert!(matches!(
            fs.mkdir(InodeNumber::ROOT, b"sub", 0o755),
            Err(E2Error::FileExists)
        ));
    }

    #[test]
    fn directories_grow_by_a_block_when_full() {
        let (_dev, fs) = small_fs();
        let dir = fs.mkdir(InodeNumber::ROOT, b"big", 0o755).expect("mkdir");
        for i in 0..40 {
            let name = format!("entry-with-a-long-name-{i:04}");
            fs.link(dir, name.as_bytes(), InodeNumber(11), FileType::RegFile)
                .expect("link");
        }
        let inode = fs.read_inode(dir).expect("dir");
        assert!(inode.size > u64::from(fs.block_size()));
        assert_eq!(fs.read_dir(dir).expect("entries").len(), 42);
        assert_eq!(
            fs.lookup(dir, b"entry-with-a-long-name-0039").expect("lookup"),
            Some(InodeNumber(11))
        );
    }

    fn free_counts(fs: &Ext2Fs) -> (u32, u32) {
        let sb = fs.superblock();
        (sb.free_blocks_count, sb.free_inodes_count)
    }

    fn inode_in_use(fs: &Ext2Fs, ino: InodeNumber) -> bool {
        let (group, index) = fs.geometry().inode_location(ino).expect("location");
        bitmap_get(&fs.read_inode_bitmap(group).expect("bitmap"), index)
    }

    #[test]
    fn unlink_removes_and_reports_missing() {
        let (_dev, fs) = small_fs();
        regular_file(&fs, InodeNumber::ROOT, b"a", 1, 0);
        fs.unlink(InodeNumber::ROOT, b"a").expect("unlink");
        assert_eq!(fs.lookup(InodeNumber::ROOT, b"a").expect("lookup"), None);
        assert!(matches!(
            fs.unlink(InodeNumber::ROOT, b"a"),
            Err(E2Error::FileNotFound(_))
        ));
        assert!(matches!(
            fs.unlink(InodeNumber::ROOT, b".."),
            Err(E2Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn directories_are_not_unlinked() {
        let (_dev, fs) = small_fs();
        let err = fs.unlink(InodeNumber::ROOT, b"lost+found").expect_err("directory");
        assert_eq!(err.to_errno(), libc::EISDIR);
        assert_eq!(fs.lookup(InodeNumber::ROOT, b"lost+found").expect("lookup"), Some(InodeNumber(11)));
        assert_eq!(fs.read_inode(InodeNumber(11)).expect("inode").links_count, 2);
    }

    #[test]
    fn last_unlink_frees_the_inode_and_its_blocks() {
        let (_dev, fs) = small_fs();
        let before = free_counts(&fs);
        let ino = regular_file(&fs, InodeNumber::ROOT, b"f", 3, 0);
        fs.link(InodeNumber::ROOT, b"g", ino, FileType::RegFile).expect("second name");
        let mut inode = fs.read_inode(ino).expect("inode");
        inode.links_count = 2;
        fs.write_inode(ino, &inode).expect("write");
        assert_eq!(free_counts(&fs), (before.0 - 3, before.1 - 1));

        fs.unlink(InodeNumber::ROOT, b"f").expect("first name");
        assert_eq!(fs.read_inode(ino).expect("inode").links_count, 1);
        assert!(inode_in_use(&fs, ino));
        assert_eq!(free_counts(&fs), (before.0 - 3, before.1 - 1));

        fs.xattr_set(ino, "user.note", b"kept in a block").expect("xattr");
        assert_ne!(fs.read_inode(ino).expect("inode").file_acl, 0);
        assert_eq!(free_counts(&fs), (before.0 - 4, before.1 - 1));

        fs.unlink(InodeNumber::ROOT, b"g").expect("last name");
        let gone = fs.read_inode(ino).expect("inode");
        assert_eq!(gone.links_count, 0);
        assert_eq!(gone.file_acl, 0);
        assert_ne!(gone.dtime, 0);
        assert_eq!(gone.blocks, 0);
        assert!(!inode_in_use(&fs, ino));
        assert_eq!(free_counts(&fs), before);
        assert_eq!(fs.group_descs()[0].free_blocks_count, before.0);
    }

    #[test]
    fn unlink_frees_indirect_and_extent_mapped_blocks() {
        let (_dev, fs) = small_fs();
        let before = free_counts(&fs);

        let big = regular_file(&fs, InodeNumber::ROOT, b"big", 12, 0);
        {
            let m = fs.begin_mutation().expect("writer");
            let table_blk = fs.alloc_block(&m, None).expect("table");
            let mut table = vec![0_u8; fs.block_size() as usize];
            for slot in 0..2 {
                let data = fs.alloc_block(&m, None).expect("data");
                write_le_u32(&mut table, slot * 4, u32::try_from(data.0).expect("fits")).expect("ptr");
            }
            fs.channel.write_block(table_blk, &table).expect("table");
            let mut inode = fs.read_inode(big).expect("inode");
            inode.block[EXT2_IND_BLOCK] = u32::try_from(table_blk.0).expect("fits");
            inode.blocks += 3 * fs.sectors_per_block();
            fs.write_inode_in(&m, big, &inode).expect("write");
        }
        let extents = regular_file(&fs, InodeNumber::ROOT, b"ext", 4, EXT4_EXTENTS_FL);
        assert!(fs.read_inode(extents).expect("inode").uses_extents());
        assert_eq!(free_counts(&fs), (before.0 - 19, before.1 - 2));

        fs.unlink(InodeNumber::ROOT, b"big").expect("unlink big");
        fs.unlink(InodeNumber::ROOT, b"ext").expect("unlink ext");
        assert_eq!(free_counts(&fs), before);
        assert_eq!(fs.group_desc(GroupNumber(0)).expect("gd").free_blocks_count, before.0);
    }

    #[test]
    fn checksummed_directories_round_trip() {
        let opts = FormatOptions {
            inode_size: 256,
            metadata_csum: true,
            ..FormatOptions::default()
        };
        let dev = formatted(&opts, 1024 * 1024);
        let fs = open(&dev);
        fs.link(InodeNumber::ROOT, b"f", InodeNumber(11), FileType::RegFile)
            .expect("link");
        fs.flush().expect("flush");
        drop(fs);
        let fs = open(&dev);
        assert_eq!(fs.lookup(InodeNumber::ROOT, b"f").expect("verified"), Some(InodeNumber(11)));
    }

    #[test]
    fn inline_directories_synthesize_dots_and_expand_when_full() {
        let opts = FormatOptions {
            inode_size: 256,
            inline_data: true,
            ..FormatOptions::default()
        };
        let dev = formatted(&opts, 1024 * 1024);
        let fs = open(&dev);
        let dir = fs.mkdir(InodeNumber::ROOT, b"small", 0o755).expect("mkdir");
        assert!(fs.read_inode(dir).expect("dir").has_inline_data());
        assert_eq!(names(&fs, dir), vec![".", ".."]);

        let one = regular_file(&fs, dir, b"one", 0, 0);
        assert!(fs.read_inode(dir).expect("dir").has_inline_data());
        assert_eq!(names(&fs, dir), vec![".", "..", "one"]);

        for i in 0..6 {
            let name = format!("longer-name-{i}");
            fs.link(dir, name.as_bytes(), InodeNumber(11), FileType::RegFile)
                .expect("link");
        }
        let inode = fs.read_inode(dir).expect("dir");
        assert!(!inode.has_inline_data());
        let listed = names(&fs, dir);
        assert_eq!(listed.len(), 9);
        assert_eq!(&listed[..3], &[".", "..", "one"]);
        assert_eq!(fs.lookup(dir, b"..").expect("parent"), Some(InodeNumber::ROOT));
        assert!(listed.contains(&"longer-name-5".to_owned()));

        // Unlink in the expanded directory works as for any block directory.
        fs.unlink(dir, b"one").expect("unlink");
        assert_eq!(fs.lookup(dir, b"one").expect("lookup"), None);
        assert_eq!(fs.read_inode(one).expect("inode").links_count, 0);
    }
}
