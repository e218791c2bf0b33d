//! Extended attributes of one inode: in-inode area plus one external block.

use crate::ParseResultExt;
use crate::fs::{Ext2Fs, Mutation};
use e2_error::{E2Error, Result};
use e2_ondisk::XattrEntry;
use e2_ondisk::csum::{set_xattr_block_checksum, verify_xattr_block_checksum};
use e2_ondisk::xattr::XattrHeader;
use e2_ondisk::{parse_block_xattrs, parse_ibody_xattrs};
use e2_types::{BlockNumber, InodeNumber};
use e2_xattr::{encode_block, encode_ibody, make_entry, pack, split_name};
use tracing::debug;

/// Every attribute of one inode, loaded for reading and editing.
///
/// Changes stay in memory until [`Ext2Fs::xattrs_write`].
#[derive(Debug, Clone)]
pub struct XattrHandle {
    ino: InodeNumber,
    entries: Vec<XattrEntry>,
    block: u64,
    refcount: u32,
    ibody_len: usize,
}

impl XattrHandle {
    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn entries(&self) -> &[XattrEntry] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// External block the attributes were loaded from, 0 for none.
    #[must_use]
    pub fn block(&self) -> u64 {
        self.block
    }

    fn position(&self, full_name: &str) -> Option<usize> {
        let (index, name) = split_name(full_name);
        self.entries
            .iter()
            .position(|e| e.name_index == index && e.name == name)
    }

    /// Value of `full_name`, or `EaKeyNotFound`.
    pub fn get(&self, full_name: &str) -> Result<&[u8]> {
        self.position(full_name)
            .map(|i| self.entries[i].value.as_slice())
            .ok_or(E2Error::EaKeyNotFound)
    }

    /// Insert or replace `full_name`.
    pub fn set(&mut self, full_name: &str, value: &[u8]) -> Result<()> {
        let entry = make_entry(full_name, value)?;
        match self.position(full_name) {
            Some(i) => self.entries[i] = entry,
            None => self.entries.push(entry),
        }
        Ok(())
    }

    /// Drop `full_name`, or `EaKeyNotFound`.
    pub fn remove(&mut self, full_name: &str) -> Result<()> {
        let i = self.position(full_name).ok_or(E2Error::EaKeyNotFound)?;
        self.entries.remove(i);
        Ok(())
    }

    /// Full names in storage order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(XattrEntry::full_name).collect()
    }
}

impl Ext2Fs {
    /// Load every attribute of `ino`.
    pub fn xattrs_read(&self, ino: InodeNumber) -> Result<XattrHandle> {
        let inode = self.read_inode(ino)?;
        let mut entries = parse_ibody_xattrs(inode.ibody_xattr_area()).map_err(|err| {
            E2Error::Corruption {
                block: 0,
                detail: format!("in-inode xattrs of inode {}: {err}", ino.0),
            }
        })?;
        let mut refcount = 0;
        if inode.file_acl != 0 {
            let blk = self.check_block(inode.file_acl)?;
            let image = self.channel.read_block(blk)?;
            if self.verify_checksums() && verify_xattr_block_checksum(&image, self.csum_seed, blk.0).is_err() {
                return Err(E2Error::ChecksumMismatch {
                    what: "xattr block",
                    block: blk.0,
                });
            }
            let (header, block_entries) = parse_block_xattrs(&image).or_corrupt(blk)?;
            refcount = header.refcount;
            entries.extend(block_entries);
        }
        Ok(XattrHandle {
            ino,
            entries,
            block: inode.file_acl,
            refcount,
            ibody_len: inode.ibody_xattr_area().len(),
        })
    }

    /// Store `handle` back: in-inode area first, the rest in one block.
    pub fn xattrs_write(&self, handle: &mut XattrHandle) -> Result<()> {
        let m = self.begin_mutation()?;
        self.xattrs_write_in(&m, handle)
    }

    pub(crate) fn xattrs_write_in(&self, m: &Mutation<'_>, handle: &mut XattrHandle) -> Result<()> {
        let bs = self.geo.block_size as usize;
        let placement = pack(&handle.entries, handle.ibody_len, bs)?;
        let mut inode = self.read_inode(handle.ino)?;
        if handle.ibody_len > 0 {
            let area = encode_ibody(handle.ibody_len, &placement.ibody)?;
            inode.set_ibody_xattr_area(&area).or_corrupt(BlockNumber(0))?;
        }

        let old = inode.file_acl;
        if placement.needs_block() {
            let mut image = encode_block(bs, &placement.block)?;
            let target = if old != 0 && handle.refcount == 1 {
                BlockNumber(old)
            } else {
                let goal = self
                    .geo
                    .inode_location(handle.ino)
                    .map(|(group, _)| self.geo.group_first_block(group));
                let blk = self.alloc_block(m, goal)?;
                if old == 0 {
                    inode.blocks += self.sectors_per_block();
                } else {
                    self.xattr_block_release(m, BlockNumber(old))?;
                }
                blk
            };
            if self.metadata_csum {
                set_xattr_block_checksum(&mut image, self.csum_seed, target.0).or_corrupt(target)?;
            }
            self.channel.write_block(target, &image)?;
            inode.file_acl = target.0;
            handle.block = target.0;
            handle.refcount = 1;
            debug!(target: "e2fs::xattr", event = "block_write", ino = handle.ino.0, block = target.0);
        } else if old != 0 {
            self.xattr_block_release(m, BlockNumber(old))?;
            inode.file_acl = 0;
            inode.blocks = inode.blocks.saturating_sub(self.sectors_per_block());
            handle.block = 0;
            handle.refcount = 0;
        }
        self.write_inode_in(m, handle.ino, &inode)
    }

    /// Drop one reference to an external attribute block, freeing it with
    /// the last one.
    pub(crate) fn xattr_block_release(&self, m: &Mutation<'_>, blk: BlockNumber) -> Result<()> {
        let mut image = self.channel.read_block(blk)?;
        let mut header = XattrHeader::decode(&image).or_corrupt(blk)?;
        if header.refcount <= 1 {
            debug!(target: "e2fs::xattr", event = "block_free", block = blk.0);
            return self.block_alloc_stats(m, blk, -1);
        }
        header.refcount -= 1;
        header.encode_into(&mut image).or_corrupt(blk)?;
        if self.metadata_csum {
            set_xattr_block_checksum(&mut image, self.csum_seed, blk.0).or_corrupt(blk)?;
        }
        debug!(target: "e2fs::xattr", event = "block_unshare", block = blk.0, refcount = header.refcount);
        self.channel.write_block(blk, &image)
    }

    // ── Single-attribute conveniences ───────────────────────────────────

    pub fn xattr_get(&self, ino: InodeNumber, full_name: &str) -> Result<Vec<u8>> {
        self.xattrs_read(ino)?.get(full_name).map(<[u8]>::to_vec)
    }

    pub fn xattr_set(&self, ino: InodeNumber, full_name: &str, value: &[u8]) -> Result<()> {
        let m = self.begin_mutation()?;
        let mut handle = self.xattrs_read(ino)?;
        handle.set(full_name, value)?;
        self.xattrs_write_in(&m, &mut handle)
    }

    pub fn xattr_remove(&self, ino: InodeNumber, full_name: &str) -> Result<()> {
        let m = self.begin_mutation()?;
        let mut handle = self.xattrs_read(ino)?;
        handle.remove(full_name)?;
        self.xattrs_write_in(&m, &mut handle)
    }

    pub fn xattr_list(&self, ino: InodeNumber) -> Result<Vec<String>> {
        Ok(self.xattrs_read(ino)?.names())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FormatOptions;
    use crate::testutil::{formatted, open, small_fs};

    fn big_inode_fs() -> (std::sync::Arc<e2_block::MemoryByteDevice>, Ext2Fs) {
        let opts = FormatOptions {
            inode_size: 256,
            ..FormatOptions::default()
        };
        let dev = formatted(&opts, 1024 * 1024);
        let fs = open(&dev);
        (dev, fs)
    }

    #[test]
    fn small_values_stay_in_the_inode() {
        let (_dev, fs) = big_inode_fs();
        let ino = InodeNumber::ROOT;
        fs.xattr_set(ino, "user.color", b"blue").expect("set");
        assert_eq!(fs.xattr_get(ino, "user.color").expect("get"), b"blue");
        assert_eq!(fs.read_inode(ino).expect("inode").file_acl, 0);
        assert_eq!(fs.xattr_list(ino).expect("list"), vec!["user.color".to_owned()]);
        fs.xattr_set(ino, "user.color", b"green").expect("replace");
        assert_eq!(fs.xattr_get(ino, "user.color").expect("get"), b"green");
    }

    #[test]
    fn missing_key_is_reported() {
        let (_dev, fs) = big_inode_fs();
        assert!(matches!(
            fs.xattr_get(InodeNumber::ROOT, "user.none"),
            Err(E2Error::EaKeyNotFound)
        ));
        assert!(matches!(
            fs.xattr_remove(InodeNumber::ROOT, "user.none"),
            Err(E2Error::EaKeyNotFound)
        ));
    }

    #[test]
    fn large_values_spill_to_a_block_and_are_freed_with_it() {
        let (_dev, fs) = big_inode_fs();
        let ino = InodeNumber::ROOT;
        let free = fs.superblock().free_blocks_count;
        let sectors = fs.read_inode(ino).expect("inode").blocks;

        fs.xattr_set(ino, "user.small", b"x").expect("small");
        fs.xattr_set(ino, "user.big", &[7_u8; 300]).expect("big");
        let inode = fs.read_inode(ino).expect("inode");
        assert_ne!(inode.file_acl, 0);
        assert_eq!(inode.blocks, sectors + 2);
        assert_eq!(fs.superblock().free_blocks_count, free - 1);
        assert_eq!(fs.xattr_get(ino, "user.big").expect("get"), vec![7_u8; 300]);

        fs.xattr_remove(ino, "user.big").expect("remove");
        let inode = fs.read_inode(ino).expect("inode");
        assert_eq!(inode.file_acl, 0);
        assert_eq!(inode.blocks, sectors);
        assert_eq!(fs.superblock().free_blocks_count, free);
        assert_eq!(fs.xattr_get(ino, "user.small").expect("kept"), b"x");
    }

    #[test]
    fn classic_inodes_use_the_block_only() {
        let (_dev, fs) = small_fs();
        let ino = InodeNumber::ROOT;
        fs.xattr_set(ino, "trusted.tag", b"v").expect("set");
        assert_ne!(fs.read_inode(ino).expect("inode").file_acl, 0);
        assert_eq!(fs.xattr_get(ino, "trusted.tag").expect("get"), b"v");
    }

    #[test]
    fn oversized_set_is_refused_without_side_effects() {
        let (_dev, fs) = small_fs();
        let free = fs.superblock().free_blocks_count;
        let err = fs
            .xattr_set(InodeNumber::ROOT, "user.huge", &[0_u8; 2000])
            .expect_err("too big");
        assert!(matches!(err, E2Error::EaNoSpace));
        assert_eq!(fs.superblock().free_blocks_count, free);
    }

    #[test]
    fn shared_block_is_copied_on_write() {
        let (_dev, fs) = small_fs();
        let a = InodeNumber::ROOT;
        fs.xattr_set(a, "user.k", b"shared").expect("set");
        let shared = fs.read_inode(a).expect("a").file_acl;

        // Point a second inode at the same block and bump the refcount.
        let b = InodeNumber(12);
        let mut inode_b = fs.new_inode_record();
        inode_b.mode = 0o100_644;
        inode_b.links_count = 1;
        inode_b.file_acl = shared;
        inode_b.blocks = fs.sectors_per_block();
        fs.write_inode(b, &inode_b).expect("b");
        let mut image = fs.channel.read_block(BlockNumber(shared)).expect("block");
        image[4..8].copy_from_slice(&2_u32.to_le_bytes());
        fs.channel.write_block(BlockNumber(shared), &image).expect("refcount");

        fs.xattr_set(b, "user.k", b"mine").expect("cow");
        let moved = fs.read_inode(b).expect("b").file_acl;
        assert_ne!(moved, shared);
        assert_eq!(fs.xattr_get(a, "user.k").expect("a"), b"shared");
        assert_eq!(fs.xattr_get(b, "user.k").expect("b"), b"mine");
        let header = XattrHeader::decode(&fs.channel.read_block(BlockNumber(shared)).expect("blk"))
            .expect("header");
        assert_eq!(header.refcount, 1);
    }
}
