//! Inline data: file or directory contents kept in `i_block` plus the
//! `system.data` attribute, and their expansion into a real block.

use crate::fs::{Ext2Fs, Mutation};
use e2_dir::inline_to_dir_block;
use e2_error::{E2Error, Result};
use e2_ondisk::Inode;
use e2_types::{
    BlockNumber, EXT4_EXTENTS_FL, EXT4_INLINE_DATA_FL, EXT4_MIN_INLINE_DATA_SIZE, InodeNumber,
};
use e2_xattr::is_inline_data;
use tracing::debug;

const SYSTEM_DATA: &str = "system.data";

impl Ext2Fs {
    fn inline_inode(&self, ino: InodeNumber) -> Result<Inode> {
        let inode = self.read_inode(ino)?;
        if !inode.has_inline_data() {
            return Err(E2Error::NoInlineData);
        }
        Ok(inode)
    }

    /// Value of `system.data`; empty when the attribute is absent.
    pub(crate) fn inline_xattr(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        match self.xattrs_read(ino)?.get(SYSTEM_DATA) {
            Ok(value) => Ok(value.to_vec()),
            Err(E2Error::EaKeyNotFound) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn set_inline_xattr(&self, m: &Mutation<'_>, ino: InodeNumber, data: &[u8]) -> Result<()> {
        let mut handle = self.xattrs_read(ino)?;
        handle.set(SYSTEM_DATA, data)?;
        self.xattrs_write_in(m, &mut handle)
    }

    /// Bytes of inline storage in use: all of `i_block` plus `system.data`.
    pub fn inline_data_size(&self, ino: InodeNumber) -> Result<usize> {
        self.inline_inode(ino)?;
        Ok(EXT4_MIN_INLINE_DATA_SIZE + self.inline_xattr(ino)?.len())
    }

    /// `i_block` followed by the `system.data` value.
    pub fn inline_data_get(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let inode = self.inline_inode(ino)?;
        let mut data = inode.i_block_bytes().to_vec();
        data.extend_from_slice(&self.inline_xattr(ino)?);
        Ok(data)
    }

    /// Give `ino` an empty `system.data` attribute.
    pub fn inline_data_init(&self, ino: InodeNumber) -> Result<()> {
        let m = self.begin_mutation()?;
        self.inline_data_init_in(&m, ino)
    }

    pub(crate) fn inline_data_init_in(&self, m: &Mutation<'_>, ino: InodeNumber) -> Result<()> {
        self.set_inline_xattr(m, ino, &[])
    }

    /// Replace the contents of inline file `ino` with `data`.
    ///
    /// Up to 60 bytes live in `i_block`; the rest goes to `system.data`
    /// when the in-inode attribute area can take it. Larger contents
    /// expand the inode and are written to blocks.
    pub fn inline_data_set(&self, ino: InodeNumber, data: &[u8]) -> Result<()> {
        let m = self.begin_mutation()?;
        let mut inode = self.inline_inode(ino)?;
        let (head, tail) = data.split_at(data.len().min(EXT4_MIN_INLINE_DATA_SIZE));

        if !tail.is_empty() && !self.inline_tail_fits(ino, tail)? {
            debug!(target: "e2fs::inline", event = "set_expands", ino = ino.0, len = data.len());
            self.inline_data_expand_in(&m, ino)?;
            let mut inode = self.read_inode(ino)?;
            return self.write_new_data(&m, ino, &mut inode, data);
        }

        let mut ib = [0_u8; EXT4_MIN_INLINE_DATA_SIZE];
        ib[..head.len()].copy_from_slice(head);
        inode.set_i_block_bytes(&ib);
        inode.size = data.len() as u64;
        self.write_inode_in(&m, ino, &inode)?;
        self.set_inline_xattr(&m, ino, tail)
    }

    /// Whether `tail` fits as `system.data` inside the inode itself.
    fn inline_tail_fits(&self, ino: InodeNumber, tail: &[u8]) -> Result<bool> {
        let mut handle = self.xattrs_read(ino)?;
        handle.set(SYSTEM_DATA, tail)?;
        let ibody_len = self.read_inode(ino)?.ibody_xattr_area().len();
        match e2_xattr::pack(handle.entries(), ibody_len, self.geo.block_size as usize) {
            Ok(placement) => Ok(placement.ibody.iter().any(is_inline_data)),
            Err(E2Error::EaNoSpace) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Move the inline contents of `ino` into a freshly allocated block.
    ///
    /// Fails with `NoInlineData`, changing nothing, when the inode does
    /// not hold inline data.
    pub fn inline_data_expand(&self, ino: InodeNumber) -> Result<()> {
        let m = self.begin_mutation()?;
        self.inline_data_expand_in(&m, ino)
    }

    pub(crate) fn inline_data_expand_in(&self, m: &Mutation<'_>, ino: InodeNumber) -> Result<()> {
        let mut inode = self.inline_inode(ino)?;

        let mut image = inode.i_block_bytes().to_vec();
        image.extend_from_slice(&self.inline_xattr(ino)?);

        inode.set_i_block_bytes(&[0; EXT4_MIN_INLINE_DATA_SIZE]);
        self.write_inode_in(m, ino, &inode)?;

        let mut handle = self.xattrs_read(ino)?;
        match handle.remove(SYSTEM_DATA) {
            Ok(()) => self.xattrs_write_in(m, &mut handle)?,
            Err(E2Error::EaKeyNotFound) => {}
            Err(err) => return Err(err),
        }

        let mut inode = self.read_inode(ino)?;
        inode.flags &= !EXT4_INLINE_DATA_FL;
        if self.features.extents {
            inode.flags |= EXT4_EXTENTS_FL;
        }
        debug!(target: "e2fs::inline", event = "expand", ino = ino.0, bytes = image.len(), dir = inode.is_dir());
        if inode.is_dir() {
            self.expand_dir(m, ino, &mut inode, &image)
        } else {
            let len = image.len().min(usize::try_from(inode.size).unwrap_or(usize::MAX));
            self.write_new_data(m, ino, &mut inode, &image[..len])
        }
    }

    fn expand_dir(&self, m: &Mutation<'_>, ino: InodeNumber, inode: &mut Inode, image: &[u8]) -> Result<()> {
        let mut block = inline_to_dir_block(image, self.dir_layout(), Self::ino32(ino)?)?;
        let blk = self.alloc_block(m, self.goal_for(ino))?;
        self.set_bmap(inode, 0, blk)?;
        inode.blocks += self.sectors_per_block();
        inode.size = u64::from(self.geo.block_size);
        self.write_dir_block(ino, inode, blk, &mut block)?;
        self.write_inode_in(m, ino, inode)
    }

    /// Write `data` from offset 0 of a non-inline inode, allocating blocks
    /// for holes, and set the size to its length.
    fn write_new_data(&self, m: &Mutation<'_>, ino: InodeNumber, inode: &mut Inode, data: &[u8]) -> Result<()> {
        let bs = self.geo.block_size as usize;
        let mut goal = self.goal_for(ino);
        for (lblk, chunk) in data.chunks(bs).enumerate() {
            let lblk = lblk as u64;
            let blk = match self.bmap(ino, inode, lblk)? {
                Some(blk) => blk,
                None => {
                    let blk = self.alloc_block(m, goal)?;
                    if let Err(err) = self.set_bmap(inode, lblk, blk) {
                        self.block_alloc_stats(m, blk, -1)?;
                        return Err(err);
                    }
                    inode.blocks += self.sectors_per_block();
                    blk
                }
            };
            let mut buf = vec![0_u8; bs];
            buf[..chunk.len()].copy_from_slice(chunk);
            self.channel.write_block(blk, &buf)?;
            goal = blk.checked_add(1);
        }
        inode.size = data.len() as u64;
        self.write_inode_in(m, ino, inode)
    }

    fn goal_for(&self, ino: InodeNumber) -> Option<BlockNumber> {
        self.geo
            .inode_location(ino)
            .map(|(group, _)| self.geo.group_first_block(group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FormatOptions;
    use crate::testutil::{formatted, open};
    use e2_ondisk::FileType;

    fn inline_fs() -> Ext2Fs {
        let opts = FormatOptions {
            inode_size: 256,
            inline_data: true,
            ..FormatOptions::default()
        };
        open(&formatted(&opts, 1024 * 1024))
    }

    fn inline_file(fs: &Ext2Fs) -> InodeNumber {
        let ino = fs.new_inode(InodeNumber::ROOT, 0o100_644).expect("free inode");
        {
            let m = fs.begin_mutation().expect("writer");
            let mut inode = fs.new_inode_record();
            inode.mode = 0o100_644;
            inode.links_count = 1;
            inode.flags = EXT4_INLINE_DATA_FL;
            fs.write_inode_in(&m, ino, &inode).expect("inode");
            fs.inode_alloc_stats(&m, ino, 1, false).expect("stats");
            fs.inline_data_init_in(&m, ino).expect("init");
            fs.link_in(&m, InodeNumber::ROOT, b"file", ino, FileType::RegFile)
                .expect("link");
        }
        ino
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn short_contents_stay_in_i_block() {
        let fs = inline_fs();
        let ino = inline_file(&fs);
        fs.inline_data_set(ino, b"hello inline").expect("set");
        assert_eq!(fs.inline_data_size(ino).expect("size"), 60);
        let got = fs.inline_data_get(ino).expect("get");
        assert_eq!(&got[..12], b"hello inline");
        assert_eq!(fs.read_file(ino, 0, 100).expect("read"), b"hello inline");
    }

    #[test]
    fn longer_contents_spill_into_system_data() {
        let fs = inline_fs();
        let ino = inline_file(&fs);
        let data = pattern(80);
        fs.inline_data_set(ino, &data).expect("set");
        let inode = fs.read_inode(ino).expect("inode");
        assert!(inode.has_inline_data());
        assert_eq!(inode.file_acl, 0);
        assert_eq!(fs.inline_data_size(ino).expect("size"), 80);
        assert_eq!(fs.read_file(ino, 0, 200).expect("read"), data);
        assert_eq!(fs.read_file(ino, 70, 5).expect("middle"), &data[70..75]);
    }

    #[test]
    fn oversized_contents_expand_to_blocks() {
        let fs = inline_fs();
        let ino = inline_file(&fs);
        let data = pattern(700);
        fs.inline_data_set(ino, &data).expect("set");
        let inode = fs.read_inode(ino).expect("inode");
        assert!(!inode.has_inline_data());
        assert_eq!(inode.size, 700);
        assert!(fs.xattr_list(ino).expect("list").is_empty());
        assert_eq!(fs.read_file(ino, 0, 1000).expect("read"), data);
    }

    #[test]
    fn expanding_a_file_keeps_its_bytes() {
        let fs = inline_fs();
        let ino = inline_file(&fs);
        let data = pattern(75);
        fs.inline_data_set(ino, &data).expect("set");
        fs.inline_data_expand(ino).expect("expand");
        let inode = fs.read_inode(ino).expect("inode");
        assert!(!inode.has_inline_data());
        assert_eq!(inode.blocks, fs.sectors_per_block());
        assert_eq!(fs.read_file(ino, 0, 100).expect("read"), data);
    }

    #[test]
    fn second_expand_reports_no_inline_data_and_changes_nothing() {
        let fs = inline_fs();
        let ino = inline_file(&fs);
        fs.inline_data_set(ino, b"abc").expect("set");
        fs.inline_data_expand(ino).expect("first expand");
        let inode = fs.read_inode(ino).expect("inode");
        let free = fs.superblock().free_blocks_count;

        assert!(matches!(fs.inline_data_expand(ino), Err(E2Error::NoInlineData)));
        assert_eq!(fs.read_inode(ino).expect("inode"), inode);
        assert_eq!(fs.superblock().free_blocks_count, free);
        assert_eq!(fs.read_file(ino, 0, 10).expect("read"), b"abc");
    }

    #[test]
    fn expanding_a_directory_lays_out_a_block() {
        let fs = inline_fs();
        let dir = fs.mkdir(InodeNumber::ROOT, b"d", 0o755).expect("mkdir");
        fs.link(dir, b"x", InodeNumber(11), FileType::RegFile).expect("link");
        fs.inline_data_expand(dir).expect("expand");
        let inode = fs.read_inode(dir).expect("dir");
        assert!(!inode.has_inline_data());
        assert_eq!(inode.size, u64::from(fs.block_size()));
        let names: Vec<String> = fs
            .read_dir(dir)
            .expect("entries")
            .iter()
            .map(e2_ondisk::DirEntry::name_str)
            .collect();
        assert_eq!(names, vec![".", "..", "x"]);
        assert_eq!(fs.lookup(dir, b"..").expect("parent"), Some(InodeNumber::ROOT));
    }
}
