//! Logical-to-physical block mapping.
//!
//! Reads cover the classic direct/indirect/double/triple map and extent
//! trees of any depth. Writes cover direct slots and a depth-0 extent root
//! held in the inode; other shapes report `Unimplemented`. Releasing walks
//! every shape.

use crate::ParseResultExt;
use crate::fs::{Ext2Fs, Mutation};
use e2_error::{E2Error, Result};
use e2_ondisk::csum::verify_extent_block_checksum;
use e2_ondisk::extent::EXT_INIT_MAX_LEN;
use e2_ondisk::{Extent, ExtentTree, Inode, encode_leaf_root, parse_extent_tree};
use e2_types::{
    BlockNumber, EXT2_DIND_BLOCK, EXT2_IND_BLOCK, EXT2_N_BLOCKS, EXT2_NDIR_BLOCKS,
    EXT2_TIND_BLOCK, InodeNumber, read_le_u32,
};
use tracing::{debug, trace};

/// Deepest extent tree ext4 ever builds.
const MAX_EXTENT_DEPTH: usize = 5;

fn root_is_empty(inode: &Inode) -> bool {
    inode.i_block_bytes().iter().all(|&b| b == 0)
}

impl Ext2Fs {
    pub(crate) fn check_block(&self, blk: u64) -> Result<BlockNumber> {
        if blk < u64::from(self.geo.first_data_block) || blk >= u64::from(self.geo.total_blocks) {
            return Err(E2Error::BadBlockNum(blk));
        }
        Ok(BlockNumber(blk))
    }

    /// Physical block backing logical block `lblk` of `inode`, or `None`
    /// for a hole.
    pub fn bmap(&self, ino: InodeNumber, inode: &Inode, lblk: u64) -> Result<Option<BlockNumber>> {
        if inode.has_inline_data() {
            return Err(E2Error::InvalidArgument(format!(
                "inode {} keeps its data inline",
                ino.0
            )));
        }
        let mapped = if inode.uses_extents() {
            self.bmap_extents(ino, inode, lblk)?
        } else {
            self.bmap_indirect(inode, lblk)?
        };
        trace!(target: "e2fs::bmap", ino = ino.0, lblk, pblk = mapped.map(|b| b.0));
        Ok(mapped)
    }

    fn bmap_indirect(&self, inode: &Inode, lblk: u64) -> Result<Option<BlockNumber>> {
        let per = u64::from(self.geo.block_size / 4);
        let ndir = EXT2_NDIR_BLOCKS as u64;
        if lblk < ndir {
            return self.indirect_walk(u64::from(inode.block[lblk as usize]), &[]);
        }
        let mut rest = lblk - ndir;
        if rest < per {
            return self.indirect_walk(u64::from(inode.block[EXT2_IND_BLOCK]), &[rest]);
        }
        rest -= per;
        if rest < per * per {
            return self.indirect_walk(
                u64::from(inode.block[EXT2_DIND_BLOCK]),
                &[rest / per, rest % per],
            );
        }
        rest -= per * per;
        if rest < per * per * per {
            return self.indirect_walk(
                u64::from(inode.block[EXT2_TIND_BLOCK]),
                &[rest / (per * per), (rest / per) % per, rest % per],
            );
        }
        Err(E2Error::FileTooBig)
    }

    fn indirect_walk(&self, start: u64, path: &[u64]) -> Result<Option<BlockNumber>> {
        let mut blk = start;
        for &slot in path {
            if blk == 0 {
                return Ok(None);
            }
            let table = self.channel.read_block(self.check_block(blk)?)?;
            let offset = usize::try_from(slot * 4).map_err(|_| E2Error::FileTooBig)?;
            blk = u64::from(read_le_u32(&table, offset).or_corrupt(BlockNumber(blk))?);
        }
        if blk == 0 {
            return Ok(None);
        }
        self.check_block(blk).map(Some)
    }

    fn bmap_extents(&self, ino: InodeNumber, inode: &Inode, lblk: u64) -> Result<Option<BlockNumber>> {
        let Ok(lblk) = u32::try_from(lblk) else {
            return Err(E2Error::FileTooBig);
        };
        if root_is_empty(inode) {
            return Ok(None);
        }
        let ino32 = u32::try_from(ino.0).map_err(|_| E2Error::BadInodeNum(ino.0))?;
        let mut node = inode.i_block_bytes().to_vec();
        let mut node_block = BlockNumber(0);
        for _ in 0..=MAX_EXTENT_DEPTH {
            let (_, tree) = parse_extent_tree(&node).or_corrupt(node_block)?;
            match tree {
                ExtentTree::Leaf(extents) => {
                    let hit = extents
                        .iter()
                        .filter(|ext| !ext.is_unwritten())
                        .find_map(|ext| ext.map(lblk));
                    return hit.map(|blk| self.check_block(blk)).transpose();
                }
                ExtentTree::Index(indexes) => {
                    let Some(next) = indexes.iter().rev().find(|idx| idx.logical_block <= lblk)
                    else {
                        return Ok(None);
                    };
                    node_block = self.check_block(next.leaf_block)?;
                    node = self.channel.read_block(node_block)?;
                    if self.verify_checksums()
                        && verify_extent_block_checksum(&node, self.csum_seed, ino32, inode.generation)
                            .is_err()
                    {
                        return Err(E2Error::ChecksumMismatch {
                            what: "extent block",
                            block: node_block.0,
                        });
                    }
                }
            }
        }
        Err(E2Error::Corruption {
            block: node_block.0,
            detail: "extent tree deeper than the format allows".to_owned(),
        })
    }

    /// Map logical block `lblk` of `inode` to `pblk`. Only the in-memory
    /// inode changes; the caller writes it back.
    pub fn set_bmap(&self, inode: &mut Inode, lblk: u64, pblk: BlockNumber) -> Result<()> {
        if inode.has_inline_data() {
            return Err(E2Error::InvalidArgument(
                "cannot map blocks of an inline-data inode".to_owned(),
            ));
        }
        self.check_block(pblk.0)?;
        if inode.uses_extents() {
            return set_extent_root(inode, lblk, pblk);
        }
        if lblk >= EXT2_NDIR_BLOCKS as u64 {
            return Err(E2Error::Unimplemented);
        }
        let phys = pblk.to_u32().map_err(|_| E2Error::BadBlockNum(pblk.0))?;
        inode.block[lblk as usize] = phys;
        Ok(())
    }
}

impl Ext2Fs {
    /// Free every block `inode` maps, mapping blocks included, and empty
    /// its map. Inline data and fast symlinks own no blocks. The caller
    /// writes the inode back.
    pub(crate) fn release_blocks(&self, m: &Mutation<'_>, ino: InodeNumber, inode: &mut Inode) -> Result<()> {
        if inode.has_inline_data() || self.target_in_i_block(inode) {
            return Ok(());
        }
        if inode.uses_extents() {
            if !root_is_empty(inode) {
                self.free_extent_node(m, &inode.i_block_bytes(), BlockNumber(0), MAX_EXTENT_DEPTH)?;
            }
        } else {
            let map = inode.block;
            for (slot, &ptr) in map.iter().enumerate() {
                let level = match slot {
                    EXT2_IND_BLOCK => 1,
                    EXT2_DIND_BLOCK => 2,
                    EXT2_TIND_BLOCK => 3,
                    _ => 0,
                };
                self.free_indirect(m, ptr, level)?;
            }
        }
        inode.block = [0; EXT2_N_BLOCKS];
        inode.size = 0;
        debug!(target: "e2fs::bmap", event = "blocks_released", ino = ino.0);
        Ok(())
    }

    /// Free `blk` and, `level` tables deep, everything it points to.
    fn free_indirect(&self, m: &Mutation<'_>, blk: u32, level: u32) -> Result<()> {
        if blk == 0 {
            return Ok(());
        }
        let blk = self.check_block(u64::from(blk))?;
        if level > 0 {
            let table = self.channel.read_block(blk)?;
            for offset in (0..table.len()).step_by(4) {
                let ptr = read_le_u32(&table, offset).or_corrupt(blk)?;
                self.free_indirect(m, ptr, level - 1)?;
            }
        }
        self.block_alloc_stats(m, blk, -1)
    }

    /// Free the extents under `node`, then the index blocks below it.
    fn free_extent_node(&self, m: &Mutation<'_>, node: &[u8], node_block: BlockNumber, depth_left: usize) -> Result<()> {
        match parse_extent_tree(node).or_corrupt(node_block)? {
            (_, ExtentTree::Leaf(extents)) => {
                for ext in extents {
                    for off in 0..u64::from(ext.actual_len()) {
                        let blk = self.check_block(ext.physical_start + off)?;
                        self.block_alloc_stats(m, blk, -1)?;
                    }
                }
            }
            (_, ExtentTree::Index(indexes)) => {
                let Some(depth_left) = depth_left.checked_sub(1) else {
                    return Err(E2Error::Corruption {
                        block: node_block.0,
                        detail: "extent tree deeper than the format allows".to_owned(),
                    });
                };
                for idx in indexes {
                    let child = self.check_block(idx.leaf_block)?;
                    let image = self.channel.read_block(child)?;
                    self.free_extent_node(m, &image, child, depth_left)?;
                    self.block_alloc_stats(m, child, -1)?;
                }
            }
        }
        Ok(())
    }
}

fn set_extent_root(inode: &mut Inode, lblk: u64, pblk: BlockNumber) -> Result<()> {
    let lblk = u32::try_from(lblk).map_err(|_| E2Error::FileTooBig)?;
    let (generation, mut extents) = if root_is_empty(inode) {
        (0, Vec::new())
    } else {
        match parse_extent_tree(&inode.i_block_bytes()).or_corrupt(BlockNumber(0))? {
            (header, ExtentTree::Leaf(extents)) => (header.generation, extents),
            (_, ExtentTree::Index(_)) => return Err(E2Error::Unimplemented),
        }
    };

    if let Some(existing) = extents.iter().find_map(|ext| ext.map(lblk)) {
        return if existing == pblk.0 {
            Ok(())
        } else {
            Err(E2Error::Unimplemented)
        };
    }

    let merged = extents.iter_mut().any(|ext| {
        let len = ext.actual_len();
        let contiguous = !ext.is_unwritten()
            && len < EXT_INIT_MAX_LEN
            && u64::from(ext.logical_block) + u64::from(len) == u64::from(lblk)
            && ext.physical_start + u64::from(len) == pblk.0;
        if contiguous {
            ext.raw_len = len + 1;
        }
        contiguous
    });
    if !merged {
        extents.push(Extent {
            logical_block: lblk,
            raw_len: 1,
            physical_start: pblk.0,
        });
        extents.sort_by_key(|ext| ext.logical_block);
    }

    // A full root would need a tree split.
    let root = encode_leaf_root(&extents, generation).map_err(|_| E2Error::Unimplemented)?;
    inode.set_i_block_bytes(&root);
    Ok(())
}
