#![forbid(unsafe_code)]
//! On-disk format codec for ext2 (and the ext3/ext4 metadata features the
//! engine understands).
//!
//! Pure codec crate: no I/O, no side effects. Every structure decodes from a
//! byte image in a given [`ByteOrder`](e2_types::ByteOrder) and encodes back
//! to exactly the same bytes. Decoded structures keep the raw image they came
//! from, so fields the model does not name survive a read-modify-write.
//!
//! The disk is always little-endian; the [`swap`] module converts disk images
//! to and from the native layout of a big-endian host.

pub mod csum;
pub mod dir;
pub mod extent;
pub mod group;
pub mod inode;
pub mod superblock;
pub mod swap;
pub mod xattr;

pub use dir::{
    DirBlock, DirBlockIter, DirEntry, DirEntryRef, DirSlot, FileType, dir_rec_len, has_dir_tail,
    init_dir_tail, rec_len_from_disk, rec_len_to_disk,
};
pub use extent::{Extent, ExtentHeader, ExtentIndex, ExtentTree, encode_leaf_root, parse_extent_tree};
pub use group::GroupDesc;
pub use inode::{Inode, TimeField, Timestamp};
pub use superblock::{
    CompatFeatures, ErrorRecord, IncompatFeatures, RoCompatFeatures, Superblock,
};
pub use swap::{SwapDirection, swap_dir_block, swap_group_desc, swap_inode, swap_superblock};
pub use xattr::{
    XattrEntry, XattrHeader, parse_block_xattrs, parse_ibody_xattrs, parse_xattr_entries,
};
