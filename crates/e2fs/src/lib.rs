#![forbid(unsafe_code)]
//! e2fs public API facade.
//!
//! Re-exports the engine from `e2-core` together with the device, error and
//! identifier types a consumer needs to format, mount and query a volume.
//! This is the crate the CLI and other downstream users depend on.

pub use e2_block::{ByteDevice, FileByteDevice, IoChannelOptions, MemoryByteDevice};
pub use e2_core::*;
pub use e2_error::{E2Error, Result};
pub use e2_ondisk::Superblock;
pub use e2_types::{BlockNumber, GroupNumber, InodeNumber};
