#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! [`ByteDevice`] is the device adapter seam: positional reads and writes
//! that may transfer fewer bytes than asked. [`IoChannel`] sits on top of it
//! with a small write-back/write-through block cache, bounce buffering for
//! devices that need aligned transfers, and pluggable error handlers.

mod channel;
mod mem;

pub use channel::{
    CACHE_SLOTS, IoChannel, IoChannelOptions, IoErrorContext, IoErrorHandler, IoStats,
    parse_c_ulong,
};
pub use mem::{FaultKind, MemoryByteDevice};

use e2_error::{E2Error, Result};
use e2_types::{EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed device with positional I/O (pread/pwrite semantics).
///
/// Transfers may be short; callers decide whether that is an error.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`; returns the count read.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write up to `buf.len()` bytes at `offset`; returns the count written.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Required transfer alignment in bytes; 0 when any transfer is fine.
    fn alignment(&self) -> usize {
        0
    }

    /// Whether writes are refused.
    fn is_read_only(&self) -> bool {
        false
    }
}

/// File-backed byte device.
///
/// Uses `FileExt` positional I/O, which is thread-safe and does not need a
/// shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Open read-only.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: false,
        })
    }

    /// Create (or truncate) an image file of `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            match self.file.read_at(&mut buf[done..], pos) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(E2Error::Io(err)),
            }
        }
        Ok(done)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(E2Error::ReadOnly);
        }
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            match self.file.write_at(&buf[done..], pos) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(E2Error::Io(err)),
            }
        }
        Ok(done)
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        !self.writable
    }
}

/// Read the 1024-byte superblock region straight from a device.
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; EXT2_SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; EXT2_SUPERBLOCK_SIZE];
    let n = dev.read_at(EXT2_SUPERBLOCK_OFFSET as u64, &mut buf)?;
    if n != buf.len() {
        return Err(E2Error::ShortRead {
            block: 1,
            expected: buf.len(),
            actual: n,
        });
    }
    Ok(buf)
}
