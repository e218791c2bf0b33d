use crate::ByteDevice;
use e2_error::{E2Error, Result};
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

/// How an injected fault manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The transfer fails outright.
    Fail,
    /// The transfer moves only half the requested bytes.
    Short,
}

#[derive(Debug, Default)]
struct Faults {
    read: Option<(Range<u64>, FaultKind)>,
    write: Option<(Range<u64>, FaultKind)>,
}

fn overlaps(range: &Range<u64>, offset: u64, len: usize) -> bool {
    let end = offset + len as u64;
    offset < range.end && range.start < end
}

/// In-memory device for tests and tooling.
///
/// Supports an alignment requirement, byte-range fault injection and
/// per-direction call counters.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
    alignment: usize,
    read_only: bool,
    faults: Mutex<Faults>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            alignment: 0,
            read_only: false,
            faults: Mutex::new(Faults::default()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Require offsets and lengths to be multiples of `alignment`.
    #[must_use]
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn inject_read_fault(&self, range: Range<u64>, kind: FaultKind) {
        self.faults.lock().read = Some((range, kind));
    }

    pub fn inject_write_fault(&self, range: Range<u64>, kind: FaultKind) {
        self.faults.lock().write = Some((range, kind));
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Number of `read_at` calls so far.
    #[must_use]
    pub fn read_calls(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `write_at` calls so far.
    #[must_use]
    pub fn write_calls(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }

    fn check_alignment(&self, offset: u64, len: usize) -> Result<()> {
        let align = self.alignment;
        if align > 1 && (offset % align as u64 != 0 || len % align != 0) {
            return Err(E2Error::InvalidArgument(format!(
                "unaligned transfer: offset={offset} len={len} align={align}"
            )));
        }
        Ok(())
    }

    fn fault_for(slot: Option<&(Range<u64>, FaultKind)>, offset: u64, len: usize) -> Option<FaultKind> {
        slot.filter(|(range, _)| overlaps(range, offset, len))
            .map(|(_, kind)| *kind)
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.check_alignment(offset, buf.len())?;
        let mut want = buf.len();
        match Self::fault_for(self.faults.lock().read.as_ref(), offset, want) {
            Some(FaultKind::Fail) => {
                return Err(E2Error::Io(std::io::Error::other("injected read fault")));
            }
            Some(FaultKind::Short) => want /= 2,
            None => {}
        }
        let bytes = self.bytes.lock();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= bytes.len() {
            return Ok(0);
        }
        let n = want.min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        drop(bytes);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.read_only {
            return Err(E2Error::ReadOnly);
        }
        self.check_alignment(offset, buf.len())?;
        let mut want = buf.len();
        match Self::fault_for(self.faults.lock().write.as_ref(), offset, want) {
            Some(FaultKind::Fail) => {
                return Err(E2Error::Io(std::io::Error::other("injected write fault")));
            }
            Some(FaultKind::Short) => want /= 2,
            None => {}
        }
        let mut bytes = self.bytes.lock();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= bytes.len() {
            return Ok(0);
        }
        let n = want.min(bytes.len() - start);
        bytes[start..start + n].copy_from_slice(&buf[..n]);
        drop(bytes);
        Ok(n)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
