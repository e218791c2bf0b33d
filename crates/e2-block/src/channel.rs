//! Cached block I/O channel.
//!
//! A fixed array of [`CACHE_SLOTS`] block buffers sits between callers and
//! the device. Replacement is least-recently-accessed by a monotonically
//! increasing access counter; an unused slot is always preferred. Writes are
//! write-back by default (dirty until flush or eviction) or write-through
//! when configured.
//!
//! Invariants:
//! - a block number occupies at most one in-use slot;
//! - a dirty slot is never reassigned before its contents reach the device;
//! - after a flush every slot is either clean, recycled through the write
//!   error handler, or still dirty with `write_err` set;
//! - error handlers run after the state lock is released, so a handler may
//!   call back into the channel.

use crate::ByteDevice;
use e2_error::{E2Error, Result};
use e2_types::BlockNumber;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Number of block buffers in the channel cache.
pub const CACHE_SLOTS: usize = 8;

const DEFAULT_BLOCK_SIZE: usize = 1024;

// ── Configuration ───────────────────────────────────────────────────────────

/// Channel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoChannelOptions {
    /// Write to the device immediately instead of deferring to flush.
    pub writethrough: bool,
    /// When false every transfer bypasses the cache.
    pub cache_enabled: bool,
    /// Route every transfer through the bounce buffer.
    pub force_bounce: bool,
    /// Byte offset of the filesystem within the device.
    pub offset: u64,
}

impl Default for IoChannelOptions {
    fn default() -> Self {
        Self {
            writethrough: false,
            cache_enabled: true,
            force_bounce: false,
            offset: 0,
        }
    }
}

/// Byte counters, counted at the device boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

// ── Error handlers ──────────────────────────────────────────────────────────

/// What failed, handed to an [`IoErrorHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoErrorContext {
    pub block: BlockNumber,
    /// Block count as passed by the caller (negative means a byte length).
    pub count: i64,
    /// Requested transfer size in bytes.
    pub size: usize,
    /// Bytes moved before the failure.
    pub actual: usize,
}

/// Hooks consulted when a device transfer fails.
///
/// Returning `true` suppresses the error. The defaults never suppress.
/// Handlers are called without the channel lock held and may use the
/// channel themselves, for example to retry block by block.
pub trait IoErrorHandler: Send + Sync {
    /// `buf` is the failed part of the caller's buffer with the unread tail
    /// already zeroed. When the error is suppressed, cached reads keep
    /// whatever the handler left in `buf`.
    fn read_error(&self, ctx: &IoErrorContext, buf: &mut [u8], err: &E2Error) -> bool {
        let _ = (ctx, buf, err);
        false
    }

    /// `data` is what could not be written. During a flush the return value
    /// is ignored and the slot has already been recycled.
    fn write_error(&self, ctx: &IoErrorContext, data: &[u8], err: &E2Error) -> bool {
        let _ = (ctx, data, err);
        false
    }
}

// ── Option parsing ──────────────────────────────────────────────────────────

/// Parse an unsigned integer with C radix prefixes: `0x` hex, a leading `0`
/// octal, decimal otherwise. Empty input or trailing characters are rejected.
pub fn parse_c_ulong(text: &str) -> Result<u64> {
    let invalid = || E2Error::InvalidArgument(format!("not an unsigned integer: {text:?}"));
    let (digits, radix) = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        (hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        (&text[1..], 8)
    } else {
        (text, 10)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(invalid());
    }
    u64::from_str_radix(digits, radix).map_err(|_| invalid())
}

// ── Channel state ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Slot {
    buf: Vec<u8>,
    block: u64,
    access_time: u64,
    dirty: bool,
    in_use: bool,
    write_err: bool,
}

/// Outcome of a raw device transfer: bytes moved before a failure.
type Transfer = std::result::Result<(), (usize, E2Error)>;

/// A transfer that reached the device and failed there.
#[derive(Debug)]
struct DeviceFault {
    ctx: IoErrorContext,
    err: E2Error,
    /// The failed run belongs to a cached transfer.
    cached: bool,
}

/// Why a locked operation stopped. Device faults are handed to the error
/// handler once the lock is gone.
#[derive(Debug)]
enum Fault {
    Refused(E2Error),
    Read(DeviceFault),
    Write(DeviceFault),
}

impl From<E2Error> for Fault {
    fn from(err: E2Error) -> Self {
        Self::Refused(err)
    }
}

impl Fault {
    fn into_error(self) -> E2Error {
        match self {
            Self::Refused(err) => err,
            Self::Read(fault) | Self::Write(fault) => fault.err,
        }
    }
}

type Op = std::result::Result<(), Fault>;

/// A dirty slot dropped during a flush, owed a `write_error` call.
#[derive(Debug)]
struct Recycled {
    ctx: IoErrorContext,
    data: Vec<u8>,
    err: E2Error,
}

/// Copy of a device error for a second recipient.
fn duplicate_device_error(err: &E2Error) -> E2Error {
    match err {
        E2Error::ShortWrite {
            block,
            expected,
            actual,
        } => E2Error::ShortWrite {
            block: *block,
            expected: *expected,
            actual: *actual,
        },
        E2Error::Io(io) => E2Error::Io(io.raw_os_error().map_or_else(
            || std::io::Error::new(io.kind(), io.to_string()),
            std::io::Error::from_raw_os_error,
        )),
        other => E2Error::Io(std::io::Error::other(other.to_string())),
    }
}

/// Block index, relative to `start`, just past the run described by `ctx`;
/// `None` when nothing of a `count`-block request is left.
fn resume_after(ctx: &IoErrorContext, start: u64, count: i64) -> Option<u64> {
    let run = u64::try_from(ctx.count).ok().filter(|&n| n > 0)?;
    let next = ctx.block.0.checked_sub(start)?.checked_add(run)?;
    let total = u64::try_from(count).ok()?;
    (next < total).then_some(next)
}

struct ChannelState {
    block_size: usize,
    align: usize,
    options: IoChannelOptions,
    access_time: u64,
    slots: Vec<Slot>,
    bounce: Vec<u8>,
    zero_buf: Vec<u8>,
    stats: IoStats,
    handler: Option<Arc<dyn IoErrorHandler>>,
    recycled: Vec<Recycled>,
}

fn transfer_size(count: i64, block_size: usize) -> Result<usize> {
    let overflow = || E2Error::InvalidArgument(format!("transfer of {count} blocks overflows"));
    if count < 0 {
        usize::try_from(count.unsigned_abs()).map_err(|_| overflow())
    } else {
        usize::try_from(count)
            .ok()
            .and_then(|n| n.checked_mul(block_size))
            .ok_or_else(overflow)
    }
}

fn read_direct(dev: &dyn ByteDevice, block: u64, location: u64, buf: &mut [u8]) -> Transfer {
    match dev.read_at(location, buf) {
        Ok(n) if n == buf.len() => Ok(()),
        Ok(n) => Err((
            n,
            E2Error::ShortRead {
                block,
                expected: buf.len(),
                actual: n,
            },
        )),
        Err(err) => Err((0, err)),
    }
}

fn write_direct(dev: &dyn ByteDevice, block: u64, location: u64, data: &[u8]) -> Transfer {
    match dev.write_at(location, data) {
        Ok(n) if n == data.len() => Ok(()),
        Ok(n) => Err((
            n,
            E2Error::ShortWrite {
                block,
                expected: data.len(),
                actual: n,
            },
        )),
        Err(err) => Err((0, err)),
    }
}

fn read_bounced(
    dev: &dyn ByteDevice,
    block: u64,
    location: u64,
    bounce: &mut [u8],
    buf: &mut [u8],
) -> Transfer {
    let align_size = bounce.len() as u64;
    let mut aligned = location - location % align_size;
    let mut skip = usize::try_from(location % align_size).unwrap_or(0);
    let mut done = 0;
    while done < buf.len() {
        match dev.read_at(aligned, bounce) {
            Ok(n) if n == bounce.len() => {}
            Ok(_) => {
                return Err((
                    done,
                    E2Error::ShortRead {
                        block,
                        expected: buf.len(),
                        actual: done,
                    },
                ));
            }
            Err(err) => return Err((done, err)),
        }
        let cpy = (bounce.len() - skip).min(buf.len() - done);
        buf[done..done + cpy].copy_from_slice(&bounce[skip..skip + cpy]);
        done += cpy;
        skip = 0;
        aligned += align_size;
    }
    Ok(())
}

/// Partial aligned units are read-modify-write; a short read of the unit
/// pads it with zeros.
fn write_bounced(
    dev: &dyn ByteDevice,
    block: u64,
    location: u64,
    bounce: &mut [u8],
    data: &[u8],
) -> Transfer {
    let align_size = bounce.len() as u64;
    let mut aligned = location - location % align_size;
    let mut skip = usize::try_from(location % align_size).unwrap_or(0);
    let mut done = 0;
    while done < data.len() {
        let cpy = (bounce.len() - skip).min(data.len() - done);
        if cpy < bounce.len() {
            match dev.read_at(aligned, bounce) {
                Ok(n) => bounce[n..].fill(0),
                Err(err) => return Err((done, err)),
            }
        }
        bounce[skip..skip + cpy].copy_from_slice(&data[done..done + cpy]);
        match dev.write_at(aligned, bounce) {
            Ok(n) if n == bounce.len() => {}
            Ok(_) => {
                return Err((
                    done,
                    E2Error::ShortWrite {
                        block,
                        expected: data.len(),
                        actual: done,
                    },
                ));
            }
            Err(err) => return Err((done, err)),
        }
        done += cpy;
        skip = 0;
        aligned += align_size;
    }
    Ok(())
}

impl ChannelState {
    fn new(align: usize, options: IoChannelOptions) -> Self {
        let mut state = Self {
            block_size: DEFAULT_BLOCK_SIZE,
            align,
            options,
            access_time: 0,
            slots: Vec::new(),
            bounce: Vec::new(),
            zero_buf: Vec::new(),
            stats: IoStats::default(),
            handler: None,
            recycled: Vec::new(),
        };
        state.reallocate();
        state
    }

    /// Empty every slot and size buffers for the current block size.
    fn reallocate(&mut self) {
        self.slots = (0..CACHE_SLOTS)
            .map(|_| Slot {
                buf: vec![0_u8; self.block_size],
                ..Slot::default()
            })
            .collect();
        self.bounce = vec![0_u8; self.align_size()];
        self.zero_buf = Vec::new();
        self.access_time = 0;
    }

    /// Unit of a bounced transfer.
    fn align_size(&self) -> usize {
        let align = self.align.max(1);
        if self.block_size > align && self.block_size % align == 0 {
            self.block_size
        } else {
            align
        }
    }

    fn is_direct(&self, addr: usize, location: u64, size: usize) -> bool {
        if self.options.force_bounce {
            return false;
        }
        let align = self.align;
        align <= 1
            || (addr % align == 0 && location % align as u64 == 0 && size % align == 0)
    }

    fn location(&self, block: u64) -> Result<u64> {
        block
            .checked_mul(self.block_size as u64)
            .and_then(|byte| byte.checked_add(self.options.offset))
            .ok_or(E2Error::LlseekFailed)
    }

    fn bypasses_cache(&self, count: i64) -> bool {
        !self.options.cache_enabled
            || !usize::try_from(count).is_ok_and(|n| (1..=CACHE_SLOTS).contains(&n))
    }

    fn checked_len(have: usize, need: usize) -> Result<()> {
        if have < need {
            return Err(E2Error::InvalidArgument(format!(
                "buffer of {have} bytes cannot hold a {need}-byte transfer"
            )));
        }
        Ok(())
    }

    // ── Raw device access ───────────────────────────────────────────────────

    fn raw_read(&mut self, dev: &dyn ByteDevice, block: u64, count: i64, buf: &mut [u8]) -> Op {
        let size = transfer_size(count, self.block_size)?;
        Self::checked_len(buf.len(), size)?;
        let buf = &mut buf[..size];
        self.stats.bytes_read += size as u64;
        let location = self.location(block)?;

        let outcome = if self.is_direct(buf.as_ptr().addr(), location, size) {
            read_direct(dev, block, location, buf)
        } else {
            let align_size = self.align_size();
            read_bounced(dev, block, location, &mut self.bounce[..align_size], buf)
        };
        let Err((actual, err)) = outcome else {
            return Ok(());
        };

        buf[actual.min(size)..].fill(0);
        Err(Fault::Read(DeviceFault {
            ctx: IoErrorContext {
                block: BlockNumber(block),
                count,
                size,
                actual,
            },
            err,
            cached: false,
        }))
    }

    fn raw_write(&mut self, dev: &dyn ByteDevice, block: u64, count: i64, data: &[u8]) -> Op {
        let size = transfer_size(count, self.block_size)?;
        Self::checked_len(data.len(), size)?;
        let data = &data[..size];
        self.stats.bytes_written += size as u64;
        let location = self.location(block)?;

        let outcome = if self.is_direct(data.as_ptr().addr(), location, size) {
            write_direct(dev, block, location, data)
        } else {
            let align_size = self.align_size();
            write_bounced(dev, block, location, &mut self.bounce[..align_size], data)
        };
        let Err((actual, err)) = outcome else {
            return Ok(());
        };
        Err(Fault::Write(DeviceFault {
            ctx: IoErrorContext {
                block: BlockNumber(block),
                count,
                size,
                actual,
            },
            err,
            cached: false,
        }))
    }

    // ── Slot management ─────────────────────────────────────────────────────

    fn lookup(&self, block: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.in_use && slot.block == block)
    }

    fn touch(&mut self, idx: usize) {
        self.access_time += 1;
        self.slots[idx].access_time = self.access_time;
    }

    /// First unused slot, else the least recently accessed one.
    fn victim(&self) -> usize {
        if let Some(idx) = self.slots.iter().position(|slot| !slot.in_use) {
            return idx;
        }
        self.slots
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.access_time)
            .map_or(0, |(idx, _)| idx)
    }

    /// Assign slot `idx` to `block`, writing back its dirty contents first.
    /// A failed write-back leaves the slot holding its old block.
    fn reuse_slot(&mut self, dev: &dyn ByteDevice, idx: usize, block: u64) -> Result<()> {
        let (old_block, dirty) = {
            let slot = &self.slots[idx];
            (slot.block, slot.in_use && slot.dirty)
        };
        if dirty {
            let buf = std::mem::take(&mut self.slots[idx].buf);
            let result = self.raw_write(dev, old_block, 1, &buf).map_err(Fault::into_error);
            self.slots[idx].buf = buf;
            if let Err(err) = result {
                self.slots[idx].write_err = true;
                warn!(
                    target: "e2fs::channel",
                    event = "evict_writeback_failed",
                    block = old_block,
                    wanted = block,
                    error = %err
                );
                return Err(err);
            }
        }
        self.access_time += 1;
        let slot = &mut self.slots[idx];
        slot.in_use = true;
        slot.dirty = false;
        slot.write_err = false;
        slot.block = block;
        slot.access_time = self.access_time;
        Ok(())
    }

    /// Write back every dirty slot; returns the first error. With a handler
    /// installed, failed slots are recycled and queued for it.
    fn flush_slots(&mut self, dev: &dyn ByteDevice, invalidate: bool) -> Result<()> {
        let mut failures: Vec<(usize, E2Error)> = Vec::new();
        for idx in 0..self.slots.len() {
            if !self.slots[idx].in_use {
                continue;
            }
            if !self.slots[idx].dirty {
                if invalidate {
                    self.slots[idx].in_use = false;
                }
                continue;
            }
            let block = self.slots[idx].block;
            let buf = std::mem::take(&mut self.slots[idx].buf);
            let result = self.raw_write(dev, block, 1, &buf).map_err(Fault::into_error);
            let slot = &mut self.slots[idx];
            slot.buf = buf;
            match result {
                Ok(()) => {
                    slot.dirty = false;
                    slot.write_err = false;
                    if invalidate {
                        slot.in_use = false;
                    }
                }
                Err(err) => {
                    slot.write_err = true;
                    warn!(target: "e2fs::channel", event = "flush_writeback_failed", block, error = %err);
                    failures.push((idx, err));
                }
            }
        }

        let mut failures = failures.into_iter();
        let first = failures.next();
        if self.handler.is_some() {
            let size = self.block_size;
            let owed = first
                .iter()
                .map(|(idx, err)| (*idx, duplicate_device_error(err)))
                .chain(failures);
            for (idx, err) in owed {
                let slot = &mut self.slots[idx];
                slot.in_use = false;
                slot.dirty = false;
                slot.write_err = false;
                let ctx = IoErrorContext {
                    block: BlockNumber(slot.block),
                    count: 1,
                    size,
                    actual: 0,
                };
                let data = slot.buf.clone();
                self.recycled.push(Recycled { ctx, data, err });
            }
        }
        first.map_or(Ok(()), |(_, err)| Err(err))
    }

    // ── Cached transfers ────────────────────────────────────────────────────

    fn read_blocks(&mut self, dev: &dyn ByteDevice, block: u64, count: i64, buf: &mut [u8]) -> Op {
        if self.bypasses_cache(count) {
            debug!(target: "e2fs::channel", event = "cache_bypass_read", block, count);
            self.flush_slots(dev, false)?;
            return self.raw_read(dev, block, count, buf);
        }
        let bs = self.block_size;
        let count = usize::try_from(count).unwrap_or(0);
        Self::checked_len(buf.len(), count * bs)?;

        let mut i = 0;
        while i < count {
            let blk = block + i as u64;
            if let Some(idx) = self.lookup(blk) {
                trace!(target: "e2fs::channel", event = "cache_hit", block = blk);
                self.touch(idx);
                buf[i * bs..(i + 1) * bs].copy_from_slice(&self.slots[idx].buf);
                i += 1;
                continue;
            }
            let mut run = 1;
            while i + run < count && self.lookup(blk + run as u64).is_none() {
                run += 1;
            }
            let run_count = i64::try_from(run).unwrap_or(1);
            self.raw_read(dev, blk, run_count, &mut buf[i * bs..(i + run) * bs])
                .map_err(|fault| match fault {
                    Fault::Read(fault) => Fault::Read(DeviceFault { cached: true, ..fault }),
                    other => other,
                })?;
            self.install(dev, blk, &buf[i * bs..(i + run) * bs])?;
            i += run;
        }
        Ok(())
    }

    /// Put freshly read blocks starting at `block` into clean slots.
    fn install(&mut self, dev: &dyn ByteDevice, block: u64, data: &[u8]) -> Result<()> {
        let bs = self.block_size;
        for (j, chunk) in data.chunks_exact(bs).enumerate() {
            let blk = block + j as u64;
            let idx = match self.lookup(blk) {
                Some(idx) => {
                    self.touch(idx);
                    idx
                }
                None => {
                    let idx = self.victim();
                    self.reuse_slot(dev, idx, blk)?;
                    idx
                }
            };
            self.slots[idx].buf.copy_from_slice(chunk);
        }
        Ok(())
    }

    /// Forget that `count` blocks from `block` still owe a device write.
    fn mark_clean(&mut self, block: u64, count: u64) {
        for slot in &mut self.slots {
            if slot.in_use && (block..block.saturating_add(count)).contains(&slot.block) {
                slot.dirty = false;
                slot.write_err = false;
            }
        }
    }

    fn write_blocks(&mut self, dev: &dyn ByteDevice, block: u64, count: i64, data: &[u8]) -> Op {
        if self.bypasses_cache(count) {
            debug!(target: "e2fs::channel", event = "cache_bypass_write", block, count);
            self.flush_slots(dev, true)?;
            return self.raw_write(dev, block, count, data);
        }
        let bs = self.block_size;
        let n = usize::try_from(count).unwrap_or(0);
        Self::checked_len(data.len(), n * bs)?;

        let writethrough = self.options.writethrough;
        let device_result = if writethrough {
            self.raw_write(dev, block, count, &data[..n * bs])
                .map_err(|fault| match fault {
                    Fault::Write(fault) => Fault::Write(DeviceFault { cached: true, ..fault }),
                    other => other,
                })
        } else {
            Ok(())
        };
        let dirty = !writethrough || device_result.is_err();

        for i in 0..n {
            let blk = block + i as u64;
            let idx = if let Some(idx) = self.lookup(blk) {
                self.touch(idx);
                idx
            } else {
                let idx = self.victim();
                self.reuse_slot(dev, idx, blk)?;
                idx
            };
            let slot = &mut self.slots[idx];
            slot.buf.copy_from_slice(&data[i * bs..(i + 1) * bs]);
            slot.dirty = dirty;
        }
        device_result
    }

    fn zero_blocks(&mut self, dev: &dyn ByteDevice, block: u64, count: u64) -> Op {
        let bs = self.block_size;
        if self.zero_buf.len() < CACHE_SLOTS * bs {
            self.zero_buf = vec![0_u8; CACHE_SLOTS * bs];
        }
        let mut done = 0_u64;
        while done < count {
            let stride = (count - done).min(CACHE_SLOTS as u64);
            let len = usize::try_from(stride).unwrap_or(CACHE_SLOTS) * bs;
            let zeros = std::mem::take(&mut self.zero_buf);
            let result = self.write_blocks(dev, block + done, i64::try_from(stride).unwrap_or(1), &zeros[..len]);
            self.zero_buf = zeros;
            result?;
            done += stride;
        }
        Ok(())
    }
}

// ── Public channel ──────────────────────────────────────────────────────────

/// Block I/O channel over a [`ByteDevice`].
///
/// All state sits behind one mutex, so a channel can be shared between
/// threads; transfers are serialized.
pub struct IoChannel {
    device: Arc<dyn ByteDevice>,
    state: Mutex<ChannelState>,
}

impl std::fmt::Debug for IoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("IoChannel")
            .field("block_size", &state.block_size)
            .field("align", &state.align)
            .field("options", &state.options)
            .field("stats", &state.stats)
            .finish_non_exhaustive()
    }
}

impl IoChannel {
    /// Open a channel with a 1024-byte block size.
    #[must_use]
    pub fn open(device: Arc<dyn ByteDevice>, options: IoChannelOptions) -> Self {
        let align = device.alignment();
        debug!(target: "e2fs::channel", event = "open", align, len = device.len_bytes());
        Self {
            device,
            state: Mutex::new(ChannelState::new(align, options)),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn ByteDevice> {
        &self.device
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        u32::try_from(self.state.lock().block_size).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn options(&self) -> IoChannelOptions {
        self.state.lock().options
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.device.is_read_only()
    }

    #[must_use]
    pub fn stats(&self) -> IoStats {
        self.state.lock().stats
    }

    pub fn set_error_handler(&self, handler: Option<Arc<dyn IoErrorHandler>>) {
        self.state.lock().handler = handler;
    }

    fn handler(&self) -> Option<Arc<dyn IoErrorHandler>> {
        self.state.lock().handler.clone()
    }

    /// Run `op` under the state lock, then hand slots recycled by a flush
    /// to the error handler with the lock released.
    fn locked<T>(&self, op: impl FnOnce(&mut ChannelState, &dyn ByteDevice) -> T) -> T {
        let (out, handler, recycled) = {
            let mut state = self.state.lock();
            let out = op(&mut state, &*self.device);
            let recycled = std::mem::take(&mut state.recycled);
            (out, state.handler.clone(), recycled)
        };
        if let Some(handler) = handler {
            for owed in &recycled {
                handler.write_error(&owed.ctx, &owed.data, &owed.err);
            }
        }
        out
    }

    /// Offer a failed device write to the handler; `Ok` when it suppresses
    /// the error. Suppressed write-through blocks count as written.
    fn offer_write(&self, fault: DeviceFault, data: &[u8]) -> Result<()> {
        let Some(handler) = self.handler() else {
            return Err(fault.err);
        };
        if !handler.write_error(&fault.ctx, data, &fault.err) {
            return Err(fault.err);
        }
        let block = fault.ctx.block.0;
        debug!(target: "e2fs::channel", event = "write_error_suppressed", block, size = fault.ctx.size);
        if fault.cached {
            let count = u64::try_from(fault.ctx.count).unwrap_or(0);
            self.state.lock().mark_clean(block, count);
        }
        Ok(())
    }

    /// Flush with invalidation, then resize the cache and bounce buffer.
    pub fn set_block_size(&self, size: u32) -> Result<()> {
        let size = usize::try_from(size)
            .ok()
            .filter(|&s| s > 0)
            .ok_or_else(|| E2Error::InvalidArgument(format!("block size {size}")))?;
        self.locked(|state, dev| -> Result<()> {
            state.flush_slots(dev, true)?;
            state.block_size = size;
            state.reallocate();
            Ok(())
        })?;
        debug!(target: "e2fs::channel", event = "set_block_size", block_size = size);
        Ok(())
    }

    /// Read `count` blocks starting at `block` into `buf`; a negative
    /// `count` is a byte length.
    ///
    /// A failure the handler suppresses keeps the handler's bytes for the
    /// failed run and carries on with the rest of the request.
    pub fn read_blocks(&self, block: BlockNumber, count: i64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0_u64;
        loop {
            let rest = count.saturating_sub(i64::try_from(done).unwrap_or(i64::MAX));
            let (bs, outcome) = self.locked(|state, dev| {
                let bs = state.block_size;
                let at = usize::try_from(done)
                    .map_or(buf.len(), |d| d.saturating_mul(bs))
                    .min(buf.len());
                (bs, state.read_blocks(dev, block.0 + done, rest, &mut buf[at..]))
            });
            let fault = match outcome {
                Ok(()) => return Ok(()),
                Err(Fault::Read(fault)) => fault,
                Err(other) => return Err(other.into_error()),
            };
            let Some(handler) = self.handler() else {
                return Err(fault.err);
            };
            let rel = usize::try_from(fault.ctx.block.0.saturating_sub(block.0)).unwrap_or(usize::MAX);
            let at = rel.saturating_mul(bs).min(buf.len());
            let end = at.saturating_add(fault.ctx.size).min(buf.len());
            if !handler.read_error(&fault.ctx, &mut buf[at..end], &fault.err) {
                return Err(fault.err);
            }
            debug!(
                target: "e2fs::channel",
                event = "read_error_suppressed",
                block = fault.ctx.block.0,
                size = fault.ctx.size
            );
            if fault.cached {
                let patched = &buf[at..end];
                self.locked(|state, dev| state.install(dev, fault.ctx.block.0, patched))?;
            }
            match resume_after(&fault.ctx, block.0, count) {
                Some(next) => done = next,
                None => return Ok(()),
            }
        }
    }

    /// Read one block into a fresh buffer.
    pub fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; self.state.lock().block_size];
        self.read_blocks(block, 1, &mut buf)?;
        Ok(buf)
    }

    pub fn write_blocks(&self, block: BlockNumber, count: i64, data: &[u8]) -> Result<()> {
        match self.locked(|state, dev| state.write_blocks(dev, block.0, count, data)) {
            Ok(()) => Ok(()),
            Err(Fault::Write(fault)) => {
                let size = fault.ctx.size.min(data.len());
                self.offer_write(fault, &data[..size])
            }
            Err(other) => Err(other.into_error()),
        }
    }

    pub fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.write_blocks(block, 1, data)
    }

    /// Write back every dirty block, then sync the device.
    pub fn flush(&self) -> Result<()> {
        self.locked(|state, dev| state.flush_slots(dev, false))?;
        self.device.sync()
    }

    /// Flush and release the channel.
    pub fn close(self) -> Result<()> {
        let result = self.flush();
        debug!(target: "e2fs::channel", event = "close", ok = result.is_ok());
        result
    }

    /// Write raw bytes at a byte offset relative to the filesystem start.
    /// Unsupported on devices that need aligned transfers.
    pub fn write_byte(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.locked(|state, dev| {
            if state.align != 0 {
                return Err(E2Error::Unimplemented);
            }
            state.flush_slots(dev, true)?;
            let location = offset
                .checked_add(state.options.offset)
                .ok_or(E2Error::LlseekFailed)?;
            let written = dev.write_at(location, data)?;
            if written != data.len() {
                return Err(E2Error::ShortWrite {
                    block: offset / state.block_size as u64,
                    expected: data.len(),
                    actual: written,
                });
            }
            Ok(())
        })
    }

    /// String-keyed options: `offset` (C-style unsigned integer) and
    /// `cache` (`on` or `off`).
    pub fn set_option(&self, name: &str, value: Option<&str>) -> Result<()> {
        let Some(value) = value else {
            return Err(E2Error::InvalidArgument(format!("option {name} needs a value")));
        };
        self.locked(|state, dev| match name {
            "offset" => {
                state.options.offset = parse_c_ulong(value)?;
                Ok(())
            }
            "cache" => match value {
                "on" => {
                    state.options.cache_enabled = true;
                    Ok(())
                }
                "off" => {
                    let result = state.flush_slots(dev, false);
                    state.options.cache_enabled = false;
                    result
                }
                _ => Err(E2Error::InvalidArgument(format!("cache={value}"))),
            },
            _ => Err(E2Error::InvalidArgument(format!("unknown option {name}"))),
        })
    }

    /// Write zeros over `count` blocks through the cache.
    pub fn zero_blocks(&self, block: BlockNumber, count: u64) -> Result<()> {
        let total = i64::try_from(count).unwrap_or(i64::MAX);
        let mut done = 0_u64;
        while done < count {
            let outcome = self.locked(|state, dev| state.zero_blocks(dev, block.0 + done, count - done));
            let fault = match outcome {
                Ok(()) => return Ok(()),
                Err(Fault::Write(fault)) => fault,
                Err(other) => return Err(other.into_error()),
            };
            let next = resume_after(&fault.ctx, block.0, total);
            let zeros = vec![0_u8; fault.ctx.size];
            self.offer_write(fault, &zeros)?;
            match next {
                Some(next) => done = next,
                None => return Ok(()),
            }
        }
        Ok(())
    }

    pub fn discard(&self, _block: BlockNumber, _count: u64) -> Result<()> {
        Err(E2Error::Unimplemented)
    }

    pub fn zeroout(&self, _block: BlockNumber, _count: u64) -> Result<()> {
        Err(E2Error::Unimplemented)
    }

    pub fn cache_readahead(&self, _block: BlockNumber, _count: u64) -> Result<()> {
        Err(E2Error::OpNotSupported)
    }

    /// Blocks currently held by in-use slots, in slot order.
    #[must_use]
    pub fn cached_blocks(&self) -> Vec<BlockNumber> {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.in_use)
            .map(|slot| BlockNumber(slot.block))
            .collect()
    }

    /// Blocks with unwritten data.
    #[must_use]
    pub fn dirty_blocks(&self) -> Vec<BlockNumber> {
        let mut blocks: Vec<BlockNumber> = self
            .state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.in_use && slot.dirty)
            .map(|slot| BlockNumber(slot.block))
            .collect();
        blocks.sort_unstable();
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FaultKind, MemoryByteDevice};

    fn channel(dev: &Arc<MemoryByteDevice>, options: IoChannelOptions) -> IoChannel {
        let device: Arc<dyn ByteDevice> = dev.clone();
        IoChannel::open(device, options)
    }

    #[test]
    fn parse_c_ulong_follows_radix_prefixes() {
        assert_eq!(parse_c_ulong("1024").expect("dec"), 1024);
        assert_eq!(parse_c_ulong("0x400").expect("hex"), 1024);
        assert_eq!(parse_c_ulong("02000").expect("oct"), 1024);
        assert_eq!(parse_c_ulong("0").expect("zero"), 0);
        for bad in ["", "0x", "12k", "089", "-1", " 1"] {
            assert!(
                matches!(parse_c_ulong(bad), Err(E2Error::InvalidArgument(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn align_size_prefers_block_size_when_it_is_a_multiple() {
        let mut state = ChannelState::new(512, IoChannelOptions::default());
        assert_eq!(state.align_size(), 1024);
        state.align = 4096;
        assert_eq!(state.align_size(), 4096);
        state.align = 0;
        assert_eq!(state.align_size(), 1024);
        state.align = 768;
        assert_eq!(state.align_size(), 768);
    }

    #[test]
    fn victim_is_first_unused_then_least_recent() {
        let dev = Arc::new(MemoryByteDevice::new(64 * 1024));
        let ch = channel(&dev, IoChannelOptions::default());
        let mut buf = vec![0_u8; 1024];
        for blk in 0..8 {
            ch.read_blocks(BlockNumber(blk), 1, &mut buf).expect("read");
        }
        ch.read_blocks(BlockNumber(0), 1, &mut buf).expect("hit");
        ch.read_blocks(BlockNumber(8), 1, &mut buf).expect("evict");
        let cached = ch.cached_blocks();
        assert!(cached.contains(&BlockNumber(0)));
        assert!(!cached.contains(&BlockNumber(1)));
        assert!(cached.contains(&BlockNumber(8)));
    }

    #[test]
    fn failed_eviction_keeps_the_old_block() {
        let dev = Arc::new(MemoryByteDevice::new(64 * 1024));
        let ch = channel(&dev, IoChannelOptions::default());
        for blk in 0..8_u8 {
            ch.write_blocks(BlockNumber(u64::from(blk)), 1, &[blk + 1; 1024])
                .expect("write");
        }
        dev.inject_write_fault(0..1024, FaultKind::Fail);
        let err = ch
            .write_blocks(BlockNumber(20), 1, &[0xAA; 1024])
            .expect_err("eviction of block 0 fails");
        assert!(matches!(err, E2Error::Io(_)));
        assert!(ch.cached_blocks().contains(&BlockNumber(0)));
        assert!(!ch.cached_blocks().contains(&BlockNumber(20)));

        dev.clear_faults();
        ch.flush().expect("retry succeeds");
        let image = dev.snapshot();
        assert_eq!(&image[..1024], &[1_u8; 1024][..]);
        assert_eq!(&image[7 * 1024..8 * 1024], &[8_u8; 1024][..]);
    }

    #[test]
    fn zero_length_and_oversized_counts_bypass() {
        let dev = Arc::new(MemoryByteDevice::new(64 * 1024));
        let ch = channel(&dev, IoChannelOptions::default());
        let mut buf = vec![0_u8; 9 * 1024];
        ch.read_blocks(BlockNumber(0), 9, &mut buf).expect("bypass read");
        assert!(ch.cached_blocks().is_empty());
        ch.read_blocks(BlockNumber(0), 0, &mut buf).expect("empty read");
        assert!(ch.cached_blocks().is_empty());
        ch.read_blocks(BlockNumber(1), -10, &mut buf).expect("byte read");
        assert_eq!(ch.stats().bytes_read, 9 * 1024 + 10);
    }

    #[test]
    fn unsupported_operations_report_their_kind() {
        let dev = Arc::new(MemoryByteDevice::new(4096));
        let ch = channel(&dev, IoChannelOptions::default());
        assert!(matches!(ch.discard(BlockNumber(0), 1), Err(E2Error::Unimplemented)));
        assert!(matches!(ch.zeroout(BlockNumber(0), 1), Err(E2Error::Unimplemented)));
        assert!(matches!(
            ch.cache_readahead(BlockNumber(0), 1),
            Err(E2Error::OpNotSupported)
        ));
    }
}
