//! Mounting: argument check, root vnode acquisition and the [`FsOps`]
//! implementation over an open volume.

use crate::fs::{Ext2Fs, OpenOptions, now_secs};
use crate::ops::{DirEntry, FileType, FsOps, InodeAttr, StatFs};
use e2_block::ByteDevice;
use e2_error::{E2Error, Result};
use e2_types::InodeNumber;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Value [`MountArgs::magic`] must carry.
pub const EXT2_ARGS_MAGIC: u32 = 0x7afc_d982;

/// Arguments handed over by the mount helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountArgs {
    pub magic: u32,
    pub readonly: bool,
}

impl Default for MountArgs {
    fn default() -> Self {
        Self {
            magic: EXT2_ARGS_MAGIC,
            readonly: false,
        }
    }
}

// ── Vnodes and the root slot ────────────────────────────────────────────────

/// An in-memory handle on one inode, shared by every holder.
#[derive(Debug)]
pub struct Vnode {
    ino: InodeNumber,
    attr: InodeAttr,
}

impl Vnode {
    #[must_use]
    pub fn new(ino: InodeNumber, attr: InodeAttr) -> Self {
        Self { ino, attr }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    /// Attributes as of materialization.
    #[must_use]
    pub fn attr(&self) -> &InodeAttr {
        &self.attr
    }
}

#[derive(Debug)]
enum RootState {
    Empty,
    Attaching,
    /// Weak so that a root nobody holds can be reclaimed.
    Ready(Weak<Vnode>),
}

/// Single-instance slot for the root vnode.
///
/// The first caller to find the slot empty materializes the root outside
/// the lock while later callers wait. Every waiter re-checks from the top
/// after waking, since the root may have been detached or reclaimed in
/// between.
#[derive(Debug)]
pub struct RootSlot {
    state: Mutex<RootState>,
    attached: Condvar,
}

impl Default for RootSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Resets an unfinished attach to `Empty` and wakes waiters.
struct AttachGuard<'a> {
    slot: &'a RootSlot,
    armed: bool,
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.slot.state.lock() = RootState::Empty;
            self.slot.attached.notify_all();
        }
    }
}

impl RootSlot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RootState::Empty),
            attached: Condvar::new(),
        }
    }

    /// Return the root vnode, materializing it with `make` if the slot is
    /// empty. A failed `make` leaves the slot empty.
    pub fn acquire<F>(&self, make: F) -> Result<Arc<Vnode>>
    where
        F: FnOnce() -> Result<Vnode>,
    {
        let mut make = Some(make);
        loop {
            let mut state = self.state.lock();
            if matches!(*state, RootState::Attaching) {
                self.attached.wait(&mut state);
                continue;
            }
            if let RootState::Ready(weak) = &*state {
                if let Some(vnode) = weak.upgrade() {
                    return Ok(vnode);
                }
                debug!(target: "e2fs::mount", event = "root_reclaimed");
                *state = RootState::Empty;
                continue;
            }

            *state = RootState::Attaching;
            drop(state);
            let mut guard = AttachGuard {
                slot: self,
                armed: true,
            };
            let build = make
                .take()
                .ok_or_else(|| E2Error::InvalidArgument("root constructor already used".to_owned()))?;
            let vnode = Arc::new(build()?);
            guard.armed = false;
            *self.state.lock() = RootState::Ready(Arc::downgrade(&vnode));
            self.attached.notify_all();
            debug!(target: "e2fs::mount", event = "root_attached", ino = vnode.ino().0);
            return Ok(vnode);
        }
    }

    /// Forget the current root. Holders keep their handles; the next
    /// acquire materializes a fresh one.
    pub fn detach_root(&self) {
        let mut state = self.state.lock();
        if matches!(*state, RootState::Ready(_)) {
            *state = RootState::Empty;
            debug!(target: "e2fs::mount", event = "root_detached");
        }
    }

    /// Whether a live root vnode is attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        matches!(&*self.state.lock(), RootState::Ready(weak) if weak.strong_count() > 0)
    }
}

// ── Mount ───────────────────────────────────────────────────────────────────

/// A mounted volume.
///
/// Fields drop in declaration order, the reverse of acquisition: the root
/// slot first, then the engine and its device.
#[derive(Debug)]
pub struct Mount {
    root: RootSlot,
    fs: Ext2Fs,
    args: MountArgs,
}

impl Mount {
    /// Check `args`, open the volume and count the mount.
    ///
    /// A bad magic fails with `InvalidArgument` before the device is
    /// touched. Any later failure releases everything acquired so far.
    pub fn mount(device: Arc<dyn ByteDevice>, args: &MountArgs) -> Result<Self> {
        if args.magic != EXT2_ARGS_MAGIC {
            return Err(E2Error::InvalidArgument(format!(
                "bad mount magic number: {:#x}",
                args.magic
            )));
        }
        let options = OpenOptions {
            read_only: args.readonly,
            ..OpenOptions::default()
        };
        let fs = Ext2Fs::open(device, &options)?;
        if !fs.is_read_only() {
            {
                let mut meta = fs.meta.lock();
                meta.sb.mnt_count = meta.sb.mnt_count.wrapping_add(1);
                meta.sb.mtime = now_secs();
                meta.sb_dirty = true;
            }
            fs.flush()?;
        }
        info!(
            target: "e2fs::mount",
            event = "mounted",
            read_only = fs.is_read_only(),
            block_size = fs.block_size()
        );
        Ok(Self {
            root: RootSlot::new(),
            fs,
            args: *args,
        })
    }

    /// Detach the root, write everything back and release the device.
    pub fn unmount(self) -> Result<()> {
        self.root.detach_root();
        let Self { root, fs, .. } = self;
        drop(root);
        fs.close()?;
        info!(target: "e2fs::mount", event = "unmounted");
        Ok(())
    }

    #[must_use]
    pub fn fs(&self) -> &Ext2Fs {
        &self.fs
    }

    #[must_use]
    pub fn args(&self) -> MountArgs {
        self.args
    }

    #[must_use]
    pub fn root_slot(&self) -> &RootSlot {
        &self.root
    }

    fn writable(&self) -> Result<()> {
        if self.fs.is_read_only() {
            return Err(E2Error::Os(libc::EROFS));
        }
        Ok(())
    }

    fn lookup_attr(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr> {
        let child = self
            .fs
            .lookup(parent, name.as_encoded_bytes())?
            .ok_or_else(|| E2Error::FileNotFound(name.to_string_lossy().into_owned()))?;
        self.fs.inode_attr(child)
    }
}

impl FsOps for Mount {
    fn root(&self) -> Result<Arc<Vnode>> {
        let vnode = self.root.acquire(|| {
            let attr = self.fs.inode_attr(InodeNumber::ROOT)?;
            if attr.kind != FileType::Directory {
                return Err(E2Error::NoDirectory);
            }
            Ok(Vnode::new(InodeNumber::ROOT, attr))
        });
        self.fs.report(vnode, InodeNumber::ROOT)
    }

    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        self.fs.report(self.fs.inode_attr(ino), ino)
    }

    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr> {
        self.fs.report(self.lookup_attr(parent, name), parent)
    }

    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        self.fs.report(self.fs.readdir_from(ino, offset), ino)
    }

    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>> {
        let len = usize::try_from(size).unwrap_or(usize::MAX);
        self.fs.report(self.fs.read_file(ino, offset, len), ino)
    }

    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        self.fs.report(self.fs.readlink(ino), ino)
    }

    fn statfs(&self) -> Result<StatFs> {
        Ok(self.fs.statfs())
    }

    fn sync(&self) -> Result<()> {
        self.fs.report(self.fs.flush(), InodeNumber(0))
    }

    fn mkdir(&self, parent: InodeNumber, name: &OsStr, mode: u16) -> Result<InodeAttr> {
        self.writable()?;
        let made = self
            .fs
            .mkdir(parent, name.as_encoded_bytes(), mode)
            .and_then(|ino| self.fs.inode_attr(ino));
        self.fs.report(made, parent)
    }

    fn unlink(&self, parent: InodeNumber, name: &OsStr) -> Result<()> {
        self.writable()?;
        self.fs.report(self.fs.unlink(parent, name.as_encoded_bytes()), parent)
    }

    fn getxattr(&self, ino: InodeNumber, name: &str) -> Result<Vec<u8>> {
        self.fs.report(self.fs.xattr_get(ino, name), ino)
    }

    fn listxattr(&self, ino: InodeNumber) -> Result<Vec<String>> {
        self.fs.report(self.fs.xattr_list(ino), ino)
    }

    fn setxattr(&self, ino: InodeNumber, name: &str, value: &[u8]) -> Result<()> {
        self.writable()?;
        self.fs.report(self.fs.xattr_set(ino, name, value), ino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FormatOptions;
    use crate::testutil::{formatted, regular_file};
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fake_root() -> Vnode {
        let attr = InodeAttr {
            ino: InodeNumber::ROOT,
            size: 0,
            blocks: 0,
            atime: std::time::UNIX_EPOCH,
            mtime: std::time::UNIX_EPOCH,
            ctime: std::time::UNIX_EPOCH,
            crtime: std::time::UNIX_EPOCH,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 1024,
        };
        Vnode::new(InodeNumber::ROOT, attr)
    }

    #[test]
    fn concurrent_acquire_materializes_once() {
        let slot = RootSlot::new();
        let made = AtomicU32::new(0);
        let barrier = Barrier::new(8);
        let roots: Vec<Arc<Vnode>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        slot.acquire(|| {
                            made.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            Ok(fake_root())
                        })
                        .expect("acquire")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("join")).collect()
        });
        assert_eq!(made.load(Ordering::SeqCst), 1);
        assert!(roots.iter().all(|r| Arc::ptr_eq(r, &roots[0])));
    }

    #[test]
    fn failed_attach_leaves_slot_empty() {
        let slot = RootSlot::new();
        assert!(matches!(
            slot.acquire(|| Err(E2Error::NoDirectory)),
            Err(E2Error::NoDirectory)
        ));
        assert!(!slot.is_attached());
        let root = slot.acquire(|| Ok(fake_root())).expect("retry");
        assert_eq!(root.ino(), InodeNumber::ROOT);
        assert!(slot.is_attached());
    }

    #[test]
    fn detached_or_reclaimed_roots_are_rebuilt() {
        let slot = RootSlot::new();
        let made = AtomicU32::new(0);
        let make = || {
            made.fetch_add(1, Ordering::SeqCst);
            Ok(fake_root())
        };
        let first = slot.acquire(make).expect("first");
        let again = slot.acquire(make).expect("again");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(made.load(Ordering::SeqCst), 1);

        slot.detach_root();
        let fresh = slot.acquire(make).expect("after detach");
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(made.load(Ordering::SeqCst), 2);

        drop((first, again, fresh));
        assert!(!slot.is_attached());
        slot.acquire(make).expect("after reclaim");
        assert_eq!(made.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn bad_magic_is_rejected_before_open() {
        let dev = formatted(&FormatOptions::default(), 1024 * 1024);
        dev.reset_counters();
        let before = Arc::strong_count(&dev);
        let args = MountArgs {
            magic: 0xdead_beef,
            readonly: false,
        };
        assert!(matches!(Mount::mount(dev.clone(), &args), Err(E2Error::InvalidArgument(_))));
        assert_eq!(Arc::strong_count(&dev), before);
        assert_eq!(dev.read_calls(), 0);
    }

    #[test]
    fn mount_counts_and_unmount_persists() {
        let dev = formatted(&FormatOptions::default(), 1024 * 1024);
        let mount = Mount::mount(dev.clone(), &MountArgs::default()).expect("mount");
        assert_eq!(mount.fs().superblock().mnt_count, 1);
        mount.unmount().expect("unmount");

        let mount = Mount::mount(dev.clone(), &MountArgs::default()).expect("remount");
        assert_eq!(mount.fs().superblock().mnt_count, 2);
    }

    #[test]
    fn read_only_mount_refuses_writes_without_logging() {
        let dev = formatted(&FormatOptions::default(), 1024 * 1024);
        let args = MountArgs {
            readonly: true,
            ..MountArgs::default()
        };
        let mount = Mount::mount(dev.clone(), &args).expect("mount");
        assert_eq!(mount.fs().superblock().mnt_count, 0);
        let err = mount
            .mkdir(InodeNumber::ROOT, OsStr::new("d"), 0o755)
            .expect_err("read-only");
        assert_eq!(err.to_errno(), libc::EROFS);
        assert_eq!(mount.fs().superblock().error_count, 0);
    }

    #[test]
    fn ops_surface_over_a_mount() {
        let dev = formatted(&FormatOptions::default(), 1024 * 1024);
        let mount = Mount::mount(dev, &MountArgs::default()).expect("mount");
        let root = mount.root().expect("root");
        assert_eq!(root.attr().kind, FileType::Directory);
        assert!(Arc::ptr_eq(&root, &mount.root().expect("root again")));

        let lf = mount.lookup(InodeNumber::ROOT, OsStr::new("lost+found")).expect("lookup");
        assert_eq!(lf.kind, FileType::Directory);
        let missing = mount.lookup(InodeNumber::ROOT, OsStr::new("nope")).expect_err("missing");
        assert_eq!(missing.to_errno(), libc::ENOENT);
        assert_eq!(mount.fs().superblock().error_count, 0);

        let made = mount.mkdir(InodeNumber::ROOT, OsStr::new("sub"), 0o700).expect("mkdir");
        assert_eq!(made.perm, 0o700);
        assert_eq!(mount.getattr(InodeNumber::ROOT).expect("root").nlink, 4);
        let rmdir = mount.unlink(InodeNumber::ROOT, OsStr::new("sub")).expect_err("dir");
        assert_eq!(rmdir.to_errno(), libc::EISDIR);

        mount.setxattr(made.ino, "user.k", b"v").expect("setxattr");
        assert_eq!(mount.getxattr(made.ino, "user.k").expect("getxattr"), b"v");
        assert_eq!(mount.listxattr(made.ino).expect("list"), vec!["user.k".to_owned()]);

        let st = mount.statfs().expect("statfs");
        assert_eq!(st.bsize, 1024);
        mount.sync().expect("sync");
        assert_eq!(
            mount.read(InodeNumber::ROOT, 0, 10).expect_err("dir read").to_errno(),
            libc::EINVAL
        );
    }

    #[test]
    fn racing_unlinks_free_the_inode_once() {
        let dev = formatted(&FormatOptions::default(), 1024 * 1024);
        let mount = Mount::mount(dev, &MountArgs::default()).expect("mount");
        let before = mount.fs().superblock();
        let ino = regular_file(mount.fs(), InodeNumber::ROOT, b"victim", 2, 0);

        let barrier = Barrier::new(4);
        let wins = AtomicU32::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    barrier.wait();
                    match mount.unlink(InodeNumber::ROOT, OsStr::new("victim")) {
                        Ok(()) => {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(err) => assert_eq!(err.to_errno(), libc::ENOENT),
                    }
                });
            }
        });
        assert_eq!(wins.load(Ordering::SeqCst), 1);

        let after = mount.fs().superblock();
        assert_eq!(after.free_inodes_count, before.free_inodes_count);
        assert_eq!(after.free_blocks_count, before.free_blocks_count);
        assert_eq!(mount.fs().read_inode(ino).expect("inode").links_count, 0);
    }
}
