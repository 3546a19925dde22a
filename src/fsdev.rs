//! The fsdev data model: named devices, open descriptors, per-thread
//! channels, and the backend adapter contract (§3, §4.5).

use std::cmp::min;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Kind};
use crate::ops::{Operation, OperationOutput};
use crate::registry::EventCallback;

/// Opaque identifier for a filesystem node, minted by whichever backend
/// creates it (§9 "Pointer-as-opaque-id": the core never dereferences this
/// value, so it never needs to be an arena index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// The fixed node id the root of every mounted fsdev is addressed by,
/// matching FUSE convention.
pub const ROOT_NODE_ID: NodeId = NodeId(1);

/// Opaque identifier for an open file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandleId(pub u64);

/// Per-request identifier used for matching responses and for `abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl RequestId {
    pub(crate) fn next() -> Self {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// File types, mirrored from the POSIX `S_IF*` family.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum FileType {
    NamedPipe,
    CharDevice,
    BlockDevice,
    Directory,
    RegularFile,
    Symlink,
    Socket,
}

/// File attributes returned by `lookup`, `getattr`, `setattr`, `create`...
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FileAttr {
    pub ino: NodeId,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: FileType,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

/// Bitmask of which `FileAttr` fields a `setattr` call should apply,
/// mirroring the FUSE `FATTR_*` bits (§4.3 "to_set bits enumerate which
/// fields apply").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttrMask {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub ctime: Option<SystemTime>,
}

/// Either an absolute time, or "now" as the kernel requests when the
/// `FATTR_ATIME_NOW`/`FATTR_MTIME_NOW` bit is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    SpecificTime(SystemTime),
    Now,
}

/// Negotiated mount options (§6 "Operation-level configuration").
///
/// Setters follow the same "previous value on success, nearest valid value
/// on failure" idiom used by this crate's kernel-config negotiation, so a
/// backend's `mount` handler negotiates with the exact API a caller used to
/// request options.
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    max_write: u32,
    writeback_cache_enabled: bool,
    opts_size: u32,
}

impl MountOptions {
    /// Starts from the caller-requested options; a backend narrows them
    /// from here.
    pub fn requested(max_write: u32, writeback_cache_enabled: bool, opts_size: u32) -> Self {
        MountOptions {
            max_write,
            writeback_cache_enabled,
            opts_size,
        }
    }

    pub fn max_write(&self) -> u32 {
        self.max_write
    }

    pub fn writeback_cache_enabled(&self) -> bool {
        self.writeback_cache_enabled
    }

    pub fn opts_size(&self) -> u32 {
        self.opts_size
    }

    /// Narrows `max_write`. A backend may only reduce it, never grow it.
    pub fn set_max_write(&mut self, value: u32) -> Result<u32, u32> {
        if value == 0 {
            return Err(1);
        }
        let capped = min(value, self.max_write);
        let previous = self.max_write;
        self.max_write = capped;
        Ok(previous)
    }

    /// Clears `writeback_cache_enabled`. Per §9's noted open question, this
    /// conflates "was off" with forward-compatibility sizing: a backend can
    /// never turn the flag *on* if the caller didn't request it, only turn
    /// it off.
    pub fn clear_writeback_cache(&mut self) -> bool {
        let previous = self.writeback_cache_enabled;
        self.writeback_cache_enabled = false;
        previous
    }
}

/// Lifecycle state of a registered [`Fsdev`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsdevStatus {
    Invalid,
    Ready,
    Unregistering,
    Removing,
}

/// A named filesystem device (§3).
pub struct Fsdev {
    pub(crate) name: String,
    pub(crate) backend: Arc<dyn FsdevBackend>,
    pub(crate) module_name: &'static str,
    pub(crate) status: Mutex<FsdevStatus>,
    pub(crate) open_descriptors: Mutex<Vec<Arc<FsdevDescriptorInner>>>,
}

impl fmt::Debug for Fsdev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fsdev")
            .field("name", &self.name)
            .field("status", &*self.status.lock())
            .finish_non_exhaustive()
    }
}

impl Fsdev {
    /// The fsdev's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current lifecycle status.
    pub fn status(&self) -> FsdevStatus {
        *self.status.lock()
    }
}

pub(crate) struct FsdevDescriptorInner {
    pub(crate) fsdev: Arc<Fsdev>,
    pub(crate) closed: Mutex<bool>,
    pub(crate) refcount: std::sync::atomic::AtomicU64,
    /// Delivered a single `Remove` event on hot-removal/unregister (§4.2,
    /// §7). Invoked with the descriptor's refcount bumped so a close()
    /// triggered synchronously from inside the callback can't free it.
    pub(crate) event_cb: EventCallback,
}

/// An open handle to an [`Fsdev`] held by a client (§3).
///
/// Created by [`crate::registry::FsdevRegistry::open`], closed by
/// [`crate::registry::FsdevRegistry::close`].
pub struct FsdevDescriptor {
    pub(crate) inner: Arc<FsdevDescriptorInner>,
}

impl fmt::Debug for FsdevDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsdevDescriptor")
            .field("fsdev", &self.inner.fsdev.name)
            .finish()
    }
}

impl FsdevDescriptor {
    /// The fsdev this descriptor was opened against.
    pub fn fsdev(&self) -> &Arc<Fsdev> {
        &self.inner.fsdev
    }
}

/// Per-module, per-thread resource aggregator coalescing multiple Fsdevs
/// that share a backend channel (§3).
pub struct SharedResource {
    pub(crate) backend_channel_id: u64,
    pub(crate) refcount: std::sync::atomic::AtomicU64,
}

/// A per-thread binding between an Fsdev and the backend's I/O channel
/// (§3). Channels are not `Send` across threads; each async task that
/// submits operations should acquire its own.
pub struct Channel {
    pub(crate) fsdev: Arc<Fsdev>,
    pub(crate) shared: Arc<SharedResource>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fsdev", &self.fsdev.name)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(fsdev: Arc<Fsdev>, shared: Arc<SharedResource>) -> Self {
        shared.refcount.fetch_add(1, Ordering::AcqRel);
        Channel { fsdev, shared }
    }

    /// Submits one operation to this channel's backend and waits for its
    /// outcome. `unique` is the operation's own id, visible to the backend
    /// so it can later match an `Operation::Abort { target }` against it.
    ///
    /// This is the crate's expression of §4.3 step 4-5: the backend's
    /// `submit` may resolve immediately (inline completion) or after
    /// genuinely waiting on I/O; either way, a single `yield_now` is forced
    /// before the result is observed, so a handler can never be re-entered
    /// from within its own submit call (§5's no-reentrancy rule).
    pub(crate) async fn submit(
        &self,
        unique: RequestId,
        op: Operation,
    ) -> Result<OperationOutput, Error> {
        if *self.fsdev.status.lock() != FsdevStatus::Ready {
            // Hot-removal already fired its REMOVE event to every open
            // descriptor; any submit arriving afterward is stale (§7).
            return Err(Error::new(Kind::NoDevice)
                .context(format!("fsdev {:?} no longer ready", self.fsdev.name)));
        }
        let result = self.fsdev.backend.submit(self, unique, op).await;
        tokio::task::yield_now().await;
        result
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The function table a backend must expose (§4.5).
///
/// Optional entries (`write_config_json`, `get_memory_domains`) default to
/// [`Kind::NotSupported`] rather than requiring every backend to implement
/// them — the core never performs a null-pointer style check at the call
/// site (§9 "Dynamic function tables with optional entries").
#[async_trait]
pub trait FsdevBackend: Send + Sync + 'static {
    /// Submits one operation and returns its outcome. `unique` identifies
    /// this operation for the lifetime of its execution, so a later
    /// `Operation::Abort { target }` can be matched against it; a backend
    /// that doesn't track in-flight operations is free to ignore it. A
    /// backend that completes synchronously still returns normally from
    /// this method — the "next tick" deferral is handled by
    /// [`Channel::submit`], not by the backend.
    async fn submit(
        &self,
        channel: &Channel,
        unique: RequestId,
        op: Operation,
    ) -> Result<OperationOutput, Error>;

    /// Returns a handle usable only from the calling task.
    async fn get_io_channel(&self) -> Result<Arc<SharedResource>, Error>;

    /// Synchronous or asynchronous teardown. Called once the fsdev has no
    /// remaining open descriptors.
    async fn destruct(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Backend-specific configuration, serialized for introspection.
    async fn write_config_json(&self) -> Result<String, Error> {
        Err(Kind::NotSupported.into())
    }

    /// Memory domains this backend can perform DMA through. Out of scope
    /// for the core (§1); surfaced only as an opaque count.
    async fn get_memory_domains(&self) -> Result<usize, Error> {
        Err(Kind::NotSupported.into())
    }
}

/// A backend family (§4.5): exports a name, a per-op context-size hint used
/// to size the pool's driver-context tail region, and lifecycle hooks.
#[async_trait]
pub trait FsdevModule: Send + Sync + 'static {
    /// Unique module name.
    fn name(&self) -> &'static str;

    /// Maximum per-operation driver scratch size this module's backends
    /// require; used to size the I/O pool's descriptor tail region.
    fn ctx_size(&self) -> usize {
        0
    }

    /// Called once at process init, in registration order.
    async fn init(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Called once at teardown, in reverse registration order.
    async fn fini(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Backend-family-wide configuration, serialized for introspection.
    fn config_json(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mount_options_narrow_only() {
        let mut opts = MountOptions::requested(0xFFFF_FFFF, true, 9);
        let previous = opts.set_max_write(0x7FFF_FFFF).unwrap();
        assert_eq!(previous, 0xFFFF_FFFF);
        assert_eq!(opts.max_write(), 0x7FFF_FFFF);

        // A later attempt to grow past the already-negotiated value is
        // silently capped, never increased.
        opts.set_max_write(u32::MAX).unwrap();
        assert_eq!(opts.max_write(), 0x7FFF_FFFF);
    }

    #[test]
    fn writeback_cache_can_only_be_cleared() {
        let mut opts = MountOptions::requested(1024, true, 9);
        assert!(opts.writeback_cache_enabled());
        let previous = opts.clear_writeback_cache();
        assert!(previous);
        assert!(!opts.writeback_cache_enabled());
    }

    #[test]
    fn request_ids_are_unique() {
        let a = RequestId::next();
        let b = RequestId::next();
        assert_ne!(a, b);
    }
}
