//! The Operation Engine (§4.3): one typed async entry point per catalog
//! operation, each of which builds an [`Operation`] input, submits it on a
//! [`Channel`], and unpacks the matching [`OperationOutput`] variant.
//!
//! Every function here acquires a [`RequestId`] and a pool descriptor for
//! bookkeeping, then defers the actual work to [`Channel::submit`], which is
//! responsible for the "defer completion to the next tick" invariant of
//! §5. `NoBuffers`/`OutOfMemory` are the only errors this layer itself can
//! raise synchronously (pool exhaustion); everything else comes back from
//! the backend via the `Result` the submitted future resolves to.

use std::ffi::OsString;
use std::sync::Arc;

use crate::error::{Error, Kind};
use crate::fsdev::{Channel, FileAttr, FileHandleId, MountOptions, NodeId, RequestId, SetAttrMask};
use crate::pool::{Pool, PoolOptions, Pooled};

/// A single in-flight operation's input, as submitted to a backend (§3
/// `OperationDescriptor`, minus the pool/channel bookkeeping which lives in
/// [`Pool`]/[`Channel`] instead).
#[derive(Debug)]
pub enum Operation {
    Mount {
        requested: MountOptions,
    },
    Umount,
    Lookup {
        parent: NodeId,
        name: OsString,
    },
    Forget {
        node: NodeId,
        nlookup: u64,
    },
    GetAttr {
        node: NodeId,
        handle: Option<FileHandleId>,
    },
    SetAttr {
        node: NodeId,
        handle: Option<FileHandleId>,
        mask: SetAttrMask,
    },
    ReadLink {
        node: NodeId,
    },
    Symlink {
        parent: NodeId,
        name: OsString,
        target: OsString,
    },
    MkNod {
        parent: NodeId,
        name: OsString,
        mode: u32,
        umask: u32,
        rdev: u32,
    },
    MkDir {
        parent: NodeId,
        name: OsString,
        mode: u32,
        umask: u32,
    },
    Create {
        parent: NodeId,
        name: OsString,
        mode: u32,
        umask: u32,
        flags: i32,
    },
    Unlink {
        parent: NodeId,
        name: OsString,
    },
    RmDir {
        parent: NodeId,
        name: OsString,
    },
    Rename {
        parent: NodeId,
        name: OsString,
        new_parent: NodeId,
        new_name: OsString,
        flags: u32,
    },
    Link {
        node: NodeId,
        new_parent: NodeId,
        new_name: OsString,
    },
    Open {
        node: NodeId,
        flags: i32,
    },
    Release {
        node: NodeId,
        handle: FileHandleId,
    },
    Read {
        node: NodeId,
        handle: FileHandleId,
        offset: u64,
        size: u32,
    },
    Write {
        node: NodeId,
        handle: FileHandleId,
        offset: u64,
        data: Vec<u8>,
    },
    StatFs {
        node: NodeId,
    },
    FSync {
        node: NodeId,
        handle: FileHandleId,
        datasync: bool,
    },
    Flush {
        node: NodeId,
        handle: FileHandleId,
    },
    FSyncDir {
        node: NodeId,
        handle: FileHandleId,
        datasync: bool,
    },
    SetXAttr {
        node: NodeId,
        name: OsString,
        value: Vec<u8>,
        flags: i32,
    },
    GetXAttr {
        node: NodeId,
        name: OsString,
        size: u32,
    },
    ListXAttr {
        node: NodeId,
        size: u32,
    },
    RemoveXAttr {
        node: NodeId,
        name: OsString,
    },
    OpenDir {
        node: NodeId,
        flags: i32,
    },
    ReadDir {
        node: NodeId,
        handle: FileHandleId,
        offset: i64,
    },
    ReleaseDir {
        node: NodeId,
        handle: FileHandleId,
    },
    Flock {
        node: NodeId,
        handle: FileHandleId,
        operation: i32,
    },
    Fallocate {
        node: NodeId,
        handle: FileHandleId,
        mode: i32,
        offset: u64,
        length: u64,
    },
    CopyFileRange {
        src_node: NodeId,
        src_handle: FileHandleId,
        src_offset: u64,
        dst_node: NodeId,
        dst_handle: FileHandleId,
        dst_offset: u64,
        len: u64,
        flags: u64,
    },
    Abort {
        target: RequestId,
    },
}

/// One directory entry, as produced by `readdir` (§4.4 "Directory
/// enumeration").
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: NodeId,
    pub offset: i64,
    pub kind: crate::fsdev::FileType,
    pub name: OsString,
}

/// Filesystem-wide statistics returned by `statfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// The outcome of a completed [`Operation`] (§3 `OperationDescriptor`
/// output union).
#[derive(Debug)]
pub enum OperationOutput {
    Mounted {
        negotiated: MountOptions,
        root: NodeId,
    },
    Unmounted,
    Entry {
        node: NodeId,
        attr: FileAttr,
    },
    Forgotten,
    Attr(FileAttr),
    Link(OsString),
    Created {
        node: NodeId,
        attr: FileAttr,
        handle: FileHandleId,
    },
    Unlinked,
    Renamed,
    Opened {
        handle: FileHandleId,
    },
    Released,
    Read {
        data: Vec<u8>,
    },
    Written {
        size: u32,
    },
    StatFs(Statfs),
    Synced,
    Flushed,
    XAttrSet,
    XAttrValue {
        value: Vec<u8>,
        size_only: bool,
    },
    XAttrList {
        names: Vec<OsString>,
        size_only: bool,
    },
    XAttrRemoved,
    DirEntries {
        entries: Vec<DirEntry>,
    },
    Locked,
    Allocated,
    Copied {
        size: u64,
    },
    Aborted,
}

/// Per-request pool payload. `OperationDescriptor`s carry nothing but the
/// id and operation-family driver-context tail region in the origin
/// system; here the actual input/output travels through `Operation`'s and
/// `OperationOutput`'s owned fields, so this is intentionally small.
#[derive(Debug, Default)]
pub struct OperationDescriptor {
    pub(crate) unique: Option<RequestId>,
}

/// Process-wide pool of [`OperationDescriptor`]s (§4.1).
pub type EngineIoPool = Pool<OperationDescriptor>;

/// Creates the Operation Engine's I/O pool with the given options.
pub fn engine_pool(opts: PoolOptions) -> EngineIoPool {
    Pool::new(opts, OperationDescriptor::default)
}

fn acquire(pool: &EngineIoPool) -> Result<Pooled<OperationDescriptor>, Error> {
    let mut descriptor = pool.acquire()?;
    descriptor.unique = Some(RequestId::next());
    Ok(descriptor)
}

macro_rules! unpack {
    ($result:expr, $variant:ident $( { $($field:ident),* } )? ) => {
        match $result? {
            OperationOutput::$variant $( { $($field),* } )? => ($( $($field),* )?),
            other => return Err(Error::new(Kind::Invalid)
                .context(format!("backend returned unexpected output {other:?}"))),
        }
    };
}

/// `mount` (§4.3): negotiation may only *reduce* capabilities.
pub async fn mount(
    pool: &EngineIoPool,
    channel: &Channel,
    requested: MountOptions,
) -> Result<(MountOptions, NodeId), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel.submit(_unique, Operation::Mount { requested }).await;
    let (negotiated, root) = unpack!(out, Mounted { negotiated, root });
    Ok((negotiated, root))
}

/// `umount`: implicitly drops all cached lookup refs.
pub async fn umount(pool: &EngineIoPool, channel: &Channel) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel.submit(_unique, Operation::Umount).await;
    unpack!(out, Unmounted);
    Ok(())
}

/// `lookup`: `name=""` with the root as parent returns the root itself.
pub async fn lookup(
    pool: &EngineIoPool,
    channel: &Channel,
    parent: NodeId,
    name: &std::ffi::OsStr,
) -> Result<(NodeId, FileAttr), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::Lookup {
            parent,
            name: name.to_owned(),
        })
        .await;
    let (node, attr) = unpack!(out, Entry { node, attr });
    Ok((node, attr))
}

/// `forget`: decrements the lookup refcount by `nlookup`.
pub async fn forget(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    nlookup: u64,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel.submit(_unique, Operation::Forget { node, nlookup }).await;
    unpack!(out, Forgotten);
    Ok(())
}

/// `getattr`.
pub async fn getattr(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    handle: Option<FileHandleId>,
) -> Result<FileAttr, Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel.submit(_unique, Operation::GetAttr { node, handle }).await;
    let attr = unpack!(out, Attr);
    Ok(attr)
}

/// `setattr`: `mask` enumerates which fields of the request apply.
pub async fn setattr(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    handle: Option<FileHandleId>,
    mask: SetAttrMask,
) -> Result<FileAttr, Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::SetAttr {
            node,
            handle,
            mask,
        })
        .await;
    let attr = unpack!(out, Attr);
    Ok(attr)
}

/// `readlink`.
pub async fn readlink(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
) -> Result<OsString, Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel.submit(_unique, Operation::ReadLink { node }).await;
    let target = unpack!(out, Link);
    Ok(target)
}

/// `symlink`.
pub async fn symlink(
    pool: &EngineIoPool,
    channel: &Channel,
    parent: NodeId,
    name: &std::ffi::OsStr,
    target: &std::ffi::OsStr,
) -> Result<(NodeId, FileAttr), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::Symlink {
            parent,
            name: name.to_owned(),
            target: target.to_owned(),
        })
        .await;
    let (node, attr) = unpack!(out, Entry { node, attr });
    Ok((node, attr))
}

/// `mknod`.
#[allow(clippy::too_many_arguments)]
pub async fn mknod(
    pool: &EngineIoPool,
    channel: &Channel,
    parent: NodeId,
    name: &std::ffi::OsStr,
    mode: u32,
    umask: u32,
    rdev: u32,
) -> Result<(NodeId, FileAttr), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::MkNod {
            parent,
            name: name.to_owned(),
            mode,
            umask,
            rdev,
        })
        .await;
    let (node, attr) = unpack!(out, Entry { node, attr });
    Ok((node, attr))
}

/// `mkdir`.
pub async fn mkdir(
    pool: &EngineIoPool,
    channel: &Channel,
    parent: NodeId,
    name: &std::ffi::OsStr,
    mode: u32,
    umask: u32,
) -> Result<(NodeId, FileAttr), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::MkDir {
            parent,
            name: name.to_owned(),
            mode,
            umask,
        })
        .await;
    let (node, attr) = unpack!(out, Entry { node, attr });
    Ok((node, attr))
}

/// `create`: like `mknod` + `open` in one round trip.
pub async fn create(
    pool: &EngineIoPool,
    channel: &Channel,
    parent: NodeId,
    name: &std::ffi::OsStr,
    mode: u32,
    umask: u32,
    flags: i32,
) -> Result<(NodeId, FileAttr, FileHandleId), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::Create {
            parent,
            name: name.to_owned(),
            mode,
            umask,
            flags,
        })
        .await;
    let (node, attr, handle) = unpack!(out, Created { node, attr, handle });
    Ok((node, attr, handle))
}

/// `unlink`.
pub async fn unlink(
    pool: &EngineIoPool,
    channel: &Channel,
    parent: NodeId,
    name: &std::ffi::OsStr,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::Unlink {
            parent,
            name: name.to_owned(),
        })
        .await;
    unpack!(out, Unlinked);
    Ok(())
}

/// `rmdir`.
pub async fn rmdir(
    pool: &EngineIoPool,
    channel: &Channel,
    parent: NodeId,
    name: &std::ffi::OsStr,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::RmDir {
            parent,
            name: name.to_owned(),
        })
        .await;
    unpack!(out, Unlinked);
    Ok(())
}

/// `rename`.
#[allow(clippy::too_many_arguments)]
pub async fn rename(
    pool: &EngineIoPool,
    channel: &Channel,
    parent: NodeId,
    name: &std::ffi::OsStr,
    new_parent: NodeId,
    new_name: &std::ffi::OsStr,
    flags: u32,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::Rename {
            parent,
            name: name.to_owned(),
            new_parent,
            new_name: new_name.to_owned(),
            flags,
        })
        .await;
    unpack!(out, Renamed);
    Ok(())
}

/// `link`.
pub async fn link(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    new_parent: NodeId,
    new_name: &std::ffi::OsStr,
) -> Result<(NodeId, FileAttr), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::Link {
            node,
            new_parent,
            new_name: new_name.to_owned(),
        })
        .await;
    let (node, attr) = unpack!(out, Entry { node, attr });
    Ok((node, attr))
}

/// `open`.
pub async fn open(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    flags: i32,
) -> Result<FileHandleId, Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel.submit(_unique, Operation::Open { node, flags }).await;
    let handle = unpack!(out, Opened { handle });
    Ok(handle)
}

/// `release`.
pub async fn release(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    handle: FileHandleId,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel.submit(_unique, Operation::Release { node, handle }).await;
    unpack!(out, Released);
    Ok(())
}

/// `read`: fails `Invalid` if `size == 0` (§8 boundary behavior, generalized
/// from "zero iovecs" to this crate's single-buffer read shape).
pub async fn read(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    handle: FileHandleId,
    offset: u64,
    size: u32,
) -> Result<Vec<u8>, Error> {
    if size == 0 {
        return Err(Kind::Invalid.into());
    }
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::Read {
            node,
            handle,
            offset,
            size,
        })
        .await;
    let data = unpack!(out, Read { data });
    Ok(data)
}

/// `write`: fails `Invalid` if `data` exceeds `max_write` (§8 boundary
/// behavior).
pub async fn write(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    handle: FileHandleId,
    offset: u64,
    data: Vec<u8>,
    max_write: u32,
) -> Result<u32, Error> {
    if data.len() as u64 > max_write as u64 {
        return Err(Kind::Invalid.into());
    }
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::Write {
            node,
            handle,
            offset,
            data,
        })
        .await;
    let size = unpack!(out, Written { size });
    Ok(size)
}

/// `statfs`.
pub async fn statfs(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
) -> Result<Statfs, Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel.submit(_unique, Operation::StatFs { node }).await;
    let stats = unpack!(out, StatFs);
    Ok(stats)
}

/// `fsync`.
pub async fn fsync(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    handle: FileHandleId,
    datasync: bool,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::FSync {
            node,
            handle,
            datasync,
        })
        .await;
    unpack!(out, Synced);
    Ok(())
}

/// `flush`.
pub async fn flush(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    handle: FileHandleId,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel.submit(_unique, Operation::Flush { node, handle }).await;
    unpack!(out, Flushed);
    Ok(())
}

/// `fsyncdir`.
pub async fn fsyncdir(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    handle: FileHandleId,
    datasync: bool,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::FSyncDir {
            node,
            handle,
            datasync,
        })
        .await;
    unpack!(out, Synced);
    Ok(())
}

/// `setxattr`.
pub async fn setxattr(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    name: &std::ffi::OsStr,
    value: &[u8],
    flags: i32,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::SetXAttr {
            node,
            name: name.to_owned(),
            value: value.to_vec(),
            flags,
        })
        .await;
    unpack!(out, XAttrSet);
    Ok(())
}

/// `getxattr`: `size == 0` returns only the required size with
/// `size_only = true` (§8 boundary behavior).
pub async fn getxattr(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    name: &std::ffi::OsStr,
    size: u32,
) -> Result<(Vec<u8>, bool), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::GetXAttr {
            node,
            name: name.to_owned(),
            size,
        })
        .await;
    let (value, size_only) = unpack!(out, XAttrValue { value, size_only });
    Ok((value, size_only))
}

/// `listxattr`: same `size == 0` boundary behavior as `getxattr`.
pub async fn listxattr(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    size: u32,
) -> Result<(Vec<OsString>, bool), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel.submit(_unique, Operation::ListXAttr { node, size }).await;
    let (names, size_only) = unpack!(out, XAttrList { names, size_only });
    Ok((names, size_only))
}

/// `removexattr`.
pub async fn removexattr(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    name: &std::ffi::OsStr,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::RemoveXAttr {
            node,
            name: name.to_owned(),
        })
        .await;
    unpack!(out, XAttrRemoved);
    Ok(())
}

/// `opendir`.
pub async fn opendir(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    flags: i32,
) -> Result<FileHandleId, Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel.submit(_unique, Operation::OpenDir { node, flags }).await;
    let handle = unpack!(out, Opened { handle });
    Ok(handle)
}

/// `readdir`: the caller drives the per-entry "does it fit" decision at the
/// dispatcher layer (§4.4); this layer just returns everything the backend
/// is willing to produce from `offset` onward.
pub async fn readdir(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    handle: FileHandleId,
    offset: i64,
) -> Result<Vec<DirEntry>, Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::ReadDir {
            node,
            handle,
            offset,
        })
        .await;
    let entries = unpack!(out, DirEntries { entries });
    Ok(entries)
}

/// `releasedir`.
pub async fn releasedir(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    handle: FileHandleId,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel.submit(_unique, Operation::ReleaseDir { node, handle }).await;
    unpack!(out, Released);
    Ok(())
}

/// `flock`.
pub async fn flock(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    handle: FileHandleId,
    operation: i32,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::Flock {
            node,
            handle,
            operation,
        })
        .await;
    unpack!(out, Locked);
    Ok(())
}

/// `fallocate`.
pub async fn fallocate(
    pool: &EngineIoPool,
    channel: &Channel,
    node: NodeId,
    handle: FileHandleId,
    mode: i32,
    offset: u64,
    length: u64,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::Fallocate {
            node,
            handle,
            mode,
            offset,
            length,
        })
        .await;
    unpack!(out, Allocated);
    Ok(())
}

/// `copy_file_range`.
#[allow(clippy::too_many_arguments)]
pub async fn copy_file_range(
    pool: &EngineIoPool,
    channel: &Channel,
    src_node: NodeId,
    src_handle: FileHandleId,
    src_offset: u64,
    dst_node: NodeId,
    dst_handle: FileHandleId,
    dst_offset: u64,
    len: u64,
    flags: u64,
) -> Result<u64, Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel
        .submit(_unique, Operation::CopyFileRange {
            src_node,
            src_handle,
            src_offset,
            dst_node,
            dst_handle,
            dst_offset,
            len,
            flags,
        })
        .await;
    let size = unpack!(out, Copied { size });
    Ok(size)
}

/// `abort`: best-effort cancellation of an in-flight operation (§4.3,
/// §9 open question — the backend is never guaranteed to honor this).
pub async fn abort(
    pool: &EngineIoPool,
    channel: &Channel,
    target: RequestId,
) -> Result<(), Error> {
    let _d = acquire(pool)?;
    let _unique = _d.unique.expect("acquire always sets unique");
    let out = channel.submit(_unique, Operation::Abort { target }).await;
    unpack!(out, Aborted);
    Ok(())
}

/// Convenience wrapper pairing a [`Channel`] with the pool its operations
/// draw descriptors from, since nearly every call site needs both.
#[derive(Clone)]
pub struct Engine {
    pool: EngineIoPool,
    channel: Arc<Channel>,
}

impl Engine {
    pub fn new(pool: EngineIoPool, channel: Arc<Channel>) -> Self {
        Engine { pool, channel }
    }

    pub fn pool(&self) -> &EngineIoPool {
        &self.pool
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pool_exhaustion_surfaces_before_submit() {
        let pool = engine_pool(PoolOptions {
            pool_size: 0,
            cache_size: 0,
        });
        assert!(acquire(&pool).is_err());
    }
}
