//! Smallest possible backend wired into the Operation Engine: registers an
//! in-memory backend, mounts it, and round-trips a single file through
//! mknod → lookup → open → write → read → release → unlink.
//!
//! Run with `cargo run --example hello_fsdev`.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use fsdev::{
    Channel, Engine, Error, FileAttr, FileHandleId, FileType, FsdevBackend, FsdevRegistry, Kind,
    MountOptions, NodeId, Operation, OperationOutput, PoolOptions, RequestId, SharedResource,
    ROOT_NODE_ID,
};
use parking_lot::Mutex;

const DATA_SIZE: usize = 512;

struct Inode {
    attr: FileAttr,
    parent: NodeId,
    name: OsString,
    data: Vec<u8>,
}

struct MemFs {
    inodes: HashMap<NodeId, Inode>,
    next_ino: u64,
}

impl MemFs {
    fn new() -> Self {
        let now = SystemTime::now();
        let root = Inode {
            attr: FileAttr {
                ino: ROOT_NODE_ID,
                size: 0,
                blocks: 0,
                atime: now,
                mtime: now,
                ctime: now,
                kind: FileType::Directory,
                perm: 0o755,
                nlink: 2,
                uid: 0,
                gid: 0,
                rdev: 0,
                blksize: 512,
            },
            parent: ROOT_NODE_ID,
            name: OsString::new(),
            data: Vec::new(),
        };
        let mut inodes = HashMap::new();
        inodes.insert(ROOT_NODE_ID, root);
        MemFs { inodes, next_ino: 2 }
    }

    fn child_named(&self, parent: NodeId, name: &OsStr) -> Option<NodeId> {
        self.inodes
            .iter()
            .find(|(_, inode)| inode.parent == parent && inode.name == name)
            .map(|(ino, _)| *ino)
    }
}

/// A minimal in-process [`FsdevBackend`]: one mutex-guarded inode table,
/// no persistence, no concurrency control beyond the lock itself.
struct MemBackend {
    fs: Mutex<MemFs>,
}

impl MemBackend {
    fn new() -> Self {
        MemBackend {
            fs: Mutex::new(MemFs::new()),
        }
    }
}

#[async_trait]
impl FsdevBackend for MemBackend {
    async fn submit(
        &self,
        _channel: &Channel,
        _unique: RequestId,
        op: Operation,
    ) -> Result<OperationOutput, Error> {
        match op {
            Operation::Mount { requested } => {
                Ok(OperationOutput::Mounted {
                    negotiated: requested,
                    root: ROOT_NODE_ID,
                })
            }
            Operation::Umount => Ok(OperationOutput::Unmounted),
            Operation::Lookup { parent, name } => {
                let fs = self.fs.lock();
                let ino = if name.is_empty() {
                    parent
                } else {
                    fs.child_named(parent, &name)
                        .ok_or_else(|| Error::new(Kind::NotSupported).context("no such entry"))?
                };
                let attr = fs.inodes[&ino].attr;
                Ok(OperationOutput::Entry { node: ino, attr })
            }
            Operation::Forget { .. } => Ok(OperationOutput::Forgotten),
            Operation::GetAttr { node, .. } => {
                let fs = self.fs.lock();
                let attr = fs
                    .inodes
                    .get(&node)
                    .ok_or_else(|| Error::new(Kind::NotSupported))?
                    .attr;
                Ok(OperationOutput::Attr(attr))
            }
            Operation::MkNod {
                parent, name, mode, ..
            } => {
                let mut fs = self.fs.lock();
                let ino = NodeId(fs.next_ino);
                fs.next_ino += 1;
                let now = SystemTime::now();
                let attr = FileAttr {
                    ino,
                    size: 0,
                    blocks: 0,
                    atime: now,
                    mtime: now,
                    ctime: now,
                    kind: FileType::RegularFile,
                    perm: (mode & 0o7777) as u16,
                    nlink: 1,
                    uid: 0,
                    gid: 0,
                    rdev: 0,
                    blksize: 512,
                };
                fs.inodes.insert(ino, Inode {
                    attr,
                    parent,
                    name,
                    data: Vec::new(),
                });
                Ok(OperationOutput::Entry { node: ino, attr })
            }
            Operation::Unlink { parent, name } => {
                let mut fs = self.fs.lock();
                let ino = fs
                    .child_named(parent, &name)
                    .ok_or_else(|| Error::new(Kind::NotSupported).context("no such entry"))?;
                fs.inodes.remove(&ino);
                Ok(OperationOutput::Unlinked)
            }
            Operation::Open { node, .. } => {
                let fs = self.fs.lock();
                if !fs.inodes.contains_key(&node) {
                    return Err(Error::new(Kind::NotSupported).context("no such inode"));
                }
                // One file handle per open node suffices for this demo.
                Ok(OperationOutput::Opened {
                    handle: FileHandleId(node.0),
                })
            }
            Operation::Release { .. } => Ok(OperationOutput::Released),
            Operation::Write {
                node, offset, data, ..
            } => {
                let mut fs = self.fs.lock();
                let inode = fs
                    .inodes
                    .get_mut(&node)
                    .ok_or_else(|| Error::new(Kind::NotSupported))?;
                let end = offset as usize + data.len();
                if inode.data.len() < end {
                    inode.data.resize(end, 0);
                }
                inode.data[offset as usize..end].copy_from_slice(&data);
                inode.attr.size = inode.data.len() as u64;
                Ok(OperationOutput::Written {
                    size: data.len() as u32,
                })
            }
            Operation::Read {
                node, offset, size, ..
            } => {
                let fs = self.fs.lock();
                let inode = fs.inodes.get(&node).ok_or_else(|| Error::new(Kind::NotSupported))?;
                let offset = offset as usize;
                let end = (offset + size as usize).min(inode.data.len());
                let data = if offset >= inode.data.len() {
                    Vec::new()
                } else {
                    inode.data[offset..end].to_vec()
                };
                Ok(OperationOutput::Read { data })
            }
            _ => Err(Error::new(Kind::NotSupported)),
        }
    }

    async fn get_io_channel(&self) -> Result<Arc<SharedResource>, Error> {
        Ok(fsdev::registry::new_shared_resource(1))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let registry = FsdevRegistry::global();
    registry.register("Fs0", "memfs", Arc::new(MemBackend::new()))?;

    let descriptor = registry.open("Fs0", Arc::new(|_event| {}))?;
    let channel = registry.get_io_channel(&descriptor).await?;
    let pool = fsdev::ops::engine_pool(PoolOptions::default());
    let engine = Engine::new(pool, Arc::new(channel));

    let (negotiated, root) = fsdev::ops::mount(
        engine.pool(),
        engine.channel(),
        MountOptions::requested(128 * 1024, false, 0),
    )
    .await?;
    println!(
        "mounted: root={root:?} max_write={}",
        negotiated.max_write()
    );

    let name = OsStr::new("hello_file");
    let (node, _attr) =
        fsdev::ops::mknod(engine.pool(), engine.channel(), root, name, 0o100644, 0, 0).await?;
    println!("created {name:?} as {node:?}");

    let (looked_up, _attr) = fsdev::ops::lookup(engine.pool(), engine.channel(), root, name).await?;
    assert_eq!(looked_up, node);

    let handle = fsdev::ops::open(engine.pool(), engine.channel(), node, libc::O_RDWR).await?;
    println!("opened as {handle:?}");

    let payload = vec![0xABu8; DATA_SIZE];
    let written =
        fsdev::ops::write(engine.pool(), engine.channel(), node, handle, 0, payload.clone(), negotiated.max_write())
            .await?;
    println!("wrote {written} bytes");

    let read_back = fsdev::ops::read(
        engine.pool(),
        engine.channel(),
        node,
        handle,
        0,
        DATA_SIZE as u32,
    )
    .await?;
    assert_eq!(read_back, payload);
    println!("read back {} bytes, matches", read_back.len());

    fsdev::ops::release(engine.pool(), engine.channel(), node, handle).await?;
    fsdev::ops::unlink(engine.pool(), engine.channel(), root, name).await?;
    println!("released and unlinked {name:?}");

    fsdev::ops::forget(engine.pool(), engine.channel(), root, 1).await?;
    fsdev::ops::umount(engine.pool(), engine.channel()).await?;
    println!("unmounted");

    registry.close(descriptor).await;
    Ok(())
}
