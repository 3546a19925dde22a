//! Shared in-memory backend used by the integration tests. Not a
//! performance-minded implementation — one mutex-guarded table, just
//! enough behavior (lookup refcounting, mount negotiation, an abortable
//! read) to drive the dispatcher and Operation Engine end to end.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use fsdev::{
    Architecture, Channel, Dispatcher, Engine, Error, FileAttr, FileHandleId, FileType,
    FsdevBackend, Kind, NodeId, Operation, OperationOutput, PoolOptions, RequestId,
    SharedResource, ROOT_NODE_ID,
};
use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inode {
    attr: FileAttr,
    parent: NodeId,
    name: OsString,
    data: Vec<u8>,
    lookup_refs: u64,
}

struct State {
    inodes: HashMap<NodeId, Inode>,
    children: HashMap<(NodeId, OsString), NodeId>,
    next_ino: u64,
    aborted: Vec<RequestId>,
    last_open_flags: Option<i32>,
}

/// An in-memory [`FsdevBackend`] for tests. `read_gate`, when armed via
/// [`MemBackend::arm_read_gate`], makes the next `read` wait until either
/// the gate is notified or an `abort` targeting that read's `unique`
/// arrives — enough to exercise the INTERRUPT race without real I/O.
pub struct MemBackend {
    state: Mutex<State>,
    read_gate: Notify,
    gated_unique: Mutex<Option<RequestId>>,
}

fn now_attr(ino: NodeId, kind: FileType, perm: u16) -> FileAttr {
    let now = SystemTime::now();
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
        kind,
        perm,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
    }
}

impl MemBackend {
    pub fn new() -> Arc<MemBackend> {
        let mut inodes = HashMap::new();
        inodes.insert(ROOT_NODE_ID, Inode {
            attr: now_attr(ROOT_NODE_ID, FileType::Directory, 0o755),
            parent: ROOT_NODE_ID,
            name: OsString::new(),
            data: Vec::new(),
            lookup_refs: 1,
        });
        Arc::new(MemBackend {
            state: Mutex::new(State {
                inodes,
                children: HashMap::new(),
                next_ino: 2,
                aborted: Vec::new(),
                last_open_flags: None,
            }),
            read_gate: Notify::new(),
            gated_unique: Mutex::new(None),
        })
    }

    /// Makes the next `read` block until this exact `unique` is either
    /// notified directly or targeted by an `abort`.
    pub fn arm_read_gate(&self, unique: RequestId) {
        *self.gated_unique.lock() = Some(unique);
    }

    pub fn lookup_refs(&self, node: NodeId) -> u64 {
        self.state.lock().inodes.get(&node).map(|i| i.lookup_refs).unwrap_or(0)
    }

    pub fn aborted(&self) -> Vec<RequestId> {
        self.state.lock().aborted.clone()
    }

    pub fn last_open_flags(&self) -> Option<i32> {
        self.state.lock().last_open_flags
    }
}

#[async_trait]
impl FsdevBackend for MemBackend {
    async fn submit(
        &self,
        _channel: &Channel,
        unique: RequestId,
        op: Operation,
    ) -> Result<OperationOutput, Error> {
        match op {
            Operation::Mount { requested } => {
                let mut negotiated = requested;
                let _ = negotiated.set_max_write(0x7FFF_FFFF);
                negotiated.clear_writeback_cache();
                Ok(OperationOutput::Mounted {
                    negotiated,
                    root: ROOT_NODE_ID,
                })
            }
            Operation::Umount => Ok(OperationOutput::Unmounted),
            Operation::Lookup { parent, name } => {
                let mut state = self.state.lock();
                let node = if name.is_empty() {
                    parent
                } else {
                    *state
                        .children
                        .get(&(parent, name.clone()))
                        .ok_or_else(|| Error::new(Kind::NoDevice).context("no such entry"))?
                };
                let inode = state.inodes.get_mut(&node).expect("dangling child entry");
                inode.lookup_refs += 1;
                let attr = inode.attr;
                Ok(OperationOutput::Entry { node, attr })
            }
            Operation::Forget { node, nlookup } => {
                let mut state = self.state.lock();
                if let Some(inode) = state.inodes.get_mut(&node) {
                    inode.lookup_refs = inode.lookup_refs.saturating_sub(nlookup);
                    if inode.lookup_refs == 0 && node != ROOT_NODE_ID {
                        let parent = inode.parent;
                        let name = inode.name.clone();
                        state.children.remove(&(parent, name));
                        state.inodes.remove(&node);
                    }
                }
                Ok(OperationOutput::Forgotten)
            }
            Operation::GetAttr { node, .. } => {
                let state = self.state.lock();
                let attr = state
                    .inodes
                    .get(&node)
                    .ok_or_else(|| Error::new(Kind::NoDevice))?
                    .attr;
                Ok(OperationOutput::Attr(attr))
            }
            Operation::MkNod {
                parent, name, mode, ..
            } => self.create_entry(parent, name, mode, FileType::RegularFile),
            Operation::MkDir {
                parent, name, mode, ..
            } => self.create_entry(parent, name, mode, FileType::Directory),
            Operation::Unlink { parent, name } | Operation::RmDir { parent, name } => {
                let mut state = self.state.lock();
                let node = *state
                    .children
                    .get(&(parent, name.clone()))
                    .ok_or_else(|| Error::new(Kind::NoDevice).context("no such entry"))?;
                if state
                    .children
                    .keys()
                    .any(|(p, _)| *p == node)
                {
                    return Err(Error::new(Kind::Busy).context("directory not empty"));
                }
                state.children.remove(&(parent, name));
                state.inodes.remove(&node);
                Ok(OperationOutput::Unlinked)
            }
            Operation::Open { node, flags } => {
                let mut state = self.state.lock();
                state.last_open_flags = Some(flags);
                if !state.inodes.contains_key(&node) {
                    return Err(Error::new(Kind::NoDevice).context("no such inode"));
                }
                Ok(OperationOutput::Opened {
                    handle: FileHandleId(node.0),
                })
            }
            Operation::Release { .. } => Ok(OperationOutput::Released),
            Operation::Write {
                node, offset, data, ..
            } => {
                let mut state = self.state.lock();
                let inode = state
                    .inodes
                    .get_mut(&node)
                    .ok_or_else(|| Error::new(Kind::NoDevice))?;
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
                let gated = *self.gated_unique.lock() == Some(unique);
                if gated {
                    tokio::select! {
                        _ = self.read_gate.notified() => {}
                    }
                }
                let state = self.state.lock();
                let inode = state.inodes.get(&node).ok_or_else(|| Error::new(Kind::NoDevice))?;
                let offset = offset as usize;
                let data = if offset >= inode.data.len() {
                    Vec::new()
                } else {
                    let end = (offset + size as usize).min(inode.data.len());
                    inode.data[offset..end].to_vec()
                };
                Ok(OperationOutput::Read { data })
            }
            Operation::Abort { target } => {
                self.state.lock().aborted.push(target);
                if *self.gated_unique.lock() == Some(target) {
                    self.read_gate.notify_one();
                }
                Ok(OperationOutput::Aborted)
            }
            _ => Err(Error::new(Kind::NotSupported)),
        }
    }

    async fn get_io_channel(&self) -> Result<Arc<SharedResource>, Error> {
        Ok(fsdev::registry::new_shared_resource(1))
    }
}

impl MemBackend {
    fn create_entry(
        &self,
        parent: NodeId,
        name: OsString,
        mode: u32,
        kind: FileType,
    ) -> Result<OperationOutput, Error> {
        let mut state = self.state.lock();
        if state.children.contains_key(&(parent, name.clone())) {
            return Err(Error::new(Kind::Exists));
        }
        let ino = NodeId(state.next_ino);
        state.next_ino += 1;
        let mut attr = now_attr(ino, kind, (mode & 0o7777) as u16);
        attr.ino = ino;
        state.children.insert((parent, name.clone()), ino);
        state.inodes.insert(ino, Inode {
            attr,
            parent,
            name,
            data: Vec::new(),
            lookup_refs: 1,
        });
        Ok(OperationOutput::Entry { node: ino, attr })
    }
}

/// Registers a fresh [`MemBackend`] under a unique name and opens an
/// [`Engine`] against it, so parallel tests never collide in the
/// process-wide registry.
pub async fn make_engine() -> (Arc<MemBackend>, Engine) {
    let backend = MemBackend::new();
    let registry = fsdev::FsdevRegistry::global();
    let name = format!("mem-test-{:p}", Arc::as_ptr(&backend));
    registry
        .register(name.clone(), "test", backend.clone())
        .unwrap();
    let descriptor = registry.open(&name, Arc::new(|_event| {})).unwrap();
    let channel = registry.get_io_channel(&descriptor).await.unwrap();
    let pool = fsdev::ops::engine_pool(PoolOptions::default());
    let engine = Engine::new(pool, Arc::new(channel));
    (backend, engine)
}

/// Builds a fresh [`Dispatcher`] wired to its own [`MemBackend`].
pub async fn make_dispatcher(arch: Architecture) -> (Arc<MemBackend>, Dispatcher) {
    let (backend, engine) = make_engine().await;
    let dispatcher = Dispatcher::new(engine, arch, 0xFFFF_FFFF, true);
    (backend, dispatcher)
}
