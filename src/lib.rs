//! An async fsdev-style filesystem device framework (§1, §3).
//!
//! A *backend* is anything implementing [`FsdevBackend`]: an async
//! `submit` function taking an [`ops::Operation`] and producing an
//! [`ops::OperationOutput`], plus a handful of lifecycle hooks. Backends are
//! named and registered process-wide through the [`FsdevRegistry`]
//! singleton; callers open a [`Channel`] against a name and drive operations
//! through the typed entry points in [`ops`].
//!
//! The [`fuse`] module is the one concrete initiator this crate ships: it
//! parses the Linux FUSE kernel wire protocol, dispatches each request
//! against the Operation Engine, and serializes the reply back onto the
//! kernel's scatter buffers. A backend never sees FUSE wire bytes directly —
//! only the typed [`ops::Operation`]/[`ops::OperationOutput`] pair.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod fsdev;
pub mod fuse;
pub mod ops;
pub mod pool;
pub mod registry;
mod time;

pub use crate::error::{Error, Kind, Result};
pub use crate::fsdev::{
    Channel, FileAttr, FileHandleId, FileType, Fsdev, FsdevBackend, FsdevDescriptor, FsdevModule,
    FsdevStatus, MountOptions, NodeId, RequestId, SetAttrMask, SharedResource, TimeOrNow,
    ROOT_NODE_ID,
};
pub use crate::fuse::{Architecture, Dispatcher};
pub use crate::ops::{DirEntry, Engine, Operation, OperationOutput, Statfs};
pub use crate::pool::{Pool, PoolOptions, Pooled};
pub use crate::registry::{EventCallback, FsdevEvent, FsdevRegistry};
