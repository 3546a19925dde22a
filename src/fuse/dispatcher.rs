//! The FUSE Wire Dispatcher (§4.4): the `Uninitialized`/`Mounted` state
//! machine, the opcode table, and the handful of opcodes that bypass the
//! Operation Engine entirely (`FORGET`, `BATCH_FORGET`, `INTERRUPT`, the
//! unsupported-opcode list).
//!
//! One [`Dispatcher`] is built per mount; [`Dispatcher::dispatch`] is
//! called once per kernel request. Channels aren't `Send` (§3), so a
//! dispatcher is meant to be driven from a single worker task/thread, the
//! way the in-memory demo does.

use parking_lot::Mutex;

use crate::error::{Error, Kind};
use crate::fsdev::{MountOptions, NodeId, RequestId, SetAttrMask, TimeOrNow};
use crate::fuse::abi::{self, consts};
use crate::fuse::arch::Architecture;
use crate::fuse::cursor::ScatterWriter;
use crate::fuse::reply;
use crate::fuse::request::{self, RequestBody};
use crate::ops::{self, Engine};

#[derive(Debug, Clone, Copy)]
enum State {
    Uninitialized,
    Mounted { minor: u32, max_write: u32 },
}

/// Per-mount dispatcher state (§3, §4.4).
pub struct Dispatcher {
    engine: Engine,
    arch: Architecture,
    initial_max_write: u32,
    initial_writeback_cache: bool,
    state: Mutex<State>,
}

impl Dispatcher {
    pub fn new(
        engine: Engine,
        arch: Architecture,
        initial_max_write: u32,
        initial_writeback_cache: bool,
    ) -> Self {
        Dispatcher {
            engine,
            arch,
            initial_max_write,
            initial_writeback_cache,
            state: Mutex::new(State::Uninitialized),
        }
    }

    fn max_write(&self) -> u32 {
        match *self.state.lock() {
            State::Mounted { max_write, .. } => max_write,
            State::Uninitialized => self.initial_max_write,
        }
    }

    fn require_mounted(&self) -> Result<(), Error> {
        match *self.state.lock() {
            State::Mounted { .. } => Ok(()),
            State::Uninitialized => {
                Err(Error::new(Kind::Protocol).context("request received before INIT"))
            }
        }
    }

    /// Parses one request from `input`, executes it, and serializes the
    /// reply (if any) into `output`. Returns the number of bytes written;
    /// `0` means no reply is owed for this opcode (`FORGET`,
    /// `BATCH_FORGET`, `INTERRUPT`). An unrecognized opcode still gets a
    /// `NoSys` error reply, like an explicitly unsupported one.
    pub async fn dispatch(
        &self,
        input: &[&[u8]],
        output: &mut [&mut [u8]],
    ) -> Result<usize, Error> {
        let request = request::parse_request(input)?;
        let unique = request.unique;
        // Unknown opcodes still owe a NoSys reply (§4.4 step 4); only
        // INTERRUPT suppresses its reply outright.
        let suppressed = matches!(request.body, RequestBody::Interrupt { .. });
        let mut writer = ScatterWriter::new(output);

        match self
            .execute(request.nodeid, &request.body, unique, &mut writer)
            .await
        {
            Ok(written) => Ok(written),
            Err(err) if suppressed => {
                log::debug!("suppressing reply for opcode {}: {err}", request.raw_opcode);
                Ok(0)
            }
            Err(err) => reply::write_error(&mut writer, unique, err.kind().to_errno()),
        }
    }

    /// Runs one request to completion, writing its reply into `writer` on
    /// success. `FORGET`/`BATCH_FORGET`/`INTERRUPT` perform their work but
    /// never write anything, returning `0`.
    async fn execute(
        &self,
        nodeid: NodeId,
        body: &RequestBody,
        unique: RequestId,
        writer: &mut ScatterWriter<'_>,
    ) -> Result<usize, Error> {
        let pool = self.engine.pool();
        let channel = self.engine.channel();

        match body {
            RequestBody::Init {
                major,
                minor,
                flags,
                ..
            } => {
                if *major > abi::FUSE_KERNEL_VERSION {
                    // Initiator speaks a newer major than we support: tell it
                    // our version and wait for it to retry at major=7 (§4.4
                    // state machine, scenario 4). No mount happens here.
                    log::warn!(
                        "INIT major {major} newer than supported {}; awaiting renegotiation",
                        abi::FUSE_KERNEL_VERSION
                    );
                    return reply::write_init(writer, unique, abi::TARGET_MINOR, self.initial_max_write, false);
                }
                if *major < abi::FUSE_KERNEL_VERSION {
                    return Err(Error::new(Kind::Protocol)
                        .context(format!("unsupported protocol major {major}")));
                }
                let negotiated_minor = (*minor).min(abi::TARGET_MINOR);
                let writeback_requested =
                    flags & consts::FUSE_WRITEBACK_CACHE != 0 && self.initial_writeback_cache;
                let requested =
                    MountOptions::requested(self.initial_max_write, writeback_requested, 0);
                let (negotiated, _root) = ops::mount(pool, channel, requested).await?;
                *self.state.lock() = State::Mounted {
                    minor: negotiated_minor,
                    max_write: negotiated.max_write(),
                };
                match reply::write_init(
                    writer,
                    unique,
                    negotiated_minor,
                    negotiated.max_write(),
                    negotiated.writeback_cache_enabled(),
                ) {
                    Ok(written) => Ok(written),
                    Err(err) => {
                        // Roll the mount back: the initiator never learned
                        // it succeeded, so the backend must not think it
                        // did either (§4.4 "mount rollback").
                        *self.state.lock() = State::Uninitialized;
                        let _ = ops::umount(pool, channel).await;
                        Err(err)
                    }
                }
            }
            RequestBody::Destroy => {
                self.require_mounted()?;
                ops::umount(pool, channel).await?;
                *self.state.lock() = State::Uninitialized;
                reply::write_empty(writer, unique)
            }
            RequestBody::Forget { nlookup } => {
                self.require_mounted()?;
                // The kernel never expects (and the protocol has no slot
                // for) a FORGET reply, so a failed forget is just logged.
                if let Err(err) = ops::forget(pool, channel, nodeid, *nlookup).await {
                    log::debug!("forget failed (ignored, no reply owed): {err}");
                }
                Ok(0)
            }
            RequestBody::BatchForget { items } => {
                self.require_mounted()?;
                for item in items {
                    if let Err(err) = ops::forget(pool, channel, item.node, item.nlookup).await {
                        log::debug!("batch_forget entry failed (ignored): {err}");
                    }
                }
                Ok(0)
            }
            RequestBody::Interrupt { target } => {
                self.require_mounted()?;
                ops::abort(pool, channel, *target).await?;
                Ok(0)
            }
            RequestBody::Lookup { name } => {
                self.require_mounted()?;
                let (node, attr) = ops::lookup(pool, channel, nodeid, name).await?;
                reply::write_entry(writer, unique, node, &attr)
            }
            RequestBody::GetAttr { fh } => {
                self.require_mounted()?;
                let attr = ops::getattr(pool, channel, nodeid, *fh).await?;
                reply::write_attr(writer, unique, &attr)
            }
            RequestBody::SetAttr {
                fh,
                size,
                atime,
                mtime,
                ctime,
                mode,
                uid,
                gid,
                ..
            } => {
                self.require_mounted()?;
                let mask = SetAttrMask {
                    mode: *mode,
                    uid: *uid,
                    gid: *gid,
                    size: *size,
                    atime: atime.map(|(s, ns)| {
                        TimeOrNow::SpecificTime(crate::time::system_time_from_time(s as i64, ns))
                    }),
                    mtime: mtime.map(|(s, ns)| {
                        TimeOrNow::SpecificTime(crate::time::system_time_from_time(s as i64, ns))
                    }),
                    ctime: ctime.map(|(s, ns)| crate::time::system_time_from_time(s as i64, ns)),
                };
                let attr = ops::setattr(pool, channel, nodeid, *fh, mask).await?;
                reply::write_attr(writer, unique, &attr)
            }
            RequestBody::ReadLink => {
                self.require_mounted()?;
                let target = ops::readlink(pool, channel, nodeid).await?;
                reply::write_link(writer, unique, &target)
            }
            RequestBody::Symlink { name, target } => {
                self.require_mounted()?;
                let (node, attr) = ops::symlink(pool, channel, nodeid, name, target).await?;
                reply::write_entry(writer, unique, node, &attr)
            }
            RequestBody::MkNod {
                name,
                mode,
                rdev,
                umask,
            } => {
                self.require_mounted()?;
                let (node, attr) =
                    ops::mknod(pool, channel, nodeid, name, *mode, *umask, *rdev).await?;
                reply::write_entry(writer, unique, node, &attr)
            }
            RequestBody::MkDir { name, mode, umask } => {
                self.require_mounted()?;
                let (node, attr) = ops::mkdir(pool, channel, nodeid, name, *mode, *umask).await?;
                reply::write_entry(writer, unique, node, &attr)
            }
            RequestBody::Unlink { name } => {
                self.require_mounted()?;
                ops::unlink(pool, channel, nodeid, name).await?;
                reply::write_empty(writer, unique)
            }
            RequestBody::RmDir { name } => {
                self.require_mounted()?;
                ops::rmdir(pool, channel, nodeid, name).await?;
                reply::write_empty(writer, unique)
            }
            RequestBody::Rename {
                name,
                new_parent,
                new_name,
                flags,
            } => {
                self.require_mounted()?;
                ops::rename(pool, channel, nodeid, name, *new_parent, new_name, *flags).await?;
                reply::write_empty(writer, unique)
            }
            RequestBody::Link {
                existing_node,
                new_name,
            } => {
                self.require_mounted()?;
                // `nodeid` is the target directory (§6); the inode being
                // linked in travels in the body as `existing_node`.
                let (node, attr) =
                    ops::link(pool, channel, *existing_node, nodeid, new_name).await?;
                reply::write_entry(writer, unique, node, &attr)
            }
            RequestBody::Open { flags } => {
                self.require_mounted()?;
                let flags = self.arch.translate_open_flags(*flags);
                let handle = ops::open(pool, channel, nodeid, flags).await?;
                reply::write_open(writer, unique, handle)
            }
            RequestBody::Release { fh, .. } => {
                self.require_mounted()?;
                ops::release(pool, channel, nodeid, *fh).await?;
                reply::write_empty(writer, unique)
            }
            RequestBody::Read { fh, offset, size } => {
                self.require_mounted()?;
                let data = ops::read(pool, channel, nodeid, *fh, *offset, *size).await?;
                reply::write_data(writer, unique, &data)
            }
            RequestBody::Write { fh, offset, data } => {
                self.require_mounted()?;
                let max_write = self.max_write();
                let written =
                    ops::write(pool, channel, nodeid, *fh, *offset, data.clone(), max_write)
                        .await?;
                reply::write_write(writer, unique, written)
            }
            RequestBody::StatFs => {
                self.require_mounted()?;
                let stats = ops::statfs(pool, channel, nodeid).await?;
                reply::write_statfs(writer, unique, &stats)
            }
            RequestBody::FSync { fh, datasync } => {
                self.require_mounted()?;
                ops::fsync(pool, channel, nodeid, *fh, *datasync).await?;
                reply::write_empty(writer, unique)
            }
            RequestBody::Flush { fh } => {
                self.require_mounted()?;
                ops::flush(pool, channel, nodeid, *fh).await?;
                reply::write_empty(writer, unique)
            }
            RequestBody::SetXAttr { name, value, flags } => {
                self.require_mounted()?;
                ops::setxattr(pool, channel, nodeid, name, value, *flags).await?;
                reply::write_empty(writer, unique)
            }
            RequestBody::GetXAttr { name, size } => {
                self.require_mounted()?;
                let (value, size_only) = ops::getxattr(pool, channel, nodeid, name, *size).await?;
                if size_only {
                    reply::write_xattr_size(writer, unique, value.len() as u32)
                } else {
                    reply::write_data(writer, unique, &value)
                }
            }
            RequestBody::ListXAttr { size } => {
                self.require_mounted()?;
                let (names, size_only) = ops::listxattr(pool, channel, nodeid, *size).await?;
                if size_only {
                    let total: usize = names.iter().map(|n| n.len() + 1).sum();
                    reply::write_xattr_size(writer, unique, total as u32)
                } else {
                    use std::os::unix::ffi::OsStrExt;
                    let mut buf = Vec::new();
                    for name in &names {
                        buf.extend_from_slice(name.as_bytes());
                        buf.push(0);
                    }
                    reply::write_data(writer, unique, &buf)
                }
            }
            RequestBody::RemoveXAttr { name } => {
                self.require_mounted()?;
                ops::removexattr(pool, channel, nodeid, name).await?;
                reply::write_empty(writer, unique)
            }
            RequestBody::OpenDir { flags } => {
                self.require_mounted()?;
                let flags = self.arch.translate_open_flags(*flags);
                let handle = ops::opendir(pool, channel, nodeid, flags).await?;
                reply::write_open(writer, unique, handle)
            }
            RequestBody::ReadDir { fh, offset } => {
                self.require_mounted()?;
                let entries = ops::readdir(pool, channel, nodeid, *fh, *offset).await?;
                let capacity = writer.remaining_capacity();
                let (written, _consumed) =
                    reply::write_dirents(writer, unique, &entries, capacity)?;
                Ok(written)
            }
            RequestBody::ReleaseDir { fh } => {
                self.require_mounted()?;
                ops::releasedir(pool, channel, nodeid, *fh).await?;
                reply::write_empty(writer, unique)
            }
            RequestBody::FSyncDir { fh, datasync } => {
                self.require_mounted()?;
                ops::fsyncdir(pool, channel, nodeid, *fh, *datasync).await?;
                reply::write_empty(writer, unique)
            }
            RequestBody::Create {
                name,
                flags,
                mode,
                umask,
            } => {
                self.require_mounted()?;
                let flags = self.arch.translate_open_flags(*flags);
                let (node, attr, handle) =
                    ops::create(pool, channel, nodeid, name, *mode, *umask, flags).await?;
                reply::write_create(writer, unique, node, &attr, handle)
            }
            RequestBody::Fallocate {
                fh,
                offset,
                length,
                mode,
            } => {
                self.require_mounted()?;
                ops::fallocate(pool, channel, nodeid, *fh, *mode, *offset, *length).await?;
                reply::write_empty(writer, unique)
            }
            RequestBody::CopyFileRange {
                fh_in,
                off_in,
                node_out,
                fh_out,
                off_out,
                len,
                flags,
            } => {
                self.require_mounted()?;
                let size = ops::copy_file_range(
                    pool, channel, nodeid, *fh_in, *off_in, *node_out, *fh_out, *off_out, *len,
                    *flags,
                )
                .await?;
                reply::write_write(writer, unique, size as u32)
            }
            RequestBody::Unsupported | RequestBody::Unknown => {
                Err(Error::new(Kind::NotSupported))
            }
        }
    }
}
