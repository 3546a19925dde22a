//! Parses a raw FUSE wire request into a typed [`Request`] (§4.4 step 1-3,
//! §6 wire format).
//!
//! Mirrors the shape of a conventional low-level FUSE binding's per-opcode
//! argument structs, but built on [`GatherCursor`] so a request can be
//! split across more than one kernel-supplied buffer, and aware of the
//! handful of legacy-compat struct sizes older initiators still send
//! (mknod, write, setattr).

use std::ffi::OsString;

use crate::error::{Error, Kind};
use crate::fsdev::{FileHandleId, NodeId, RequestId};
use crate::fuse::abi::*;
use crate::fuse::cursor::GatherCursor;

/// One `batch_forget` entry: a node and the lookup count to release.
#[derive(Debug, Clone, Copy)]
pub struct ForgetOne {
    pub node: NodeId,
    pub nlookup: u64,
}

/// The operation-specific payload of a parsed request.
#[derive(Debug)]
pub enum RequestBody {
    Init {
        major: u32,
        minor: u32,
        max_readahead: u32,
        flags: u32,
    },
    Destroy,
    Lookup {
        name: OsString,
    },
    Forget {
        nlookup: u64,
    },
    BatchForget {
        items: Vec<ForgetOne>,
    },
    GetAttr {
        fh: Option<FileHandleId>,
    },
    SetAttr {
        valid: u32,
        fh: Option<FileHandleId>,
        size: Option<u64>,
        atime: Option<(u64, u32)>,
        mtime: Option<(u64, u32)>,
        ctime: Option<(u64, u32)>,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
    },
    ReadLink,
    Symlink {
        name: OsString,
        target: OsString,
    },
    MkNod {
        name: OsString,
        mode: u32,
        rdev: u32,
        umask: u32,
    },
    MkDir {
        name: OsString,
        mode: u32,
        umask: u32,
    },
    Unlink {
        name: OsString,
    },
    RmDir {
        name: OsString,
    },
    Rename {
        name: OsString,
        new_parent: NodeId,
        new_name: OsString,
        flags: u32,
    },
    Link {
        existing_node: NodeId,
        new_name: OsString,
    },
    Open {
        flags: i32,
    },
    Read {
        fh: FileHandleId,
        offset: u64,
        size: u32,
    },
    Write {
        fh: FileHandleId,
        offset: u64,
        data: Vec<u8>,
    },
    StatFs,
    Release {
        fh: FileHandleId,
        flags: i32,
    },
    FSync {
        fh: FileHandleId,
        datasync: bool,
    },
    SetXAttr {
        name: OsString,
        value: Vec<u8>,
        flags: i32,
    },
    GetXAttr {
        name: OsString,
        size: u32,
    },
    ListXAttr {
        size: u32,
    },
    RemoveXAttr {
        name: OsString,
    },
    Flush {
        fh: FileHandleId,
    },
    OpenDir {
        flags: i32,
    },
    ReadDir {
        fh: FileHandleId,
        offset: i64,
    },
    ReleaseDir {
        fh: FileHandleId,
    },
    FSyncDir {
        fh: FileHandleId,
        datasync: bool,
    },
    Create {
        name: OsString,
        flags: i32,
        mode: u32,
        umask: u32,
    },
    Interrupt {
        target: RequestId,
    },
    Fallocate {
        fh: FileHandleId,
        offset: u64,
        length: u64,
        mode: i32,
    },
    CopyFileRange {
        fh_in: FileHandleId,
        off_in: u64,
        node_out: NodeId,
        fh_out: FileHandleId,
        off_out: u64,
        len: u64,
        flags: u64,
    },
    /// A recognized opcode this dispatcher never services (§4.4 NoSys
    /// list): BMAP, IOCTL, POLL, SETUPMAPPING, REMOVEMAPPING, SYNCFS,
    /// GETLK, SETLK, SETLKW, ACCESS.
    Unsupported,
    /// An opcode value this build's `fuse_opcode` doesn't recognize at all.
    Unknown,
}

/// A fully parsed FUSE request: the 40-byte header plus its decoded body.
#[derive(Debug)]
pub struct Request {
    pub unique: RequestId,
    pub nodeid: NodeId,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub raw_opcode: u32,
    pub body: RequestBody,
}

/// Parses one request out of `buffers` (§4.4 step 2-3).
pub fn parse_request(buffers: &[&[u8]]) -> Result<Request, Error> {
    let mut cursor = GatherCursor::new(buffers);
    let header: fuse_in_header = cursor.fetch()?;
    let unique = RequestId(header.unique);
    let nodeid = NodeId(header.nodeid);

    let opcode = match fuse_opcode::try_from(header.opcode) {
        Ok(op) => op,
        Err(_) => {
            return Ok(Request {
                unique,
                nodeid,
                uid: header.uid,
                gid: header.gid,
                pid: header.pid,
                raw_opcode: header.opcode,
                body: RequestBody::Unknown,
            });
        }
    };

    let body = parse_body(opcode, &mut cursor)?;

    Ok(Request {
        unique,
        nodeid,
        uid: header.uid,
        gid: header.gid,
        pid: header.pid,
        raw_opcode: header.opcode,
        body,
    })
}

fn parse_body(opcode: fuse_opcode, cursor: &mut GatherCursor) -> Result<RequestBody, Error> {
    use fuse_opcode::*;
    let body = match opcode {
        FUSE_INIT => {
            let init: fuse_init_in = cursor.fetch()?;
            RequestBody::Init {
                major: init.major,
                minor: init.minor,
                max_readahead: init.max_readahead,
                flags: init.flags,
            }
        }
        FUSE_DESTROY => RequestBody::Destroy,
        FUSE_LOOKUP => RequestBody::Lookup {
            name: cursor.fetch_str()?,
        },
        FUSE_FORGET => {
            let forget: fuse_forget_in = cursor.fetch()?;
            RequestBody::Forget {
                nlookup: forget.nlookup,
            }
        }
        FUSE_BATCH_FORGET => {
            let header: fuse_batch_forget_in = cursor.fetch()?;
            let mut items = Vec::with_capacity(header.count as usize);
            for _ in 0..header.count {
                let one: fuse_forget_one = cursor.fetch()?;
                items.push(ForgetOne {
                    node: NodeId(one.nodeid),
                    nlookup: one.nlookup,
                });
            }
            RequestBody::BatchForget { items }
        }
        FUSE_GETATTR => {
            let getattr: fuse_getattr_in = cursor.fetch()?;
            let fh = if getattr.getattr_flags & consts::FATTR_FH != 0 {
                Some(FileHandleId(getattr.fh))
            } else {
                None
            };
            RequestBody::GetAttr { fh }
        }
        FUSE_SETATTR => {
            // Older initiators may send the 56-byte compat struct missing
            // the trailing uid/gid/unused5 fields; handled by fetch's
            // fixed-size struct shape matching FUSE_COMPAT_SETATTR_IN_SIZE
            // exactly (both share the same prefix layout up to `unused4`).
            let remaining = cursor.remaining();
            let setattr: fuse_setattr_in = if remaining >= size_of::<fuse_setattr_in>() {
                cursor.fetch()?
            } else if remaining >= consts::FUSE_COMPAT_SETATTR_IN_SIZE {
                let mut bytes = [0u8; consts::FUSE_COMPAT_SETATTR_IN_SIZE];
                cursor.copy_to(&mut bytes)?;
                let mut padded = vec![0u8; size_of::<fuse_setattr_in>()];
                padded[..bytes.len()].copy_from_slice(&bytes);
                zerocopy::FromBytes::read_from_bytes(&padded[..])
                    .map_err(|_| Error::new(Kind::Invalid).context("malformed setattr"))?
            } else {
                return Err(Error::new(Kind::Invalid).context("setattr request too short"));
            };
            RequestBody::SetAttr {
                valid: setattr.valid,
                fh: (setattr.valid & consts::FATTR_FH != 0).then_some(FileHandleId(setattr.fh)),
                size: (setattr.valid & consts::FATTR_SIZE != 0).then_some(setattr.size),
                atime: (setattr.valid & consts::FATTR_ATIME != 0)
                    .then_some((setattr.atime, setattr.atimensec)),
                mtime: (setattr.valid & consts::FATTR_MTIME != 0)
                    .then_some((setattr.mtime, setattr.mtimensec)),
                ctime: (setattr.valid & consts::FATTR_CTIME != 0)
                    .then_some((setattr.ctime, setattr.ctimensec)),
                mode: (setattr.valid & consts::FATTR_MODE != 0).then_some(setattr.mode),
                uid: (setattr.valid & consts::FATTR_UID != 0).then_some(setattr.uid),
                gid: (setattr.valid & consts::FATTR_GID != 0).then_some(setattr.gid),
            }
        }
        FUSE_READLINK => RequestBody::ReadLink,
        FUSE_SYMLINK => {
            let name = cursor.fetch_str()?;
            let target = cursor.fetch_str()?;
            RequestBody::Symlink { name, target }
        }
        FUSE_MKNOD => {
            // Pre-7.12 initiators omit the trailing `padding` field,
            // sending only `FUSE_COMPAT_MKNOD_IN_SIZE` (8) bytes.
            let remaining = cursor.remaining();
            let fixed_len = if remaining >= size_of::<fuse_mknod_in>() {
                size_of::<fuse_mknod_in>()
            } else {
                consts::FUSE_COMPAT_MKNOD_IN_SIZE
            };
            let mut bytes = vec![0u8; fixed_len];
            cursor.copy_to(&mut bytes)?;
            bytes.resize(size_of::<fuse_mknod_in>(), 0);
            let mknod: fuse_mknod_in = zerocopy::FromBytes::read_from_bytes(&bytes[..])
                .map_err(|_| Error::new(Kind::Invalid).context("malformed mknod"))?;
            let name = cursor.fetch_str()?;
            RequestBody::MkNod {
                name,
                mode: mknod.mode,
                rdev: mknod.rdev,
                umask: mknod.umask,
            }
        }
        FUSE_MKDIR => {
            let mkdir: fuse_mkdir_in = cursor.fetch()?;
            let name = cursor.fetch_str()?;
            RequestBody::MkDir {
                name,
                mode: mkdir.mode,
                umask: mkdir.umask,
            }
        }
        FUSE_UNLINK => RequestBody::Unlink {
            name: cursor.fetch_str()?,
        },
        FUSE_RMDIR => RequestBody::RmDir {
            name: cursor.fetch_str()?,
        },
        FUSE_RENAME => {
            let rename: fuse_rename_in = cursor.fetch()?;
            let name = cursor.fetch_str()?;
            let new_name = cursor.fetch_str()?;
            RequestBody::Rename {
                name,
                new_parent: NodeId(rename.newdir),
                new_name,
                flags: 0,
            }
        }
        FUSE_RENAME2 => {
            let rename: fuse_rename2_in = cursor.fetch()?;
            let name = cursor.fetch_str()?;
            let new_name = cursor.fetch_str()?;
            RequestBody::Rename {
                name,
                new_parent: NodeId(rename.newdir),
                new_name,
                flags: rename.flags,
            }
        }
        FUSE_LINK => {
            // `header.nodeid` carries the *target* directory; the wire
            // struct's `oldnodeid` is the existing inode being linked in.
            let link: fuse_link_in = cursor.fetch()?;
            let new_name = cursor.fetch_str()?;
            RequestBody::Link {
                existing_node: NodeId(link.oldnodeid),
                new_name,
            }
        }
        FUSE_OPEN => {
            let open: fuse_open_in = cursor.fetch()?;
            RequestBody::Open {
                flags: open.flags as i32,
            }
        }
        FUSE_READ => {
            let remaining = cursor.remaining();
            let read: fuse_read_in = if remaining >= size_of::<fuse_read_in>() {
                cursor.fetch()?
            } else {
                // Pre-7.9 initiators send only fh/offset/size/padding, 24
                // bytes — the same size as the write-side compat struct.
                let mut bytes = vec![0u8; remaining.min(consts::FUSE_COMPAT_WRITE_IN_SIZE)];
                cursor.copy_to(&mut bytes)?;
                bytes.resize(size_of::<fuse_read_in>(), 0);
                zerocopy::FromBytes::read_from_bytes(&bytes[..])
                    .map_err(|_| Error::new(Kind::Invalid).context("malformed read"))?
            };
            RequestBody::Read {
                fh: FileHandleId(read.fh),
                offset: read.offset,
                size: read.size,
            }
        }
        FUSE_WRITE => {
            let remaining = cursor.remaining();
            let write: fuse_write_in = if remaining >= size_of::<fuse_write_in>() {
                cursor.fetch()?
            } else if remaining >= consts::FUSE_COMPAT_WRITE_IN_SIZE {
                let mut bytes = vec![0u8; consts::FUSE_COMPAT_WRITE_IN_SIZE];
                cursor.copy_to(&mut bytes)?;
                bytes.resize(size_of::<fuse_write_in>(), 0);
                zerocopy::FromBytes::read_from_bytes(&bytes[..])
                    .map_err(|_| Error::new(Kind::Invalid).context("malformed write"))?
            } else {
                return Err(Error::new(Kind::Invalid).context("write request too short"));
            };
            let data = cursor.fetch_bytes(write.size as usize)?;
            RequestBody::Write {
                fh: FileHandleId(write.fh),
                offset: write.offset,
                data,
            }
        }
        FUSE_STATFS => RequestBody::StatFs,
        FUSE_RELEASE => {
            let release: fuse_release_in = cursor.fetch()?;
            RequestBody::Release {
                fh: FileHandleId(release.fh),
                flags: release.flags as i32,
            }
        }
        FUSE_FSYNC => {
            let fsync: fuse_fsync_in = cursor.fetch()?;
            RequestBody::FSync {
                fh: FileHandleId(fsync.fh),
                datasync: fsync.fsync_flags & 0x1 != 0,
            }
        }
        FUSE_SETXATTR => {
            let setxattr: fuse_setxattr_in = cursor.fetch()?;
            let name = cursor.fetch_str()?;
            let value = cursor.fetch_bytes(setxattr.size as usize)?;
            RequestBody::SetXAttr {
                name,
                value,
                flags: setxattr.flags as i32,
            }
        }
        FUSE_GETXATTR => {
            let getxattr: fuse_getxattr_in = cursor.fetch()?;
            let name = cursor.fetch_str()?;
            RequestBody::GetXAttr {
                name,
                size: getxattr.size,
            }
        }
        FUSE_LISTXATTR => {
            let getxattr: fuse_getxattr_in = cursor.fetch()?;
            RequestBody::ListXAttr {
                size: getxattr.size,
            }
        }
        FUSE_REMOVEXATTR => RequestBody::RemoveXAttr {
            name: cursor.fetch_str()?,
        },
        FUSE_FLUSH => {
            let flush: fuse_flush_in = cursor.fetch()?;
            RequestBody::Flush {
                fh: FileHandleId(flush.fh),
            }
        }
        FUSE_OPENDIR => {
            let open: fuse_open_in = cursor.fetch()?;
            RequestBody::OpenDir {
                flags: open.flags as i32,
            }
        }
        FUSE_READDIR | FUSE_READDIRPLUS => {
            let read: fuse_read_in = cursor.fetch()?;
            RequestBody::ReadDir {
                fh: FileHandleId(read.fh),
                offset: read.offset as i64,
            }
        }
        FUSE_RELEASEDIR => {
            let release: fuse_release_in = cursor.fetch()?;
            RequestBody::ReleaseDir {
                fh: FileHandleId(release.fh),
            }
        }
        FUSE_FSYNCDIR => {
            let fsync: fuse_fsync_in = cursor.fetch()?;
            RequestBody::FSyncDir {
                fh: FileHandleId(fsync.fh),
                datasync: fsync.fsync_flags & 0x1 != 0,
            }
        }
        FUSE_CREATE => {
            let create: fuse_create_in = cursor.fetch()?;
            let name = cursor.fetch_str()?;
            RequestBody::Create {
                name,
                flags: create.flags as i32,
                mode: create.mode,
                umask: create.umask,
            }
        }
        FUSE_INTERRUPT => {
            let interrupt: fuse_interrupt_in = cursor.fetch()?;
            RequestBody::Interrupt {
                target: RequestId(interrupt.unique),
            }
        }
        FUSE_FALLOCATE => {
            let fallocate: fuse_fallocate_in = cursor.fetch()?;
            RequestBody::Fallocate {
                fh: FileHandleId(fallocate.fh),
                offset: fallocate.offset,
                length: fallocate.length,
                mode: fallocate.mode as i32,
            }
        }
        FUSE_COPY_FILE_RANGE => {
            let copy: fuse_copy_file_range_in = cursor.fetch()?;
            RequestBody::CopyFileRange {
                fh_in: FileHandleId(copy.fh_in),
                off_in: copy.off_in,
                node_out: NodeId(copy.nodeid_out),
                fh_out: FileHandleId(copy.fh_out),
                off_out: copy.off_out,
                len: copy.len,
                flags: copy.flags,
            }
        }
        FUSE_BMAP | FUSE_IOCTL | FUSE_POLL | FUSE_SETUPMAPPING | FUSE_REMOVEMAPPING
        | FUSE_SYNCFS | FUSE_GETLK | FUSE_SETLK | FUSE_SETLKW | FUSE_ACCESS
        | FUSE_NOTIFY_REPLY | FUSE_LSEEK => RequestBody::Unsupported,
    };
    Ok(body)
}

#[cfg(test)]
mod test {
    use super::*;
    use zerocopy::IntoBytes;

    fn header(opcode: u32, unique: u64, nodeid: u64, len: u32) -> fuse_in_header {
        fuse_in_header {
            len,
            opcode,
            unique,
            nodeid,
            uid: 1000,
            gid: 1000,
            pid: 42,
            padding: 0,
        }
    }

    #[test]
    fn parses_lookup() {
        let h = header(fuse_opcode::FUSE_LOOKUP as u32, 7, 1, 0);
        let mut body = h.as_bytes().to_vec();
        body.extend_from_slice(b"hello.txt\0");
        let buffers: [&[u8]; 1] = [&body];
        let request = parse_request(&buffers).unwrap();
        assert_eq!(request.unique, RequestId(7));
        match request.body {
            RequestBody::Lookup { name } => assert_eq!(name, "hello.txt"),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn parses_legacy_mknod_without_padding() {
        let h = header(fuse_opcode::FUSE_MKNOD as u32, 1, 1, 0);
        let mut body = h.as_bytes().to_vec();
        body.extend_from_slice(&0o644u32.to_ne_bytes());
        body.extend_from_slice(&0u32.to_ne_bytes());
        body.extend_from_slice(&0o022u32.to_ne_bytes());
        body.extend_from_slice(b"node\0");
        let buffers: [&[u8]; 1] = [&body];
        let request = parse_request(&buffers).unwrap();
        match request.body {
            RequestBody::MkNod { name, mode, umask, .. } => {
                assert_eq!(name, "node");
                assert_eq!(mode, 0o644);
                assert_eq!(umask, 0o022);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn unknown_opcode_does_not_error() {
        let h = header(9999, 1, 1, 0);
        let buffers: [&[u8]; 1] = [h.as_bytes()];
        let request = parse_request(&buffers).unwrap();
        assert!(matches!(request.body, RequestBody::Unknown));
    }

    #[test]
    fn interrupt_carries_target_unique() {
        let h = header(fuse_opcode::FUSE_INTERRUPT as u32, 2, 0, 0);
        let mut body = h.as_bytes().to_vec();
        body.extend_from_slice(&99u64.to_ne_bytes());
        let buffers: [&[u8]; 1] = [&body];
        let request = parse_request(&buffers).unwrap();
        match request.body {
            RequestBody::Interrupt { target } => assert_eq!(target, RequestId(99)),
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
