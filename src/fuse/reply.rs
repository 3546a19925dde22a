//! Serializes an [`OperationOutput`] (or a bare error) into the kernel's
//! scatter buffer list (§4.4 step 6, §6 wire format).
//!
//! Every reply is a [`fuse_out_header`] followed by zero or more payload
//! bytes; `len` covers both, `error` is the negated errno on failure and
//! zero on success, and `unique` echoes the request it answers. Variable
//! length directory listings are built up to, but not past, the caller's
//! buffer capacity (§4.4 "stop before the entry that would overflow"),
//! padding each `fuse_dirent` record to an 8-byte boundary.

use std::time::Duration;

use zerocopy::IntoBytes;

use crate::error::Error;
use crate::fsdev::{FileAttr, FileType, RequestId};
use crate::fuse::abi::*;
use crate::fuse::cursor::ScatterWriter;
use crate::ops::{DirEntry, Statfs};

/// Default attribute/entry cache validity handed back to the initiator.
/// The core has no opinion on caching policy (§1 Non-goals); one second
/// matches the conservative default most in-tree backends use.
const DEFAULT_TTL: Duration = Duration::from_secs(1);

fn mode_bits(kind: FileType, perm: u16) -> u32 {
    let type_bits: u32 = match kind {
        FileType::NamedPipe => 0o010000,
        FileType::CharDevice => 0o020000,
        FileType::BlockDevice => 0o060000,
        FileType::Directory => 0o040000,
        FileType::RegularFile => 0o100000,
        FileType::Symlink => 0o120000,
        FileType::Socket => 0o140000,
    };
    type_bits | (perm as u32 & 0o7777)
}

/// The `fuse_dirent.typ` nibble (upper 4 bits of `st_mode >> 12`, per
/// `readdir(3)`'s `d_type` convention).
fn dirent_type(kind: FileType) -> u32 {
    match kind {
        FileType::NamedPipe => 1,
        FileType::CharDevice => 2,
        FileType::Directory => 4,
        FileType::BlockDevice => 6,
        FileType::RegularFile => 8,
        FileType::Symlink => 10,
        FileType::Socket => 12,
    }
}

fn to_fuse_attr(attr: &FileAttr) -> fuse_attr {
    let (atime, atimensec) = crate::time::time_from_system_time(&attr.atime);
    let (mtime, mtimensec) = crate::time::time_from_system_time(&attr.mtime);
    let (ctime, ctimensec) = crate::time::time_from_system_time(&attr.ctime);
    fuse_attr {
        ino: attr.ino.0,
        size: attr.size,
        blocks: attr.blocks,
        atime: atime as u64,
        mtime: mtime as u64,
        ctime: ctime as u64,
        atimensec,
        mtimensec,
        ctimensec,
        mode: mode_bits(attr.kind, attr.perm),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        padding: 0,
    }
}

/// Writes the 16-byte header plus a POD payload, returning the total bytes
/// written.
fn write_header_and<T: IntoBytes + zerocopy::Immutable>(
    writer: &mut ScatterWriter,
    unique: RequestId,
    payload: &T,
) -> Result<usize, Error> {
    let len = size_of::<fuse_out_header>() + size_of::<T>();
    let header = fuse_out_header {
        len: len as u32,
        error: 0,
        unique: unique.0,
    };
    writer.write_struct(&header)?;
    writer.write_struct(payload)?;
    Ok(len)
}

fn write_header_and_bytes(
    writer: &mut ScatterWriter,
    unique: RequestId,
    payload: &[u8],
) -> Result<usize, Error> {
    let len = size_of::<fuse_out_header>() + payload.len();
    let header = fuse_out_header {
        len: len as u32,
        error: 0,
        unique: unique.0,
    };
    writer.write_struct(&header)?;
    writer.write(payload)?;
    Ok(len)
}

/// Writes a bare success reply (header only, no payload).
pub fn write_empty(writer: &mut ScatterWriter, unique: RequestId) -> Result<usize, Error> {
    let header = fuse_out_header {
        len: size_of::<fuse_out_header>() as u32,
        error: 0,
        unique: unique.0,
    };
    writer.write_struct(&header)?;
    Ok(header.len as usize)
}

/// Writes an error reply. `errno` must already be the positive `E*` value;
/// this negates it as the wire format requires (§6, §7).
pub fn write_error(writer: &mut ScatterWriter, unique: RequestId, errno: i32) -> Result<usize, Error> {
    let header = fuse_out_header {
        len: size_of::<fuse_out_header>() as u32,
        error: -errno,
        unique: unique.0,
    };
    writer.write_struct(&header)?;
    Ok(header.len as usize)
}

/// `lookup`/`mkdir`/`mknod`/`symlink`/`link` success reply.
pub fn write_entry(
    writer: &mut ScatterWriter,
    unique: RequestId,
    node: crate::fsdev::NodeId,
    attr: &FileAttr,
) -> Result<usize, Error> {
    let out = fuse_entry_out {
        nodeid: node.0,
        generation: 0,
        entry_valid: DEFAULT_TTL.as_secs(),
        attr_valid: DEFAULT_TTL.as_secs(),
        entry_valid_nsec: DEFAULT_TTL.subsec_nanos(),
        attr_valid_nsec: DEFAULT_TTL.subsec_nanos(),
        attr: to_fuse_attr(attr),
    };
    write_header_and(writer, unique, &out)
}

/// `getattr`/`setattr` success reply.
pub fn write_attr(writer: &mut ScatterWriter, unique: RequestId, attr: &FileAttr) -> Result<usize, Error> {
    let out = fuse_attr_out {
        attr_valid: DEFAULT_TTL.as_secs(),
        attr_valid_nsec: DEFAULT_TTL.subsec_nanos(),
        dummy: 0,
        attr: to_fuse_attr(attr),
    };
    write_header_and(writer, unique, &out)
}

/// `init` success reply; capability flags are fixed by this dispatcher
/// rather than echoing whatever the initiator asked for (§6 "always
/// announces a fixed capability set"), except `FUSE_WRITEBACK_CACHE`, which
/// is mirrored back only when negotiation actually enabled it.
pub fn write_init(
    writer: &mut ScatterWriter,
    unique: RequestId,
    negotiated_minor: u32,
    max_write: u32,
    writeback_cache_enabled: bool,
) -> Result<usize, Error> {
    let mut flags = consts::FUSE_ASYNC_READ
        | consts::FUSE_ATOMIC_O_TRUNC
        | consts::FUSE_EXPORT_SUPPORT
        | consts::FUSE_BIG_WRITES
        | consts::FUSE_DO_READDIRPLUS
        | consts::FUSE_READDIRPLUS_AUTO;
    if writeback_cache_enabled {
        flags |= consts::FUSE_WRITEBACK_CACHE;
    }
    let out = fuse_init_out {
        major: FUSE_KERNEL_VERSION,
        minor: negotiated_minor,
        max_readahead: 0,
        flags,
        max_background: 0,
        congestion_threshold: 0,
        max_write,
        time_gran: 1,
        max_pages: 0,
        padding: 0,
        unused: [0; 8],
    };
    write_header_and(writer, unique, &out)
}

/// `create` success reply: `fuse_entry_out` immediately followed by
/// `fuse_open_out` under a single header, matching the real protocol's
/// "mknod + open in one round trip" wire shape (§4.3).
pub fn write_create(
    writer: &mut ScatterWriter,
    unique: RequestId,
    node: crate::fsdev::NodeId,
    attr: &FileAttr,
    fh: crate::fsdev::FileHandleId,
) -> Result<usize, Error> {
    let entry = fuse_entry_out {
        nodeid: node.0,
        generation: 0,
        entry_valid: DEFAULT_TTL.as_secs(),
        attr_valid: DEFAULT_TTL.as_secs(),
        entry_valid_nsec: DEFAULT_TTL.subsec_nanos(),
        attr_valid_nsec: DEFAULT_TTL.subsec_nanos(),
        attr: to_fuse_attr(attr),
    };
    let open = fuse_open_out {
        fh: fh.0,
        open_flags: consts::FOPEN_DIRECT_IO,
        padding: 0,
    };
    let len = size_of::<fuse_out_header>() + size_of::<fuse_entry_out>() + size_of::<fuse_open_out>();
    let header = fuse_out_header {
        len: len as u32,
        error: 0,
        unique: unique.0,
    };
    writer.write_struct(&header)?;
    writer.write_struct(&entry)?;
    writer.write_struct(&open)?;
    Ok(len)
}

/// `open`/`opendir`/`create`'s open half; always sets `FOPEN_DIRECT_IO`
/// (§6 "every open reply sets direct-io").
pub fn write_open(
    writer: &mut ScatterWriter,
    unique: RequestId,
    fh: crate::fsdev::FileHandleId,
) -> Result<usize, Error> {
    let out = fuse_open_out {
        fh: fh.0,
        open_flags: consts::FOPEN_DIRECT_IO,
        padding: 0,
    };
    write_header_and(writer, unique, &out)
}

/// `read` success reply: raw data, no fixed-size wrapper.
pub fn write_data(writer: &mut ScatterWriter, unique: RequestId, data: &[u8]) -> Result<usize, Error> {
    write_header_and_bytes(writer, unique, data)
}

/// `write` success reply.
pub fn write_write(writer: &mut ScatterWriter, unique: RequestId, size: u32) -> Result<usize, Error> {
    let out = fuse_write_out { size, padding: 0 };
    write_header_and(writer, unique, &out)
}

/// `statfs` success reply.
pub fn write_statfs(writer: &mut ScatterWriter, unique: RequestId, stats: &Statfs) -> Result<usize, Error> {
    let out = fuse_statfs_out {
        st: fuse_kstatfs {
            blocks: stats.blocks,
            bfree: stats.bfree,
            bavail: stats.bavail,
            files: stats.files,
            ffree: stats.ffree,
            bsize: stats.bsize,
            namelen: stats.namelen,
            frsize: stats.frsize,
            padding: 0,
            spare: [0; 6],
        },
    };
    write_header_and(writer, unique, &out)
}

/// `getxattr`/`listxattr` success reply with `size == 0` (size-probe).
pub fn write_xattr_size(writer: &mut ScatterWriter, unique: RequestId, size: u32) -> Result<usize, Error> {
    let out = fuse_getxattr_out { size, padding: 0 };
    write_header_and(writer, unique, &out)
}

/// `readlink` success reply (the target path, unterminated).
pub fn write_link(writer: &mut ScatterWriter, unique: RequestId, target: &std::ffi::OsStr) -> Result<usize, Error> {
    use std::os::unix::ffi::OsStrExt;
    write_header_and_bytes(writer, unique, target.as_bytes())
}

/// Rounds `n` up to the next multiple of 8 (FUSE's dirent alignment, §6).
fn round_to_8(n: usize) -> usize {
    (n + 7) & !7
}

/// `readdir` success reply: packs as many entries as fit in `capacity`,
/// stopping (without erroring) at the first one that wouldn't (§4.4).
///
/// Returns the serialized bytes and the number of entries actually
/// consumed, so the caller can report a short page without losing the
/// remainder on the next `readdir` call at the following offset.
pub fn write_dirents(
    writer: &mut ScatterWriter,
    unique: RequestId,
    entries: &[DirEntry],
    capacity: usize,
) -> Result<(usize, usize), Error> {
    use std::os::unix::ffi::OsStrExt;
    let header_len = size_of::<fuse_out_header>();
    let mut body = Vec::new();
    let mut consumed = 0;
    for entry in entries {
        let name = entry.name.as_bytes();
        let record_len = size_of::<fuse_dirent>() + name.len();
        let padded_len = round_to_8(record_len);
        if header_len + body.len() + padded_len > capacity {
            break;
        }
        let dirent = fuse_dirent {
            ino: entry.ino.0,
            off: entry.offset as u64,
            namelen: name.len() as u32,
            typ: dirent_type(entry.kind),
        };
        body.extend_from_slice(dirent.as_bytes());
        body.extend_from_slice(name);
        body.resize(body.len() + (padded_len - record_len), 0);
        consumed += 1;
    }
    let written = write_header_and_bytes(writer, unique, &body)?;
    Ok((written, consumed))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fsdev::NodeId;
    use std::time::SystemTime;
    use zerocopy::FromBytes;

    fn sample_attr() -> FileAttr {
        FileAttr {
            ino: NodeId(2),
            size: 4096,
            blocks: 8,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
        }
    }

    #[test]
    fn error_reply_negates_errno() {
        let mut a = [0u8; 16];
        let mut buffers: [&mut [u8]; 1] = [&mut a];
        let mut writer = ScatterWriter::new(&mut buffers);
        write_error(&mut writer, RequestId(5), libc::ENOENT).unwrap();
        let header = fuse_out_header::read_from_bytes(&a).unwrap();
        assert_eq!(header.error, -libc::ENOENT);
        assert_eq!(header.unique, 5);
    }

    #[test]
    fn entry_reply_has_correct_len() {
        let mut a = [0u8; 256];
        let mut buffers: [&mut [u8]; 1] = [&mut a];
        let mut writer = ScatterWriter::new(&mut buffers);
        let attr = sample_attr();
        let written = write_entry(&mut writer, RequestId(1), NodeId(2), &attr).unwrap();
        assert_eq!(written, size_of::<fuse_out_header>() + size_of::<fuse_entry_out>());
        assert_eq!(writer.written(), written);
    }

    #[test]
    fn dirents_stop_before_overflow() {
        let entries = vec![
            DirEntry {
                ino: NodeId(2),
                offset: 1,
                kind: FileType::RegularFile,
                name: "a".into(),
            },
            DirEntry {
                ino: NodeId(3),
                offset: 2,
                kind: FileType::RegularFile,
                name: "b".into(),
            },
        ];
        let mut buf = [0u8; 48];
        let mut buffers: [&mut [u8]; 1] = [&mut buf];
        let mut writer = ScatterWriter::new(&mut buffers);
        let (_written, consumed) = write_dirents(&mut writer, RequestId(1), &entries, 48).unwrap();
        assert_eq!(consumed, 1);
    }
}
