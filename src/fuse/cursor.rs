//! Zero-copy(-ish) cursors over FUSE's gather/scatter buffer lists (§4.4
//! step 2: "a cursor that handles scattered buffers").
//!
//! The kernel hands the dispatcher a *list* of input buffers and a list of
//! output buffers rather than one contiguous region each. Most requests fit
//! entirely inside the first buffer, so the common path is a direct
//! zero-copy read/write; a fixed-size struct that would straddle a buffer
//! boundary falls back to a small stack copy.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Kind};

/// A read cursor over `&[&[u8]]`.
pub struct GatherCursor<'a> {
    buffers: &'a [&'a [u8]],
    buf: usize,
    offset: usize,
}

impl<'a> GatherCursor<'a> {
    pub fn new(buffers: &'a [&'a [u8]]) -> Self {
        GatherCursor {
            buffers,
            buf: 0,
            offset: 0,
        }
    }

    /// Bytes remaining across every buffer from the current position.
    pub fn remaining(&self) -> usize {
        let mut total = 0;
        for (i, b) in self.buffers.iter().enumerate() {
            if i < self.buf {
                continue;
            }
            total += if i == self.buf {
                b.len().saturating_sub(self.offset)
            } else {
                b.len()
            };
        }
        total
    }

    fn advance(&mut self, mut n: usize) {
        while n > 0 && self.buf < self.buffers.len() {
            let left = self.buffers[self.buf].len() - self.offset;
            if n < left {
                self.offset += n;
                n = 0;
            } else {
                n -= left;
                self.buf += 1;
                self.offset = 0;
            }
        }
    }

    /// Copies exactly `len` bytes starting at the cursor into `out`,
    /// advancing the cursor. Fails with `Invalid` if fewer than `len` bytes
    /// remain.
    pub fn copy_to(&mut self, out: &mut [u8]) -> Result<(), Error> {
        let len = out.len();
        if self.remaining() < len {
            return Err(Error::new(Kind::Invalid).context("short read from gather buffers"));
        }
        let mut written = 0;
        let mut buf = self.buf;
        let mut offset = self.offset;
        while written < len {
            let chunk = self.buffers[buf];
            let avail = chunk.len() - offset;
            let take = avail.min(len - written);
            out[written..written + take].copy_from_slice(&chunk[offset..offset + take]);
            written += take;
            offset += take;
            if offset == chunk.len() {
                buf += 1;
                offset = 0;
            }
        }
        self.advance(len);
        Ok(())
    }

    /// Fetches a fixed-size POD struct, copying across a buffer boundary if
    /// necessary.
    pub fn fetch<T>(&mut self) -> Result<T, Error>
    where
        T: FromBytes + IntoBytes + KnownLayout + Immutable,
    {
        let size = size_of::<T>();
        // Fast path: entirely inside the current buffer, no copy needed
        // beyond what `read_from_bytes` already does.
        if self.buf < self.buffers.len() {
            let chunk = self.buffers[self.buf];
            if self.offset + size <= chunk.len() {
                let value = T::read_from_bytes(&chunk[self.offset..self.offset + size])
                    .map_err(|_| Error::new(Kind::Invalid).context("malformed fixed-size field"))?;
                self.advance(size);
                return Ok(value);
            }
        }
        let mut scratch = vec![0u8; size];
        self.copy_to(&mut scratch)?;
        T::read_from_bytes(&scratch)
            .map_err(|_| Error::new(Kind::Invalid).context("malformed fixed-size field"))
    }

    /// Fetches exactly `size` raw bytes, zero-copy if they fall inside one
    /// buffer, otherwise assembled into an owned `Vec`.
    pub fn fetch_bytes(&mut self, size: usize) -> Result<Vec<u8>, Error> {
        let mut out = vec![0u8; size];
        self.copy_to(&mut out)?;
        Ok(out)
    }

    /// Fetches a NUL-terminated name, stopping at (and consuming) the
    /// terminator.
    pub fn fetch_str(&mut self) -> Result<std::ffi::OsString, Error> {
        // Scan within the current buffer first, the common case.
        if self.buf < self.buffers.len() {
            let chunk = self.buffers[self.buf];
            if let Some(pos) = memchr::memchr(0, &chunk[self.offset..]) {
                let name = OsStr::from_bytes(&chunk[self.offset..self.offset + pos]).to_owned();
                self.advance(pos + 1);
                return Ok(name);
            }
        }
        // Slow path: the name straddles a buffer boundary.
        let mut bytes = Vec::new();
        loop {
            if self.buf >= self.buffers.len() {
                return Err(Error::new(Kind::Invalid).context("unterminated name"));
            }
            let chunk = self.buffers[self.buf];
            match memchr::memchr(0, &chunk[self.offset..]) {
                Some(pos) => {
                    bytes.extend_from_slice(&chunk[self.offset..self.offset + pos]);
                    self.advance(pos + 1);
                    break;
                }
                None => {
                    bytes.extend_from_slice(&chunk[self.offset..]);
                    self.advance(chunk.len() - self.offset);
                }
            }
        }
        Ok(OsStr::from_bytes(&bytes).to_owned())
    }
}

/// A write cursor over `&mut [&mut [u8]]`, used to serialize responses into
/// the kernel-supplied output buffer list.
pub struct ScatterWriter<'a> {
    buffers: &'a mut [&'a mut [u8]],
    buf: usize,
    offset: usize,
}

impl<'a> ScatterWriter<'a> {
    pub fn new(buffers: &'a mut [&'a mut [u8]]) -> Self {
        ScatterWriter {
            buffers,
            buf: 0,
            offset: 0,
        }
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        let mut total = 0;
        for (i, b) in self.buffers.iter().enumerate() {
            if i < self.buf {
                total += b.len();
            }
        }
        total + self.offset
    }

    /// Bytes still available to write across every remaining buffer.
    pub fn remaining_capacity(&self) -> usize {
        let mut total = if self.buf < self.buffers.len() {
            self.buffers[self.buf].len() - self.offset
        } else {
            0
        };
        for b in self.buffers.iter().skip(self.buf + 1) {
            total += b.len();
        }
        total
    }

    /// Writes `data`, spanning buffers as needed. Fails with `Invalid` if
    /// there isn't enough room.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() > self.remaining_capacity() {
            return Err(Error::new(Kind::Invalid).context("scatter buffers exhausted"));
        }
        let mut written = 0;
        while written < data.len() {
            let chunk = &mut self.buffers[self.buf];
            let avail = chunk.len() - self.offset;
            let take = avail.min(data.len() - written);
            chunk[self.offset..self.offset + take]
                .copy_from_slice(&data[written..written + take]);
            written += take;
            self.offset += take;
            if self.offset == chunk.len() && written < data.len() {
                self.buf += 1;
                self.offset = 0;
            }
        }
        Ok(())
    }

    /// Writes a POD struct's byte representation.
    pub fn write_struct<T: IntoBytes + Immutable>(&mut self, value: &T) -> Result<(), Error> {
        self.write(value.as_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zerocopy::{Immutable, IntoBytes, KnownLayout, FromBytes};

    #[derive(Debug, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
    #[repr(C)]
    struct Pair {
        a: u32,
        b: u32,
    }

    #[test]
    fn fetch_spans_buffer_boundary() {
        let a = [1u8, 0, 0, 0, 2];
        let b = [0u8, 0, 0, 9, 9];
        let buffers: [&[u8]; 2] = [&a, &b];
        let mut cursor = GatherCursor::new(&buffers);
        let pair: Pair = cursor.fetch().unwrap();
        assert_eq!(pair, Pair { a: 1, b: 2 });
    }

    #[test]
    fn fetch_str_within_one_buffer() {
        let data = b"hello\0world";
        let buffers: [&[u8]; 1] = [data];
        let mut cursor = GatherCursor::new(&buffers);
        let s = cursor.fetch_str().unwrap();
        assert_eq!(s, "hello");
        assert_eq!(cursor.remaining(), 5);
    }

    #[test]
    fn fetch_str_spans_buffer_boundary() {
        let a = b"hel";
        let b = b"lo\0world";
        let buffers: [&[u8]; 2] = [a, b];
        let mut cursor = GatherCursor::new(&buffers);
        let s = cursor.fetch_str().unwrap();
        assert_eq!(s, "hello");
    }

    #[test]
    fn short_read_is_invalid() {
        let a = [0u8; 2];
        let buffers: [&[u8]; 1] = [&a];
        let mut cursor = GatherCursor::new(&buffers);
        let err = cursor.fetch::<Pair>().unwrap_err();
        assert_eq!(err.kind(), Kind::Invalid);
    }

    #[test]
    fn scatter_write_spans_buffers() {
        let mut a = [0u8; 2];
        let mut b = [0u8; 2];
        let mut buffers: [&mut [u8]; 2] = [&mut a, &mut b];
        let mut writer = ScatterWriter::new(&mut buffers);
        writer.write(&[1, 2, 3]).unwrap();
        assert_eq!(a, [1, 2]);
        assert_eq!(b, [3, 0]);
        assert_eq!(writer.written(), 3);
    }
}
