//! Manifest codec.
//!
//! The control plane serves the file list as an Avro binary encoding
//! (wrapped in a Zstandard frame, which is the caller's concern) of:
//!
//! ```text
//! array<record { path: string, hash: string, size: long, mtime: long }>
//! ```
//!
//! Only the subset of Avro needed for this schema is implemented:
//!
//! - `long` is a zig-zag encoded variable-length integer.
//! - `string` is a `long` byte length followed by UTF-8 bytes.
//! - An array is a sequence of blocks. Each block starts with a `long`
//!   item count. A negative count is followed by the block's size in
//!   bytes and holds `|count|` items. A zero count ends the array.


use displaydoc::Display;

use crate::error::BmclResult;
use crate::file::BmclFile;

/// Longest valid encoding of a 64-bit varint.
const MAX_VARINT_LEN: usize = 10;

/// Upper bound on speculative allocation from an untrusted block count.
const RESERVE_LIMIT: usize = 1 << 16;

/// A manifest decoding error.
#[derive(Debug, Display, PartialEq, Eq)]
pub enum Error {
    /// Unexpected end of manifest at byte {0}.
    UnexpectedEof(usize),

    /// Variable-length integer at byte {0} is too long.
    VarintOverflow(usize),

    /// String at byte {0} is not valid UTF-8.
    InvalidUtf8(usize),

    /// Negative length {length} at byte {position}.
    NegativeLength { position: usize, length: i64 },

    /// Negative file size {size} for "{hash}".
    NegativeSize { hash: String, size: i64 },

    /// {0} trailing bytes after the end of the manifest.
    TrailingBytes(usize),
}

/// Decodes a manifest.
pub fn decode_files(buf: &[u8]) -> BmclResult<Vec<BmclFile>> {
    let mut reader = Reader { buf, pos: 0 };
    let mut files = Vec::new();

    loop {
        let mut count = reader.read_long()?;

        if count == 0 {
            break;
        }

        if count < 0 {
            // Block size is only a skipping hint
            let _ = reader.read_long()?;
            count = count.checked_neg().ok_or(Error::VarintOverflow(reader.pos))?;
        }

        files.reserve((count as usize).min(RESERVE_LIMIT));
        for _ in 0..count {
            files.push(reader.read_file()?);
        }
    }

    if reader.pos != buf.len() {
        return Err(Error::TrailingBytes(buf.len() - reader.pos).into());
    }

    Ok(files)
}

/// Encodes a manifest as a single block.
pub fn encode_files(files: &[BmclFile]) -> Vec<u8> {
    let mut buf = Vec::new();

    if !files.is_empty() {
        write_long(&mut buf, files.len() as i64);
        for file in files {
            write_string(&mut buf, &file.path);
            write_string(&mut buf, &file.hash);
            write_long(&mut buf, file.size as i64);
            write_long(&mut buf, file.mtime);
        }
    }

    write_long(&mut buf, 0);
    buf
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn read_file(&mut self) -> BmclResult<BmclFile> {
        let path = self.read_string()?;
        let hash = self.read_string()?;
        let size = self.read_long()?;
        let mtime = self.read_long()?;

        if size < 0 {
            return Err(Error::NegativeSize { hash, size }.into());
        }

        Ok(BmclFile {
            path,
            hash,
            size: size as u64,
            mtime,
        })
    }

    fn read_long(&mut self) -> BmclResult<i64> {
        let start = self.pos;
        let mut value: u64 = 0;

        for i in 0..MAX_VARINT_LEN {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(Error::UnexpectedEof(self.pos))?;
            self.pos += 1;

            value |= ((byte & 0x7f) as u64) << (7 * i);

            if byte & 0x80 == 0 {
                return Ok(((value >> 1) as i64) ^ -((value & 1) as i64));
            }
        }

        Err(Error::VarintOverflow(start).into())
    }

    fn read_string(&mut self) -> BmclResult<String> {
        let position = self.pos;
        let length = self.read_long()?;

        if length < 0 {
            return Err(Error::NegativeLength { position, length }.into());
        }

        let end = self
            .pos
            .checked_add(length as usize)
            .filter(|end| *end <= self.buf.len())
            .ok_or(Error::UnexpectedEof(self.buf.len()))?;

        let s = std::str::from_utf8(&self.buf[self.pos..end])
            .map_err(|_| Error::InvalidUtf8(self.pos))?
            .to_owned();
        self.pos = end;

        Ok(s)
    }
}

fn write_long(buf: &mut Vec<u8>, n: i64) {
    let mut v = ((n << 1) ^ (n >> 63)) as u64;

    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_long(buf, s.len() as i64);
    buf.extend_from_slice(s.as_bytes());
}
