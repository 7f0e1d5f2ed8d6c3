// SPDX-License-Identifier: Apache-2.0

use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

/// Largest block hashed at either end of a file.
pub const MAX_BLOCK_SIZE: u64 = 512;

/// A fingerprint identifies a file by the MD5 of its first and last blocks.
///
/// Both blocks have the same size, `min(512, file size)`. When the file is no larger
/// than one block the last block starts at 0 and equals the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    block_size: u64,
    first: [u8; 16],
    last_offset: u64,
    last: [u8; 16],
}

impl Fingerprint {
    /// Compute a fingerprint for `file` assuming it is `size` bytes long.
    ///
    /// Fails if the file is shorter than `size` when read.
    pub fn compute(file: &mut File, size: u64) -> io::Result<Self> {
        let block_size = size.min(MAX_BLOCK_SIZE);
        let first = part_hash(file, 0, block_size)?;

        let last_offset = size - block_size;
        let last = if last_offset == 0 {
            first
        } else {
            part_hash(file, last_offset, block_size)?
        };

        Ok(Self {
            block_size,
            first,
            last_offset,
            last,
        })
    }

    /// Rebuild a fingerprint from raw values (for deserialization).
    pub fn from_parts(block_size: u64, first: [u8; 16], last_offset: u64, last: [u8; 16]) -> Self {
        Self {
            block_size,
            first,
            last_offset,
            last,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn first(&self) -> &[u8; 16] {
        &self.first
    }

    pub fn last_offset(&self) -> u64 {
        self.last_offset
    }

    pub fn last(&self) -> &[u8; 16] {
        &self.last
    }

    /// Same block geometry and same hashes.
    pub fn same_blocks(&self, other: &Fingerprint) -> bool {
        self.block_size == other.block_size
            && self.first == other.first
            && self.last_offset == other.last_offset
            && self.last == other.last
    }
}

/// MD5 of `len` bytes of `file` starting at `offset`.
///
/// `len` must not exceed [`MAX_BLOCK_SIZE`]; a short read is an error.
pub fn part_hash(file: &mut File, offset: u64, len: u64) -> io::Result<[u8; 16]> {
    if len > MAX_BLOCK_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("block length {len} exceeds the maximum of {MAX_BLOCK_SIZE} bytes"),
        ));
    }

    let mut buf = [0u8; MAX_BLOCK_SIZE as usize];
    let buf = &mut buf[..len as usize];

    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)?;

    let mut hasher = Md5::new();
    hasher.update(&*buf);

    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_small_file_head_equals_tail() {
        let file = file_with(b"hello world\n");
        let mut f = file.reopen().unwrap();

        let fp = Fingerprint::compute(&mut f, 12).unwrap();
        assert_eq!(fp.block_size(), 12);
        assert_eq!(fp.last_offset(), 0);
        assert_eq!(fp.first(), fp.last());
    }

    #[test]
    fn test_empty_file() {
        let file = file_with(b"");
        let mut f = file.reopen().unwrap();

        let fp = Fingerprint::compute(&mut f, 0).unwrap();
        assert_eq!(fp.block_size(), 0);
        assert_eq!(fp.first(), fp.last());
    }

    #[test]
    fn test_large_file_uses_tail_block() {
        let mut content = vec![b'a'; 1000];
        content.extend_from_slice(&[b'b'; 24]);
        let file = file_with(&content);
        let mut f = file.reopen().unwrap();

        let fp = Fingerprint::compute(&mut f, 1024).unwrap();
        assert_eq!(fp.block_size(), MAX_BLOCK_SIZE);
        assert_eq!(fp.last_offset(), 512);
        assert_ne!(fp.first(), fp.last());
    }

    #[test]
    fn test_same_content_same_fingerprint() {
        let a = file_with(b"line one\nline two\n");
        let b = file_with(b"line one\nline two\n");

        let fa = Fingerprint::compute(&mut a.reopen().unwrap(), 18).unwrap();
        let fb = Fingerprint::compute(&mut b.reopen().unwrap(), 18).unwrap();
        assert!(fa.same_blocks(&fb));
    }

    #[test]
    fn test_short_read_fails() {
        let file = file_with(b"abc");
        let mut f = file.reopen().unwrap();

        assert!(Fingerprint::compute(&mut f, 10).is_err());
    }

    #[test]
    fn test_part_hash_rejects_oversized_block() {
        let file = file_with(&[0u8; 1024]);
        let mut f = file.reopen().unwrap();

        let err = part_hash(&mut f, 0, 513).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
