//! File patcher: reconstructs a new file from the old file plus a patch.
//!
//! Block references seek into the old file and copy that block's bytes;
//! literals copy verbatim from the patch stream. Every byte written also
//! feeds the 512-bit stream hash, which is the transfer's end-to-end
//! integrity check.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::codec::{PatchDecoder, PatchRecord};
use crate::error::{EspejoError, Result};
use crate::strong::{StreamHasher, StreamSum};
use crate::sum::FileSum;

const COPY_BUF_SIZE: usize = 8192;

/// Applies a decoded patch stream against the old file.
///
/// # Example
///
/// ```rust
/// use std::io::Cursor;
/// use espejo::{summarize_with_block_size, FilePatcher, FileInfo};
///
/// let old = b"hello";
/// let info = FileInfo {
///     name: "f".into(), size: 5, mode: 0o644, mtime: 0, is_dir: false,
/// };
/// let sum = summarize_with_block_size(&mut Cursor::new(&old[..]), info, 4).unwrap();
///
/// let mut out = Vec::new();
/// let mut patcher = FilePatcher::new(Cursor::new(&old[..]), &mut out, &sum);
/// patcher.apply_block_ref(0).unwrap();
/// patcher.apply_block_ref(1).unwrap();
/// patcher.apply_literal(&mut Cursor::new(&b" world"[..])).unwrap();
/// let stream_hash = patcher.finish();
/// assert_eq!(out, b"hello world");
/// assert_eq!(stream_hash, espejo::StreamSum::compute(b"hello world"));
/// ```
#[derive(Debug)]
pub struct FilePatcher<'a, R, W> {
    original: R,
    target: W,
    sum: &'a FileSum,
    hasher: StreamHasher,
    bytes_written: u64,
}

impl<'a, R, W> FilePatcher<'a, R, W>
where
    R: Read + Seek,
    W: Write,
{
    /// Wrap the old file, the new file's writer, and the sink summary the
    /// patch was generated against.
    pub fn new(original: R, target: W, sum: &'a FileSum) -> Self {
        Self {
            original,
            target,
            sum,
            hasher: StreamHasher::new(),
            bytes_written: 0,
        }
    }

    /// Copy block `index` of the old file into the target.
    /// Returns the number of bytes copied.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPatch` if the index is out of range or the old file
    /// yields fewer bytes than the block's recorded size.
    pub fn apply_block_ref(&mut self, index: u32) -> Result<u64> {
        let Some(block) = self.sum.blocks.get(index as usize) else {
            return Err(EspejoError::invalid_patch(format!(
                "block {index} out of range (max {})",
                self.sum.blocks.len()
            )));
        };
        let offset = u64::from(self.sum.block_size) * u64::from(index);
        self.original.seek(SeekFrom::Start(offset))?;

        let mut remaining = u64::from(block.size);
        let mut buf = [0u8; COPY_BUF_SIZE];
        while remaining > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let want = remaining.min(buf.len() as u64) as usize;
            let n = self.original.read(&mut buf[..want])?;
            if n == 0 {
                return Err(EspejoError::invalid_patch(format!(
                    "old file short-read while copying block {index}: {remaining} bytes missing"
                )));
            }
            self.write_out(&buf[..n])?;
            remaining -= n as u64;
        }
        Ok(u64::from(block.size))
    }

    /// Copy a bounded literal reader fully into the target.
    /// Returns the number of bytes copied.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading or writing fails.
    pub fn apply_literal<L: Read + ?Sized>(&mut self, literal: &mut L) -> Result<u64> {
        let mut copied = 0u64;
        let mut buf = [0u8; COPY_BUF_SIZE];
        loop {
            let n = literal.read(&mut buf)?;
            if n == 0 {
                return Ok(copied);
            }
            self.write_out(&buf[..n])?;
            copied += n as u64;
        }
    }

    /// Drive a whole patch stream through this patcher.
    /// Returns the total bytes written to the target.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPatch` on malformed streams, or an I/O error.
    pub fn apply_from<P: Read>(&mut self, patch: P) -> Result<u64> {
        PatchDecoder::new(patch).decode(|record| match record {
            PatchRecord::BlockRef(index) => self.apply_block_ref(index),
            PatchRecord::Literal(literal) => self.apply_literal(literal),
        })
    }

    /// Total bytes written so far.
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Finalize, yielding the stream hash over everything written.
    #[must_use]
    pub fn finish(self) -> StreamSum {
        self.hasher.finish()
    }

    fn write_out(&mut self, data: &[u8]) -> Result<()> {
        self.target.write_all(data)?;
        self.hasher.update(data);
        self.bytes_written += data.len() as u64;
        Ok(())
    }
}
