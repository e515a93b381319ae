//! File summaries: per-block signatures over fixed-size blocks.
//!
//! A [`FileSum`] is derived state, never authoritative: it can always be
//! recomputed from the byte content. The block size is derived from the file
//! size on both sides of a transfer so that summaries stay symmetric.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::rolling::RollingHash;
use crate::strong::StrongSig;

/// Smallest permitted block size.
pub const MIN_BLOCK_SIZE: u32 = 128;

/// Largest permitted block size.
pub const MAX_BLOCK_SIZE: u32 = 131_072;

/// Files below this size use a fixed small block size.
const SMALL_FILE_CUTOFF: u64 = 490_000;

/// Block size used for small files.
const SMALL_FILE_BLOCK_SIZE: u32 = 700;

/// Block size policy, derived from the file size.
///
/// Small files use a fixed 700-byte block; larger files use the square root
/// of the size, capped at 128 KiB. The result never goes below
/// [`MIN_BLOCK_SIZE`].
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
pub fn block_size_for(file_size: u64) -> u32 {
    if file_size < SMALL_FILE_CUTOFF {
        return SMALL_FILE_BLOCK_SIZE;
    }
    let root = (file_size as f64).sqrt() as u32;
    root.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
}

/// Metadata of one tree entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Entry name; never contains a path separator.
    pub name: String,
    /// Content size in bytes; for directories, the recursive sum of
    /// contained file sizes.
    pub size: u64,
    /// Unix mode bits.
    pub mode: u32,
    /// Modification time, whole seconds since the Unix epoch.
    pub mtime: i64,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

impl FileInfo {
    /// Build entry metadata from filesystem metadata.
    #[must_use]
    pub fn from_metadata(name: &str, meta: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::MetadataExt;
            meta.mode()
        };
        #[cfg(not(unix))]
        let mode = if meta.is_dir() { 0o755 } else { 0o644 };

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(0));

        Self {
            name: name.to_string(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            mode,
            mtime,
            is_dir: meta.is_dir(),
        }
    }

    /// Normalized form used for change detection: permission bits only,
    /// whole-second mtime, and no size contribution for directories.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            name: self.name.clone(),
            size: if self.is_dir { 0 } else { self.size },
            mode: self.mode & 0o7777,
            mtime: self.mtime,
            is_dir: self.is_dir,
        }
    }
}

/// Signature of a single block: fast rolling hash, strong fingerprint, size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSum {
    /// 32-bit rolling hash of the block.
    pub fast: u32,
    /// 256-bit fingerprint confirming fast-hash hits.
    pub strong: StrongSig,
    /// Block length; only the final block of a file may be short.
    pub size: u32,
}

/// Complete block summary of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSum {
    /// Metadata of the summarized file.
    pub info: FileInfo,
    /// Block size every non-final block was cut at.
    pub block_size: u32,
    /// Per-block signatures, in file order.
    pub blocks: Vec<BlockSum>,
}

impl FileSum {
    /// Number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the file had no content.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Sum of all block sizes; equals the summarized content length.
    #[must_use]
    pub fn content_len(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.size)).sum()
    }
}

/// Summarize a stream with the block size derived from `info.size`.
///
/// # Errors
///
/// Returns an I/O error if reading fails.
pub fn summarize<R: Read>(reader: &mut R, info: FileInfo) -> Result<FileSum> {
    let block_size = block_size_for(info.size);
    summarize_with_block_size(reader, info, block_size)
}

/// Summarize a stream into fixed-size blocks.
///
/// Blocks are read in order; the final block may be short; an empty stream
/// yields zero blocks. The rolling hash is reset between blocks so each
/// `fast` signature covers exactly one block.
///
/// # Errors
///
/// Returns an I/O error if reading fails.
///
/// # Panics
///
/// Panics on a zero block size.
pub fn summarize_with_block_size<R: Read>(
    reader: &mut R,
    info: FileInfo,
    block_size: u32,
) -> Result<FileSum> {
    assert!(block_size > 0, "block size must be non-zero");
    let mut out = FileSum {
        info,
        block_size,
        blocks: Vec::new(),
    };

    let mut fast = RollingHash::new(block_size);
    let mut block = vec![0u8; block_size as usize];
    loop {
        let n = read_block(reader, &mut block)?;
        if n == 0 {
            break;
        }
        fast.write(&block[..n]);
        #[allow(clippy::cast_possible_truncation)]
        out.blocks.push(BlockSum {
            fast: fast.sum(),
            strong: StrongSig::compute(&block[..n]),
            size: n as u32,
        });
        fast.reset();
        if n < block.len() {
            break;
        }
    }
    Ok(out)
}

/// Check whether a stream produces exactly the block signatures in `sum`.
///
/// Short-circuits on the first mismatching block; a stream with more or
/// fewer blocks than the summary never matches.
///
/// # Errors
///
/// Returns an I/O error if reading fails.
pub fn file_matches_sum<R: Read>(reader: &mut R, sum: &FileSum) -> Result<bool> {
    let mut fast = RollingHash::new(sum.block_size);
    let mut block = vec![0u8; sum.block_size as usize];
    let mut index = 0usize;
    loop {
        let n = read_block(reader, &mut block)?;
        if n == 0 {
            break;
        }
        let Some(expect) = sum.blocks.get(index) else {
            return Ok(false); // stream has more blocks than the summary
        };
        if expect.size as usize != n {
            return Ok(false);
        }
        fast.write(&block[..n]);
        if fast.sum() != expect.fast {
            return Ok(false);
        }
        if StrongSig::compute(&block[..n]) != expect.strong {
            return Ok(false);
        }
        fast.reset();
        index += 1;
        if n < block.len() {
            break;
        }
    }
    Ok(index == sum.blocks.len())
}

/// Fill `buf` as far as the reader allows; returns bytes read (0 at EOF).
pub(crate) fn read_block<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
