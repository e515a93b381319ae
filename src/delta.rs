//! Rolling-hash delta generator.
//!
//! Matches a source stream against a sink's block summary and emits a patch
//! stream of block references and literal runs. Concatenating the referenced
//! sink blocks and the literals, in emission order, reproduces the source
//! exactly; that property is what the patcher relies on.

use std::io::{BufRead, BufReader, Read};

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::rolling::RollingHash;
use crate::strong::StrongSig;
use crate::sum::FileSum;

/// Cap on accumulated non-matching data before it is flushed as a literal.
pub const MAX_LITERAL: usize = 1 << 20;

/// One event emitted by the generator, in strict source order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaEvent<'a> {
    /// Verbatim source bytes the sink does not already hold.
    Literal(&'a [u8]),
    /// Reuse block `index` of the sink summary.
    BlockRef(u32),
}

/// Generate a delta from `src` against the sink summary `sink_sum`.
///
/// Events arrive through `emit` in source order; its return values
/// (typically bytes written to the wire) are summed and returned. Memory use
/// is bounded by the block size plus [`MAX_LITERAL`].
///
/// With an empty sink summary the source is scanned into bounded chunks and
/// emitted wholesale as literals. Otherwise each source byte rolls the fast
/// hash; a fast-index hit is confirmed against the block's strong
/// fingerprint before any literal prefix is flushed and the block reference
/// emitted. Fast-hash collisions map to the first block with that signature;
/// missing a colliding duplicate only costs compression, never correctness.
///
/// # Errors
///
/// Returns an I/O error if reading fails, or propagates `emit`'s error.
///
/// # Example
///
/// ```rust
/// use std::io::Cursor;
/// use espejo::{summarize_with_block_size, generate_delta, DeltaEvent, FileInfo};
///
/// let sink = b"hello";
/// let info = FileInfo {
///     name: "f".into(), size: 5, mode: 0o644, mtime: 0, is_dir: false,
/// };
/// let sum = summarize_with_block_size(&mut Cursor::new(&sink[..]), info, 4).unwrap();
///
/// let mut refs = 0;
/// generate_delta(Cursor::new(&b"hello world"[..]), &sum, |event| {
///     if let DeltaEvent::BlockRef(_) = event { refs += 1; }
///     Ok(0)
/// }).unwrap();
/// assert_eq!(refs, 2); // "hell" and "o" are reused from the sink
/// ```
pub fn generate_delta<R, F>(src: R, sink_sum: &FileSum, mut emit: F) -> Result<u64>
where
    R: Read,
    F: FnMut(DeltaEvent<'_>) -> Result<u64>,
{
    if sink_sum.blocks.is_empty() {
        return scan_and_emit_chunks(src, MAX_LITERAL, &mut emit);
    }

    // First block index per fast signature; colliding signatures keep the
    // first-inserted index and rely on the strong check for confirmation.
    let mut fast_index: FxHashMap<u32, u32> = FxHashMap::default();
    for (i, block) in sink_sum.blocks.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        fast_index.entry(block.fast).or_insert(i as u32);
    }

    let block_size = sink_sum.block_size as usize;
    let mut fast = RollingHash::new(sink_sum.block_size);
    let mut pending: Vec<u8> = Vec::with_capacity(block_size);
    let mut written = 0u64;

    let mut reader = BufReader::new(src);
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            // EOF: flush whatever non-matching data is still pending.
            if !pending.is_empty() {
                written += emit(DeltaEvent::Literal(&pending))?;
            }
            return Ok(written);
        }

        let mut consumed = 0;
        while consumed < buf.len() {
            let b = buf[consumed];
            consumed += 1;
            pending.push(b);
            let sig = fast.roll_byte(b);

            let Some(&index) = fast_index.get(&sig) else {
                if pending.len() >= MAX_LITERAL {
                    written += emit(DeltaEvent::Literal(&pending))?;
                    pending.clear();
                    fast.reset();
                }
                continue;
            };

            // Potential match over the trailing window; confirm it.
            let match_start = pending.len().saturating_sub(block_size);
            let strong = StrongSig::compute(&pending[match_start..]);
            if strong != sink_sum.blocks[index as usize].strong {
                if pending.len() >= MAX_LITERAL {
                    written += emit(DeltaEvent::Literal(&pending))?;
                    pending.clear();
                    fast.reset();
                }
                continue;
            }

            if match_start > 0 {
                written += emit(DeltaEvent::Literal(&pending[..match_start]))?;
            }
            written += emit(DeltaEvent::BlockRef(index))?;
            pending.clear();
            fast.reset();
        }
        reader.consume(consumed);
    }
}

/// Empty-sink path: forward the source as bounded literal chunks.
fn scan_and_emit_chunks<R, F>(mut src: R, chunk_size: usize, emit: &mut F) -> Result<u64>
where
    R: Read,
    F: FnMut(DeltaEvent<'_>) -> Result<u64>,
{
    let mut chunk = vec![0u8; chunk_size];
    let mut written = 0u64;
    loop {
        let n = crate::sum::read_block(&mut src, &mut chunk)?;
        if n == 0 {
            return Ok(written);
        }
        written += emit(DeltaEvent::Literal(&chunk[..n]))?;
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::sum::{summarize_with_block_size, FileInfo};
    use proptest::prelude::*;
    use std::io::Cursor;

    fn sum_of(data: &[u8], block_size: u32) -> FileSum {
        let info = FileInfo {
            name: "f".to_string(),
            size: data.len() as u64,
            mode: 0o644,
            mtime: 0,
            is_dir: false,
        };
        summarize_with_block_size(&mut Cursor::new(data), info, block_size).unwrap()
    }

    proptest! {
        /// Central correctness property: reassembling the emitted events
        /// against the sink reproduces the source byte-for-byte.
        #[test]
        fn roundtrip(
            sink in prop::collection::vec(any::<u8>(), 0..3000),
            src in prop::collection::vec(any::<u8>(), 0..3000),
            block_size in prop::sample::select(vec![128u32, 256, 512])
        ) {
            let sum = sum_of(&sink, block_size);
            let mut out = Vec::new();
            generate_delta(Cursor::new(&src), &sum, |event| {
                match event {
                    DeltaEvent::Literal(data) => out.extend_from_slice(data),
                    DeltaEvent::BlockRef(i) => {
                        let start = i as usize * block_size as usize;
                        let end = (start + block_size as usize).min(sink.len());
                        out.extend_from_slice(&sink[start..end]);
                    }
                }
                Ok(0)
            }).unwrap();
            prop_assert_eq!(out, src);
        }

        /// Identical block-aligned content never emits literals. (A short
        /// tail block could legitimately match early against a same-length
        /// window elsewhere in the stream, so alignment is fixed here.)
        #[test]
        fn identity_emits_no_literals(
            blocks in 1usize..16,
            seed in any::<u8>()
        ) {
            let data: Vec<u8> = (0..blocks * 128)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect();
            let sum = sum_of(&data, 128);
            let mut literal_bytes = 0usize;
            generate_delta(Cursor::new(&data), &sum, |event| {
                if let DeltaEvent::Literal(d) = event {
                    literal_bytes += d.len();
                }
                Ok(0)
            }).unwrap();
            prop_assert_eq!(literal_bytes, 0);
        }
    }
}
