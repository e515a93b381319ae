//! Async variants of the per-file operations, for tokio-based callers.
//!
//! The wire formats and hash values are identical to the blocking
//! implementations; only the I/O traits differ. The patch applier works
//! from an in-memory patch buffer (one file transfer's worth), seeking the
//! basis and writing the output asynchronously.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{PatchDecoder, PatchEncoder, PatchRecord};
use crate::delta::{generate_delta, DeltaEvent};
use crate::error::{EspejoError, Result};
use crate::rolling::RollingHash;
use crate::strong::{StreamHasher, StreamSum, StrongSig};
use crate::sum::{BlockSum, FileInfo, FileSum};

/// Summarize an async stream into fixed-size blocks.
///
/// Matches [`crate::summarize_with_block_size`] bit-for-bit.
///
/// # Errors
///
/// Returns an I/O error if reading fails.
pub async fn summarize<R>(mut reader: R, info: FileInfo, block_size: u32) -> Result<FileSum>
where
    R: AsyncRead + Unpin,
{
    let mut out = FileSum {
        info,
        block_size,
        blocks: Vec::new(),
    };
    let mut fast = RollingHash::new(block_size);
    let mut block = vec![0u8; block_size as usize];
    loop {
        let mut filled = 0;
        while filled < block.len() {
            let n = reader.read(&mut block[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        fast.write(&block[..filled]);
        #[allow(clippy::cast_possible_truncation)]
        out.blocks.push(BlockSum {
            fast: fast.sum(),
            strong: StrongSig::compute(&block[..filled]),
            size: filled as u32,
        });
        fast.reset();
        if filled < block.len() {
            break;
        }
    }
    Ok(out)
}

/// Read an async source to its end and encode a patch against `sink_sum`.
///
/// Returns the encoded patch bytes and the source's stream hash.
///
/// # Errors
///
/// Returns an I/O error if reading fails.
pub async fn generate_patch<R>(mut src: R, sink_sum: &FileSum) -> Result<(Vec<u8>, StreamSum)>
where
    R: AsyncRead + Unpin,
{
    let mut source = Vec::new();
    src.read_to_end(&mut source).await?;
    let stream_sum = StreamSum::compute(&source);

    let mut wire = Vec::new();
    let mut enc = PatchEncoder::new(&mut wire);
    generate_delta(std::io::Cursor::new(&source), sink_sum, |event| {
        match event {
            DeltaEvent::Literal(data) => enc.write_literal(data),
            DeltaEvent::BlockRef(index) => enc.write_block_ref(index),
        }
        .map(|n| n as u64)
    })?;
    Ok((wire, stream_sum))
}

/// Apply an encoded patch buffer against an async basis, producing the new
/// content and its stream hash.
///
/// # Errors
///
/// `InvalidPatch` for malformed buffers or out-of-range block references;
/// I/O errors otherwise.
pub async fn apply_patch<B, W>(
    mut basis: B,
    sink_sum: &FileSum,
    patch: &[u8],
    mut out: W,
) -> Result<StreamSum>
where
    B: AsyncRead + AsyncSeek + Unpin,
    W: AsyncWrite + Unpin,
{
    // The patch buffer is already in memory; lift it into owned records so
    // each can be applied at an await point.
    let mut records: Vec<OwnedRecord> = Vec::new();
    PatchDecoder::new(patch).decode(|record| {
        match record {
            PatchRecord::BlockRef(index) => records.push(OwnedRecord::BlockRef(index)),
            PatchRecord::Literal(r) => {
                let mut data = Vec::new();
                std::io::Read::read_to_end(r, &mut data)?;
                records.push(OwnedRecord::Literal(data));
            }
        }
        Ok(0)
    })?;

    let mut hasher = StreamHasher::new();
    for record in records {
        match record {
            OwnedRecord::BlockRef(index) => {
                let Some(block) = sink_sum.blocks.get(index as usize) else {
                    return Err(EspejoError::invalid_patch(format!(
                        "block {index} out of range (max {})",
                        sink_sum.blocks.len()
                    )));
                };
                let offset = u64::from(sink_sum.block_size) * u64::from(index);
                basis.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; block.size as usize];
                basis.read_exact(&mut buf).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        EspejoError::invalid_patch(format!(
                            "basis short-read while copying block {index}"
                        ))
                    } else {
                        EspejoError::Io(e)
                    }
                })?;
                out.write_all(&buf).await?;
                hasher.update(&buf);
            }
            OwnedRecord::Literal(data) => {
                out.write_all(&data).await?;
                hasher.update(&data);
            }
        }
    }
    out.flush().await?;
    Ok(hasher.finish())
}

enum OwnedRecord {
    BlockRef(u32),
    Literal(Vec<u8>),
}
