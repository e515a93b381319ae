//! Binary patch codec: a flat stream of block references and literal runs.
//!
//! Each record starts with a little-endian u64 header `H`:
//!
//! ```text
//! H <= u32::MAX  =>  BlockRef(H as u32), no payload
//! H >  u32::MAX  =>  Literal of (H - u32::MAX) bytes, payload follows
//! ```
//!
//! There is no magic number and no version; each file transfer carries its
//! own patch stream delimited by the surrounding framing. The stream ends at
//! EOF between records. Both ends are streaming: the encoder writes records
//! as they arrive, and the decoder hands literal payloads to the caller as a
//! bounded reader without buffering them.

use std::io::{Read, Write};

use crate::error::{EspejoError, Result};

/// Header bias separating block refs from literal lengths.
const LITERAL_BASE: u64 = u32::MAX as u64;

/// One decoded patch record.
///
/// The literal variant borrows a bounded reader over exactly the payload;
/// the decoder drains whatever the callback leaves unread before moving to
/// the next record.
pub enum PatchRecord<'a> {
    /// Reuse block `index` of the sink's summary.
    BlockRef(u32),
    /// Verbatim bytes; the reader yields exactly the literal's length.
    Literal(&'a mut dyn Read),
}

/// Streaming patch encoder.
///
/// # Example
///
/// ```rust
/// use espejo::{PatchEncoder, PatchDecoder, PatchRecord};
///
/// let mut wire = Vec::new();
/// let mut enc = PatchEncoder::new(&mut wire);
/// enc.write_block_ref(1).unwrap();
/// enc.write_literal(b"ld").unwrap();
///
/// let mut refs = Vec::new();
/// let mut data = Vec::new();
/// PatchDecoder::new(wire.as_slice())
///     .decode(|record| {
///         match record {
///             PatchRecord::BlockRef(i) => refs.push(i),
///             PatchRecord::Literal(r) => {
///                 std::io::Read::read_to_end(r, &mut data)?;
///             }
///         }
///         Ok(0)
///     })
///     .unwrap();
/// assert_eq!(refs, [1]);
/// assert_eq!(data, b"ld");
/// ```
#[derive(Debug)]
pub struct PatchEncoder<W: Write> {
    w: W,
    header: [u8; 8],
}

impl<W: Write> PatchEncoder<W> {
    /// Wrap a writer.
    pub fn new(w: W) -> Self {
        Self { w, header: [0u8; 8] }
    }

    /// Emit a block reference record. Returns bytes written to the wire.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the underlying write fails.
    pub fn write_block_ref(&mut self, index: u32) -> Result<usize> {
        self.header = u64::from(index).to_le_bytes();
        self.w.write_all(&self.header)?;
        Ok(8)
    }

    /// Emit a literal record. Returns bytes written to the wire.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for empty literals (not representable on
    /// the wire) and literals longer than `u32::MAX`, or an I/O error if the
    /// underlying write fails.
    pub fn write_literal(&mut self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(EspejoError::InvalidArgument(
                "empty literal is not representable".to_string(),
            ));
        }
        if data.len() as u64 > LITERAL_BASE {
            return Err(EspejoError::InvalidArgument(format!(
                "literal too large: {} bytes",
                data.len()
            )));
        }
        self.header = (data.len() as u64 + LITERAL_BASE).to_le_bytes();
        self.w.write_all(&self.header)?;
        self.w.write_all(data)?;
        Ok(8 + data.len())
    }

    /// Flush and hand the writer back.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if flushing fails.
    pub fn finish(mut self) -> Result<W> {
        self.w.flush()?;
        Ok(self.w)
    }
}

/// Streaming patch decoder.
#[derive(Debug)]
pub struct PatchDecoder<R: Read> {
    r: R,
    header: [u8; 8],
}

impl<R: Read> PatchDecoder<R> {
    /// Wrap a reader positioned at the start of a patch stream.
    pub fn new(r: R) -> Self {
        Self { r, header: [0u8; 8] }
    }

    /// Decode records until EOF, invoking `on_record` for each.
    ///
    /// The callback's return values (typically bytes produced) are summed
    /// and returned. A literal's reader yields exactly the payload length;
    /// any bytes the callback leaves unread are drained before the next
    /// record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPatch` if the stream ends inside a header or a
    /// literal payload, or propagates the callback's error.
    pub fn decode<F>(&mut self, mut on_record: F) -> Result<u64>
    where
        F: FnMut(PatchRecord<'_>) -> Result<u64>,
    {
        let mut written = 0u64;
        loop {
            if !self.read_header()? {
                return Ok(written);
            }
            let header = u64::from_le_bytes(self.header);
            if header <= LITERAL_BASE {
                #[allow(clippy::cast_possible_truncation)]
                let index = header as u32;
                written += on_record(PatchRecord::BlockRef(index))?;
                continue;
            }
            let len = header - LITERAL_BASE;
            let mut payload = (&mut self.r).take(len);
            written += on_record(PatchRecord::Literal(&mut payload))?;
            // The callback must consume the payload; drain any remainder so
            // the next header starts at a record boundary.
            std::io::copy(&mut payload, &mut std::io::sink())?;
            if payload.limit() > 0 {
                return Err(EspejoError::invalid_patch(format!(
                    "literal payload truncated: missing {} of {len} bytes",
                    payload.limit()
                )));
            }
        }
    }

    /// Read the next 8-byte header. `Ok(false)` on clean EOF before any
    /// header byte; `InvalidPatch` on a partial header.
    fn read_header(&mut self) -> Result<bool> {
        let mut filled = 0;
        while filled < self.header.len() {
            match self.r.read(&mut self.header[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => {
                    return Err(EspejoError::invalid_patch(format!(
                        "stream ended inside a record header ({filled} of 8 bytes)"
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}
