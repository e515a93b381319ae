//! Strong hashes: BLAKE3 block fingerprints and the whole-file stream hash.
//!
//! Two roles share the algorithm family. Blocks carry a 256-bit fingerprint
//! that confirms rolling-hash hits; each file transfer carries a 512-bit
//! stream hash (BLAKE3 extended output) as the end-to-end integrity check.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{EspejoError, Result};

/// 256-bit content fingerprint of a single block.
///
/// # Example
///
/// ```rust
/// use espejo::StrongSig;
///
/// let a = StrongSig::compute(b"hello world");
/// let b = StrongSig::compute(b"hello world");
/// assert_eq!(a, b);
/// assert_ne!(a, StrongSig::compute(b"other data"));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrongSig([u8; 32]);

impl StrongSig {
    /// Compute the fingerprint of a block.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Rebuild a fingerprint from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes of the fingerprint.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// All-zero fingerprint, for initialization in tests.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }
}

impl std::fmt::Debug for StrongSig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StrongSig({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for StrongSig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl AsRef<[u8]> for StrongSig {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// 512-bit end-to-end integrity hash over a whole file's content.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StreamSum([u8; 64]);

impl StreamSum {
    /// Rebuild a stream sum from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Parse a stream sum from a wire-transmitted byte string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the slice is not exactly 64 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| EspejoError::InvalidArgument(format!(
                "stream hash must be 64 bytes, got {}",
                bytes.len()
            )))?;
        Ok(Self(arr))
    }

    /// Raw bytes of the sum.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Wire form of the sum.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// One-shot stream sum of an in-memory buffer.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = StreamHasher::new();
        hasher.update(data);
        hasher.finish()
    }

    /// Stream sum of everything a reader yields.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading fails.
    pub fn compute_streaming<R: Read>(reader: &mut R) -> Result<Self> {
        let mut hasher = StreamHasher::new();
        let mut buffer = [0u8; 8192];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hasher.finish())
    }
}

impl std::fmt::Debug for StreamSum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamSum({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for StreamSum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Incremental stream-hash state, fed as bytes flow through an exchange.
#[derive(Default)]
pub struct StreamHasher {
    inner: blake3::Hasher,
}

impl std::fmt::Debug for StreamHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamHasher")
    }
}

impl StreamHasher {
    /// Fresh hasher state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    /// Absorb more content.
    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize into the 64-byte extended output.
    #[must_use]
    pub fn finish(&self) -> StreamSum {
        let mut out = [0u8; 64];
        self.inner.finalize_xof().fill(&mut out);
        StreamSum(out)
    }
}

/// Wire identifier for the hash algorithm pair used in an exchange.
///
/// Exactly one identifier is defined today; anything else must be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum HasherId {
    /// BLAKE3: 64-byte stream hash, 256-bit block fingerprints.
    Blake3_64_256,
}

impl HasherId {
    /// Numeric wire form.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Blake3_64_256 => 1,
        }
    }

    /// Parse the numeric wire form.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for any unknown identifier.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Blake3_64_256),
            other => Err(EspejoError::InvalidArgument(format!(
                "unknown hasher: {other}"
            ))),
        }
    }
}
