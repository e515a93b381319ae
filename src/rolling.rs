//! Fixed-window rolling hash for fast block matching.
//!
//! This is a cyclic-polynomial ("buzhash") construction: each byte maps
//! through a fixed permutation table and contributes a rotated XOR term, so
//! sliding the window by one byte is O(1). Both sides of a transfer must use
//! the same table; it is baked in at compile time.

/// Byte permutation table, derived from a fixed splitmix64 seed.
///
/// Any table of 256 well-mixed values works; what matters is that the
/// summarizer and the delta generator agree bit-for-bit.
const TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut i = 0;
    while i < 256 {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^= z >> 31;
        #[allow(clippy::cast_possible_truncation)]
        {
            table[i] = (z >> 32) as u32 ^ z as u32;
        }
        i += 1;
    }
    table
}

/// Rolling 32-bit hash over a window of at most `window` bytes.
///
/// The hash of bytes `b0..bk` is `rotl(T[b0], k-1) ^ ... ^ T[bk]`, where `T`
/// is the byte permutation table. Until the window fills, bytes accumulate;
/// once full, each new byte evicts the oldest one in O(1).
///
/// # Example
///
/// ```rust
/// use espejo::RollingHash;
///
/// let mut hash = RollingHash::new(4);
/// hash.write(b"abcd");
/// let full = hash.sum();
///
/// hash.reset();
/// hash.write(b"abcd");
/// assert_eq!(hash.sum(), full);
/// ```
#[derive(Debug, Clone)]
pub struct RollingHash {
    state: u32,
    window: u32,
    /// Ring buffer of the bytes currently in the window.
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

impl RollingHash {
    /// Create a rolling hash with the given window size in bytes.
    ///
    /// # Panics
    ///
    /// Panics if `window` is zero.
    #[must_use]
    pub fn new(window: u32) -> Self {
        assert!(window > 0, "window must be non-zero");
        Self {
            state: 0,
            window,
            buf: vec![0u8; window as usize],
            head: 0,
            len: 0,
        }
    }

    /// Append one byte, evicting the oldest byte if the window is full.
    /// Returns the hash of the current window.
    #[inline]
    pub fn roll_byte(&mut self, b: u8) -> u32 {
        if self.len < self.window as usize {
            let idx = (self.head + self.len) % self.buf.len();
            self.buf[idx] = b;
            self.len += 1;
            self.state = self.state.rotate_left(1) ^ TABLE[b as usize];
        } else {
            let old = self.buf[self.head];
            self.buf[self.head] = b;
            self.head = (self.head + 1) % self.buf.len();
            self.state = self.state.rotate_left(1)
                ^ TABLE[old as usize].rotate_left(self.window)
                ^ TABLE[b as usize];
        }
        self.state
    }

    /// Feed a run of bytes through the window.
    #[inline]
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.roll_byte(b);
        }
    }

    /// Hash of the bytes currently in the window.
    #[inline]
    #[must_use]
    pub const fn sum(&self) -> u32 {
        self.state
    }

    /// Restore the empty-window state.
    pub fn reset(&mut self) {
        self.state = 0;
        self.head = 0;
        self.len = 0;
    }

    /// Number of bytes currently in the window.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the window holds no bytes.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Configured window size.
    #[inline]
    #[must_use]
    pub const fn window(&self) -> u32 {
        self.window
    }

    /// One-shot hash of a byte slice no longer than `window`.
    #[must_use]
    pub fn sum_of(window: u32, bytes: &[u8]) -> u32 {
        let mut h = Self::new(window);
        h.write(bytes);
        h.sum()
    }
}
