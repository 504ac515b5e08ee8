//! Weak rolling checksum for block matching.
//!
//! Adler-32 style: `a` is the byte sum, `b` the position-weighted sum, both
//! reduced modulo the largest prime below 2^16. Sliding the window by one byte
//! is O(1), which is what makes scanning every source offset affordable.

/// Rolling checksum over a fixed-size window.
///
/// # Example
///
/// ```rust
/// use chunksync::RollingChecksum;
///
/// let mut rolling = RollingChecksum::new(b"hello");
/// rolling.roll(b'h', b'!');
/// assert_eq!(rolling.digest(), RollingChecksum::new(b"ello!").digest());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollingChecksum {
    a: u64,
    b: u64,
    window: usize,
}

impl RollingChecksum {
    /// Modulus for both sums.
    pub const MOD: u64 = 65521;

    /// Compute the checksum of `data`; the window size becomes `data.len()`.
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        let len = data.len() as u64;
        let mut a = 0u64;
        let mut b = 0u64;
        for (i, &byte) in data.iter().enumerate() {
            let byte = u64::from(byte);
            a += byte;
            // weight of byte i is (len - i)
            b = (b + (len - i as u64) % Self::MOD * byte) % Self::MOD;
        }
        Self {
            a: a % Self::MOD,
            b,
            window: data.len(),
        }
    }

    /// Slide the window: drop `old` from the front, append `new` at the back.
    #[inline]
    pub fn roll(&mut self, old: u8, new: u8) {
        let old = u64::from(old);
        let new = u64::from(new);
        let weighted_old = (self.window as u64 % Self::MOD) * old % Self::MOD;

        self.a = (self.a + Self::MOD - old + new) % Self::MOD;
        self.b = (self.b + Self::MOD - weighted_old + self.a) % Self::MOD;
    }

    /// Append a byte, growing the window by one.
    #[inline]
    pub fn push(&mut self, byte: u8) {
        self.a = (self.a + u64::from(byte)) % Self::MOD;
        self.b = (self.b + self.a) % Self::MOD;
        self.window += 1;
    }

    /// Combined 32-bit digest, `(b << 16) | a`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn digest(&self) -> u32 {
        ((self.b as u32) << 16) | self.a as u32
    }

    /// Current window size in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.window
    }

    /// Whether the window is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.window == 0
    }
}
