//! Token-bucket bandwidth throttle.
//!
//! Bucket state (tokens and last refill time) is packed into one `AtomicU64`
//! and updated with a compare-and-swap loop, so concurrent callers never lose
//! a refill or double-spend tokens. Tokens are bytes; the bucket holds at
//! most one second of traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Longest single sleep while waiting for tokens, so rate changes are seen.
const MAX_WAIT: Duration = Duration::from_millis(100);

/// Something that gates byte throughput.
pub trait RateLimit: Send + Sync {
    /// Block until `bytes` may be transferred.
    fn acquire(&self, bytes: u64);
}

/// No limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl RateLimit for Unlimited {
    fn acquire(&self, _bytes: u64) {}
}

/// Lock-free token bucket.
///
/// # Example
///
/// ```rust
/// use chunksync::TokenBucket;
///
/// let bucket = TokenBucket::new(1024 * 1024);
/// assert!(bucket.try_acquire(4096));
/// assert!(bucket.available() <= bucket.capacity());
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    /// Bytes per second; 0 disables throttling.
    rate: AtomicU64,
    /// High 32 bits: milliseconds since `epoch` (wrapping). Low 32: tokens.
    state: AtomicU64,
    epoch: Instant,
}

#[inline]
const fn pack(stamp: u32, tokens: u32) -> u64 {
    ((stamp as u64) << 32) | tokens as u64
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, state as u32)
}

/// Rate narrowed to the token type, saturating.
#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn capacity_for(rate: u64) -> u32 {
    if rate > u32::MAX as u64 {
        u32::MAX
    } else {
        rate as u32
    }
}

impl TokenBucket {
    /// Full bucket refilling at `bytes_per_sec`. A rate of 0 is unlimited.
    #[must_use]
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            rate: AtomicU64::new(bytes_per_sec),
            state: AtomicU64::new(pack(0, capacity_for(bytes_per_sec))),
            epoch: Instant::now(),
        }
    }

    /// Current refill rate.
    #[must_use]
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Acquire)
    }

    /// Change the refill rate. Excess tokens are trimmed on the next refill.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        self.rate.store(bytes_per_sec, Ordering::Release);
    }

    /// Maximum tokens the bucket holds.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        u64::from(capacity_for(self.rate()))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u32 {
        // wraps after ~49 days; elapsed uses wrapping_sub
        self.epoch.elapsed().as_millis() as u32
    }

    /// Refill `(stamp, tokens)` to `now`. Time not yet worth a whole token is
    /// carried in the returned stamp.
    #[allow(clippy::cast_possible_truncation)]
    fn refill(stamp: u32, tokens: u32, now: u32, rate: u64) -> (u32, u32) {
        let capacity = capacity_for(rate);
        let elapsed = u128::from(now.wrapping_sub(stamp));
        let earned = elapsed * u128::from(rate) / 1000;
        let total = u128::from(tokens) + earned;
        if total >= u128::from(capacity) {
            return (now, capacity);
        }
        // earned < capacity here, so the consumed time fits in u32
        let used_ms = (earned * 1000 / u128::from(rate.max(1))) as u32;
        (stamp.wrapping_add(used_ms), total as u32)
    }

    /// Tokens currently available, without consuming any.
    #[must_use]
    pub fn available(&self) -> u64 {
        let rate = self.rate();
        if rate == 0 {
            return 0;
        }
        let (stamp, tokens) = unpack(self.state.load(Ordering::Acquire));
        u64::from(Self::refill(stamp, tokens, self.now_ms(), rate).1)
    }

    /// Try to take `bytes` tokens (at most one bucketful) now.
    ///
    /// Returns `None` on success, or how long to wait before enough tokens
    /// will have accrued.
    #[allow(clippy::cast_possible_truncation)]
    pub fn poll_acquire(&self, bytes: u64) -> Option<Duration> {
        let rate = self.rate();
        if rate == 0 {
            return None;
        }
        let want = bytes.min(u64::from(capacity_for(rate))) as u32;
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (stamp, tokens) = unpack(current);
            let (stamp, tokens) = Self::refill(stamp, tokens, self.now_ms(), rate);
            if tokens < want {
                let deficit = u64::from(want - tokens);
                let wait_ms = deficit.saturating_mul(1000).div_ceil(rate).max(1);
                return Some(Duration::from_millis(wait_ms).min(MAX_WAIT));
            }
            match self.state.compare_exchange_weak(
                current,
                pack(stamp, tokens - want),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return None,
                Err(actual) => current = actual,
            }
        }
    }

    /// Take `bytes` tokens if available right now. Requests larger than the
    /// capacity never succeed here; use [`RateLimit::acquire`].
    #[must_use]
    pub fn try_acquire(&self, bytes: u64) -> bool {
        if self.rate() != 0 && bytes > self.capacity() {
            return false;
        }
        self.poll_acquire(bytes).is_none()
    }
}

impl RateLimit for TokenBucket {
    /// Blocks until `bytes` tokens were deducted. Requests larger than the
    /// capacity are taken in capacity-sized installments.
    fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let rate = self.rate();
            if rate == 0 {
                return;
            }
            let step = remaining.min(u64::from(capacity_for(rate)));
            match self.poll_acquire(step) {
                None => remaining -= step,
                Some(wait) => std::thread::sleep(wait),
            }
        }
    }
}

/// Parse a rate like `"100M"` into bytes per second.
///
/// # Errors
///
/// Returns [`crate::SyncError::Config`] for malformed input.
pub fn parse_rate(input: &str) -> crate::Result<u64> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_suffix("/s")
        .or_else(|| trimmed.strip_suffix("ps"))
        .unwrap_or(trimmed);
    crate::config::parse_size(trimmed)
}
