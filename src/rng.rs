/// Supplies the jitter used when spacing out requests inside a rate-limit window.
///
/// Kept behind a trait for the same reason as [`crate::clock::Clock`]: the backoff and
/// jitter math in `rate_limit` needs to be exercised with fixed values in tests instead
/// of a real RNG.
pub trait JitterRng: Send + Sync {
    fn gen_range_ms(&self, lo: u64, hi: u64) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRng;

impl JitterRng for ThreadRng {
    fn gen_range_ms(&self, lo: u64, hi: u64) -> u64 {
        use rand::Rng;
        if lo >= hi {
            return lo;
        }
        rand::thread_rng().gen_range(lo..hi)
    }
}

/// Always returns the same value, clamped to the requested range. Useful for assertions
/// that need a predictable jitter outcome.
#[derive(Debug, Clone, Copy)]
pub struct FixedRng(pub u64);

impl JitterRng for FixedRng {
    fn gen_range_ms(&self, lo: u64, hi: u64) -> u64 {
        self.0.clamp(lo, hi.saturating_sub(1).max(lo))
    }
}
