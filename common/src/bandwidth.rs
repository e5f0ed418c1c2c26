use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Allowed range for a bucket's burst capacity.
///
/// The burst follows the rate but is clamped: a tiny burst would stall every
/// ordinary read, a huge one would let a low limit be bypassed in one go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstBand {
    pub min_bytes: u64,
    pub max_bytes: u64,
}

impl BurstBand {
    pub fn burst_for(&self, bytes_per_second: u64) -> u64 {
        // floor wins over ceiling when misconfigured
        bytes_per_second.min(self.max_bytes).max(self.min_bytes).max(1)
    }
}

impl Default for BurstBand {
    fn default() -> Self {
        Self {
            min_bytes: 64 * 1024,
            max_bytes: 512 * 1024,
        }
    }
}

/// Bandwidth limiter using token bucket algorithm
#[derive(Clone)]
pub struct BandwidthLimiter {
    inner: Arc<Mutex<BandwidthLimiterInner>>,
}

struct BandwidthLimiterInner {
    bytes_per_second: u64,
    burst: u64,
    tokens: f64,
    last_update: Instant,
}

impl BandwidthLimiter {
    pub fn new(bytes_per_second: u64) -> Self {
        Self::with_burst(bytes_per_second, bytes_per_second)
    }

    pub fn with_band(bytes_per_second: u64, band: BurstBand) -> Self {
        Self::with_burst(bytes_per_second, band.burst_for(bytes_per_second))
    }

    pub fn with_burst(bytes_per_second: u64, burst: u64) -> Self {
        let burst = burst.max(1);
        Self {
            inner: Arc::new(Mutex::new(BandwidthLimiterInner {
                bytes_per_second,
                burst,
                tokens: burst as f64,
                last_update: Instant::now(),
            })),
        }
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.inner.lock().bytes_per_second
    }

    pub fn burst(&self) -> u64 {
        self.inner.lock().burst
    }

    /// Try to consume tokens, returns true if allowed
    pub fn try_consume(&self, bytes: u64) -> bool {
        let mut inner = self.inner.lock();
        inner.refill_tokens();

        if inner.tokens >= bytes as f64 {
            inner.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }

    /// Takes `bytes` tokens unconditionally and returns how long the caller
    /// has to wait before the transfer is within the rate. The bucket may go
    /// into debt; `acquire` is what splits large transfers into bursts.
    pub fn reserve(&self, bytes: u64) -> Duration {
        let mut inner = self.inner.lock();
        if inner.bytes_per_second == 0 || bytes == 0 {
            return Duration::ZERO;
        }
        inner.refill_tokens();

        inner.tokens -= bytes as f64;

        if inner.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-inner.tokens / inner.bytes_per_second as f64)
        }
    }

    /// Wait until tokens are available (async)
    pub async fn acquire(&self, bytes: u64) {
        let burst = self.burst();
        let mut remaining = bytes;
        while remaining > 0 {
            let chunk = remaining.min(burst);
            let wait = self.reserve(chunk);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            remaining -= chunk;
        }
    }
}

impl BandwidthLimiterInner {
    fn refill_tokens(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        let new_tokens = elapsed.as_secs_f64() * self.bytes_per_second as f64;

        self.tokens = (self.tokens + new_tokens).min(self.burst as f64);
        self.last_update = now;
    }
}

impl std::fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BandwidthLimiter")
            .field("bytes_per_second", &inner.bytes_per_second)
            .field("burst", &inner.burst)
            .finish()
    }
}
