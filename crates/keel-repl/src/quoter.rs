//! Token-bucket write-rate quoter.
//!
//! Replication competes with client I/O for block-device bandwidth.
//! [`ReplQuoter`] is the process-wide admission gate every chunk write and
//! huge-blob write passes through, with byte accounting.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Token bucket where one token is one byte.
///
/// The bucket refills at `bytes_per_sec` and holds at most one second's
/// burst.
pub struct ReplQuoter {
    state: Mutex<QuoterState>,
}

struct QuoterState {
    available: f64,
    last_refill: Instant,
    capacity: f64,
    rate: f64,
}

impl ReplQuoter {
    /// Create a quoter with the given byte rate.
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        let rate = bytes_per_sec as f64;
        Arc::new(Self {
            state: Mutex::new(QuoterState {
                available: rate,
                last_refill: Instant::now(),
                capacity: rate,
                rate,
            }),
        })
    }

    /// Wait until `bytes` tokens are available, then consume them.
    ///
    /// Requests larger than one second's burst are clamped to the bucket
    /// capacity so they cannot stall forever.
    pub async fn acquire(&self, bytes: u64) {
        let mut bytes = bytes as f64;

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                refill(&mut state);
                bytes = bytes.min(state.capacity);

                if state.available >= bytes {
                    state.available -= bytes;
                    return;
                }

                let deficit = bytes - state.available;
                if state.rate > 0.0 {
                    Duration::from_secs_f64(deficit / state.rate)
                } else {
                    Duration::from_millis(100)
                }
            };

            debug!(wait_ms = wait.as_millis(), bytes, "write quoter: waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Consume tokens if available without waiting.
    pub async fn try_acquire(&self, bytes: u64) -> bool {
        let mut state = self.state.lock().await;
        refill(&mut state);
        let bytes = (bytes as f64).min(state.capacity);
        if state.available >= bytes {
            state.available -= bytes;
            true
        } else {
            false
        }
    }
}

fn refill(state: &mut QuoterState) {
    let now = Instant::now();
    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
    if elapsed > 0.0 {
        state.available = (state.available + elapsed * state.rate).min(state.capacity);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_quoter_starts_full() {
        let quoter = ReplQuoter::new(10_000);
        quoter.acquire(5_000).await;
        assert!(quoter.try_acquire(5_000).await);
        assert!(!quoter.try_acquire(1).await);
    }

    #[tokio::test]
    async fn test_quoter_refills() {
        let quoter = ReplQuoter::new(100_000);
        quoter.acquire(100_000).await;
        assert!(!quoter.try_acquire(1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(quoter.try_acquire(1).await);
    }

    #[tokio::test]
    async fn test_quoter_clamps_oversized_request() {
        let quoter = ReplQuoter::new(1_000);
        // 10x the burst capacity must still go through (clamped).
        quoter.acquire(10_000).await;
    }
}
