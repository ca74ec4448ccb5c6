//! Leaky-bucket publish pacer.
//!
//! Hands out one slot per `1/rps` seconds. Callers are serialized on the
//! slot assignment and then sleep until their slot arrives, so over any
//! window the publish rate stays at the configured budget.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// A limiter handing out `rps` slots per second.
    pub fn new(rps: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / rps.max(1),
            next_slot: Mutex::new(None),
        }
    }

    /// Block until the next slot is available.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}
