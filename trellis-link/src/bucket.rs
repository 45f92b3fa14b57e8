//! Per-link leaky bucket gating first-time transmissions handed down by the
//! dissemination engines.

use std::time::{Duration, Instant};
use trellis_proto::constants::{BUCKET_CAP, BUCKET_FILL_USEC, RATE_LIMIT_KBPS};

#[derive(Debug)]
pub struct TokenBucket {
    tokens: u64,
    last_filled: Instant,
}

impl TokenBucket {
    pub fn new(now: Instant) -> Self {
        TokenBucket {
            tokens: BUCKET_CAP,
            last_filled: now,
        }
    }

    /// Refill from elapsed time at the configured rate, capped at capacity.
    pub fn refill(&mut self, now: Instant) {
        if self.tokens >= BUCKET_CAP {
            self.last_filled = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_filled);
        let to_add = (RATE_LIMIT_KBPS as f64 / 8000.0 * elapsed.as_micros() as f64) as u64;
        if to_add > 0 {
            self.tokens = (self.tokens + to_add).min(BUCKET_CAP);
            self.last_filled = now;
        }
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn spend(&mut self, bytes: u64) {
        self.tokens = self.tokens.saturating_sub(bytes);
    }

    pub fn is_full(&self) -> bool {
        self.tokens >= BUCKET_CAP
    }

    /// When the next refill tick is worth waking up for.
    pub fn next_fill(&self) -> Option<Instant> {
        if self.is_full() {
            None
        } else {
            Some(self.last_filled + Duration::from_micros(BUCKET_FILL_USEC))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refill_tracks_elapsed_time() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(start);
        bucket.spend(100_000);
        let before = bucket.tokens();
        bucket.refill(start + Duration::from_millis(1));
        // 250_000 kbps = 31_250 bytes per millisecond.
        assert!(bucket.tokens() >= before + 31_000);
        bucket.refill(start + Duration::from_secs(60));
        assert!(bucket.is_full());
    }
}
