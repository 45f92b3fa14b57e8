//! Ping bookkeeping and the smoothed round-trip estimate that every
//! reliability timeout on the link is derived from.

use std::time::{Duration, Instant};
use trellis_proto::config::LinkConfig;
use trellis_proto::constants::MAX_PING_HIST;

#[derive(Debug, Clone, Copy)]
pub struct PingSlot {
    pub seq: u64,
    pub nonce: u64,
    pub sent: Instant,
    pub answered: bool,
}

/// Ring of outstanding pings plus the EWMA round-trip estimate.
///
/// A PONG is matched against its slot by `(seq, nonce)` and may only be
/// consumed once; anything outside the ring's horizon is discarded.
#[derive(Debug)]
pub struct RttEstimator {
    history: Vec<Option<PingSlot>>,
    pub next_ping_seq: u64,
    pub last_pong_seq_recv: u64,
    rtt_ms: f64,
    min_rtt_ms: f64,
}

impl RttEstimator {
    pub fn new(cfg: &LinkConfig) -> Self {
        RttEstimator {
            history: vec![None; MAX_PING_HIST as usize],
            next_ping_seq: 1,
            last_pong_seq_recv: 0,
            rtt_ms: cfg.default_rtt_ms as f64,
            min_rtt_ms: cfg.min_rtt_ms as f64,
        }
    }

    /// Record a new outgoing ping; returns true when the slot being evicted
    /// was never answered (counts as a loss).
    pub fn record_ping(&mut self, seq: u64, nonce: u64, now: Instant) -> bool {
        let idx = (seq % MAX_PING_HIST) as usize;
        let unanswered = matches!(self.history[idx], Some(slot) if !slot.answered);
        self.history[idx] = Some(PingSlot {
            seq,
            nonce,
            sent: now,
            answered: false,
        });
        unanswered
    }

    /// Validate a PONG against the history. Returns the matched slot's send
    /// time when this is the first answer for a live slot.
    pub fn accept_pong(&mut self, seq: u64, nonce: u64) -> Option<Instant> {
        if seq >= self.next_ping_seq || seq + MAX_PING_HIST < self.next_ping_seq {
            return None;
        }
        let idx = (seq % MAX_PING_HIST) as usize;
        match &mut self.history[idx] {
            Some(slot) if slot.seq == seq && slot.nonce == nonce && !slot.answered => {
                slot.answered = true;
                Some(slot.sent)
            }
            _ => None,
        }
    }

    /// Fold one sample into the estimate: `rtt <- 0.8*rtt + 0.2*sample`,
    /// clamped below by the configured minimum.
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        self.rtt_ms = 0.8 * self.rtt_ms + 0.2 * sample_ms;
        if self.rtt_ms < self.min_rtt_ms {
            self.rtt_ms = self.min_rtt_ms;
        }
    }

    pub fn rtt_ms(&self) -> f64 {
        self.rtt_ms
    }

    pub fn scaled(&self, factor: f64) -> Duration {
        Duration::from_secs_f64(self.rtt_ms * factor / 1000.0)
    }
}

/// The three timeouts recomputed whenever the estimate moves.
#[derive(Debug, Clone, Copy)]
pub struct DerivedTimeouts {
    pub nack: Duration,
    pub initial_nack: Duration,
    pub reliable: Duration,
}

impl DerivedTimeouts {
    pub fn from_estimate(est: &RttEstimator, cfg: &LinkConfig) -> Self {
        DerivedTimeouts {
            nack: est.scaled(cfg.nack_timeout_factor as f64),
            initial_nack: est.scaled(cfg.init_nack_factor),
            reliable: est.scaled(cfg.reliable_timeout_factor as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_is_single_use_and_nonce_checked() {
        let cfg = LinkConfig::default();
        let mut est = RttEstimator::new(&cfg);
        let now = Instant::now();
        est.record_ping(1, 0xdead, now);
        est.next_ping_seq = 2;

        assert!(est.accept_pong(1, 0xbeef).is_none(), "wrong nonce");
        assert!(est.accept_pong(1, 0xdead).is_some());
        assert!(est.accept_pong(1, 0xdead).is_none(), "replay");
        assert!(est.accept_pong(2, 0).is_none(), "not yet sent");
    }

    #[test]
    fn estimate_is_clamped_at_min() {
        let cfg = LinkConfig::default();
        let mut est = RttEstimator::new(&cfg);
        for _ in 0..64 {
            est.update(Duration::from_micros(10));
        }
        assert_eq!(est.rtt_ms(), cfg.min_rtt_ms as f64);
    }
}
