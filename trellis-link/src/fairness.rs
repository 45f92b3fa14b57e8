//! TCP-fair congestion window for the link: slow start below the threshold,
//! additive increase above it, halving when a detected loss range clears.

use trellis_proto::constants::MAX_SEND_ON_LINK;

pub const MINIMUM_WINDOW: f32 = 2.0;

#[derive(Debug)]
pub struct TcpFairness {
    enabled: bool,
    pub cwnd: f32,
    pub ssthresh: f32,
    pub loss_detected: bool,
    pub loss_detected_aru: u64,
}

impl TcpFairness {
    pub fn new(enabled: bool) -> Self {
        TcpFairness {
            enabled,
            cwnd: if enabled {
                MINIMUM_WINDOW
            } else {
                MAX_SEND_ON_LINK as f32
            },
            ssthresh: MAX_SEND_ON_LINK as f32,
            loss_detected: false,
            loss_detected_aru: 0,
        }
    }

    pub fn usable(&self) -> u64 {
        self.cwnd as u64
    }

    /// One acked packet grows the window.
    pub fn on_ack(&mut self) {
        if !self.enabled {
            return;
        }
        if self.cwnd <= self.ssthresh {
            self.cwnd += 1.0;
        } else {
            self.cwnd += 1.0 / self.cwnd;
        }
        if self.cwnd > MAX_SEND_ON_LINK as f32 {
            self.cwnd = MAX_SEND_ON_LINK as f32;
        }
    }

    /// First NACK of a loss episode records where the loss was seen.
    pub fn on_nack(&mut self, aru: u64) {
        if self.enabled && !self.loss_detected {
            self.loss_detected = true;
            self.loss_detected_aru = aru;
        }
    }

    /// When the cumulative ack moves past the recorded loss point the episode
    /// is over: halve the window and threshold (floored at the minimum).
    pub fn maybe_resolve_loss(&mut self, aru: u64) {
        if !self.enabled || !self.loss_detected || aru <= self.loss_detected_aru {
            return;
        }
        self.loss_detected = false;
        self.ssthresh = self.cwnd / 2.0;
        self.cwnd = self.cwnd / 2.0 + 3.0;
        if self.ssthresh < MINIMUM_WINDOW {
            self.ssthresh = MINIMUM_WINDOW;
            self.cwnd = self.ssthresh + 3.0;
        }
    }

    /// Incarnation change resets the window.
    pub fn reset(&mut self) {
        self.cwnd = if self.enabled {
            MINIMUM_WINDOW
        } else {
            MAX_SEND_ON_LINK as f32
        };
        self.ssthresh = MAX_SEND_ON_LINK as f32;
        self.loss_detected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_then_linear() {
        let mut fair = TcpFairness::new(true);
        fair.ssthresh = 4.0;
        fair.on_ack();
        fair.on_ack();
        assert_eq!(fair.cwnd, 4.0);
        let before = fair.cwnd;
        fair.on_ack();
        assert!(fair.cwnd > before && fair.cwnd < before + 1.0);
    }

    #[test]
    fn loss_halves_once_per_episode() {
        let mut fair = TcpFairness::new(true);
        fair.cwnd = 40.0;
        fair.ssthresh = 10.0;
        fair.on_nack(17);
        fair.maybe_resolve_loss(17);
        assert_eq!(fair.cwnd, 40.0, "loss range not yet cleared");
        fair.maybe_resolve_loss(18);
        assert_eq!(fair.cwnd, 23.0);
        assert_eq!(fair.ssthresh, 20.0);
        assert!(!fair.loss_detected);
    }
}
