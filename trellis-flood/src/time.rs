//! Wall-clock microseconds, the time base of everything that crosses the
//! wire (origin stamps, expirations, epoch seconds). Monotonic `Instant`s
//! stay inside the link layer; the flood engines compare wall stamps that
//! remote daemons produced.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct WallTime(pub u64);

impl WallTime {
    pub fn from_parts(sec: u32, usec: u32) -> Self {
        WallTime(sec as u64 * 1_000_000 + usec as u64)
    }

    pub fn sec(self) -> u32 {
        (self.0 / 1_000_000) as u32
    }

    pub fn usec(self) -> u32 {
        (self.0 % 1_000_000) as u32
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        WallTime(self.0.saturating_add(d.as_micros() as u64))
    }

    pub fn saturating_sub(self, other: WallTime) -> Duration {
        Duration::from_micros(self.0.saturating_sub(other.0))
    }
}

impl std::fmt::Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}", self.sec(), self.usec())
    }
}
