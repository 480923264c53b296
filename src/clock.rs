use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Time source shared by the playback feed and the capture scheduler, so
/// echo reference timestamps and capture timestamps line up.
pub trait Clock: Send + Sync {
    /// Seconds since the clock's origin.
    fn now(&self) -> f64;
}

/// Monotonic clock starting at zero when created.
#[derive(Clone, Debug)]
pub struct SessionClock {
    origin: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SessionClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Clock advanced by hand. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(start.to_bits())),
        }
    }

    pub fn set(&self, secs: f64) {
        self.bits.store(secs.to_bits(), Ordering::Relaxed);
    }

    pub fn advance(&self, secs: f64) {
        self.set(self.now() + secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let c = ManualClock::new(1.0);
        let other = c.clone();
        c.advance(0.25);
        assert_eq!(other.now(), 1.25);
    }

    #[test]
    fn session_clock_is_monotonic() {
        let c = SessionClock::new();
        let a = c.now();
        let b = c.now();
        assert!(b >= a);
    }
}
