use std::time::{SystemTime, UNIX_EPOCH};

/// A source of timestamps for wait-budget accounting.
///
/// The blocking insert/remove variants measure their remaining timeout through
/// this trait, so callers can choose between wall-clock time (standard, but
/// subject to NTP steps) and TSC-based time (faster and monotonic).
pub trait Clock: Send + Sync + 'static {
    /// Current timestamp in nanoseconds since the UNIX epoch.
    fn now(&self) -> u64;
}

/// Clock backed by `std::time::SystemTime`. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch");
        u64::try_from(timestamp.as_nanos()).expect("system time exceeds timestamp range")
    }
}

/// Clock backed by the CPU's time-stamp counter via the `quanta` crate.
///
/// Anchors to `SystemTime` once at construction and advances by TSC ticks from
/// there, so it never moves backwards. Reads cost a few nanoseconds.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_wall_ns: u64,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        let start_wall_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch")
            .as_nanos() as u64;
        Self {
            clock,
            start_wall_ns,
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_ns + delta.as_nanos() as u64
    }
}
