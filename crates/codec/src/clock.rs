//! Monotonic time sources.
//!
//! `now_ms` and `now_seconds_since_1900` must never go backwards once the
//! wall clock has been set; tests inject a deterministic `ClockSource`
//! instead of reading the real clock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the LonTalk epoch (1 Jan 1900) and the Unix epoch.
const SECONDS_1900_TO_1970: u64 = 2_208_988_800;

pub trait ClockSource: Send + Sync {
    fn now_ms(&self) -> u32;
    fn now_seconds_since_1900(&self) -> u32;
}

/// Clock backed by the OS wall clock, with a once-per-run latch recording
/// whether the clock has ever produced a plausible (post-1971) value.
pub struct SystemClock {
    clock_set: AtomicBool,
    last_seconds: AtomicU64,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            clock_set: AtomicBool::new(false),
            last_seconds: AtomicU64::new(0),
        }
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the wall clock has produced at least one value past the
    /// Unix epoch's first full year, meaning date-times are safe to trust.
    pub fn is_set(&self) -> bool {
        self.clock_set.load(Ordering::Relaxed)
    }

    fn unix_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl ClockSource for SystemClock {
    fn now_ms(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u32)
            .unwrap_or(0)
    }

    fn now_seconds_since_1900(&self) -> u32 {
        let unix = self.unix_seconds();

        if unix > 365 * 24 * 3600 {
            self.clock_set.store(true, Ordering::Relaxed);
        }

        let monotone = self.last_seconds.fetch_max(unix, Ordering::Relaxed).max(unix);
        (monotone + SECONDS_1900_TO_1970) as u32
    }
}

/// Fixed clock for deterministic tests.
pub struct FixedClock {
    pub ms: AtomicU64,
    pub seconds_1900: AtomicU64,
}

impl FixedClock {
    pub fn new(ms: u64, seconds_1900: u64) -> Self {
        Self {
            ms: AtomicU64::new(ms),
            seconds_1900: AtomicU64::new(seconds_1900),
        }
    }

    pub fn advance_ms(&self, delta: u64) {
        self.ms.fetch_add(delta, Ordering::Relaxed);
    }
}

impl ClockSource for FixedClock {
    fn now_ms(&self) -> u32 {
        self.ms.load(Ordering::Relaxed) as u32
    }

    fn now_seconds_since_1900(&self) -> u32 {
        self.seconds_1900.load(Ordering::Relaxed) as u32
    }
}
