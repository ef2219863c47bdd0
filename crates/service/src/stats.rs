use std::sync::atomic::{AtomicU64, Ordering};

/// Counter kinds surfaced by the wire STATISTICS packet (§3/§7).
#[derive(Debug, Clone, Copy)]
pub enum Stat {
    ReceivedFrames(u32),
    SentFrames(u32),
    DroppedFrames(u32),
    DuplicateFrames(u32),
    LostFrames(u32),
    AuthFailures(u32),
    ResetCount(u32),
}

pub trait Number {
    fn add(&self, value: u64);
    fn get(&self) -> u64;
}

#[derive(Default)]
pub struct Count(AtomicU64);

impl Number for Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Running totals for one channel, reported back on the wire as saturated
/// 32-bit counters with an "unsupported" sentinel at `u32::MAX`.
#[derive(Default)]
pub struct ChannelStats {
    pub received_frames: Count,
    pub sent_frames: Count,
    pub dropped_frames: Count,
    pub duplicate_frames: Count,
    pub lost_frames: Count,
    pub auth_failures: Count,
    pub reset_count: Count,
}

/// Value reported on the wire is clamped to `u32::MAX - 1`; the true max
/// value is reserved by the protocol to mean "counter not supported".
pub const UNSUPPORTED: u32 = u32::MAX;

fn clamp_u32(value: u64) -> u32 {
    value.min((u32::MAX - 1) as u64) as u32
}

impl ChannelStats {
    pub fn add(&self, stat: &Stat) {
        match *stat {
            Stat::ReceivedFrames(v) => self.received_frames.add(v as u64),
            Stat::SentFrames(v) => self.sent_frames.add(v as u64),
            Stat::DroppedFrames(v) => self.dropped_frames.add(v as u64),
            Stat::DuplicateFrames(v) => self.duplicate_frames.add(v as u64),
            Stat::LostFrames(v) => self.lost_frames.add(v as u64),
            Stat::AuthFailures(v) => self.auth_failures.add(v as u64),
            Stat::ResetCount(v) => self.reset_count.add(v as u64),
        }
    }

    /// Snapshot as the seven 32-bit fields carried by a STATISTICS response,
    /// each saturating rather than wrapping.
    pub fn snapshot(&self) -> [u32; 7] {
        [
            clamp_u32(self.received_frames.get()),
            clamp_u32(self.sent_frames.get()),
            clamp_u32(self.dropped_frames.get()),
            clamp_u32(self.duplicate_frames.get()),
            clamp_u32(self.lost_frames.get()),
            clamp_u32(self.auth_failures.get()),
            clamp_u32(self.reset_count.get()),
        ]
    }

    pub fn reset(&self) {
        self.received_frames.0.store(0, Ordering::Relaxed);
        self.sent_frames.0.store(0, Ordering::Relaxed);
        self.dropped_frames.0.store(0, Ordering::Relaxed);
        self.duplicate_frames.0.store(0, Ordering::Relaxed);
        self.lost_frames.0.store(0, Ordering::Relaxed);
        self.auth_failures.0.store(0, Ordering::Relaxed);
        self.reset_count.add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_snapshot_round_trip() {
        let stats = ChannelStats::default();
        stats.add(&Stat::ReceivedFrames(3));
        stats.add(&Stat::SentFrames(2));

        let snap = stats.snapshot();
        assert_eq!(snap[0], 3);
        assert_eq!(snap[1], 2);
    }

    #[test]
    fn reset_clears_counters_and_bumps_reset_count() {
        let stats = ChannelStats::default();
        stats.add(&Stat::ReceivedFrames(10));
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap[0], 0);
        assert_eq!(snap[6], 1);
    }

    #[test]
    fn snapshot_saturates_instead_of_wrapping() {
        let stats = ChannelStats::default();
        stats.received_frames.0.store(u64::from(u32::MAX) + 10, Ordering::Relaxed);

        assert_eq!(stats.snapshot()[0], u32::MAX - 1);
    }
}
