use std::time::Duration;

/// Restart delay schedule for a crash-looping process: doubles per
/// consecutive failure, bounded by `cap` so a permanently broken component
/// settles into a fixed retry cadence instead of a restart storm.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the next restart given the consecutive-failure count.
    /// Zero failures means no delay.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << exponent);
        delay.min(self.cap)
    }
}
