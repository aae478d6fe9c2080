//! Open-loop rate gate.
//!
//! Active when a submissions-per-second target is configured. Completed
//! logical I/Os park on a pending FIFO instead of reissuing inline; each
//! gate period releases up to one batch.

use std::time::Duration;

use minstant::Instant;

/// Batch gate state. `batch` counts logical I/Os parked since the last
/// release; `submit_batch` counts releases within the current period.
pub struct RateGate {
    before: Instant,
    period: Duration,
    pub batch: u32,
    pub submit_batch: u32,
    pub batch_size: u32,
}

impl RateGate {
    pub fn new(io_num_per_second: u32, batch_size: u32) -> Self {
        let batch_size = batch_size.max(1);
        let period = Duration::from_secs(1)
            .div_f64(f64::from(io_num_per_second.max(1)))
            .mul_f64(f64::from(batch_size));
        Self {
            before: Instant::now(),
            period,
            batch: 0,
            submit_batch: 0,
            batch_size,
        }
    }

    /// True once a full period has elapsed since the last release point;
    /// advances the release point as a side effect.
    #[inline]
    pub fn period_elapsed(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.before) >= self.period {
            self.before = now;
            true
        } else {
            false
        }
    }

    /// Block until the current period has elapsed.
    pub fn wait_period(&mut self) {
        while !self.period_elapsed() {
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }
}
