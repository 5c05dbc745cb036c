//! Countdown-bounded repeating timers shared by every polling loop.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// A polling budget decremented by one step per tick.
#[derive(Debug, Clone, Copy)]
pub struct Countdown {
    remaining: Duration,
    step: Duration,
}

impl Countdown {
    pub fn new(budget: Duration, step: Duration) -> Self {
        Self {
            remaining: budget,
            step,
        }
    }

    /// Consume one step. Returns `true` once the budget is exhausted.
    pub fn elapse(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(self.step);
        self.remaining.is_zero()
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }
}

/// An interval whose first tick fires one `period` from now.
///
/// Slow ticks delay the schedule instead of bursting to catch up.
pub fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
