//! Tick accounting.
//!
//! Time is counted in ticks. The timer device raises an interrupt every
//! [`TIMER_TICKS`] ticks; the scheduler's aging and preemption checks
//! hang off that interrupt.

/// Ticks between timer interrupts. Also the round-robin quantum of the
/// lowest scheduling queue.
pub const TIMER_TICKS: u64 = 100;

/// Running counters of the machine.
#[derive(Debug, Default)]
pub struct Stats {
    total_ticks: u64,
}

impl Stats {
    /// Fresh counters at tick zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks elapsed since the machine started.
    #[inline]
    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    /// Advance the clock by `ticks`.
    #[inline]
    pub fn advance(&mut self, ticks: u64) {
        self.total_ticks += ticks;
    }
}
