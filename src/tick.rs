//! # Tick Source
//!
//! One periodic timer per core drives scheduler time. Compare-match
//! timers re-arm by advancing the compare value by exactly one period on
//! every firing, never by reading the counter, so ISR latency does not
//! accumulate as drift.
//!
//! If the ISR ran so late that the advanced compare value is already in
//! the past, the next tick needs a full counter wrap. That is asserted in
//! debug builds; release builds log it and carry on with a compressed
//! tick.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{CPU_CLOCK_HZ, TICK_RATE_HZ};

/// Hardware periodic timer.
pub trait TickTimer {
    /// Program the timer to fire every `period` cycles and enable its
    /// interrupt.
    fn start(&self, period: u32);

    /// Disable the timer interrupt.
    fn stop(&self);

    /// Clear the pending flag of the current firing.
    fn clear_pending(&self);

    /// Move the compare value one `period` forward.
    ///
    /// Returns the cycles left until the new compare value, or `None` for
    /// auto-reload timers that cannot fall behind.
    fn advance_compare(&self, period: u32) -> Option<u32>;
}

impl<T: TickTimer + ?Sized> TickTimer for &T {
    fn start(&self, period: u32) {
        (**self).start(period)
    }

    fn stop(&self) {
        (**self).stop()
    }

    fn clear_pending(&self) {
        (**self).clear_pending()
    }

    fn advance_compare(&self, period: u32) -> Option<u32> {
        (**self).advance_compare(period)
    }
}

/// Clock and tick rate of a tick source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickConfig {
    clock_hz: u32,
    rate_hz: u32,
}

impl TickConfig {
    /// Panics at const evaluation for a zero rate or a rate above the clock.
    pub const fn new(clock_hz: u32, rate_hz: u32) -> Self {
        assert!(rate_hz > 0, "tick rate must be non-zero");
        assert!(clock_hz >= rate_hz, "tick rate must not exceed the clock");
        Self { clock_hz, rate_hz }
    }

    pub const fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    pub const fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    /// Timer cycles per tick.
    pub const fn period(&self) -> u32 {
        self.clock_hz / self.rate_hz
    }
}

impl Default for TickConfig {
    fn default() -> Self {
        Self::new(CPU_CLOCK_HZ, TICK_RATE_HZ)
    }
}

/// Outcome of acknowledging one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    OnTime,
    /// The next compare value was already in the past.
    Late,
}

/// A [`TickTimer`] bound to its configuration.
pub struct TickSource<T> {
    timer: T,
    config: TickConfig,
    late_ticks: AtomicU32,
}

impl<T: TickTimer> TickSource<T> {
    pub const fn new(timer: T, config: TickConfig) -> Self {
        Self {
            timer,
            config,
            late_ticks: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> TickConfig {
        self.config
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn start(&self) {
        log::debug!(
            "tick: {} Hz, period {} cycles",
            self.config.rate_hz(),
            self.config.period()
        );
        self.timer.start(self.config.period());
    }

    pub fn stop(&self) {
        self.timer.stop();
    }

    /// Ticks that found their next compare value already passed.
    pub fn late_ticks(&self) -> u32 {
        self.late_ticks.load(Ordering::Relaxed)
    }

    /// First half of the tick ISR: clear pending before re-arming so a
    /// back-to-back firing is not lost, then advance the compare value.
    pub fn acknowledge(&self) -> TickStatus {
        self.timer.clear_pending();
        let period = self.config.period();
        let late = matches!(self.timer.advance_compare(period), Some(remaining) if remaining > period);
        if late {
            self.late_ticks.fetch_add(1, Ordering::Relaxed);
            log::warn!("tick: compare already passed, next tick compressed");
        }
        debug_assert!(!late, "tick compare already in the past");
        if late {
            TickStatus::Late
        } else {
            TickStatus::OnTime
        }
    }
}
