//! Time sources
//!
//! Timers and parameter timestamps read time through [`TimeSource`] so that a
//! runtime can be driven by the operating system clocks or by a virtual clock
//! that only moves when told to.

use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Local};
use parking_lot::Mutex;

/// Monotonic and wall-clock readings.
pub trait TimeSource: Send + Sync + 'static {
    /// Time elapsed since an arbitrary, fixed origin. Never goes backwards.
    fn monotonic(&self) -> Duration;

    /// Current wall-clock time
    fn wall_clock(&self) -> SystemTime;

    /// Current local time, for display and scheduling by time of day
    fn now(&self) -> DateTime<Local> {
        DateTime::<Local>::from(self.wall_clock())
    }

    /// Downcast hook used by the timer scheduler to drive virtual time
    fn as_virtual(&self) -> Option<&VirtualTimeSource> {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// System clock
// ─────────────────────────────────────────────────────────────────────────────

/// The operating system's monotonic and wall clocks.
#[derive(Debug, Clone, Copy)]
pub struct SystemTimeSource {
    origin: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall_clock(&self) -> SystemTime {
        SystemTime::now()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Virtual clock
// ─────────────────────────────────────────────────────────────────────────────

/// A clock that only moves through [`VirtualTimeSource::advance_by`].
///
/// Monotonic time starts at zero. The wall clock is the base captured at
/// construction plus the same offset.
///
/// In auto mode the timer scheduler advances the clock itself whenever timers
/// are armed, so timer-driven code runs as fast as the CPU allows. In manual
/// mode nothing moves until the test calls
/// [`TimerScheduler::advance_virtual_time`](crate::TimerScheduler::advance_virtual_time).
#[derive(Debug)]
pub struct VirtualTimeSource {
    offset: Mutex<Duration>,
    wall_base: SystemTime,
    auto: bool,
}

impl VirtualTimeSource {
    /// Virtual clock that the scheduler fast-forwards on its own
    pub fn new() -> Self {
        Self::with_mode(true)
    }

    /// Virtual clock that only moves when a test advances it
    pub fn manual() -> Self {
        Self::with_mode(false)
    }

    fn with_mode(auto: bool) -> Self {
        Self {
            offset: Mutex::new(Duration::ZERO),
            wall_base: SystemTime::now(),
            auto,
        }
    }

    /// Pin the wall clock origin
    pub fn with_wall_clock_base(mut self, base: SystemTime) -> Self {
        self.wall_base = base;
        self
    }

    /// Move both readings forward
    pub fn advance_by(&self, duration: Duration) {
        *self.offset.lock() += duration;
    }

    /// Whether the scheduler drives this clock
    pub fn is_auto(&self) -> bool {
        self.auto
    }
}

impl Default for VirtualTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for VirtualTimeSource {
    fn monotonic(&self) -> Duration {
        *self.offset.lock()
    }

    fn wall_clock(&self) -> SystemTime {
        self.wall_base + *self.offset.lock()
    }

    fn as_virtual(&self) -> Option<&VirtualTimeSource> {
        Some(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_time_only_moves_when_advanced() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = VirtualTimeSource::manual().with_wall_clock_base(base);

        assert_eq!(clock.monotonic(), Duration::ZERO);
        assert_eq!(clock.wall_clock(), base);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.monotonic(), Duration::ZERO);

        clock.advance_by(Duration::from_millis(1500));
        assert_eq!(clock.monotonic(), Duration::from_millis(1500));
        assert_eq!(clock.wall_clock(), base + Duration::from_millis(1500));
        assert_eq!(clock.now().timestamp_millis(), 1_700_000_000_000 + 1500);
    }

    #[test]
    fn test_modes() {
        assert!(VirtualTimeSource::new().is_auto());
        assert!(!VirtualTimeSource::manual().is_auto());
        assert!(SystemTimeSource::new().as_virtual().is_none());
        assert!(VirtualTimeSource::new().as_virtual().is_some());
    }

    #[test]
    fn test_system_time_is_monotonic() {
        let clock = SystemTimeSource::new();
        let a = clock.monotonic();
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.monotonic() > a);
    }
}
