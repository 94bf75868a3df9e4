//! Lumen Runtime
//!
//! The single-threaded execution core that everything else in Lumen rides on.
//!
//! # Architecture
//!
//! - [`MessageLoop`]: multi-producer, single-consumer queue of closures. The
//!   thread calling [`MessageLoop::run`] is the only place callbacks execute.
//! - [`TimerScheduler`] and [`Timer`]: deadline timers whose callbacks are
//!   dispatched through the loop, never from the background timer thread.
//! - [`TimeSource`]: real or virtual clock. Virtual time lets timer-driven
//!   logic run at CPU speed in tests.
//! - [`Broadcaster`]: ordered listener lists with removal tokens.
//! - [`AsyncUpdater`]: coalesces many "please update" signals into one loop turn.
//!
//! A [`Runtime`] bundles one loop, one scheduler and one time source. It is
//! constructed explicitly and passed by reference, so independent runtimes can
//! coexist in the same process (one per test, for example).

mod broadcaster;
mod error;
mod message_loop;
mod time_source;
mod timer;
mod updater;

pub use broadcaster::*;
pub use error::*;
pub use message_loop::*;
pub use time_source::*;
pub use timer::*;
pub use updater::*;

use std::sync::Arc;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────────────────

/// A message loop, its timer scheduler and the clock they share.
///
/// Cloning is cheap; all clones refer to the same loop.
#[derive(Clone)]
pub struct Runtime {
    message_loop: MessageLoop,
    scheduler: TimerScheduler,
    time_source: Arc<dyn TimeSource>,
}

impl Runtime {
    /// Create a runtime driven by the operating system clocks
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource::new()))
    }

    /// Create a runtime on a virtual clock that fast-forwards itself
    ///
    /// Timers fire in deadline order without any real waiting.
    pub fn new_virtual() -> Self {
        Self::with_time_source(Arc::new(VirtualTimeSource::new()))
    }

    /// Create a runtime with an explicit time source
    pub fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
        let message_loop = MessageLoop::new();
        let scheduler = TimerScheduler::new(message_loop.clone(), time_source.clone());

        Self {
            message_loop,
            scheduler,
            time_source,
        }
    }

    /// The message loop
    pub fn message_loop(&self) -> &MessageLoop {
        &self.message_loop
    }

    /// The timer scheduler
    pub fn scheduler(&self) -> &TimerScheduler {
        &self.scheduler
    }

    /// The clock used for timers and parameter timestamps
    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.time_source
    }

    /// Shorthand for the current monotonic reading
    pub fn monotonic(&self) -> Duration {
        self.time_source.monotonic()
    }

    /// Post a message to the loop
    pub fn post(&self, message: impl FnOnce() + Send + 'static) {
        self.message_loop.post(message);
    }

    /// Create a timer bound to this runtime's scheduler
    pub fn timer(&self, callback: impl Fn(&Timer) + Send + Sync + 'static) -> Timer {
        self.scheduler.timer(callback)
    }

    /// Run the loop on the calling thread until [`Runtime::stop`] is called
    pub fn run(&self) -> RuntimeResult<()> {
        self.message_loop.run()
    }

    /// Ask the loop to exit after the current batch
    pub fn stop(&self) {
        self.message_loop.stop();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("virtual_time", &self.time_source.as_virtual().is_some())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_virtual_runtime_runs_timer_without_waiting() {
        let runtime = Runtime::new_virtual();
        let fired_at = Arc::new(Mutex::new(None));

        let rt = runtime.clone();
        let fired = fired_at.clone();
        let timer = runtime.timer(move |timer| {
            timer.stop();
            *fired.lock() = Some(rt.monotonic());
            rt.stop();
        });

        timer.start(Duration::from_secs(3600));

        let started = std::time::Instant::now();
        runtime.run().unwrap();

        assert_eq!(*fired_at.lock(), Some(Duration::from_secs(3600)));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn test_independent_runtimes() {
        let a = Runtime::new_virtual();
        let b = Runtime::new_virtual();

        let a_ran = Arc::new(Mutex::new(false));
        let flag = a_ran.clone();
        let stopper = a.clone();
        a.post(move || {
            *flag.lock() = true;
            stopper.stop();
        });

        a.run().unwrap();

        assert!(*a_ran.lock());
        assert_eq!(b.message_loop().pending(), 0);
    }
}
