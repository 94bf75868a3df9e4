//! Timers
//!
//! A [`TimerScheduler`] keeps the set of armed [`Timer`]s sorted by remaining
//! wait. Expiry is noticed either by a background thread (real time) or by a
//! wakeup message that fast-forwards a virtual clock, but callbacks always run
//! inside a dispatch message on the loop thread.
//!
//! Remaining waits are signed nanoseconds: a timer may be overdue by the time
//! it is dispatched, and "due" means `remaining <= 0`.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace, warn};

use crate::message_loop::MessageLoop;
use crate::time_source::TimeSource;

/// Shortest wait handed to the wakeup mechanism
pub const MIN_WAKEUP: Duration = Duration::from_millis(1);

/// Longest wait handed to the wakeup mechanism
pub const MAX_WAKEUP: Duration = Duration::from_millis(500);

/// Wall-clock time a single dispatch message may spend invoking callbacks
pub const DISPATCH_BUDGET: Duration = Duration::from_millis(100);

fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

fn clamp_wakeup(remaining: i64) -> Duration {
    let wait = Duration::from_nanos(remaining.max(0) as u64);
    wait.clamp(MIN_WAKEUP, MAX_WAKEUP)
}

// ─────────────────────────────────────────────────────────────────────────────
// Timer
// ─────────────────────────────────────────────────────────────────────────────

struct TimerState {
    period: Duration,
    remaining: i64,
    should_stop: bool,
    in_running: bool,
}

struct TimerInner {
    id: u64,
    state: Mutex<TimerState>,
    callback: Box<dyn Fn(&Timer) + Send + Sync + 'static>,
    scheduler: Weak<SchedulerShared>,
}

/// A restartable periodic timer.
///
/// The callback receives the timer itself so it can stop or restart it.
/// Clones refer to the same timer.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Arm the timer to fire every `period`, first after one full period
    ///
    /// Restarting an armed timer resets its remaining wait. A zero period
    /// fires on the next dispatch, never from inside this call, and repeats
    /// every [`MIN_WAKEUP`] after that.
    pub fn start(&self, period: Duration) {
        let Some(shared) = self.inner.scheduler.upgrade() else {
            warn!("Timer {} started after its scheduler was dropped", self.inner.id);
            return;
        };

        let mut state = shared.state.lock();
        shared.advance(&mut state);

        {
            let mut timer = self.inner.state.lock();
            timer.should_stop = false;
            timer.period = period;
            timer.remaining = nanos(period);

            if !timer.in_running {
                timer.in_running = true;
                state.running.push(self.clone());
            }
        }

        trace!("Timer {} started with period {:?}", self.inner.id, period);

        reshuffle(&mut state.running);
        shared.update_wakeup(&mut state);
    }

    /// Disarm the timer
    ///
    /// Safe to call from the timer's own callback and idempotent. The timer
    /// leaves the armed set lazily on the next reshuffle.
    pub fn stop(&self) {
        self.inner.state.lock().should_stop = true;
    }

    /// Whether the timer is armed
    pub fn is_running(&self) -> bool {
        let timer = self.inner.state.lock();
        timer.in_running && !timer.should_stop
    }

    /// Period given to the last [`Timer::start`]
    pub fn period(&self) -> Duration {
        self.inner.state.lock().period
    }

    fn remaining(&self) -> i64 {
        self.inner.state.lock().remaining
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let timer = self.inner.state.lock();
        f.debug_struct("Timer")
            .field("id", &self.inner.id)
            .field("period", &timer.period)
            .field("remaining_ns", &timer.remaining)
            .field("stopped", &timer.should_stop)
            .finish()
    }
}

/// Drop stopped timers and stable-sort the rest by remaining wait.
fn reshuffle(running: &mut Vec<Timer>) {
    running.retain(|timer| {
        let mut state = timer.inner.state.lock();
        if state.should_stop {
            state.in_running = false;
            false
        } else {
            true
        }
    });

    running.sort_by_key(Timer::remaining);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

struct SchedulerState {
    running: Vec<Timer>,
    last_advance: Duration,
    next_timer_id: u64,
    virtual_wakeup_pending: bool,
    thread_started: bool,
}

/// Deadline slot shared with the background wakeup thread.
struct Wakeup {
    deadline: Mutex<WakeupSlot>,
    condition: Condvar,
}

struct WakeupSlot {
    at: Option<Instant>,
    shutdown: bool,
}

struct SchedulerShared {
    message_loop: MessageLoop,
    time_source: Arc<dyn TimeSource>,
    state: Mutex<SchedulerState>,
    wakeup: Arc<Wakeup>,
}

impl Drop for SchedulerShared {
    fn drop(&mut self) {
        self.wakeup.deadline.lock().shutdown = true;
        self.wakeup.condition.notify_all();
    }
}

/// Owns the armed timer set of one message loop.
#[derive(Clone)]
pub struct TimerScheduler {
    shared: Arc<SchedulerShared>,
}

impl TimerScheduler {
    pub fn new(message_loop: MessageLoop, time_source: Arc<dyn TimeSource>) -> Self {
        let last_advance = time_source.monotonic();

        Self {
            shared: Arc::new(SchedulerShared {
                message_loop,
                time_source,
                state: Mutex::new(SchedulerState {
                    running: Vec::new(),
                    last_advance,
                    next_timer_id: 0,
                    virtual_wakeup_pending: false,
                    thread_started: false,
                }),
                wakeup: Arc::new(Wakeup {
                    deadline: Mutex::new(WakeupSlot {
                        at: None,
                        shutdown: false,
                    }),
                    condition: Condvar::new(),
                }),
            }),
        }
    }

    /// Create a stopped timer
    pub fn timer(&self, callback: impl Fn(&Timer) + Send + Sync + 'static) -> Timer {
        let id = {
            let mut state = self.shared.state.lock();
            let id = state.next_timer_id;
            state.next_timer_id += 1;
            id
        };

        Timer {
            inner: Arc::new(TimerInner {
                id,
                state: Mutex::new(TimerState {
                    period: Duration::ZERO,
                    remaining: 0,
                    should_stop: true,
                    in_running: false,
                }),
                callback: Box::new(callback),
                scheduler: Arc::downgrade(&self.shared),
            }),
        }
    }

    /// Number of timers currently in the armed set
    pub fn armed(&self) -> usize {
        self.shared
            .state
            .lock()
            .running
            .iter()
            .filter(|timer| timer.is_running())
            .count()
    }

    /// Step a virtual clock forward by `duration`, deadline by deadline
    ///
    /// Every timer that comes due is dispatched at its exact deadline, on the
    /// calling thread. Call this from the loop thread, or while the loop is not
    /// running. Has no effect with a real clock.
    pub fn advance_virtual_time(&self, duration: Duration) {
        let shared = &self.shared;
        let Some(clock) = shared.time_source.as_virtual() else {
            warn!("advance_virtual_time called on a runtime with a real clock");
            return;
        };

        let mut left = nanos(duration);
        let mut dispatched_here = false;

        loop {
            let mut step = {
                let mut state = shared.state.lock();
                shared.advance(&mut state);
                reshuffle(&mut state.running);

                match state.running.first().map(Timer::remaining) {
                    Some(remaining) if remaining <= left => remaining.max(0),
                    _ => left,
                }
            };

            // Whatever is still due at this instant had its turn already
            if step == 0 && dispatched_here {
                step = nanos(MIN_WAKEUP).min(left);
            }

            clock.advance_by(Duration::from_nanos(step as u64));
            left -= step;

            shared.dispatch();
            dispatched_here = true;

            if left <= 0 {
                break;
            }
        }
    }
}

impl std::fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("armed", &self.armed())
            .finish_non_exhaustive()
    }
}

impl SchedulerShared {
    /// Subtract the time elapsed since the last call from every armed timer.
    fn advance(&self, state: &mut SchedulerState) {
        let now = self.time_source.monotonic();
        let elapsed = nanos(now.saturating_sub(state.last_advance));
        state.last_advance = now;

        if elapsed == 0 {
            return;
        }

        for timer in &state.running {
            timer.inner.state.lock().remaining -= elapsed;
        }
    }

    /// Runs on the loop thread: fire every due timer, then rearm the wakeup.
    fn dispatch(self: &Arc<Self>) {
        let started = Instant::now();
        let mut state = self.state.lock();
        self.advance(&mut state);

        loop {
            let Some(timer) = state.running.first().cloned() else {
                break;
            };

            let (due, stopped) = {
                let timer = timer.inner.state.lock();
                (timer.remaining <= 0, timer.should_stop)
            };

            if stopped {
                reshuffle(&mut state.running);
                continue;
            }

            if !due {
                break;
            }

            if started.elapsed() >= DISPATCH_BUDGET {
                trace!("Dispatch budget exhausted, continuing in a new message");
                drop(state);
                let shared = self.clone();
                self.message_loop.post(move || shared.dispatch());
                return;
            }

            drop(state);
            (timer.inner.callback)(&timer);
            state = self.state.lock();

            {
                let mut t = timer.inner.state.lock();
                if !t.should_stop {
                    t.remaining = nanos(t.period.max(MIN_WAKEUP));
                }
            }

            reshuffle(&mut state.running);
            self.advance(&mut state);
        }

        self.update_wakeup(&mut state);
    }

    /// Arrange for exactly one future dispatch while timers are armed.
    fn update_wakeup(self: &Arc<Self>, state: &mut SchedulerState) {
        let earliest = state.running.first().map(Timer::remaining);

        match self.time_source.as_virtual() {
            Some(clock) if clock.is_auto() => {
                if earliest.is_some() && !state.virtual_wakeup_pending {
                    state.virtual_wakeup_pending = true;
                    let shared = self.clone();
                    self.message_loop.post(move || shared.virtual_wakeup());
                }
            }
            Some(_) => {}
            None => {
                let at = earliest.map(|remaining| Instant::now() + clamp_wakeup(remaining));

                if at.is_some() && !state.thread_started {
                    state.thread_started = self.spawn_wakeup_thread();
                }

                self.wakeup.deadline.lock().at = at;
                self.wakeup.condition.notify_all();
            }
        }
    }

    /// Fast-forward the virtual clock to the next wakeup and dispatch.
    fn virtual_wakeup(self: &Arc<Self>) {
        let Some(clock) = self.time_source.as_virtual() else {
            return;
        };

        let step = {
            let mut state = self.state.lock();
            state.virtual_wakeup_pending = false;
            self.advance(&mut state);
            reshuffle(&mut state.running);

            match state.running.first() {
                Some(timer) => clamp_wakeup(timer.remaining()),
                None => return,
            }
        };

        clock.advance_by(step);
        self.dispatch();
    }

    fn spawn_wakeup_thread(self: &Arc<Self>) -> bool {
        let wakeup = self.wakeup.clone();
        let scheduler = Arc::downgrade(self);

        let spawned = thread::Builder::new()
            .name("lumen-timer".into())
            .spawn(move || wakeup_thread(wakeup, scheduler));

        match spawned {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to spawn timer thread: {}", e);
                false
            }
        }
    }
}

/// Waits for the deadline slot to expire and posts a dispatch message.
fn wakeup_thread(wakeup: Arc<Wakeup>, scheduler: Weak<SchedulerShared>) {
    let mut slot = wakeup.deadline.lock();

    loop {
        if slot.shutdown {
            break;
        }

        let at = slot.at;
        match at {
            None => wakeup.condition.wait(&mut slot),
            Some(at) if Instant::now() >= at => {
                slot.at = None;
                drop(slot);

                let Some(shared) = scheduler.upgrade() else {
                    break;
                };
                let dispatcher = shared.clone();
                shared.message_loop.post(move || dispatcher.dispatch());
                drop(shared);

                slot = wakeup.deadline.lock();
            }
            Some(at) => {
                wakeup.condition.wait_until(&mut slot, at);
            }
        }
    }

    trace!("Timer thread exiting");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
