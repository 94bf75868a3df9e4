//! Scales
//!
//! A [`ScaleMapper`] spreads one `[0, 1]` control across several
//! [`Scalable`]s, each owning a slice of the scale. Turning a dial up first
//! raises the lights assigned to the bottom of the scale, then the next ones,
//! and so on.
//!
//! [`Barriers`] make chosen points on the scale sticky: a value crossing one
//! stops there until the barrier is released by a short pause or by moving
//! back the other way.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use lumen_runtime::{Runtime, Timer};

use crate::device::Device;
use crate::parameter::{Parameter, ParameterResult};

/// How long an activated barrier holds before it is released
pub const BARRIER_HOLD: Duration = Duration::from_millis(750);

/// Map `value` from `[0, 1]` onto `[low, high]`
pub fn map_linear(value: f64, low: f64, high: f64) -> f64 {
    low + (high - low) * value
}

fn clamp(value: f64, low: f64, high: f64) -> f64 {
    value.max(low).min(high)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scalable
// ─────────────────────────────────────────────────────────────────────────────

/// Anything that can be driven by a `[0, 1]` value.
pub trait Scalable: Send + Sync {
    fn set_normalized(&self, value: f64) -> ParameterResult<()>;

    fn get_normalized(&self) -> f64;
}

impl Scalable for Parameter {
    fn set_normalized(&self, value: f64) -> ParameterResult<()> {
        Parameter::set_normalized(self, value)
    }

    fn get_normalized(&self) -> f64 {
        Parameter::get_normalized(self)
    }
}

/// A light with an on/off `state` and a `brightness`, scaled as one value.
///
/// Zero switches the light off; anything above switches it on.
pub struct DimmableLight {
    state: Parameter,
    brightness: Parameter,
}

impl DimmableLight {
    pub fn new(state: Parameter, brightness: Parameter) -> Self {
        Self { state, brightness }
    }

    /// Use the `state` and `brightness` parameters of `device`
    pub fn from_device(device: &Device) -> Option<Self> {
        Some(Self::new(
            device.parameter("state")?.clone(),
            device.parameter("brightness")?.clone(),
        ))
    }
}

impl Scalable for DimmableLight {
    fn set_normalized(&self, value: f64) -> ParameterResult<()> {
        self.brightness.set_normalized(value)?;
        self.state.set(if value > 0.0 { 1.0 } else { 0.0 })
    }

    fn get_normalized(&self) -> f64 {
        if self.state.get() > 0.0 {
            self.brightness.get_normalized()
        } else {
            0.0
        }
    }
}

/// Stands in for the gaps between assigned ranges.
#[derive(Default)]
struct Filler {
    value: Mutex<f64>,
}

impl Scalable for Filler {
    fn set_normalized(&self, value: f64) -> ParameterResult<()> {
        *self.value.lock() = clamp(value, 0.0, 1.0);
        Ok(())
    }

    fn get_normalized(&self) -> f64 {
        *self.value.lock()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Barriers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    None,
    Up,
    Down,
}

impl Direction {
    fn opposite(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::None => Direction::None,
        }
    }
}

struct BarrierState {
    activated: Option<usize>,
    activated_by: Direction,
    last_value: Option<f64>,
    /// Index of the gap between barriers the last value fell into
    last_gap: Option<usize>,
}

/// Sticky points on a `[0, 1]` scale.
pub struct Barriers {
    barriers: Vec<f64>,
    state: Arc<Mutex<BarrierState>>,
    timer: Timer,
    on_activate: Box<dyn Fn() + Send + Sync + 'static>,
}

impl Barriers {
    pub fn new(runtime: &Runtime, barriers: Vec<f64>) -> Self {
        Self::with_callback(runtime, barriers, || {})
    }

    /// `on_activate` runs each time a value is stopped at a barrier
    pub fn with_callback(
        runtime: &Runtime,
        mut barriers: Vec<f64>,
        on_activate: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        barriers.sort_by(f64::total_cmp);

        let state = Arc::new(Mutex::new(BarrierState {
            activated: None,
            activated_by: Direction::None,
            last_value: None,
            last_gap: None,
        }));

        let s = state.clone();
        let timer = runtime.timer(move |timer: &Timer| {
            timer.stop();
            s.lock().activated = None;
        });

        Self {
            barriers,
            state,
            timer,
            on_activate: Box::new(on_activate),
        }
    }

    fn gap(&self, value: f64) -> usize {
        self.barriers.partition_point(|b| *b < value)
    }

    /// Pass `value` through, or hold it at a barrier it just crossed
    ///
    /// Moving one gap further in the direction away from the last activated
    /// barrier is allowed without stopping again.
    pub fn apply(&self, value: f64) -> f64 {
        let activated = {
            let mut state = self.state.lock();
            let Some(last_value) = state.last_value else {
                state.last_value = Some(value);
                return value;
            };

            let direction = if value > last_value {
                Direction::Up
            } else {
                Direction::Down
            };

            if let Some(held) = state.activated.filter(|_| state.activated_by == direction) {
                let held = self.barriers[held];
                state.last_value = Some(held);
                return held;
            }

            if state.activated_by == direction {
                state.activated_by = Direction::None;
            }

            let last_gap = state.last_gap.unwrap_or_else(|| self.gap(last_value));
            let gap = self.gap(value);

            let allowed: isize = if direction == state.activated_by.opposite() {
                2
            } else {
                1
            };
            let moved = gap as isize - last_gap as isize;

            let to_activate = if moved.abs() < allowed {
                None
            } else {
                let delta = moved.clamp(-allowed, allowed);
                let offset = if delta < 0 { delta } else { delta - 1 };
                usize::try_from(last_gap as isize + offset)
                    .ok()
                    .filter(|i| *i < self.barriers.len())
            };

            if last_gap != gap {
                state.activated_by = Direction::None;
            }
            state.last_gap = Some(gap);

            match to_activate {
                Some(index) => {
                    state.activated = Some(index);
                    state.last_gap = Some(index + usize::from(direction == Direction::Up));
                    state.activated_by = direction;
                    state.last_value = Some(self.barriers[index]);
                    Some(self.barriers[index])
                }
                None => {
                    state.last_value = Some(value);
                    None
                }
            }
        };

        match activated {
            Some(barrier) => {
                debug!("Holding at barrier {}", barrier);
                self.timer.start(BARRIER_HOLD);
                (self.on_activate)();
                barrier
            }
            None => value,
        }
    }
}

impl std::fmt::Debug for Barriers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barriers")
            .field("barriers", &self.barriers)
            .field("holding", &self.state.lock().activated)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ScaleMapper
// ─────────────────────────────────────────────────────────────────────────────

struct Range {
    target: Box<dyn Scalable>,
    low: f64,
    high: f64,
}

impl Range {
    /// Where this range's current value sits on the shared scale
    ///
    /// A target at either end reports the scale edge in the direction of
    /// travel, so it never holds back the ranges next to it.
    fn position(&self, increment: f64) -> f64 {
        let value = self.target.get_normalized();

        if value == 0.0 {
            return if increment < 0.0 { 0.0 } else { self.low };
        }
        if value == 1.0 {
            return if increment > 0.0 { 1.0 } else { self.high };
        }

        map_linear(value, self.low, self.high)
    }

    /// The value this range takes at `position` on the shared scale
    fn value_at(&self, position: f64) -> f64 {
        let n = position - self.low;
        let d = self.high - self.low;

        if d == 0.0 {
            return if n < 0.0 { 0.0 } else { 1.0 };
        }

        clamp(n / d, 0.0, 1.0)
    }
}

/// One `[0, 1]` control spread over several [`Scalable`]s.
pub struct ScaleMapper {
    ranges: Vec<Range>,
    barriers: Barriers,
}

impl ScaleMapper {
    /// Assign each target the `[low, high]` part of the scale it follows
    pub fn new(runtime: &Runtime, targets: Vec<(Box<dyn Scalable>, f64, f64)>) -> Self {
        Self::with_barriers(targets, Barriers::new(runtime, Vec::new()))
    }

    pub fn with_barriers(targets: Vec<(Box<dyn Scalable>, f64, f64)>, barriers: Barriers) -> Self {
        let mut ranges: Vec<Range> = targets
            .into_iter()
            .map(|(target, low, high)| Range { target, low, high })
            .collect();
        ranges.sort_by(|a, b| a.low.total_cmp(&b.low));

        // Uncovered stretches still take up room on the scale
        let mut fillers = Vec::new();
        let mut covered = ranges.first().map(|r| r.low).unwrap_or(0.0);
        for range in &ranges {
            if covered < range.low {
                fillers.push(Range {
                    target: Box::new(Filler::default()),
                    low: covered,
                    high: range.low,
                });
            }
            covered = range.high;
        }
        ranges.extend(fillers);

        Self { ranges, barriers }
    }

    /// Move the whole scale by `increment`
    ///
    /// Going up, the lowest position among the targets is the starting
    /// point; going down, the highest.
    pub fn add(&self, increment: f64) -> ParameterResult<()> {
        let positions = self.ranges.iter().map(|r| r.position(increment));
        let start = if increment > 0.0 {
            positions.reduce(f64::min)
        } else {
            positions.reduce(f64::max)
        };

        let Some(start) = start else {
            return Ok(());
        };

        let position = self.barriers.apply(clamp(start + increment, 0.0, 1.0));

        let mut result = Ok(());
        for range in &self.ranges {
            if let Err(err) = range.target.set_normalized(range.value_at(position)) {
                warn!("Failed to scale target: {}", err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

impl std::fmt::Debug for ScaleMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScaleMapper")
            .field("ranges", &self.ranges.len())
            .field("barriers", &self.barriers)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
