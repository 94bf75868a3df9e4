//! Parameters
//!
//! A [`Parameter`] is one property of a remote device, seen from automation
//! code as a plain number with a getter and a setter. Behind that it keeps two
//! values apart:
//!
//! - the *requested* value, written locally by [`Parameter::set`]
//! - the *reported* value, the last state the device sent
//!
//! [`Parameter::get`] answers with the reported value only when nothing is
//! waiting to be published and the report arrived more than the report delay
//! tolerance after the last local request. A report that lands inside that
//! window is most likely the device still catching up, so the requested value
//! wins until the window has passed.
//!
//! All state changes happen on the loop thread. The owning device learns
//! about pending work through two internal broadcasters: one asking for an
//! update turn, one for synchronous listener notification.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{trace, warn};

use lumen_runtime::{Broadcaster, ListenerToken, TimeSource};
use lumen_types::{Access, ParameterDefinition, ParameterKind};

use crate::transport::Payload;

/// Default window in which a report does not override a local request
pub const DEFAULT_REPORT_DELAY_TOLERANCE: Duration = Duration::from_secs(1);

/// Errors from parameter operations
#[derive(Debug, thiserror::Error)]
pub enum ParameterError {
    #[error("Parameter {0} is not settable")]
    NotSettable(String),

    #[error("Parameter {0} is not queryable")]
    NotQueryable(String),

    #[error("Parameter {property} has no enum value {value:?}")]
    UnknownEnumValue { property: String, value: String },
}

/// Result type for parameter operations
pub type ParameterResult<T> = Result<T, ParameterError>;

struct ParameterState {
    requested: f64,
    requested_at: Option<Duration>,
    reported: f64,
    reported_at: Option<Duration>,
    pending_publish: bool,
    pending_query: bool,
    pending_listeners: bool,
    synchronous: bool,
    tolerance: Duration,
}

impl ParameterState {
    fn reported_is_authoritative(&self) -> bool {
        if self.pending_publish {
            return false;
        }

        match (self.requested_at, self.reported_at) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(requested_at), Some(reported_at)) => {
                reported_at.saturating_sub(requested_at) > self.tolerance
            }
        }
    }

    fn value(&self) -> f64 {
        if self.reported_is_authoritative() {
            self.reported
        } else {
            self.requested
        }
    }
}

struct ParameterInner {
    property: String,
    kind: ParameterKind,
    access: Access,
    min: f64,
    max: f64,
    time_source: Arc<dyn TimeSource>,
    state: Mutex<ParameterState>,
    listeners: Broadcaster<Parameter>,
    wants_update: Broadcaster,
    wants_synchronous_notify: Broadcaster<Parameter>,
}

/// One property of a device. Clones share state.
#[derive(Clone)]
pub struct Parameter {
    inner: Arc<ParameterInner>,
}

impl Parameter {
    pub fn new(
        property: impl Into<String>,
        kind: ParameterKind,
        access: Access,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        let (min, max) = kind.bounds();
        let initial = clamp(0.0, min, max);

        Self {
            inner: Arc::new(ParameterInner {
                property: property.into(),
                kind,
                access,
                min,
                max,
                time_source,
                state: Mutex::new(ParameterState {
                    requested: initial,
                    requested_at: None,
                    reported: initial,
                    reported_at: None,
                    pending_publish: false,
                    pending_query: false,
                    pending_listeners: false,
                    synchronous: false,
                    tolerance: DEFAULT_REPORT_DELAY_TOLERANCE,
                }),
                listeners: Broadcaster::new(),
                wants_update: Broadcaster::new(),
                wants_synchronous_notify: Broadcaster::new(),
            }),
        }
    }

    /// Create from a parsed schema entry
    pub fn from_definition(
        definition: &ParameterDefinition,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self::new(
            definition.property.clone(),
            definition.kind.clone(),
            definition.access,
            time_source,
        )
    }

    pub fn property(&self) -> &str {
        &self.inner.property
    }

    pub fn kind(&self) -> &ParameterKind {
        &self.inner.kind
    }

    pub fn access(&self) -> Access {
        self.inner.access
    }

    /// Inclusive `(min, max)`
    pub fn bounds(&self) -> (f64, f64) {
        (self.inner.min, self.inner.max)
    }

    /// Whether two handles refer to the same parameter
    pub fn ptr_eq(&self, other: &Parameter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────────

    /// Notify listeners inside the turn that caused the change instead of in
    /// the next device update turn
    pub fn set_use_synchronous_broadcast(&self, synchronous: bool) {
        self.inner.state.lock().synchronous = synchronous;
    }

    pub fn set_report_delay_tolerance(&self, tolerance: Duration) {
        self.inner.state.lock().tolerance = tolerance;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Value access
    // ─────────────────────────────────────────────────────────────────────────

    /// The authoritative value
    pub fn get(&self) -> f64 {
        self.inner.state.lock().value()
    }

    /// Request a new value; clamped to the bounds
    pub fn set(&self, value: f64) -> ParameterResult<()> {
        if !self.inner.access.is_settable() {
            return Err(ParameterError::NotSettable(self.inner.property.clone()));
        }

        let value = clamp(value, self.inner.min, self.inner.max);

        let synchronous = {
            let mut state = self.inner.state.lock();
            if value == state.value() {
                return Ok(());
            }

            state.requested = value;
            state.requested_at = Some(self.inner.time_source.monotonic());
            state.pending_publish = true;
            if !state.synchronous {
                state.pending_listeners = true;
            }
            state.synchronous
        };

        trace!("{} requested {}", self.inner.property, value);

        if synchronous {
            self.inner.wants_synchronous_notify.call_listeners(self);
        }
        self.inner.wants_update.call_listeners(&());
        Ok(())
    }

    /// Value mapped to `[0, 1]`; always 0 without finite, non-empty bounds
    pub fn get_normalized(&self) -> f64 {
        match self.inner.kind.span() {
            Some(span) if span > 0.0 => (self.get() - self.inner.min) / span,
            _ => 0.0,
        }
    }

    /// Set from a `[0, 1]` value, rounded to the nearest whole step
    ///
    /// Ignored, with a warning, when the bounds are not finite.
    pub fn set_normalized(&self, value: f64) -> ParameterResult<()> {
        let Some(span) = self.inner.kind.span() else {
            warn!("{} has no finite range to normalize into", self.inner.property);
            return Ok(());
        };
        self.set((value * span + self.inner.min).round())
    }

    pub fn add(&self, delta: f64) -> ParameterResult<()> {
        self.set(self.get() + delta)
    }

    pub fn add_normalized(&self, delta: f64) -> ParameterResult<()> {
        self.set_normalized(self.get_normalized() + delta)
    }

    /// Current value name of an enum parameter
    pub fn enum_value(&self) -> Option<String> {
        match &self.inner.kind {
            ParameterKind::Enum { values } => values.get(self.get() as usize).cloned(),
            _ => None,
        }
    }

    /// Set an enum parameter by value name
    pub fn set_enum_value(&self, name: &str) -> ParameterResult<()> {
        let index = match &self.inner.kind {
            ParameterKind::Enum { values } => values.iter().position(|v| v == name),
            _ => None,
        };

        match index {
            Some(index) => self.set(index as f64),
            None => Err(ParameterError::UnknownEnumValue {
                property: self.inner.property.clone(),
                value: name.to_string(),
            }),
        }
    }

    /// Ask the device to report this parameter in the next update turn
    pub fn query_device(&self) -> ParameterResult<()> {
        if !self.inner.access.is_queryable() {
            return Err(ParameterError::NotQueryable(self.inner.property.clone()));
        }

        self.inner.state.lock().pending_query = true;
        self.inner.wants_update.call_listeners(&());
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Listeners
    // ─────────────────────────────────────────────────────────────────────────

    /// Called after the authoritative value may have changed
    pub fn add_listener(
        &self,
        callback: impl Fn(&Parameter) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.inner.listeners.add_listener(callback)
    }

    pub fn add_listener_with_order(
        &self,
        order: i32,
        callback: impl Fn(&Parameter) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.inner.listeners.add_listener_with_order(order, callback)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Device side
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn on_wants_update(
        &self,
        callback: impl Fn(&()) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.inner.wants_update.add_listener(callback)
    }

    pub(crate) fn on_wants_synchronous_notify(
        &self,
        callback: impl Fn(&Parameter) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.inner.wants_synchronous_notify.add_listener(callback)
    }

    /// Apply a value reported by the device
    pub(crate) fn set_reported(&self, wire: &Value) {
        let Some(value) = self.inner.kind.from_wire(wire) else {
            warn!("Skipping malformed value {} for {}", wire, self.inner.property);
            return;
        };

        let value = clamp(value, self.inner.min, self.inner.max);
        let now = self.inner.time_source.monotonic();

        let notify = {
            let mut state = self.inner.state.lock();

            let changed = value != state.value();
            let newer = state.reported_at.is_none_or(|at| now > at);
            let notify = changed || (state.reported_is_authoritative() && newer);

            state.reported = value;
            state.reported_at = Some(now);

            if notify && !state.synchronous {
                state.pending_listeners = true;
            }
            notify.then_some(state.synchronous)
        };

        match notify {
            Some(true) => self.inner.wants_synchronous_notify.call_listeners(self),
            Some(false) => self.inner.wants_update.call_listeners(&()),
            None => {}
        }
    }

    /// Move the pending value into an outbound payload
    pub(crate) fn append_publish(&self, out: &mut Payload) -> bool {
        let mut state = self.inner.state.lock();
        if !state.pending_publish {
            return false;
        }

        let value = state.value();
        state.pending_publish = false;
        out.insert(self.inner.property.clone(), self.inner.kind.to_wire(value));
        true
    }

    /// Put back a publish that could not be delivered
    pub(crate) fn restore_pending_publish(&self) {
        self.inner.state.lock().pending_publish = true;
    }

    /// Read and clear the one-shot query flag
    pub(crate) fn should_device_be_queried(&self) -> bool {
        std::mem::take(&mut self.inner.state.lock().pending_query)
    }

    pub(crate) fn restore_pending_query(&self) {
        self.inner.state.lock().pending_query = true;
    }

    /// Whether anything is waiting to go out on the wire
    pub(crate) fn has_pending_output(&self) -> bool {
        let state = self.inner.state.lock();
        state.pending_publish || state.pending_query
    }

    /// Fire deferred listeners if a change is pending
    pub(crate) fn call_listeners_if_necessary(&self) {
        if std::mem::take(&mut self.inner.state.lock().pending_listeners) {
            self.inner.listeners.call_listeners(self);
        }
    }

    /// Fire listeners now
    pub(crate) fn notify_listeners(&self) {
        self.inner.listeners.call_listeners(self);
    }
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("property", &self.inner.property)
            .field("kind", &self.inner.kind.name())
            .field("value", &self.get())
            .finish()
    }
}

/// Clamp without panicking on inverted bounds or NaN.
fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
