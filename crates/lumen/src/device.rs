//! Devices
//!
//! A [`Device`] groups the parameters of one remote device under its topic.
//! Inbound state messages are fanned out to parameters by property name.
//! Outbound changes are collected into one update turn per loop batch: every
//! pending `set` goes out in a single `{base}/{name}/set` payload and every
//! pending query in a single `{base}/{name}/get` payload.
//!
//! Devices are built explicitly with a [`DeviceBuilder`], either by listing
//! parameters by hand or from a parsed [`DeviceDefinition`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace, warn};

use lumen_runtime::{AsyncUpdater, Runtime, Timer};
use lumen_types::{Access, DeviceDefinition, ParameterDefinition, ParameterKind};

use crate::parameter::{DEFAULT_REPORT_DELAY_TOLERANCE, Parameter};
use crate::transport::{Payload, Transport};

/// Base topic of a zigbee2mqtt bridge with default settings
pub const DEFAULT_BASE_TOPIC: &str = "zigbee2mqtt";

/// Delay before an update turn that could not publish is retried
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Describes a device before it is bound to a runtime.
#[derive(Debug, Clone)]
pub struct DeviceBuilder {
    name: String,
    base_topic: String,
    parameters: Vec<ParameterDefinition>,
    report_delay_tolerance: Duration,
    synchronous_listeners: bool,
}

impl DeviceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_topic: DEFAULT_BASE_TOPIC.to_string(),
            parameters: Vec::new(),
            report_delay_tolerance: DEFAULT_REPORT_DELAY_TOLERANCE,
            synchronous_listeners: false,
        }
    }

    /// Start from a parsed schema entry
    pub fn from_definition(definition: &DeviceDefinition) -> Self {
        let mut builder = Self::new(definition.friendly_name.clone());
        builder.parameters = definition.parameters.clone();
        builder
    }

    pub fn parameter(mut self, definition: ParameterDefinition) -> Self {
        self.parameters.push(definition);
        self
    }

    pub fn numeric(self, property: impl Into<String>, min: f64, max: f64) -> Self {
        self.parameter(ParameterDefinition::new(property, ParameterKind::Numeric { min, max }))
    }

    pub fn toggle(self, property: impl Into<String>) -> Self {
        self.parameter(ParameterDefinition::new(property, ParameterKind::Toggle))
    }

    pub fn binary(self, property: impl Into<String>) -> Self {
        self.parameter(ParameterDefinition::new(property, ParameterKind::Binary))
    }

    pub fn enumeration<S: Into<String>>(
        self,
        property: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.parameter(ParameterDefinition::new(property, ParameterKind::Enum { values }))
    }

    /// Read-only sensor value
    pub fn sensor(self, property: impl Into<String>, min: f64, max: f64) -> Self {
        self.parameter(
            ParameterDefinition::new(property, ParameterKind::Numeric { min, max })
                .with_access(Access::PUBLISHED),
        )
    }

    pub fn with_base_topic(mut self, base_topic: impl Into<String>) -> Self {
        self.base_topic = base_topic.into();
        self
    }

    pub fn with_report_delay_tolerance(mut self, tolerance: Duration) -> Self {
        self.report_delay_tolerance = tolerance;
        self
    }

    pub fn with_synchronous_listeners(mut self, synchronous: bool) -> Self {
        self.synchronous_listeners = synchronous;
        self
    }

    /// Bind the device to `runtime`
    pub fn build(self, runtime: &Runtime) -> Device {
        let parameters: Vec<Parameter> = self
            .parameters
            .iter()
            .map(|definition| {
                let parameter =
                    Parameter::from_definition(definition, runtime.time_source().clone());
                parameter.set_report_delay_tolerance(self.report_delay_tolerance);
                parameter.set_use_synchronous_broadcast(self.synchronous_listeners);
                parameter
            })
            .collect();

        Device::new(runtime, self.name, self.base_topic, parameters)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct DispatchState {
    in_message: bool,
    synchronous: Vec<Parameter>,
}

struct DeviceInner {
    name: String,
    topic: String,
    parameters: Vec<Parameter>,
    by_property: HashMap<String, Vec<Parameter>>,
    publisher: Mutex<Option<Arc<dyn Transport>>>,
    dispatch: Mutex<DispatchState>,
    updater: AsyncUpdater,
    retry: Timer,
}

/// One remote device. Clones share state.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    fn new(
        runtime: &Runtime,
        name: String,
        base_topic: String,
        parameters: Vec<Parameter>,
    ) -> Self {
        let mut by_property: HashMap<String, Vec<Parameter>> = HashMap::new();
        for parameter in &parameters {
            by_property
                .entry(parameter.property().to_string())
                .or_default()
                .push(parameter.clone());
        }

        let inner = Arc::new_cyclic(|weak: &Weak<DeviceInner>| {
            let w = weak.clone();
            let updater = AsyncUpdater::new(runtime.message_loop().clone(), move || {
                if let Some(inner) = w.upgrade() {
                    inner.update();
                }
            });

            let w = weak.clone();
            let retry = runtime.timer(move |timer: &Timer| {
                timer.stop();
                if let Some(inner) = w.upgrade() {
                    inner.update();
                }
            });

            for parameter in &parameters {
                let u = updater.clone();
                let _ = parameter.on_wants_update(move |_| u.trigger());

                let w = weak.clone();
                let _ = parameter.on_wants_synchronous_notify(move |p: &Parameter| {
                    if let Some(inner) = w.upgrade() {
                        inner.synchronous_notify(p);
                    }
                });
            }

            DeviceInner {
                topic: format!("{}/{}", base_topic, name),
                name,
                parameters,
                by_property,
                publisher: Mutex::new(None),
                dispatch: Mutex::new(DispatchState::default()),
                updater,
                retry,
            }
        });

        Self { inner }
    }

    /// Build a device with default settings from a parsed schema entry
    pub fn from_definition(definition: &DeviceDefinition, runtime: &Runtime) -> Self {
        DeviceBuilder::from_definition(definition).build(runtime)
    }

    /// Friendly name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// State topic, `{base}/{name}`
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn set_topic(&self) -> String {
        format!("{}/set", self.inner.topic)
    }

    pub fn get_topic(&self) -> String {
        format!("{}/get", self.inner.topic)
    }

    /// First parameter registered under `property`
    pub fn parameter(&self, property: &str) -> Option<&Parameter> {
        self.inner.by_property.get(property).and_then(|p| p.first())
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.inner.parameters
    }

    /// Whether the device currently has somewhere to publish to
    pub fn is_connected(&self) -> bool {
        self.inner.publisher.lock().is_some()
    }

    /// Hand the device a connected transport, or take it away on disconnect
    pub fn set_publisher(&self, publisher: Option<Arc<dyn Transport>>) {
        let connected = publisher.is_some();
        *self.inner.publisher.lock() = publisher;

        if connected {
            self.inner.updater.trigger();
        }
    }

    /// Query every queryable parameter
    pub fn query_all(&self) {
        for parameter in &self.inner.parameters {
            if parameter.access().is_queryable() {
                let _ = parameter.query_device();
            }
        }
    }

    /// Apply a state message received on [`Device::topic`]
    ///
    /// Fields without a matching parameter and explicit nulls are ignored.
    /// Synchronous listeners run once the whole payload is applied.
    pub fn on_message(&self, payload: &Payload) {
        self.inner.dispatch.lock().in_message = true;

        for (property, value) in payload {
            if value.is_null() {
                continue;
            }

            match self.inner.by_property.get(property) {
                Some(parameters) => {
                    for parameter in parameters {
                        parameter.set_reported(value);
                    }
                }
                None => trace!("{}: no parameter for field {}", self.inner.name, property),
            }
        }

        let notify = {
            let mut dispatch = self.inner.dispatch.lock();
            dispatch.in_message = false;
            std::mem::take(&mut dispatch.synchronous)
        };

        for parameter in notify {
            parameter.notify_listeners();
        }
    }
}

impl DeviceInner {
    fn synchronous_notify(&self, parameter: &Parameter) {
        {
            let mut dispatch = self.dispatch.lock();
            if dispatch.in_message {
                if !dispatch.synchronous.iter().any(|p| p.ptr_eq(parameter)) {
                    dispatch.synchronous.push(parameter.clone());
                }
                return;
            }
        }

        parameter.notify_listeners();
    }

    fn schedule_retry(&self) {
        if !self.retry.is_running() {
            self.retry.start(RETRY_INTERVAL);
        }
    }

    /// One update turn: deferred listeners, then publish and query
    fn update(&self) {
        for parameter in &self.parameters {
            parameter.call_listeners_if_necessary();
        }

        let Some(publisher) = self.publisher.lock().clone() else {
            if self.parameters.iter().any(Parameter::has_pending_output) {
                trace!("{}: not connected, retrying in {:?}", self.name, RETRY_INTERVAL);
                self.schedule_retry();
            }
            return;
        };

        let mut publish = Payload::new();
        let published: Vec<&Parameter> = self
            .parameters
            .iter()
            .filter(|p| p.append_publish(&mut publish))
            .collect();

        if !publish.is_empty() {
            let topic = format!("{}/set", self.topic);
            if let Err(err) = publisher.publish(&topic, &publish) {
                warn!("{}: publish failed: {}", self.name, err);
                for parameter in published {
                    parameter.restore_pending_publish();
                }
                self.schedule_retry();
                return;
            }
            debug!("{}: published {:?}", self.name, publish.keys().collect::<Vec<_>>());
        }

        let mut query = Payload::new();
        let queried: Vec<&Parameter> = self
            .parameters
            .iter()
            .filter(|p| p.should_device_be_queried())
            .collect();

        for parameter in &queried {
            query.insert(parameter.property().to_string(), Value::String(String::new()));
        }

        if !query.is_empty() {
            let topic = format!("{}/get", self.topic);
            if let Err(err) = publisher.publish(&topic, &query) {
                warn!("{}: query failed: {}", self.name, err);
                for parameter in queried {
                    parameter.restore_pending_query();
                }
                self.schedule_retry();
                return;
            }
            debug!("{}: queried {:?}", self.name, query.keys().collect::<Vec<_>>());
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("topic", &self.inner.topic)
            .field("parameters", &self.inner.parameters)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
