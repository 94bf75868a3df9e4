//! Devices client
//!
//! Glues a [`Transport`] to a set of [`Device`]s. Transport callbacks may
//! arrive on any thread; the client only posts them into the runtime's loop,
//! where connection handling and message dispatch happen.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, trace, warn};

use lumen_runtime::{Broadcaster, Runtime, RuntimeError};
use lumen_types::DeviceDefinition;

use crate::config::LumenConfig;
use crate::device::{DEFAULT_BASE_TOPIC, Device, DeviceBuilder};
use crate::parameter::DEFAULT_REPORT_DELAY_TOLERANCE;
use crate::transport::{ConnectOptions, Payload, Transport, TransportError};

/// Errors ending [`DevicesClient::loop_forever`]
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Settings shared by the client and the devices it creates
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect: ConnectOptions,
    pub base_topic: String,
    pub skip_initial_query: bool,
    pub report_delay_tolerance: Duration,
    pub synchronous_listeners: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            base_topic: DEFAULT_BASE_TOPIC.to_string(),
            skip_initial_query: false,
            report_delay_tolerance: DEFAULT_REPORT_DELAY_TOLERANCE,
            synchronous_listeners: false,
        }
    }
}

#[derive(Default)]
struct ClientState {
    devices: Vec<Device>,
    by_topic: HashMap<String, Device>,
    connected: bool,
}

struct ClientInner {
    runtime: Runtime,
    transport: Arc<dyn Transport>,
    options: Mutex<ClientOptions>,
    state: Mutex<ClientState>,
    on_connect: Broadcaster,
}

/// Owns the devices of one bridge and the transport they talk through.
#[derive(Clone)]
pub struct DevicesClient {
    inner: Arc<ClientInner>,
}

impl DevicesClient {
    pub fn new(runtime: &Runtime, transport: Arc<dyn Transport>) -> Self {
        let inner = Arc::new(ClientInner {
            runtime: runtime.clone(),
            transport,
            options: Mutex::new(ClientOptions::default()),
            state: Mutex::new(ClientState::default()),
            on_connect: Broadcaster::new(),
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.set_on_connect(Arc::new(move || {
            post(&weak, |inner| inner.handle_connect());
        }));

        let weak = Arc::downgrade(&inner);
        inner.transport.set_on_disconnect(Arc::new(move || {
            post(&weak, |inner| inner.handle_disconnect());
        }));

        let weak = Arc::downgrade(&inner);
        inner
            .transport
            .set_on_message(Arc::new(move |topic: &str, payload: Payload| {
                let topic = topic.to_string();
                post(&weak, move |inner| inner.dispatch(&topic, &payload));
            }));

        Self { inner }
    }

    /// Create with the connection and device settings of `config`
    ///
    /// `runtime` is usually [`LumenConfig::build_runtime`] of the same config.
    pub fn from_config(
        runtime: &Runtime,
        transport: Arc<dyn Transport>,
        config: &LumenConfig,
    ) -> Self {
        Self::new(runtime, transport).with_options(config.client_options())
    }

    pub fn with_options(self, options: ClientOptions) -> Self {
        *self.inner.options.lock() = options;
        self
    }

    pub fn with_connect_options(self, connect: ConnectOptions) -> Self {
        self.inner.options.lock().connect = connect;
        self
    }

    /// Do not query queryable parameters when the connection comes up
    pub fn skip_initial_query(self, skip: bool) -> Self {
        self.inner.options.lock().skip_initial_query = skip;
        self
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Listeners notified on the loop thread after devices are set up for a
    /// new connection
    pub fn on_connect(&self) -> &Broadcaster {
        &self.inner.on_connect
    }

    /// Register a device; its messages are routed by [`Device::topic`]
    pub fn add_device(&self, device: Device) -> Device {
        let connected = {
            let mut state = self.inner.state.lock();
            state.by_topic.insert(device.topic().to_string(), device.clone());
            state.devices.push(device.clone());
            state.connected
        };

        if connected {
            self.inner.attach(&device);
        }

        device
    }

    /// Build and register a device from a parsed schema entry
    pub fn add_definition(&self, definition: &DeviceDefinition) -> Device {
        let device = {
            let options = self.inner.options.lock();
            DeviceBuilder::from_definition(definition)
                .with_base_topic(options.base_topic.clone())
                .with_report_delay_tolerance(options.report_delay_tolerance)
                .with_synchronous_listeners(options.synchronous_listeners)
                .build(&self.inner.runtime)
        };

        self.add_device(device)
    }

    /// Look up a device by friendly name
    pub fn device(&self, name: &str) -> Option<Device> {
        self.inner
            .state
            .lock()
            .devices
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.inner.state.lock().devices.clone()
    }

    /// Connect, run the loop on this thread until it is stopped, disconnect
    pub fn loop_forever(&self) -> ClientResult<()> {
        let connect = self.inner.options.lock().connect.clone();
        info!("Connecting to {}:{}", connect.host, connect.port);

        self.inner.transport.connect(&connect)?;
        self.inner.transport.start()?;

        let result = self.inner.runtime.run();

        match self.inner.transport.disconnect() {
            Ok(()) => info!("Disconnected"),
            Err(err) => warn!("Failed to disconnect: {}", err),
        }

        result?;
        Ok(())
    }
}

/// Run `f` on the loop thread if the client is still alive
fn post(weak: &Weak<ClientInner>, f: impl FnOnce(&ClientInner) + Send + 'static) {
    let Some(inner) = weak.upgrade() else {
        return;
    };

    let runtime = inner.runtime.clone();
    let weak = weak.clone();
    runtime.post(move || {
        if let Some(inner) = weak.upgrade() {
            f(&inner);
        }
    });
}

impl ClientInner {
    fn attach(&self, device: &Device) {
        if let Err(err) = self.transport.subscribe(device.topic()) {
            warn!("Failed to subscribe to {}: {}", device.topic(), err);
        }

        device.set_publisher(Some(self.transport.clone()));

        if !self.options.lock().skip_initial_query {
            device.query_all();
        }
    }

    fn handle_connect(&self) {
        let devices = {
            let mut state = self.state.lock();
            state.connected = true;
            state.devices.clone()
        };

        info!("Connected, attaching {} devices", devices.len());

        for device in &devices {
            self.attach(device);
        }

        self.on_connect.call_listeners(&());
    }

    fn handle_disconnect(&self) {
        let devices = {
            let mut state = self.state.lock();
            state.connected = false;
            state.devices.clone()
        };

        warn!("Connection lost");

        for device in &devices {
            device.set_publisher(None);
        }
    }

    fn dispatch(&self, topic: &str, payload: &Payload) {
        let device = self.state.lock().by_topic.get(topic).cloned();

        match device {
            Some(device) => device.on_message(payload),
            None => trace!("No device for topic {}", topic),
        }
    }
}

impl std::fmt::Debug for DevicesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("DevicesClient")
            .field("devices", &state.devices.len())
            .field("connected", &state.connected)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Direction, MessageEvent, PlaybackTransport};
    use crate::transport::{ConnectionCallback, MemoryTransport, MessageCallback, TransportResult};
    use lumen_runtime::Timer;
    use lumen_types::{ParameterDefinition, ParameterKind};
    use serde_json::{Value, json};

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn lamp(runtime: &Runtime) -> Device {
        DeviceBuilder::new("lamp")
            .toggle("state")
            .numeric("brightness", 0.0, 255.0)
            .build(runtime)
    }

    fn at(runtime: &Runtime, delay: Duration, action: impl Fn() + Send + Sync + 'static) {
        let timer = runtime.timer(move |timer: &Timer| {
            timer.stop();
            action();
        });
        timer.start(delay);
    }

    #[test]
    fn test_connect_subscribes_queries_and_notifies() {
        let runtime = Runtime::new_virtual();
        let transport = MemoryTransport::new();
        let client = DevicesClient::new(&runtime, Arc::new(transport.clone()))
            .with_connect_options(ConnectOptions {
                port: 1884,
                ..ConnectOptions::default()
            });
        client.add_device(lamp(&runtime));

        let connects = Arc::new(Mutex::new(0));
        let c = connects.clone();
        let _ = client.on_connect().add_listener(move |_| *c.lock() += 1);

        let rt = runtime.clone();
        at(&runtime, Duration::from_secs(1), move || rt.stop());
        client.loop_forever().unwrap();

        assert_eq!(*connects.lock(), 1);
        assert_eq!(transport.subscriptions(), vec!["zigbee2mqtt/lamp".to_string()]);
        assert_eq!(transport.connect_options().unwrap().port, 1884);
        assert_eq!(
            transport.published_to("zigbee2mqtt/lamp/get"),
            vec![payload(json!({"state": "", "brightness": ""}))]
        );
    }

    #[test]
    fn test_skip_initial_query() {
        let runtime = Runtime::new_virtual();
        let transport = MemoryTransport::new();
        let client =
            DevicesClient::new(&runtime, Arc::new(transport.clone())).skip_initial_query(true);
        client.add_device(lamp(&runtime));

        let rt = runtime.clone();
        at(&runtime, Duration::from_secs(1), move || rt.stop());
        client.loop_forever().unwrap();

        assert!(transport.published().is_empty());
    }

    #[test]
    fn test_messages_are_routed_by_topic() {
        let runtime = Runtime::new_virtual();
        let transport = MemoryTransport::new();
        let client =
            DevicesClient::new(&runtime, Arc::new(transport.clone())).skip_initial_query(true);
        let device = client.add_device(lamp(&runtime));

        let t = transport.clone();
        at(&runtime, Duration::from_millis(100), move || {
            t.inject_message("zigbee2mqtt/lamp", payload(json!({"brightness": 17})));
            t.inject_message("zigbee2mqtt/other", payload(json!({"brightness": 99})));
        });

        let rt = runtime.clone();
        at(&runtime, Duration::from_secs(1), move || rt.stop());
        client.loop_forever().unwrap();

        assert_eq!(device.parameter("brightness").unwrap().get(), 17.0);
        assert_eq!(client.device("lamp").unwrap().topic(), "zigbee2mqtt/lamp");
        assert!(client.device("other").is_none());
    }

    #[test]
    fn test_disconnect_holds_publish_until_reconnect() {
        let runtime = Runtime::new_virtual();
        let transport = MemoryTransport::new();
        let client =
            DevicesClient::new(&runtime, Arc::new(transport.clone())).skip_initial_query(true);
        let device = client.add_device(lamp(&runtime));

        let t = transport.clone();
        let d = device.clone();
        at(&runtime, Duration::from_millis(100), move || {
            t.inject_disconnect();
            d.parameter("brightness").unwrap().set(64.0).unwrap();
        });

        let t = transport.clone();
        at(&runtime, Duration::from_millis(900), move || t.inject_connect());

        let rt = runtime.clone();
        at(&runtime, Duration::from_secs(2), move || rt.stop());
        client.loop_forever().unwrap();

        assert_eq!(
            transport.published_to("zigbee2mqtt/lamp/set"),
            vec![payload(json!({"brightness": 64}))]
        );
    }

    #[test]
    fn test_automation_against_recorded_session() {
        let runtime = Runtime::new_virtual();
        let log = vec![
            MessageEvent::new(
                Direction::Sync,
                0.0,
                "zigbee2mqtt/lamp/get",
                payload(json!({"state": "", "brightness": ""})),
            ),
            MessageEvent::new(
                Direction::Received,
                0.5,
                "zigbee2mqtt/lamp",
                payload(json!({"state": "OFF", "brightness": 10})),
            ),
            MessageEvent::new(
                Direction::Received,
                2.0,
                "zigbee2mqtt/lamp",
                payload(json!({"state": "ON"})),
            ),
            MessageEvent::new(
                Direction::Sent,
                2.0,
                "zigbee2mqtt/lamp/set",
                payload(json!({"brightness": 200})),
            ),
        ];

        let playback = PlaybackTransport::new(&runtime, log);
        let client = DevicesClient::new(&runtime, Arc::new(playback.clone()));
        let device = client.add_device(lamp(&runtime));

        let brightness = device.parameter("brightness").unwrap().clone();
        let _ = device
            .parameter("state")
            .unwrap()
            .add_listener(move |state| {
                if state.get() == 1.0 {
                    brightness.set(200.0).unwrap();
                }
            });

        client.loop_forever().unwrap();

        assert!(playback.playback_success(), "{}", playback.report());
        assert_eq!(playback.subscriptions(), vec!["zigbee2mqtt/lamp".to_string()]);
    }

    /// Memory transport whose disconnect always fails
    struct StuckTransport(MemoryTransport);

    impl Transport for StuckTransport {
        fn connect(&self, options: &ConnectOptions) -> TransportResult<()> {
            self.0.connect(options)
        }

        fn subscribe(&self, topic: &str) -> TransportResult<()> {
            self.0.subscribe(topic)
        }

        fn publish(&self, topic: &str, payload: &Payload) -> TransportResult<()> {
            self.0.publish(topic, payload)
        }

        fn set_on_connect(&self, callback: ConnectionCallback) {
            self.0.set_on_connect(callback)
        }

        fn set_on_disconnect(&self, callback: ConnectionCallback) {
            self.0.set_on_disconnect(callback)
        }

        fn set_on_message(&self, callback: MessageCallback) {
            self.0.set_on_message(callback)
        }

        fn start(&self) -> TransportResult<()> {
            self.0.start()
        }

        fn disconnect(&self) -> TransportResult<()> {
            Err(TransportError::Rejected("stuck".to_string()))
        }
    }

    #[test]
    fn test_failed_disconnect_keeps_run_result() {
        let runtime = Runtime::new_virtual();
        let transport = StuckTransport(MemoryTransport::new());
        let client = DevicesClient::new(&runtime, Arc::new(transport)).skip_initial_query(true);

        // A nested run fails; the disconnect failure after it must not hide that
        let nested = Arc::new(Mutex::new(None));
        let n = nested.clone();
        let c = client.clone();
        at(&runtime, Duration::from_millis(100), move || {
            *n.lock() = Some(c.loop_forever());
        });

        let rt = runtime.clone();
        at(&runtime, Duration::from_secs(1), move || rt.stop());

        assert!(client.loop_forever().is_ok());
        assert!(matches!(
            nested.lock().take(),
            Some(Err(ClientError::Runtime(RuntimeError::AlreadyRunning)))
        ));
    }

    #[test]
    fn test_from_config_applies_settings() {
        let mut config = LumenConfig::default();
        config.transport.port = 1999;
        config.transport.base_topic = "lights".to_string();
        config.runtime.virtual_time = true;
        config.runtime.skip_initial_query = true;

        let runtime = config.build_runtime();
        assert!(runtime.time_source().as_virtual().is_some());

        let transport = MemoryTransport::new();
        let client = DevicesClient::from_config(&runtime, Arc::new(transport.clone()), &config);
        let device = client.add_definition(&DeviceDefinition {
            friendly_name: "desk".to_string(),
            model_id: String::new(),
            description: String::new(),
            vendor: String::new(),
            parameters: vec![ParameterDefinition::new(
                "brightness",
                ParameterKind::Numeric { min: 0.0, max: 254.0 },
            )],
        });
        assert_eq!(device.topic(), "lights/desk");

        let rt = runtime.clone();
        at(&runtime, Duration::from_secs(1), move || rt.stop());
        client.loop_forever().unwrap();

        assert_eq!(transport.connect_options().unwrap().port, 1999);
        assert_eq!(transport.subscriptions(), vec!["lights/desk".to_string()]);
        assert!(transport.published().is_empty());
    }
}
