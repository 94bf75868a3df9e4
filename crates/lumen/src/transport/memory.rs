//! In-process transport
//!
//! Keeps everything in memory: publishes are recorded, and the owner injects
//! connection changes and inbound messages, from any thread.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{
    ConnectOptions, ConnectionCallback, MessageCallback, Payload, Transport, TransportError,
    TransportResult,
};

#[derive(Default)]
struct Callbacks {
    on_connect: Option<ConnectionCallback>,
    on_disconnect: Option<ConnectionCallback>,
    on_message: Option<MessageCallback>,
}

#[derive(Default)]
struct MemoryState {
    options: Option<ConnectOptions>,
    connected: bool,
    closed: bool,
    subscriptions: Vec<String>,
    published: Vec<(String, Payload)>,
    failures: usize,
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    callbacks: Mutex<Callbacks>,
    connect_on_start: bool,
}

/// Transport that never leaves the process.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl MemoryTransport {
    /// Transport that reports a connection as soon as it is started
    pub fn new() -> Self {
        Self::with_connect_on_start(true)
    }

    /// Transport that stays disconnected until [`MemoryTransport::inject_connect`]
    pub fn disconnected() -> Self {
        Self::with_connect_on_start(false)
    }

    fn with_connect_on_start(connect_on_start: bool) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState::default()),
                callbacks: Mutex::new(Callbacks::default()),
                connect_on_start,
            }),
        }
    }

    /// Mark the transport connected and fire the connect callback
    pub fn inject_connect(&self) {
        self.inner.state.lock().connected = true;

        let callback = self.inner.callbacks.lock().on_connect.clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Mark the transport disconnected and fire the disconnect callback
    pub fn inject_disconnect(&self) {
        self.inner.state.lock().connected = false;

        let callback = self.inner.callbacks.lock().on_disconnect.clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Deliver an inbound message
    pub fn inject_message(&self, topic: &str, payload: Payload) {
        let callback = self.inner.callbacks.lock().on_message.clone();
        if let Some(callback) = callback {
            callback(topic, payload);
        }
    }

    /// Make the next `count` publishes fail
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.state.lock().failures = count;
    }

    /// Every successful publish so far
    pub fn published(&self) -> Vec<(String, Payload)> {
        self.inner.state.lock().published.clone()
    }

    /// Successful publishes to one topic
    pub fn published_to(&self, topic: &str) -> Vec<Payload> {
        self.inner
            .state
            .lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Drain the publish record
    pub fn take_published(&self) -> Vec<(String, Payload)> {
        std::mem::take(&mut self.inner.state.lock().published)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.state.lock().subscriptions.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    /// Options passed to the last [`Transport::connect`]
    pub fn connect_options(&self) -> Option<ConnectOptions> {
        self.inner.state.lock().options.clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, options: &ConnectOptions) -> TransportResult<()> {
        let mut state = self.inner.state.lock();
        state.options = Some(options.clone());
        state.closed = false;
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> TransportResult<()> {
        let mut state = self.inner.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }

        if !state.subscriptions.iter().any(|t| t == topic) {
            state.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &Payload) -> TransportResult<()> {
        let mut state = self.inner.state.lock();

        if state.closed {
            return Err(TransportError::Closed);
        }

        if !state.connected {
            return Err(TransportError::NotConnected);
        }

        if state.failures > 0 {
            state.failures -= 1;
            return Err(TransportError::Rejected("injected failure".to_string()));
        }

        debug!("Publish to {} ({} fields)", topic, payload.len());
        state.published.push((topic.to_string(), payload.clone()));
        Ok(())
    }

    fn set_on_connect(&self, callback: ConnectionCallback) {
        self.inner.callbacks.lock().on_connect = Some(callback);
    }

    fn set_on_disconnect(&self, callback: ConnectionCallback) {
        self.inner.callbacks.lock().on_disconnect = Some(callback);
    }

    fn set_on_message(&self, callback: MessageCallback) {
        self.inner.callbacks.lock().on_message = Some(callback);
    }

    fn start(&self) -> TransportResult<()> {
        if self.inner.connect_on_start {
            self.inject_connect();
        }
        Ok(())
    }

    fn disconnect(&self) -> TransportResult<()> {
        let mut state = self.inner.state.lock();
        state.connected = false;
        state.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_publish_requires_connection() {
        let transport = MemoryTransport::disconnected();
        transport.start().unwrap();

        let result = transport.publish("zigbee2mqtt/lamp/set", &payload(json!({"state": "ON"})));
        assert!(matches!(result, Err(TransportError::NotConnected)));

        transport.inject_connect();
        transport
            .publish("zigbee2mqtt/lamp/set", &payload(json!({"state": "ON"})))
            .unwrap();

        assert_eq!(transport.published_to("zigbee2mqtt/lamp/set").len(), 1);
    }

    #[test]
    fn test_injected_failures_and_close() {
        let transport = MemoryTransport::new();
        transport.start().unwrap();
        transport.fail_next_publishes(1);

        let body = payload(json!({"brightness": 10}));
        assert!(matches!(
            transport.publish("t", &body),
            Err(TransportError::Rejected(_))
        ));
        transport.publish("t", &body).unwrap();

        transport.disconnect().unwrap();
        assert!(matches!(transport.publish("t", &body), Err(TransportError::Closed)));
        assert_eq!(transport.take_published().len(), 1);
        assert!(transport.published().is_empty());
    }

    #[test]
    fn test_callbacks_fire_from_injection() {
        let transport = MemoryTransport::disconnected();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        transport.set_on_connect(Arc::new(move || s.lock().push("connect".to_string())));
        let s = seen.clone();
        transport.set_on_disconnect(Arc::new(move || s.lock().push("disconnect".to_string())));
        let s = seen.clone();
        transport.set_on_message(Arc::new(move |topic: &str, _: Payload| {
            s.lock().push(topic.to_string())
        }));

        transport.inject_connect();
        transport.inject_message("zigbee2mqtt/lamp", Payload::new());
        transport.inject_disconnect();

        assert_eq!(
            *seen.lock(),
            vec!["connect", "zigbee2mqtt/lamp", "disconnect"]
        );
    }
}
