//! Transport
//!
//! The publish/subscribe connection devices talk through. Implementations call
//! the registered callbacks from whatever thread they like; the client posts
//! everything it receives into the message loop.

mod memory;
mod recording;

pub use memory::MemoryTransport;
pub use recording::RecordingTransport;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

/// JSON object carried by every message
pub type Payload = Map<String, Value>;

/// Called on connect and disconnect
pub type ConnectionCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Called for every inbound message with its topic and payload
pub type MessageCallback = Arc<dyn Fn(&str, Payload) + Send + Sync + 'static>;

/// Errors reported by transports
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Transport is closed")]
    Closed,

    #[error("Broker rejected the request: {0}")]
    Rejected(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Broker connection settings
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub keepalive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            keepalive: Duration::from_secs(60),
            username: None,
            password: None,
        }
    }
}

/// A publish/subscribe client.
pub trait Transport: Send + Sync + 'static {
    /// Prepare the connection; the connect callback fires once it is up
    fn connect(&self, options: &ConnectOptions) -> TransportResult<()>;

    fn subscribe(&self, topic: &str) -> TransportResult<()>;

    fn publish(&self, topic: &str, payload: &Payload) -> TransportResult<()>;

    fn set_on_connect(&self, callback: ConnectionCallback);

    fn set_on_disconnect(&self, callback: ConnectionCallback);

    fn set_on_message(&self, callback: MessageCallback);

    /// Start delivering callbacks
    fn start(&self) -> TransportResult<()>;

    fn disconnect(&self) -> TransportResult<()>;
}
