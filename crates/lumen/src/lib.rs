//! Lumen - zigbee2mqtt automation core
//!
//! This crate provides the device-facing half of Lumen:
//! - Parameters that reconcile locally requested and device-reported values
//! - Devices that batch outbound changes into one publish per loop turn
//! - A client routing transport traffic into the message loop
//! - Record and playback of transport traffic for tests
//! - Configuration and scripted automation helpers
//! - Scales mapping one control onto several lights

// Re-export core crates
pub use lumen_runtime;
pub use lumen_types;

// Parameter state machine
pub mod parameter;

// Devices and their builder
pub mod device;

// Transport trait and in-process implementations
pub mod transport;

// Client tying devices to a transport
pub mod client;

// Scripted automation
pub mod runner;

// Spreading one control over several parameters
pub mod scale;

// Configuration (lumen.toml)
pub mod config;

// Traffic logs and playback
pub mod testing;

pub use client::{ClientError, ClientOptions, ClientResult, DevicesClient};
pub use config::{ConfigError, LumenConfig};
pub use device::{Device, DeviceBuilder};
pub use parameter::{Parameter, ParameterError, ParameterResult};
pub use runner::{TimedRunner, run_then_exit};
pub use scale::{Barriers, DimmableLight, ScaleMapper, Scalable};
pub use transport::{Payload, Transport, TransportError};
