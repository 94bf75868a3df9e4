//! Lumen Types - Device descriptions shared by the runtime and the tooling
//!
//! Parses the device list that zigbee2mqtt publishes on `bridge/devices` into
//! [`DeviceDefinition`]s: one entry per device with the parameters it exposes,
//! their value kind and their access flags.

mod access;
mod definition;
mod error;
mod kind;

pub use access::*;
pub use definition::*;
pub use error::*;
pub use kind::*;
