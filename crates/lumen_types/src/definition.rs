//! Device definitions
//!
//! zigbee2mqtt describes every paired device in `bridge/devices`. Each entry
//! carries a `definition.exposes` list; composite exposes such as `light` or
//! `switch` nest their settable features under `features`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::access::Access;
use crate::error::{SchemaError, SchemaResult};
use crate::kind::{ParameterKind, TOGGLE_OFF, TOGGLE_ON};

// ─────────────────────────────────────────────────────────────────────────────
// Definitions
// ─────────────────────────────────────────────────────────────────────────────

/// One exposed property of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    /// Key used in the device's JSON payloads
    pub property: String,
    pub access: Access,
    #[serde(flatten)]
    pub kind: ParameterKind,
}

impl ParameterDefinition {
    pub fn new(property: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            property: property.into(),
            access: Access::ALL,
            kind,
        }
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }
}

impl fmt::Display for ParameterDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ParameterKind::Numeric { min, max } => {
                write!(f, "{} numeric [{}, {}]", self.property, min, max)?
            }
            ParameterKind::Enum { values } => {
                write!(f, "{} enum {:?}", self.property, values)?
            }
            kind => write!(f, "{} {}", self.property, kind.name())?,
        }

        if self.access.is_queryable() {
            write!(f, " /get")?;
        }

        if self.access.is_settable() {
            write!(f, " /set")?;
        }

        Ok(())
    }
}

/// A device and the parameters it exposes, sorted by property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    pub friendly_name: String,
    pub model_id: String,
    pub description: String,
    pub vendor: String,
    pub parameters: Vec<ParameterDefinition>,
}

impl DeviceDefinition {
    /// Parameter registered for `property`
    pub fn parameter(&self, property: &str) -> Option<&ParameterDefinition> {
        self.parameters.iter().find(|p| p.property == property)
    }
}

impl fmt::Display for DeviceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.friendly_name)?;

        if !self.vendor.is_empty() || !self.model_id.is_empty() {
            write!(f, " ({} {})", self.vendor, self.model_id)?;
        }

        for parameter in &self.parameters {
            write!(f, "\n  {}", parameter)?;
        }

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct BridgeDevice {
    friendly_name: String,
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    definition: Option<BridgeDefinition>,
}

#[derive(Deserialize)]
struct BridgeDefinition {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    exposes: Vec<Value>,
}

#[derive(Deserialize)]
struct Feature {
    #[serde(rename = "type", default)]
    feature_type: Option<String>,
    #[serde(default)]
    property: Option<String>,
    #[serde(default)]
    access: Option<u8>,
    #[serde(default)]
    value_min: Option<f64>,
    #[serde(default)]
    value_max: Option<f64>,
    #[serde(default)]
    value_on: Option<Value>,
    #[serde(default)]
    value_off: Option<Value>,
    #[serde(default)]
    values: Option<Vec<String>>,
    #[serde(default)]
    features: Option<Vec<Value>>,
}

impl Feature {
    fn kind(&self) -> Option<ParameterKind> {
        let on = self.value_on.as_ref();
        let off = self.value_off.as_ref();

        if on.and_then(Value::as_str) == Some(TOGGLE_ON)
            && off.and_then(Value::as_str) == Some(TOGGLE_OFF)
        {
            return Some(ParameterKind::Toggle);
        }

        match self.feature_type.as_deref()? {
            "binary" if on.is_some_and(Value::is_boolean) && off.is_some_and(Value::is_boolean) => {
                Some(ParameterKind::Binary)
            }
            "numeric" => match (self.value_min, self.value_max) {
                (Some(min), Some(max)) => Some(ParameterKind::Numeric { min, max }),
                _ => Some(ParameterKind::unbounded()),
            },
            "enum" => {
                let mut values = self.values.clone()?;
                values.sort();
                Some(ParameterKind::Enum { values })
            }
            _ => None,
        }
    }
}

/// Collect parameters from an `exposes` list, descending into composites.
fn collect_parameters(exposes: &[Value], out: &mut Vec<ParameterDefinition>) {
    for item in exposes {
        let feature: Feature = match serde_json::from_value(item.clone()) {
            Ok(feature) => feature,
            Err(e) => {
                debug!("Skipping unreadable feature: {}", e);
                continue;
            }
        };

        if let Some(features) = &feature.features {
            collect_parameters(features, out);
            continue;
        }

        let Some(property) = feature.property.clone() else {
            continue;
        };

        match feature.kind() {
            Some(kind) => out.push(ParameterDefinition {
                property,
                access: Access::from(feature.access.unwrap_or(Access::PUBLISHED.bits())),
                kind,
            }),
            None => debug!("Skipping feature {} of unsupported type", property),
        }
    }
}

/// Parse one entry of `bridge/devices`
///
/// Returns `Ok(None)` for entries without a definition, such as the
/// coordinator.
pub fn parse_bridge_device(entry: &Value) -> Result<Option<DeviceDefinition>, serde_json::Error> {
    let device: BridgeDevice = serde_json::from_value(entry.clone())?;

    let Some(definition) = device.definition else {
        debug!("Skipping {}: no definition", device.friendly_name);
        return Ok(None);
    };

    let mut parameters = Vec::new();
    collect_parameters(&definition.exposes, &mut parameters);
    parameters.sort_by(|a, b| a.property.cmp(&b.property));

    Ok(Some(DeviceDefinition {
        friendly_name: device.friendly_name,
        model_id: device.model_id.unwrap_or_default(),
        description: definition.description.unwrap_or_default(),
        vendor: definition.vendor.unwrap_or_default(),
        parameters,
    }))
}

/// Parse the full `bridge/devices` payload
pub fn parse_bridge_devices(json: &str) -> SchemaResult<Vec<DeviceDefinition>> {
    let value: Value = serde_json::from_str(json)?;
    let Value::Array(entries) = value else {
        return Err(SchemaError::NotAnArray);
    };

    let mut devices = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        match parse_bridge_device(entry) {
            Ok(Some(device)) => devices.push(device),
            Ok(None) => {}
            Err(source) => return Err(SchemaError::InvalidDevice { index, source }),
        }
    }

    Ok(devices)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bridge_devices() -> Value {
        json!([
            {
                "friendly_name": "Coordinator",
                "type": "Coordinator",
                "definition": null
            },
            {
                "friendly_name": "Kitchen light",
                "model_id": "LCA001",
                "definition": {
                    "description": "Hue white and color ambiance E26/E27",
                    "vendor": "Philips",
                    "exposes": [
                        {
                            "type": "light",
                            "features": [
                                {
                                    "type": "binary",
                                    "property": "state",
                                    "access": 7,
                                    "value_on": "ON",
                                    "value_off": "OFF",
                                    "value_toggle": "TOGGLE"
                                },
                                {
                                    "type": "numeric",
                                    "property": "brightness",
                                    "access": 7,
                                    "value_min": 0,
                                    "value_max": 254
                                },
                                {
                                    "type": "composite",
                                    "property": "color",
                                    "features": [
                                        { "type": "numeric", "property": "x", "access": 7 }
                                    ]
                                }
                            ]
                        },
                        {
                            "type": "enum",
                            "property": "effect",
                            "access": 2,
                            "values": ["stop_effect", "blink", "okay"]
                        },
                        {
                            "type": "numeric",
                            "property": "linkquality",
                            "access": 1,
                            "value_min": 0,
                            "value_max": 255
                        }
                    ]
                }
            },
            {
                "friendly_name": "Hallway sensor",
                "model_id": "SNZB-03",
                "definition": {
                    "description": "Motion sensor",
                    "vendor": "SONOFF",
                    "exposes": [
                        {
                            "type": "binary",
                            "property": "occupancy",
                            "access": 1,
                            "value_on": true,
                            "value_off": false
                        },
                        { "type": "text", "property": "action", "access": 1 }
                    ]
                }
            }
        ])
    }

    #[test]
    fn test_parse_skips_devices_without_definition() {
        let devices = parse_bridge_devices(&bridge_devices().to_string()).unwrap();

        let names: Vec<_> = devices.iter().map(|d| d.friendly_name.as_str()).collect();
        assert_eq!(names, vec!["Kitchen light", "Hallway sensor"]);
    }

    #[test]
    fn test_parse_light_features() {
        let devices = parse_bridge_devices(&bridge_devices().to_string()).unwrap();
        let light = &devices[0];

        assert_eq!(light.vendor, "Philips");
        assert_eq!(light.model_id, "LCA001");

        let properties: Vec<_> = light.parameters.iter().map(|p| p.property.as_str()).collect();
        assert_eq!(properties, vec!["brightness", "effect", "linkquality", "state", "x"]);

        assert_eq!(light.parameter("state").unwrap().kind, ParameterKind::Toggle);
        assert_eq!(
            light.parameter("brightness").unwrap().kind,
            ParameterKind::Numeric { min: 0.0, max: 254.0 }
        );
        assert_eq!(light.parameter("x").unwrap().kind, ParameterKind::unbounded());

        let effect = light.parameter("effect").unwrap();
        assert_eq!(
            effect.kind,
            ParameterKind::Enum {
                values: vec!["blink".into(), "okay".into(), "stop_effect".into()]
            }
        );
        assert!(effect.access.is_settable());
        assert!(!effect.access.is_queryable());
    }

    #[test]
    fn test_parse_binary_and_skips_unsupported() {
        let devices = parse_bridge_devices(&bridge_devices().to_string()).unwrap();
        let sensor = &devices[1];

        assert_eq!(sensor.parameters.len(), 1);
        assert_eq!(sensor.parameters[0].kind, ParameterKind::Binary);
        assert_eq!(sensor.parameters[0].access, Access::PUBLISHED);
    }

    #[test]
    fn test_display_marks_capabilities() {
        let devices = parse_bridge_devices(&bridge_devices().to_string()).unwrap();
        let text = devices[0].to_string();

        assert!(text.starts_with("Kitchen light (Philips LCA001)"));
        assert!(text.contains("\n  brightness numeric [0, 254] /get /set"));
        assert!(text.contains("\n  linkquality numeric [0, 255]\n"));
        assert!(text.contains("\n  effect enum [\"blink\", \"okay\", \"stop_effect\"] /set"));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            parse_bridge_devices("{\"not\": \"a list\"}"),
            Err(SchemaError::NotAnArray)
        ));
        assert!(matches!(parse_bridge_devices("[1, "), Err(SchemaError::Json(_))));
        assert!(matches!(
            parse_bridge_devices("[{\"definition\": null}]"),
            Err(SchemaError::InvalidDevice { index: 0, .. })
        ));
    }
}
