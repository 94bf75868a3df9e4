//! Value kinds
//!
//! Every parameter holds a number internally. The kind decides the bounds and
//! how that number maps to and from the JSON value on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire value for a switched-on toggle
pub const TOGGLE_ON: &str = "ON";

/// Wire value for a switched-off toggle
pub const TOGGLE_OFF: &str = "OFF";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ParameterKind {
    /// Plain number within `[min, max]`
    Numeric { min: f64, max: f64 },
    /// JSON `true`/`false`, held as 1/0
    Binary,
    /// `"ON"`/`"OFF"`, held as 1/0
    Toggle,
    /// One of a list of strings, held as the index into the list
    Enum { values: Vec<String> },
}

impl ParameterKind {
    /// Numeric kind without limits
    pub fn unbounded() -> Self {
        ParameterKind::Numeric {
            min: -f64::MAX,
            max: f64::MAX,
        }
    }

    /// Inclusive bounds of the internal value
    pub fn bounds(&self) -> (f64, f64) {
        match self {
            ParameterKind::Numeric { min, max } => (*min, *max),
            ParameterKind::Binary | ParameterKind::Toggle => (0.0, 1.0),
            ParameterKind::Enum { values } => (0.0, values.len().saturating_sub(1) as f64),
        }
    }

    /// Width of the bounds, if finite
    ///
    /// An [`unbounded`](Self::unbounded) kind has no usable span: `max - min`
    /// overflows.
    pub fn span(&self) -> Option<f64> {
        let (min, max) = self.bounds();
        let span = max - min;
        span.is_finite().then_some(span)
    }

    /// Convert a wire value to the internal number
    ///
    /// Returns `None` when the value does not fit this kind.
    pub fn from_wire(&self, value: &Value) -> Option<f64> {
        match self {
            ParameterKind::Numeric { .. } => value.as_f64(),
            ParameterKind::Binary => value.as_bool().map(|on| if on { 1.0 } else { 0.0 }),
            ParameterKind::Toggle => match value.as_str()? {
                TOGGLE_ON => Some(1.0),
                TOGGLE_OFF => Some(0.0),
                _ => None,
            },
            ParameterKind::Enum { values } => {
                let name = value.as_str()?;
                values.iter().position(|v| v == name).map(|i| i as f64)
            }
        }
    }

    /// Convert an internal number to its wire value
    pub fn to_wire(&self, value: f64) -> Value {
        match self {
            ParameterKind::Numeric { .. } => number(value),
            ParameterKind::Binary => Value::Bool(value == 1.0),
            ParameterKind::Toggle => {
                Value::from(if value == 1.0 { TOGGLE_ON } else { TOGGLE_OFF })
            }
            ParameterKind::Enum { values } => values
                .get(value as usize)
                .map(|name| Value::from(name.as_str()))
                .unwrap_or(Value::Null),
        }
    }

    /// Short name used in listings
    pub fn name(&self) -> &'static str {
        match self {
            ParameterKind::Numeric { .. } => "numeric",
            ParameterKind::Binary => "binary",
            ParameterKind::Toggle => "toggle",
            ParameterKind::Enum { .. } => "enum",
        }
    }
}

/// Integral values go out as JSON integers, the rest as floats.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bounds() {
        assert_eq!(
            ParameterKind::Numeric { min: 0.0, max: 254.0 }.bounds(),
            (0.0, 254.0)
        );
        assert_eq!(ParameterKind::Toggle.bounds(), (0.0, 1.0));

        let effects = ParameterKind::Enum {
            values: vec!["blink".into(), "breathe".into(), "okay".into()],
        };
        assert_eq!(effects.bounds(), (0.0, 2.0));
    }

    #[test]
    fn test_span() {
        assert_eq!(
            ParameterKind::Numeric { min: 153.0, max: 500.0 }.span(),
            Some(347.0)
        );
        assert_eq!(ParameterKind::Binary.span(), Some(1.0));
        assert_eq!(ParameterKind::unbounded().span(), None);
    }

    #[test]
    fn test_wire_conversion() {
        assert_eq!(ParameterKind::Toggle.from_wire(&json!("ON")), Some(1.0));
        assert_eq!(ParameterKind::Toggle.from_wire(&json!("TOGGLE")), None);
        assert_eq!(ParameterKind::Toggle.to_wire(0.0), json!("OFF"));

        assert_eq!(ParameterKind::Binary.from_wire(&json!(true)), Some(1.0));
        assert_eq!(ParameterKind::Binary.from_wire(&json!("true")), None);
        assert_eq!(ParameterKind::Binary.to_wire(1.0), json!(true));

        let numeric = ParameterKind::Numeric { min: 0.0, max: 254.0 };
        assert_eq!(numeric.from_wire(&json!(127)), Some(127.0));
        assert_eq!(numeric.from_wire(&json!("127")), None);
        assert_eq!(numeric.to_wire(127.0), json!(127));
        assert_eq!(numeric.to_wire(0.5), json!(0.5));

        let effects = ParameterKind::Enum {
            values: vec!["blink".into(), "okay".into()],
        };
        assert_eq!(effects.from_wire(&json!("okay")), Some(1.0));
        assert_eq!(effects.from_wire(&json!("nope")), None);
        assert_eq!(effects.to_wire(0.0), json!("blink"));
    }
}
