//! Traffic log events
//!
//! A log is plain text, one block per message:
//!
//! ```text
//!   0.00  RECV  zigbee2mqtt/Kitchen light         {
//!                                                   "brightness": 10
//!                                                 }
//! --------------------------------------------------------------------------------------------------------------
//! ```
//!
//! The payload starts at column 50 or right after the header, whichever is
//! further. Logs are meant to be diffed and edited by hand.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use super::PlaybackError;
use crate::transport::Payload;

/// Column the payload is aligned to
const PAYLOAD_COLUMN: usize = 50;

/// Separator written after every event
pub const EVENT_SEPARATOR_WIDTH: usize = 110;

/// Key or value matching anything in an expected payload
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Delivered to the client
    Received,
    /// Published by the client
    Sent,
    /// Playback waits here until the client publishes a matching message
    Sync,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Received => "RECV",
            Direction::Sent => "SEND",
            Direction::Sync => "SYNC",
        }
    }

    /// Whether an expectation in this direction can be met by an event in `actual`
    fn accepts(self, actual: Direction) -> bool {
        match self {
            Direction::Received => actual == Direction::Received,
            Direction::Sent | Direction::Sync => actual == Direction::Sent,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECV" => Ok(Direction::Received),
            "SEND" => Ok(Direction::Sent),
            "SYNC" => Ok(Direction::Sync),
            _ => Err(()),
        }
    }
}

/// One message in a traffic log
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub direction: Direction,
    /// Seconds since the start of the session
    pub time: f64,
    pub topic: String,
    pub payload: Payload,
}

impl MessageEvent {
    pub fn new(
        direction: Direction,
        time: f64,
        topic: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            direction,
            time,
            topic: topic.into(),
            payload,
        }
    }

    /// Whether `actual` meets this event taken as an expectation
    ///
    /// Topics must be equal, the directions compatible and `actual` must not
    /// happen earlier than expected. In the payload, a `"*"` value matches
    /// any value and a `"*"` key admits keys not listed here. Nested objects
    /// are matched the same way.
    pub fn satisfied_by(&self, actual: &MessageEvent) -> bool {
        self.topic == actual.topic
            && self.direction.accepts(actual.direction)
            && self.time <= actual.time
            && payload_satisfied_by(&self.payload, &actual.payload)
    }
}

fn payload_satisfied_by(expected: &Payload, actual: &Payload) -> bool {
    if expected.contains_key(WILDCARD) {
        if !expected
            .keys()
            .filter(|key| *key != WILDCARD)
            .all(|key| actual.contains_key(key))
        {
            return false;
        }
    } else if expected.len() != actual.len() || !expected.keys().all(|k| actual.contains_key(k)) {
        return false;
    }

    expected
        .iter()
        .filter(|(key, _)| *key != WILDCARD)
        .all(|(key, value)| match (value, actual.get(key)) {
            (Value::String(s), _) if s == WILDCARD => true,
            (Value::Object(nested), Some(Value::Object(other))) => {
                payload_satisfied_by(nested, other)
            }
            (Value::Object(_), _) => false,
            (value, Some(other)) => value == other,
            (_, None) => false,
        })
}

impl fmt::Display for MessageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = format!("{:>6.2}  {}  {}  ", self.time, self.direction, self.topic);
        let indent = header.len().max(PAYLOAD_COLUMN);

        let body = serde_json::to_string_pretty(&self.payload).map_err(|_| fmt::Error)?;
        let continuation = format!("\n{}", " ".repeat(indent));

        write!(
            f,
            "{}{}{}",
            header,
            " ".repeat(indent - header.len()),
            body.lines().collect::<Vec<_>>().join(&continuation)
        )
    }
}

/// Render events in log form
pub fn format_log(events: &[MessageEvent]) -> String {
    let separator = "-".repeat(EVENT_SEPARATOR_WIDTH);
    let mut out = String::new();

    for event in events {
        out.push_str(&event.to_string());
        out.push('\n');
        out.push_str(&separator);
        out.push('\n');
    }

    out
}

/// Read events back from log form
pub fn parse_log(text: &str) -> Result<Vec<MessageEvent>, PlaybackError> {
    let mut events = Vec::new();
    let mut lines = text.lines().enumerate();

    while let Some((index, line)) = lines.next() {
        let line_number = index + 1;
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.chars().all(|c| c == '-') {
            continue;
        }

        let (direction, time, topic, mut body) = parse_header(trimmed, line_number)?;
        let mut depth = brace_depth(&body);

        while depth > 0 {
            let Some((_, next)) = lines.next() else {
                return Err(PlaybackError::UnterminatedPayload { line: line_number });
            };
            body.push('\n');
            body.push_str(next.trim());
            depth += brace_depth(next);
        }

        let payload = match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(PlaybackError::NotAnObject { line: line_number }),
            Err(source) => {
                return Err(PlaybackError::InvalidPayload {
                    line: line_number,
                    source,
                });
            }
        };

        events.push(MessageEvent::new(direction, time, topic, payload));
    }

    Ok(events)
}

fn parse_header(
    line: &str,
    line_number: usize,
) -> Result<(Direction, f64, String, String), PlaybackError> {
    let invalid = || PlaybackError::InvalidHeader {
        line: line_number,
        text: line.to_string(),
    };

    let (time, rest) = line.split_once(char::is_whitespace).ok_or_else(invalid)?;
    let time: f64 = time.parse().map_err(|_| invalid())?;

    let rest = rest.trim_start();
    let (direction, rest) = rest.split_once(char::is_whitespace).ok_or_else(invalid)?;
    let direction: Direction = direction.parse().map_err(|_| invalid())?;

    let brace = rest.find('{').ok_or_else(invalid)?;
    let topic = rest[..brace].trim();
    if topic.is_empty() {
        return Err(invalid());
    }

    Ok((direction, time, topic.to_string(), rest[brace..].to_string()))
}

/// Net count of `{` minus `}` outside of JSON strings
fn brace_depth(text: &str) -> i64 {
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
    }

    depth
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
