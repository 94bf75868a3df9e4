//! Recording transport
//!
//! Wraps another transport and logs every message passing through it, so a
//! live session can later be replayed with
//! [`PlaybackTransport`](crate::testing::PlaybackTransport).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use lumen_runtime::TimeSource;

use super::{
    ConnectOptions, ConnectionCallback, MessageCallback, Payload, Transport, TransportResult,
};
use crate::testing::{Direction, MessageEvent, format_log};

struct Recorder {
    time_source: Arc<dyn TimeSource>,
    started_at: Duration,
    events: Mutex<Vec<MessageEvent>>,
}

impl Recorder {
    fn record(&self, direction: Direction, topic: &str, payload: &Payload) {
        let time = self
            .time_source
            .monotonic()
            .saturating_sub(self.started_at)
            .as_secs_f64();

        self.events
            .lock()
            .push(MessageEvent::new(direction, time, topic, payload.clone()));
    }
}

/// Decorator recording sent and received traffic.
pub struct RecordingTransport {
    transport: Arc<dyn Transport>,
    recorder: Arc<Recorder>,
}

impl RecordingTransport {
    /// Record traffic of `transport`, timestamped relative to now
    pub fn new(transport: Arc<dyn Transport>, time_source: Arc<dyn TimeSource>) -> Self {
        let started_at = time_source.monotonic();

        Self {
            transport,
            recorder: Arc::new(Recorder {
                time_source,
                started_at,
                events: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<MessageEvent> {
        self.recorder.events.lock().clone()
    }

    /// The recording in log form
    pub fn to_log(&self) -> String {
        format_log(&self.recorder.events.lock())
    }

    /// Write the recording to a log file
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_log())?;
        info!(
            "Saved {} recorded messages to {}",
            self.recorder.events.lock().len(),
            path.display()
        );
        Ok(())
    }
}

impl Transport for RecordingTransport {
    fn connect(&self, options: &ConnectOptions) -> TransportResult<()> {
        self.transport.connect(options)
    }

    fn subscribe(&self, topic: &str) -> TransportResult<()> {
        self.transport.subscribe(topic)
    }

    fn publish(&self, topic: &str, payload: &Payload) -> TransportResult<()> {
        self.transport.publish(topic, payload)?;
        self.recorder.record(Direction::Sent, topic, payload);
        Ok(())
    }

    fn set_on_connect(&self, callback: ConnectionCallback) {
        self.transport.set_on_connect(callback);
    }

    fn set_on_disconnect(&self, callback: ConnectionCallback) {
        self.transport.set_on_disconnect(callback);
    }

    fn set_on_message(&self, callback: MessageCallback) {
        let recorder = self.recorder.clone();
        self.transport
            .set_on_message(Arc::new(move |topic: &str, payload: Payload| {
                recorder.record(Direction::Received, topic, &payload);
                callback(topic, payload);
            }));
    }

    fn start(&self) -> TransportResult<()> {
        self.transport.start()
    }

    fn disconnect(&self) -> TransportResult<()> {
        self.transport.disconnect()
    }
}
