//! Playback transport
//!
//! Feeds a recorded log into a client as if a broker were sending it, and
//! records what the client publishes in return.
//!
//! - `RECV` events are delivered once their timestamp is reached, using loop
//!   timers. On a virtual clock this takes no real time.
//! - `SEND` events are expectations, checked after the run.
//! - `SYNC` events hold playback until the client has published a matching
//!   message, polling every [`SYNC_RETRY_INTERVAL`] for at most
//!   [`SYNC_RETRY_BUDGET`] attempts.
//!
//! The loop is stopped [`END_GRACE_PERIOD`] after the last event, or as soon
//! as a `SYNC` gives up.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use lumen_runtime::{Runtime, Timer};

use super::message_event::{Direction, MessageEvent, format_log, parse_log};
use super::PlaybackError;
use crate::transport::{
    ConnectOptions, ConnectionCallback, MessageCallback, Payload, Transport, TransportError,
    TransportResult,
};

/// Delay between checks of a pending `SYNC` event
pub const SYNC_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Checks of a `SYNC` event before playback fails
pub const SYNC_RETRY_BUDGET: u32 = 50;

/// Time the client gets to react after the last event
pub const END_GRACE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Default)]
struct PlaybackState {
    started_at: Option<Duration>,
    cursor: usize,
    sync_from: usize,
    sync_retries: u32,
    grace_started: bool,
    finished: bool,
    failure: Option<String>,
    actual: Vec<MessageEvent>,
    subscriptions: Vec<String>,
}

#[derive(Default)]
struct Callbacks {
    on_connect: Option<ConnectionCallback>,
    on_disconnect: Option<ConnectionCallback>,
    on_message: Option<MessageCallback>,
}

struct PlaybackInner {
    runtime: Runtime,
    expected: Vec<MessageEvent>,
    state: Mutex<PlaybackState>,
    callbacks: Mutex<Callbacks>,
    timer: Timer,
}

enum Step {
    Deliver(String, Payload),
    Continue,
    Wait(Duration),
    Finish,
    Fail,
}

/// Transport that replays a traffic log.
#[derive(Clone)]
pub struct PlaybackTransport {
    inner: Arc<PlaybackInner>,
}

impl PlaybackTransport {
    pub fn new(runtime: &Runtime, expected: Vec<MessageEvent>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<PlaybackInner>| {
            let weak = weak.clone();
            let timer = runtime.timer(move |timer| {
                timer.stop();
                if let Some(inner) = weak.upgrade() {
                    inner.step();
                }
            });

            PlaybackInner {
                runtime: runtime.clone(),
                expected,
                state: Mutex::new(PlaybackState::default()),
                callbacks: Mutex::new(Callbacks::default()),
                timer,
            }
        });

        Self { inner }
    }

    /// Build from log text
    pub fn from_log(runtime: &Runtime, log: &str) -> Result<Self, PlaybackError> {
        Ok(Self::new(runtime, parse_log(log)?))
    }

    /// Build from a log file
    pub fn load(runtime: &Runtime, path: impl AsRef<Path>) -> Result<Self, PlaybackError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_log(runtime, &text)
    }

    /// The log being replayed
    pub fn expected_events(&self) -> &[MessageEvent] {
        &self.inner.expected
    }

    /// Messages delivered and published so far, timestamped by this session
    pub fn actual_events(&self) -> Vec<MessageEvent> {
        self.inner.state.lock().actual.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.state.lock().subscriptions.clone()
    }

    /// Whether the replay ran to completion and the client's traffic matched
    ///
    /// Every `SEND` and `SYNC` expectation must be met, in order, by its own
    /// published message, and nothing else may have been published.
    pub fn playback_success(&self) -> bool {
        let state = self.inner.state.lock();
        state.finished && state.failure.is_none() && self.inner.mismatch(&state.actual).is_none()
    }

    /// Expected and actual traffic side by side, for diffing
    pub fn report(&self) -> String {
        let state = self.inner.state.lock();

        let verdict = if let Some(failure) = &state.failure {
            format!("FAILED: {}", failure)
        } else if !state.finished {
            "FAILED: playback did not finish".to_string()
        } else if let Some(mismatch) = self.inner.mismatch(&state.actual) {
            format!("FAILED: {}", mismatch)
        } else {
            "PASSED".to_string()
        };

        format!(
            "{}\n\nExpected:\n{}\nActual:\n{}",
            verdict,
            format_log(&self.inner.expected),
            format_log(&state.actual)
        )
    }
}

impl PlaybackInner {
    fn elapsed(&self, state: &PlaybackState) -> Duration {
        let started_at = state.started_at.unwrap_or_default();
        self.runtime.monotonic().saturating_sub(started_at)
    }

    /// First reason the published traffic does not meet the expectations
    fn mismatch(&self, actual: &[MessageEvent]) -> Option<String> {
        let expected: Vec<&MessageEvent> = self
            .expected
            .iter()
            .filter(|e| e.direction != Direction::Received)
            .collect();
        let sent: Vec<&MessageEvent> = actual
            .iter()
            .filter(|e| e.direction == Direction::Sent)
            .collect();

        for (index, expectation) in expected.iter().enumerate() {
            match sent.get(index) {
                Some(message) if expectation.satisfied_by(message) => {}
                Some(message) => {
                    return Some(format!(
                        "sent message #{} does not match:\n{}\nexpected:\n{}",
                        index + 1,
                        message,
                        expectation
                    ));
                }
                None => {
                    return Some(format!("expected message was never sent:\n{}", expectation));
                }
            }
        }

        if sent.len() > expected.len() {
            return Some(format!(
                "{} unexpected message(s) sent, first:\n{}",
                sent.len() - expected.len(),
                sent[expected.len()]
            ));
        }

        None
    }

    /// Work through the log until something has to be waited for.
    fn step(&self) {
        loop {
            let step = {
                let mut state = self.state.lock();
                if state.finished || state.failure.is_some() {
                    return;
                }
                self.next_step(&mut state)
            };

            match step {
                Step::Deliver(topic, payload) => {
                    let callback = self.callbacks.lock().on_message.clone();
                    if let Some(callback) = callback {
                        callback(&topic, payload);
                    }
                }
                Step::Continue => {}
                Step::Wait(delay) => {
                    self.timer.start(delay);
                    return;
                }
                Step::Finish => {
                    info!("Playback finished");
                    self.runtime.stop();
                    return;
                }
                Step::Fail => {
                    self.runtime.stop();
                    return;
                }
            }
        }
    }

    fn next_step(&self, state: &mut PlaybackState) -> Step {
        let elapsed = self.elapsed(state);

        let Some(event) = self.expected.get(state.cursor) else {
            if state.grace_started {
                state.finished = true;
                return Step::Finish;
            }
            state.grace_started = true;
            return Step::Wait(END_GRACE_PERIOD);
        };

        match event.direction {
            Direction::Received => {
                let due = Duration::try_from_secs_f64(event.time).unwrap_or_default();
                if elapsed < due {
                    return Step::Wait(due - elapsed);
                }

                state.cursor += 1;
                debug!("Playback delivers {} at {:?}", event.topic, elapsed);
                state.actual.push(MessageEvent::new(
                    Direction::Received,
                    elapsed.as_secs_f64(),
                    event.topic.clone(),
                    event.payload.clone(),
                ));
                Step::Deliver(event.topic.clone(), event.payload.clone())
            }
            Direction::Sent => {
                state.cursor += 1;
                Step::Continue
            }
            Direction::Sync => {
                let matched = state
                    .actual
                    .iter()
                    .enumerate()
                    .skip(state.sync_from)
                    .find(|(_, actual)| event.satisfied_by(actual))
                    .map(|(index, _)| index);

                if let Some(index) = matched {
                    state.sync_from = index + 1;
                    state.sync_retries = 0;
                    state.cursor += 1;
                    return Step::Continue;
                }

                if state.sync_retries >= SYNC_RETRY_BUDGET {
                    let reason = format!(
                        "gave up waiting for {} after {} retries",
                        event.topic, SYNC_RETRY_BUDGET
                    );
                    warn!("Playback {}", reason);
                    state.failure = Some(reason);
                    return Step::Fail;
                }

                state.sync_retries += 1;
                Step::Wait(SYNC_RETRY_INTERVAL)
            }
        }
    }
}

impl Transport for PlaybackTransport {
    fn connect(&self, _options: &ConnectOptions) -> TransportResult<()> {
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> TransportResult<()> {
        self.inner.state.lock().subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &Payload) -> TransportResult<()> {
        let mut state = self.inner.state.lock();

        if state.started_at.is_none() {
            return Err(TransportError::NotConnected);
        }

        let elapsed = self.inner.elapsed(&state).as_secs_f64();
        state.actual.push(MessageEvent::new(
            Direction::Sent,
            elapsed,
            topic,
            payload.clone(),
        ));
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
        self.inner.state.lock().started_at = Some(self.inner.runtime.monotonic());

        let on_connect = self.inner.callbacks.lock().on_connect.clone();
        if let Some(callback) = on_connect {
            callback();
        }

        self.inner.step();
        Ok(())
    }

    fn disconnect(&self) -> TransportResult<()> {
        self.inner.timer.stop();

        let on_disconnect = self.inner.callbacks.lock().on_disconnect.clone();
        if let Some(callback) = on_disconnect {
            callback();
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    /// Echoes every `{"ping": n}` received as `{"pong": n}` on `reply`.
    fn echo(transport: &PlaybackTransport, runtime: &Runtime) {
        let t = transport.clone();
        let rt = runtime.clone();
        transport.set_on_message(Arc::new(move |_topic: &str, body: Payload| {
            let t = t.clone();
            rt.post(move || {
                if let Some(n) = body.get("ping") {
                    let reply = payload(json!({ "pong": n }));
                    t.publish("reply", &reply).unwrap();
                }
            });
        }));
    }

    #[test]
    fn test_replay_with_matching_client() {
        let runtime = Runtime::new_virtual();
        let log = vec![
            MessageEvent::new(Direction::Received, 1.0, "in", payload(json!({"ping": 1}))),
            MessageEvent::new(Direction::Sync, 1.0, "reply", payload(json!({"pong": 1}))),
            MessageEvent::new(Direction::Received, 5.0, "in", payload(json!({"ping": 2}))),
            MessageEvent::new(Direction::Sent, 5.0, "reply", payload(json!({"pong": "*"}))),
        ];

        let transport = PlaybackTransport::new(&runtime, log);
        echo(&transport, &runtime);

        transport.start().unwrap();
        runtime.run().unwrap();

        assert!(transport.playback_success(), "{}", transport.report());

        let actual = transport.actual_events();
        assert_eq!(actual.len(), 4);
        assert_eq!(actual[0].time, 1.0);
        assert_eq!(actual[2].time, 5.0);
        assert!(runtime.monotonic() >= Duration::from_secs(6));
    }

    #[test]
    fn test_unexpected_send_fails() {
        let runtime = Runtime::new_virtual();
        let log = vec![MessageEvent::new(
            Direction::Received,
            0.5,
            "in",
            payload(json!({"ping": 1})),
        )];

        let transport = PlaybackTransport::new(&runtime, log);
        echo(&transport, &runtime);

        transport.start().unwrap();
        runtime.run().unwrap();

        assert!(!transport.playback_success());
        assert!(transport.report().contains("unexpected message"));
    }

    #[test]
    fn test_sync_gives_up_after_budget() {
        let runtime = Runtime::new_virtual();
        let log = vec![MessageEvent::new(
            Direction::Sync,
            0.0,
            "reply",
            payload(json!({"pong": 1})),
        )];

        let transport = PlaybackTransport::new(&runtime, log);

        transport.start().unwrap();
        runtime.run().unwrap();

        assert!(!transport.playback_success());
        assert!(transport.report().starts_with("FAILED: gave up waiting for reply"));

        let waited = runtime.monotonic();
        assert!(waited >= SYNC_RETRY_INTERVAL * SYNC_RETRY_BUDGET);
        assert!(waited < END_GRACE_PERIOD + SYNC_RETRY_INTERVAL * (SYNC_RETRY_BUDGET + 2));
    }

    #[test]
    fn test_missing_send_is_reported() {
        let runtime = Runtime::new_virtual();
        let log = vec![MessageEvent::new(
            Direction::Sent,
            0.0,
            "reply",
            payload(json!({"pong": 1})),
        )];

        let transport = PlaybackTransport::new(&runtime, log);
        transport.start().unwrap();
        runtime.run().unwrap();

        assert!(!transport.playback_success());
        assert!(transport.report().contains("never sent"));
    }
}
