//! Scripted automation
//!
//! A [`TimedRunner`] runs a fixed list of actions, each one a given delay
//! after the previous, and by default stops the loop after the last one.
//! Handy for one-shot scripts and for driving a client in tests.
//! [`run_then_exit`] is the single-action case.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use lumen_runtime::{ListenerToken, Runtime, Timer};

use crate::client::DevicesClient;

/// Wait after connecting before the action of [`run_then_exit`], and again
/// before stopping
pub const RUN_THEN_EXIT_DELAY: Duration = Duration::from_secs(1);

type Action = Box<dyn FnOnce() + Send + 'static>;

struct Step {
    delay: Duration,
    action: Action,
}

/// A sequence of delayed actions.
pub struct TimedRunner {
    steps: VecDeque<Step>,
    stop_when_done: bool,
}

impl TimedRunner {
    pub fn new() -> Self {
        Self {
            steps: VecDeque::new(),
            stop_when_done: true,
        }
    }

    /// Append an action to run `delay` after the previous one
    pub fn step(mut self, delay: Duration, action: impl FnOnce() + Send + 'static) -> Self {
        self.steps.push_back(Step {
            delay,
            action: Box::new(action),
        });
        self
    }

    /// Whether to stop the loop after the last step (default true)
    ///
    /// The stop is posted behind whatever the last action queued, so its
    /// device updates still go out.
    pub fn stop_when_done(mut self, stop: bool) -> Self {
        self.stop_when_done = stop;
        self
    }

    /// Start counting down the first delay now
    pub fn start(self, runtime: &Runtime) -> Timer {
        let first = self.steps.front().map(|s| s.delay).unwrap_or(Duration::ZERO);
        let total = self.steps.len();
        info!("Running {} scripted steps", total);

        let stop_when_done = self.stop_when_done;
        let steps = Arc::new(Mutex::new(self.steps));
        let rt = runtime.clone();

        let timer = runtime.timer(move |timer: &Timer| {
            timer.stop();

            let step = steps.lock().pop_front();
            if let Some(step) = step {
                debug!("Step {} of {}", total - steps.lock().len(), total);
                (step.action)();
            }

            let next = steps.lock().front().map(|s| s.delay);
            match next {
                Some(delay) => timer.start(delay),
                None if stop_when_done => {
                    info!("Script finished, stopping");
                    // Let updates triggered by the last action flush first
                    let r = rt.clone();
                    rt.post(move || r.stop());
                }
                None => {}
            }
        });

        timer.start(first);
        timer
    }

    /// Start once `client` connects for the first time
    pub fn start_on_connect(self, client: &DevicesClient) -> ListenerToken {
        let runtime = client.runtime().clone();
        let pending = Mutex::new(Some(self));

        client.on_connect().add_listener(move |_| {
            if let Some(runner) = pending.lock().take() {
                runner.start(&runtime);
            }
        })
    }
}

/// Run `action` shortly after `client` first connects, then stop the loop
///
/// The extra delay before stopping gives the devices time to publish what
/// the action changed.
pub fn run_then_exit(
    client: &DevicesClient,
    action: impl FnOnce() + Send + 'static,
) -> ListenerToken {
    TimedRunner::new()
        .step(RUN_THEN_EXIT_DELAY, action)
        .step(RUN_THEN_EXIT_DELAY, || {})
        .start_on_connect(client)
}

impl Default for TimedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedRunner")
            .field("steps", &self.steps.len())
            .field("stop_when_done", &self.stop_when_done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceBuilder;
    use crate::transport::{MemoryTransport, Payload};
    use serde_json::json;

    #[test]
    fn test_steps_run_at_cumulative_delays() {
        let runtime = Runtime::new_virtual();
        let times = Arc::new(Mutex::new(Vec::new()));

        let mut runner = TimedRunner::new();
        for delay in [2, 1, 1] {
            let rt = runtime.clone();
            let times = times.clone();
            runner = runner.step(Duration::from_secs(delay), move || {
                times.lock().push(rt.monotonic());
            });
        }

        runner.start(&runtime);
        runtime.run().unwrap();

        assert_eq!(
            *times.lock(),
            vec![Duration::from_secs(2), Duration::from_secs(3), Duration::from_secs(4)]
        );
        assert_eq!(runtime.monotonic(), Duration::from_secs(4));
    }

    #[test]
    fn test_drives_client_after_connect() {
        let runtime = Runtime::new_virtual();
        let transport = MemoryTransport::new();
        let client =
            DevicesClient::new(&runtime, Arc::new(transport.clone())).skip_initial_query(true);
        let lamp = client.add_device(
            DeviceBuilder::new("lamp")
                .toggle("state")
                .numeric("brightness", 0.0, 255.0)
                .build(&runtime),
        );

        let l = lamp.clone();
        let m = lamp.clone();
        let _ = TimedRunner::new()
            .step(Duration::from_secs(1), move || {
                l.parameter("state").unwrap().set(1.0).unwrap();
                l.parameter("brightness").unwrap().set_normalized(1.0).unwrap();
            })
            .step(Duration::from_secs(1), move || {
                m.parameter("state").unwrap().set(0.0).unwrap();
            })
            .start_on_connect(&client);

        client.loop_forever().unwrap();

        let expected: Vec<Payload> = [
            json!({"state": "ON", "brightness": 255}),
            json!({"state": "OFF"}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect();
        assert_eq!(transport.published_to("zigbee2mqtt/lamp/set"), expected);
    }

    #[test]
    fn test_run_then_exit() {
        let runtime = Runtime::new_virtual();
        let transport = MemoryTransport::new();
        let client =
            DevicesClient::new(&runtime, Arc::new(transport.clone())).skip_initial_query(true);
        let lamp = client.add_device(DeviceBuilder::new("lamp").toggle("state").build(&runtime));

        let l = lamp.clone();
        let _ = run_then_exit(&client, move || {
            l.parameter("state").unwrap().set(1.0).unwrap();
        });

        client.loop_forever().unwrap();

        assert_eq!(
            transport.published_to("zigbee2mqtt/lamp/set"),
            vec![json!({"state": "ON"}).as_object().cloned().unwrap()]
        );
        assert!(runtime.monotonic() >= 2 * RUN_THEN_EXIT_DELAY);
    }
}
