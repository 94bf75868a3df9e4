//! Message Loop
//!
//! A multi-producer, single-consumer queue of closures. Any thread may post;
//! only the thread inside [`MessageLoop::run`] invokes messages. Everything
//! that touches device or parameter state is funneled through here, which is
//! what makes that state single-writer.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::broadcaster::Broadcaster;
use crate::error::{BoxError, RuntimeError, RuntimeResult};

/// A deferred action executed on the loop thread.
pub type Message = Box<dyn FnOnce() -> Result<(), BoxError> + Send + 'static>;

struct LoopState {
    messages: Vec<Message>,
    should_quit: bool,
    running: bool,
}

struct LoopShared {
    state: Mutex<LoopState>,
    condition: Condvar,
    on_stop: Broadcaster,
}

/// Handle to a message loop. Clones share the same queue.
#[derive(Clone)]
pub struct MessageLoop {
    shared: Arc<LoopShared>,
}

/// Clears the running flag even when a message unwinds out of `run`.
struct RunningGuard<'a> {
    shared: &'a LoopShared,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.shared.state.lock().running = false;
    }
}

impl MessageLoop {
    /// Create an empty, stopped loop
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LoopShared {
                state: Mutex::new(LoopState {
                    messages: Vec::new(),
                    should_quit: false,
                    running: false,
                }),
                condition: Condvar::new(),
                on_stop: Broadcaster::new(),
            }),
        }
    }

    /// Append a message to the queue and wake the loop thread
    pub fn post(&self, message: impl FnOnce() + Send + 'static) {
        self.post_fallible(move || {
            message();
            Ok(())
        });
    }

    /// Append a message whose error terminates [`MessageLoop::run`]
    pub fn post_fallible(
        &self,
        message: impl FnOnce() -> Result<(), BoxError> + Send + 'static,
    ) {
        let mut state = self.shared.state.lock();
        state.messages.push(Box::new(message));
        self.shared.condition.notify_one();
    }

    /// Process messages on the calling thread until [`MessageLoop::stop`]
    ///
    /// Each iteration swaps out the whole queue and runs that batch in order.
    /// A panic inside a message unwinds through this call; an error from a
    /// fallible message is returned immediately and the rest of the batch is
    /// dropped.
    pub fn run(&self) -> RuntimeResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.running {
                return Err(RuntimeError::AlreadyRunning);
            }
            state.running = true;
            state.should_quit = false;
        }

        let _guard = RunningGuard {
            shared: &self.shared,
        };

        debug!("Message loop started");

        loop {
            let batch = {
                let mut state = self.shared.state.lock();

                if state.should_quit {
                    break;
                }

                if state.messages.is_empty() {
                    self.shared.condition.wait(&mut state);
                }

                std::mem::take(&mut state.messages)
            };

            if !batch.is_empty() {
                trace!("Processing {} messages", batch.len());
            }

            for message in batch {
                message().map_err(RuntimeError::MessageFailed)?;
            }
        }

        debug!("Message loop stopped");
        Ok(())
    }

    /// Request the loop to exit
    ///
    /// Messages already taken for the current batch still run; no further
    /// batch is taken. `on_stop` listeners are notified first.
    pub fn stop(&self) {
        self.shared.on_stop.call_listeners(&());

        let mut state = self.shared.state.lock();
        state.should_quit = true;
        self.shared.condition.notify_one();
    }

    /// Listeners notified whenever [`MessageLoop::stop`] is called
    pub fn on_stop(&self) -> &Broadcaster {
        &self.shared.on_stop
    }

    /// Whether a thread is currently inside [`MessageLoop::run`]
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Number of messages waiting for the next batch
    pub fn pending(&self) -> usize {
        self.shared.state.lock().messages.len()
    }
}

impl Default for MessageLoop {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_messages_run_in_post_order() {
        let message_loop = MessageLoop::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            message_loop.post(move || order.lock().push(i));
        }

        let ml = message_loop.clone();
        message_loop.post(move || ml.stop());
        message_loop.run().unwrap();

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_stop_lets_current_batch_finish() {
        let message_loop = MessageLoop::new();
        let ran = Arc::new(Mutex::new(Vec::new()));

        let ml = message_loop.clone();
        let r = ran.clone();
        message_loop.post(move || {
            r.lock().push("stop");
            ml.stop();

            // Posted after stop: belongs to a batch that is never taken.
            let r = r.clone();
            ml.post(move || r.lock().push("late"));
        });

        let r = ran.clone();
        message_loop.post(move || r.lock().push("same batch"));

        message_loop.run().unwrap();

        assert_eq!(*ran.lock(), vec!["stop", "same batch"]);
        assert_eq!(message_loop.pending(), 1);
    }

    #[test]
    fn test_post_from_other_threads() {
        let message_loop = MessageLoop::new();
        let count = Arc::new(Mutex::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ml = message_loop.clone();
                let count = count.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        let count = count.clone();
                        let ml2 = ml.clone();
                        ml.post(move || {
                            let mut c = count.lock();
                            *c += 1;
                            if *c == 100 {
                                ml2.stop();
                            }
                        });
                    }
                })
            })
            .collect();

        message_loop.run().unwrap();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*count.lock(), 100);
    }

    #[test]
    fn test_second_run_is_rejected() {
        let message_loop = MessageLoop::new();

        let ml = message_loop.clone();
        let second = Arc::new(Mutex::new(None));
        let result = second.clone();
        message_loop.post(move || {
            *result.lock() = Some(matches!(ml.run(), Err(RuntimeError::AlreadyRunning)));
            ml.stop();
        });

        message_loop.run().unwrap();

        assert_eq!(*second.lock(), Some(true));
        assert!(!message_loop.is_running());
    }

    #[test]
    fn test_fallible_message_error_ends_run() {
        let message_loop = MessageLoop::new();

        message_loop.post_fallible(|| Err("automation broke".into()));

        let err = message_loop.run().unwrap_err();
        assert!(matches!(err, RuntimeError::MessageFailed(_)));
        assert!(err.to_string().contains("automation broke"));
        assert!(!message_loop.is_running());
    }

    #[test]
    fn test_panic_propagates_out_of_run() {
        let message_loop = MessageLoop::new();
        message_loop.post(|| panic!("boom"));

        let ml = message_loop.clone();
        let result = thread::spawn(move || ml.run()).join();

        assert!(result.is_err());
        assert!(!message_loop.is_running());
    }

    #[test]
    fn test_on_stop_listeners() {
        let message_loop = MessageLoop::new();
        let stopped = Arc::new(Mutex::new(false));

        let flag = stopped.clone();
        let _token = message_loop.on_stop().add_listener(move |_| *flag.lock() = true);

        let ml = message_loop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            ml.stop();
        });

        message_loop.run().unwrap();
        assert!(*stopped.lock());
    }
}
