//! Coalesced loop callbacks
//!
//! An [`AsyncUpdater`] turns any number of `trigger()` calls made before the
//! loop gets to it into a single callback invocation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::message_loop::MessageLoop;

struct UpdaterInner {
    message_loop: MessageLoop,
    pending: AtomicBool,
    callback: Box<dyn Fn() + Send + Sync + 'static>,
}

/// Posts its callback to the loop at most once per pending period.
#[derive(Clone)]
pub struct AsyncUpdater {
    inner: Arc<UpdaterInner>,
}

impl AsyncUpdater {
    pub fn new(message_loop: MessageLoop, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(UpdaterInner {
                message_loop,
                pending: AtomicBool::new(false),
                callback: Box::new(callback),
            }),
        }
    }

    /// Request a callback on the loop thread
    ///
    /// Does nothing if a callback is already queued. The pending flag is
    /// cleared right before the callback runs, so a trigger from inside the
    /// callback schedules another turn.
    pub fn trigger(&self) {
        if self.inner.pending.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = self.inner.clone();
        self.inner.message_loop.post(move || {
            inner.pending.store(false, Ordering::Release);
            (inner.callback)();
        });
    }

    /// Whether a callback is queued but has not run yet
    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for AsyncUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncUpdater")
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}
