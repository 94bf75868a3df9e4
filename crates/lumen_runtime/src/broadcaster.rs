//! Listener broadcasting
//!
//! An ordered list of callbacks. The `order` given at registration only
//! decides the insertion position: lower orders are called first, equal orders
//! keep registration order. Registration returns a [`ListenerToken`] that
//! removes the listener again.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Order used by [`Broadcaster::add_listener`].
pub const DEFAULT_LISTENER_ORDER: i32 = 100;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct Listener<T> {
    id: u64,
    order: i32,
    callback: Callback<T>,
}

struct ListenerList<T> {
    next_id: u64,
    listeners: Vec<Listener<T>>,
}

impl<T> ListenerList<T> {
    fn remove(&mut self, id: u64) -> bool {
        match self.listeners.iter().position(|l| l.id == id) {
            Some(index) => {
                self.listeners.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Calls registered listeners with a `&T` argument.
pub struct Broadcaster<T = ()> {
    list: Arc<Mutex<ListenerList<T>>>,
}

impl<T: 'static> Broadcaster<T> {
    /// Create a broadcaster without listeners
    pub fn new() -> Self {
        Self {
            list: Arc::new(Mutex::new(ListenerList {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register a listener at [`DEFAULT_LISTENER_ORDER`]
    pub fn add_listener(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerToken {
        self.add_listener_with_order(DEFAULT_LISTENER_ORDER, callback)
    }

    /// Register a listener in front of every listener with a greater order
    pub fn add_listener_with_order(
        &self,
        order: i32,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> ListenerToken {
        let mut list = self.list.lock();

        let id = list.next_id;
        list.next_id += 1;

        let position = list
            .listeners
            .iter()
            .position(|existing| existing.order > order)
            .unwrap_or(list.listeners.len());

        list.listeners.insert(
            position,
            Listener {
                id,
                order,
                callback: Arc::new(callback),
            },
        );

        let weak: Weak<Mutex<ListenerList<T>>> = Arc::downgrade(&self.list);
        ListenerToken {
            remove: Box::new(move || {
                weak.upgrade()
                    .map(|list| list.lock().remove(id))
                    .unwrap_or(false)
            }),
        }
    }

    /// Call every listener in order
    ///
    /// The list is snapshotted first, so listeners may add or remove listeners
    /// (including themselves) while being called.
    pub fn call_listeners(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .list
            .lock()
            .listeners
            .iter()
            .map(|l| l.callback.clone())
            .collect();

        for callback in snapshot {
            callback(value);
        }
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.list.lock().listeners.len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a listener from the broadcaster it was registered with.
///
/// Dropping the token keeps the listener registered.
pub struct ListenerToken {
    remove: Box<dyn FnOnce() -> bool + Send + Sync>,
}

impl ListenerToken {
    /// Unregister the listener; returns false if it was already gone
    pub fn stop_listening(self) -> bool {
        (self.remove)()
    }
}

impl std::fmt::Debug for ListenerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerToken").finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    type Callback = Box<dyn Fn(&()) + Send + Sync>;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Callback) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();
        let make = move |name: &'static str| -> Callback {
            let c = c.clone();
            Box::new(move |_: &()| c.lock().push(name))
        };
        (calls, make)
    }

    #[test]
    fn test_order_controls_insertion_position() {
        let broadcaster = Broadcaster::new();
        let (calls, make) = recorder();

        let _a = broadcaster.add_listener(make("a"));
        let _b = broadcaster.add_listener(make("b"));
        let _first = broadcaster.add_listener_with_order(-1, make("first"));
        let _last = broadcaster.add_listener_with_order(1000, make("last"));

        broadcaster.call_listeners(&());

        assert_eq!(*calls.lock(), vec!["first", "a", "b", "last"]);
    }

    #[test]
    fn test_token_removes_listener() {
        let broadcaster = Broadcaster::new();
        let (calls, make) = recorder();

        let a = broadcaster.add_listener(make("a"));
        let _b = broadcaster.add_listener(make("b"));

        assert!(a.stop_listening());
        broadcaster.call_listeners(&());

        assert_eq!(*calls.lock(), vec!["b"]);
        assert_eq!(broadcaster.len(), 1);
    }

    #[test]
    fn test_token_outliving_broadcaster() {
        let broadcaster: Broadcaster = Broadcaster::new();
        let token = broadcaster.add_listener(|_| {});
        drop(broadcaster);

        assert!(!token.stop_listening());
    }

    #[test]
    fn test_listener_can_register_during_call() {
        let broadcaster: Arc<Broadcaster<u32>> = Arc::new(Broadcaster::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let b = broadcaster.clone();
        let s = seen.clone();
        let _token = broadcaster.add_listener(move |value| {
            s.lock().push(*value);
            let s = s.clone();
            let _ = b.add_listener(move |value| s.lock().push(value * 10));
        });

        broadcaster.call_listeners(&1);
        assert_eq!(*seen.lock(), vec![1]);

        broadcaster.call_listeners(&2);
        assert_eq!(*seen.lock(), vec![1, 2, 20]);
    }
}
