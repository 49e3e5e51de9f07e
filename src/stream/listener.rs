//! Listener registry used for message and error delivery.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::warn;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entries<T: ?Sized> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// Ordered set of callbacks for one channel (messages or errors).
pub(crate) struct Listeners<T: ?Sized> {
    entries: Arc<Mutex<Entries<T>>>,
    channel: &'static str,
}

impl<T: ?Sized + 'static> Listeners<T> {
    pub(crate) fn new(channel: &'static str) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                next_id: 0,
                callbacks: Vec::new(),
            })),
            channel,
        }
    }

    pub(crate) fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Callback<T> = Arc::new(callback);
        let id = {
            let mut entries = lock(&self.entries);
            let id = entries.next_id;
            entries.next_id += 1;
            entries.callbacks.push((id, callback));
            id
        };

        let weak: Weak<Mutex<Entries<T>>> = Arc::downgrade(&self.entries);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(entries) = weak.upgrade() {
                    lock(&entries)
                        .callbacks
                        .retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    #[cfg(test)]
    pub(crate) fn emit(&self, value: &T) {
        self.emit_while(value, || true);
    }

    /// Invokes listeners in registration order while `proceed` holds.
    ///
    /// The registry lock is not held while callbacks run, so a callback may
    /// subscribe, unsubscribe or drive the transport. A panicking callback is
    /// logged and skipped.
    pub(crate) fn emit_while(&self, value: &T, proceed: impl Fn() -> bool) {
        let snapshot: Vec<Callback<T>> = lock(&self.entries)
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in snapshot {
            if !proceed() {
                return;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                warn!(event = "listener_panicked", channel = self.channel);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).callbacks.len()
    }
}

fn lock<T: ?Sized>(entries: &Mutex<Entries<T>>) -> MutexGuard<'_, Entries<T>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by listener registration.
///
/// Dropping the handle leaves the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe later"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Removes the listener. Later deliveries skip it.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
