//! Cross-thread publish/subscribe primitive.
//!
//! A [`Notifier`] carries asynchronous pipeline events (video geometry,
//! buffering snapshots, errors, scan results) from whatever thread produced
//! them to subscribed listeners. Value-flavored notifiers additionally store
//! the last published value so late subscribers observe current state.
//!
//! Callbacks run synchronously on the publishing thread. Every notifier
//! instance documents at its creation site which threads publish to it;
//! consumers that need a specific thread must re-post themselves.
//!
//! A callback may unsubscribe itself (or any other listener) while a
//! dispatch is in progress. What a callback must not do is publish to the
//! same notifier it is being invoked from; the lock protocol does not
//! support that reentrancy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Returned by listener callbacks to control their own lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerAction {
    /// Stay subscribed.
    Keep,
    /// Deliver once, then forget. The listener is removed before `notify`
    /// returns and never invoked again.
    Unsubscribe,
}

type Callback<T> = Box<dyn FnMut(&T) -> ListenerAction + Send + 'static>;

struct ListenerSlot<T> {
    /// Flipped instead of removing in place so a listener can be dropped
    /// from within a running dispatch without touching the listener list.
    dead: AtomicBool,
    callback: Mutex<Callback<T>>,
}

struct NotifierInner<T> {
    value: Option<T>,
    listeners: Vec<Arc<ListenerSlot<T>>>,
    closed: bool,
}

struct NotifierCore<T> {
    stores_value: bool,
    inner: Mutex<NotifierInner<T>>,
}

/// Thread-safe publish/subscribe hub. Cheap to clone; clones share state.
pub struct Notifier<T> {
    core: Arc<NotifierCore<T>>,
}

impl<T> Clone for Notifier<T> {
    fn clone(&self) -> Self {
        Self { core: Arc::clone(&self.core) }
    }
}

/// Handle returned by [`Notifier::listen`]. Consuming it with
/// [`ListenerHandle::cancel`] unsubscribes the listener; merely dropping the
/// handle leaves the listener attached until the notifier closes.
pub struct ListenerHandle<T> {
    core: Weak<NotifierCore<T>>,
    slot: Weak<ListenerSlot<T>>,
}

impl<T: Clone + Send + 'static> ListenerHandle<T> {
    /// Unsubscribes the listener. Safe to call from within any listener
    /// callback, including the one being cancelled; a handle whose notifier
    /// or listener is already gone is a no-op.
    pub fn cancel(self) {
        if let Some(slot) = self.slot.upgrade() {
            slot.dead.store(true, Ordering::SeqCst);
        }
        if let Some(core) = self.core.upgrade() {
            Notifier { core }.remove_dead();
        }
    }
}

impl<T: Clone + Send + 'static> Notifier<T> {
    /// A notifier that stores the last published value and replays it to
    /// late subscribers.
    pub fn value() -> Self {
        Self::with_flavor(true)
    }

    /// A notifier that only forwards events, storing nothing.
    pub fn change() -> Self {
        Self::with_flavor(false)
    }

    fn with_flavor(stores_value: bool) -> Self {
        Self {
            core: Arc::new(NotifierCore {
                stores_value,
                inner: Mutex::new(NotifierInner {
                    value: None,
                    listeners: Vec::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Registers a listener. Listeners are dispatched in registration order.
    ///
    /// For value-flavored notifiers that already hold a value, the callback
    /// is invoked with that value before `listen` returns, and no publish
    /// can interleave ahead of that first delivery.
    pub fn listen(
        &self,
        callback: impl FnMut(&T) -> ListenerAction + Send + 'static,
    ) -> ListenerHandle<T> {
        let slot = Arc::new(ListenerSlot {
            dead: AtomicBool::new(false),
            callback: Mutex::new(Box::new(callback)),
        });
        let handle = ListenerHandle {
            core: Arc::downgrade(&self.core),
            slot: Arc::downgrade(&slot),
        };

        // Hold the slot's callback lock across insertion so a concurrent
        // notify cannot deliver a newer value before the stored one.
        let mut cb = slot.callback.lock();
        let initial = {
            let mut inner = self.core.inner.lock();
            if inner.closed {
                slot.dead.store(true, Ordering::SeqCst);
                return handle;
            }
            inner.listeners.push(Arc::clone(&slot));
            if self.core.stores_value {
                inner.value.clone()
            } else {
                None
            }
        };
        if let Some(value) = initial {
            if let ListenerAction::Unsubscribe = (*cb)(&value) {
                slot.dead.store(true, Ordering::SeqCst);
                drop(cb);
                self.remove_dead();
                return handle;
            }
        }
        drop(cb);
        handle
    }

    /// Publishes `value`: stores it (value flavor) and synchronously invokes
    /// every listener registered at the time of the call, on the calling
    /// thread. No-op after [`Notifier::close`].
    pub fn notify(&self, value: T) {
        let snapshot: Vec<Arc<ListenerSlot<T>>> = {
            let mut inner = self.core.inner.lock();
            if inner.closed {
                return;
            }
            if self.core.stores_value {
                inner.value = Some(value.clone());
            }
            inner.listeners.clone()
        };

        let mut any_dropped = false;
        for slot in &snapshot {
            if slot.dead.load(Ordering::SeqCst) {
                continue;
            }
            let mut cb = slot.callback.lock();
            // Re-check: another listener may have cancelled this one while
            // we waited for its callback lock.
            if slot.dead.load(Ordering::SeqCst) {
                continue;
            }
            if let ListenerAction::Unsubscribe = (*cb)(&value) {
                slot.dead.store(true, Ordering::SeqCst);
                any_dropped = true;
            }
        }
        if any_dropped {
            self.remove_dead();
        }
    }

    /// The last published value, if this notifier stores one.
    pub fn current(&self) -> Option<T> {
        self.core.inner.lock().value.clone()
    }

    /// Shuts the notifier down: drops the stored value, detaches all
    /// listeners and makes every later `notify`/`listen` a no-op. Listener
    /// closures are dropped outside the notifier lock.
    pub fn close(&self) {
        let drained = {
            let mut inner = self.core.inner.lock();
            inner.closed = true;
            inner.value = None;
            std::mem::take(&mut inner.listeners)
        };
        for slot in &drained {
            slot.dead.store(true, Ordering::SeqCst);
        }
        drop(drained);
    }

    fn remove_dead(&self) {
        let removed: Vec<Arc<ListenerSlot<T>>> = {
            let mut inner = self.core.inner.lock();
            let mut removed = Vec::new();
            inner.listeners.retain(|slot| {
                if slot.dead.load(Ordering::SeqCst) {
                    removed.push(Arc::clone(slot));
                    false
                } else {
                    true
                }
            });
            removed
        };
        // Callback drop may run arbitrary code; keep it off the lock.
        drop(removed);
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.core.inner.lock().listeners.len()
    }
}

impl<T> std::fmt::Debug for Notifier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.core.inner.lock();
        f.debug_struct("Notifier")
            .field("stores_value", &self.core.stores_value)
            .field("listeners", &inner.listeners.len())
            .field("has_value", &inner.value.is_some())
            .field("closed", &inner.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn each_publish_reaches_listener_exactly_once() {
        let notifier = Notifier::<u32>::change();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let handle = notifier.listen(move |v| {
            seen_cb.lock().push(*v);
            ListenerAction::Keep
        });

        notifier.notify(1);
        notifier.notify(2);
        handle.cancel();
        notifier.notify(3);

        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(notifier.listener_count(), 0);
    }

    #[test]
    fn value_flavor_replays_stored_value_synchronously() {
        let notifier = Notifier::<&'static str>::value();
        notifier.notify("negotiated");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let _handle = notifier.listen(move |v| {
            seen_cb.lock().push(*v);
            ListenerAction::Keep
        });

        // Delivery happened inside listen, before any further publish.
        assert_eq!(*seen.lock(), vec!["negotiated"]);
        assert_eq!(notifier.current(), Some("negotiated"));
    }

    #[test]
    fn change_flavor_stores_nothing() {
        let notifier = Notifier::<u32>::change();
        notifier.notify(7);
        assert_eq!(notifier.current(), None);

        let fired = Arc::new(AtomicBool::new(false));
        let fired_cb = Arc::clone(&fired);
        let _handle = notifier.listen(move |_| {
            fired_cb.store(true, Ordering::SeqCst);
            ListenerAction::Keep
        });
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn one_shot_listener_sees_a_single_delivery() {
        let notifier = Notifier::<u32>::change();
        let count = Arc::new(AtomicU64::new(0));
        let count_cb = Arc::clone(&count);
        let _handle = notifier.listen(move |_| {
            count_cb.fetch_add(1, Ordering::SeqCst);
            ListenerAction::Unsubscribe
        });

        notifier.notify(1);
        notifier.notify(2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.listener_count(), 0);
    }

    #[test]
    fn listener_cancelled_mid_dispatch_is_skipped() {
        let notifier = Notifier::<u32>::change();
        let victim_handle: Arc<Mutex<Option<ListenerHandle<u32>>>> =
            Arc::new(Mutex::new(None));
        let victim_fired = Arc::new(AtomicBool::new(false));

        let handle_for_killer = Arc::clone(&victim_handle);
        let _killer = notifier.listen(move |_| {
            if let Some(handle) = handle_for_killer.lock().take() {
                handle.cancel();
            }
            ListenerAction::Keep
        });

        let victim_fired_cb = Arc::clone(&victim_fired);
        let victim = notifier.listen(move |_| {
            victim_fired_cb.store(true, Ordering::SeqCst);
            ListenerAction::Keep
        });
        *victim_handle.lock() = Some(victim);

        // The killer runs first (registration order) and cancels the victim
        // before its turn in the same dispatch.
        notifier.notify(1);
        assert!(!victim_fired.load(Ordering::SeqCst));
        assert_eq!(notifier.listener_count(), 1);
    }

    #[test]
    fn dispatch_follows_registration_order() {
        let notifier = Notifier::<u32>::change();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for tag in ["first", "second", "third"] {
            let order_cb = Arc::clone(&order);
            handles.push(notifier.listen(move |_| {
                order_cb.lock().push(tag);
                ListenerAction::Keep
            }));
        }
        notifier.notify(0);
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn close_detaches_listeners_and_drops_value() {
        let notifier = Notifier::<u32>::value();
        let count = Arc::new(AtomicU64::new(0));
        let count_cb = Arc::clone(&count);
        let _handle = notifier.listen(move |_| {
            count_cb.fetch_add(1, Ordering::SeqCst);
            ListenerAction::Keep
        });

        notifier.notify(1);
        notifier.close();
        notifier.notify(2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.current(), None);

        // Subscribing after close never fires.
        let late = Arc::new(AtomicBool::new(false));
        let late_cb = Arc::clone(&late);
        let _dead = notifier.listen(move |_| {
            late_cb.store(true, Ordering::SeqCst);
            ListenerAction::Keep
        });
        notifier.notify(3);
        assert!(!late.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_is_idempotent_with_closed_notifier() {
        let notifier = Notifier::<u32>::change();
        let handle = notifier.listen(|_| ListenerAction::Keep);
        notifier.close();
        // Listener already detached by close; cancel must not panic.
        handle.cancel();
    }
}
