//! Change notifier: push delivery of applied log entries to subscribers.
//!
//! Events are queued in log order while the database write lock is held and
//! delivered after it is released, one event at a time, by whichever thread
//! finds the queue idle. A callback may therefore read the store or submit
//! new mutations; events those writes produce are delivered after the
//! current event has reached every subscriber.
//!
//! The notifier holds only weak references. A [`Subscription`] owns its
//! callback, and dropping it unsubscribes.

use crate::store::{Conflict, RecordChange};
use crate::types::{CollectionId, Origin, SequenceNumber};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Notification for one applied log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Sequence number of the entry.
    pub sequence: SequenceNumber,
    /// Origin of the entry.
    pub origin: Origin,
    /// Record-level changes.
    pub changes: Vec<RecordChange>,
    /// Conflicts the store resolved while applying.
    pub conflicts: Vec<Conflict>,
    /// Collections whose visible contents may have changed.
    pub collections: Vec<CollectionId>,
}

impl ChangeEvent {
    /// Returns `true` if the event concerns `collection`.
    #[must_use]
    pub fn touches(&self, collection: &CollectionId) -> bool {
        self.collections.contains(collection)
    }
}

type Callback = dyn Fn(&ChangeEvent) + Send + Sync;

struct Entry {
    id: u64,
    active: AtomicBool,
    callback: Box<Callback>,
}

#[derive(Default)]
struct Inner {
    subscribers: Mutex<Vec<Weak<Entry>>>,
    queue: Mutex<VecDeque<ChangeEvent>>,
    delivering: AtomicBool,
    next_id: AtomicU64,
}

impl Inner {
    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .retain(|weak| weak.upgrade().is_some_and(|entry| entry.id != id));
    }
}

/// Handle returned by [`ChangeNotifier::subscribe`].
///
/// Owns the callback. Dropping it, or passing it to
/// [`ChangeNotifier::unsubscribe`], stops delivery.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    entry: Arc<Entry>,
    notifier: Weak<Inner>,
}

impl Subscription {
    /// Returns `true` until the subscription is cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.entry.active.load(Ordering::Acquire)
    }

    /// Stops delivery to this subscription.
    pub fn cancel(&self) {
        if self.entry.active.swap(false, Ordering::AcqRel) {
            if let Some(inner) = self.notifier.upgrade() {
                inner.remove(self.entry.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.entry.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Resets the delivering flag even if a callback panics.
struct DeliveryGuard<'a>(&'a AtomicBool);

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Publishes [`ChangeEvent`]s to subscribers in log order.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    inner: Arc<Inner>,
}

impl ChangeNotifier {
    /// Creates a notifier with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for every future event.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let entry = Arc::new(Entry {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        });
        self.inner.subscribers.lock().push(Arc::downgrade(&entry));
        Subscription {
            entry,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    /// Stops delivery to `subscription`. Safe to call from inside a
    /// callback, including the subscription's own.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.cancel();
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.len()
    }

    /// Queues an event without delivering it.
    pub fn enqueue(&self, event: ChangeEvent) {
        self.inner.queue.lock().push_back(event);
    }

    /// Delivers queued events unless another thread is already doing so.
    pub fn drain(&self) {
        loop {
            if self
                .inner
                .delivering
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            {
                let _guard = DeliveryGuard(&self.inner.delivering);
                loop {
                    let next = self.inner.queue.lock().pop_front();
                    let Some(event) = next else { break };
                    self.deliver(&event);
                }
            }
            // An event queued between the last pop and the flag reset would
            // otherwise wait for the next write.
            if self.inner.queue.lock().is_empty() {
                return;
            }
        }
    }

    /// Queues and delivers an event.
    pub fn publish(&self, event: ChangeEvent) {
        self.enqueue(event);
        self.drain();
    }

    fn deliver(&self, event: &ChangeEvent) {
        let targets: Vec<Arc<Entry>> = {
            let mut subscribers = self.inner.subscribers.lock();
            subscribers.retain(|weak| weak.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };
        for entry in targets {
            if entry.active.load(Ordering::Acquire) {
                (entry.callback)(event);
            }
        }
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("subscribers", &self.inner.subscribers.lock().len())
            .field("queued", &self.inner.queue.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event(seq: u64) -> ChangeEvent {
        ChangeEvent {
            sequence: SequenceNumber::new(seq),
            origin: Origin::Local,
            changes: Vec::new(),
            conflicts: Vec::new(),
            collections: vec!["photos".into()],
        }
    }

    #[test]
    fn delivers_in_order() {
        let notifier = ChangeNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = notifier.subscribe(move |e| sink.lock().push(e.sequence.as_u64()));

        for seq in 1..=3 {
            notifier.enqueue(event(seq));
        }
        notifier.drain();
        notifier.publish(event(4));
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn dropping_subscription_stops_delivery() {
        let notifier = ChangeNotifier::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let sub = notifier.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        notifier.publish(event(1));
        drop(sub);
        notifier.publish(event(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn notifier_does_not_keep_callbacks_alive() {
        let notifier = ChangeNotifier::new();
        let witness = Arc::new(());
        let held = Arc::clone(&witness);
        let sub = notifier.subscribe(move |_| {
            let _ = &held;
        });
        assert_eq!(Arc::strong_count(&witness), 2);
        notifier.unsubscribe(&sub);
        drop(sub);
        assert_eq!(Arc::strong_count(&witness), 1);
    }

    #[test]
    fn unsubscribe_during_delivery() {
        let notifier = ChangeNotifier::new();
        let second_calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let victim = Arc::clone(&slot);
        let _first = notifier.subscribe(move |_| {
            if let Some(sub) = victim.lock().as_ref() {
                sub.cancel();
            }
        });
        let counter = Arc::clone(&second_calls);
        *slot.lock() = Some(notifier.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        notifier.publish(event(1));
        notifier.publish(event(2));
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reentrant_publish_is_delivered_after_current_event() {
        let notifier = ChangeNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner = notifier.clone();
        let sink = Arc::clone(&seen);
        let _first = notifier.subscribe(move |e| {
            sink.lock().push(("first", e.sequence.as_u64()));
            if e.sequence.as_u64() == 1 {
                inner.publish(event(2));
            }
        });
        let sink = Arc::clone(&seen);
        let _second = notifier.subscribe(move |e| sink.lock().push(("second", e.sequence.as_u64())));

        notifier.publish(event(1));
        assert_eq!(
            *seen.lock(),
            vec![("first", 1), ("second", 1), ("first", 2), ("second", 2)]
        );
    }

    #[test]
    fn touches_checks_collections() {
        let e = event(1);
        assert!(e.touches(&"photos".into()));
        assert!(!e.touches(&"albums".into()));
    }
}
