use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::warn;

/// Listener for throttle-state changes: `(is_throttled, message)`.
pub type ThrottleObserver = Arc<dyn Fn(bool, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct ThrottleObservers {
    next_id: AtomicU64,
    observers: RwLock<Vec<(SubscriptionId, ThrottleObserver)>>,
}

impl ThrottleObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(bool, &str) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, Arc::new(observer)));
        id
    }

    /// Returns `false` if the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Invoke every observer in subscription order. The list is snapshotted
    /// first, so observers may subscribe or unsubscribe from inside a call.
    /// A panicking observer is logged and skipped.
    pub fn notify(&self, throttled: bool, message: &str) {
        let snapshot: Vec<(SubscriptionId, ThrottleObserver)> = self
            .observers
            .read()
            .iter()
            .map(|(id, observer)| (*id, Arc::clone(observer)))
            .collect();

        for (id, observer) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| observer(throttled, message))).is_err() {
                warn!(subscription = id.0, throttled, "Throttle observer panicked");
            }
        }
    }
}

impl std::fmt::Debug for ThrottleObservers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleObservers")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_subscribe_notify_unsubscribe() {
        let observers = ThrottleObservers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let id = observers.subscribe(move |throttled, message| {
            sink.lock().push((throttled, message.to_string()));
        });
        assert_eq!(observers.len(), 1);

        observers.notify(true, "slow down");
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.notify(false, "");

        assert_eq!(*seen.lock(), vec![(true, "slow down".to_string())]);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let observers = ThrottleObservers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        observers.subscribe(|throttled, _| {
            if throttled {
                panic!("observer failure");
            }
        });
        observers.subscribe(move |throttled, _| sink.lock().push(throttled));

        observers.notify(true, "limit");
        observers.notify(false, "");
        assert_eq!(*seen.lock(), vec![true, false]);
        assert_eq!(observers.len(), 2);
    }

    #[test]
    fn test_ids_are_unique() {
        let observers = ThrottleObservers::new();
        let a = observers.subscribe(|_, _| {});
        let b = observers.subscribe(|_, _| {});
        assert_ne!(a, b);
    }

    #[test]
    fn test_unsubscribe_during_notify() {
        let observers = Arc::new(ThrottleObservers::new());
        let calls = Arc::new(Mutex::new(0));

        let id = Arc::new(Mutex::new(None));
        let (inner, counter, slot) = (Arc::clone(&observers), Arc::clone(&calls), Arc::clone(&id));
        let subscribed = observers.subscribe(move |_, _| {
            *counter.lock() += 1;
            if let Some(id) = *slot.lock() {
                inner.unsubscribe(id);
            }
        });
        *id.lock() = Some(subscribed);

        observers.notify(true, "x");
        observers.notify(true, "x");
        assert_eq!(*calls.lock(), 1);
    }
}
