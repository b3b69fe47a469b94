use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Receives a call whenever the set of associated content changes.
pub trait ContentObserver: Send + Sync {
    fn on_associated_content_changed(&self);
}

/// Observers held weakly, so a subscriber that owns the manager does not
/// keep itself alive.
#[derive(Default)]
pub(crate) struct ObserverList {
    next_id: AtomicU64,
    observers: Mutex<Vec<(u64, Weak<dyn ContentObserver>)>>,
}

impl ObserverList {
    pub(crate) fn add(self: &Arc<Self>, observer: Weak<dyn ContentObserver>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, observer));
        Subscription {
            list: Arc::downgrade(self),
            id,
        }
    }

    fn remove(&self, id: u64) {
        self.observers.lock().retain(|(oid, _)| *oid != id);
    }

    /// Call live observers outside the lock; prune dead ones.
    pub(crate) fn notify(&self) {
        let live: Vec<Arc<dyn ContentObserver>> = {
            let mut observers = self.observers.lock();
            observers.retain(|(_, o)| o.strong_count() > 0);
            observers.iter().filter_map(|(_, o)| o.upgrade()).collect()
        };
        for observer in live {
            observer.on_associated_content_changed();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.observers.lock().len()
    }
}

/// Unsubscribes on drop.
pub struct Subscription {
    list: Weak<ObserverList>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter(AtomicUsize);

    impl ContentObserver for Counter {
        fn on_associated_content_changed(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let list = Arc::new(ObserverList::default());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let weak: Weak<dyn ContentObserver> = Arc::downgrade(&counter) as Weak<dyn ContentObserver>;
        let sub = list.add(weak);
        list.notify();
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);

        drop(sub);
        assert_eq!(list.len(), 0);
        list.notify();
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dead_observers_are_pruned() {
        let list = Arc::new(ObserverList::default());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let weak: Weak<dyn ContentObserver> = Arc::downgrade(&counter) as Weak<dyn ContentObserver>;
        let _sub = list.add(weak);
        drop(counter);
        list.notify();
        assert_eq!(list.len(), 0);
    }
}
