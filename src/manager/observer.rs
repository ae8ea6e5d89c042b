//! Change listeners. A listener carries no payload; it re-reads the registry.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ListenerList {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

#[derive(Clone, Default)]
pub(crate) struct Observers {
    inner: Arc<Mutex<ListenerList>>,
}

fn lock(list: &Mutex<ListenerList>) -> MutexGuard<'_, ListenerList> {
    list.lock().unwrap_or_else(|p| p.into_inner())
}

impl Observers {
    pub(crate) fn subscribe(&self, listener: Listener) -> Subscription {
        let mut list = lock(&self.inner);
        list.next_id += 1;
        let id = list.next_id;
        list.listeners.push((id, listener));
        Subscription {
            id,
            list: Arc::downgrade(&self.inner),
        }
    }

    /// Calls every listener. The list is not locked while they run, so a listener may
    /// subscribe or unsubscribe.
    pub(crate) fn notify(&self) {
        let listeners: Vec<Listener> = lock(&self.inner)
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener();
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).listeners.len()
    }
}

/// Keeps a listener registered; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    list: Weak<Mutex<ListenerList>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            lock(&list).listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn unsubscribe_stops_notifications() {
        let observers = Observers::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = observers.subscribe(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        observers.notify();
        sub.unsubscribe();
        observers.notify();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(observers.len(), 0);
    }
}
