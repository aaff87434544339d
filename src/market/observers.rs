use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

struct Subscriber<E> {
    id: u64,
    sender: UnboundedSender<E>,
}

/// Fan-out of events to registered handlers. Each handler drains its own
/// queue on a dedicated task, so `emit` never waits on handler work.
pub struct ObserverSet<E> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber<E>>>,
}

impl<E> Default for ObserverSet<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone + Send + 'static> ObserverSet<E> {
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F>(self: &Arc<Self>, mut handler: F) -> ObserverHandle<E>
    where
        F: FnMut(E) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = unbounded_channel::<E>();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                handler(event);
            }
        });

        self.subscribers.lock().push(Subscriber { id, sender });
        ObserverHandle {
            id,
            set: Arc::downgrade(self),
        }
    }

    pub fn emit(&self, event: E) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| subscriber.sender.send(event.clone()).is_ok());
    }

    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        subscribers.len() != before
    }
}

/// De-registration handle. Dropping it keeps the subscription alive.
pub struct ObserverHandle<E> {
    id: u64,
    set: Weak<ObserverSet<E>>,
}

impl<E: Clone + Send + 'static> ObserverHandle<E> {
    /// Returns `false` when the subscription was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.set.upgrade() {
            Some(set) => set.remove(self.id),
            None => false,
        }
    }
}
