//! Non-blocking listener fan-out
//!
//! Each listener gets its own unbounded channel and delivery task, so a slow
//! or panicking listener never delays the producer or the other listeners.
//! Values reach a single listener in the order they were emitted.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

type Senders<T> = BTreeMap<u64, mpsc::UnboundedSender<T>>;

#[derive(Debug)]
struct Registry<T> {
    next_id: u64,
    senders: Senders<T>,
}

/// Set of subscribed listeners for values of type `T`
#[derive(Debug)]
pub struct Listeners<T> {
    registry: Arc<Mutex<Registry<T>>>,
    label: &'static str,
}

impl<T> Listeners<T>
where
    T: Clone + Send + 'static,
{
    /// `label` names the producer in listener panic logs
    pub fn new(label: &'static str) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                senders: BTreeMap::new(),
            })),
            label,
        }
    }

    /// Register a listener
    ///
    /// Delivery runs on a Tokio task when called inside a runtime and on a
    /// dedicated thread otherwise.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = match self.registry.lock() {
            Ok(mut registry) => {
                let id = registry.next_id;
                registry.next_id += 1;
                registry.senders.insert(id, tx);
                Some(id)
            }
            Err(_) => {
                tracing::warn!(producer = self.label, "listener registry poisoned; dropping listener");
                None
            }
        };

        spawn_delivery(self.label, rx, listener);

        let registry: Weak<Mutex<dyn Unregister>> = {
            let strong: Arc<Mutex<dyn Unregister>> = self.registry.clone();
            Arc::downgrade(&strong)
        };
        Subscription { registry, id }
    }

    /// Queue `value` for every listener; never blocks
    pub fn emit(&self, value: &T) {
        let Ok(mut registry) = self.registry.lock() else {
            return;
        };
        registry
            .senders
            .retain(|_, sender| sender.send(value.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .map(|registry| registry.senders.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn spawn_delivery<T, F>(label: &'static str, mut rx: mpsc::UnboundedReceiver<T>, mut listener: F)
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    let mut deliver = move |value: T| {
        if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
            tracing::warn!(producer = label, "listener panicked; continuing delivery");
        }
    };

    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            while let Some(value) = rx.recv().await {
                deliver(value);
            }
        });
    } else {
        std::thread::spawn(move || {
            while let Some(value) = rx.blocking_recv() {
                deliver(value);
            }
        });
    }
}

trait Unregister: Send {
    fn unregister(&mut self, id: u64);
}

impl<T: Send> Unregister for Registry<T> {
    fn unregister(&mut self, id: u64) {
        self.senders.remove(&id);
    }
}

/// Handle returned by `subscribe`; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    registry: Weak<Mutex<dyn Unregister>>,
    id: Option<u64>,
}

impl Subscription {
    /// Stop delivery; values already queued may still arrive
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the listener registered for the producer's lifetime
    pub fn detach(mut self) {
        self.id = None;
    }

    fn release(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.lock() {
                registry.unregister(id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    async fn recv(rx: &mut mpsc::UnboundedReceiver<u32>) -> Option<u32> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn delivers_in_emit_order() {
        let listeners = Listeners::new("test");
        let (tx, mut rx) = unbounded_channel();
        let _subscription = listeners.subscribe(move |value: u32| {
            let _ = tx.send(value);
        });

        for value in 1..=3 {
            listeners.emit(&value);
        }

        assert_eq!(recv(&mut rx).await, Some(1));
        assert_eq!(recv(&mut rx).await, Some(2));
        assert_eq!(recv(&mut rx).await, Some(3));
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_delivery() {
        let listeners = Listeners::new("test");
        let (tx, mut rx) = unbounded_channel();
        let _panicky = listeners.subscribe(|value: u32| {
            assert!(value != 1, "boom");
        });
        let _healthy = listeners.subscribe(move |value: u32| {
            let _ = tx.send(value);
        });

        listeners.emit(&1);
        listeners.emit(&2);

        assert_eq!(recv(&mut rx).await, Some(1));
        assert_eq!(recv(&mut rx).await, Some(2));
        assert_eq!(listeners.len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let listeners = Listeners::new("test");
        let (tx, mut rx) = unbounded_channel();
        let subscription = listeners.subscribe(move |value: u32| {
            let _ = tx.send(value);
        });

        subscription.unsubscribe();
        assert!(listeners.is_empty());

        listeners.emit(&7);
        assert_eq!(recv(&mut rx).await, None);
    }

    #[tokio::test]
    async fn detached_subscription_outlives_handle() {
        let listeners = Listeners::new("test");
        let (tx, mut rx) = unbounded_channel();
        listeners
            .subscribe(move |value: u32| {
                let _ = tx.send(value);
            })
            .detach();

        listeners.emit(&9);
        assert_eq!(recv(&mut rx).await, Some(9));
    }

    #[test]
    fn delivers_without_runtime() {
        let listeners = Listeners::new("test");
        let (tx, rx) = std::sync::mpsc::channel();
        let _subscription = listeners.subscribe(move |value: u32| {
            let _ = tx.send(value);
        });

        listeners.emit(&5);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(5));
    }
}
