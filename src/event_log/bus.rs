//! In-process observer bus.
//!
//! Two delivery modes:
//!
//! - **Callbacks** run synchronously on the publishing thread, in
//!   registration order, before `publish` returns. They must be quick; any
//!   slow work belongs on another thread.
//! - **Queues** are bounded crossbeam channels for consumers on another
//!   thread. A full queue drops the message rather than blocking the
//!   publisher; a queue whose receiver was dropped is pruned.
//!
//! There is no unsubscribe for callbacks: observers live as long as the bus.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::warn;

type Callback<E> = Box<dyn Fn(&E) + Send + Sync>;

pub struct ObserverBus<E> {
    callbacks: RwLock<Vec<Callback<E>>>,
    queues: Mutex<Vec<Sender<E>>>,
}

impl<E: Clone + Send + 'static> ObserverBus<E> {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            queues: Mutex::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, callback: impl Fn(&E) + Send + Sync + 'static) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Get a bounded queue receiving every published message.
    pub fn subscribe(&self, capacity: usize) -> Receiver<E> {
        let (tx, rx) = bounded(capacity.max(1));
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, message: &E) {
        for callback in self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            callback(message);
        }

        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| match tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("Observer queue full, dropping log change");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    pub fn observer_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn queue_count(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<E: Clone + Send + 'static> Default for ObserverBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_callbacks_run_before_publish_returns() {
        let bus = ObserverBus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = seen.clone();
        let second = seen.clone();
        bus.add_observer(move |m| first.lock().unwrap().push(("first", *m)));
        bus.add_observer(move |m| second.lock().unwrap().push(("second", *m)));

        bus.publish(&7);

        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let bus = ObserverBus::<u32>::new();
        let rx = bus.subscribe(1);

        bus.publish(&1);
        bus.publish(&2);

        assert_eq!(rx.try_recv(), Ok(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.queue_count(), 1);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let bus = ObserverBus::<u32>::new();
        let rx = bus.subscribe(4);
        drop(rx);

        bus.publish(&1);
        assert_eq!(bus.queue_count(), 0);
    }
}
