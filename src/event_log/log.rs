//! Append-only event log, newest first.

use super::bus::ObserverBus;
use crate::codec::EventSequence;
use crate::event::Event;
use crate::store::{DurableCell, KeyedStore, LoadWarning, StoreError};
use crossbeam_channel::Receiver;
use std::sync::Arc;

/// Default store key for the event log.
pub const DEFAULT_EVENT_LOG_KEY: &str = "sensor_sample_events";

/// A mutation of the event log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogChange {
    /// `event` was inserted at index 0; `count` is the new length.
    Appended { event: Event, count: usize },
    Cleared,
}

/// Ordered event log backed by one durable cell.
///
/// Cloning gives another handle to the same log.
#[derive(Clone)]
pub struct EventLog {
    cell: DurableCell<EventSequence>,
    bus: Arc<ObserverBus<LogChange>>,
}

impl EventLog {
    /// Open the log stored under `key`, creating an empty one on first launch.
    pub fn open(store: &KeyedStore, key: &str) -> Result<Self, StoreError> {
        Ok(Self {
            cell: DurableCell::open(store, key, EventSequence::default())?,
            bus: Arc::new(ObserverBus::new()),
        })
    }

    /// Insert `event` as the most recent entry.
    ///
    /// Observers have been notified by the time this returns.
    pub fn append(&self, event: Event) -> Result<(), StoreError> {
        let bus = &self.bus;
        let stored = event.clone();
        self.cell.update_then(
            move |sequence| {
                sequence.push_front(stored);
                sequence.len()
            },
            |_, count| bus.publish(&LogChange::Appended { event, count }),
        )
    }

    /// Remove every event.
    pub fn clear(&self) -> Result<(), StoreError> {
        let bus = &self.bus;
        self.cell
            .update_then(EventSequence::clear, |_, ()| bus.publish(&LogChange::Cleared))
    }

    /// Copy of the current events, newest first.
    pub fn snapshot(&self) -> Result<Vec<Event>, StoreError> {
        Ok(self.cell.read()?.into_events())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.cell.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.cell.read()?.is_empty())
    }

    /// Register a synchronous observer.
    pub fn add_observer(&self, callback: impl Fn(&LogChange) + Send + Sync + 'static) {
        self.bus.add_observer(callback);
    }

    /// Bounded queue of changes for a consumer on another thread.
    pub fn subscribe(&self, capacity: usize) -> Receiver<LogChange> {
        self.bus.subscribe(capacity)
    }

    pub fn key(&self) -> &str {
        self.cell.key()
    }

    /// Recovery performed while loading the persisted log, if any.
    pub fn load_warning(&self) -> Option<&LoadWarning> {
        self.cell.load_warning()
    }
}
