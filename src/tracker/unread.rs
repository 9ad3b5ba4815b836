//! Count of events received while the application was not active.

use super::notification::{NotificationRequest, NotificationSurface};
use crate::event::Event;
use crate::event_log::{EventLog, LogChange};
use crate::lifecycle::AppStateHandle;
use crate::store::{DurableCell, KeyedStore, LoadWarning, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default store key for the unread counter.
pub const DEFAULT_UNREAD_COUNTER_KEY: &str = "events_received_while_in_background";

/// Tracks unread events and mirrors them to the badge.
///
/// The counter equals the number of events appended since the last
/// foreground transition while the application was not active.
pub struct UnreadTracker {
    counter: DurableCell<u64>,
    surface: Arc<dyn NotificationSurface>,
    app_state: AppStateHandle,
    trigger_delay: Duration,
}

impl UnreadTracker {
    pub fn open(
        store: &KeyedStore,
        key: &str,
        surface: Arc<dyn NotificationSurface>,
        app_state: AppStateHandle,
        trigger_delay: Duration,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            counter: DurableCell::open(store, key, 0u64)?,
            surface,
            app_state,
            trigger_delay,
        })
    }

    /// Count every event appended to `log` from now on.
    pub fn attach(self: &Arc<Self>, log: &EventLog) {
        let tracker = Arc::clone(self);
        log.add_observer(move |change| {
            if let LogChange::Appended { event, .. } = change {
                if let Err(e) = tracker.on_event_appended(event) {
                    error!(error = %e, "Failed to update unread counter");
                }
            }
        });
    }

    /// Record one appended event.
    ///
    /// Returns the new counter value, or `None` when the application is
    /// active and nothing was counted.
    pub fn on_event_appended(&self, event: &Event) -> Result<Option<u64>, StoreError> {
        if self.app_state.current().is_active() {
            return Ok(None);
        }

        let unread = self.counter.update(|n| {
            *n = n.saturating_add(1);
            *n
        })?;

        let request = NotificationRequest::for_event(event, unread, self.trigger_delay);
        debug!(id = %request.id, badge = unread, "Submitting notification");
        if let Err(e) = self.surface.submit(request) {
            warn!(error = %e, "Notification submission failed");
        }

        Ok(Some(unread))
    }

    /// Mirror the counter to the badge, then reset it.
    ///
    /// Returns the value that was mirrored.
    pub fn on_foreground(&self) -> Result<u64, StoreError> {
        let surface = &self.surface;
        self.counter.update(|n| {
            let unread = *n;
            if let Err(e) = surface.set_badge(unread) {
                warn!(error = %e, badge = unread, "Failed to set badge");
            }
            *n = 0;
            unread
        })
    }

    pub fn unread(&self) -> Result<u64, StoreError> {
        self.counter.read()
    }

    pub fn load_warning(&self) -> Option<&LoadWarning> {
        self.counter.load_warning()
    }
}
