//! Host application lifecycle signals.

use crate::event::{AppState, LifecycleEvent};
use crate::event_log::EventLog;
use crate::store::StoreError;
use crate::tracker::UnreadTracker;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const BECAME_ACTIVE: &str = "Application became active";
const ENTERED_BACKGROUND: &str = "Application entered background";

/// Shared view of the current application state.
#[derive(Debug, Clone)]
pub struct AppStateHandle(Arc<AtomicU8>);

impl AppStateHandle {
    pub fn new(initial: AppState) -> Self {
        Self(Arc::new(AtomicU8::new(encode(initial))))
    }

    pub fn current(&self) -> AppState {
        decode(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: AppState) {
        self.0.store(encode(state), Ordering::SeqCst);
    }
}

impl Default for AppStateHandle {
    fn default() -> Self {
        Self::new(AppState::Active)
    }
}

fn encode(state: AppState) -> u8 {
    state.raw_value() as u8
}

fn decode(raw: u8) -> AppState {
    AppState::from_raw_value(i64::from(raw)).unwrap_or(AppState::Background)
}

/// Reacts to foreground, background and memory-pressure signals.
pub struct LifecycleController {
    app_state: AppStateHandle,
    tracker: Arc<UnreadTracker>,
    log: EventLog,
    record_events: bool,
}

impl LifecycleController {
    pub fn new(
        app_state: AppStateHandle,
        tracker: Arc<UnreadTracker>,
        log: EventLog,
        record_events: bool,
    ) -> Self {
        Self {
            app_state,
            tracker,
            log,
            record_events,
        }
    }

    /// The application came to the foreground.
    ///
    /// Returns the unread count that was mirrored to the badge before reset.
    /// A host that also runs a delivery orchestrator should go through
    /// [`IngestCore::enter_foreground`](crate::IngestCore::enter_foreground)
    /// so declined authorization is requested again.
    pub fn on_foreground(&self) -> Result<u64, StoreError> {
        self.app_state.set(AppState::Active);
        let mirrored = self.tracker.on_foreground()?;
        if self.record_events {
            self.log.append(LifecycleEvent::new(BECAME_ACTIVE).into())?;
        }
        info!(unread = mirrored, "Entered foreground");
        Ok(mirrored)
    }

    /// The application moved to the background.
    ///
    /// The lifecycle event is recorded under the state being left.
    pub fn on_background(&self) -> Result<(), StoreError> {
        if self.record_events {
            self.log.append(LifecycleEvent::new(ENTERED_BACKGROUND).into())?;
        }
        self.app_state.set(AppState::Background);
        info!("Entered background");
        Ok(())
    }

    pub fn on_memory_pressure(&self) {
        warn!("Memory pressure signal received");
    }

    pub fn app_state(&self) -> &AppStateHandle {
        &self.app_state
    }
}
