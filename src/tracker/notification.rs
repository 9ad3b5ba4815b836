//! User-facing notification surface.

use crate::event::Event;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// A local notification scheduled for near-immediate delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub badge: u64,
    pub trigger_delay: Duration,
}

impl NotificationRequest {
    /// Build the notification announcing `event`.
    pub fn for_event(event: &Event, badge: u64, trigger_delay: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: event.title(),
            body: event.to_string(),
            badge,
            trigger_delay,
        }
    }
}

/// Where notifications and the badge number are shown.
///
/// Implementations hand the request to the platform and return; delivery
/// itself is best-effort.
pub trait NotificationSurface: Send + Sync {
    fn submit(&self, request: NotificationRequest) -> Result<(), NotificationError>;

    fn set_badge(&self, badge: u64) -> Result<(), NotificationError>;
}

/// Notification errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    Rejected(String),
    Unavailable(String),
}

impl std::fmt::Display for NotificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationError::Rejected(e) => write!(f, "Notification rejected: {e}"),
            NotificationError::Unavailable(e) => write!(f, "Notifications unavailable: {e}"),
        }
    }
}

impl std::error::Error for NotificationError {}

/// Surface that writes notifications to the log. Used by the CLI.
#[derive(Debug, Default)]
pub struct LogSurface;

impl NotificationSurface for LogSurface {
    fn submit(&self, request: NotificationRequest) -> Result<(), NotificationError> {
        info!(
            id = %request.id,
            title = %request.title,
            badge = request.badge,
            delay_ms = request.trigger_delay.as_millis() as u64,
            "{}",
            request.body
        );
        Ok(())
    }

    fn set_badge(&self, badge: u64) -> Result<(), NotificationError> {
        info!(badge, "Badge updated");
        Ok(())
    }
}

/// Surface that keeps everything it is given in memory.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    submitted: Mutex<Vec<NotificationRequest>>,
    badges: Mutex<Vec<u64>>,
    reject_submissions: AtomicBool,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `submit` fail.
    pub fn reject_submissions(&self, reject: bool) {
        self.reject_submissions.store(reject, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<NotificationRequest> {
        self.submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Badge values set, oldest first.
    pub fn badges(&self) -> Vec<u64> {
        self.badges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NotificationSurface for RecordingSurface {
    fn submit(&self, request: NotificationRequest) -> Result<(), NotificationError> {
        if self.reject_submissions.load(Ordering::SeqCst) {
            return Err(NotificationError::Rejected(request.title));
        }
        self.submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        Ok(())
    }

    fn set_badge(&self, badge: u64) -> Result<(), NotificationError> {
        self.badges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(badge);
        Ok(())
    }
}
