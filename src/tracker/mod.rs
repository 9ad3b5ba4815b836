//! Unread-count tracking and user notifications.

pub mod notification;
pub mod unread;

pub use notification::{
    LogSurface, NotificationError, NotificationRequest, NotificationSurface, RecordingSurface,
};
pub use unread::{UnreadTracker, DEFAULT_UNREAD_COUNTER_KEY};
