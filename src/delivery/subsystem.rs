//! Boundary to the platform sensor subsystem.
//!
//! The subsystem owns authorization, change observation, background
//! delivery and aggregate queries. Each observer notification arrives as a
//! [`Wakeup`] whose acknowledgment must be signalled exactly once.

use super::channel::SensorChannel;
use super::query::AggregateQuery;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// How often the subsystem may wake the process for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundFrequency {
    Immediate,
    Hourly,
    Daily,
    Weekly,
}

impl fmt::Display for BackgroundFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackgroundFrequency::Immediate => "immediate",
            BackgroundFrequency::Hourly => "hourly",
            BackgroundFrequency::Daily => "daily",
            BackgroundFrequency::Weekly => "weekly",
        };
        write!(f, "{name}")
    }
}

/// Completion signal owed to the subsystem for one wakeup.
///
/// Consumed by [`WakeupAck::acknowledge`]. If dropped unacknowledged (for
/// example when a task is cancelled mid-query) the signal fires on drop.
pub struct WakeupAck {
    channel: SensorChannel,
    complete: Option<Box<dyn FnOnce() + Send>>,
}

impl WakeupAck {
    pub fn new(channel: SensorChannel, complete: impl FnOnce() + Send + 'static) -> Self {
        Self {
            channel,
            complete: Some(Box::new(complete)),
        }
    }

    pub fn acknowledge(mut self) {
        if let Some(complete) = self.complete.take() {
            complete();
        }
    }
}

impl Drop for WakeupAck {
    fn drop(&mut self) {
        if let Some(complete) = self.complete.take() {
            warn!(channel = %self.channel, "Wakeup dropped without acknowledgment");
            complete();
        }
    }
}

impl fmt::Debug for WakeupAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeupAck")
            .field("channel", &self.channel)
            .field("pending", &self.complete.is_some())
            .finish()
    }
}

/// "New data may exist for this channel."
#[derive(Debug)]
pub struct Wakeup {
    channel: SensorChannel,
    ack: WakeupAck,
}

impl Wakeup {
    pub fn new(channel: SensorChannel, complete: impl FnOnce() + Send + 'static) -> Self {
        Self {
            ack: WakeupAck::new(channel.clone(), complete),
            channel,
        }
    }

    pub fn channel(&self) -> &SensorChannel {
        &self.channel
    }

    pub fn into_parts(self) -> (SensorChannel, WakeupAck) {
        (self.channel, self.ack)
    }
}

/// Stream of wakeups for one registered observer.
pub type WakeupStream = mpsc::Receiver<Wakeup>;

/// Sensor subsystem operations used by the delivery orchestrator.
pub trait SensorSubsystem: Send + Sync + 'static {
    /// Ask for read (and optionally write) access. `Ok(false)` means the
    /// user declined.
    fn request_authorization(
        &self,
        read: &[SensorChannel],
        write: &[SensorChannel],
    ) -> impl Future<Output = Result<bool, SubsystemError>> + Send;

    /// Register a long-lived change observer for `channel`.
    fn register_observer(&self, channel: &SensorChannel) -> Result<WakeupStream, SubsystemError>;

    fn enable_background_delivery(
        &self,
        channel: &SensorChannel,
        frequency: BackgroundFrequency,
    ) -> impl Future<Output = Result<(), SubsystemError>> + Send;

    /// Reduce the samples matching `query` to one scalar.
    fn run_aggregate_query(
        &self,
        query: &AggregateQuery,
    ) -> impl Future<Output = Result<f64, SubsystemError>> + Send;
}

/// Errors reported by, or while talking to, the sensor subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubsystemError {
    Authorization(String),
    Registration { channel: SensorChannel, message: String },
    BackgroundDelivery { channel: SensorChannel, message: String },
    Query { channel: SensorChannel, message: String },
    Timeout { channel: SensorChannel, after: Duration },
    Unavailable(String),
}

impl fmt::Display for SubsystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubsystemError::Authorization(e) => write!(f, "Authorization failed: {e}"),
            SubsystemError::Registration { channel, message } => {
                write!(f, "Observer registration for {channel} failed: {message}")
            }
            SubsystemError::BackgroundDelivery { channel, message } => {
                write!(f, "Background delivery for {channel} failed: {message}")
            }
            SubsystemError::Query { channel, message } => {
                write!(f, "Query for {channel} failed: {message}")
            }
            SubsystemError::Timeout { channel, after } => {
                write!(f, "Query for {channel} timed out after {}ms", after.as_millis())
            }
            SubsystemError::Unavailable(e) => write!(f, "Sensor subsystem unavailable: {e}"),
        }
    }
}

impl std::error::Error for SubsystemError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_wakeup(count: &Arc<AtomicUsize>) -> Wakeup {
        let count = Arc::clone(count);
        Wakeup::new(SensorChannel::step_count(), move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_acknowledge_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let (channel, ack) = counting_wakeup(&count).into_parts();
        assert_eq!(channel, SensorChannel::step_count());

        ack.acknowledge();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_acknowledges() {
        let count = Arc::new(AtomicUsize::new(0));
        drop(counting_wakeup(&count));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
