//! Monitored sensor channels and their per-process state.

use super::query::{AggregateQuery, AggregationKind, QueryWindow, Zone, IN_BED};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const STEP_COUNT: &str = "stepCount";
pub const SLEEP_ANALYSIS: &str = "sleepAnalysis";

/// Identifier of a sensor data stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorChannel(String);

impl SensorChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn step_count() -> Self {
        Self::new(STEP_COUNT)
    }

    pub fn sleep_analysis() -> Self {
        Self::new(SLEEP_ANALYSIS)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a channel is in the observe/query cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Unauthorized,
    AuthorizationRequested,
    Authorized,
    Observing,
    QueryInFlight,
    /// Authorization was refused or failed; retried on the next foreground.
    PermissionNeeded,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Unauthorized => "unauthorized",
            ChannelState::AuthorizationRequested => "authorization requested",
            ChannelState::Authorized => "authorized",
            ChannelState::Observing => "observing",
            ChannelState::QueryInFlight => "query in flight",
            ChannelState::PermissionNeeded => "permission needed",
        };
        write!(f, "{name}")
    }
}

/// What to query for a channel on each wakeup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel: SensorChannel,
    pub window: QueryWindow,
    pub aggregation: AggregationKind,
}

impl ChannelConfig {
    /// Steps since local midnight.
    pub fn step_count_today() -> Self {
        Self {
            channel: SensorChannel::step_count(),
            window: QueryWindow::Today,
            aggregation: AggregationKind::CumulativeSum,
        }
    }

    /// Hours in bed over the trailing week.
    pub fn sleep_trailing_week() -> Self {
        Self {
            channel: SensorChannel::sleep_analysis(),
            window: QueryWindow::TrailingWeek,
            aggregation: AggregationKind::QualifyingDuration {
                qualifying_value: IN_BED,
            },
        }
    }

    pub fn query_at(&self, now: DateTime<Utc>, zone: &Zone) -> AggregateQuery {
        AggregateQuery {
            channel: self.channel.clone(),
            range: self.window.range_at(now, zone),
            aggregation: self.aggregation,
        }
    }
}

/// Live registration for one channel. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    pub channel: SensorChannel,
    pub active: bool,
    pub state: ChannelState,
}

impl ChannelSubscription {
    pub fn new(channel: SensorChannel) -> Self {
        Self {
            channel,
            active: false,
            state: ChannelState::Unauthorized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_serializes_as_plain_string() {
        let json = serde_json::to_string(&SensorChannel::step_count()).unwrap();
        assert_eq!(json, "\"stepCount\"");
    }

    #[test]
    fn test_config_builds_query() {
        let config = ChannelConfig::sleep_trailing_week();
        let now = Utc::now();
        let query = config.query_at(now, &Zone::Named(chrono_tz::UTC));

        assert_eq!(query.channel.as_str(), SLEEP_ANALYSIS);
        assert_eq!(query.range.end, now);
        assert!(query.range.start < now - chrono::Duration::days(6));
    }

    #[test]
    fn test_new_subscription_is_inactive() {
        let sub = ChannelSubscription::new(SensorChannel::step_count());
        assert!(!sub.active);
        assert_eq!(sub.state, ChannelState::Unauthorized);
    }
}
