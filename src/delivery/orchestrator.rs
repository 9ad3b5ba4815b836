//! Background delivery orchestration.
//!
//! Requests authorization, registers one observer per channel, enables
//! background delivery, and on each wakeup runs the channel's aggregate
//! query and appends the result to the event log. Every wakeup is
//! acknowledged exactly once, whatever the query outcome.

use super::channel::{ChannelConfig, ChannelState, ChannelSubscription, SensorChannel};
use super::query::{AggregateQuery, Zone};
use super::subsystem::{BackgroundFrequency, SensorSubsystem, SubsystemError, Wakeup, WakeupStream};
use crate::event::SensorEvent;
use crate::event_log::EventLog;
use crate::lifecycle::AppStateHandle;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Exponential backoff for failed queries within one wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << cmp::min(attempt.saturating_sub(1), 20);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(cmp::min(delay, self.max_delay_ms))
    }
}

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub frequency: BackgroundFrequency,
    pub zone: Zone,
    /// `None` waits for the subsystem indefinitely.
    pub query_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            frequency: BackgroundFrequency::Immediate,
            zone: Zone::Local,
            query_timeout: Some(Duration::from_secs(60)),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of [`DeliveryOrchestrator::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Number of channels now observed.
    Observing(usize),
    /// Authorization was declined or failed.
    PermissionNeeded,
}

/// What happened to one wakeup. It was acknowledged in every case.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WakeupOutcome {
    Ingested(f64),
    QueryFailed,
    /// The channel is not monitored, or the result could not be stored.
    Rejected,
}

/// Orchestrator errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    NoChannels,
    AlreadyStarted,
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorError::NoChannels => write!(f, "No channels configured"),
            OrchestratorError::AlreadyStarted => write!(f, "Orchestrator is already running"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

struct Shared<S> {
    subsystem: Arc<S>,
    log: EventLog,
    app_state: AppStateHandle,
    policy: DeliveryPolicy,
    channels: Vec<ChannelConfig>,
    subscriptions: Mutex<HashMap<SensorChannel, ChannelSubscription>>,
}

/// Drives authorization, observation and per-wakeup queries.
pub struct DeliveryOrchestrator<S: SensorSubsystem> {
    shared: Arc<Shared<S>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: SensorSubsystem> DeliveryOrchestrator<S> {
    pub fn new(
        subsystem: Arc<S>,
        log: EventLog,
        app_state: AppStateHandle,
        channels: Vec<ChannelConfig>,
        policy: DeliveryPolicy,
    ) -> Self {
        let subscriptions = channels
            .iter()
            .map(|c| (c.channel.clone(), ChannelSubscription::new(c.channel.clone())))
            .collect();

        Self {
            shared: Arc::new(Shared {
                subsystem,
                log,
                app_state,
                policy,
                channels,
                subscriptions: Mutex::new(subscriptions),
            }),
            tasks: Vec::new(),
        }
    }

    /// Authorize, then observe every configured channel.
    ///
    /// Must run inside a tokio runtime; one task per channel processes its
    /// wakeups in arrival order.
    pub async fn start(&mut self) -> Result<StartOutcome, OrchestratorError> {
        if self.shared.channels.is_empty() {
            return Err(OrchestratorError::NoChannels);
        }
        if self.tasks.iter().any(|t| !t.is_finished()) {
            return Err(OrchestratorError::AlreadyStarted);
        }
        self.tasks.clear();

        let channels: Vec<SensorChannel> =
            self.shared.channels.iter().map(|c| c.channel.clone()).collect();

        self.shared.set_all(ChannelState::AuthorizationRequested);
        match self.shared.subsystem.request_authorization(&channels, &[]).await {
            Ok(true) => {
                info!(channels = channels.len(), "Sensor authorization granted");
                self.shared.set_all(ChannelState::Authorized);
            }
            Ok(false) => {
                warn!("Sensor authorization declined; will ask again on next foreground");
                self.shared.set_all(ChannelState::PermissionNeeded);
                return Ok(StartOutcome::PermissionNeeded);
            }
            Err(e) => {
                error!(error = %e, "Sensor authorization failed");
                self.shared.set_all(ChannelState::PermissionNeeded);
                return Ok(StartOutcome::PermissionNeeded);
            }
        }

        let mut observing = 0;
        for channel in channels {
            let stream = match self.shared.subsystem.register_observer(&channel) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Failed to register observer");
                    continue;
                }
            };

            let frequency = self.shared.policy.frequency;
            match self
                .shared
                .subsystem
                .enable_background_delivery(&channel, frequency)
                .await
            {
                Ok(()) => info!(channel = %channel, %frequency, "Background delivery enabled"),
                Err(e) => warn!(channel = %channel, error = %e, "Background delivery not enabled"),
            }

            self.shared.set_subscription(&channel, ChannelState::Observing, true);
            let shared = Arc::clone(&self.shared);
            self.tasks.push(tokio::spawn(async move {
                shared.pump(channel, stream).await;
            }));
            observing += 1;
        }

        Ok(StartOutcome::Observing(observing))
    }

    /// Retry authorization if an earlier attempt left channels waiting
    /// for permission. Returns `None` when nothing needed retrying.
    pub async fn on_foreground(&mut self) -> Result<Option<StartOutcome>, OrchestratorError> {
        let needs_permission = self
            .states()
            .iter()
            .any(|(_, state)| *state == ChannelState::PermissionNeeded);
        if !needs_permission {
            return Ok(None);
        }
        debug!("Retrying sensor authorization");
        self.start().await.map(Some)
    }

    /// Process one wakeup and acknowledge it.
    pub async fn handle_wakeup(&self, wakeup: Wakeup) -> WakeupOutcome {
        self.shared.handle_wakeup(wakeup).await
    }

    pub fn channel_state(&self, channel: &SensorChannel) -> Option<ChannelState> {
        self.shared.lock_subscriptions().get(channel).map(|s| s.state)
    }

    /// All channel states, sorted by channel.
    pub fn states(&self) -> Vec<(SensorChannel, ChannelState)> {
        let mut states: Vec<_> = self
            .shared
            .lock_subscriptions()
            .values()
            .map(|s| (s.channel.clone(), s.state))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn subscriptions(&self) -> Vec<ChannelSubscription> {
        let mut subs: Vec<_> = self.shared.lock_subscriptions().values().cloned().collect();
        subs.sort_by(|a, b| a.channel.cmp(&b.channel));
        subs
    }

    /// Stop processing wakeups. Any wakeup cancelled mid-query is
    /// acknowledged as its task unwinds.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let mut subs = self.shared.lock_subscriptions();
        for sub in subs.values_mut() {
            if sub.active {
                sub.active = false;
                sub.state = ChannelState::Authorized;
            }
        }
        info!("Delivery orchestrator stopped");
    }
}

impl<S: SensorSubsystem> Drop for DeliveryOrchestrator<S> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl<S: SensorSubsystem> Shared<S> {
    async fn pump(&self, channel: SensorChannel, mut stream: WakeupStream) {
        while let Some(wakeup) = stream.recv().await {
            self.handle_wakeup(wakeup).await;
        }
        debug!(channel = %channel, "Wakeup stream closed");
        self.set_subscription(&channel, ChannelState::Authorized, false);
    }

    async fn handle_wakeup(&self, wakeup: Wakeup) -> WakeupOutcome {
        let (channel, ack) = wakeup.into_parts();
        let outcome = self.process(&channel).await;
        ack.acknowledge();
        debug!(channel = %channel, ?outcome, "Wakeup acknowledged");
        outcome
    }

    async fn process(&self, channel: &SensorChannel) -> WakeupOutcome {
        let Some(config) = self.channels.iter().find(|c| &c.channel == channel) else {
            warn!(channel = %channel, "Wakeup for unmonitored channel");
            return WakeupOutcome::Rejected;
        };

        let observing = matches!(
            self.lock_subscriptions().get(channel).map(|s| s.state),
            Some(ChannelState::Observing | ChannelState::QueryInFlight)
        );
        if !observing {
            warn!(channel = %channel, "Wakeup for channel that is not being observed");
            return WakeupOutcome::Rejected;
        }

        self.set_state(channel, ChannelState::QueryInFlight);
        let query = config.query_at(Utc::now(), &self.policy.zone);
        let result = self.query_with_retry(&query).await;
        self.set_state(channel, ChannelState::Observing);

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                error!(channel = %channel, error = %e, "Query failed; waiting for next wakeup");
                return WakeupOutcome::QueryFailed;
            }
        };

        let event = match SensorEvent::with_value(channel.as_str(), self.app_state.current(), value) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Discarding query result");
                return WakeupOutcome::Rejected;
            }
        };

        // Appending persists synchronously and runs the log's observers.
        let log = self.log.clone();
        match tokio::task::spawn_blocking(move || log.append(event.into())).await {
            Ok(Ok(())) => {
                info!(channel = %channel, value, "Ingested sensor event");
                WakeupOutcome::Ingested(value)
            }
            Ok(Err(e)) => {
                error!(channel = %channel, error = %e, "Failed to append event");
                WakeupOutcome::Rejected
            }
            Err(e) => {
                error!(channel = %channel, error = %e, "Append task failed");
                WakeupOutcome::Rejected
            }
        }
    }

    async fn query_with_retry(&self, query: &AggregateQuery) -> Result<f64, SubsystemError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.policy.query_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, self.subsystem.run_aggregate_query(query)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(SubsystemError::Timeout {
                            channel: query.channel.clone(),
                            after: limit,
                        }),
                    }
                }
                None => self.subsystem.run_aggregate_query(query).await,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt <= self.policy.retry.max_retries => {
                    let delay = self.policy.retry.delay_for(attempt);
                    warn!(
                        channel = %query.channel,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Query failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn lock_subscriptions(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SensorChannel, ChannelSubscription>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, channel: &SensorChannel, state: ChannelState) {
        if let Some(sub) = self.lock_subscriptions().get_mut(channel) {
            sub.state = state;
        }
    }

    fn set_subscription(&self, channel: &SensorChannel, state: ChannelState, active: bool) {
        if let Some(sub) = self.lock_subscriptions().get_mut(channel) {
            sub.state = state;
            sub.active = active;
        }
    }

    fn set_all(&self, state: ChannelState) {
        for sub in self.lock_subscriptions().values_mut() {
            sub.state = state;
        }
    }
}
