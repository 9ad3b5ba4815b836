//! In-process sensor subsystem.
//!
//! Lets the crate (and binary) run without a platform health store:
//! samples and scripted results are fed in by the caller, and wakeups are
//! fired on demand.

use super::channel::SensorChannel;
use super::query::{
    cumulative_sum, total_qualifying_hours, AggregateQuery, AggregationKind, CategorySample,
    QuantitySample,
};
use super::subsystem::{BackgroundFrequency, SensorSubsystem, SubsystemError, Wakeup, WakeupStream};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

const WAKEUP_BUFFER: usize = 64;

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A sensor subsystem backed by in-memory samples.
#[derive(Debug, Default)]
pub struct SimulatedSubsystem {
    grant: AtomicBool,
    authorization_requests: AtomicUsize,
    observers: Mutex<HashMap<SensorChannel, mpsc::Sender<Wakeup>>>,
    background: Mutex<Vec<(SensorChannel, BackgroundFrequency)>>,
    scripted: Mutex<HashMap<SensorChannel, VecDeque<Result<f64, SubsystemError>>>>,
    quantities: Mutex<HashMap<SensorChannel, Vec<QuantitySample>>>,
    categories: Mutex<HashMap<SensorChannel, Vec<CategorySample>>>,
    queries: Mutex<Vec<AggregateQuery>>,
    acks: Arc<Mutex<HashMap<SensorChannel, usize>>>,
}

impl SimulatedSubsystem {
    /// `grant` decides how authorization requests are answered.
    pub fn new(grant: bool) -> Self {
        Self {
            grant: AtomicBool::new(grant),
            ..Self::default()
        }
    }

    pub fn set_authorization(&self, grant: bool) {
        self.grant.store(grant, Ordering::SeqCst);
    }

    pub fn authorization_requests(&self) -> usize {
        self.authorization_requests.load(Ordering::SeqCst)
    }

    /// Queue a result for the next query on `channel`. Scripted results
    /// take precedence over recorded samples.
    pub fn script_result(&self, channel: SensorChannel, result: Result<f64, SubsystemError>) {
        locked(&self.scripted).entry(channel).or_default().push_back(result);
    }

    pub fn record_quantity(&self, channel: SensorChannel, at: DateTime<Utc>, amount: f64) {
        locked(&self.quantities)
            .entry(channel)
            .or_default()
            .push(QuantitySample { at, amount });
    }

    pub fn record_category(&self, channel: SensorChannel, sample: CategorySample) {
        locked(&self.categories).entry(channel).or_default().push(sample);
    }

    /// Build a wakeup whose acknowledgment is counted here.
    pub fn wakeup(&self, channel: SensorChannel) -> Wakeup {
        let acks = Arc::clone(&self.acks);
        let counted = channel.clone();
        Wakeup::new(channel, move || {
            *locked(&acks).entry(counted).or_insert(0) += 1;
        })
    }

    /// Deliver a wakeup to the observer registered for `channel`.
    pub fn fire(&self, channel: &SensorChannel) -> Result<(), SubsystemError> {
        let sender = locked(&self.observers).get(channel).cloned().ok_or_else(|| {
            SubsystemError::Unavailable(format!("no observer registered for {channel}"))
        })?;
        sender
            .try_send(self.wakeup(channel.clone()))
            .map_err(|e| SubsystemError::Unavailable(format!("wakeup not delivered: {e}")))
    }

    pub fn acknowledgments(&self, channel: &SensorChannel) -> usize {
        locked(&self.acks).get(channel).copied().unwrap_or(0)
    }

    /// Every query run so far, oldest first.
    pub fn queries(&self) -> Vec<AggregateQuery> {
        locked(&self.queries).clone()
    }

    pub fn background_deliveries(&self) -> Vec<(SensorChannel, BackgroundFrequency)> {
        locked(&self.background).clone()
    }

    pub fn observed_channels(&self) -> Vec<SensorChannel> {
        let mut channels: Vec<_> = locked(&self.observers).keys().cloned().collect();
        channels.sort();
        channels
    }

    fn evaluate(&self, query: &AggregateQuery) -> Result<f64, SubsystemError> {
        if let Some(result) = locked(&self.scripted)
            .get_mut(&query.channel)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }

        match query.aggregation {
            AggregationKind::CumulativeSum => {
                let quantities = locked(&self.quantities);
                let samples = quantities.get(&query.channel).map(Vec::as_slice).unwrap_or(&[]);
                Ok(cumulative_sum(samples, &query.range))
            }
            AggregationKind::QualifyingDuration { qualifying_value } => {
                let categories = locked(&self.categories);
                let in_range: Vec<CategorySample> = categories
                    .get(&query.channel)
                    .map(|samples| {
                        samples
                            .iter()
                            .filter(|s| query.range.contains(s.end))
                            .copied()
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(total_qualifying_hours(&in_range, qualifying_value))
            }
        }
    }
}

impl SensorSubsystem for SimulatedSubsystem {
    async fn request_authorization(
        &self,
        read: &[SensorChannel],
        _write: &[SensorChannel],
    ) -> Result<bool, SubsystemError> {
        self.authorization_requests.fetch_add(1, Ordering::SeqCst);
        debug!(channels = read.len(), "Authorization requested");
        Ok(self.grant.load(Ordering::SeqCst))
    }

    fn register_observer(&self, channel: &SensorChannel) -> Result<WakeupStream, SubsystemError> {
        let (sender, receiver) = mpsc::channel(WAKEUP_BUFFER);
        locked(&self.observers).insert(channel.clone(), sender);
        Ok(receiver)
    }

    async fn enable_background_delivery(
        &self,
        channel: &SensorChannel,
        frequency: BackgroundFrequency,
    ) -> Result<(), SubsystemError> {
        locked(&self.background).push((channel.clone(), frequency));
        Ok(())
    }

    async fn run_aggregate_query(&self, query: &AggregateQuery) -> Result<f64, SubsystemError> {
        locked(&self.queries).push(query.clone());
        self.evaluate(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::query::{QueryWindow, Zone, IN_BED};
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_sums_recorded_quantities() {
        let sim = SimulatedSubsystem::new(true);
        let now = Utc::now();
        let channel = SensorChannel::step_count();
        sim.record_quantity(channel.clone(), now, 1200.0);
        sim.record_quantity(channel.clone(), now - chrono::Duration::days(3), 9999.0);

        let query = AggregateQuery {
            channel,
            range: QueryWindow::Today.range_at(now, &Zone::Named(chrono_tz::UTC)),
            aggregation: AggregationKind::CumulativeSum,
        };
        assert_eq!(sim.run_aggregate_query(&query).await.unwrap(), 1200.0);
        assert_eq!(sim.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_sleep_hours_from_recorded_samples() {
        let sim = SimulatedSubsystem::new(true);
        let channel = SensorChannel::sleep_analysis();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap();
        sim.record_category(
            channel.clone(),
            CategorySample {
                start,
                end: start + chrono::Duration::hours(7),
                value: IN_BED,
            },
        );
        sim.record_category(
            channel.clone(),
            CategorySample {
                start,
                end: start + chrono::Duration::hours(2),
                value: 1,
            },
        );

        let query = AggregateQuery {
            channel,
            range: QueryWindow::TrailingWeek.range_at(
                start + chrono::Duration::days(1),
                &Zone::Named(chrono_tz::UTC),
            ),
            aggregation: AggregationKind::QualifyingDuration {
                qualifying_value: IN_BED,
            },
        };
        assert_eq!(sim.run_aggregate_query(&query).await.unwrap(), 7.0);
    }

    #[tokio::test]
    async fn test_fire_requires_observer() {
        let sim = SimulatedSubsystem::new(true);
        let channel = SensorChannel::step_count();
        assert!(sim.fire(&channel).is_err());

        let mut stream = sim.register_observer(&channel).unwrap();
        sim.fire(&channel).unwrap();

        let wakeup = stream.recv().await.unwrap();
        assert_eq!(wakeup.channel(), &channel);
        let (_, ack) = wakeup.into_parts();
        ack.acknowledge();
        assert_eq!(sim.acknowledgments(&channel), 1);
        assert_eq!(sim.observed_channels(), vec![channel]);
    }
}
