//! End-to-end ingestion scenarios over the simulated subsystem.

use health_event_agent::delivery::{
    ChannelState, DeliveryPolicy, StartOutcome, SubsystemError, WakeupOutcome, Zone,
};
use health_event_agent::store::MemoryBackend;
use health_event_agent::{
    AppState, ChannelConfig, Config, DeliveryOrchestrator, Event, IngestCore, KeyedStore,
    PlistValue, RecordingSurface, SensorChannel, SensorEvent, SensorSubsystem, SimulatedSubsystem,
};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> Config {
    Config {
        timezone: Some("UTC".to_string()),
        ..Config::default()
    }
}

fn core_with(store: KeyedStore) -> (IngestCore, Arc<RecordingSurface>) {
    let surface = Arc::new(RecordingSurface::new());
    let core = IngestCore::assemble(store, &test_config(), surface.clone()).unwrap();
    (core, surface)
}

async fn wait_for_acks(sim: &SimulatedSubsystem, channel: &SensorChannel, expected: usize) {
    for _ in 0..500 {
        if sim.acknowledgments(channel) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {expected} acknowledgments, saw {}",
        sim.acknowledgments(channel)
    );
}

#[tokio::test]
async fn test_background_wakeup_logs_counts_and_notifies() {
    let (core, surface) = core_with(KeyedStore::in_memory());
    let sim = Arc::new(SimulatedSubsystem::new(true));
    let mut orchestrator = core.orchestrator(Arc::clone(&sim), &test_config()).unwrap();

    assert_eq!(orchestrator.start().await.unwrap(), StartOutcome::Observing(2));
    core.app_state().set(AppState::Background);

    let steps = SensorChannel::step_count();
    sim.script_result(steps.clone(), Ok(1500.0));
    sim.fire(&steps).unwrap();
    wait_for_acks(&sim, &steps, 1).await;

    let events = core.log().snapshot().unwrap();
    assert_eq!(events.len(), 1);
    match &events[0] {
        Event::Sensor(e) => {
            assert_eq!(e.sample_type(), "stepCount");
            assert_eq!(e.value(), Some(1500.0));
            assert_eq!(e.app_state(), AppState::Background);
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert_eq!(core.tracker().unread().unwrap(), 1);
    let submitted = surface.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].badge, 1);
    assert_eq!(submitted[0].title, "stepCount");

    orchestrator.shutdown();
}

#[tokio::test]
async fn test_foreground_mirrors_badge_then_resets() {
    let store = KeyedStore::with_backend(MemoryBackend::new().with_entry(
        "events_received_while_in_background",
        PlistValue::Integer(4),
    ));
    let (core, surface) = core_with(store);
    assert_eq!(core.tracker().unread().unwrap(), 4);

    let mirrored = core.lifecycle().on_foreground().unwrap();

    assert_eq!(mirrored, 4);
    assert_eq!(surface.badges(), vec![4]);
    assert_eq!(core.tracker().unread().unwrap(), 0);
}

#[tokio::test]
async fn test_failed_query_acknowledges_exactly_once() {
    let (core, _surface) = core_with(KeyedStore::in_memory());
    let sim = Arc::new(SimulatedSubsystem::new(true));
    let mut orchestrator = core.orchestrator(Arc::clone(&sim), &test_config()).unwrap();
    orchestrator.start().await.unwrap();

    let sleep = SensorChannel::sleep_analysis();
    sim.script_result(
        sleep.clone(),
        Err(SubsystemError::Query {
            channel: sleep.clone(),
            message: "database inaccessible".to_string(),
        }),
    );
    sim.fire(&sleep).unwrap();
    wait_for_acks(&sim, &sleep, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(sim.acknowledgments(&sleep), 1);
    assert!(core.log().is_empty().unwrap());
    assert_eq!(orchestrator.channel_state(&sleep), Some(ChannelState::Observing));

    orchestrator.shutdown();
}

#[tokio::test]
async fn test_query_timeout_is_a_failure_and_still_acknowledged() {
    let store = KeyedStore::in_memory();
    let log = health_event_agent::EventLog::open(&store, "log").unwrap();
    let sim = Arc::new(SlowSubsystem {
        inner: SimulatedSubsystem::new(true),
    });
    let policy = DeliveryPolicy {
        zone: Zone::Named(chrono_tz::UTC),
        query_timeout: Some(Duration::from_millis(20)),
        ..DeliveryPolicy::default()
    };
    let mut orchestrator = DeliveryOrchestrator::new(
        Arc::clone(&sim),
        log.clone(),
        health_event_agent::AppStateHandle::default(),
        vec![ChannelConfig::step_count_today()],
        policy,
    );
    orchestrator.start().await.unwrap();

    let outcome = orchestrator
        .handle_wakeup(sim.inner.wakeup(SensorChannel::step_count()))
        .await;

    assert_eq!(outcome, WakeupOutcome::QueryFailed);
    assert_eq!(sim.inner.acknowledgments(&SensorChannel::step_count()), 1);
    assert!(log.is_empty().unwrap());
}

#[tokio::test]
async fn test_shutdown_acknowledges_in_flight_and_queued_wakeups() {
    let store = KeyedStore::in_memory();
    let log = health_event_agent::EventLog::open(&store, "log").unwrap();
    let sim = Arc::new(SlowSubsystem {
        inner: SimulatedSubsystem::new(true),
    });
    let policy = DeliveryPolicy {
        zone: Zone::Named(chrono_tz::UTC),
        query_timeout: None,
        ..DeliveryPolicy::default()
    };
    let mut orchestrator = DeliveryOrchestrator::new(
        Arc::clone(&sim),
        log.clone(),
        health_event_agent::AppStateHandle::default(),
        vec![ChannelConfig::step_count_today()],
        policy,
    );
    orchestrator.start().await.unwrap();

    let steps = SensorChannel::step_count();
    for _ in 0..3 {
        sim.inner.fire(&steps).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(sim.inner.acknowledgments(&steps), 0);

    orchestrator.shutdown();
    wait_for_acks(&sim.inner, &steps, 3).await;

    assert_eq!(sim.inner.acknowledgments(&steps), 3);
    assert!(log.is_empty().unwrap());
}

#[tokio::test]
async fn test_denied_authorization_recovers_on_foreground() {
    let (core, _surface) = core_with(KeyedStore::in_memory());
    let sim = Arc::new(SimulatedSubsystem::new(false));
    let mut orchestrator = core.orchestrator(Arc::clone(&sim), &test_config()).unwrap();

    assert_eq!(orchestrator.start().await.unwrap(), StartOutcome::PermissionNeeded);
    assert_eq!(
        orchestrator.channel_state(&SensorChannel::step_count()),
        Some(ChannelState::PermissionNeeded)
    );
    assert!(sim.fire(&SensorChannel::step_count()).is_err());

    sim.set_authorization(true);
    let foreground = core.enter_foreground(&mut orchestrator).await.unwrap();
    assert_eq!(foreground.retried, Some(StartOutcome::Observing(2)));
    assert_eq!(
        orchestrator.channel_state(&SensorChannel::step_count()),
        Some(ChannelState::Observing)
    );

    orchestrator.shutdown();
}

#[tokio::test]
async fn test_unread_counter_matches_background_appends() {
    let (core, surface) = core_with(KeyedStore::in_memory());
    core.lifecycle().on_background().unwrap();

    for n in 0..7 {
        let event = SensorEvent::with_value("stepCount", AppState::Background, n as f64).unwrap();
        core.log().append(event.into()).unwrap();
    }

    assert_eq!(core.tracker().unread().unwrap(), 7);
    assert_eq!(surface.submitted().len(), 7);
    // The background lifecycle event plus seven readings.
    assert_eq!(core.log().count().unwrap(), 8);
}

#[tokio::test]
async fn test_wakeups_on_one_channel_keep_arrival_order() {
    let (core, _surface) = core_with(KeyedStore::in_memory());
    let sim = Arc::new(SimulatedSubsystem::new(true));
    let mut orchestrator = core.orchestrator(Arc::clone(&sim), &test_config()).unwrap();
    orchestrator.start().await.unwrap();

    let steps = SensorChannel::step_count();
    for value in [10.0, 20.0, 30.0] {
        sim.script_result(steps.clone(), Ok(value));
    }
    for _ in 0..3 {
        sim.fire(&steps).unwrap();
    }
    wait_for_acks(&sim, &steps, 3).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let values: Vec<f64> = core
        .log()
        .snapshot()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::Sensor(s) => s.value(),
            Event::Lifecycle(_) => None,
        })
        .collect();
    assert_eq!(values, vec![30.0, 20.0, 10.0]);

    orchestrator.shutdown();
}

/// A subsystem whose queries never finish in time.
struct SlowSubsystem {
    inner: SimulatedSubsystem,
}

impl SensorSubsystem for SlowSubsystem {
    async fn request_authorization(
        &self,
        read: &[SensorChannel],
        write: &[SensorChannel],
    ) -> Result<bool, SubsystemError> {
        self.inner.request_authorization(read, write).await
    }

    fn register_observer(
        &self,
        channel: &SensorChannel,
    ) -> Result<health_event_agent::delivery::WakeupStream, SubsystemError> {
        self.inner.register_observer(channel)
    }

    async fn enable_background_delivery(
        &self,
        channel: &SensorChannel,
        frequency: health_event_agent::delivery::BackgroundFrequency,
    ) -> Result<(), SubsystemError> {
        self.inner.enable_background_delivery(channel, frequency).await
    }

    async fn run_aggregate_query(
        &self,
        _query: &health_event_agent::delivery::AggregateQuery,
    ) -> Result<f64, SubsystemError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(0.0)
    }
}
