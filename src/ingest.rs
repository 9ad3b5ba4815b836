//! Process-wide wiring of the ingestion core.

use crate::config::{Config, ConfigError};
use crate::delivery::{DeliveryOrchestrator, OrchestratorError, SensorSubsystem, StartOutcome};
use crate::event::AppState;
use crate::event_log::EventLog;
use crate::lifecycle::{AppStateHandle, LifecycleController};
use crate::store::{KeyedStore, LoadWarning, StoreError};
use crate::tracker::{NotificationSurface, UnreadTracker};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// The event log, unread tracker and lifecycle controller, all sharing one
/// store handle.
pub struct IngestCore {
    instance_id: Uuid,
    store: KeyedStore,
    log: EventLog,
    tracker: Arc<UnreadTracker>,
    lifecycle: LifecycleController,
    store_warning: Option<LoadWarning>,
}

impl IngestCore {
    /// Open the file-backed core described by `config`.
    pub fn open(config: &Config, surface: Arc<dyn NotificationSurface>) -> Result<Self, CoreError> {
        config.ensure_directories()?;
        let store = KeyedStore::open(config.store_path());
        Self::assemble(store, config, surface)
    }

    /// A core whose state lives only in memory.
    pub fn in_memory(surface: Arc<dyn NotificationSurface>) -> Result<Self, CoreError> {
        Self::assemble(KeyedStore::in_memory(), &Config::default(), surface)
    }

    /// Build the core on an existing store handle.
    pub fn assemble(
        store: KeyedStore,
        config: &Config,
        surface: Arc<dyn NotificationSurface>,
    ) -> Result<Self, CoreError> {
        let app_state = AppStateHandle::new(AppState::Active);
        let store_warning = store.recovery_warning()?;
        let log = EventLog::open(&store, &config.event_log_key)?;
        let tracker = Arc::new(UnreadTracker::open(
            &store,
            &config.unread_counter_key,
            surface,
            app_state.clone(),
            config.notification_delay,
        )?);
        tracker.attach(&log);

        let lifecycle = LifecycleController::new(
            app_state,
            Arc::clone(&tracker),
            log.clone(),
            config.record_lifecycle_events,
        );

        let core = Self {
            instance_id: Uuid::new_v4(),
            store,
            log,
            tracker,
            lifecycle,
            store_warning,
        };
        for warning in core.load_warnings() {
            warn!(%warning, "Recovered persisted state");
        }
        info!(instance = %core.instance_id, "Ingestion core ready");
        Ok(core)
    }

    /// Orchestrator appending to this core's log.
    pub fn orchestrator<S: SensorSubsystem>(
        &self,
        subsystem: Arc<S>,
        config: &Config,
    ) -> Result<DeliveryOrchestrator<S>, CoreError> {
        Ok(DeliveryOrchestrator::new(
            subsystem,
            self.log.clone(),
            self.app_state().clone(),
            config.channels.clone(),
            config.delivery_policy()?,
        ))
    }

    /// Foreground transition for a host that also runs an orchestrator.
    ///
    /// Mirrors and resets the unread count, then asks for authorization
    /// again if any channel is waiting for permission.
    pub async fn enter_foreground<S: SensorSubsystem>(
        &self,
        orchestrator: &mut DeliveryOrchestrator<S>,
    ) -> Result<Foreground, CoreError> {
        let mirrored = self.lifecycle.on_foreground()?;
        let retried = orchestrator.on_foreground().await?;
        Ok(Foreground { mirrored, retried })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn store(&self) -> &KeyedStore {
        &self.store
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn tracker(&self) -> &Arc<UnreadTracker> {
        &self.tracker
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn app_state(&self) -> &AppStateHandle {
        self.lifecycle.app_state()
    }

    /// Recoveries performed while opening persisted state.
    pub fn load_warnings(&self) -> Vec<LoadWarning> {
        self.store_warning
            .iter()
            .chain(self.log.load_warning())
            .chain(self.tracker.load_warning())
            .cloned()
            .collect()
    }
}

/// Result of [`IngestCore::enter_foreground`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Foreground {
    /// Unread count mirrored to the badge before the reset.
    pub mirrored: u64,
    /// Outcome of the authorization retry, if one was needed.
    pub retried: Option<StartOutcome>,
}

/// Ingestion core errors.
#[derive(Debug)]
pub enum CoreError {
    Config(ConfigError),
    Store(StoreError),
    Delivery(OrchestratorError),
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::Config(e) => write!(f, "Configuration error: {e}"),
            CoreError::Store(e) => write!(f, "Store error: {e}"),
            CoreError::Delivery(e) => write!(f, "Delivery error: {e}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Config(e) => Some(e),
            CoreError::Store(e) => Some(e),
            CoreError::Delivery(e) => Some(e),
        }
    }
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::Config(e)
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        CoreError::Store(e)
    }
}

impl From<OrchestratorError> for CoreError {
    fn from(e: OrchestratorError) -> Self {
        CoreError::Delivery(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PlistValue;
    use crate::delivery::SimulatedSubsystem;
    use crate::event::SensorEvent;
    use crate::store::MemoryBackend;
    use crate::tracker::{RecordingSurface, DEFAULT_UNREAD_COUNTER_KEY};

    fn config_in(dir: &std::path::Path) -> Config {
        Config {
            data_path: dir.to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let surface = Arc::new(RecordingSurface::new());

        {
            let core = IngestCore::open(&config, surface.clone()).unwrap();
            core.lifecycle().on_background().unwrap();
            let event = SensorEvent::with_value("stepCount", AppState::Background, 12.0).unwrap();
            core.log().append(event.into()).unwrap();
            assert_eq!(core.tracker().unread().unwrap(), 1);
        }

        let core = IngestCore::open(&config, surface).unwrap();
        assert_eq!(core.log().count().unwrap(), 2);
        assert_eq!(core.tracker().unread().unwrap(), 1);
        assert!(core.load_warnings().is_empty());
        assert!(config.store_path().exists());
    }

    #[test]
    fn test_unreadable_counter_is_reported() {
        let store = KeyedStore::with_backend(
            MemoryBackend::new()
                .with_entry(DEFAULT_UNREAD_COUNTER_KEY, PlistValue::String("seven".into())),
        );

        let core =
            IngestCore::assemble(store, &Config::default(), Arc::new(RecordingSurface::new()))
                .unwrap();

        let warnings = core.load_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(warnings[0], LoadWarning::Unreadable { .. }));
        assert_eq!(core.tracker().unread().unwrap(), 0);
    }

    /// Replace the first `{"real": ..}` node under `value` with a tag no
    /// value tree uses.
    fn break_first_real(value: &mut serde_json::Value) -> bool {
        if value.get("real").is_some() {
            *value = serde_json::json!({ "data": "AAAA" });
            return true;
        }
        match value {
            serde_json::Value::Object(map) => map.values_mut().any(break_first_real),
            serde_json::Value::Array(items) => items.iter_mut().any(break_first_real),
            _ => false,
        }
    }

    #[test]
    fn test_malformed_record_in_store_file_is_reported_not_wiped() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let surface = Arc::new(RecordingSurface::new());

        {
            let core = IngestCore::open(&config, surface.clone()).unwrap();
            core.lifecycle().on_background().unwrap();
            for n in 1..=3 {
                let event =
                    SensorEvent::with_value("stepCount", AppState::Background, n as f64).unwrap();
                core.log().append(event.into()).unwrap();
            }
            assert_eq!(core.log().count().unwrap(), 4);
            assert_eq!(core.tracker().unread().unwrap(), 3);
        }

        let path = config.store_path();
        let mut file: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let newest = &mut file["entries"][config.event_log_key.as_str()]["array"][0];
        assert!(break_first_real(newest));
        std::fs::write(&path, file.to_string()).unwrap();

        let core = IngestCore::open(&config, surface).unwrap();
        assert_eq!(core.log().count().unwrap(), 3);
        assert_eq!(core.tracker().unread().unwrap(), 3);

        let warnings = core.load_warnings();
        assert_eq!(warnings.len(), 1);
        let LoadWarning::PartialLoad {
            key,
            dropped,
            backup_key,
        } = &warnings[0]
        else {
            panic!("expected a partial load, got {warnings:?}");
        };
        assert_eq!(key, &config.event_log_key);
        assert_eq!(*dropped, 1);
        assert!(core.store().raw_json(backup_key).unwrap().is_some());
    }

    #[test]
    fn test_unreadable_store_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(config.store_path(), "{ truncated").unwrap();

        let core = IngestCore::open(&config, Arc::new(RecordingSurface::new())).unwrap();

        let warnings = core.load_warnings();
        assert_eq!(warnings.len(), 1);
        let LoadWarning::StoreFileQuarantined { moved_to, .. } = &warnings[0] else {
            panic!("expected a quarantined store file, got {warnings:?}");
        };
        assert_eq!(std::fs::read_to_string(moved_to).unwrap(), "{ truncated");
        assert!(core.log().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_enter_foreground_retries_declined_authorization() {
        let core = IngestCore::in_memory(Arc::new(RecordingSurface::new())).unwrap();
        let sim = Arc::new(SimulatedSubsystem::new(false));
        let config = Config {
            timezone: Some("UTC".to_string()),
            ..Config::default()
        };
        let mut orchestrator = core.orchestrator(Arc::clone(&sim), &config).unwrap();
        assert_eq!(orchestrator.start().await.unwrap(), StartOutcome::PermissionNeeded);

        core.lifecycle().on_background().unwrap();
        core.log()
            .append(SensorEvent::with_value("stepCount", AppState::Background, 1.0).unwrap().into())
            .unwrap();
        sim.set_authorization(true);

        let foreground = core.enter_foreground(&mut orchestrator).await.unwrap();

        assert_eq!(foreground.mirrored, 1);
        assert_eq!(foreground.retried, Some(StartOutcome::Observing(2)));
        assert_eq!(core.tracker().unread().unwrap(), 0);
        assert_eq!(sim.authorization_requests(), 2);

        let again = core.enter_foreground(&mut orchestrator).await.unwrap();
        assert_eq!(again.retried, None);
        orchestrator.shutdown();
    }

    #[test]
    fn test_in_memory_core_records_lifecycle() {
        let core = IngestCore::in_memory(Arc::new(RecordingSurface::new())).unwrap();
        core.lifecycle().on_foreground().unwrap();

        let events = core.log().snapshot().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title(), "Lifecycle");
        assert_eq!(core.app_state().current(), AppState::Active);
    }
}
