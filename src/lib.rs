//! Health Event Agent - background sensor-event ingestion and persistence.
//!
//! This library turns sensor-subsystem wakeups into durable, observable
//! events, and tracks how many arrived while the application was not in
//! the foreground.
//!
//! # Guarantees
//!
//! - **Ordered log**: events are kept newest first and survive restarts
//! - **Observed writes**: observers have run by the time a write returns
//! - **Acknowledged wakeups**: every wakeup is acknowledged exactly once
//! - **Recoverable state**: unreadable persisted data is backed up, never
//!   silently lost
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Health Event Agent                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐        │
//! │  │  Subsystem  │──▶│  Delivery   │──▶│  Event Log  │        │
//! │  │  (wakeups)  │   │(orchestrate)│   │(newest 1st) │        │
//! │  └─────────────┘   └─────────────┘   └─────────────┘        │
//! │                                         │       │            │
//! │                                         ▼       ▼            │
//! │                              ┌─────────────┐ ┌───────────┐  │
//! │                              │   Unread    │ │  Keyed    │  │
//! │                              │  Tracker    │ │  Store    │  │
//! │                              └─────────────┘ └───────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use health_event_agent::{AppState, IngestCore, LogSurface, SensorEvent};
//! use std::sync::Arc;
//!
//! let core = IngestCore::in_memory(Arc::new(LogSurface)).unwrap();
//! core.lifecycle().on_background().unwrap();
//!
//! let event = SensorEvent::with_value("stepCount", AppState::Background, 1500.0).unwrap();
//! core.log().append(event.into()).unwrap();
//!
//! assert_eq!(core.tracker().unread().unwrap(), 1);
//! ```

pub mod codec;
pub mod config;
pub mod delivery;
pub mod event;
pub mod event_log;
pub mod ingest;
pub mod lifecycle;
pub mod store;
pub mod tracker;

// Re-export key types at crate root for convenience
pub use codec::{CodecError, EventSequence, PlistValue, PropertyListSerializable};
pub use config::{Config, ConfigError};
pub use delivery::{
    ChannelConfig, ChannelState, DeliveryOrchestrator, SensorChannel, SensorSubsystem,
    SimulatedSubsystem, SubsystemError, Wakeup, WakeupOutcome,
};
pub use event::{AppState, Event, EventError, LifecycleEvent, Payload, PayloadValue, SensorEvent};
pub use event_log::{EventLog, LogChange};
pub use ingest::{CoreError, Foreground, IngestCore};
pub use lifecycle::{AppStateHandle, LifecycleController};
pub use store::{DurableCell, KeyedStore, LoadWarning, StoreError};
pub use tracker::{LogSurface, NotificationSurface, RecordingSurface, UnreadTracker};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
