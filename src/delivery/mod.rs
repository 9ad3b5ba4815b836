//! Background delivery of sensor readings.
//!
//! The orchestrator turns subsystem wakeups into aggregate queries and
//! appends each result to the event log as a sensor event.

pub mod channel;
pub mod orchestrator;
pub mod query;
pub mod simulated;
pub mod subsystem;

pub use channel::{
    ChannelConfig, ChannelState, ChannelSubscription, SensorChannel, SLEEP_ANALYSIS, STEP_COUNT,
};
pub use orchestrator::{
    DeliveryOrchestrator, DeliveryPolicy, OrchestratorError, RetryPolicy, StartOutcome,
    WakeupOutcome,
};
pub use query::{
    AggregateQuery, AggregationKind, CategorySample, QuantitySample, QueryWindow, TimeRange, Zone,
    IN_BED,
};
pub use simulated::SimulatedSubsystem;
pub use subsystem::{
    BackgroundFrequency, SensorSubsystem, SubsystemError, Wakeup, WakeupAck, WakeupStream,
};
