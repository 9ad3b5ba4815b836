//! Event log and its observer bus.

pub mod bus;
pub mod log;

pub use bus::ObserverBus;
pub use log::{EventLog, LogChange, DEFAULT_EVENT_LOG_KEY};
