//! Runtime wiring for the homescript host: the in-process event bus, logging
//! setup and the long-running host loop.

pub mod event_bus;
mod host_runner;
pub mod logging;

pub use event_bus::EventBus;
pub use host_runner::{HostRunner, RunnerError};
pub use logging::init_logging;
