//! Runtime glue that wires configuration, progress sinks, telemetry, and the
//! public runner entry point.

pub mod config;
pub mod progress;
pub mod runner;
pub mod telemetry;
