//! tmirrord - traffic mirror provisioning invocation host
//!
//! Loads the daemon settings and the region's policy document once, then
//! runs single invocations (instance events, security findings, backfill
//! continuations, provisioning lifecycle events) through the engine.

pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod simulate;

pub use config::{DaemonConfig, DEFAULT_CONFIG_PATH};
pub use error::{DaemonError, Result};
pub use host::{Host, InvocationOutcome};
pub use logging::{init_logging, LogFormat};
pub use simulate::{notification_payload, Simulation, SimulationReport};
