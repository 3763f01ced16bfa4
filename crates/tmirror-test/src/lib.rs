//! Test infrastructure for the tmirror engine
//!
//! Provides:
//! - Fleet and interface fixtures
//! - Policy documents for common scenarios
//! - Trigger payload builders
//! - Fleet state verification helpers

pub mod fixtures;
mod verification;

pub use fixtures::*;
pub use verification::*;
