//! metabox - end-to-end scenario runner for checkbox
//!
//! This library provisions disposable machines, installs checkbox on them
//! and drives it through scripted interactive scenarios.

pub mod cli;
pub mod commands;
pub mod common;
pub mod corrupt;
pub mod keys;
pub mod machine;
pub mod scenario;
pub mod session;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use machine::{MachineProvider, ProviderFactory};
pub use scenario::{RunSettings, Scenario, ScenarioRunner};
