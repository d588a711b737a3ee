//! Error types for metabox
//!
//! Errors fall into four families that decide what happens to a running
//! scenario: configuration errors abort the whole run before anything is
//! provisioned, provisioning and session errors mark a scenario ERRORED,
//! and assertion errors mark it FAILED.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for metabox
#[derive(Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Origin '{origin}' is not supported on the {backend} backend")]
    UnsupportedBackend { origin: String, backend: String },

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    #[error("Invalid scenario file '{path}': {reason}")]
    ScenarioParse { path: String, reason: String },

    // === Provisioning Errors ===
    #[error("Failed to provision {machine}: {reason}")]
    Provisioning { machine: String, reason: String },

    #[error("Command '{command}' exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Teardown of {machine} failed: {reason}")]
    Teardown { machine: String, reason: String },

    // === Session Errors ===
    #[error("Session I/O error on {machine}: {reason}")]
    SessionIo { machine: String, reason: String },

    #[error("No program is running. Add a 'start' step before interacting with it")]
    SessionNotStarted,

    #[error("{what} timed out after {secs:.1} seconds")]
    Timeout { what: String, secs: f64 },

    // === Assertion Errors ===
    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("'{pattern}' not found after {waited_ms} ms{}", closed_suffix(.closed))]
    PatternNotFound {
        pattern: String,
        waited_ms: u128,
        closed: bool,
    },

    // === Fault Injection Errors ===
    #[error("Invalid session artifact '{path}': {reason}")]
    InvalidSession { path: String, reason: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

fn closed_suffix(closed: &bool) -> &'static str {
    if *closed {
        " (output closed)"
    } else {
        ""
    }
}

impl Error {
    /// Create a provisioning error for a machine
    pub fn provisioning(machine: &str, reason: impl std::fmt::Display) -> Self {
        Self::Provisioning {
            machine: machine.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a session I/O error for a machine
    pub fn session_io(machine: &str, reason: impl std::fmt::Display) -> Self {
        Self::SessionIo {
            machine: machine.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: &str, duration: std::time::Duration) -> Self {
        Self::Timeout {
            what: what.to_string(),
            secs: duration.as_secs_f64(),
        }
    }

    /// Whether this error must abort the run before any provisioning
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::ConfigParse(_)
                | Error::UnsupportedBackend { .. }
                | Error::FileRead { .. }
                | Error::ScenarioParse { .. }
        )
    }

    /// Whether this error is an assertion failure (scenario FAILED rather
    /// than ERRORED)
    pub fn is_assertion(&self) -> bool {
        matches!(self, Error::Assertion(_) | Error::PatternNotFound { .. })
    }
}
