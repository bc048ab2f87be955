//! Unified error types for Watchkeeper

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Watchkeeper operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Lookup errors
    #[error("Machine '{0}' not found")]
    MachineNotFound(String),

    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    // Guest channel errors
    #[error("Connection to machine '{machine}' failed: {message}")]
    Connection { machine: String, message: String },

    #[error("Machine '{machine}' did not reply within {timeout_ms}ms")]
    Timeout { machine: String, timeout_ms: u64 },

    #[error("Protocol error on machine '{machine}': {message}")]
    Protocol { machine: String, message: String },

    #[error("Guest agent on machine '{machine}' reported: {message}")]
    Guest { machine: String, message: String },

    // Scheduling errors
    #[error("Task '{task}' failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        task: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Machine '{0}' already has a running health check")]
    MachineBusy(String),

    #[error("Task '{task}' cannot move from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    // Collaborator errors
    #[error("Logbook error: {0}")]
    Store(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hypervisor query failed: {0}")]
    Hypervisor(String),
}

impl Error {
    /// Whether the scheduler should retry the task that produced this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. }
                | Error::Timeout { .. }
                | Error::Protocol { .. }
                | Error::Guest { .. }
        )
    }

    /// Whether this is a lookup failure that must reach the caller untouched
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::MachineNotFound(_) | Error::TaskNotFound(_))
    }
}

/// Result type alias for Watchkeeper operations
pub type Result<T> = std::result::Result<T, Error>;
