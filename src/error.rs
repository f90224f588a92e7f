// Error types for unitpanel

use std::time::Duration;
use thiserror::Error;

/// Result type alias using anyhow::Error
pub type Result<T> = anyhow::Result<T>;

/// Result type for unit controller operations
pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// Typed failures returned by the unit controller
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Unit '{unit}' is busy: another action is already in flight")]
    Busy { unit: String },

    #[error("{action} on '{unit}' exited with code {code}: {stderr_tail}")]
    NonZeroExit {
        unit: String,
        action: String,
        code: i32,
        stderr_tail: String,
    },

    #[error("{action} on '{unit}' timed out after {after:?}")]
    Timeout {
        unit: String,
        action: String,
        after: Duration,
    },

    #[error("Unit '{unit}' has a stuck action that could not be terminated; restart the controller process")]
    StuckAction { unit: String },

    #[error("Logs for '{unit}' are unavailable: {reason}")]
    LogUnavailable { unit: String, reason: String },

    #[error("Unit '{0}' is not configured")]
    UnknownUnit(String),

    #[error("Failed to launch {action} for '{unit}': {source}")]
    Launch {
        unit: String,
        action: String,
        #[source]
        source: RunnerError,
    },

    #[error("Action on '{unit}' was interrupted before it completed")]
    Interrupted { unit: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Failures raised by a command runner
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("command has no program to run")]
    EmptyCommand,

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("process did not exit after {0}")]
    NotTerminated(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid unit name '{name}': {reason}")]
    InvalidUnitName { name: String, reason: String },

    #[error("Unit '{unit}' has an empty {action} command")]
    EmptyCommand { unit: String, action: String },

    #[error("Unit '{unit}' uses a file log source but has no path")]
    MissingLogPath { unit: String },

    #[error("Invalid size '{value}': {reason}")]
    InvalidSize { value: String, reason: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("No units configured")]
    NoUnits,
}
