// Unit control data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Last-known lifecycle state of a managed unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitState {
    Unknown,
    Starting,
    Running,
    Stopping,
    Stopped,
    Updating,
    Failed,
}

impl UnitState {
    /// Returns true while an action is moving the unit between states
    pub fn is_transitional(&self) -> bool {
        matches!(self, UnitState::Starting | UnitState::Stopping | UnitState::Updating)
    }

    /// Map a systemd ActiveState value onto a unit state
    pub fn from_active_state(active_state: &str) -> Option<Self> {
        match active_state {
            "active" | "reloading" => Some(UnitState::Running),
            "inactive" => Some(UnitState::Stopped),
            "failed" => Some(UnitState::Failed),
            "activating" => Some(UnitState::Starting),
            "deactivating" => Some(UnitState::Stopping),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UnitState::Unknown => "Unknown",
            UnitState::Starting => "Starting",
            UnitState::Running => "Running",
            UnitState::Stopping => "Stopping",
            UnitState::Stopped => "Stopped",
            UnitState::Updating => "Updating",
            UnitState::Failed => "Failed",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Actions that can be requested against a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitAction {
    Start,
    Stop,
    Restart,
    Update,
}

impl UnitAction {
    pub const ALL: [UnitAction; 4] = [
        UnitAction::Start,
        UnitAction::Stop,
        UnitAction::Restart,
        UnitAction::Update,
    ];

    /// State the unit holds while this action runs
    pub fn transitional_state(&self) -> UnitState {
        match self {
            UnitAction::Start | UnitAction::Restart => UnitState::Starting,
            UnitAction::Stop => UnitState::Stopping,
            UnitAction::Update => UnitState::Updating,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UnitAction::Start => "start",
            UnitAction::Stop => "stop",
            UnitAction::Restart => "restart",
            UnitAction::Update => "update",
        }
    }
}

impl fmt::Display for UnitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Argument vectors for each action of a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCommands {
    pub start: Vec<String>,
    pub stop: Vec<String>,
    pub restart: Vec<String>,
    pub update: Vec<String>,
}

impl ActionCommands {
    pub fn argv(&self, action: UnitAction) -> &[String] {
        match action {
            UnitAction::Start => &self.start,
            UnitAction::Stop => &self.stop,
            UnitAction::Restart => &self.restart,
            UnitAction::Update => &self.update,
        }
    }
}

/// Immutable definition of one controllable service
#[derive(Debug, Clone)]
pub struct ManagedUnit {
    pub name: String,
    pub commands: ActionCommands,
    /// Name used for journal and D-Bus lookups
    pub systemd_unit: String,
    pub action_timeout: Duration,
    pub update_timeout: Duration,
}

impl ManagedUnit {
    /// Time budget for a single action
    pub fn timeout_for(&self, action: UnitAction) -> Duration {
        match action {
            UnitAction::Update => self.update_timeout,
            _ => self.action_timeout,
        }
    }
}

/// Captured output of a finished external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Outcome of the most recently completed action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: UnitAction,
    /// None when the command never produced an exit status
    pub exit_code: Option<i32>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub timestamp: DateTime<Utc>,
}

impl ActionResult {
    pub fn from_output(action: UnitAction, output: &CommandOutput, tail_bytes: usize) -> Self {
        Self {
            action,
            exit_code: Some(output.exit_code),
            stdout_tail: output_tail(&output.stdout, tail_bytes),
            stderr_tail: output_tail(&output.stderr, tail_bytes),
            timestamp: Utc::now(),
        }
    }

    /// Synthetic result for a command that overran its time budget
    pub fn timed_out(action: UnitAction, after: Duration) -> Self {
        Self::synthetic(action, format!("timed out after {:?}", after))
    }

    /// Synthetic result for an action that never produced an exit status
    pub fn synthetic(action: UnitAction, message: String) -> Self {
        Self {
            action,
            exit_code: None,
            stdout_tail: String::new(),
            stderr_tail: message,
            timestamp: Utc::now(),
        }
    }
}

/// How a requested action ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionOutcome {
    Success,
    NonZeroExit,
    Timeout,
}

/// Result handed back to the caller of `request_action`
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    pub unit: String,
    pub action: UnitAction,
    pub outcome: ActionOutcome,
    pub result: ActionResult,
    /// State the unit was left in
    pub state: UnitState,
    pub elapsed: Duration,
}

impl ActionReport {
    pub fn exit_code(&self) -> Option<i32> {
        self.result.exit_code
    }

    /// Convert failed outcomes into the matching typed error
    pub fn into_result(self) -> crate::error::ControlResult<Self> {
        use crate::error::ControlError;

        match self.outcome {
            ActionOutcome::Success => Ok(self),
            ActionOutcome::NonZeroExit => Err(ControlError::NonZeroExit {
                unit: self.unit,
                action: self.action.to_string(),
                code: self.result.exit_code.unwrap_or(-1),
                stderr_tail: self.result.stderr_tail,
            }),
            ActionOutcome::Timeout => Err(ControlError::Timeout {
                unit: self.unit,
                action: self.action.to_string(),
                after: self.elapsed,
            }),
        }
    }
}

/// Point-in-time snapshot of a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    pub name: String,
    pub state: UnitState,
    pub busy: bool,
    /// Set when a timed-out action could not be terminated
    pub stuck: bool,
    pub last_result: Option<ActionResult>,
}

/// Bounded tail of a unit's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogTail {
    pub text: String,
    pub lines: usize,
    pub truncated: bool,
}

/// Newest `max_bytes` of `text`, cut forward to a char boundary
pub(crate) fn tail_str(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = text.len() - max_bytes;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    &text[cut..]
}

fn output_tail(bytes: &[u8], max_bytes: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    tail_str(&text, max_bytes).to_string()
}
