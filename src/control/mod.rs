// Unit control: single-flight actions, status tracking and log tails

pub mod controller;
pub mod logs;
pub mod models;
pub mod probe;
pub mod resilience;
pub mod runner;

#[cfg(test)]
pub(crate) mod test_support;

pub use controller::{ControllerSettings, UnitController};
pub use logs::{bound_tail, FileLogSource, JournalLogSource, LogSource};
pub use models::{
    ActionCommands, ActionOutcome, ActionReport, ActionResult, CommandOutput, LogTail,
    ManagedUnit, UnitAction, UnitState, UnitStatus,
};
pub use probe::{StatusProbe, SystemdProbe};
pub use resilience::ConnectionManager;
pub use runner::{CommandRunner, ProcessRunner, RunningCommand};
