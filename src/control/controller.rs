// Single-flight action execution and status tracking for managed units

use crate::control::logs::{bound_tail, LogSource};
use crate::control::models::{
    ActionOutcome, ActionReport, ActionResult, LogTail, ManagedUnit, UnitAction, UnitState,
    UnitStatus,
};
use crate::control::probe::StatusProbe;
use crate::control::runner::CommandRunner;
use crate::error::{ControlError, ControlResult};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Tunables shared by every unit
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Bytes of stdout/stderr kept in each action result
    pub output_tail_bytes: usize,
    pub log_timeout: Duration,
    /// Wait after each termination signal before escalating
    pub kill_grace: Duration,
    pub probe_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            output_tail_bytes: 4096,
            log_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct UnitRuntime {
    state: UnitState,
    busy: bool,
    stuck: bool,
    last_result: Option<ActionResult>,
}

struct UnitSlot {
    unit: ManagedUnit,
    logs: Arc<dyn LogSource>,
    runtime: RwLock<UnitRuntime>,
}

impl UnitSlot {
    fn read(&self) -> RwLockReadGuard<'_, UnitRuntime> {
        self.runtime.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, UnitRuntime> {
        self.runtime.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> UnitStatus {
        let runtime = self.read();
        UnitStatus {
            name: self.unit.name.clone(),
            state: runtime.state,
            busy: runtime.busy,
            stuck: runtime.stuck,
            last_result: runtime.last_result.clone(),
        }
    }
}

/// Exclusive right to run one action on a unit.
///
/// Dropping an unfinished permit releases the unit and marks it Failed, so a
/// panicking action task cannot leave the unit busy forever.
struct ActionPermit {
    slot: Arc<UnitSlot>,
    action: UnitAction,
    prior_state: UnitState,
    armed: bool,
}

impl ActionPermit {
    fn try_acquire(slot: Arc<UnitSlot>, action: UnitAction) -> ControlResult<Self> {
        let prior_state = {
            let mut runtime = slot.write();
            if runtime.stuck {
                return Err(ControlError::StuckAction {
                    unit: slot.unit.name.clone(),
                });
            }
            if runtime.busy {
                return Err(ControlError::Busy {
                    unit: slot.unit.name.clone(),
                });
            }
            let prior = runtime.state;
            runtime.busy = true;
            runtime.state = action.transitional_state();
            prior
        };

        Ok(Self {
            slot,
            action,
            prior_state,
            armed: true,
        })
    }

    /// Record the result, move to `state` and release the unit
    fn complete(mut self, state: UnitState, result: ActionResult) {
        let mut runtime = self.slot.write();
        runtime.state = state;
        runtime.last_result = Some(result);
        runtime.busy = false;
        self.armed = false;
    }

    /// Leave the unit busy for good: its process may still be running
    fn mark_stuck(mut self, result: ActionResult) {
        let mut runtime = self.slot.write();
        runtime.state = UnitState::Failed;
        runtime.last_result = Some(result);
        runtime.stuck = true;
        self.armed = false;
    }
}

impl Drop for ActionPermit {
    fn drop(&mut self) {
        if self.armed {
            let mut runtime = self.slot.write();
            if runtime.state.is_transitional() {
                runtime.state = UnitState::Failed;
            }
            runtime.busy = false;
        }
    }
}

/// Mediates every action against the configured units
#[derive(Clone)]
pub struct UnitController {
    units: Arc<BTreeMap<String, Arc<UnitSlot>>>,
    runner: Arc<dyn CommandRunner>,
    probe: Option<Arc<dyn StatusProbe>>,
    settings: ControllerSettings,
}

impl UnitController {
    /// Create a controller over `units`, each paired with its log source
    pub fn new(
        units: Vec<(ManagedUnit, Arc<dyn LogSource>)>,
        runner: Arc<dyn CommandRunner>,
        settings: ControllerSettings,
    ) -> Self {
        let units = units
            .into_iter()
            .map(|(unit, logs)| {
                let slot = UnitSlot {
                    unit,
                    logs,
                    runtime: RwLock::new(UnitRuntime {
                        state: UnitState::Unknown,
                        busy: false,
                        stuck: false,
                        last_result: None,
                    }),
                };
                (slot.unit.name.clone(), Arc::new(slot))
            })
            .collect();

        Self {
            units: Arc::new(units),
            runner,
            probe: None,
            settings,
        }
    }

    /// Attach a probe used to refresh state from the supervisor
    pub fn with_probe(mut self, probe: Arc<dyn StatusProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Names of all configured units, sorted
    pub fn units(&self) -> Vec<&str> {
        self.units.keys().map(String::as_str).collect()
    }

    pub fn unit(&self, name: &str) -> ControlResult<&ManagedUnit> {
        self.slot(name).map(|slot| &slot.unit)
    }

    fn slot(&self, name: &str) -> ControlResult<&Arc<UnitSlot>> {
        self.units
            .get(name)
            .ok_or_else(|| ControlError::UnknownUnit(name.to_string()))
    }

    /// Run `action` on the unit unless another action is already in flight.
    ///
    /// The command runs on its own task; the unit's state is settled even if the
    /// caller stops waiting.
    pub async fn request_action(&self, name: &str, action: UnitAction) -> ControlResult<ActionReport> {
        let slot = self.slot(name)?.clone();
        let permit = ActionPermit::try_acquire(slot, action)?;

        tracing::info!("Starting {} on {}", action, name);
        let task = tokio::spawn(run_action(
            permit,
            self.runner.clone(),
            self.probe.clone(),
            self.settings.clone(),
        ));

        match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("{} on {} did not finish: {}", action, name, e);
                Err(ControlError::Interrupted {
                    unit: name.to_string(),
                })
            }
        }
    }

    /// Snapshot of a unit's state; never waits on an in-flight action
    pub fn query_status(&self, name: &str) -> ControlResult<UnitStatus> {
        Ok(self.slot(name)?.snapshot())
    }

    /// Snapshots of every unit, in name order
    pub fn statuses(&self) -> Vec<UnitStatus> {
        self.units.values().map(|slot| slot.snapshot()).collect()
    }

    /// Re-read a unit's state from the probe, if one is attached and the unit is idle
    pub async fn refresh_status(&self, name: &str) -> ControlResult<UnitStatus> {
        let slot = self.slot(name)?;
        let Some(probe) = &self.probe else {
            return Ok(slot.snapshot());
        };
        if slot.read().busy {
            return Ok(slot.snapshot());
        }

        if let Some(observed) = probe_state(probe, &slot.unit, self.settings.probe_timeout).await {
            let mut runtime = slot.write();
            // An action may have started while the probe was in flight
            if !runtime.busy {
                runtime.state = observed;
            }
        }
        Ok(slot.snapshot())
    }

    /// Read the newest log lines of a unit, bounded by line count and bytes
    pub async fn tail_log(&self, name: &str, max_lines: usize, max_bytes: usize) -> ControlResult<LogTail> {
        if max_lines == 0 || max_bytes == 0 {
            return Err(ControlError::InvalidRequest(
                "max_lines and max_bytes must be positive".to_string(),
            ));
        }
        let slot = self.slot(name)?;

        // One extra line tells us whether the source had more than requested
        let fetch = slot.logs.fetch(&slot.unit.systemd_unit, max_lines.saturating_add(1));
        let text = match tokio::time::timeout(self.settings.log_timeout, fetch).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::warn!("Log retrieval for {} failed: {:#}", name, e);
                return Err(ControlError::LogUnavailable {
                    unit: name.to_string(),
                    reason: format!("{:#}", e),
                });
            }
            Err(_) => {
                tracing::warn!("Log retrieval for {} timed out", name);
                return Err(ControlError::LogUnavailable {
                    unit: name.to_string(),
                    reason: format!("timed out after {:?}", self.settings.log_timeout),
                });
            }
        };

        Ok(bound_tail(&text, max_lines, max_bytes))
    }
}

async fn run_action(
    permit: ActionPermit,
    runner: Arc<dyn CommandRunner>,
    probe: Option<Arc<dyn StatusProbe>>,
    settings: ControllerSettings,
) -> ControlResult<ActionReport> {
    let slot = permit.slot.clone();
    let unit = &slot.unit;
    let action = permit.action;
    let argv = unit.commands.argv(action);
    let limit = unit.timeout_for(action);
    let started = Instant::now();

    tracing::debug!("{} {}: {:?} (timeout {:?})", unit.name, action, argv, limit);

    let mut command = match runner.spawn(argv) {
        Ok(command) => command,
        Err(e) => {
            tracing::error!("Failed to launch {} for {}: {}", action, unit.name, e);
            permit.complete(
                UnitState::Failed,
                ActionResult::synthetic(action, format!("failed to launch: {}", e)),
            );
            return Err(ControlError::Launch {
                unit: unit.name.clone(),
                action: action.to_string(),
                source: e,
            });
        }
    };

    let mut waited = tokio::time::timeout(limit, command.wait()).await;
    if waited.is_err() && command.has_exited() {
        // Exited in time but its output pipes are held open by a descendant
        tracing::debug!("{} on {} exited within {:?}, collecting output", action, unit.name, limit);
        waited = Ok(command.wait().await);
    }
    let elapsed = started.elapsed();

    let (outcome, state, result) = match waited {
        Ok(Ok(output)) => {
            let result = ActionResult::from_output(action, &output, settings.output_tail_bytes);
            if output.success() {
                let state = match action {
                    UnitAction::Start | UnitAction::Restart => UnitState::Running,
                    UnitAction::Stop => UnitState::Stopped,
                    UnitAction::Update => {
                        state_after_update(permit.prior_state, probe.as_ref(), unit, &settings).await
                    }
                };
                tracing::info!("{} on {} succeeded in {:?}", action, unit.name, elapsed);
                (ActionOutcome::Success, state, result)
            } else {
                tracing::warn!(
                    "{} on {} exited with code {}",
                    action,
                    unit.name,
                    output.exit_code
                );
                (ActionOutcome::NonZeroExit, UnitState::Failed, result)
            }
        }
        Ok(Err(e)) => {
            tracing::error!("Lost track of {} on {}: {}", action, unit.name, e);
            let result = ActionResult::synthetic(action, format!("failed while waiting: {}", e));

            if let Err(kill_err) = command.terminate(settings.kill_grace).await {
                tracing::error!(
                    "Could not terminate {} on {}: {}; unit stays busy until restart",
                    action,
                    unit.name,
                    kill_err
                );
                permit.mark_stuck(result);
                return Err(ControlError::StuckAction {
                    unit: unit.name.clone(),
                });
            }
            permit.complete(UnitState::Failed, result);
            return Err(ControlError::Launch {
                unit: unit.name.clone(),
                action: action.to_string(),
                source: e,
            });
        }
        Err(_) => {
            tracing::warn!("{} on {} timed out after {:?}, terminating", action, unit.name, limit);
            let result = ActionResult::timed_out(action, limit);

            if let Err(e) = command.terminate(settings.kill_grace).await {
                tracing::error!(
                    "Could not terminate {} on {}: {}; unit stays busy until restart",
                    action,
                    unit.name,
                    e
                );
                permit.mark_stuck(result);
                return Err(ControlError::StuckAction {
                    unit: unit.name.clone(),
                });
            }
            (ActionOutcome::Timeout, UnitState::Failed, result)
        }
    };

    permit.complete(state, result.clone());
    Ok(ActionReport {
        unit: unit.name.clone(),
        action,
        outcome,
        result,
        state,
        elapsed,
    })
}

/// State after a successful update: what the unit was doing before, or what
/// the probe observes now. A unit that was Failed is no longer known to be.
async fn state_after_update(
    prior: UnitState,
    probe: Option<&Arc<dyn StatusProbe>>,
    unit: &ManagedUnit,
    settings: &ControllerSettings,
) -> UnitState {
    if let Some(probe) = probe {
        if let Some(observed) = probe_state(probe, unit, settings.probe_timeout).await {
            return observed;
        }
    }
    match prior {
        UnitState::Failed => UnitState::Unknown,
        other => other,
    }
}

async fn probe_state(
    probe: &Arc<dyn StatusProbe>,
    unit: &ManagedUnit,
    limit: Duration,
) -> Option<UnitState> {
    match tokio::time::timeout(limit, probe.probe(&unit.systemd_unit)).await {
        Ok(Ok(state)) => state,
        Ok(Err(e)) => {
            tracing::warn!("Status probe for {} failed: {:#}", unit.name, e);
            None
        }
        Err(_) => {
            tracing::warn!("Status probe for {} timed out", unit.name);
            None
        }
    }
}
