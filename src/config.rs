// Configuration management

use crate::control::{
    ActionCommands, ConnectionManager, ControllerSettings, FileLogSource, JournalLogSource,
    LogSource, ManagedUnit, ProcessRunner, SystemdProbe, UnitController,
};
use crate::error::{ConfigError, Result};
use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Environment variables overriding the configured credentials
pub const USER_ENV: &str = "PZ_USER";
pub const PASS_ENV: &str = "PZ_PASS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth: Credentials,
    /// Write logs here instead of stderr
    pub log_file: Option<PathBuf>,
    pub output_tail_bytes: usize,
    pub log_timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub default_log_lines: usize,
    /// Human readable size, e.g. "256 KiB"
    pub max_log_bytes: String,
    pub status_probe: ProbeKind,
    pub units: BTreeMap<String, UnitConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let mut units = BTreeMap::new();
        units.insert("zomboid".to_string(), UnitConfig::systemd("zomboid"));

        Self {
            auth: Credentials::default(),
            log_file: None,
            output_tail_bytes: 4096,
            log_timeout_secs: 10,
            kill_grace_secs: 5,
            default_log_lines: 50,
            max_log_bytes: "256 KiB".to_string(),
            status_probe: ProbeKind::None,
            units,
        }
    }
}

/// Operator credential pair checked by the HTTP layer
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "changeme".to_string(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Compare both fields without short-circuiting on the first mismatch
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let user_ok = constant_time_eq(self.username.as_bytes(), username.as_bytes());
        let pass_ok = constant_time_eq(self.password.as_bytes(), password.as_bytes());
        user_ok & pass_ok
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Source of live unit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    None,
    Systemd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSourceKind {
    Journal,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub source: LogSourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// journalctl `--output` mode, e.g. `short-precise`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            source: LogSourceKind::Journal,
            path: None,
            output: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitConfig {
    pub start: Vec<String>,
    pub stop: Vec<String>,
    pub restart: Vec<String>,
    pub update: Vec<String>,
    /// systemd unit used for journal and D-Bus lookups; defaults to `<name>.service`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systemd_unit: Option<String>,
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_update_timeout_secs")]
    pub update_timeout_secs: u64,
    #[serde(default)]
    pub logs: LogConfig,
}

fn default_action_timeout_secs() -> u64 {
    120
}

fn default_update_timeout_secs() -> u64 {
    1800
}

impl UnitConfig {
    /// systemctl-managed unit updated through a steamcmd script
    pub fn systemd(name: &str) -> Self {
        let systemctl = |verb: &str| vec!["systemctl".to_string(), verb.to_string(), name.to_string()];
        Self {
            start: systemctl("start"),
            stop: systemctl("stop"),
            restart: systemctl("restart"),
            update: vec![
                "steamcmd".to_string(),
                "+runscript".to_string(),
                "/home/pzserver/update_zomboid.txt".to_string(),
            ],
            systemd_unit: None,
            action_timeout_secs: default_action_timeout_secs(),
            update_timeout_secs: default_update_timeout_secs(),
            logs: LogConfig::default(),
        }
    }

    pub fn systemd_unit_name(&self, name: &str) -> String {
        match &self.systemd_unit {
            Some(unit) => unit.clone(),
            None if name.contains('.') => name.to_string(),
            None => format!("{}.service", name),
        }
    }

    fn commands(&self) -> ActionCommands {
        ActionCommands {
            start: self.start.clone(),
            stop: self.stop.clone(),
            restart: self.restart.clone(),
            update: self.update.clone(),
        }
    }
}

impl Config {
    /// Get default config path: ~/.config/unitpanel/config.yaml
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("unitpanel").join("config.yaml"))
    }

    /// Load config from path, falling back to defaults if not found.
    /// Credentials from the environment take precedence over the file.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path.unwrap_or_else(|| Self::default_path().unwrap_or_default());

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            serde_yaml::from_str(&contents)?
        } else {
            tracing::debug!("No config at {}, using defaults", config_path.display());
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Save config to path
    pub fn save(&self, path: PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var(USER_ENV) {
            self.auth.username = user;
        }
        if let Ok(pass) = std::env::var(PASS_ENV) {
            self.auth.password = pass;
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.units.is_empty() {
            return Err(ConfigError::NoUnits);
        }
        if self.output_tail_bytes == 0 {
            return Err(ConfigError::Zero("output_tail_bytes"));
        }
        if self.log_timeout_secs == 0 {
            return Err(ConfigError::Zero("log_timeout_secs"));
        }
        if self.default_log_lines == 0 {
            return Err(ConfigError::Zero("default_log_lines"));
        }
        if self.max_log_bytes()? == 0 {
            return Err(ConfigError::Zero("max_log_bytes"));
        }

        for (name, unit) in &self.units {
            validate_unit_name(name)?;
            validate_unit_name(&unit.systemd_unit_name(name))?;

            let commands = unit.commands();
            for action in crate::control::UnitAction::ALL {
                if commands.argv(action).is_empty() {
                    return Err(ConfigError::EmptyCommand {
                        unit: name.clone(),
                        action: action.to_string(),
                    });
                }
            }
            if unit.action_timeout_secs == 0 {
                return Err(ConfigError::Zero("action_timeout_secs"));
            }
            if unit.update_timeout_secs == 0 {
                return Err(ConfigError::Zero("update_timeout_secs"));
            }
            if unit.logs.source == LogSourceKind::File && unit.logs.path.is_none() {
                return Err(ConfigError::MissingLogPath { unit: name.clone() });
            }
        }

        Ok(())
    }

    /// Byte ceiling for log tails
    pub fn max_log_bytes(&self) -> std::result::Result<u64, ConfigError> {
        Byte::parse_str(&self.max_log_bytes, true)
            .map(|bytes| bytes.as_u64())
            .map_err(|e| ConfigError::InvalidSize {
                value: self.max_log_bytes.clone(),
                reason: e.to_string(),
            })
    }

    pub fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            output_tail_bytes: self.output_tail_bytes,
            log_timeout: Duration::from_secs(self.log_timeout_secs),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
            ..ControllerSettings::default()
        }
    }

    /// Managed units in name order
    pub fn managed_units(&self) -> Vec<ManagedUnit> {
        self.units
            .iter()
            .map(|(name, unit)| ManagedUnit {
                name: name.clone(),
                commands: unit.commands(),
                systemd_unit: unit.systemd_unit_name(name),
                action_timeout: Duration::from_secs(unit.action_timeout_secs),
                update_timeout: Duration::from_secs(unit.update_timeout_secs),
            })
            .collect()
    }

    /// Build a controller wired to local processes, the configured log
    /// sources and, if enabled, the systemd status probe
    pub async fn controller(&self) -> Result<UnitController> {
        let runner = Arc::new(ProcessRunner::default());
        let window = self.max_log_bytes()?.saturating_mul(2);

        let units = self
            .managed_units()
            .into_iter()
            .map(|unit| {
                let logs = &self.units[&unit.name].logs;
                let source: Arc<dyn LogSource> = match (logs.source, &logs.path) {
                    (LogSourceKind::File, Some(path)) => {
                        Arc::new(FileLogSource::new(path.clone(), window))
                    }
                    _ => Arc::new(
                        JournalLogSource::new(runner.clone()).with_output(logs.output.clone()),
                    ),
                };
                (unit, source)
            })
            .collect();

        let controller = UnitController::new(units, runner, self.settings());
        match self.status_probe {
            ProbeKind::None => Ok(controller),
            ProbeKind::Systemd => {
                let probe = SystemdProbe::connect(&ConnectionManager::default()).await?;
                Ok(controller.with_probe(Arc::new(probe)))
            }
        }
    }
}

/// Unit names end up in argument vectors; reject anything that could be
/// read as a flag or a path
pub fn validate_unit_name(name: &str) -> std::result::Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidUnitName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.len() > 256 {
        return Err(invalid("name is longer than 256 bytes"));
    }
    if name.starts_with('-') {
        return Err(invalid("name cannot start with '-'"));
    }
    if name.contains("..") || name.contains('/') || name.contains('\0') {
        return Err(invalid("name contains a path component"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(invalid("name contains whitespace"));
    }

    Ok(())
}
