use crate::hooks::DEFENDER_HOOK_NAME;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "update_lock.json";
pub const SETTINGS_FILE_NAME: &str = "update_lock_settings.json";
/// Environment variable overriding the configuration file location.
pub const CONFIG_PATH_ENV: &str = "UPDATE_LOCK_CONFIG";

/// Windows Update.
pub const WINDOWS_UPDATE_SERVICE: &str = "wuauserv";
/// Services re-enabling Windows Update behind its back.
pub const UPDATE_MEDIC_SERVICE: &str = "WaaSMedicSvc";
pub const UPDATE_ORCHESTRATOR_SERVICE: &str = "UsoSvc";

/// Upper bound of the tick and timer rebuild intervals.
pub const MAX_INTERVAL_SECS: u64 = 7 * 24 * 3600;
/// Upper bound of the hook timeout and the supervision delays.
pub const MAX_WAIT_SECS: u64 = 24 * 3600;

/// Timing and identity of the self-restart supervision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Name shared by the instance handle and the heartbeat file.
    #[serde(default = "default_supervision_name")]
    pub name: String,
    /// Grace period before the watcher starts checking heartbeats.
    #[serde(default = "default_supervision_delay")]
    pub delay_secs: u64,
    /// Maximum silence before the watcher relaunches the process.
    #[serde(default = "default_alive_timeout")]
    pub alive_timeout_secs: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_supervision_name(),
            delay_secs: default_supervision_delay(),
            alive_timeout_secs: default_alive_timeout(),
        }
    }
}

impl SupervisionConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn alive_timeout(&self) -> Duration {
        Duration::from_secs(self.alive_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Seconds between two reconciliation ticks.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Seconds between two rebuilds of the tick timer.
    #[serde(default = "default_full_restart_interval")]
    pub full_restart_interval_secs: u64,
    /// Services kept in sync with the lock setting. The first one drives the
    /// displayed lock state.
    #[serde(default = "default_services")]
    pub services: Vec<String>,
    /// Location of the key-value settings file. If `None`, the file lives next
    /// to the executable.
    #[serde(default)]
    pub settings_file: Option<PathBuf>,
    /// When enabled the logger is initialised at debug level.
    #[serde(default)]
    pub debug_logging: bool,
    /// Optional trace file receiving a copy of every log line.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub supervision: SupervisionConfig,
    /// Names of the post-unlock hooks to resolve from the hook table.
    #[serde(default = "default_post_unlock_hooks")]
    pub post_unlock_hooks: Vec<String>,
    #[serde(default = "default_hook_timeout")]
    pub hook_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_supervision_name() -> String {
    "Update-Lock".into()
}

fn default_supervision_delay() -> u64 {
    60
}

fn default_alive_timeout() -> u64 {
    60
}

fn default_check_interval() -> u64 {
    15
}

fn default_full_restart_interval() -> u64 {
    3600
}

fn default_services() -> Vec<String> {
    vec![
        WINDOWS_UPDATE_SERVICE.into(),
        UPDATE_MEDIC_SERVICE.into(),
        UPDATE_ORCHESTRATOR_SERVICE.into(),
    ]
}

fn default_post_unlock_hooks() -> Vec<String> {
    vec![DEFENDER_HOOK_NAME.into()]
}

fn default_hook_timeout() -> u64 {
    300
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            full_restart_interval_secs: default_full_restart_interval(),
            services: default_services(),
            settings_file: None,
            debug_logging: false,
            log_file: None,
            supervision: SupervisionConfig::default(),
            post_unlock_hooks: default_post_unlock_hooks(),
            hook_timeout_secs: default_hook_timeout(),
        }
    }
}

impl AppConfig {
    /// Load the configuration from `path`. A missing or empty file yields the
    /// defaults.
    ///
    /// Out of range values are replaced; the returned messages describe each
    /// replacement so they can be logged once logging is set up.
    pub fn load(path: &Path) -> Result<(Self, Vec<String>)> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("read config file {}", path.display()))
            }
        };
        if content.trim().is_empty() {
            return Ok((Self::default(), Vec::new()));
        }
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("deserialize config file {}", path.display()))?;
        let fixes = config.sanitize();
        Ok((config, fixes))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("serialize config")?;
        std::fs::write(path, json).with_context(|| format!("write config file {}", path.display()))
    }

    /// Replace values that would stall, disable or overflow the timers.
    pub fn sanitize(&mut self) -> Vec<String> {
        let mut fixes = Vec::new();
        clamp(
            "check_interval_secs",
            &mut self.check_interval_secs,
            MAX_INTERVAL_SECS,
            default_check_interval(),
            &mut fixes,
        );
        clamp(
            "full_restart_interval_secs",
            &mut self.full_restart_interval_secs,
            MAX_INTERVAL_SECS,
            default_full_restart_interval(),
            &mut fixes,
        );
        if self.hook_timeout_secs > MAX_WAIT_SECS {
            fixes.push(format!(
                "hook_timeout_secs {} is above {MAX_WAIT_SECS}; using {MAX_WAIT_SECS}",
                self.hook_timeout_secs
            ));
            self.hook_timeout_secs = MAX_WAIT_SECS;
        }
        if self.supervision.delay_secs > MAX_WAIT_SECS {
            fixes.push(format!(
                "supervision.delay_secs {} is above {MAX_WAIT_SECS}; using {MAX_WAIT_SECS}",
                self.supervision.delay_secs
            ));
            self.supervision.delay_secs = MAX_WAIT_SECS;
        }
        clamp(
            "supervision.alive_timeout_secs",
            &mut self.supervision.alive_timeout_secs,
            MAX_WAIT_SECS,
            default_alive_timeout(),
            &mut fixes,
        );
        self.services.retain(|s| !s.trim().is_empty());
        if self.services.is_empty() {
            fixes.push("no service to monitor; using the default list".into());
            self.services = default_services();
        }
        fixes
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn full_restart_interval(&self) -> Duration {
        Duration::from_secs(self.full_restart_interval_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    /// Settings file path, defaulting to a file next to the executable.
    pub fn settings_path(&self) -> Result<PathBuf> {
        match &self.settings_file {
            Some(path) => Ok(path.clone()),
            None => path_next_to_exe(SETTINGS_FILE_NAME),
        }
    }
}

/// Zero falls back to `default`, anything above `max` is capped.
fn clamp(field: &str, value: &mut u64, max: u64, default: u64, fixes: &mut Vec<String>) {
    if *value == 0 {
        fixes.push(format!("{field} must be positive; using {default}"));
        *value = default;
    } else if *value > max {
        fixes.push(format!("{field} {value} is above {max}; using {max}"));
        *value = max;
    }
}

pub fn path_from_exe_path(exe_path: &Path, file_name: &str) -> Result<PathBuf> {
    let parent = exe_path
        .parent()
        .ok_or_else(|| anyhow!("executable path has no parent: {}", exe_path.display()))?;
    Ok(parent.join(file_name))
}

pub fn path_next_to_exe(file_name: &str) -> Result<PathBuf> {
    let exe_path = std::env::current_exe().context("resolve current executable")?;
    path_from_exe_path(&exe_path, file_name)
}

/// Resolve the configuration file, honouring [`CONFIG_PATH_ENV`].
pub fn resolve_config_path() -> Result<PathBuf> {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => path_next_to_exe(CONFIG_FILE_NAME),
    }
}
