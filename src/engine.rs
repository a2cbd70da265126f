//! Reconciliation of the monitored services against the persisted lock intent.
//!
//! The engine is owned by the event loop thread and mutated only there. Each
//! tick it reads the desired lock fresh from the settings store, compares the
//! live start mode of every monitored service with the one seen on the
//! previous tick, and re-asserts the desired mode when something else changed
//! it.

use crate::hooks::PostUnlockHook;
use crate::service::{ServiceControl, ServiceEntry, ServiceError, ServiceStatus, StartMode};
use crate::settings_store::{SettingsStore, ALLOW_DEFENDER_SETTING, LOCKED_SETTING};
use crate::supervision::Heartbeat;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const TOOLTIP: &str = "Lock/Unlock Windows updates";
const TOOLTIP_NOT_ELEVATED_SUFFIX: &str = " (Requires administrator mode)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Unknown,
    Unlocked,
    Locked,
}

impl LockState {
    pub fn from_start_mode(mode: Option<StartMode>) -> Self {
        match mode {
            None => LockState::Unknown,
            Some(StartMode::Disabled) => LockState::Locked,
            Some(_) => LockState::Unlocked,
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Unknown => write!(f, "Unknown"),
            LockState::Unlocked => write!(f, "Unlocked"),
            LockState::Locked => write!(f, "Locked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredService {
    pub name: String,
    /// Start mode seen on the previous tick, or set by the last successful change.
    pub last_observed: Option<StartMode>,
}

/// Result of one reconciliation tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The service list could not be read; nothing was touched.
    Skipped,
    Completed {
        /// Services whose start mode drifted since the previous tick.
        drifted: Vec<String>,
        /// Services for which a stop request was issued.
        stopped: Vec<String>,
    },
}

/// Result of a start mode change for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    Changed,
    /// The service manager refused the change but the raw start type write stuck.
    ChangedByFallback,
    AlreadyInMode,
    NotElevated,
    NotFound,
    /// The raw start type was written but reads back another value.
    FallbackMismatch { found: u32 },
    /// The raw start type was written but cannot be read back.
    FallbackUnreadable,
    FallbackFailed,
}

impl ChangeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ChangeOutcome::Changed | ChangeOutcome::ChangedByFallback | ChangeOutcome::AlreadyInMode
        )
    }
}

pub struct ReconcileEngine {
    is_elevated: bool,
    settings: Arc<dyn SettingsStore>,
    services: Arc<dyn ServiceControl>,
    monitored: Vec<MonitoredService>,
    /// Last desired lock read successfully; used when the store fails.
    last_desired_lock: bool,
    icon_changed: bool,
    menu_changed: bool,
    heartbeat: Option<Arc<dyn Heartbeat>>,
    hooks: Vec<Box<dyn PostUnlockHook>>,
    hook_timeout: Duration,
}

impl ReconcileEngine {
    pub fn new<S: AsRef<str>>(
        is_elevated: bool,
        settings: Arc<dyn SettingsStore>,
        services: Arc<dyn ServiceControl>,
        service_names: &[S],
    ) -> Self {
        tracing::debug!("InitServiceManager starting");

        let mut monitored: Vec<MonitoredService> = service_names
            .iter()
            .map(|name| MonitoredService {
                name: name.as_ref().to_string(),
                last_observed: None,
            })
            .collect();

        let mut last_desired_lock = true;
        if settings.is_value_set(LOCKED_SETTING) {
            // Seed the previous observation with the persisted intent so that
            // a service left in another mode is corrected on the first tick.
            match settings.get_bool(LOCKED_SETTING, true) {
                Ok(lock_it) => {
                    last_desired_lock = lock_it;
                    let mode = StartMode::for_lock(lock_it);
                    for service in &mut monitored {
                        service.last_observed = Some(mode);
                    }
                }
                Err(err) => tracing::warn!("(from InitServiceManager) {err}"),
            }
        }

        Self {
            is_elevated,
            settings,
            services,
            monitored,
            last_desired_lock,
            icon_changed: false,
            menu_changed: false,
            heartbeat: None,
            hooks: Vec::new(),
            hook_timeout: Duration::from_secs(300),
        }
    }

    /// Heartbeat signalled at the end of every tick.
    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn Heartbeat>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn set_heartbeat(&mut self, heartbeat: Arc<dyn Heartbeat>) {
        self.heartbeat = Some(heartbeat);
    }

    /// Hooks run after a brief unlock, each bounded by `timeout`.
    pub fn with_hooks(mut self, hooks: Vec<Box<dyn PostUnlockHook>>, timeout: Duration) -> Self {
        self.hooks = hooks;
        self.hook_timeout = timeout;
        self
    }

    pub fn is_elevated(&self) -> bool {
        self.is_elevated
    }

    pub fn monitored(&self) -> &[MonitoredService] {
        &self.monitored
    }

    /// Run one reconciliation pass.
    pub fn reconcile(&mut self) -> TickOutcome {
        if let Err(err) = self.settings.renew_key() {
            tracing::warn!("(from reconcile) unable to renew settings key: {err}");
        } else {
            tracing::debug!("Key renewed");
        }

        let outcome = self.update_lock();
        if let TickOutcome::Completed { .. } = outcome {
            self.run_post_unlock_hooks();
        }

        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.set_alive();
        }
        outcome
    }

    fn desired_lock(&mut self) -> bool {
        match self.settings.get_bool(LOCKED_SETTING, true) {
            Ok(lock_it) => {
                self.last_desired_lock = lock_it;
                lock_it
            }
            Err(err) => {
                tracing::warn!(
                    "lock setting unreadable, keeping lock={}: {err}",
                    self.last_desired_lock
                );
                self.last_desired_lock
            }
        }
    }

    fn update_lock(&mut self) -> TickOutcome {
        let previous: Vec<Option<StartMode>> =
            self.monitored.iter().map(|s| s.last_observed).collect();
        let lock_it = self.desired_lock();
        tracing::debug!("Lock setting read: {lock_it}");

        let names: Vec<&str> = self.monitored.iter().map(|s| s.name.as_str()).collect();
        let entries = match self.services.enumerate_services(&names) {
            Ok(entries) if !entries.is_empty() => entries,
            Ok(_) => {
                tracing::error!("Failed to get services: empty list");
                return TickOutcome::Skipped;
            }
            Err(err) => {
                tracing::error!("Failed to get services: {err}");
                return TickOutcome::Skipped;
            }
        };
        tracing::debug!("Found {} service(s)", entries.len());

        let mut drifted = Vec::new();
        let mut stopped = Vec::new();
        for idx in 0..self.monitored.len() {
            let Some(entry) = entries.iter().find(|e| e.name == self.monitored[idx].name) else {
                continue;
            };
            if self.update_service(idx, entry, previous[idx], lock_it) {
                drifted.push(entry.name.clone());
            }
            if self.stop_if_running(entry, lock_it) {
                stopped.push(entry.name.clone());
            }
        }

        TickOutcome::Completed { drifted, stopped }
    }

    /// Returns `true` when the start mode drifted since the previous tick.
    fn update_service(
        &mut self,
        idx: usize,
        entry: &ServiceEntry,
        previous: Option<StartMode>,
        lock_it: bool,
    ) -> bool {
        tracing::debug!("Checking {}", entry.name);

        let Some(current) = entry.start_mode else {
            tracing::warn!("Start type of {} cannot be read", entry.name);
            return false;
        };
        self.monitored[idx].last_observed = Some(current);
        tracing::debug!("Current start type: {current}");

        match previous {
            Some(previous) if previous != current => {
                tracing::info!("Start type changed ({}: {previous} -> {current})", entry.name);
                self.icon_changed = true;
                self.change_service_lock_mode(idx, lock_it);
                true
            }
            _ => false,
        }
    }

    /// Locking means disabled and not running; unlocking never starts anything.
    fn stop_if_running(&self, entry: &ServiceEntry, lock_it: bool) -> bool {
        if !lock_it || entry.status != ServiceStatus::Running || !entry.can_stop {
            return false;
        }
        if !self.is_elevated {
            tracing::debug!("Not elevated, {} left running", entry.name);
            return false;
        }

        tracing::info!("Stopping service {}", entry.name);
        match self.services.stop_service(&entry.name) {
            Ok(()) => tracing::info!("Service {} stopped", entry.name),
            Err(err) => tracing::error!("Stopping service {} failed: {err}", entry.name),
        }
        true
    }

    /// Apply `lock_it` to every monitored service.
    pub fn change_lock_mode(&mut self, lock_it: bool) -> Vec<(String, ChangeOutcome)> {
        tracing::debug!("ChangeLockMode starting");

        if !self.is_elevated {
            tracing::warn!("Not elevated, cannot change");
            return self
                .monitored
                .iter()
                .map(|s| (s.name.clone(), ChangeOutcome::NotElevated))
                .collect();
        }

        (0..self.monitored.len())
            .map(|idx| {
                let outcome = self.change_service_lock_mode(idx, lock_it);
                (self.monitored[idx].name.clone(), outcome)
            })
            .collect()
    }

    fn change_service_lock_mode(&mut self, idx: usize, lock_it: bool) -> ChangeOutcome {
        let name = self.monitored[idx].name.clone();
        let target = StartMode::for_lock(lock_it);

        if !self.is_elevated {
            tracing::warn!("Not elevated, cannot change {name}");
            return ChangeOutcome::NotElevated;
        }

        // Drift onto the desired mode needs no privileged call.
        if self.monitored[idx].last_observed == Some(target) && self.services_agree(&name, target) {
            return ChangeOutcome::AlreadyInMode;
        }

        match self.services.change_start_mode(&name, target) {
            Ok(()) => {
                self.record_change(idx, target);
                tracing::info!("Service {name} type={target}");
                ChangeOutcome::Changed
            }
            Err(ServiceError::NotFound(_)) => {
                tracing::warn!("Service {name} does not exist, nothing to change");
                ChangeOutcome::NotFound
            }
            Err(err) => {
                tracing::warn!(
                    "ChangeStartMode({name}, {target}) failed, error: {}",
                    err.code().map(|c| c.to_string()).unwrap_or_else(|| err.to_string())
                );
                self.change_raw_start_type(idx, target)
            }
        }
    }

    /// Live mode check used to skip redundant writes.
    fn services_agree(&self, name: &str, target: StartMode) -> bool {
        matches!(self.services.start_mode(name), Ok(mode) if mode == target)
    }

    fn change_raw_start_type(&mut self, idx: usize, target: StartMode) -> ChangeOutcome {
        let name = self.monitored[idx].name.clone();
        let value = target.as_raw();

        if let Err(err) = self.services.write_raw_start_type(&name, value) {
            tracing::error!("Setting raw start type of {name} to {value} failed, error: {err}");
            return ChangeOutcome::FallbackFailed;
        }

        match self.services.read_raw_start_type(&name) {
            Ok(Some(found)) if found == value => {
                tracing::info!("Raw start type of {name} changed to {value}");
                tracing::info!("Service {name} type={target}");
                self.record_change(idx, target);
                ChangeOutcome::ChangedByFallback
            }
            Ok(Some(found)) => {
                tracing::error!("Raw start type of {name} is {found}, unable to change value to {value}");
                ChangeOutcome::FallbackMismatch { found }
            }
            Ok(None) => {
                tracing::error!("Raw start type of {name} cannot be read back");
                ChangeOutcome::FallbackUnreadable
            }
            Err(err) => {
                tracing::error!("Raw start type of {name} cannot be read back: {err}");
                ChangeOutcome::FallbackUnreadable
            }
        }
    }

    fn record_change(&mut self, idx: usize, mode: StartMode) {
        self.monitored[idx].last_observed = Some(mode);
        self.icon_changed = true;
    }

    fn run_post_unlock_hooks(&mut self) {
        if self.hooks.is_empty() || !self.is_elevated {
            return;
        }
        if !self.last_desired_lock || !self.is_defender_enabled() {
            return;
        }

        let hooks = std::mem::take(&mut self.hooks);
        for hook in &hooks {
            if !hook.is_due() {
                continue;
            }
            tracing::info!("Unlocking for {}", hook.name());
            self.change_lock_mode(false);
            if let Err(err) = hook.run(self.hook_timeout) {
                tracing::debug!("(from {}) {err:#}", hook.name());
            }
            self.change_lock_mode(true);
            tracing::info!("Locked again after {}", hook.name());
        }
        self.hooks = hooks;
    }

    /// Flip the persisted lock intent and apply it right away.
    pub fn toggle_lock(&mut self) {
        let lock_it = !self.is_lock_enabled();
        if let Err(err) = self.settings.set_bool(LOCKED_SETTING, lock_it) {
            tracing::error!("(from toggle_lock) {err}");
        }
        self.last_desired_lock = lock_it;
        self.change_lock_mode(lock_it);
        self.menu_changed = true;
    }

    pub fn toggle_allow_defender(&mut self) {
        let allow = !self.is_defender_enabled();
        if let Err(err) = self.settings.set_bool(ALLOW_DEFENDER_SETTING, allow) {
            tracing::error!("(from toggle_allow_defender) {err}");
        }
        self.menu_changed = true;
    }

    pub fn is_defender_enabled(&self) -> bool {
        self.settings
            .get_bool(ALLOW_DEFENDER_SETTING, false)
            .unwrap_or(false)
    }

    /// Lock state of the primary (first) monitored service.
    pub fn current_lock_state(&self) -> LockState {
        LockState::from_start_mode(self.monitored.first().and_then(|s| s.last_observed))
    }

    pub fn is_lock_enabled(&self) -> bool {
        self.current_lock_state() == LockState::Locked
    }

    /// The lock command is usable once a start mode is known and the process
    /// may write it.
    pub fn lock_command_enabled(&self) -> bool {
        self.is_elevated && self.monitored.iter().any(|s| s.last_observed.is_some())
    }

    pub fn tooltip(&self) -> String {
        if self.is_elevated {
            TOOLTIP.to_string()
        } else {
            format!("{TOOLTIP}{TOOLTIP_NOT_ELEVATED_SUFFIX}")
        }
    }

    /// Consume the "icon changed" flag.
    pub fn take_icon_changed(&mut self) -> bool {
        std::mem::take(&mut self.icon_changed)
    }

    /// Consume the "menu changed" flag.
    pub fn take_menu_changed(&mut self) -> bool {
        std::mem::take(&mut self.menu_changed)
    }
}
