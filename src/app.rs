//! Wiring of the engine, the tick scheduler and supervision around a single
//! event loop.
//!
//! Every mutation of the engine happens on the thread calling [`App::run`].
//! Timer threads and the UI layer only send [`AppEvent`]s.

use crate::engine::{LockState, ReconcileEngine};
use crate::hooks::HookRegistry;
use crate::scheduler::{TickScheduler, MAX_PENDING_TICKS};
use crate::service::ServiceControl;
use crate::settings::AppConfig;
use crate::settings_store::SettingsStore;
use crate::supervision::{self, InstanceGuard, SupervisionHandle};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

/// User commands issued from the tray menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ToggleLock,
    ToggleAllowDefender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    Tick,
    Command(Command),
    Exit,
}

/// Snapshot handed to the UI layer whenever the icon or the menu must change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrayState {
    pub lock_state: LockState,
    pub tooltip: String,
    pub lock_enabled: bool,
    pub defender_enabled: bool,
    pub lock_command_enabled: bool,
}

impl TrayState {
    fn from_engine(engine: &ReconcileEngine) -> Self {
        Self {
            lock_state: engine.current_lock_state(),
            tooltip: engine.tooltip(),
            lock_enabled: engine.is_lock_enabled(),
            defender_enabled: engine.is_defender_enabled(),
            lock_command_enabled: engine.lock_command_enabled(),
        }
    }
}

/// UI collaborator told about state changes.
pub trait Notifier: Send {
    fn state_changed(&self, state: &TrayState);
}

/// Notifier used when no UI is attached.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn state_changed(&self, state: &TrayState) {
        tracing::info!(
            "Lock state: {} (defender updates allowed: {})",
            state.lock_state,
            state.defender_enabled
        );
    }
}

/// Cloneable handle for requesting work from the event loop.
#[derive(Clone)]
pub struct AppHandle {
    sender: SyncSender<AppEvent>,
    exit_requested: Arc<AtomicBool>,
}

impl AppHandle {
    /// Ask the event loop to shut down. Never blocks.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
        // A full queue still wakes the loop, which checks the flag.
        let _ = self.sender.try_send(AppEvent::Exit);
    }

    pub fn send_command(&self, command: Command) -> bool {
        match self.sender.try_send(AppEvent::Command(command)) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => self.sender.send(event).is_ok(),
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// External collaborators the application is built from.
pub struct Collaborators {
    pub is_elevated: bool,
    pub settings: Arc<dyn SettingsStore>,
    pub services: Arc<dyn ServiceControl>,
    pub notifier: Box<dyn Notifier>,
}

/// Result of [`App::start`].
pub enum Startup {
    Started(App),
    /// Another instance holds the instance handle.
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub ticks: u64,
    pub commands: u64,
}

pub struct App {
    engine: ReconcileEngine,
    scheduler: TickScheduler,
    supervision: Option<Arc<SupervisionHandle>>,
    instance: Option<InstanceGuard>,
    notifier: Box<dyn Notifier>,
    receiver: Receiver<AppEvent>,
    handle: AppHandle,
    summary: RunSummary,
}

impl App {
    /// Acquire the instance handle and build every component.
    ///
    /// Supervision is started when enabled in `config`; a failure to start it
    /// is logged and the application runs without self-healing.
    pub fn start(config: &AppConfig, collaborators: Collaborators) -> Result<Startup> {
        Self::start_with_hooks(config, collaborators, &HookRegistry::with_builtin())
    }

    /// Like [`App::start`], resolving `config.post_unlock_hooks` from `hooks`.
    pub fn start_with_hooks(
        config: &AppConfig,
        collaborators: Collaborators,
        hooks: &HookRegistry,
    ) -> Result<Startup> {
        let Some(instance) = InstanceGuard::acquire(&config.supervision.name)? else {
            tracing::warn!("Another instance is already running, exiting");
            return Ok(Startup::AlreadyRunning);
        };

        if supervision::is_restart() {
            tracing::info!("Process relaunched by its watcher");
        }

        let mut app = Self::build(config, instance, collaborators, hooks);
        if config.supervision.enabled {
            match SupervisionHandle::start(&config.supervision) {
                Ok(handle) => app = app.with_supervision(Arc::new(handle)),
                Err(err) => tracing::error!("Supervision not started: {err:#}"),
            }
        }
        Ok(Startup::Started(app))
    }

    fn build(
        config: &AppConfig,
        instance: InstanceGuard,
        collaborators: Collaborators,
        hooks: &HookRegistry,
    ) -> Self {
        let (sender, receiver) = mpsc::sync_channel(MAX_PENDING_TICKS);
        let hooks = hooks.resolve(&config.post_unlock_hooks);
        let engine = ReconcileEngine::new(
            collaborators.is_elevated,
            collaborators.settings,
            collaborators.services,
            &config.services,
        )
        .with_hooks(hooks, config.hook_timeout());
        let scheduler = TickScheduler::new(
            config.check_interval(),
            config.full_restart_interval(),
            sender.clone(),
        );

        Self {
            engine,
            scheduler,
            supervision: None,
            instance: Some(instance),
            notifier: collaborators.notifier,
            receiver,
            handle: AppHandle {
                sender,
                exit_requested: Arc::new(AtomicBool::new(false)),
            },
            summary: RunSummary::default(),
        }
    }

    /// Attach a supervision handle; the engine signals it every tick.
    pub fn with_supervision(mut self, handle: Arc<SupervisionHandle>) -> Self {
        self.engine.set_heartbeat(handle.clone());
        self.supervision = Some(handle);
        self
    }

    pub fn handle(&self) -> AppHandle {
        self.handle.clone()
    }

    pub fn engine(&self) -> &ReconcileEngine {
        &self.engine
    }

    /// Run the event loop until an exit is requested.
    pub fn run(mut self) -> Result<RunSummary> {
        if let Err(err) = self.scheduler.start() {
            self.shutdown();
            return Err(err);
        }
        tracing::info!("Checking every {:?}", self.scheduler.interval());

        while !self.handle.exit_requested.load(Ordering::SeqCst) {
            let Ok(event) = self.receiver.recv() else {
                break;
            };
            match event {
                AppEvent::Tick => self.tick(),
                AppEvent::Command(command) => self.command(command),
                AppEvent::Exit => break,
            }
        }

        self.shutdown();
        Ok(self.summary)
    }

    fn tick(&mut self) {
        self.scheduler.begin_tick();
        let outcome = self.engine.reconcile();
        tracing::debug!("tick outcome: {outcome:?}");
        self.summary.ticks += 1;

        let icon_changed = self.engine.take_icon_changed();
        let menu_changed = self.engine.take_menu_changed();
        if self.summary.ticks == 1 || icon_changed || menu_changed {
            self.publish();
        }
    }

    fn command(&mut self, command: Command) {
        tracing::debug!("command {command:?}");
        match command {
            Command::ToggleLock => self.engine.toggle_lock(),
            Command::ToggleAllowDefender => self.engine.toggle_allow_defender(),
        }
        self.summary.commands += 1;
        self.engine.take_icon_changed();
        self.engine.take_menu_changed();
        self.publish();
    }

    fn publish(&self) {
        self.notifier.state_changed(&TrayState::from_engine(&self.engine));
    }

    /// Cancel supervision, stop the timers, then release the instance handle.
    fn shutdown(&mut self) {
        tracing::info!("Exiting");
        if let Some(supervision) = &self.supervision {
            supervision.cancel();
        }
        self.scheduler.stop();
        self.instance.take();
    }
}
