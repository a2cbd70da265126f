//! Single instance enforcement and self-restart of the reconciler.
//!
//! The running instance holds a named [`InstanceGuard`] and spawns a watcher
//! copy of itself. The engine refreshes a heartbeat file every tick through
//! [`Heartbeat::set_alive`]; the watcher relaunches the instance when the
//! heartbeat goes stale or the process disappears. Supervision is cancelled
//! on a graceful exit so no relaunch happens afterwards.

mod heartbeat;
mod instance;
mod watcher;

pub use heartbeat::{heartbeat_path, HeartbeatFile, HeartbeatRecord};
pub use instance::InstanceGuard;
pub use watcher::{assess, run_watcher, watcher_request, RelaunchReason, Verdict, WatcherRequest};

use crate::settings::SupervisionConfig;
use anyhow::{Context, Result};
use std::io;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Set on a watcher process; holds the supervision name.
pub const WATCHER_ENV: &str = "UPDATE_LOCK_WATCHER";
/// Pid of the process a watcher supervises.
pub const PARENT_PID_ENV: &str = "UPDATE_LOCK_PARENT_PID";
/// Set on a process relaunched by its watcher.
pub const RESTART_ENV: &str = "UPDATE_LOCK_RESTARTED";

/// Liveness signal raised at the end of every reconciliation tick.
pub trait Heartbeat: Send + Sync {
    fn set_alive(&self);
}

/// Whether this process was launched by a watcher rather than by the user.
pub fn is_restart() -> bool {
    std::env::var(RESTART_ENV).map(|v| v == "1").unwrap_or(false)
}

pub type WatcherSpawner = Box<dyn Fn() -> io::Result<Child> + Send + Sync>;

fn spawn_watcher_process(name: &str) -> io::Result<Child> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command
        .args(std::env::args_os().skip(1))
        .env(WATCHER_ENV, name)
        .env(PARENT_PID_ENV, std::process::id().to_string());
    crate::hooks::no_window(&mut command).spawn()
}

/// Supervision owned by the running instance.
pub struct SupervisionHandle {
    pid: u32,
    file: HeartbeatFile,
    spawner: WatcherSpawner,
    watcher: Mutex<Option<Child>>,
    spawned: AtomicUsize,
    cancelled: AtomicBool,
}

impl SupervisionHandle {
    /// Write the first heartbeat and start the watcher process.
    pub fn start(config: &SupervisionConfig) -> Result<Self> {
        let name = config.name.clone();
        Self::start_with(
            HeartbeatFile::new(heartbeat_path(&config.name)),
            Box::new(move || spawn_watcher_process(&name)),
        )
    }

    pub fn start_with(file: HeartbeatFile, spawner: WatcherSpawner) -> Result<Self> {
        let handle = Self {
            pid: std::process::id(),
            file,
            spawner,
            watcher: Mutex::new(None),
            spawned: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        };
        handle
            .file
            .write(&HeartbeatRecord::alive_now(handle.pid))
            .context("write initial heartbeat")?;
        let child = handle.spawn_watcher()?;
        *handle.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
        tracing::info!(
            "Supervision started (heartbeat {})",
            handle.file.path().display()
        );
        Ok(handle)
    }

    fn spawn_watcher(&self) -> Result<Child> {
        let child = (self.spawner)().context("spawn watcher process")?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("watcher process {} started", child.id());
        Ok(child)
    }

    /// Respawn the watcher when it died, so the relaunch chain never breaks.
    fn ensure_watcher(&self) {
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        let exited = match watcher.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        };
        if !exited {
            return;
        }
        tracing::warn!("Watcher process gone, restarting it");
        match self.spawn_watcher() {
            Ok(child) => *watcher = Some(child),
            Err(err) => {
                *watcher = None;
                tracing::error!("(from ensure_watcher) {err:#}");
            }
        }
    }

    /// Number of watcher processes spawned so far.
    pub fn watchers_spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn heartbeat_file(&self) -> &HeartbeatFile {
        &self.file
    }

    /// Tell the watcher the coming exit is intentional.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let record = HeartbeatRecord {
            cancelled: true,
            ..HeartbeatRecord::alive_now(self.pid)
        };
        if let Err(err) = self.file.write(&record) {
            tracing::error!("(from cancel) {err:#}");
        }
        tracing::info!("Supervision cancelled");
    }
}

impl Heartbeat for SupervisionHandle {
    fn set_alive(&self) {
        if self.is_cancelled() {
            return;
        }
        if let Err(err) = self.file.write(&HeartbeatRecord::alive_now(self.pid)) {
            tracing::warn!("(from set_alive) {err:#}");
        }
        self.ensure_watcher();
    }
}

impl Drop for SupervisionHandle {
    fn drop(&mut self) {
        // Reap the watcher if it already left; a live one exits on its own
        // once it sees the cancelled record.
        if let Some(child) = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            let _ = child.try_wait();
        }
    }
}
