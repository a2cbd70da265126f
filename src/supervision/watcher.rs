//! The watcher side of supervision: a copy of the executable started with
//! [`WATCHER_ENV`] set, which relaunches its parent when it dies or stops
//! sending heartbeats.

use super::heartbeat::{heartbeat_path, HeartbeatFile, HeartbeatRecord};
use super::{PARENT_PID_ENV, RESTART_ENV, WATCHER_ENV};
use crate::settings::SupervisionConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::process::Command;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const EXIT_WAIT: Duration = Duration::from_secs(10);

/// Parameters handed to a watcher process through its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherRequest {
    pub name: String,
    pub parent_pid: u32,
}

/// Returns the watcher parameters when this process was started as a watcher.
pub fn watcher_request() -> Option<WatcherRequest> {
    let name = std::env::var(WATCHER_ENV).ok()?;
    let parent_pid = std::env::var(PARENT_PID_ENV).ok()?.parse().ok()?;
    Some(WatcherRequest { name, parent_pid })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaunchReason {
    Exited,
    Unresponsive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Cancelled,
    /// Another process owns the heartbeat; this watcher is obsolete.
    Superseded,
    Relaunch(RelaunchReason),
}

pub fn assess(
    record: Option<&HeartbeatRecord>,
    parent_pid: u32,
    parent_alive: bool,
    now: DateTime<Utc>,
    alive_timeout: Duration,
) -> Verdict {
    if let Some(record) = record {
        if record.pid != parent_pid {
            return Verdict::Superseded;
        }
        if record.cancelled {
            return Verdict::Cancelled;
        }
    }
    if !parent_alive {
        return Verdict::Relaunch(RelaunchReason::Exited);
    }
    match record {
        Some(record) if record.is_stale(now, alive_timeout) => {
            Verdict::Relaunch(RelaunchReason::Unresponsive)
        }
        _ => Verdict::Healthy,
    }
}

fn process_alive(system: &mut System, pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|p| p.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

fn kill_process(system: &mut System, pid: u32) {
    if let Some(process) = system.process(Pid::from_u32(pid)) {
        if !process.kill() {
            tracing::warn!("unable to kill process {pid}");
        }
    }
    let deadline = Instant::now() + EXIT_WAIT;
    while Instant::now() < deadline && process_alive(system, pid) {
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn relaunch() -> Result<()> {
    let exe = std::env::current_exe().context("resolve current executable")?;
    let mut command = Command::new(&exe);
    command
        .args(std::env::args_os().skip(1))
        .env(RESTART_ENV, "1")
        .env_remove(WATCHER_ENV)
        .env_remove(PARENT_PID_ENV);
    crate::hooks::no_window(&mut command)
        .spawn()
        .with_context(|| format!("relaunch {}", exe.display()))?;
    Ok(())
}

/// Watch the parent until it exits intentionally, relaunching it once if it
/// dies or hangs. The relaunched process starts its own watcher.
pub fn run_watcher(request: &WatcherRequest, config: &SupervisionConfig) -> Result<()> {
    tracing::info!(
        "Watching process {} for {}",
        request.parent_pid,
        request.name
    );
    let file = HeartbeatFile::new(heartbeat_path(&request.name));
    let mut system = System::new();

    let grace_end = Instant::now().checked_add(config.delay());
    loop {
        let record = file.read();
        let alive = process_alive(&mut system, request.parent_pid);
        let in_grace = grace_end.map_or(true, |end| Instant::now() < end);

        let verdict = assess(
            record.as_ref(),
            request.parent_pid,
            alive,
            Utc::now(),
            config.alive_timeout(),
        );
        match verdict {
            Verdict::Healthy => {}
            Verdict::Cancelled => {
                tracing::info!("Supervision cancelled, watcher exiting");
                return Ok(());
            }
            Verdict::Superseded => {
                tracing::debug!("heartbeat owned by another process, watcher exiting");
                return Ok(());
            }
            Verdict::Relaunch(RelaunchReason::Unresponsive) if in_grace => {}
            Verdict::Relaunch(reason) => {
                tracing::warn!(
                    "Process {} {:?}, relaunching",
                    request.parent_pid,
                    reason
                );
                if alive {
                    kill_process(&mut system, request.parent_pid);
                }
                return relaunch();
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
