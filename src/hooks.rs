//! Side tasks run while the services are briefly unlocked.
//!
//! Hooks are resolved by name from a [`HookRegistry`] at startup. A hook that
//! is due gets the services unlocked, runs bounded by a timeout, and the
//! services are locked again whatever the hook reports.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

pub trait PostUnlockHook: Send {
    fn name(&self) -> &str;
    /// Whether the hook wants to run on this tick.
    fn is_due(&self) -> bool;
    /// Run the hook, returning within `timeout`.
    fn run(&self, timeout: Duration) -> Result<()>;
}

pub type HookFactory = fn() -> Box<dyn PostUnlockHook>;

/// Table of hook implementations by name.
#[derive(Default)]
pub struct HookRegistry {
    factories: BTreeMap<String, HookFactory>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the hooks shipped with the tool.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(DEFENDER_HOOK_NAME, || -> Box<dyn PostUnlockHook> {
            Box::new(DefenderSignatureHook::new())
        });
        registry
    }

    pub fn register(&mut self, name: &str, factory: HookFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|k| k.as_str())
    }

    /// Instantiate the hooks listed in `names`, skipping unknown entries.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Vec<Box<dyn PostUnlockHook>> {
        names
            .iter()
            .filter_map(|name| {
                let name = name.as_ref();
                match self.factories.get(name) {
                    Some(factory) => Some(factory()),
                    None => {
                        tracing::warn!("unknown post-unlock hook '{name}' ignored");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Wait for `child` at most `timeout`, killing it when the time is up.
///
/// Returns `Ok(None)` when the child had to be killed.
pub fn wait_bounded(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    let Some(deadline) = Instant::now().checked_add(timeout) else {
        return child.wait().map(Some).context("wait for child process");
    };
    loop {
        if let Some(status) = child.try_wait().context("poll child process")? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(250)));
    }
}

pub const DEFENDER_HOOK_NAME: &str = "defender";

/// Triggers a Windows Defender signature update when the last attempt is
/// older than a day.
pub struct DefenderSignatureHook;

impl DefenderSignatureHook {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DefenderSignatureHook {
    fn default() -> Self {
        Self::new()
    }
}

/// Due when the last attempt is at least 23 hours old; dates more than 1000
/// days in the past are treated as inconsistent.
pub fn signature_update_due(last_attempt: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    last_attempt + ChronoDuration::hours(23) <= now && last_attempt + ChronoDuration::days(1000) >= now
}

/// Convert a FILETIME tick count (100ns since 1601-01-01) to a UTC date.
pub fn filetime_to_utc(ticks: i64) -> Option<DateTime<Utc>> {
    const TICKS_PER_SECOND: i64 = 10_000_000;
    const EPOCH_DIFFERENCE_SECS: i64 = 11_644_473_600;
    let secs = ticks.div_euclid(TICKS_PER_SECOND) - EPOCH_DIFFERENCE_SECS;
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

#[cfg(target_os = "windows")]
mod defender {
    use crate::registry::RegKey;
    use chrono::{DateTime, Utc};
    use std::path::{Path, PathBuf};

    const SIGNATURE_UPDATES_PATH: &str = r"SOFTWARE\Microsoft\Windows Defender\Signature Updates";
    const DEFENDER_PATH: &str = r"SOFTWARE\Microsoft\Windows Defender";

    pub fn last_update_attempt() -> Option<DateTime<Utc>> {
        tracing::debug!("Reading last Windows Defender date");
        let key = RegKey::open_local_machine(SIGNATURE_UPDATES_PATH, false).ok()?;
        let data = key.get_binary("SignatureUpdateLastAttempted").ok()??;
        let bytes: [u8; 8] = data.get(..8)?.try_into().ok()?;
        let result = super::filetime_to_utc(i64::from_le_bytes(bytes));
        if let Some(date) = result {
            tracing::debug!("Last Windows Defender date: {date}");
        }
        result
    }

    pub fn location() -> Option<PathBuf> {
        tracing::debug!("Reading Windows Defender location");
        let key = RegKey::open_local_machine(DEFENDER_PATH, false).ok()?;
        let exe = key.get_string("RemediationExe").ok()??;
        let dir = Path::new(&exe).parent()?.to_path_buf();
        tracing::debug!("Windows Defender location: {}", dir.display());
        Some(dir)
    }
}

#[cfg(not(target_os = "windows"))]
mod defender {
    use chrono::{DateTime, Utc};
    use std::path::PathBuf;

    pub fn last_update_attempt() -> Option<DateTime<Utc>> {
        None
    }

    pub fn location() -> Option<PathBuf> {
        None
    }
}

pub(crate) fn no_window(command: &mut Command) -> &mut Command {
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }
    command
}

impl PostUnlockHook for DefenderSignatureHook {
    fn name(&self) -> &str {
        DEFENDER_HOOK_NAME
    }

    fn is_due(&self) -> bool {
        match defender::last_update_attempt() {
            Some(last) => signature_update_due(last, Utc::now()),
            None => false,
        }
    }

    fn run(&self, timeout: Duration) -> Result<()> {
        let dir: PathBuf = defender::location().context("Windows Defender location unknown")?;
        let program = dir.join("MpCmdRun.exe");
        tracing::info!("Starting {} -SignatureUpdate", program.display());

        let started = Instant::now();
        let mut command = Command::new(&program);
        command.arg("-SignatureUpdate").current_dir(&dir);
        let mut child = no_window(&mut command)
            .spawn()
            .with_context(|| format!("start {}", program.display()))?;
        tracing::debug!("Started");

        match wait_bounded(&mut child, timeout)? {
            Some(status) => tracing::info!("Completed in: {:?} ({status})", started.elapsed()),
            None => tracing::warn!("Signature update killed after {:?}", timeout),
        }
        Ok(())
    }
}
