use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Liveness record shared between a supervised process and its watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub pid: u32,
    pub last_alive: DateTime<Utc>,
    #[serde(default)]
    pub cancelled: bool,
}

impl HeartbeatRecord {
    pub fn alive_now(pid: u32) -> Self {
        Self {
            pid,
            last_alive: Utc::now(),
            cancelled: false,
        }
    }

    /// Whether the record has not been refreshed within `timeout` of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return false;
        };
        match self.last_alive.checked_add_signed(timeout) {
            Some(deadline) => deadline < now,
            None => false,
        }
    }
}

/// Default location of the heartbeat file for the supervision `name`.
pub fn heartbeat_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.supervision.json"))
}

#[derive(Debug, Clone)]
pub struct HeartbeatFile {
    path: PathBuf,
}

impl HeartbeatFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record; a missing or half-written file reads as `None`.
    pub fn read(&self) -> Option<HeartbeatRecord> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn write(&self, record: &HeartbeatRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn staleness_uses_alive_timeout() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let record = HeartbeatRecord {
            pid: 1,
            last_alive: t0,
            cancelled: false,
        };
        let timeout = Duration::from_secs(60);
        assert!(!record.is_stale(t0 + chrono::Duration::seconds(60), timeout));
        assert!(record.is_stale(t0 + chrono::Duration::seconds(61), timeout));
    }

    #[test]
    fn file_roundtrip_and_garbage() {
        let dir = tempdir().unwrap();
        let file = HeartbeatFile::new(dir.path().join("hb.json"));
        assert!(file.read().is_none());

        let record = HeartbeatRecord::alive_now(42);
        file.write(&record).unwrap();
        assert_eq!(file.read(), Some(record));

        std::fs::write(file.path(), "{ half").unwrap();
        assert!(file.read().is_none());
    }
}
