#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use update_lock::app::{Notifier, TrayState};
use update_lock::service::{ServiceControl, ServiceEntry, ServiceError, ServiceStatus, StartMode};
use update_lock::settings_store::{SettingsError, SettingsStore};
use update_lock::supervision::Heartbeat;

pub const ACCESS_DENIED: u32 = 5;

#[derive(Debug, Clone)]
struct FakeService {
    start_mode: Option<StartMode>,
    status: ServiceStatus,
    can_stop: bool,
    raw: Option<u32>,
}

#[derive(Default)]
struct FakeState {
    services: BTreeMap<String, FakeService>,
    enumerate_fails: bool,
    change_error: Option<u32>,
    change_errors: BTreeMap<String, u32>,
    raw_write_fails: bool,
    raw_sticks: bool,
    raw_unreadable: bool,
    enumerate_calls: usize,
    config_requests: Vec<Vec<String>>,
    change_calls: Vec<(String, StartMode)>,
    stop_calls: Vec<String>,
    raw_writes: Vec<(String, u32)>,
}

/// In-memory service manager recording every mutating call.
#[derive(Clone)]
pub struct FakeServiceControl {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeServiceControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServiceControl {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                raw_sticks: true,
                ..FakeState::default()
            })),
        }
    }

    pub fn with_service(self, name: &str, mode: StartMode, status: ServiceStatus) -> Self {
        self.state.lock().unwrap().services.insert(
            name.to_string(),
            FakeService {
                start_mode: Some(mode),
                status,
                can_stop: true,
                raw: Some(mode.as_raw()),
            },
        );
        self
    }

    /// Simulate another program changing the start mode.
    pub fn set_start_mode(&self, name: &str, mode: StartMode) {
        let mut state = self.state.lock().unwrap();
        let service = state.services.get_mut(name).unwrap();
        service.start_mode = Some(mode);
        service.raw = Some(mode.as_raw());
    }

    pub fn set_status(&self, name: &str, status: ServiceStatus) {
        self.state.lock().unwrap().services.get_mut(name).unwrap().status = status;
    }

    pub fn start_mode_of(&self, name: &str) -> Option<StartMode> {
        self.state.lock().unwrap().services.get(name)?.start_mode
    }

    pub fn status_of(&self, name: &str) -> Option<ServiceStatus> {
        self.state.lock().unwrap().services.get(name).map(|s| s.status)
    }

    pub fn fail_enumerate(&self, fail: bool) {
        self.state.lock().unwrap().enumerate_fails = fail;
    }

    /// Make the primary path fail with `code`.
    pub fn fail_change(&self, code: Option<u32>) {
        self.state.lock().unwrap().change_error = code;
    }

    pub fn fail_change_for(&self, name: &str, code: u32) {
        self.state
            .lock()
            .unwrap()
            .change_errors
            .insert(name.to_string(), code);
    }

    pub fn fail_raw_write(&self, fail: bool) {
        self.state.lock().unwrap().raw_write_fails = fail;
    }

    /// When `false`, raw writes succeed but the stored value stays the same.
    pub fn raw_sticks(&self, sticks: bool) {
        self.state.lock().unwrap().raw_sticks = sticks;
    }

    pub fn raw_unreadable(&self, unreadable: bool) {
        self.state.lock().unwrap().raw_unreadable = unreadable;
    }

    pub fn enumerate_calls(&self) -> usize {
        self.state.lock().unwrap().enumerate_calls
    }

    /// Names whose start mode was requested, per enumeration.
    pub fn config_requests(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().config_requests.clone()
    }

    pub fn change_calls(&self) -> Vec<(String, StartMode)> {
        self.state.lock().unwrap().change_calls.clone()
    }

    pub fn stop_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().stop_calls.clone()
    }

    pub fn raw_writes(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().raw_writes.clone()
    }
}

impl ServiceControl for FakeServiceControl {
    fn enumerate_services(&self, config_for: &[&str]) -> Result<Vec<ServiceEntry>, ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.enumerate_calls += 1;
        state
            .config_requests
            .push(config_for.iter().map(|n| n.to_string()).collect());
        if state.enumerate_fails {
            return Err(ServiceError::Os {
                operation: "EnumServicesStatusEx",
                service: String::new(),
                code: ACCESS_DENIED,
            });
        }
        Ok(state
            .services
            .iter()
            .map(|(name, s)| ServiceEntry {
                name: name.clone(),
                start_mode: s.start_mode.filter(|_| config_for.contains(&name.as_str())),
                status: s.status,
                can_stop: s.can_stop,
            })
            .collect())
    }

    fn start_mode(&self, name: &str) -> Result<StartMode, ServiceError> {
        self.state
            .lock()
            .unwrap()
            .services
            .get(name)
            .and_then(|s| s.start_mode)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    fn change_start_mode(&self, name: &str, mode: StartMode) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.change_calls.push((name.to_string(), mode));
        if let Some(code) = state.change_errors.get(name).copied().or(state.change_error) {
            return Err(ServiceError::Os {
                operation: "ChangeServiceConfig",
                service: name.to_string(),
                code,
            });
        }
        let service = state
            .services
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        service.start_mode = Some(mode);
        service.raw = Some(mode.as_raw());
        Ok(())
    }

    fn stop_service(&self, name: &str) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.stop_calls.push(name.to_string());
        let service = state
            .services
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        service.status = ServiceStatus::Stopped;
        Ok(())
    }

    fn write_raw_start_type(&self, name: &str, value: u32) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.raw_writes.push((name.to_string(), value));
        if state.raw_write_fails {
            return Err(ServiceError::Os {
                operation: "RegSetValueEx",
                service: name.to_string(),
                code: ACCESS_DENIED,
            });
        }
        let sticks = state.raw_sticks;
        let service = state
            .services
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        if sticks {
            service.raw = Some(value);
            service.start_mode = StartMode::from_raw(value);
        }
        Ok(())
    }

    fn read_raw_start_type(&self, name: &str) -> Result<Option<u32>, ServiceError> {
        let state = self.state.lock().unwrap();
        if state.raw_unreadable {
            return Ok(None);
        }
        Ok(state.services.get(name).and_then(|s| s.raw))
    }
}

/// Settings kept in memory, with a switch simulating an unreadable store.
#[derive(Clone, Default)]
pub struct MemorySettingsStore {
    values: Arc<Mutex<HashMap<String, bool>>>,
    failing: Arc<AtomicBool>,
    renewals: Arc<AtomicUsize>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(self, key: &str, value: bool) -> Self {
        self.values.lock().unwrap().insert(key.to_string(), value);
        self
    }

    /// Simulate an external edit of the store.
    pub fn put(&self, key: &str, value: bool) {
        self.values.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn value(&self, key: &str) -> Option<bool> {
        self.values.lock().unwrap().get(key).copied()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    fn unavailable() -> SettingsError {
        SettingsError::Io {
            path: PathBuf::from("memory"),
            source: io::Error::new(io::ErrorKind::Other, "store unavailable"),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get_bool(&self, key: &str, default: bool) -> Result<bool, SettingsError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self.value(key).unwrap_or(default))
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), SettingsError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.put(key, value);
        Ok(())
    }

    fn is_value_set(&self, key: &str) -> bool {
        self.value(key).is_some()
    }

    fn renew_key(&self) -> Result<(), SettingsError> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct CountingHeartbeat {
    pub beats: Arc<AtomicUsize>,
}

impl CountingHeartbeat {
    pub fn count(&self) -> usize {
        self.beats.load(Ordering::SeqCst)
    }
}

impl Heartbeat for CountingHeartbeat {
    fn set_alive(&self) {
        self.beats.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub states: Arc<Mutex<Vec<TrayState>>>,
}

impl RecordingNotifier {
    pub fn states(&self) -> Vec<TrayState> {
        self.states.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn state_changed(&self, state: &TrayState) {
        self.states.lock().unwrap().push(state.clone());
    }
}

/// Log lines written while a closure runs on the current thread.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }
}

pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, capture.contents())
}
