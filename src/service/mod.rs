//! Access to the OS service manager.
//!
//! [`ServiceControl`] is the seam between the reconciliation engine and the
//! platform. The primary path changes a start mode through the service
//! manager; the raw start type accessors edit the persisted service
//! configuration directly and are only used when the primary path fails.

#[cfg(target_os = "windows")]
mod scm;

#[cfg(target_os = "windows")]
pub use self::scm::ScmServiceControl;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Launch policy of a service, with the numeric values used by the persisted
/// service configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartMode {
    Boot,
    System,
    Automatic,
    Manual,
    Disabled,
}

impl StartMode {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Boot),
            1 => Some(Self::System),
            2 => Some(Self::Automatic),
            3 => Some(Self::Manual),
            4 => Some(Self::Disabled),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Self::Boot => 0,
            Self::System => 1,
            Self::Automatic => 2,
            Self::Manual => 3,
            Self::Disabled => 4,
        }
    }

    /// Mode written for a lock request.
    pub fn for_lock(lock_it: bool) -> Self {
        if lock_it {
            Self::Disabled
        } else {
            Self::Manual
        }
    }
}

impl fmt::Display for StartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartMode::Boot => write!(f, "Boot"),
            StartMode::System => write!(f, "System"),
            StartMode::Automatic => write!(f, "Automatic"),
            StartMode::Manual => write!(f, "Manual"),
            StartMode::Disabled => write!(f, "Disabled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
    Unknown,
}

/// One row of the service list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub name: String,
    /// `None` when the configuration of the service could not be read.
    pub start_mode: Option<StartMode>,
    pub status: ServiceStatus,
    pub can_stop: bool,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{operation}({service}) failed, error: {code}")]
    Os {
        operation: &'static str,
        service: String,
        code: u32,
    },
    #[error("service {0} does not exist")]
    NotFound(String),
    #[error("service {service} reports an unknown start type {value}")]
    UnknownStartType { service: String, value: u32 },
    #[error("service control is not available on this platform")]
    Unsupported,
}

impl ServiceError {
    /// OS error code, when the failure came from a system call.
    pub fn code(&self) -> Option<u32> {
        match self {
            ServiceError::Os { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub trait ServiceControl: Send + Sync {
    /// List the installed services. The start mode is only read for the
    /// services named in `config_for`; every other entry reports `None`.
    fn enumerate_services(&self, config_for: &[&str]) -> Result<Vec<ServiceEntry>, ServiceError>;
    fn start_mode(&self, name: &str) -> Result<StartMode, ServiceError>;
    /// Primary path: change the start mode through the service manager.
    fn change_start_mode(&self, name: &str, mode: StartMode) -> Result<(), ServiceError>;
    fn stop_service(&self, name: &str) -> Result<(), ServiceError>;
    /// Fallback path: write the persisted start type value directly.
    fn write_raw_start_type(&self, name: &str, value: u32) -> Result<(), ServiceError>;
    /// Read back the persisted start type value, `None` when it is absent.
    fn read_raw_start_type(&self, name: &str) -> Result<Option<u32>, ServiceError>;
}

/// Service manager of the running OS.
#[cfg(target_os = "windows")]
pub fn system_service_control() -> anyhow::Result<Arc<dyn ServiceControl>> {
    Ok(Arc::new(ScmServiceControl::new()))
}

#[cfg(not(target_os = "windows"))]
pub fn system_service_control() -> anyhow::Result<Arc<dyn ServiceControl>> {
    Err(ServiceError::Unsupported.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_values_match_service_configuration() {
        for mode in [
            StartMode::Boot,
            StartMode::System,
            StartMode::Automatic,
            StartMode::Manual,
            StartMode::Disabled,
        ] {
            assert_eq!(StartMode::from_raw(mode.as_raw()), Some(mode));
        }
        assert_eq!(StartMode::Disabled.as_raw(), 4);
        assert_eq!(StartMode::from_raw(7), None);
    }

    #[test]
    fn lock_maps_to_disabled_and_unlock_to_manual() {
        assert_eq!(StartMode::for_lock(true), StartMode::Disabled);
        assert_eq!(StartMode::for_lock(false), StartMode::Manual);
    }

    #[test]
    fn os_error_exposes_code() {
        let err = ServiceError::Os {
            operation: "ChangeServiceConfig",
            service: "wuauserv".into(),
            code: 5,
        };
        assert_eq!(err.code(), Some(5));
        assert_eq!(err.to_string(), "ChangeServiceConfig(wuauserv) failed, error: 5");
        assert_eq!(ServiceError::Unsupported.code(), None);
    }
}
