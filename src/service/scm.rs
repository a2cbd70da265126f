use super::{ServiceControl, ServiceEntry, ServiceError, ServiceStatus, StartMode};
use crate::registry::RegKey;
use windows::core::{HSTRING, PCWSTR};
use windows::Win32::Foundation::{ERROR_MORE_DATA, ERROR_SERVICE_DOES_NOT_EXIST};
use windows::Win32::System::Services::{
    ChangeServiceConfigW, CloseServiceHandle, ControlService, EnumServicesStatusExW,
    OpenSCManagerW, OpenServiceW, QueryServiceConfigW, ENUM_SERVICE_STATUS_PROCESSW,
    ENUM_SERVICE_TYPE, QUERY_SERVICE_CONFIGW, SC_ENUM_PROCESS_INFO, SC_HANDLE,
    SC_MANAGER_CONNECT, SC_MANAGER_ENUMERATE_SERVICE, SERVICE_ACCEPT_STOP, SERVICE_CHANGE_CONFIG,
    SERVICE_CONTINUE_PENDING, SERVICE_CONTROL_STOP, SERVICE_ERROR, SERVICE_NO_CHANGE,
    SERVICE_PAUSED, SERVICE_PAUSE_PENDING, SERVICE_QUERY_CONFIG, SERVICE_RUNNING,
    SERVICE_START_PENDING, SERVICE_START_TYPE, SERVICE_STATE_ALL, SERVICE_STATUS,
    SERVICE_STATUS_CURRENT_STATE, SERVICE_STOP, SERVICE_STOPPED, SERVICE_STOP_PENDING,
    SERVICE_WIN32,
};

const SERVICES_REGISTRY_PATH: &str = r"SYSTEM\CurrentControlSet\Services";
const START_VALUE_NAME: &str = "Start";

/// Service manager handle, closed on drop.
struct ScHandle(SC_HANDLE);

impl Drop for ScHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseServiceHandle(self.0);
        }
    }
}

fn win32_code(err: &windows::core::Error) -> u32 {
    (err.code().0 as u32) & 0xFFFF
}

fn os_error(operation: &'static str, service: &str, err: &windows::core::Error) -> ServiceError {
    ServiceError::Os {
        operation,
        service: service.to_string(),
        code: win32_code(err),
    }
}

fn map_status(state: SERVICE_STATUS_CURRENT_STATE) -> ServiceStatus {
    match state {
        SERVICE_STOPPED => ServiceStatus::Stopped,
        SERVICE_START_PENDING => ServiceStatus::StartPending,
        SERVICE_STOP_PENDING => ServiceStatus::StopPending,
        SERVICE_RUNNING => ServiceStatus::Running,
        SERVICE_CONTINUE_PENDING => ServiceStatus::ContinuePending,
        SERVICE_PAUSE_PENDING => ServiceStatus::PausePending,
        SERVICE_PAUSED => ServiceStatus::Paused,
        _ => ServiceStatus::Unknown,
    }
}

/// Service control through the Windows service control manager, with the
/// registry as fallback store for start types.
#[derive(Debug, Default)]
pub struct ScmServiceControl;

impl ScmServiceControl {
    pub fn new() -> Self {
        Self
    }

    fn open_manager(access: u32) -> Result<ScHandle, ServiceError> {
        let handle = unsafe { OpenSCManagerW(PCWSTR::null(), PCWSTR::null(), access) }
            .map_err(|err| os_error("OpenSCManager", "", &err))?;
        Ok(ScHandle(handle))
    }

    fn open_service(manager: &ScHandle, name: &str, access: u32) -> Result<ScHandle, ServiceError> {
        match unsafe { OpenServiceW(manager.0, &HSTRING::from(name), access) } {
            Ok(handle) => Ok(ScHandle(handle)),
            Err(err) if win32_code(&err) == ERROR_SERVICE_DOES_NOT_EXIST.0 => {
                Err(ServiceError::NotFound(name.to_string()))
            }
            Err(err) => Err(os_error("OpenService", name, &err)),
        }
    }

    fn query_start_type(service: &ScHandle, name: &str) -> Result<u32, ServiceError> {
        let mut needed = 0u32;
        // The first call only reports the buffer size.
        let _ = unsafe { QueryServiceConfigW(service.0, None, 0, &mut needed) };
        if needed == 0 {
            return Err(ServiceError::Os {
                operation: "QueryServiceConfig",
                service: name.to_string(),
                code: 0,
            });
        }

        // u64 storage keeps the structure aligned.
        let mut buffer = vec![0u64; (needed as usize).div_ceil(8)];
        unsafe {
            QueryServiceConfigW(
                service.0,
                Some(buffer.as_mut_ptr() as *mut QUERY_SERVICE_CONFIGW),
                (buffer.len() * 8) as u32,
                &mut needed,
            )
        }
        .map_err(|err| os_error("QueryServiceConfig", name, &err))?;

        let config = unsafe { &*(buffer.as_ptr() as *const QUERY_SERVICE_CONFIGW) };
        Ok(config.dwStartType.0)
    }

    fn read_start_mode(manager: &ScHandle, name: &str) -> Result<StartMode, ServiceError> {
        let service = Self::open_service(manager, name, SERVICE_QUERY_CONFIG)?;
        let value = Self::query_start_type(&service, name)?;
        StartMode::from_raw(value).ok_or_else(|| ServiceError::UnknownStartType {
            service: name.to_string(),
            value,
        })
    }

    fn service_key_path(name: &str) -> String {
        format!(r"{SERVICES_REGISTRY_PATH}\{name}")
    }
}

impl ServiceControl for ScmServiceControl {
    fn enumerate_services(&self, config_for: &[&str]) -> Result<Vec<ServiceEntry>, ServiceError> {
        let manager = Self::open_manager(SC_MANAGER_CONNECT | SC_MANAGER_ENUMERATE_SERVICE)?;
        let mut entries = Vec::new();
        let mut buffer: Vec<u64> = Vec::new();
        let mut needed = 0u32;
        let mut resume = 0u32;

        loop {
            let mut returned = 0u32;
            let bytes: Option<&mut [u8]> = if buffer.is_empty() {
                None
            } else {
                Some(unsafe {
                    std::slice::from_raw_parts_mut(buffer.as_mut_ptr() as *mut u8, buffer.len() * 8)
                })
            };
            let result = unsafe {
                EnumServicesStatusExW(
                    manager.0,
                    SC_ENUM_PROCESS_INFO,
                    SERVICE_WIN32,
                    SERVICE_STATE_ALL,
                    bytes,
                    &mut needed,
                    &mut returned,
                    Some(&mut resume as *mut u32),
                    PCWSTR::null(),
                )
            };
            let more = match result {
                Ok(()) => false,
                Err(err) if win32_code(&err) == ERROR_MORE_DATA.0 => true,
                Err(err) => return Err(os_error("EnumServicesStatusEx", "", &err)),
            };

            if returned > 0 {
                let items = unsafe {
                    std::slice::from_raw_parts(
                        buffer.as_ptr() as *const ENUM_SERVICE_STATUS_PROCESSW,
                        returned as usize,
                    )
                };
                for item in items {
                    let name = unsafe { item.lpServiceName.to_string() }.unwrap_or_default();
                    let status = &item.ServiceStatusProcess;
                    let start_mode = if config_for.contains(&name.as_str()) {
                        match Self::read_start_mode(&manager, &name) {
                            Ok(mode) => Some(mode),
                            Err(err) => {
                                tracing::debug!("(from enumerate_services) {err}");
                                None
                            }
                        }
                    } else {
                        None
                    };
                    entries.push(ServiceEntry {
                        start_mode,
                        status: map_status(status.dwCurrentState),
                        can_stop: status.dwControlsAccepted & SERVICE_ACCEPT_STOP != 0,
                        name,
                    });
                }
            }

            if !more {
                break;
            }
            buffer = vec![0u64; (needed as usize).div_ceil(8)];
        }

        Ok(entries)
    }

    fn start_mode(&self, name: &str) -> Result<StartMode, ServiceError> {
        let manager = Self::open_manager(SC_MANAGER_CONNECT)?;
        Self::read_start_mode(&manager, name)
    }

    fn change_start_mode(&self, name: &str, mode: StartMode) -> Result<(), ServiceError> {
        let manager = Self::open_manager(SC_MANAGER_CONNECT)?;
        let service = Self::open_service(&manager, name, SERVICE_QUERY_CONFIG | SERVICE_CHANGE_CONFIG)?;
        unsafe {
            ChangeServiceConfigW(
                service.0,
                ENUM_SERVICE_TYPE(SERVICE_NO_CHANGE),
                SERVICE_START_TYPE(mode.as_raw()),
                SERVICE_ERROR(SERVICE_NO_CHANGE),
                PCWSTR::null(),
                PCWSTR::null(),
                None,
                PCWSTR::null(),
                PCWSTR::null(),
                PCWSTR::null(),
                PCWSTR::null(),
            )
        }
        .map_err(|err| os_error("ChangeServiceConfig", name, &err))
    }

    fn stop_service(&self, name: &str) -> Result<(), ServiceError> {
        let manager = Self::open_manager(SC_MANAGER_CONNECT)?;
        let service = Self::open_service(&manager, name, SERVICE_STOP)?;
        let mut status = SERVICE_STATUS::default();
        unsafe { ControlService(service.0, SERVICE_CONTROL_STOP, &mut status) }
            .map_err(|err| os_error("ControlService", name, &err))
    }

    fn write_raw_start_type(&self, name: &str, value: u32) -> Result<(), ServiceError> {
        let path = Self::service_key_path(name);
        let key = RegKey::open_local_machine(&path, true).map_err(|status| ServiceError::Os {
            operation: "RegOpenKeyEx",
            service: name.to_string(),
            code: status.0,
        })?;
        key.set_u32(START_VALUE_NAME, value)
            .map_err(|status| ServiceError::Os {
                operation: "RegSetValueEx",
                service: name.to_string(),
                code: status.0,
            })
    }

    fn read_raw_start_type(&self, name: &str) -> Result<Option<u32>, ServiceError> {
        let path = Self::service_key_path(name);
        let key = RegKey::open_local_machine(&path, false).map_err(|status| ServiceError::Os {
            operation: "RegOpenKeyEx",
            service: name.to_string(),
            code: status.0,
        })?;
        key.get_u32(START_VALUE_NAME).map_err(|status| ServiceError::Os {
            operation: "RegQueryValueEx",
            service: name.to_string(),
            code: status.0,
        })
    }
}
