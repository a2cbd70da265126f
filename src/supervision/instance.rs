use anyhow::Result;

/// Process-wide named handle held by the sole running instance.
///
/// The handle is released when the guard is dropped.
pub struct InstanceGuard {
    name: String,
    #[cfg(target_os = "windows")]
    handle: windows::Win32::Foundation::HANDLE,
}

// The event handle is only closed in `Drop`.
#[cfg(target_os = "windows")]
unsafe impl Send for InstanceGuard {}

impl InstanceGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(target_os = "windows")]
impl InstanceGuard {
    /// Create the named handle. Returns `Ok(None)` when another instance
    /// already holds it.
    pub fn acquire(name: &str) -> Result<Option<Self>> {
        use anyhow::Context;
        use windows::core::PCWSTR;
        use windows::Win32::Foundation::{CloseHandle, GetLastError, BOOL, ERROR_ALREADY_EXISTS};
        use windows::Win32::System::Threading::CreateEventW;

        let full_name = format!("Local\\{name}");
        let wide: Vec<u16> = full_name.encode_utf16().chain(std::iter::once(0)).collect();
        let handle = unsafe {
            CreateEventW(None, BOOL::from(true), BOOL::from(false), PCWSTR(wide.as_ptr()))
        }
        .with_context(|| format!("create instance handle {full_name}"))?;

        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe {
                let _ = CloseHandle(handle);
            }
            return Ok(None);
        }
        Ok(Some(Self {
            name: name.to_string(),
            handle,
        }))
    }
}

#[cfg(target_os = "windows")]
impl Drop for InstanceGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = windows::Win32::Foundation::CloseHandle(self.handle);
        }
        tracing::debug!("instance handle {} released", self.name);
    }
}

#[cfg(not(target_os = "windows"))]
mod local {
    use once_cell::sync::Lazy;
    use std::collections::HashSet;
    use std::sync::Mutex;

    pub static HELD: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));
}

#[cfg(not(target_os = "windows"))]
impl InstanceGuard {
    /// Without named kernel objects the guard is only unique within this
    /// process.
    pub fn acquire(name: &str) -> Result<Option<Self>> {
        let mut held = local::HELD.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(name.to_string()) {
            return Ok(None);
        }
        Ok(Some(Self {
            name: name.to_string(),
        }))
    }
}

#[cfg(not(target_os = "windows"))]
impl Drop for InstanceGuard {
    fn drop(&mut self) {
        local::HELD
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
        tracing::debug!("instance handle {} released", self.name);
    }
}
