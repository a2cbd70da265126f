//! Minimal scoped access to `HKEY_LOCAL_MACHINE` values.

use windows::core::HSTRING;
use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_SUCCESS, WIN32_ERROR};
use windows::Win32::System::Registry::{
    RegCloseKey, RegOpenKeyExW, RegQueryValueExW, RegSetValueExW, HKEY, HKEY_LOCAL_MACHINE,
    KEY_QUERY_VALUE, KEY_SET_VALUE, REG_BINARY, REG_DWORD, REG_EXPAND_SZ, REG_SAM_FLAGS, REG_SZ,
    REG_VALUE_TYPE,
};

/// Open registry key, closed on drop.
pub struct RegKey {
    hkey: HKEY,
}

impl RegKey {
    pub fn open_local_machine(path: &str, writable: bool) -> Result<Self, WIN32_ERROR> {
        let access: REG_SAM_FLAGS = if writable {
            KEY_QUERY_VALUE | KEY_SET_VALUE
        } else {
            KEY_QUERY_VALUE
        };
        let mut hkey = HKEY::default();
        let status = unsafe {
            RegOpenKeyExW(
                HKEY_LOCAL_MACHINE,
                &HSTRING::from(path),
                0,
                access,
                &mut hkey,
            )
        };
        if status != ERROR_SUCCESS {
            return Err(status);
        }
        Ok(Self { hkey })
    }

    pub fn set_u32(&self, name: &str, value: u32) -> Result<(), WIN32_ERROR> {
        let bytes = value.to_le_bytes();
        let status =
            unsafe { RegSetValueExW(self.hkey, &HSTRING::from(name), 0, REG_DWORD, Some(&bytes[..])) };
        if status != ERROR_SUCCESS {
            return Err(status);
        }
        Ok(())
    }

    /// Read a DWORD value; `Ok(None)` when the value is absent or of another type.
    pub fn get_u32(&self, name: &str) -> Result<Option<u32>, WIN32_ERROR> {
        match self.get_raw(name)? {
            Some((kind, data)) if kind == REG_DWORD && data.len() >= 4 => {
                Ok(Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]])))
            }
            _ => Ok(None),
        }
    }

    pub fn get_binary(&self, name: &str) -> Result<Option<Vec<u8>>, WIN32_ERROR> {
        match self.get_raw(name)? {
            Some((kind, data)) if kind == REG_BINARY => Ok(Some(data)),
            _ => Ok(None),
        }
    }

    pub fn get_string(&self, name: &str) -> Result<Option<String>, WIN32_ERROR> {
        match self.get_raw(name)? {
            Some((kind, data)) if kind == REG_SZ || kind == REG_EXPAND_SZ => {
                let wide: Vec<u16> = data
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .take_while(|&c| c != 0)
                    .collect();
                Ok(Some(String::from_utf16_lossy(&wide)))
            }
            _ => Ok(None),
        }
    }

    fn get_raw(&self, name: &str) -> Result<Option<(REG_VALUE_TYPE, Vec<u8>)>, WIN32_ERROR> {
        let name = HSTRING::from(name);
        let mut kind = REG_VALUE_TYPE::default();
        let mut size = 0u32;
        let status = unsafe {
            RegQueryValueExW(
                self.hkey,
                &name,
                None,
                Some(&mut kind as *mut _),
                None,
                Some(&mut size as *mut _),
            )
        };
        if status == ERROR_FILE_NOT_FOUND {
            return Ok(None);
        }
        if status != ERROR_SUCCESS {
            return Err(status);
        }

        let mut data = vec![0u8; size as usize];
        let status = unsafe {
            RegQueryValueExW(
                self.hkey,
                &name,
                None,
                Some(&mut kind as *mut _),
                Some(data.as_mut_ptr()),
                Some(&mut size as *mut _),
            )
        };
        if status != ERROR_SUCCESS {
            return Err(status);
        }
        data.truncate(size as usize);
        Ok(Some((kind, data)))
    }
}

impl Drop for RegKey {
    fn drop(&mut self) {
        unsafe {
            let _ = RegCloseKey(self.hkey);
        }
    }
}
