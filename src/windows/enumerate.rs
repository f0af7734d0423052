//! Module enumeration through the process-status API.

use std::ffi::c_void;
use std::path::PathBuf;

use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::ProcessStatus::{
    K32EnumProcessModules, K32GetModuleFileNameExW, K32GetModuleInformation, MODULEINFO,
};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

use crate::{
    modules::{ModuleEnumerator, ModuleRecord},
    Result,
};

/// Enumerates the current process's modules, one [`ModuleRecord`] per mapped
/// image.
#[derive(Debug, Default)]
pub struct ProcessModuleEnumerator;

impl ModuleEnumerator for ProcessModuleEnumerator {
    fn modules(&self) -> Result<Vec<ModuleRecord>> {
        // SAFETY: pseudo-handle, no cleanup required.
        let process = unsafe { GetCurrentProcess() };

        let mut handles: Vec<HMODULE> = vec![std::ptr::null_mut(); 256];
        let mut needed: u32 = 0;
        loop {
            let capacity = (handles.len() * std::mem::size_of::<HMODULE>()) as u32;
            // SAFETY: handles points at capacity writable bytes.
            let ok = unsafe {
                K32EnumProcessModules(process, handles.as_mut_ptr(), capacity, &mut needed)
            };
            if ok == 0 {
                return Err(crate::Error::Error(
                    "EnumProcessModules failed".to_string(),
                ));
            }
            if needed <= capacity {
                handles.truncate(needed as usize / std::mem::size_of::<HMODULE>());
                break;
            }
            handles.resize(needed as usize / std::mem::size_of::<HMODULE>(), std::ptr::null_mut());
        }

        let mut records = Vec::with_capacity(handles.len());
        for handle in handles {
            let mut info = MODULEINFO {
                lpBaseOfDll: std::ptr::null_mut::<c_void>(),
                SizeOfImage: 0,
                EntryPoint: std::ptr::null_mut::<c_void>(),
            };
            // SAFETY: info is a valid out-structure of the correct size.
            let ok = unsafe {
                K32GetModuleInformation(
                    process,
                    handle,
                    &mut info,
                    std::mem::size_of::<MODULEINFO>() as u32,
                )
            };
            if ok == 0 {
                continue;
            }

            let mut path_buffer = [0u16; 1024];
            // SAFETY: path_buffer holds 1024 writable UTF-16 units.
            let written = unsafe {
                K32GetModuleFileNameExW(
                    process,
                    handle,
                    path_buffer.as_mut_ptr(),
                    path_buffer.len() as u32,
                )
            } as usize;
            if written == 0 {
                continue;
            }

            records.push(ModuleRecord {
                path: PathBuf::from(String::from_utf16_lossy(&path_buffer[..written])),
                base: info.lpBaseOfDll as usize,
                size: info.SizeOfImage as usize,
            });
        }

        Ok(records)
    }
}
