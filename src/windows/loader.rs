//! Loader-hook application.
//!
//! Installs the detour computed by [`crate::detour`] over the loader's
//! call-module-entry-point site, so [`loader_entry_intercept`] runs before
//! every module initialization routine. The host's DLL entry shim calls
//! [`install`] with its observed return address on process attach and
//! [`restore`] on detach.

use std::ffi::c_void;

use parking_lot::Mutex;
use windows_sys::Win32::System::Memory::{VirtualQuery, MEMORY_BASIC_INFORMATION};
use windows_sys::Win32::System::SystemServices::DLL_PROCESS_ATTACH;

use crate::{
    detour::{self, DetourState, SCAN_WINDOW},
    detector::Detector,
    windows::iat::write_protected,
    Result,
};

/// Module initialization routine as invoked by the loader.
pub type DllInitRoutine =
    unsafe extern "system" fn(*mut c_void, u32, *mut c_void) -> u8;

static DETOUR: Mutex<DetourState> = Mutex::new(DetourState::new());

/// Runs in place of the loader's call to a module entry point: refreshes the
/// module registry (so allocations made during static initialization are
/// tracked) and then calls the original entry point.
///
/// # Safety
///
/// Only reachable through the installed detour; `entry` is the routine the
/// loader was about to call with exactly these arguments.
pub unsafe extern "system" fn loader_entry_intercept(
    base: *mut c_void,
    reason: u32,
    context: *mut c_void,
    entry: DllInitRoutine,
) -> u8 {
    if reason == DLL_PROCESS_ATTACH {
        if let Some(detector) = Detector::global() {
            detector.refresh_modules();
        }
    }
    // SAFETY: forwarded verbatim from the loader's own call.
    unsafe { entry(base, reason, context) }
}

/// Locates the loader's call site from `return_address` (observed inside the
/// detector's DLL entry point) and installs the detour. Idempotent: a second
/// call is a no-op returning `false`.
///
/// # Safety
///
/// `return_address` must be the genuine return address of the loader's call
/// into this module's entry point, and the loader must be quiescent (process
/// attach, loader lock held by the OS).
pub unsafe fn install(return_address: usize) -> Result<bool> {
    let mut state = DETOUR.lock();
    if state.is_installed() {
        return Ok(false);
    }

    let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
    // SAFETY: out-structure of the correct size; the address is mapped code.
    let queried = unsafe {
        VirtualQuery(
            return_address as *const c_void,
            &mut info,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if queried == 0 {
        return Err(crate::Error::Error("VirtualQuery failed".to_string()));
    }

    let region_end = info.BaseAddress as usize + info.RegionSize;
    // SAFETY: both ranges lie inside the queried, mapped region.
    let window = unsafe {
        std::slice::from_raw_parts((return_address - SCAN_WINDOW) as *const u8, SCAN_WINDOW)
    };
    let region = unsafe {
        std::slice::from_raw_parts(return_address as *const u8, region_end - return_address)
    };

    let plan = detour::build_plan(
        window,
        return_address,
        region,
        loader_entry_intercept as usize,
    )?;

    // SAFETY: the plan's addresses derive from the mapped window and region.
    state.install(plan, |address, bytes| unsafe { write_protected(address, bytes) })
}

/// Restores the original loader bytes and clears the detour region.
///
/// # Errors
///
/// [`Error::NotInstalled`](crate::Error::NotInstalled) when no successful
/// install preceded this call.
pub fn restore() -> Result<()> {
    let mut state = DETOUR.lock();
    // SAFETY: the stored plan's addresses were mapped and patched by install.
    state.restore(|address, bytes| unsafe { write_protected(address, bytes) })
}
