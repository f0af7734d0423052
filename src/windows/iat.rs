//! In-memory import-table rewriting.
//!
//! The pure side of the patch engine ([`crate::patch`]) decides *which* IAT
//! slots to rewrite; this module performs the writes, switching each slot's
//! page to writable only for the duration of the store and restoring the
//! previous protection afterwards.

use std::ffi::c_void;
use std::ptr;
use std::slice;

use windows_sys::Win32::System::Memory::{
    VirtualProtect, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
};

use crate::{
    patch::{self, PatchTable},
    Result,
};

/// Writes `bytes` to `address`, temporarily lifting the page protection.
///
/// # Safety
///
/// `address` must point at `bytes.len()` bytes of mapped process memory the
/// caller is entitled to rewrite.
pub(crate) unsafe fn write_protected(address: usize, bytes: &[u8]) -> Result<()> {
    let mut previous: PAGE_PROTECTION_FLAGS = 0;
    // SAFETY: caller guarantees the range is mapped.
    let ok = unsafe {
        VirtualProtect(
            address as *const c_void,
            bytes.len(),
            PAGE_EXECUTE_READWRITE,
            &mut previous,
        )
    };
    if ok == 0 {
        return Err(crate::Error::Error(format!(
            "VirtualProtect failed at {address:#x}"
        )));
    }

    // SAFETY: the page is writable now; ranges cannot overlap.
    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    }

    let mut scratch: PAGE_PROTECTION_FLAGS = 0;
    // SAFETY: restores the protection we displaced.
    unsafe {
        VirtualProtect(address as *const c_void, bytes.len(), previous, &mut scratch);
    }
    Ok(())
}

/// Rewrites every import slot of the module at `base` that matches `table`.
/// Returns the number of slots patched.
///
/// Already-patched slots are left alone, making a second attach pass over
/// the same module a no-op.
///
/// # Safety
///
/// `base`/`size` must describe a module currently mapped into this process,
/// and module attachment must be serialized (loader lock held).
pub unsafe fn patch_module(base: usize, size: usize, table: &PatchTable) -> Result<usize> {
    // SAFETY: caller guarantees the image stays mapped.
    let image = unsafe { slice::from_raw_parts(base as *const u8, size) };
    let directory = patch::image::parse_mapped(image)?;
    let slot_size = directory.slot_size();

    let mut patched = 0;
    for plan in patch::plan(&directory, table) {
        let slot = base + plan.slot_rva;
        // SAFETY: slot_rva was bounds-checked against the image.
        let current = unsafe { read_slot(slot, slot_size) };
        if current == plan.entry.replacement {
            continue;
        }
        plan.entry.remember_original(current);
        let bytes = slot_bytes(plan.entry.replacement, slot_size);
        // SAFETY: slot lies inside the mapped image.
        unsafe { write_protected(slot, &bytes)? };
        patched += 1;
    }
    Ok(patched)
}

/// Writes the remembered original addresses back into every slot that still
/// holds a replacement. Returns the number of slots restored.
///
/// # Safety
///
/// Same contract as [`patch_module`].
pub unsafe fn restore_module(base: usize, size: usize, table: &PatchTable) -> Result<usize> {
    // SAFETY: caller guarantees the image stays mapped.
    let image = unsafe { slice::from_raw_parts(base as *const u8, size) };
    let directory = patch::image::parse_mapped(image)?;
    let slot_size = directory.slot_size();

    let mut restored = 0;
    for plan in patch::plan(&directory, table) {
        let slot = base + plan.slot_rva;
        // SAFETY: slot_rva was bounds-checked against the image.
        let current = unsafe { read_slot(slot, slot_size) };
        if current != plan.entry.replacement {
            continue;
        }
        let Some(original) = plan
            .entry
            .original
            .map(|slot| slot.load(std::sync::atomic::Ordering::Acquire))
            .filter(|&original| original != 0)
        else {
            continue;
        };
        let bytes = slot_bytes(original, slot_size);
        // SAFETY: slot lies inside the mapped image.
        unsafe { write_protected(slot, &bytes)? };
        restored += 1;
    }
    Ok(restored)
}

/// Whether the module at `base` imports `symbol` from `dll`.
///
/// # Safety
///
/// `base`/`size` must describe a module currently mapped into this process.
pub unsafe fn find_import(base: usize, size: usize, dll: &str, symbol: &str) -> bool {
    // SAFETY: caller guarantees the image stays mapped.
    let image = unsafe { slice::from_raw_parts(base as *const u8, size) };
    patch::image::parse_mapped(image)
        .map(|directory| patch::find_import(&directory, dll, symbol))
        .unwrap_or(false)
}

unsafe fn read_slot(slot: usize, slot_size: usize) -> usize {
    if slot_size == 8 {
        // SAFETY: caller validated the slot against the image bounds.
        unsafe { ptr::read_volatile(slot as *const u64) as usize }
    } else {
        // SAFETY: as above.
        unsafe { ptr::read_volatile(slot as *const u32) as usize }
    }
}

fn slot_bytes(value: usize, slot_size: usize) -> Vec<u8> {
    if slot_size == 8 {
        (value as u64).to_le_bytes().to_vec()
    } else {
        (value as u32).to_le_bytes().to_vec()
    }
}
