//! Windows backend: the only code that touches OS state.
//!
//! Everything architecture- or OS-specific funnels through here — module
//! enumeration, in-memory import-table rewriting, loader-detour application
//! and the replacement heap entry points. The core stays platform-agnostic;
//! this module implements the narrow interfaces it defines.

pub(crate) mod enumerate;
pub(crate) mod heaps;
pub(crate) mod iat;
pub(crate) mod loader;

pub use enumerate::ProcessModuleEnumerator;
pub use heaps::build_patch_table;

use crate::{detector::Detector, modules::ModuleRecord};

/// Name under which the detector's own DLL appears in the module list; it
/// must never attach to itself.
pub(crate) const OWN_MODULE: &str = "leakscope.dll";

/// Attaches the patch engine to every eligible module in `records`.
///
/// Runs under the detector's loader lock so the bookkeeping cannot race the
/// OS loader. Modules whose import tables cannot be parsed are left
/// unpatched and logged, never fatal.
pub(crate) fn attach_to_modules(detector: &Detector, records: &[ModuleRecord]) {
    let _guard = detector.loader_guard();

    for record in records {
        let name = record
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name == OWN_MODULE {
            // A module going through its own portal means infinite
            // recursion; never attach to ourselves.
            continue;
        }

        // SAFETY: record describes a module currently mapped into this
        // process; the loader lock keeps it mapped for the duration.
        match unsafe { iat::patch_module(record.base, record.size, detector.patch_table()) } {
            Ok(patched) => {
                if patched != 0 {
                    log::debug!("patched {patched} import slots in {name}");
                }
            }
            Err(error) => {
                log::warn!("skipping unpatchable module {name}: {error}");
            }
        }
    }
}

/// Restores every patched module and the loader detour at shutdown.
pub(crate) fn detach_all(detector: &Detector) {
    for module in detector.modules().snapshot() {
        let size = module.end - module.base + 1;
        // SAFETY: the snapshot describes modules mapped into this process;
        // restore compares before writing, so an already-unloaded module
        // parses as garbage and is skipped via the error path.
        if let Err(error) =
            unsafe { iat::restore_module(module.base, size, detector.patch_table()) }
        {
            log::warn!("could not restore imports of {}: {error}", module.name);
        }
    }

    if let Err(error) = loader::restore() {
        log::debug!("loader detour not restored: {error}");
    }
}

/// Reads `len` bytes of live process memory at `address`; the block reader a
/// Windows host wires into the [`crate::DetectorBuilder`].
pub fn read_block_memory(address: usize, len: usize) -> Option<Vec<u8>> {
    if address == 0 || len == 0 {
        return None;
    }
    // SAFETY: callers pass addresses of blocks the ledger currently tracks
    // as live, so the range is mapped and readable.
    let bytes = unsafe { std::slice::from_raw_parts(address as *const u8, len) };
    Some(bytes.to_vec())
}
