//! The patch engine: import-table rewriting as data.
//!
//! A [`PatchTable`] describes, per target DLL, which exported symbols are
//! redirected to which replacement functions. The engine walks a module's
//! mapped import directory ([`image`]), matches the imports against the table
//! by name or ordinal, and produces the list of IAT slots to rewrite; the
//! unsafe slot writes themselves live in the platform backend. The same table
//! drives dynamic-lookup interposition: a patched module asking the loader for
//! the address of a patched export receives the replacement.
//!
//! # Key Components
//!
//! - [`PatchEntry`] / [`ModulePatch`] / [`PatchTable`] - The static patch
//!   configuration with its runtime-resolved module bases
//! - [`SlotPatch`] / [`plan`] - Matching import slots against the table
//! - [`find_import`] - Does a module import a given symbol at all?
//! - [`image`] - Bounds-checked mapped-image import walker
//!
//! # Concurrency
//!
//! Patching mutates another module's import table in memory and must be
//! serialized against concurrent module attachment; the detector holds its
//! loader lock around every attach/detach pass. The table itself only ever
//! mutates its interior atomics (resolved bases, displaced originals).

pub mod image;

pub use image::{ImportDirectory, ImportedModule, ImportedSymbol};

use std::sync::atomic::{AtomicUsize, Ordering};

/// An imported symbol identity: exported name or export ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportName {
    /// Import by exported symbol name.
    Name(&'static str),
    /// Import by export ordinal.
    Ordinal(u16),
}

/// One symbol redirection: which import to intercept, where to route it, and
/// where to remember the displaced original for pass-through calls.
#[derive(Debug)]
pub struct PatchEntry {
    /// The import to intercept.
    pub import: ImportName,
    /// Address of the replacement function.
    pub replacement: usize,
    /// Slot receiving the displaced original address, when the replacement
    /// needs to call through. Entries whose originals are resolved up front
    /// leave this empty.
    pub original: Option<&'static AtomicUsize>,
}

impl PatchEntry {
    /// Whether this entry intercepts `symbol`.
    #[must_use]
    pub fn matches(&self, symbol: &ImportedSymbol) -> bool {
        match self.import {
            ImportName::Name(name) => symbol.is_named(name),
            ImportName::Ordinal(ordinal) => symbol.ordinal == Some(ordinal),
        }
    }

    /// Records the displaced original address, first writer wins.
    pub fn remember_original(&self, original: usize) {
        if let Some(slot) = self.original {
            let _ = slot.compare_exchange(0, original, Ordering::AcqRel, Ordering::Acquire);
        }
    }
}

/// All redirections targeting exports of one DLL.
#[derive(Debug)]
pub struct ModulePatch {
    /// Lower-cased name of the DLL whose exports are intercepted.
    pub export_module: &'static str,
    /// Whether allocations attributed to this module are reported as leaks.
    /// Runtime-support DLLs are patched for pass-through correctness but keep
    /// this off.
    pub report_leaks: bool,
    /// The symbol redirections.
    pub entries: Vec<PatchEntry>,
    base: AtomicUsize,
}

impl ModulePatch {
    /// Creates a module patch group.
    #[must_use]
    pub fn new(export_module: &'static str, report_leaks: bool, entries: Vec<PatchEntry>) -> Self {
        ModulePatch {
            export_module,
            report_leaks,
            entries,
            base: AtomicUsize::new(0),
        }
    }

    /// The module's resolved base address, zero while the module is not
    /// (yet) loaded.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base.load(Ordering::Acquire)
    }

    /// Records the base address observed during module enumeration.
    pub fn set_base(&self, base: usize) {
        self.base.store(base, Ordering::Release);
    }
}

/// The full patch configuration of the detector.
#[derive(Debug, Default)]
pub struct PatchTable {
    /// Per-DLL patch groups.
    pub modules: Vec<ModulePatch>,
}

/// A dynamic symbol lookup, as seen by `GetProcAddress`-style interposition.
#[derive(Debug, Clone, Copy)]
pub enum ProcRequest<'a> {
    /// Lookup by exported name.
    ByName(&'a str),
    /// Lookup by export ordinal.
    ByOrdinal(u16),
}

impl PatchTable {
    /// Creates a table from per-DLL groups.
    #[must_use]
    pub fn new(modules: Vec<ModulePatch>) -> Self {
        PatchTable { modules }
    }

    /// Records `base` for every group targeting `module_name` (matched
    /// case-insensitively). Called once per module during enumeration.
    pub fn resolve_base(&self, module_name: &str, base: usize) {
        for module in &self.modules {
            if module.export_module.eq_ignore_ascii_case(module_name) {
                module.set_base(base);
            }
        }
    }

    /// Whether the table targets `module_name` with leak reporting enabled.
    /// Such modules participate in detection even without importing the
    /// public marker.
    #[must_use]
    pub fn is_known_module(&self, module_name: &str) -> bool {
        self.modules.iter().any(|module| {
            module.export_module.eq_ignore_ascii_case(module_name) && module.report_leaks
        })
    }

    /// Leak-reporting state of the patched module based at `base`, or `None`
    /// when no group resolved to that base.
    #[must_use]
    pub fn module_reports_leaks(&self, base: usize) -> Option<bool> {
        if base == 0 {
            return None;
        }
        self.modules
            .iter()
            .find(|module| module.base() == base)
            .map(|module| module.report_leaks)
    }

    /// `GetProcAddress` interposition: when `request` names a patched export
    /// of the module based at `module_base`, remembers `original` for
    /// pass-through and returns the replacement address.
    #[must_use]
    pub fn replacement_for(
        &self,
        module_base: usize,
        request: ProcRequest<'_>,
        original: usize,
    ) -> Option<usize> {
        if module_base == 0 {
            return None;
        }
        for module in &self.modules {
            if module.base() != module_base {
                continue;
            }
            for entry in &module.entries {
                let hit = match (entry.import, request) {
                    (ImportName::Name(name), ProcRequest::ByName(requested)) => name == requested,
                    (ImportName::Ordinal(ordinal), ProcRequest::ByOrdinal(requested)) => {
                        ordinal == requested
                    }
                    _ => false,
                };
                if hit {
                    entry.remember_original(original);
                    return Some(entry.replacement);
                }
            }
        }
        None
    }
}

/// One IAT slot rewrite: where, and with what.
#[derive(Debug)]
pub struct SlotPatch<'a> {
    /// RVA of the IAT slot inside the importing module.
    pub slot_rva: usize,
    /// The matched table entry (replacement address, original slot).
    pub entry: &'a PatchEntry,
}

/// Matches `directory` (one module's parsed imports) against `table`,
/// producing every IAT slot whose import is intercepted.
///
/// The backend applies each patch by swapping the slot to
/// `entry.replacement` and remembering the displaced value; restoration
/// writes the remembered value back wherever the slot still holds the
/// replacement.
#[must_use]
pub fn plan<'a>(directory: &ImportDirectory, table: &'a PatchTable) -> Vec<SlotPatch<'a>> {
    let mut patches = Vec::new();
    for imported in &directory.modules {
        for module in &table.modules {
            if !module.export_module.eq_ignore_ascii_case(&imported.name) {
                continue;
            }
            for symbol in &imported.symbols {
                if let Some(entry) = module.entries.iter().find(|entry| entry.matches(symbol)) {
                    patches.push(SlotPatch {
                        slot_rva: symbol.slot_rva,
                        entry,
                    });
                }
            }
        }
    }
    patches
}

/// Whether a module's parsed imports pull `symbol_name` from `dll_name`.
///
/// Used to detect voluntary participation: a module importing the detector's
/// public marker export was built against its header and is always included
/// in leak detection.
#[must_use]
pub fn find_import(directory: &ImportDirectory, dll_name: &str, symbol_name: &str) -> bool {
    directory.imports(dll_name, symbol_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::image::tests::synthetic_pe64;

    fn table() -> PatchTable {
        static ORIGINAL_ALLOC: AtomicUsize = AtomicUsize::new(0);
        PatchTable::new(vec![ModulePatch::new(
            "kernel32.dll",
            true,
            vec![
                PatchEntry {
                    import: ImportName::Name("HeapAlloc"),
                    replacement: 0x1111,
                    original: Some(&ORIGINAL_ALLOC),
                },
                PatchEntry {
                    import: ImportName::Ordinal(42),
                    replacement: 0x2222,
                    original: None,
                },
            ],
        )])
    }

    #[test]
    fn test_plan_matches_by_name_and_ordinal() {
        let directory = image::parse_mapped(&synthetic_pe64()).unwrap();
        let table = table();
        let patches = plan(&directory, &table);

        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].slot_rva, 0x500); // HeapAlloc
        assert_eq!(patches[0].entry.replacement, 0x1111);
        assert_eq!(patches[1].slot_rva, 0x510); // ordinal 42
        assert_eq!(patches[1].entry.replacement, 0x2222);
    }

    #[test]
    fn test_plan_ignores_unrelated_modules() {
        let directory = image::parse_mapped(&synthetic_pe64()).unwrap();
        let table = PatchTable::new(vec![ModulePatch::new("user32.dll", true, Vec::new())]);
        assert!(plan(&directory, &table).is_empty());
    }

    #[test]
    fn test_replacement_for_records_original() {
        let table = table();
        table.resolve_base("KERNEL32.DLL", 0x7000_0000);

        let hit = table.replacement_for(0x7000_0000, ProcRequest::ByName("HeapAlloc"), 0xAAAA);
        assert_eq!(hit, Some(0x1111));
        assert_eq!(
            table.modules[0].entries[0]
                .original
                .unwrap()
                .load(Ordering::Acquire),
            0xAAAA
        );

        // Unpatched symbol and unknown module both pass through.
        assert!(table
            .replacement_for(0x7000_0000, ProcRequest::ByName("HeapDestroy"), 0xBBBB)
            .is_none());
        assert!(table
            .replacement_for(0x6000_0000, ProcRequest::ByName("HeapAlloc"), 0xBBBB)
            .is_none());
    }

    #[test]
    fn test_ordinal_lookup() {
        let table = table();
        table.resolve_base("kernel32.dll", 0x7000_0000);
        assert_eq!(
            table.replacement_for(0x7000_0000, ProcRequest::ByOrdinal(42), 0xCCCC),
            Some(0x2222)
        );
        assert!(table
            .replacement_for(0x7000_0000, ProcRequest::ByOrdinal(43), 0xCCCC)
            .is_none());
    }

    #[test]
    fn test_module_reports_leaks() {
        let table = table();
        assert_eq!(table.module_reports_leaks(0x7000_0000), None);
        table.resolve_base("kernel32.dll", 0x7000_0000);
        assert_eq!(table.module_reports_leaks(0x7000_0000), Some(true));
        assert_eq!(table.module_reports_leaks(0), None);
    }

    #[test]
    fn test_find_import_marker() {
        let directory = image::parse_mapped(&synthetic_pe64()).unwrap();
        assert!(find_import(&directory, "kernel32.dll", "HeapFree"));
        assert!(!find_import(&directory, "leakscope.dll", "leakscope_marker"));
    }
}
