//! Process module registry.
//!
//! Records every module mapped into the process: its address range, display
//! name, filesystem path and per-module attachment flags. The registry holds
//! one snapshot at a time; every refresh replaces the snapshot wholesale under
//! the registry lock (the old snapshot is dropped, the new one takes
//! ownership). Address lookups use interval containment so a return address
//! can be attributed to its owning module.
//!
//! # Key Components
//!
//! - [`ModuleInfo`] - One module's range, name, path and flags
//! - [`ModuleRegistry`] - The synchronized snapshot with interval lookup
//! - [`ModuleEnumerator`] - Collaborator that produces the raw module records
//! - [`FixedModuleEnumerator`] - Deterministic enumerator for tests

use std::path::PathBuf;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::Result;

bitflags! {
    /// Per-module attachment flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ModuleFlags: u32 {
        /// Debug symbols were loaded for this module.
        const SYMBOLS_LOADED = 0x01;
        /// The module never contributes to leak detection.
        const EXCLUDED       = 0x02;
    }
}

/// Raw module record as produced by the enumeration service: one record per
/// currently loaded module.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    /// Fully qualified path the module was loaded from.
    pub path: PathBuf,
    /// Base address the module is mapped at.
    pub base: usize,
    /// Size of the mapped image in bytes.
    pub size: usize,
}

/// Module enumeration service.
///
/// Each call to [`ModuleEnumerator::modules`] produces a one-shot, finite
/// sequence of records describing the process's current module set; the
/// registry consumes it both at attach time and on every refresh.
pub trait ModuleEnumerator: Send + Sync {
    /// Enumerates every module currently mapped into the process.
    fn modules(&self) -> Result<Vec<ModuleRecord>>;
}

/// Enumerator returning a fixed record list; for tests and embedding hosts
/// that manage their own module set.
#[derive(Debug, Default)]
pub struct FixedModuleEnumerator {
    records: Vec<ModuleRecord>,
}

impl FixedModuleEnumerator {
    /// Creates an enumerator that always returns `records`.
    #[must_use]
    pub fn new(records: Vec<ModuleRecord>) -> Self {
        FixedModuleEnumerator { records }
    }
}

impl ModuleEnumerator for FixedModuleEnumerator {
    fn modules(&self) -> Result<Vec<ModuleRecord>> {
        Ok(self.records.clone())
    }
}

/// Information about one loaded module.
///
/// Identity and ordering key is the address range; the flags are the only
/// field updated in place between snapshot refreshes.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Lowest address of the mapped image.
    pub base: usize,
    /// Highest address of the mapped image (inclusive).
    pub end: usize,
    /// Lower-cased file name, e.g. `kernel32.dll`.
    pub name: String,
    /// Fully qualified path the module was loaded from.
    pub path: PathBuf,
    /// Attachment flags.
    pub flags: ModuleFlags,
}

impl ModuleInfo {
    /// Builds a module info from an enumeration record.
    #[must_use]
    pub fn from_record(record: &ModuleRecord) -> Self {
        let name = record
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        ModuleInfo {
            base: record.base,
            end: record.base + record.size.saturating_sub(1),
            name,
            path: record.path.clone(),
            flags: ModuleFlags::empty(),
        }
    }

    /// Whether `address` falls inside this module's mapped range.
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        (self.base..=self.end).contains(&address)
    }
}

/// The synchronized module snapshot.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Mutex<Vec<ModuleInfo>>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        ModuleRegistry::default()
    }

    /// Replaces the current snapshot. The list is ordered by base address so
    /// containment lookups can binary search.
    pub fn replace(&self, mut snapshot: Vec<ModuleInfo>) {
        snapshot.sort_by_key(|module| module.base);
        *self.modules.lock() = snapshot;
    }

    /// Flags of a previous snapshot's entry for the same range, if any.
    /// Used to carry attachment state across a refresh.
    #[must_use]
    pub fn flags_of(&self, base: usize) -> Option<ModuleFlags> {
        let modules = self.modules.lock();
        modules
            .iter()
            .find(|module| module.base == base)
            .map(|module| module.flags)
    }

    /// Returns a clone of the module containing `address`.
    #[must_use]
    pub fn find_containing(&self, address: usize) -> Option<ModuleInfo> {
        let modules = self.modules.lock();
        let index = match modules.binary_search_by_key(&address, |module| module.base) {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };
        let module = &modules[index];
        module.contains(address).then(|| module.clone())
    }

    /// Updates the exclusion flag of the module based at `base`. Returns
    /// whether a module was found.
    pub fn set_excluded(&self, base: usize, excluded: bool) -> bool {
        let mut modules = self.modules.lock();
        if let Some(module) = modules.iter_mut().find(|module| module.base == base) {
            module.flags.set(ModuleFlags::EXCLUDED, excluded);
            true
        } else {
            false
        }
    }

    /// Whether the module containing `address` is excluded from detection.
    /// Addresses outside every known module are not excluded.
    #[must_use]
    pub fn is_excluded(&self, address: usize) -> bool {
        self.find_containing(address)
            .is_some_and(|module| module.flags.contains(ModuleFlags::EXCLUDED))
    }

    /// Number of modules in the current snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.lock().len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.lock().is_empty()
    }

    /// Returns a clone of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ModuleInfo> {
        self.modules.lock().clone()
    }
}
