#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]

//! # leakscope
//!
//! An in-process memory-leak instrumentation engine, built in pure Rust. `leakscope`
//! intercepts every heap allocation and deallocation a process (and the modules it
//! loads) performs, tracks each live allocation's origin — call stack, size, owning
//! heap, owning thread — and at shutdown produces a deduplicated report of blocks
//! that were never freed.
//!
//! ## Features
//!
//! - **🪝 Transparent interception** - Per-module import-table rewriting plus a
//!   machine-code detour at the OS loader's module-entry call site, so even static
//!   initializers are captured
//! - **📒 Concurrent allocation ledger** - A fully synchronized heap → block
//!   registry with online byte accounting (total / live / peak)
//! - **🧵 Reentrant capture protocol** - A per-thread state machine correlates each
//!   raw allocation call with its resulting address and suppresses nested allocator
//!   recursion
//! - **📑 Deduplicated reports** - Identical-callstack leaks fold into one entry
//!   with a multiplicity count and a CI-stable leak hash
//! - **🛡️ Never hurts the host** - Every internal failure degrades detection
//!   fidelity instead of crashing the process
//!
//! ## Quick Start
//!
//! Add `leakscope` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! leakscope = "0.1"
//! ```
//!
//! ### Basic Usage
//!
//! ```rust
//! use leakscope::{DetectorBuilder, FixedStackProvider, Settings};
//!
//! // Build a detector with a deterministic stack provider.
//! let detector = DetectorBuilder::new(Settings::default())
//!     .stack_provider(FixedStackProvider::new(vec![0x1000, 0x2000, 0x3000]))
//!     .build();
//!
//! // Hooks drive the capture protocol; here we exercise it directly.
//! let guard = detector.enter_capture(Default::default(), leakscope::CrtFlavor::None);
//! if detector.enabled() {
//!     guard.set(0x10, 0x2000, 0, 64);
//! }
//! drop(guard);
//!
//! assert_eq!(detector.leaks_count(), 1);
//! detector.shutdown();
//! ```
//!
//! ## Architecture
//!
//! `leakscope` is organized into several key modules:
//!
//! - [`detector`] - The process-wide context and public runtime control surface
//! - [`patch`] - Import-table rewriting as data: patch tables, matching, planning
//! - [`detour`] - Loader entry-point detour: signature scanning and code synthesis
//! - [`ledger`] - The synchronized heap → block registry with byte accounting
//! - [`capture`] - The per-thread capture protocol
//! - [`report`] - Leak counting, aggregation, formatting and sinks
//! - [`modules`] - The process module registry
//! - [`stack`] - Stack capture/resolution collaborator interfaces
//! - [`Error`] and [`Result`] - Comprehensive error handling
//!
//! ### Interception
//!
//! On Windows the detector rewrites the import tables of every eligible module so
//! the heap APIs (`HeapAlloc` family, `RtlAllocateHeap` family, the CRT allocators)
//! and dynamic lookup (`GetProcAddress`) route through its replacements, and
//! hot-patches the loader's call-module-entry-point site so newly loaded modules
//! are discovered and patched before their initializers run. Both mechanisms
//! restore the original bytes at shutdown. The matching, planning and code
//! synthesis are pure, host-testable computation; only the final memory writes are
//! platform code.
//!
//! ### Failure policy
//!
//! Nothing in this crate throws across its boundary. A module whose import table
//! cannot be parsed is left unpatched; a loader whose instruction patterns are not
//! recognized simply keeps its entry uninstrumented; ledger anomalies (duplicate
//! heaps, frees of untracked addresses, cross-heap frees) are reported as
//! diagnostics. The worst outcome of any internal failure is reduced detection
//! fidelity, never a crash of the host application.

#[macro_use]
pub(crate) mod error;
pub(crate) mod utils;

/// Convenient re-exports of the most commonly used types and traits.
pub mod prelude;

/// The per-thread capture protocol.
pub mod capture;
/// The process-wide detector context and control surface.
pub mod detector;
/// Loader entry-point detour computation.
pub mod detour;
/// The synchronized heap → block allocation ledger.
pub mod ledger;
/// The process module registry.
pub mod modules;
/// Runtime configuration.
pub mod options;
/// Import-table patch engine.
pub mod patch;
/// Leak report generation and sinks.
pub mod report;
/// Stack capture and resolution interfaces.
pub mod stack;

#[cfg(windows)]
pub(crate) mod windows;

/// The result type used throughout leakscope.
pub type Result<T> = std::result::Result<T, Error>;

pub use error::Error;

pub use capture::{CaptureGuard, CaptureState, ThreadFlags, ThreadRegistry, ThreadState};
pub use detector::{Detector, DetectorBuilder, MARKER_EXPORT};
pub use ledger::{
    BlockInfo, BlockSummary, CrtFlavor, HeapHandle, HeapMapOutcome, HeapRecord, Ledger,
    MapOutcome, UnmapOutcome,
};
pub use modules::{
    FixedModuleEnumerator, ModuleEnumerator, ModuleFlags, ModuleInfo, ModuleRecord,
    ModuleRegistry,
};
pub use options::{Options, ReportFlags, Settings, StackWalkMethod};
pub use patch::{ImportName, ModulePatch, PatchEntry, PatchTable, ProcRequest};
pub use report::{HookId, LeakRecord};
pub use stack::{BacktraceProvider, CallStack, CaptureFrame, FixedStackProvider, StackProvider};

#[cfg(windows)]
pub use windows::{build_patch_table, read_block_memory, ProcessModuleEnumerator};

/// Breaks into an attached debugger after a critical diagnostic; a no-op
/// when no debugger is present (or off Windows).
#[cfg(windows)]
pub(crate) fn debug_break_if_attached() {
    use windows_sys::Win32::System::Diagnostics::Debug::{DebugBreak, IsDebuggerPresent};
    // SAFETY: both calls are argument-free and safe by contract.
    unsafe {
        if IsDebuggerPresent() != 0 {
            DebugBreak();
        }
    }
}

/// Breaks into an attached debugger after a critical diagnostic; a no-op
/// when no debugger is present (or off Windows).
#[cfg(not(windows))]
pub(crate) fn debug_break_if_attached() {}
