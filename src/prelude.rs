//! # leakscope Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and
//! traits from the leakscope library. Import this module to get quick access to
//! the essential types for in-process leak detection.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all leakscope operations
pub use crate::Error;

/// The result type used throughout leakscope
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// The process-wide detector context
pub use crate::detector::{Detector, DetectorBuilder};

/// Resolved configuration values and option bits
pub use crate::options::{Options, ReportFlags, Settings, StackWalkMethod};

// ================================================================================================
// Ledger
// ================================================================================================

/// The allocation ledger and its record types
pub use crate::ledger::{
    BlockInfo, BlockSummary, CrtFlavor, HeapHandle, HeapMapOutcome, Ledger, MapOutcome,
    UnmapOutcome,
};

// ================================================================================================
// Capture Protocol
// ================================================================================================

/// Per-thread capture states and the RAII guard
pub use crate::capture::{CaptureGuard, CaptureState, ThreadRegistry};

/// Stack capture interfaces and the bundled providers
pub use crate::stack::{
    BacktraceProvider, CallStack, CaptureFrame, FixedStackProvider, StackProvider,
};

// ================================================================================================
// Interception
// ================================================================================================

/// Patch configuration types
pub use crate::patch::{ImportName, ModulePatch, PatchEntry, PatchTable};

/// Module registry types
pub use crate::modules::{ModuleEnumerator, ModuleInfo, ModuleRecord, ModuleRegistry};

// ================================================================================================
// Reporting
// ================================================================================================

/// Report hooks
pub use crate::report::{HookId, LeakRecord};
