//! Runtime configuration for the detector.
//!
//! The crate never reads a settings file itself — an external configuration
//! loader resolves values from whatever source the host uses and hands a
//! [`Settings`] struct over (the serde derives exist so any format can feed
//! it). [`Settings`] is converted once into the live option state the detector
//! guards behind its options lock.
//!
//! # Key Components
//!
//! - [`Options`] - Behavioral switches (aggregation, validation, self-test, ...)
//! - [`ReportFlags`] - Report destinations and encoding
//! - [`StackWalkMethod`] - Which stack-capture strategy the provider should use
//! - [`Settings`] - Resolved configuration values as supplied by the host

use std::path::PathBuf;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Trace-frame limit applied when the configured value is zero.
pub const DEFAULT_MAX_TRACE_FRAMES: u32 = 64;

/// Data-dump limit applied by default (bytes of leaked content shown per block).
pub const DEFAULT_MAX_DATA_DUMP: usize = 256;

/// Default file name used when reporting to a file without an explicit path.
pub const DEFAULT_REPORT_FILE: &str = "memory_leak_report.txt";

bitflags! {
    /// Behavioral switches of the detector.
    ///
    /// Mirrors the option bitmask exposed on the public control surface;
    /// [`crate::Detector::set_options`] masks writes to exactly these bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Options: u32 {
        /// Collapse leaks with identical size and call stack into one entry.
        const AGGREGATE_DUPLICATES  = 0x0001;
        /// Treat the forced module list as an include list instead of an exclude list.
        const MODULE_LIST_INCLUDE   = 0x0002;
        /// Ask the stack provider for its slow-but-safe walking strategy.
        const SAFE_STACK_WALK       = 0x0004;
        /// Start with leak detection disabled on every thread.
        const START_DISABLED        = 0x0008;
        /// Include detector and heap-internal frames in captured stacks.
        const TRACE_INTERNAL_FRAMES = 0x0010;
        /// Do not report blocks whose call stack originates in runtime startup code.
        const SKIP_CRT_STARTUP_LEAKS = 0x0020;
        /// Do not report blocks the C runtime frees after detector teardown.
        const SKIP_HEAP_FREE_LEAKS  = 0x0040;
        /// On an untracked free, scan every heap for an allocated-here-freed-there mismatch.
        const VALIDATE_HEAP_FREE    = 0x0080;
        /// Leak one internal marker block and verify it is detected exactly once.
        const SELF_TEST             = 0x0100;
        /// Throttle debugger-channel output (works around slow debugger consoles).
        const SLOW_DEBUGGER_DUMP    = 0x0200;
        /// Master switch: the detector never installs and every call is a no-op.
        const OFF                   = 0x8000;
    }
}

bitflags! {
    /// Report destinations and encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ReportFlags: u32 {
        /// Send report lines to the debugger output channel.
        const TO_DEBUGGER = 0x01;
        /// Send report lines to the configured report file.
        const TO_FILE     = 0x02;
        /// Send report lines to standard output.
        const TO_STDOUT   = 0x04;
        /// Encode the report file as UTF-16 with a byte-order mark.
        const UNICODE     = 0x08;
    }
}

impl Default for ReportFlags {
    fn default() -> Self {
        ReportFlags::TO_DEBUGGER
    }
}

/// Strategy the stack-capture service should use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum StackWalkMethod {
    /// Frame-pointer walking; fast, may miss frames in optimized code.
    #[default]
    #[strum(serialize = "fast")]
    Fast,
    /// Full unwind-data walking; slow but complete.
    #[strum(serialize = "safe")]
    Safe,
}

/// Resolved configuration values, as supplied by the host's settings source.
///
/// # Examples
///
/// ```rust
/// use leakscope::{Options, Settings};
///
/// let mut settings = Settings::default();
/// settings.flags |= Options::AGGREGATE_DUPLICATES;
/// settings.max_trace_frames = 32;
/// assert!(settings.flags.contains(Options::AGGREGATE_DUPLICATES));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Behavioral option bits.
    pub flags: Options,
    /// Report destinations and encoding.
    pub report: ReportFlags,
    /// Maximum bytes of leaked data dumped per block; zero suppresses dumps.
    pub max_data_dump: usize,
    /// Maximum frames captured per call stack; zero selects the default limit.
    pub max_trace_frames: u32,
    /// Module names forced into or out of leak detection, lower-case.
    ///
    /// Interpreted as an include list when [`Options::MODULE_LIST_INCLUDE`] is
    /// set, as an exclude list otherwise.
    pub forced_modules: Vec<String>,
    /// Path of the report file, used when [`ReportFlags::TO_FILE`] is set.
    pub report_path: PathBuf,
    /// Stack-capture strategy handed to the provider.
    pub stack_walk: StackWalkMethod,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            flags: Options::empty(),
            report: ReportFlags::default(),
            max_data_dump: DEFAULT_MAX_DATA_DUMP,
            max_trace_frames: DEFAULT_MAX_TRACE_FRAMES,
            forced_modules: Vec::new(),
            report_path: PathBuf::from(DEFAULT_REPORT_FILE),
            stack_walk: StackWalkMethod::Fast,
        }
    }
}

impl Settings {
    /// Returns the effective trace-frame limit, substituting the default for zero.
    #[must_use]
    pub fn effective_trace_frames(&self) -> u32 {
        if self.max_trace_frames == 0 {
            DEFAULT_MAX_TRACE_FRAMES
        } else {
            self.max_trace_frames
        }
    }

    /// Returns whether `module_name` (matched case-insensitively) is excluded by
    /// the forced module list.
    #[must_use]
    pub fn excludes_module(&self, module_name: &str) -> bool {
        let listed = self
            .forced_modules
            .iter()
            .any(|name| name.eq_ignore_ascii_case(module_name));
        if self.flags.contains(Options::MODULE_LIST_INCLUDE) {
            !listed
        } else {
            listed
        }
    }
}
