//! Default stack provider backed by the `backtrace` crate.

use std::ffi::c_void;

use crate::{
    options::StackWalkMethod,
    stack::{CallStack, CaptureFrame, StackProvider},
};

/// Symbol-name fragments that identify C-runtime/static-initializer startup
/// frames. A stack whose outermost resolved frame matches one of these is
/// classified as a startup allocation.
const CRT_STARTUP_MARKERS: &[&str] = &[
    "__scrt_common_main",
    "_initterm",
    "_initterm_e",
    "__acrt_initialize",
    "pre_c_initialization",
    "pre_cpp_initialization",
    "__libc_start_main",
    "lang_start",
];

/// Frame-name fragments trimmed from resolved output unless internal frames
/// were requested.
const INTERNAL_FRAME_MARKERS: &[&str] = &["leakscope::", "backtrace::", "RtlAllocateHeap", "HeapAlloc"];

/// Stack provider that walks the current thread with the `backtrace` crate and
/// resolves frames through the platform symbol handler.
///
/// # Examples
///
/// ```rust
/// use leakscope::{BacktraceProvider, CaptureFrame, StackProvider};
///
/// let provider = BacktraceProvider::default();
/// let stack = provider.capture(16, CaptureFrame::default());
/// assert!(stack.frames().len() <= 16);
/// ```
#[derive(Debug, Default)]
pub struct BacktraceProvider {
    method: StackWalkMethod,
}

impl BacktraceProvider {
    /// Creates a provider using the given walking strategy.
    ///
    /// [`StackWalkMethod::Fast`] trusts frame pointers; [`StackWalkMethod::Safe`]
    /// forces the full unwinder on every capture.
    #[must_use]
    pub fn new(method: StackWalkMethod) -> Self {
        BacktraceProvider { method }
    }

    fn is_startup_symbol(name: &str) -> bool {
        CRT_STARTUP_MARKERS.iter().any(|marker| name.contains(marker))
    }

    fn is_internal_symbol(name: &str) -> bool {
        INTERNAL_FRAME_MARKERS.iter().any(|marker| name.contains(marker))
    }
}

impl StackProvider for BacktraceProvider {
    fn capture(&self, max_frames: u32, frame: CaptureFrame) -> CallStack {
        let max_frames = max_frames.max(1) as usize;
        let mut frames = Vec::with_capacity(max_frames.min(64));

        // The walk starts inside the detector; skip frames until the recorded
        // entry shows up so the application's caller is the first frame. When
        // no entry was recorded keep everything, which is also what the safe
        // method wants.
        let mut seen_entry = frame.entry == 0 || self.method == StackWalkMethod::Safe;
        backtrace::trace(|raw| {
            let ip = raw.ip() as usize;
            if !seen_entry {
                seen_entry = ip == frame.entry;
                return true;
            }
            frames.push(ip);
            frames.len() < max_frames
        });

        // The entry marker never matched; fall back to the unfiltered walk
        // rather than returning an empty stack.
        if frames.is_empty() {
            backtrace::trace(|raw| {
                frames.push(raw.ip() as usize);
                frames.len() < max_frames
            });
        }

        CallStack::from_frames(frames)
    }

    fn resolve(&self, stack: &mut CallStack, include_internal_frames: bool) -> usize {
        if stack.is_resolved() {
            return 0;
        }

        let mut lines = Vec::with_capacity(stack.frames().len());
        let mut unresolved = 0;
        let mut crt_startup = false;

        for &ip in stack.frames() {
            let mut line = None;
            backtrace::resolve(ip as *mut c_void, |symbol| {
                if line.is_some() {
                    return;
                }
                let name = symbol
                    .name()
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| format!("{ip:#x}"));
                if Self::is_startup_symbol(&name) {
                    crt_startup = true;
                }
                if !include_internal_frames && Self::is_internal_symbol(&name) {
                    line = Some(String::new());
                    return;
                }
                line = Some(match (symbol.filename(), symbol.lineno()) {
                    (Some(file), Some(lineno)) => {
                        format!("{ip:#018x} {name} ({}:{lineno})", file.display())
                    }
                    _ => format!("{ip:#018x} {name}"),
                });
            });

            match line {
                Some(text) if text.is_empty() => {} // trimmed internal frame
                Some(text) => lines.push(text),
                None => {
                    unresolved += 1;
                    lines.push(format!("{ip:#018x} (no symbol available)"));
                }
            }
        }

        stack.set_resolution(lines, crt_startup);
        unresolved
    }
}
