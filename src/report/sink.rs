//! Report output routing.
//!
//! Formatted report lines fan out to any combination of the debugger output
//! channel, a report file (optionally UTF-16 with a byte-order mark) and
//! standard output, according to the configured destination flags. Pluggable
//! hooks observe the stream: line hooks receive every formatted line, leak
//! hooks receive each reported leak's raw fields for custom consumption.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use widestring::U16String;

use crate::{
    options::ReportFlags,
    stack::CallStack,
};

/// Raw fields of one reported leak, handed to leak hooks.
#[derive(Debug)]
pub struct LeakRecord<'a> {
    /// Allocation serial number.
    pub serial: u64,
    /// Address of the leaked data as reported (CRT header already stripped).
    pub address: usize,
    /// Size of the leaked data in bytes.
    pub size: usize,
    /// Stable hash over size and call stack.
    pub leak_hash: u32,
    /// Number of identical leaks folded into this entry.
    pub count: usize,
    /// Thread that performed the allocation.
    pub thread_id: u32,
    /// The captured allocation stack, when one exists.
    pub call_stack: Option<&'a CallStack>,
}

/// Handle returned when installing a hook; used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(usize);

type LineHook = Box<dyn Fn(&str) + Send + Sync>;
type LeakHook = Box<dyn Fn(&LeakRecord<'_>) + Send + Sync>;

/// Destination-routing report sink.
///
/// One sink instance exists per detector, guarded by the detector's options
/// lock; everything here is plain sequential I/O.
pub struct ReportSink {
    flags: ReportFlags,
    path: PathBuf,
    file: Option<BufWriter<File>>,
    slow_debugger: bool,
    line_hooks: Vec<(HookId, LineHook)>,
    leak_hooks: Vec<(HookId, LeakHook)>,
    next_hook: usize,
}

impl std::fmt::Debug for ReportSink {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ReportSink")
            .field("flags", &self.flags)
            .field("path", &self.path)
            .field("line_hooks", &self.line_hooks.len())
            .field("leak_hooks", &self.leak_hooks.len())
            .finish()
    }
}

impl ReportSink {
    /// Creates a sink for the given destinations. When file output is
    /// requested but the file cannot be opened, a warning goes to the
    /// remaining destinations and reporting degrades to them.
    #[must_use]
    pub fn new(flags: ReportFlags, path: &Path, slow_debugger: bool) -> Self {
        let mut sink = ReportSink {
            flags,
            path: path.to_path_buf(),
            file: None,
            slow_debugger,
            line_hooks: Vec::new(),
            leak_hooks: Vec::new(),
            next_hook: 1,
        };
        sink.reopen();
        sink
    }

    /// Reconfigures destinations and file path; reopens the report file.
    pub fn configure(&mut self, flags: ReportFlags, path: &Path) {
        self.flush();
        self.flags = flags;
        self.path = path.to_path_buf();
        self.file = None;
        self.reopen();
    }

    /// Current destination flags.
    #[must_use]
    pub fn flags(&self) -> ReportFlags {
        self.flags
    }

    /// Current report file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reopen(&mut self) {
        if !self.flags.contains(ReportFlags::TO_FILE) {
            return;
        }
        match File::create(&self.path) {
            Ok(file) => {
                let mut writer = BufWriter::new(file);
                if self.flags.contains(ReportFlags::UNICODE) {
                    // Byte-order mark before anything else reaches the file.
                    let _ = writer.write_all(&0xFEFFu16.to_le_bytes());
                }
                self.file = Some(writer);
            }
            Err(error) => {
                let warning = format!(
                    "WARNING: leakscope: couldn't open report file for writing: {} ({error})\n  The report will be sent to the debugger instead.",
                    self.path.display()
                );
                self.flags.remove(ReportFlags::TO_FILE);
                self.flags.insert(ReportFlags::TO_DEBUGGER);
                self.line(&warning);
            }
        }
    }

    /// Routes one report line to every configured destination and line hook.
    pub fn line(&mut self, text: &str) {
        for (_, hook) in &self.line_hooks {
            hook(text);
        }

        if self.flags.contains(ReportFlags::TO_DEBUGGER) {
            debugger_line(text);
            if self.slow_debugger {
                // Pace output so slow debugger consoles don't drop lines.
                thread::sleep(Duration::from_millis(4));
            }
        }

        if self.flags.contains(ReportFlags::TO_STDOUT) {
            println!("{text}");
        }

        if let Some(writer) = self.file.as_mut() {
            let result = if self.flags.contains(ReportFlags::UNICODE) {
                let wide = U16String::from_str(&format!("{text}\r\n"));
                let mut bytes = Vec::with_capacity(wide.len() * 2);
                for unit in wide.as_slice() {
                    bytes.extend_from_slice(&unit.to_le_bytes());
                }
                writer.write_all(&bytes)
            } else {
                writeln!(writer, "{text}")
            };
            if let Err(error) = result {
                log::warn!("report file write failed: {error}");
            }
        }
    }

    /// Hands one leak's raw fields to every leak hook.
    pub fn leak(&self, record: &LeakRecord<'_>) {
        for (_, hook) in &self.leak_hooks {
            hook(record);
        }
    }

    /// Installs a hook receiving every formatted report line.
    pub fn install_line_hook(&mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> HookId {
        let id = HookId(self.next_hook);
        self.next_hook += 1;
        self.line_hooks.push((id, Box::new(hook)));
        id
    }

    /// Installs a hook receiving each reported leak's raw fields.
    pub fn install_leak_hook(
        &mut self,
        hook: impl Fn(&LeakRecord<'_>) + Send + Sync + 'static,
    ) -> HookId {
        let id = HookId(self.next_hook);
        self.next_hook += 1;
        self.leak_hooks.push((id, Box::new(hook)));
        id
    }

    /// Removes a previously installed hook. Returns whether it existed.
    pub fn remove_hook(&mut self, id: HookId) -> bool {
        let before = self.line_hooks.len() + self.leak_hooks.len();
        self.line_hooks.retain(|(hook_id, _)| *hook_id != id);
        self.leak_hooks.retain(|(hook_id, _)| *hook_id != id);
        before != self.line_hooks.len() + self.leak_hooks.len()
    }

    /// Flushes buffered file output.
    pub fn flush(&mut self) {
        if let Some(writer) = self.file.as_mut() {
            let _ = writer.flush();
        }
    }
}

impl Drop for ReportSink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(windows)]
fn debugger_line(text: &str) {
    let wide = U16String::from_str(&format!("{text}\n"));
    let mut buffer = wide.into_vec();
    buffer.push(0);
    // SAFETY: buffer is a valid NUL-terminated UTF-16 string.
    unsafe {
        windows_sys::Win32::System::Diagnostics::Debug::OutputDebugStringW(buffer.as_ptr());
    }
}

#[cfg(not(windows))]
fn debugger_line(text: &str) {
    eprintln!("{text}");
}
