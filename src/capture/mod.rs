//! The per-thread capture protocol.
//!
//! Every intercepted allocation call is wrapped in a [`CaptureGuard`]. The
//! guard drives an explicit per-thread state machine: the outermost entry on a
//! thread transitions [`CaptureState::Idle`] → [`CaptureState::Capturing`] and
//! records the originating frame; nested re-entries (an allocator calling
//! another hooked allocator internally) only bump a depth counter and never
//! re-record the frame. When the outermost guard unwinds it commits the
//! pending allocation into the ledger and captures a call stack for it.
//!
//! The correlation trick at the heart of the protocol: the *outermost* entry
//! owns the frame (that is where the application called into the allocator),
//! while the *innermost* [`CaptureGuard::set`] owns the pending parameters
//! (that is where the concrete heap, address and size are known). Both land in
//! the same thread state, so the commit sees the application's frame paired
//! with the real allocation's address.
//!
//! # Key Components
//!
//! - [`ThreadState`] - One thread's flags, depth, frame and pending parameters
//! - [`CaptureGuard`] - RAII wrapper around one intercepted call
//! - [`ThreadRegistry`] - Lazily populated map of all thread states
//! - [`CaptureState`] - The explicit Idle/Capturing state

mod registry;

pub use registry::ThreadRegistry;
pub(crate) use registry::current_thread_id;

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::{
    detector::Detector,
    ledger::CrtFlavor,
    stack::CaptureFrame,
};

bitflags! {
    /// Per-thread capture flags.
    ///
    /// `ENABLED`/`DISABLED` are both clear while a thread has never been
    /// touched; the first enablement query initializes them from the global
    /// default. The CRT bits mark the attribution of the in-flight allocation
    /// and are cleared on every reset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Leak detection is enabled on this thread.
        const ENABLED   = 0x01;
        /// Leak detection is disabled on this thread.
        const DISABLED  = 0x02;
        /// The in-flight allocation is a debug-CRT block.
        const DEBUG_CRT = 0x04;
        /// The in-flight allocation is a Universal-CRT block.
        const UCRT      = 0x08;
    }
}

/// Explicit capture state of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    /// The thread is outside the capture protocol.
    Idle = 0,
    /// The outermost entry has recorded a frame and not yet committed.
    Capturing = 1,
}

/// Capture state for one thread.
///
/// Created lazily on the thread's first contact with a hook and owned by the
/// [`ThreadRegistry`]. All fields are atomics because other threads *read*
/// them (global enable/disable walks every state; the shutdown path polls the
/// capture state), but only the owning thread ever writes the capture-protocol
/// fields.
#[derive(Debug)]
pub struct ThreadState {
    thread_id: u32,
    state: AtomicU8,
    depth: AtomicU32,
    flags: AtomicU32,
    old_flags: AtomicU32,
    frame_pointer: AtomicUsize,
    entry: AtomicUsize,
    pending_heap: AtomicUsize,
    pending_block: AtomicUsize,
    pending_new_block: AtomicUsize,
    pending_size: AtomicUsize,
}

impl ThreadState {
    pub(crate) fn new(thread_id: u32) -> Self {
        ThreadState {
            thread_id,
            state: AtomicU8::new(CaptureState::Idle as u8),
            depth: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            old_flags: AtomicU32::new(0),
            frame_pointer: AtomicUsize::new(0),
            entry: AtomicUsize::new(0),
            pending_heap: AtomicUsize::new(0),
            pending_block: AtomicUsize::new(0),
            pending_new_block: AtomicUsize::new(0),
            pending_size: AtomicUsize::new(0),
        }
    }

    /// Id of the owning thread.
    #[must_use]
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Current state of the capture state machine.
    #[must_use]
    pub fn capture_state(&self) -> CaptureState {
        if self.state.load(Ordering::Relaxed) == CaptureState::Capturing as u8 {
            CaptureState::Capturing
        } else {
            CaptureState::Idle
        }
    }

    /// Whether the thread is currently inside the capture protocol.
    #[must_use]
    pub fn in_capture(&self) -> bool {
        self.capture_state() == CaptureState::Capturing
    }

    /// Current reentrancy depth.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Current per-thread flags.
    #[must_use]
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub(crate) fn set_flags(&self, flags: ThreadFlags) {
        self.flags.store(flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn save_flags(&self) {
        self.old_flags
            .store(self.flags.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    pub(crate) fn restore_saved_flags(&self) {
        let saved = ThreadFlags::from_bits_truncate(self.old_flags.load(Ordering::Relaxed))
            & (ThreadFlags::ENABLED | ThreadFlags::DISABLED);
        let mut flags = self.flags();
        flags.remove(ThreadFlags::ENABLED | ThreadFlags::DISABLED);
        flags.insert(saved);
        self.set_flags(flags);
    }

    /// Enters the capture protocol. Returns `true` for the outermost entry,
    /// which records the frame and the CRT attribution.
    pub(crate) fn enter(&self, frame: CaptureFrame, crt: CrtFlavor) -> bool {
        let crt_bits = match crt {
            CrtFlavor::None => ThreadFlags::empty(),
            CrtFlavor::Static => ThreadFlags::DEBUG_CRT,
            CrtFlavor::Universal => ThreadFlags::UCRT,
        };
        self.flags.fetch_or(crt_bits.bits(), Ordering::Relaxed);

        let previous = self.depth.fetch_add(1, Ordering::Relaxed);
        if previous == 0 {
            self.frame_pointer.store(frame.frame_pointer, Ordering::Relaxed);
            self.entry.store(frame.entry, Ordering::Relaxed);
            self.state
                .store(CaptureState::Capturing as u8, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub(crate) fn leave(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }

    /// Stashes the parameters of the in-flight allocation. The innermost
    /// interception wins; see the module documentation.
    pub(crate) fn set_pending(&self, heap: usize, block: usize, new_block: usize, size: usize) {
        self.pending_heap.store(heap, Ordering::Relaxed);
        self.pending_block.store(block, Ordering::Relaxed);
        self.pending_new_block.store(new_block, Ordering::Relaxed);
        self.pending_size.store(size, Ordering::Relaxed);
    }

    pub(crate) fn pending(&self) -> (usize, usize, usize, usize) {
        (
            self.pending_heap.load(Ordering::Relaxed),
            self.pending_block.load(Ordering::Relaxed),
            self.pending_new_block.load(Ordering::Relaxed),
            self.pending_size.load(Ordering::Relaxed),
        )
    }

    /// The frame recorded by the outermost entry.
    #[must_use]
    pub fn frame(&self) -> CaptureFrame {
        CaptureFrame {
            frame_pointer: self.frame_pointer.load(Ordering::Relaxed),
            entry: self.entry.load(Ordering::Relaxed),
        }
    }

    /// CRT attribution of the in-flight allocation.
    #[must_use]
    pub fn crt_flavor(&self) -> CrtFlavor {
        let flags = self.flags();
        if flags.contains(ThreadFlags::DEBUG_CRT) {
            CrtFlavor::Static
        } else if flags.contains(ThreadFlags::UCRT) {
            CrtFlavor::Universal
        } else {
            CrtFlavor::None
        }
    }

    /// Clears frame, pending parameters and CRT attribution so the thread is
    /// ready for its next allocation. Enablement flags survive.
    pub(crate) fn reset(&self) {
        self.frame_pointer.store(0, Ordering::Relaxed);
        self.entry.store(0, Ordering::Relaxed);
        self.set_pending(0, 0, 0, 0);
        self.flags.fetch_and(
            !(ThreadFlags::DEBUG_CRT | ThreadFlags::UCRT).bits(),
            Ordering::Relaxed,
        );
        self.state.store(CaptureState::Idle as u8, Ordering::Relaxed);
    }
}

/// RAII wrapper around one intercepted allocation call.
///
/// Constructed on hook entry via [`Detector::enter_capture`]; on drop, the
/// outermost guard commits the pending allocation into the ledger, captures a
/// call stack for it, and resets the thread state. Nested guards are no-ops
/// for capture purposes. Once a thread has entered the outermost capture state
/// it always runs to completion — there are no suspension points mid-capture.
pub struct CaptureGuard<'a> {
    detector: &'a Detector,
    state: Arc<ThreadState>,
    outermost: bool,
}

impl<'a> CaptureGuard<'a> {
    pub(crate) fn new(detector: &'a Detector, frame: CaptureFrame, crt: CrtFlavor) -> Self {
        let state = detector.threads().current();
        let outermost = state.enter(frame, crt);
        CaptureGuard {
            detector,
            state,
            outermost,
        }
    }

    /// Stashes the outcome of the wrapped call once a concrete address is
    /// known.
    ///
    /// For a plain allocation pass the block address and `0` for `new_block`;
    /// for a reallocation pass the old address and the new one. Calls from
    /// nested interceptions overwrite earlier values — the innermost call
    /// describes the real heap operation.
    pub fn set(&self, heap: usize, block: usize, new_block: usize, size: usize) {
        self.state.set_pending(heap, block, new_block, size);
    }

    /// Whether this guard is the outermost entry on the current thread.
    #[must_use]
    pub fn is_outermost(&self) -> bool {
        self.outermost
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        if self.outermost {
            self.detector.commit_capture(&self.state);
            self.state.reset();
        }
        self.state.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outermost_entry_records_frame() {
        let state = ThreadState::new(1);
        let frame = CaptureFrame {
            frame_pointer: 0xBEEF,
            entry: 0xF00D,
        };

        assert!(state.enter(frame, CrtFlavor::None));
        assert_eq!(state.capture_state(), CaptureState::Capturing);
        assert_eq!(state.frame(), frame);

        // A nested entry neither transitions state nor re-records the frame.
        let nested = CaptureFrame {
            frame_pointer: 0x1111,
            entry: 0x2222,
        };
        assert!(!state.enter(nested, CrtFlavor::Static));
        assert_eq!(state.frame(), frame);
        assert_eq!(state.depth(), 2);

        state.leave();
        state.reset();
        state.leave();
        assert_eq!(state.capture_state(), CaptureState::Idle);
        assert_eq!(state.depth(), 0);
    }

    #[test]
    fn test_innermost_set_wins() {
        let state = ThreadState::new(1);
        state.enter(CaptureFrame::default(), CrtFlavor::None);
        state.set_pending(0xA, 0x1000, 0, 64);
        // Nested interception observes the real heap call.
        state.enter(CaptureFrame::default(), CrtFlavor::None);
        state.set_pending(0xB, 0x2000, 0, 80);
        assert_eq!(state.pending(), (0xB, 0x2000, 0, 80));
    }

    #[test]
    fn test_reset_preserves_enablement() {
        let state = ThreadState::new(1);
        state.set_flags(ThreadFlags::ENABLED);
        state.enter(CaptureFrame::default(), CrtFlavor::Universal);
        assert_eq!(state.crt_flavor(), CrtFlavor::Universal);

        state.reset();
        assert_eq!(state.crt_flavor(), CrtFlavor::None);
        assert!(state.flags().contains(ThreadFlags::ENABLED));
    }

    #[test]
    fn test_save_and_restore_flags() {
        let state = ThreadState::new(1);
        state.set_flags(ThreadFlags::ENABLED);
        state.save_flags();
        state.set_flags(ThreadFlags::DISABLED);
        state.restore_saved_flags();
        assert!(state.flags().contains(ThreadFlags::ENABLED));
        assert!(!state.flags().contains(ThreadFlags::DISABLED));
    }
}
