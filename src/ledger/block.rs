//! Per-allocation metadata records.

use crate::stack::CallStack;

/// Which C-runtime debug-header layout wraps a tracked block, if any.
///
/// The flavor is either declared by the intercepted entry point (the CRT debug
/// allocation routines announce themselves) or detected later by the
/// reporter's header heuristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CrtFlavor {
    /// Plain allocation, no debug header.
    #[default]
    None,
    /// Wrapped by the classic debug-CRT block header.
    Static,
    /// Wrapped by the Universal CRT block header.
    Universal,
}

impl CrtFlavor {
    /// Whether the block carries any CRT debug header.
    #[must_use]
    pub fn is_wrapped(&self) -> bool {
        !matches!(self, CrtFlavor::None)
    }
}

/// Metadata for one live allocation.
///
/// A `BlockInfo` lives in exactly one heap's block map at a time, keyed by the
/// block's current address. It exclusively owns its captured call stack, which
/// is attached lazily once the allocating call has returned.
#[derive(Debug)]
pub struct BlockInfo {
    thread_id: u32,
    serial: u64,
    size: usize,
    reported: bool,
    crt: CrtFlavor,
    call_stack: Option<CallStack>,
}

impl BlockInfo {
    pub(crate) fn new(thread_id: u32, serial: u64, size: usize, crt: CrtFlavor) -> Self {
        BlockInfo {
            thread_id,
            serial,
            size,
            reported: false,
            crt,
            call_stack: None,
        }
    }

    /// Id of the thread that performed the allocation.
    #[must_use]
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Monotonically increasing allocation serial number.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Byte size of the allocation as last observed.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this block has already been emitted or checkpointed away.
    #[must_use]
    pub fn is_reported(&self) -> bool {
        self.reported
    }

    /// CRT debug-header flavor, if the block is wrapped.
    #[must_use]
    pub fn crt_flavor(&self) -> CrtFlavor {
        self.crt
    }

    /// The captured allocation call stack, once attached.
    #[must_use]
    pub fn call_stack(&self) -> Option<&CallStack> {
        self.call_stack.as_ref()
    }

    pub(crate) fn call_stack_mut(&mut self) -> Option<&mut CallStack> {
        self.call_stack.as_mut()
    }

    pub(crate) fn set_call_stack(&mut self, stack: CallStack) {
        self.call_stack = Some(stack);
    }

    pub(crate) fn clear_call_stack(&mut self) {
        self.call_stack = None;
    }

    pub(crate) fn mark_reported(&mut self) {
        self.reported = true;
    }

    pub(crate) fn set_crt_flavor(&mut self, crt: CrtFlavor) {
        self.crt = crt;
    }

    /// Updates size and owning thread for an in-place reallocation. The serial
    /// number is preserved; the stale call stack is discarded so the
    /// reallocation's own stack can replace it.
    pub(crate) fn update_in_place(&mut self, size: usize, thread_id: u32) {
        self.size = size;
        self.thread_id = thread_id;
        self.call_stack = None;
    }
}
