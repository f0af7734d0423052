//! Replacement heap entry points and the Windows patch table.
//!
//! Every function here stands in for a heap or loader API in some module's
//! rewritten import table. Each one wraps the pass-through call in a
//! [`CaptureGuard`](crate::capture::CaptureGuard): the outermost hook on a
//! thread records the caller's frame, the innermost hook that observes the
//! real heap operation stashes its parameters, and the outermost exit
//! commits the pair into the ledger. Calls arriving while no detector is
//! installed pass straight through.
//!
//! Originals are resolved once at table construction via the loader, so the
//! import-table entries need no displaced-original slots.

use std::ffi::c_void;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};

use crate::{
    detector::Detector,
    ledger::CrtFlavor,
    patch::{ImportName, ModulePatch, PatchEntry, PatchTable, ProcRequest},
    stack::CaptureFrame,
};

type HeapAllocFn = unsafe extern "system" fn(*mut c_void, u32, usize) -> *mut c_void;
type HeapReAllocFn =
    unsafe extern "system" fn(*mut c_void, u32, *mut c_void, usize) -> *mut c_void;
type HeapFreeFn = unsafe extern "system" fn(*mut c_void, u32, *mut c_void) -> i32;
type HeapCreateFn = unsafe extern "system" fn(u32, usize, usize) -> *mut c_void;
type HeapDestroyFn = unsafe extern "system" fn(*mut c_void) -> i32;
type GetProcAddressFn = unsafe extern "system" fn(HMODULE, *const u8) -> usize;
type MallocFn = unsafe extern "cdecl" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "cdecl" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "cdecl" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "cdecl" fn(*mut c_void);

static REAL_HEAP_ALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_HEAP_REALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_HEAP_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_HEAP_CREATE: AtomicUsize = AtomicUsize::new(0);
static REAL_HEAP_DESTROY: AtomicUsize = AtomicUsize::new(0);
static REAL_GET_PROC_ADDRESS: AtomicUsize = AtomicUsize::new(0);
static REAL_RTL_ALLOCATE_HEAP: AtomicUsize = AtomicUsize::new(0);
static REAL_RTL_REALLOCATE_HEAP: AtomicUsize = AtomicUsize::new(0);
static REAL_RTL_FREE_HEAP: AtomicUsize = AtomicUsize::new(0);
static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);

/// Captures the application frame that led into the hook: the first frame
/// outside the detector's own code.
#[inline(never)]
fn caller_frame(entry: usize) -> CaptureFrame {
    let mut ip = 0usize;
    let mut depth = 0;
    backtrace::trace(|frame| {
        depth += 1;
        if depth == 3 {
            ip = frame.ip() as usize;
            return false;
        }
        true
    });
    CaptureFrame {
        frame_pointer: ip,
        entry,
    }
}

fn resolve(module: &[u16], name: &str) -> usize {
    let symbol = format!("{name}\0");
    // SAFETY: both strings are NUL-terminated.
    unsafe {
        let handle = GetModuleHandleW(module.as_ptr());
        if handle.is_null() {
            return 0;
        }
        GetProcAddress(handle, symbol.as_ptr())
            .map(|function| function as usize)
            .unwrap_or(0)
    }
}

/// Replacement for `HeapAlloc` / `RtlAllocateHeap` callers routed through
/// kernel32.
///
/// # Safety
///
/// Reached only through a rewritten import slot; arguments come from the
/// original caller unchanged.
pub unsafe extern "system" fn heap_alloc(heap: *mut c_void, flags: u32, size: usize) -> *mut c_void {
    let real: HeapAllocFn =
        // SAFETY: resolved from kernel32 at table construction.
        unsafe { mem::transmute(REAL_HEAP_ALLOC.load(Ordering::Acquire)) };

    let Some(detector) = Detector::global() else {
        // SAFETY: plain pass-through.
        return unsafe { real(heap, flags, size) };
    };

    let guard = detector.enter_capture(caller_frame(heap_alloc as usize), CrtFlavor::None);
    // SAFETY: pass-through to the displaced original.
    let block = unsafe { real(heap, flags, size) };
    if !block.is_null() && detector.enabled() {
        guard.set(heap as usize, block as usize, 0, size);
    }
    block
}

/// Replacement for `HeapReAlloc`.
///
/// # Safety
///
/// Reached only through a rewritten import slot.
pub unsafe extern "system" fn heap_realloc(
    heap: *mut c_void,
    flags: u32,
    block: *mut c_void,
    size: usize,
) -> *mut c_void {
    let real: HeapReAllocFn =
        // SAFETY: resolved from kernel32 at table construction.
        unsafe { mem::transmute(REAL_HEAP_REALLOC.load(Ordering::Acquire)) };

    let Some(detector) = Detector::global() else {
        // SAFETY: plain pass-through.
        return unsafe { real(heap, flags, block, size) };
    };

    let guard = detector.enter_capture(caller_frame(heap_realloc as usize), CrtFlavor::None);
    // SAFETY: pass-through to the displaced original.
    let new_block = unsafe { real(heap, flags, block, size) };
    if !new_block.is_null() && detector.enabled() {
        guard.set(heap as usize, block as usize, new_block as usize, size);
    }
    new_block
}

/// Replacement for `HeapFree`.
///
/// # Safety
///
/// Reached only through a rewritten import slot.
pub unsafe extern "system" fn heap_free(heap: *mut c_void, flags: u32, block: *mut c_void) -> i32 {
    let real: HeapFreeFn =
        // SAFETY: resolved from kernel32 at table construction.
        unsafe { mem::transmute(REAL_HEAP_FREE.load(Ordering::Acquire)) };

    // SAFETY: pass-through to the displaced original.
    let status = unsafe { real(heap, flags, block) };
    if status != 0 {
        if let Some(detector) = Detector::global() {
            detector.free_observed(
                heap as usize,
                block as usize,
                caller_frame(heap_free as usize),
            );
        }
    }
    status
}

/// Replacement for `HeapCreate`.
///
/// # Safety
///
/// Reached only through a rewritten import slot.
pub unsafe extern "system" fn heap_create(
    options: u32,
    initial_size: usize,
    maximum_size: usize,
) -> *mut c_void {
    let real: HeapCreateFn =
        // SAFETY: resolved from kernel32 at table construction.
        unsafe { mem::transmute(REAL_HEAP_CREATE.load(Ordering::Acquire)) };

    // SAFETY: pass-through to the displaced original.
    let heap = unsafe { real(options, initial_size, maximum_size) };
    if !heap.is_null() {
        if let Some(detector) = Detector::global() {
            detector.heap_created(heap as usize);
        }
    }
    heap
}

/// Replacement for `HeapDestroy`.
///
/// # Safety
///
/// Reached only through a rewritten import slot.
pub unsafe extern "system" fn heap_destroy(heap: *mut c_void) -> i32 {
    if let Some(detector) = Detector::global() {
        detector.heap_destroyed(heap as usize);
    }
    let real: HeapDestroyFn =
        // SAFETY: resolved from kernel32 at table construction.
        unsafe { mem::transmute(REAL_HEAP_DESTROY.load(Ordering::Acquire)) };
    // SAFETY: pass-through to the displaced original.
    unsafe { real(heap) }
}

/// Replacement for `GetProcAddress`: a lookup of a patched export returns
/// the replacement so dynamically-resolved calls are intercepted too.
///
/// # Safety
///
/// Reached only through a rewritten import slot.
pub unsafe extern "system" fn get_proc_address(module: HMODULE, name: *const u8) -> usize {
    let real: GetProcAddressFn =
        // SAFETY: resolved from kernel32 at table construction.
        unsafe { mem::transmute(REAL_GET_PROC_ADDRESS.load(Ordering::Acquire)) };
    // SAFETY: pass-through to the displaced original.
    let original = unsafe { real(module, name) };
    if original == 0 {
        return 0;
    }

    let Some(detector) = Detector::global() else {
        return original;
    };

    // An ordinal lookup encodes the ordinal in the pointer's low word.
    let request = if (name as usize) >> 16 == 0 {
        ProcRequest::ByOrdinal(name as usize as u16)
    } else {
        // SAFETY: documented as a NUL-terminated ANSI string for name lookups.
        match unsafe { std::ffi::CStr::from_ptr(name.cast()) }.to_str() {
            Ok(text) => ProcRequest::ByName(text),
            Err(_) => return original,
        }
    };

    detector
        .patch_table()
        .replacement_for(module as usize, request, original)
        .unwrap_or(original)
}

macro_rules! crt_alloc_hook {
    ($name:ident, $slot:ident, $fnty:ty, $flavor:expr, ($($arg:ident : $ty:ty),*), $size:expr) => {
        /// CRT allocator replacement; attribution and pass-through only —
        /// the nested heap hook observes the real allocation.
        ///
        /// # Safety
        ///
        /// Reached only through a rewritten import slot.
        pub unsafe extern "cdecl" fn $name($($arg: $ty),*) -> *mut c_void {
            let real: $fnty =
                // SAFETY: resolved from the CRT module at table construction.
                unsafe { mem::transmute($slot.load(Ordering::Acquire)) };

            let Some(detector) = Detector::global() else {
                // SAFETY: plain pass-through.
                return unsafe { real($($arg),*) };
            };

            let _guard = detector.enter_capture(caller_frame($name as usize), $flavor);
            // SAFETY: pass-through to the displaced original; the nested
            // RtlAllocateHeap hook records the resulting block.
            let _ = $size;
            unsafe { real($($arg),*) }
        }
    };
}

crt_alloc_hook!(ucrt_malloc, REAL_MALLOC, MallocFn, CrtFlavor::Universal, (size: usize), size);
crt_alloc_hook!(
    ucrt_calloc,
    REAL_CALLOC,
    CallocFn,
    CrtFlavor::Universal,
    (count: usize, size: usize),
    count * size
);
crt_alloc_hook!(
    ucrt_realloc,
    REAL_REALLOC,
    ReallocFn,
    CrtFlavor::Universal,
    (block: *mut c_void, size: usize),
    size
);

/// CRT `free` replacement: pass-through under a capture guard so the nested
/// heap-free hook is recognized as internal.
///
/// # Safety
///
/// Reached only through a rewritten import slot.
pub unsafe extern "cdecl" fn ucrt_free(block: *mut c_void) {
    let real: FreeFn =
        // SAFETY: resolved from the CRT module at table construction.
        unsafe { mem::transmute(REAL_FREE.load(Ordering::Acquire)) };
    // SAFETY: pass-through to the displaced original; the nested HeapFree
    // hook unmaps the block.
    unsafe { real(block) }
}

/// NT heap replacements share the kernel32 shapes; the innermost of the two
/// observes the real operation, the capture guard's depth counter keeps them
/// from double-committing.
///
/// # Safety
///
/// Reached only through a rewritten import slot.
pub unsafe extern "system" fn rtl_allocate_heap(
    heap: *mut c_void,
    flags: u32,
    size: usize,
) -> *mut c_void {
    let real: HeapAllocFn =
        // SAFETY: resolved from ntdll at table construction.
        unsafe { mem::transmute(REAL_RTL_ALLOCATE_HEAP.load(Ordering::Acquire)) };

    let Some(detector) = Detector::global() else {
        // SAFETY: plain pass-through.
        return unsafe { real(heap, flags, size) };
    };

    let guard = detector.enter_capture(caller_frame(rtl_allocate_heap as usize), CrtFlavor::None);
    // SAFETY: pass-through to the displaced original.
    let block = unsafe { real(heap, flags, size) };
    if !block.is_null() && detector.enabled() {
        guard.set(heap as usize, block as usize, 0, size);
    }
    block
}

/// See [`rtl_allocate_heap`].
///
/// # Safety
///
/// Reached only through a rewritten import slot.
pub unsafe extern "system" fn rtl_reallocate_heap(
    heap: *mut c_void,
    flags: u32,
    block: *mut c_void,
    size: usize,
) -> *mut c_void {
    let real: HeapReAllocFn =
        // SAFETY: resolved from ntdll at table construction.
        unsafe { mem::transmute(REAL_RTL_REALLOCATE_HEAP.load(Ordering::Acquire)) };

    let Some(detector) = Detector::global() else {
        // SAFETY: plain pass-through.
        return unsafe { real(heap, flags, block, size) };
    };

    let guard =
        detector.enter_capture(caller_frame(rtl_reallocate_heap as usize), CrtFlavor::None);
    // SAFETY: pass-through to the displaced original.
    let new_block = unsafe { real(heap, flags, block, size) };
    if !new_block.is_null() && detector.enabled() {
        guard.set(heap as usize, block as usize, new_block as usize, size);
    }
    new_block
}

/// See [`rtl_allocate_heap`].
///
/// # Safety
///
/// Reached only through a rewritten import slot.
pub unsafe extern "system" fn rtl_free_heap(
    heap: *mut c_void,
    flags: u32,
    block: *mut c_void,
) -> i32 {
    let real: HeapFreeFn =
        // SAFETY: resolved from ntdll at table construction.
        unsafe { mem::transmute(REAL_RTL_FREE_HEAP.load(Ordering::Acquire)) };
    // SAFETY: pass-through to the displaced original.
    let status = unsafe { real(heap, flags, block) };
    if status != 0 {
        if let Some(detector) = Detector::global() {
            detector.free_observed(
                heap as usize,
                block as usize,
                caller_frame(rtl_free_heap as usize),
            );
        }
    }
    status
}

const KERNEL32: &[u16] = &[
    b'k' as u16, b'e' as u16, b'r' as u16, b'n' as u16, b'e' as u16, b'l' as u16, b'3' as u16,
    b'2' as u16, b'.' as u16, b'd' as u16, b'l' as u16, b'l' as u16, 0,
];
const NTDLL: &[u16] = &[
    b'n' as u16, b't' as u16, b'd' as u16, b'l' as u16, b'l' as u16, b'.' as u16, b'd' as u16,
    b'l' as u16, b'l' as u16, 0,
];
const UCRTBASE: &[u16] = &[
    b'u' as u16, b'c' as u16, b'r' as u16, b't' as u16, b'b' as u16, b'a' as u16, b's' as u16,
    b'e' as u16, b'.' as u16, b'd' as u16, b'l' as u16, b'l' as u16, 0,
];

fn named(name: &'static str, replacement: usize) -> PatchEntry {
    PatchEntry {
        import: ImportName::Name(name),
        replacement,
        original: None,
    }
}

/// Builds the Windows patch table and resolves every displaced original up
/// front through the loader.
///
/// System DLLs are patched with leak reporting disabled — their internal
/// allocations are infrastructure, not application leaks; the Universal CRT
/// reports, so `malloc` leaks surface attributed to the caller.
#[must_use]
pub fn build_patch_table() -> PatchTable {
    REAL_HEAP_ALLOC.store(resolve(KERNEL32, "HeapAlloc"), Ordering::Release);
    REAL_HEAP_REALLOC.store(resolve(KERNEL32, "HeapReAlloc"), Ordering::Release);
    REAL_HEAP_FREE.store(resolve(KERNEL32, "HeapFree"), Ordering::Release);
    REAL_HEAP_CREATE.store(resolve(KERNEL32, "HeapCreate"), Ordering::Release);
    REAL_HEAP_DESTROY.store(resolve(KERNEL32, "HeapDestroy"), Ordering::Release);
    REAL_GET_PROC_ADDRESS.store(resolve(KERNEL32, "GetProcAddress"), Ordering::Release);
    REAL_RTL_ALLOCATE_HEAP.store(resolve(NTDLL, "RtlAllocateHeap"), Ordering::Release);
    REAL_RTL_REALLOCATE_HEAP.store(resolve(NTDLL, "RtlReAllocateHeap"), Ordering::Release);
    REAL_RTL_FREE_HEAP.store(resolve(NTDLL, "RtlFreeHeap"), Ordering::Release);
    REAL_MALLOC.store(resolve(UCRTBASE, "malloc"), Ordering::Release);
    REAL_CALLOC.store(resolve(UCRTBASE, "calloc"), Ordering::Release);
    REAL_REALLOC.store(resolve(UCRTBASE, "realloc"), Ordering::Release);
    REAL_FREE.store(resolve(UCRTBASE, "free"), Ordering::Release);

    let kernel_entries = || {
        vec![
            named("HeapAlloc", heap_alloc as usize),
            named("HeapReAlloc", heap_realloc as usize),
            named("HeapFree", heap_free as usize),
            named("HeapCreate", heap_create as usize),
            named("HeapDestroy", heap_destroy as usize),
            named("GetProcAddress", get_proc_address as usize),
        ]
    };

    PatchTable::new(vec![
        ModulePatch::new("kernel32.dll", false, kernel_entries()),
        ModulePatch::new("kernelbase.dll", false, kernel_entries()),
        ModulePatch::new(
            "ntdll.dll",
            false,
            vec![
                named("RtlAllocateHeap", rtl_allocate_heap as usize),
                named("RtlReAllocateHeap", rtl_reallocate_heap as usize),
                named("RtlFreeHeap", rtl_free_heap as usize),
            ],
        ),
        ModulePatch::new(
            "ucrtbase.dll",
            true,
            vec![
                named("malloc", ucrt_malloc as usize),
                named("calloc", ucrt_calloc as usize),
                named("realloc", ucrt_realloc as usize),
                named("free", ucrt_free as usize),
            ],
        ),
    ])
}
