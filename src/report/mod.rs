//! Leak report generation.
//!
//! Walks the ledger under its lock, filters blocks the C runtime still owns,
//! optionally folds duplicate leaks (identical size and call stack) into one
//! entry with a multiplicity count, and emits the formatted report through
//! the [`sink`]. Counting never aggregates; reporting leaves blocks
//! unreported so a later pass sees them again — only explicit checkpointing
//! ([`mark_reported`]) and the CRT-startup filter set the reported flag.
//!
//! Output ordering follows the ledger's address-ordered maps and is therefore
//! deterministic per run, which keeps reports diffable across CI runs.
//!
//! # Key Components
//!
//! - [`report_leaks`] / [`count_leaks`] - The report and count walks
//! - [`mark_reported`] - Checkpoint support
//! - [`resolve_stacks`] - Pre-resolution to amortize symbol lookup cost
//! - [`crt`] - CRT debug-header heuristics
//! - [`sink`] - Destination routing and report hooks

pub mod crt;
pub mod sink;

pub use sink::{HookId, LeakRecord, ReportSink};

use std::collections::HashSet;

use crate::{
    ledger::{HeapHandle, LedgerInner},
    options::Options,
    stack::StackProvider,
    utils::{hex_dump_lines, leak_hash},
};

/// Reads `len` bytes of live block memory starting at `address`.
///
/// Injected by the detector: the platform backend reads the block's real
/// memory, hosts and tests substitute their own view. Returning `None`
/// disables CRT-header detection and data dumps for that block.
pub type BlockReader = dyn Fn(usize, usize) -> Option<Vec<u8>> + Send + Sync;

/// Which blocks a report or count walk covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportScope {
    /// Every heap and thread.
    All,
    /// Only blocks on one heap.
    Heap(HeapHandle),
    /// Only blocks allocated by one thread.
    Thread(u32),
}

impl ReportScope {
    fn covers(&self, heap: HeapHandle, thread_id: u32) -> bool {
        match *self {
            ReportScope::All => true,
            ReportScope::Heap(scoped) => heap == scoped,
            ReportScope::Thread(scoped) => thread_id == scoped,
        }
    }
}

/// Everything a report walk needs besides the ledger itself.
pub(crate) struct ReportContext<'a> {
    pub options: Options,
    pub max_data_dump: usize,
    pub provider: &'a dyn StackProvider,
    pub sink: &'a mut ReportSink,
    pub read_block: &'a BlockReader,
}

/// Runs the CRT-header heuristic for one block and caches the flavor on its
/// record. Returns the header when the block is wrapped.
fn detect_crt_header(
    inner: &mut LedgerInner,
    reader: &BlockReader,
    heap: HeapHandle,
    address: usize,
) -> Option<crt::CrtHeaderInfo> {
    let info = inner.heaps.get_mut(&heap)?.blocks.get_mut(&address)?;
    let bytes = reader(address, info.size())?;
    let header = crt::detect(&bytes)?;
    if !info.crt_flavor().is_wrapped() {
        info.set_crt_flavor(header.flavor);
    }
    Some(header)
}

/// Resolves one block's stack through the provider, and applies the
/// CRT-startup filter: startup allocations are marked reported and excluded.
/// Returns (`excluded`, `unresolved frames`).
fn apply_startup_filter(
    inner: &mut LedgerInner,
    provider: &dyn StackProvider,
    options: Options,
    heap: HeapHandle,
    address: usize,
    include_internal: bool,
) -> (bool, usize) {
    if !options.contains(Options::SKIP_CRT_STARTUP_LEAKS) {
        return (false, 0);
    }
    let Some(info) = inner
        .heaps
        .get_mut(&heap)
        .and_then(|record| record.blocks.get_mut(&address))
    else {
        return (false, 0);
    };
    let Some(stack) = info.call_stack_mut() else {
        return (false, 0);
    };
    let unresolved = provider.resolve(stack, include_internal);
    if stack.is_crt_startup_alloc() {
        info.mark_reported();
        (true, unresolved)
    } else {
        (false, unresolved)
    }
}

fn block_keys(inner: &LedgerInner) -> Vec<(HeapHandle, usize)> {
    inner
        .heaps
        .iter()
        .flat_map(|(&heap, record)| record.blocks.keys().map(move |&address| (heap, address)))
        .collect()
}

/// Counts live leaks in `scope` without emitting anything. Duplicate
/// aggregation never applies to counts; runtime-owned and startup-filtered
/// blocks are excluded exactly as in a report walk.
pub(crate) fn count_leaks(
    inner: &mut LedgerInner,
    ctx: &mut ReportContext<'_>,
    scope: ReportScope,
) -> usize {
    let include_internal = ctx.options.contains(Options::TRACE_INTERNAL_FRAMES);
    let mut count = 0;

    for (heap, address) in block_keys(inner) {
        let Some(info) = inner
            .heaps
            .get(&heap)
            .and_then(|record| record.blocks.get(&address))
        else {
            continue;
        };
        if info.is_reported() || !scope.covers(heap, info.thread_id()) {
            continue;
        }

        if let Some(header) = detect_crt_header(inner, ctx.read_block, heap, address) {
            if header.block_use.is_runtime_owned() {
                continue;
            }
        }

        let (excluded, _) = apply_startup_filter(
            inner,
            ctx.provider,
            ctx.options,
            heap,
            address,
            include_internal,
        );
        if excluded {
            continue;
        }

        count += 1;
    }
    count
}

/// Folds every other not-yet-consumed block with identical size and call
/// stack into the leak at (`heap`, `address`). Returns how many duplicates
/// were consumed.
fn erase_duplicates(
    inner: &LedgerInner,
    keys: &[(HeapHandle, usize)],
    heap: HeapHandle,
    address: usize,
    aggregated: &mut HashSet<u64>,
) -> usize {
    let Some(element) = inner
        .heaps
        .get(&heap)
        .and_then(|record| record.blocks.get(&address))
    else {
        return 0;
    };
    let Some(element_stack) = element.call_stack() else {
        return 0;
    };

    let mut erased = 0;
    for &(other_heap, other_address) in keys {
        if other_heap == heap && other_address == address {
            continue;
        }
        let Some(other) = inner
            .heaps
            .get(&other_heap)
            .and_then(|record| record.blocks.get(&other_address))
        else {
            continue;
        };
        if other.is_reported() || aggregated.contains(&other.serial()) {
            continue;
        }
        let Some(other_stack) = other.call_stack() else {
            continue;
        };
        if other.size() == element.size() && other_stack == element_stack {
            aggregated.insert(other.serial());
            erased += 1;
        }
    }
    erased
}

/// Walks `scope` and emits every live leak through the sink. Returns the
/// number of leaked blocks found, counting aggregated duplicates.
pub(crate) fn report_leaks(
    inner: &mut LedgerInner,
    ctx: &mut ReportContext<'_>,
    scope: ReportScope,
) -> usize {
    let include_internal = ctx.options.contains(Options::TRACE_INTERNAL_FRAMES);
    let keys = block_keys(inner);
    let mut aggregated: HashSet<u64> = HashSet::new();
    let mut first_leak = true;
    let mut leaks_found = 0;

    for &(heap, address) in &keys {
        let Some(info) = inner
            .heaps
            .get(&heap)
            .and_then(|record| record.blocks.get(&address))
        else {
            continue;
        };
        if info.is_reported()
            || !scope.covers(heap, info.thread_id())
            || aggregated.contains(&info.serial())
        {
            continue;
        }

        // Where a CRT header wraps the block, the contained user data is what
        // the human cares about; strip the header from address and size.
        let mut report_address = address;
        let mut report_size = inner.heaps[&heap].blocks[&address].size();
        if let Some(header) = detect_crt_header(inner, ctx.read_block, heap, address) {
            if header.block_use.is_runtime_owned() {
                continue;
            }
            report_address = address + header.data_offset;
            report_size = header.data_size;
        }

        let (excluded, _) = apply_startup_filter(
            inner,
            ctx.provider,
            ctx.options,
            heap,
            address,
            include_internal,
        );
        if excluded {
            continue;
        }

        if first_leak {
            ctx.sink.line("WARNING: leakscope detected memory leaks!");
            first_leak = false;
        }

        let mut block_count = 1;
        if ctx.options.contains(Options::AGGREGATE_DUPLICATES) {
            block_count += erase_duplicates(inner, &keys, heap, address, &mut aggregated);
        }

        // Resolve before printing so the stack text is available.
        if let Some(info) = inner
            .heaps
            .get_mut(&heap)
            .and_then(|record| record.blocks.get_mut(&address))
        {
            if let Some(stack) = info.call_stack_mut() {
                ctx.provider.resolve(stack, include_internal);
            }
        }

        let info = &inner.heaps[&heap].blocks[&address];
        let hash = info
            .call_stack()
            .map(|stack| leak_hash(info.size(), stack.hash()))
            .unwrap_or_default();

        ctx.sink.line(&format!(
            "---------- Block {} at {report_address:#x}: {report_size} bytes ----------",
            info.serial()
        ));
        ctx.sink.line(&format!(
            "  Leak Hash: {hash:#010X}, Count: {block_count}, Total {} bytes",
            report_size * block_count
        ));
        if block_count == 1 {
            ctx.sink
                .line(&format!("  Call Stack (TID {}):", info.thread_id()));
        } else {
            ctx.sink.line("  Call Stack:");
        }
        if let Some(lines) = info.call_stack().and_then(|stack| stack.resolved_lines()) {
            for line in lines {
                ctx.sink.line(&format!("    {line}"));
            }
        }

        if ctx.max_data_dump != 0 {
            if let Some(data) = (ctx.read_block)(report_address, report_size) {
                ctx.sink.line("  Data:");
                for line in hex_dump_lines(&data, ctx.max_data_dump) {
                    ctx.sink.line(&line);
                }
            }
        }
        ctx.sink.line("");

        ctx.sink.leak(&LeakRecord {
            serial: info.serial(),
            address: report_address,
            size: report_size,
            leak_hash: hash,
            count: block_count,
            thread_id: info.thread_id(),
            call_stack: info.call_stack(),
        });

        leaks_found += block_count;
    }

    leaks_found
}

/// Marks every block in `scope` as reported (checkpoint support): a
/// subsequent report sees only allocations made after this call.
pub(crate) fn mark_reported(inner: &mut LedgerInner, scope: ReportScope) {
    for (&heap, record) in inner.heaps.iter_mut() {
        for info in record.blocks.values_mut() {
            if scope.covers(heap, info.thread_id()) {
                info.mark_reported();
            }
        }
    }
}

/// Resolves every live, unreported block's call stack, applying the
/// CRT-startup filter along the way. Returns the number of frames that could
/// not be resolved.
pub(crate) fn resolve_stacks(inner: &mut LedgerInner, ctx: &mut ReportContext<'_>) -> usize {
    let include_internal = ctx.options.contains(Options::TRACE_INTERNAL_FRAMES);
    let mut unresolved = 0;

    for (heap, address) in block_keys(inner) {
        let Some(info) = inner
            .heaps
            .get(&heap)
            .and_then(|record| record.blocks.get(&address))
        else {
            continue;
        };
        if info.is_reported() {
            continue;
        }

        if let Some(header) = detect_crt_header(inner, ctx.read_block, heap, address) {
            if header.block_use.is_runtime_owned() {
                continue;
            }
        }

        if ctx.options.contains(Options::SKIP_CRT_STARTUP_LEAKS) {
            let (_, missed) = apply_startup_filter(
                inner,
                ctx.provider,
                ctx.options,
                heap,
                address,
                include_internal,
            );
            unresolved += missed;
        } else if let Some(info) = inner
            .heaps
            .get_mut(&heap)
            .and_then(|record| record.blocks.get_mut(&address))
        {
            if let Some(stack) = info.call_stack_mut() {
                unresolved += ctx.provider.resolve(stack, include_internal);
            }
        }
    }
    unresolved
}
