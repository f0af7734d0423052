//! The concurrent allocation ledger: a two-level registry mapping heap
//! handles to block maps, with byte accounting maintained online.
//!
//! Every operation is serialized by a single lock covering the whole ledger.
//! That is a deliberate choice of correctness over throughput — heap
//! operations are already serialized by the OS heap in practice, and the
//! coarse lock keeps the accounting counters and both map levels consistent
//! at every quiescent point.
//!
//! # Key Components
//!
//! - [`Ledger`] - The synchronized heap → block registry and counters
//! - [`HeapRecord`] - One heap's block map
//! - [`BlockInfo`] - Per-allocation metadata, exclusively owned by its entry
//! - [`MapOutcome`] / [`UnmapOutcome`] - Diagnostic results the caller reports
//!
//! # Consistency semantics
//!
//! Address collisions on map (the heap reused an address whose free was never
//! observed) evict the stale entry; frees of untracked addresses are normal
//! for allocations made before attachment and are ignored; a duplicate heap
//! creation evicts the stale heap record wholesale. All three are diagnostics,
//! not correctness failures, and are surfaced through the returned outcome
//! values rather than panics.

mod block;

pub use block::{BlockInfo, CrtFlavor};

use std::collections::BTreeMap;

use parking_lot::{Mutex, MutexGuard};

use crate::stack::CallStack;

/// Opaque handle identifying an OS allocation arena.
pub type HeapHandle = usize;

/// One heap's block map, keyed by the current address of each live block.
#[derive(Debug, Default)]
pub struct HeapRecord {
    pub(crate) blocks: BTreeMap<usize, BlockInfo>,
}

impl HeapRecord {
    /// Number of live blocks tracked for this heap.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the heap currently tracks no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Sum of the sizes of all live blocks in this heap.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.blocks.values().map(BlockInfo::size).sum()
    }
}

/// Result of mapping a new allocation.
#[derive(Debug, PartialEq, Eq)]
pub enum MapOutcome {
    /// The block was inserted without incident; carries its serial number.
    Mapped(u64),
    /// An entry already existed at that address. The stale entry was replaced;
    /// the caller should report the discrepancy.
    Replaced {
        /// Serial of the newly inserted block.
        serial: u64,
        /// Size of the stale entry that was evicted.
        stale_size: usize,
    },
}

impl MapOutcome {
    /// Serial number of the block that now occupies the address.
    #[must_use]
    pub fn serial(&self) -> u64 {
        match *self {
            MapOutcome::Mapped(serial) | MapOutcome::Replaced { serial, .. } => serial,
        }
    }
}

/// Result of unmapping a freed allocation.
#[derive(Debug, PartialEq, Eq)]
pub enum UnmapOutcome {
    /// The block was tracked and has been removed.
    Removed {
        /// Size the removed block contributed to the live counter.
        size: usize,
    },
    /// The address was not tracked on that heap. Normal for allocations made
    /// before attachment; may also indicate a cross-heap free.
    Untracked,
}

/// Result of registering a heap.
#[derive(Debug, PartialEq, Eq)]
pub enum HeapMapOutcome {
    /// A fresh record was created.
    Created,
    /// The handle collided with an existing record (the previous heap was
    /// destroyed without notification); the stale record and its blocks were
    /// evicted first.
    Evicted {
        /// Number of live blocks discarded with the stale record.
        discarded_blocks: usize,
    },
}

/// Summary of a tracked block, cloned out of the ledger for diagnostics.
#[derive(Debug, Clone)]
pub struct BlockSummary {
    /// Heap the block is tracked under.
    pub heap: HeapHandle,
    /// Serial number of the allocation.
    pub serial: u64,
    /// Byte size of the allocation.
    pub size: usize,
    /// Thread that performed the allocation.
    pub thread_id: u32,
    /// The allocation call stack, if one was attached.
    pub call_stack: Option<CallStack>,
}

#[derive(Debug, Default)]
pub(crate) struct LedgerInner {
    pub(crate) heaps: BTreeMap<HeapHandle, HeapRecord>,
    next_serial: u64,
    total: usize,
    current: usize,
    peak: usize,
}

impl LedgerInner {
    fn account_alloc(&mut self, size: usize) {
        self.total = self.total.saturating_add(size);
        self.current = self.current.saturating_add(size);
        if self.current > self.peak {
            self.peak = self.current;
        }
    }

    fn account_free(&mut self, size: usize) {
        self.current = self.current.saturating_sub(size);
    }

    fn insert_block(
        &mut self,
        heap: HeapHandle,
        address: usize,
        size: usize,
        thread_id: u32,
        crt: CrtFlavor,
    ) -> MapOutcome {
        self.next_serial += 1;
        let serial = self.next_serial;
        let info = BlockInfo::new(thread_id, serial, size, crt);
        self.account_alloc(size);

        let record = self.heaps.entry(heap).or_default();
        match record.blocks.insert(address, info) {
            None => MapOutcome::Mapped(serial),
            Some(stale) => {
                // The heap reused an address whose free we never observed
                // (an untracked allocator released it). The stale entry no
                // longer describes live memory.
                self.current = self.current.saturating_sub(stale.size());
                MapOutcome::Replaced {
                    serial,
                    stale_size: stale.size(),
                }
            }
        }
    }
}

/// The synchronized heap → block registry.
///
/// # Examples
///
/// ```rust
/// use leakscope::{CrtFlavor, Ledger, MapOutcome};
///
/// let ledger = Ledger::new();
/// ledger.map_heap(0x10);
/// let outcome = ledger.map_block(0x10, 0x1000, 64, 1, CrtFlavor::None);
/// assert!(matches!(outcome, MapOutcome::Mapped(_)));
/// assert_eq!(ledger.current_bytes(), 64);
/// ```
#[derive(Debug, Default)]
pub struct Ledger {
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Ledger::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock()
    }

    /// Registers a heap. A colliding handle evicts the stale record first.
    pub fn map_heap(&self, heap: HeapHandle) -> HeapMapOutcome {
        let mut inner = self.lock();
        if let Some(stale) = inner.heaps.remove(&heap) {
            let discarded_blocks = stale.len();
            for info in stale.blocks.values() {
                inner.account_free(info.size());
            }
            inner.heaps.insert(heap, HeapRecord::default());
            HeapMapOutcome::Evicted { discarded_blocks }
        } else {
            inner.heaps.insert(heap, HeapRecord::default());
            HeapMapOutcome::Created
        }
    }

    /// Records a new allocation on `heap`. The heap record is created on first
    /// use if its creation was never observed.
    pub fn map_block(
        &self,
        heap: HeapHandle,
        address: usize,
        size: usize,
        thread_id: u32,
        crt: CrtFlavor,
    ) -> MapOutcome {
        self.lock().insert_block(heap, address, size, thread_id, crt)
    }

    /// Removes the block at `address` on `heap`. A miss is silently tolerated;
    /// callers enable cross-heap validation via [`Ledger::find_block`].
    pub fn unmap_block(&self, heap: HeapHandle, address: usize) -> UnmapOutcome {
        let mut inner = self.lock();
        let Some(record) = inner.heaps.get_mut(&heap) else {
            return UnmapOutcome::Untracked;
        };
        match record.blocks.remove(&address) {
            Some(info) => {
                let size = info.size();
                inner.account_free(size);
                UnmapOutcome::Removed { size }
            }
            None => UnmapOutcome::Untracked,
        }
    }

    /// Removes a heap and every block it owns.
    pub fn unmap_heap(&self, heap: HeapHandle) {
        let mut inner = self.lock();
        if let Some(record) = inner.heaps.remove(&heap) {
            for info in record.blocks.values() {
                inner.account_free(info.size());
            }
        }
    }

    /// Tracks a reallocation.
    ///
    /// An address change is equivalent to unmap-then-map (a fresh serial is
    /// assigned). An in-place reallocation keeps the existing entry's serial,
    /// updates its size and discards its previous call stack so the
    /// reallocation's own stack replaces it.
    pub fn remap_block(
        &self,
        heap: HeapHandle,
        old_address: usize,
        new_address: usize,
        size: usize,
        thread_id: u32,
        crt: CrtFlavor,
    ) -> MapOutcome {
        let mut inner = self.lock();

        if new_address != old_address {
            if let Some(record) = inner.heaps.get_mut(&heap) {
                if let Some(old) = record.blocks.remove(&old_address) {
                    inner.account_free(old.size());
                }
            }
            return inner.insert_block(heap, new_address, size, thread_id, crt);
        }

        let updated = inner
            .heaps
            .get_mut(&heap)
            .and_then(|record| record.blocks.get_mut(&old_address))
            .map(|info| {
                let old_size = info.size();
                info.update_in_place(size, thread_id);
                info.set_crt_flavor(crt);
                (old_size, info.serial())
            });

        match updated {
            Some((old_size, serial)) => {
                inner.total = inner.total.saturating_sub(old_size).saturating_add(size);
                inner.current = inner.current.saturating_sub(old_size).saturating_add(size);
                if inner.current > inner.peak {
                    inner.peak = inner.current;
                }
                MapOutcome::Mapped(serial)
            }
            // Never saw the original allocation; treat as brand new.
            None => inner.insert_block(heap, new_address, size, thread_id, crt),
        }
    }

    /// Attaches a captured call stack to the block at `address`. A no-op if the
    /// block has vanished in the meantime (freed by another thread).
    pub fn attach_stack(&self, heap: HeapHandle, address: usize, stack: CallStack) {
        let mut inner = self.lock();
        if let Some(info) = inner
            .heaps
            .get_mut(&heap)
            .and_then(|record| record.blocks.get_mut(&address))
        {
            info.set_call_stack(stack);
        }
    }

    /// Scans every heap for a block at `address`. This is the O(total blocks)
    /// cross-heap validation walk; it runs under the ledger lock and is only
    /// worth its cost as a corruption diagnostic.
    #[must_use]
    pub fn find_block(&self, address: usize) -> Option<BlockSummary> {
        let inner = self.lock();
        for (&heap, record) in &inner.heaps {
            if let Some(info) = record.blocks.get(&address) {
                return Some(BlockSummary {
                    heap,
                    serial: info.serial(),
                    size: info.size(),
                    thread_id: info.thread_id(),
                    call_stack: info.call_stack().cloned(),
                });
            }
        }
        None
    }

    /// Total bytes ever allocated (saturating).
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.lock().total
    }

    /// Bytes currently live across all heaps.
    #[must_use]
    pub fn current_bytes(&self) -> usize {
        self.lock().current
    }

    /// Peak of the live-bytes counter.
    #[must_use]
    pub fn peak_bytes(&self) -> usize {
        self.lock().peak
    }

    /// Number of heaps currently tracked.
    #[must_use]
    pub fn heap_count(&self) -> usize {
        self.lock().heaps.len()
    }

    /// Number of live blocks across all heaps.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.lock().heaps.values().map(HeapRecord::len).sum()
    }

    /// Sum of live block sizes across all heaps. Equals
    /// [`Ledger::current_bytes`] at every quiescent point.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.lock().heaps.values().map(HeapRecord::live_bytes).sum()
    }

    /// Drops every heap record and block. Counters keep their final values for
    /// the teardown summary.
    pub fn clear(&self) {
        self.lock().heaps.clear();
    }
}
