//! Registry of per-thread capture states.

use std::sync::Arc;

use dashmap::DashMap;

use crate::capture::ThreadState;

/// Returns the OS identifier of the calling thread.
#[cfg(windows)]
pub(crate) fn current_thread_id() -> u32 {
    // SAFETY: no arguments, always succeeds.
    unsafe { windows_sys::Win32::System::Threading::GetCurrentThreadId() }
}

/// Returns a process-unique identifier for the calling thread.
#[cfg(not(windows))]
pub(crate) fn current_thread_id() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static ID: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

/// Map from thread id to that thread's capture state.
///
/// States are created lazily on a thread's first contact with the capture
/// protocol and live until detector teardown — a thread that ever entered the
/// hooks stays visible to the shutdown wait. The map itself is sharded
/// ([`DashMap`]); each state object is only ever mutated by its owning thread.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    states: DashMap<u32, Arc<ThreadState>>,
}

impl ThreadRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        ThreadRegistry::default()
    }

    /// Returns the calling thread's state, creating it on first use.
    pub fn current(&self) -> Arc<ThreadState> {
        let thread_id = current_thread_id();
        let entry = self
            .states
            .entry(thread_id)
            .or_insert_with(|| Arc::new(ThreadState::new(thread_id)));
        Arc::clone(entry.value())
    }

    /// Runs `visit` for every registered thread state.
    pub fn for_each(&self, mut visit: impl FnMut(&ThreadState)) {
        for entry in self.states.iter() {
            visit(entry.value());
        }
    }

    /// Whether any thread other than `except_thread` is currently inside the
    /// capture protocol.
    #[must_use]
    pub fn any_other_in_capture(&self, except_thread: u32) -> bool {
        self.states.iter().any(|entry| {
            entry.value().thread_id() != except_thread && entry.value().in_capture()
        })
    }

    /// Number of threads that have ever entered the capture protocol.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no thread has entered the capture protocol yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drops every registered state at teardown.
    pub fn clear(&self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_is_stable_per_thread() {
        let registry = ThreadRegistry::new();
        let a = registry.current();
        let b = registry.current();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_threads_get_distinct_states() {
        let registry = Arc::new(ThreadRegistry::new());
        let own = registry.current().thread_id();

        let other = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.current().thread_id())
                .join()
                .unwrap()
        };

        assert_ne!(own, other);
        assert_eq!(registry.len(), 2);
    }
}
