//! Per-thread protection against the profiler recording its own allocations.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{self, AtomicBool};

use tracing::debug;

thread_local! {
    // Set while this thread executes profiler bookkeeping (stack capture, table mutation,
    // observer notification, snapshot copies). Any allocation event that arrives while it is
    // set was caused by the profiler itself and must not be recorded, otherwise we would
    // recurse into the recording path and try to take a lock this thread already holds.
    //
    // The type has no destructor, so the slot stays usable while the thread is being torn
    // down and other thread-local destructors are still freeing memory.
    static ENTERED: Cell<bool> = const { Cell::new(false) };
}

static TLS_SLOT_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Prepares the thread-local state used by the profiler.
///
/// Must be called once, early during process initialization, before any allocation event is
/// delivered to a [`HeapProfiler`][crate::HeapProfiler]. Delivering events before this call is a
/// programming error that is diagnosed in debug builds.
///
/// Calling this function again has no effect.
///
/// # Examples
///
/// ```
/// fn main() {
///     heap_sampler::init_tls_slot();
///
///     // ... create the profiler and install allocator hooks ...
/// }
/// ```
pub fn init_tls_slot() {
    if TLS_SLOT_INITIALIZED.swap(true, atomic::Ordering::AcqRel) {
        return;
    }

    // Reading the marker once forces the lazily registered slot of the bootstrap thread into
    // existence before an allocator hook can observe it.
    let entered = ENTERED.get();
    debug!(entered, "heap sampler thread-local state initialized");
}

#[inline]
pub(crate) fn is_tls_slot_initialized() -> bool {
    TLS_SLOT_INITIALIZED.load(atomic::Ordering::Acquire)
}

/// Whether the current thread is already executing profiler bookkeeping.
#[inline]
pub(crate) fn is_entered() -> bool {
    ENTERED.get()
}

/// Marks the current thread as executing profiler bookkeeping until dropped.
///
/// The previous state of the marker is restored on drop, so scopes can nest and the marker is
/// cleared on every exit path, including unwinding.
#[derive(Debug)]
#[must_use = "the thread is only marked as entered while the scope is alive"]
pub(crate) struct ReentrancyScope {
    previous: bool,

    _single_threaded: PhantomData<*const ()>,
}

impl ReentrancyScope {
    #[inline]
    pub(crate) fn enter() -> Self {
        let previous = ENTERED.replace(true);

        Self {
            previous,
            _single_threaded: PhantomData,
        }
    }
}

impl Drop for ReentrancyScope {
    #[inline]
    fn drop(&mut self) {
        ENTERED.set(self.previous);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::panic;
    use std::thread;

    use static_assertions::assert_not_impl_any;

    use super::*;

    assert_not_impl_any!(ReentrancyScope: Send, Sync);

    #[test]
    fn scope_marks_thread_while_alive() {
        assert!(!is_entered());

        {
            let _scope = ReentrancyScope::enter();
            assert!(is_entered());
        }

        assert!(!is_entered());
    }

    #[test]
    fn nested_scope_restores_outer_state() {
        let outer = ReentrancyScope::enter();

        {
            let _inner = ReentrancyScope::enter();
            assert!(is_entered());
        }

        // The outer scope is still alive, so the marker must still be set.
        assert!(is_entered());

        drop(outer);
        assert!(!is_entered());
    }

    #[test]
    fn scope_is_cleared_on_unwind() {
        let result = panic::catch_unwind(|| {
            let _scope = ReentrancyScope::enter();
            panic!("simulated failure inside profiler bookkeeping");
        });

        assert!(result.is_err());
        assert!(!is_entered());
    }

    #[test]
    fn marker_is_not_visible_to_other_threads() {
        let _scope = ReentrancyScope::enter();

        let seen_elsewhere = thread::spawn(is_entered).join().unwrap();

        assert!(!seen_elsewhere);
        assert!(is_entered());
    }

    #[test]
    fn init_tls_slot_is_idempotent() {
        init_tls_slot();
        init_tls_slot();

        assert!(is_tls_slot_initialized());
        assert!(!is_entered());
    }
}
