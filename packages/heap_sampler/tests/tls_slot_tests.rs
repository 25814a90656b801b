//! Recording before the thread-local state has been prepared.
//!
//! Preparing the state is process-wide and cannot be undone, so this file must contain no
//! test that calls `heap_sampler::init_tls_slot()`. Each file in `tests/` runs as its own
//! process, which keeps the other test binaries from interfering.

#![cfg(debug_assertions)] // The check is only compiled into debug builds.

use std::sync::LazyLock;

use heap_sampler::{HeapProfiler, NoopUnwinder};

static PROFILER: LazyLock<HeapProfiler> = LazyLock::new(|| {
    HeapProfiler::builder()
        .sampling_interval(1)
        .suppress_randomness_for_test(true)
        .stack_unwinder(NoopUnwinder::new())
        .build()
});

#[test]
#[should_panic(expected = "init_tls_slot() must be called")]
fn recording_before_init_tls_slot_is_diagnosed() {
    let profiler: &'static HeapProfiler = &PROFILER;
    let _session = profiler.session();

    profiler.record_alloc(0x1000, 64, 0);
}
