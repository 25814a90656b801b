//! Samples the heap allocations of a small workload and prints where the memory went.
//!
//! Run with: `cargo run --example heap_sampler_basic`

use std::collections::HashMap;
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use heap_sampler::{HeapProfiler, SamplesObserver, SamplingAllocator};

#[global_allocator]
static ALLOCATOR: SamplingAllocator<std::alloc::System> = SamplingAllocator::system();

static PROFILER: LazyLock<HeapProfiler> = LazyLock::new(|| {
    HeapProfiler::builder()
        .sampling_interval(16 * 1024)
        .build()
});

/// Counts samples as they come and go.
#[derive(Debug, Default)]
struct SampleCounter {
    added: AtomicU64,
    removed: AtomicU64,
}

impl SamplesObserver for SampleCounter {
    fn sample_added(&self, _ordinal: u64, _size: usize, _total: usize) {
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    fn sample_removed(&self, _ordinal: u64) {
        self.removed.fetch_add(1, Ordering::Relaxed);
    }
}

fn main() {
    heap_sampler::init_tls_slot();

    let profiler: &'static HeapProfiler = &PROFILER;
    profiler
        .set_hooks_install_callback(ALLOCATOR.hooks_installer())
        .expect("no other installer is registered in this example");

    let counter = Arc::new(SampleCounter::default());
    profiler.add_samples_observer(counter.clone());

    let session = profiler.session();

    let mut index: HashMap<String, Vec<u64>> = HashMap::new();
    for i in 0..50_000_u64 {
        index.entry(format!("key-{}", i % 1_000)).or_default().push(i);
    }

    let scratch: Vec<String> = (0..1_000).map(|i| format!("temporary {i}")).collect();
    drop(black_box(scratch));

    let samples = session.samples();

    println!("=== Heap Sampling Example ===\n");
    println!("Sampling interval: {} bytes", profiler.sampling_interval());
    println!("Live samples: {}", samples.len());
    println!(
        "Estimated live heap since start: {} bytes",
        session.estimated_live_bytes()
    );
    println!(
        "Samples added: {}, removed: {}",
        counter.added.load(Ordering::Relaxed),
        counter.removed.load(Ordering::Relaxed)
    );

    if let Some(largest) = samples.iter().max_by_key(|s| s.total()) {
        println!(
            "\nLargest sample: {} bytes allocated (represents {} bytes), {} frames:",
            largest.size(),
            largest.total(),
            largest.stack().len()
        );

        for frame in largest.stack().iter().rev().take(8) {
            println!("  {frame}");
        }
    }

    black_box(index);
    drop(session);
}
