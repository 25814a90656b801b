#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Statistical heap-sampling profiler.
//!
//! This package observes native allocation and deallocation events, decides which of them to
//! record by modelling allocation as a Poisson process over allocated bytes, captures the call
//! stack of every recorded event and exposes the live sample set both as a pull-based snapshot
//! and as a push-based stream of notifications.
//!
//! The core functionality includes:
//! - [`HeapProfiler`] - The profiler context that owns the sample table and makes sampling decisions
//! - [`SamplingAllocator`] - A Rust memory allocator wrapper that feeds events into a profiler
//! - [`ProfilingSession`] - Keeps recording enabled while alive and reads back its own samples
//! - [`SamplesObserver`] - Receives notifications as samples are added to and removed from the table
//! - [`StackUnwinder`] - Captures the return addresses attached to each sample
//!
//! # Simple usage
//!
//! ```
//! use std::alloc::System;
//! use std::sync::LazyLock;
//!
//! use heap_sampler::{HeapProfiler, SamplingAllocator};
//!
//! #[global_allocator]
//! static ALLOCATOR: SamplingAllocator<System> = SamplingAllocator::system();
//!
//! static PROFILER: LazyLock<HeapProfiler> = LazyLock::new(HeapProfiler::new);
//!
//! fn main() {
//!     heap_sampler::init_tls_slot();
//!
//!     let profiler: &'static HeapProfiler = &PROFILER;
//!     profiler
//!         .set_hooks_install_callback(ALLOCATOR.hooks_installer())
//!         .expect("no other installer has been registered");
//!
//!     let watermark = profiler.start();
//!
//!     let data = vec![0_u8; 4 * 1024 * 1024];
//!
//!     // Every sample carries a weight that undoes the sampling probability, so the
//!     // sum of weights estimates how many bytes are live right now.
//!     let estimate = profiler.estimated_live_bytes(watermark);
//!     assert!(estimate >= data.len());
//!
//!     profiler.stop();
//! }
//! ```
//!
//! # Sampling
//!
//! The profiler keeps a per-thread countdown of bytes until the next sample. Each allocation
//! decrements it and only the allocation that exhausts the countdown is recorded, after which
//! a new countdown is drawn from an exponential distribution whose mean is the configured
//! sampling interval. Unsampled allocations never take a lock.
//!
//! A recorded sample is weighted with the larger of its size and the sampling interval, which
//! makes the sum of weights over live samples an unbiased estimate of live heap bytes.
//!
//! # Reentrancy
//!
//! Recording a sample allocates (the sample table grows, stacks are captured). These nested
//! allocations are detected with a thread-local marker and are never recorded.
//!
//! # Miri compatibility
//!
//! Miri replaces the global allocator with its own logic, so you cannot execute code that uses
//! [`SamplingAllocator`] as the global allocator under Miri.

mod allocator;
mod builder;
mod constants;
mod error;
mod hooks;
mod interval;
mod observer;
mod profiler;
mod reentrancy;
mod sample;
mod session;
mod table;
mod unwinder;

pub use allocator::*;
pub use builder::*;
pub(crate) use constants::*;
pub use error::*;
pub use hooks::*;
pub use observer::*;
pub use profiler::*;
pub use reentrancy::init_tls_slot;
pub use sample::*;
pub use session::*;
pub use unwinder::*;
