//! Allocator wrapper that reports allocation events to a heap profiler.

use std::alloc::{GlobalAlloc, Layout};
use std::fmt;
use std::ptr;
use std::sync::atomic::{self, AtomicPtr};

use crate::{HeapProfiler, HooksInstaller};

/// Frames of the allocator wrapper between the user's allocating code and the profiler.
///
/// The methods that record allocations are never inlined, so this is exactly one frame. The
/// `__rust_alloc` shims and the standard library frames above them are left in the stack.
const ALLOCATOR_OWN_FRAMES: usize = 1;

/// A memory allocator that reports allocations and deallocations to a [`HeapProfiler`].
///
/// This allocator wraps any [`GlobalAlloc`] implementation. Until it is attached to a
/// profiler it only forwards calls to the wrapped allocator. Attaching normally happens in
/// the profiler's hooks installer, see [`hooks_installer()`][Self::hooks_installer].
///
/// # Examples
///
/// ```rust
/// use std::alloc::System;
/// use std::sync::LazyLock;
///
/// use heap_sampler::{HeapProfiler, SamplingAllocator};
///
/// #[global_allocator]
/// static ALLOCATOR: SamplingAllocator<System> = SamplingAllocator::system();
///
/// static PROFILER: LazyLock<HeapProfiler> = LazyLock::new(HeapProfiler::new);
///
/// heap_sampler::init_tls_slot();
///
/// let profiler: &'static HeapProfiler = &PROFILER;
/// profiler
///     .set_hooks_install_callback(ALLOCATOR.hooks_installer())
///     .unwrap();
///
/// // The first start attaches the allocator to the profiler.
/// let _session = profiler.session();
/// assert!(ALLOCATOR.is_attached());
/// ```
pub struct SamplingAllocator<A: GlobalAlloc> {
    inner: A,

    /// Null until attached. Once set, points to a profiler that lives for the rest of the
    /// process.
    profiler: AtomicPtr<HeapProfiler>,
}

impl<A: GlobalAlloc> fmt::Debug for SamplingAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingAllocator")
            .field("inner", &"<allocator>")
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl SamplingAllocator<std::alloc::System> {
    /// Creates a new sampling allocator using the system's default allocator.
    ///
    /// This is a convenience method for the common case of wanting to profile
    /// allocations without changing the underlying allocation strategy.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self::new(std::alloc::System)
    }
}

impl<A: GlobalAlloc> SamplingAllocator<A> {
    /// Creates a new sampling allocator that wraps the provided allocator.
    ///
    /// The resulting allocator has the same behavior as the underlying allocator. Allocation
    /// events are reported once the allocator is attached to a profiler.
    #[must_use]
    #[inline]
    pub const fn new(allocator: A) -> Self {
        Self {
            inner: allocator,
            profiler: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Starts reporting allocation events to `profiler`.
    ///
    /// If the allocator was already attached to a profiler, it is redirected to the new one.
    pub fn attach(&self, profiler: &'static HeapProfiler) {
        self.profiler.store(
            ptr::from_ref(profiler).cast_mut(),
            atomic::Ordering::Release,
        );
    }

    /// Whether the allocator reports allocation events to a profiler.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        !self.profiler.load(atomic::Ordering::Acquire).is_null()
    }

    #[inline]
    fn profiler(&self) -> Option<&'static HeapProfiler> {
        let profiler = self.profiler.load(atomic::Ordering::Acquire);

        // SAFETY: The pointer is either null or was created from a `&'static HeapProfiler`
        // in `attach()`, so it is valid for reads for the rest of the process.
        unsafe { profiler.as_ref() }
    }
}

impl<A: GlobalAlloc + Sync + 'static> SamplingAllocator<A> {
    /// Returns an installer that attaches this allocator to the profiler it is registered
    /// with.
    ///
    /// Pass the result to [`HeapProfiler::set_hooks_install_callback()`].
    pub fn hooks_installer(&'static self) -> impl HooksInstaller {
        move |profiler: &'static HeapProfiler| self.attach(profiler)
    }
}

// SAFETY: We delegate all allocation operations to the underlying allocator,
// which already implements GlobalAlloc safely, while adding event reporting.
unsafe impl<A: GlobalAlloc> GlobalAlloc for SamplingAllocator<A> {
    #[inline(never)]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let ptr = unsafe { self.inner.alloc(layout) };

        if let Some(profiler) = self.profiler() {
            profiler.record_alloc(ptr.addr(), layout.size(), ALLOCATOR_OWN_FRAMES);
        }

        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // The sample must be gone before the memory can be handed out again,
        // otherwise we could remove the sample of the next allocation at this address.
        if let Some(profiler) = self.profiler() {
            profiler.record_free(ptr.addr());
        }

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    #[inline(never)]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };

        if let Some(profiler) = self.profiler() {
            profiler.record_alloc(ptr.addr(), layout.size(), ALLOCATOR_OWN_FRAMES);
        }

        ptr
    }

    #[inline(never)]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let profiler = self.profiler();

        if let Some(profiler) = profiler {
            profiler.record_free(ptr.addr());
        }

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };

        // On failure the old block stays allocated but is no longer sampled. We accept this
        // loss of fidelity rather than re-sampling it with a stack that does not belong to it.
        if let Some(profiler) = profiler {
            profiler.record_alloc(new_ptr.addr(), new_size, ALLOCATOR_OWN_FRAMES);
        }

        new_ptr
    }
}
