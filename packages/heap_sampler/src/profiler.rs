//! The profiler context that ties sampling decisions, the sample table and observers together.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{self, AtomicUsize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::interval::IntervalGenerator;
use crate::observer::ObserverRegistry;
use crate::reentrancy::{self, ReentrancyScope};
use crate::table::SampleTable;
use crate::{
    ERR_TLS_SLOT_NOT_INITIALIZED, Error, HeapProfilerBuilder, HooksInstaller,
    ProfilingSession, Result, Sample, SamplesObserver, StackUnwinder,
};

/// Frames of the profiler itself between the allocator hook and the stack unwinder:
/// `record_alloc()` and `do_record_alloc()`. Neither may be inlined, or this count is wrong.
pub(crate) const PROFILER_OWN_FRAMES: usize = 2;

/// A statistical heap-sampling profiler.
///
/// The profiler receives every allocation and deallocation event of an instrumented allocator
/// through [`record_alloc()`][Self::record_alloc] and [`record_free()`][Self::record_free].
/// While recording is enabled, it selects allocations with a probability proportional to
/// their size, captures their call stacks and keeps them in a table of live samples until the
/// matching deallocation is observed.
///
/// The profiler is meant to be created once and live for the rest of the process, typically
/// in a `static`. The allocator hooks and any code that starts sessions or registers observers
/// share it by `&'static` reference.
///
/// # Sessions
///
/// [`start()`][Self::start] enables recording and returns a watermark: the ordinal of the last
/// sample recorded before the call. Passing the watermark to [`samples()`][Self::samples]
/// returns only samples recorded since. Sessions may overlap: recording stays enabled until
/// every `start()` has been matched by a [`stop()`][Self::stop].
///
/// # Examples
///
/// ```
/// use std::sync::LazyLock;
///
/// use heap_sampler::HeapProfiler;
///
/// static PROFILER: LazyLock<HeapProfiler> = LazyLock::new(|| {
///     HeapProfiler::builder()
///         .sampling_interval(1)
///         .suppress_randomness_for_test(true)
///         .build()
/// });
///
/// heap_sampler::init_tls_slot();
/// let profiler: &'static HeapProfiler = &PROFILER;
///
/// let watermark = profiler.start();
///
/// // Normally called by the instrumented allocator.
/// profiler.record_alloc(0x1000, 64, 0);
///
/// let samples = profiler.samples(watermark);
/// assert_eq!(samples.len(), 1);
/// assert_eq!(samples[0].size(), 64);
///
/// profiler.record_free(0x1000);
/// assert!(profiler.samples(watermark).is_empty());
///
/// profiler.stop();
/// ```
pub struct HeapProfiler {
    sampler: IntervalGenerator,

    /// Number of `start()` calls not yet matched by `stop()`. Recording is enabled if nonzero.
    ///
    /// Only modified under the state lock, so a sample recorded concurrently with `stop()`
    /// either completes before `stop()` returns or is discarded.
    running: AtomicUsize,

    unwinder: Box<dyn StackUnwinder>,

    state: Mutex<ProfilerState>,

    hooks: crate::hooks::HookLifecycle,
}

#[derive(Debug)]
struct ProfilerState {
    table: SampleTable,
    observers: ObserverRegistry,
}

impl HeapProfiler {
    /// Creates a profiler with the default configuration.
    ///
    /// See [`HeapProfilerBuilder`] for the defaults and for customizing them.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for a profiler with a custom configuration.
    pub fn builder() -> HeapProfilerBuilder {
        HeapProfilerBuilder::new()
    }

    pub(crate) fn from_parts(
        sampling_interval: NonZeroUsize,
        suppress_randomness: bool,
        unwinder: Box<dyn StackUnwinder>,
    ) -> Self {
        Self {
            sampler: IntervalGenerator::new(sampling_interval, suppress_randomness),
            running: AtomicUsize::new(0),
            unwinder,
            state: Mutex::new(ProfilerState {
                table: SampleTable::new(),
                observers: ObserverRegistry::default(),
            }),
            hooks: crate::hooks::HookLifecycle::default(),
        }
    }

    /// Locks the table and observer list.
    ///
    /// Observers are notified after the table update they are told about has completed, so a
    /// panic escaping an observer leaves the table consistent and a poisoned lock is safe to
    /// keep using.
    fn state(&self) -> MutexGuard<'_, ProfilerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records an allocation of `size` bytes at `address`, if the allocation is selected as a
    /// sample.
    ///
    /// Called by the instrumented allocator after every successful allocation. `skip_frames`
    /// is the number of allocator frames above this call to leave out of the captured stack.
    ///
    /// Allocations of zero bytes, null addresses, allocations observed while recording is
    /// disabled and allocations made by the profiler's own bookkeeping are ignored.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if a sample is recorded before [`init_tls_slot()`] was called.
    ///
    /// [`init_tls_slot()`]: crate::init_tls_slot
    #[inline(never)] // Counted in PROFILER_OWN_FRAMES.
    pub fn record_alloc(&self, address: usize, size: usize, skip_frames: usize) {
        if address == 0 || size == 0 {
            return;
        }

        if self.running.load(atomic::Ordering::Relaxed) == 0 {
            return;
        }

        if reentrancy::is_entered() {
            return;
        }

        let Some(total) = self.sampler.sample_weight(size) else {
            return;
        };

        // Dropped after the call returns, which also keeps this frame off the tail-call path
        // and therefore on the captured stack.
        let _scope = ReentrancyScope::enter();

        self.do_record_alloc(address, size, total, skip_frames);
    }

    #[cold]
    #[inline(never)]
    fn do_record_alloc(&self, address: usize, size: usize, total: usize, skip_frames: usize) {
        debug_assert!(
            reentrancy::is_tls_slot_initialized(),
            "{ERR_TLS_SLOT_NOT_INITIALIZED}"
        );
        debug_assert!(reentrancy::is_entered());

        // Captured before taking the lock, to keep the critical section short.
        let stack = self
            .unwinder
            .capture(skip_frames.saturating_add(PROFILER_OWN_FRAMES));

        let mut state = self.state();

        // Recording may have been disabled while we were capturing the stack.
        if self.running.load(atomic::Ordering::Relaxed) == 0 {
            return;
        }

        let ordinal = state.table.next_ordinal();

        if let Some(replaced) = state
            .table
            .insert(address, Sample::new(size, total, stack, ordinal))
        {
            // We missed the free of the previous allocation at this address.
            state.observers.notify_removed(replaced.ordinal());
        }

        state.observers.notify_added(ordinal, size, total);
    }

    /// Records the deallocation of the memory at `address`, removing its sample if the
    /// allocation was sampled.
    ///
    /// Called by the instrumented allocator before every deallocation. Deallocations of
    /// addresses that were never sampled are ignored. Samples are removed even while recording
    /// is disabled.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if called before [`init_tls_slot()`].
    ///
    /// [`init_tls_slot()`]: crate::init_tls_slot
    #[inline]
    pub fn record_free(&self, address: usize) {
        if address == 0 {
            return;
        }

        if reentrancy::is_entered() {
            return;
        }

        self.do_record_free(address);
    }

    fn do_record_free(&self, address: usize) {
        debug_assert!(
            reentrancy::is_tls_slot_initialized(),
            "{ERR_TLS_SLOT_NOT_INITIALIZED}"
        );

        let _scope = ReentrancyScope::enter();

        let mut state = self.state();

        if let Some(removed) = state.table.remove(address) {
            state.observers.notify_removed(removed.ordinal());
        }
    }

    /// Enables recording and returns a watermark for reading back the samples recorded from
    /// now on.
    ///
    /// The first call installs the allocator hooks if an installer has been registered via
    /// [`set_hooks_install_callback()`][Self::set_hooks_install_callback]. Calls made while the
    /// installer runs wait for it to return, so recording never begins before the allocator is
    /// wired up.
    ///
    /// Calls may overlap. Recording remains enabled until every call has been matched by a
    /// call to [`stop()`][Self::stop].
    #[must_use = "the watermark is needed to read back the samples of this session"]
    pub fn start(&'static self) -> u64 {
        let _scope = ReentrancyScope::enter();

        if self.hooks.profiler_started(self) {
            debug!("allocator hooks installed on first start");
        }

        let (watermark, sessions) = {
            let state = self.state();

            let previous = self.running.fetch_add(1, atomic::Ordering::Relaxed);
            (state.table.last_ordinal(), previous.saturating_add(1))
        };

        debug!(watermark, sessions, "heap sampling started");

        watermark
    }

    /// Disables recording once every [`start()`][Self::start] has been matched by a `stop()`.
    ///
    /// Samples recorded so far are kept and are removed only when their allocations are freed.
    /// Calling this without a matching `start()` has no effect.
    pub fn stop(&self) {
        let _scope = ReentrancyScope::enter();

        let result = {
            let _state = self.state();

            self.running.fetch_update(
                atomic::Ordering::Relaxed,
                atomic::Ordering::Relaxed,
                |sessions| sessions.checked_sub(1),
            )
        };

        match result {
            Ok(1) => debug!("heap sampling stopped"),
            Ok(previous) => debug!(
                sessions = previous.saturating_sub(1),
                "heap sampling session ended, other sessions remain active"
            ),
            Err(_) => warn!("heap sampling stop requested without a matching start, ignoring"),
        }
    }

    /// Whether recording is currently enabled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(atomic::Ordering::Relaxed) != 0
    }

    /// Starts a session that keeps recording enabled until the returned value is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::LazyLock;
    ///
    /// use heap_sampler::HeapProfiler;
    ///
    /// static PROFILER: LazyLock<HeapProfiler> = LazyLock::new(HeapProfiler::new);
    ///
    /// let profiler: &'static HeapProfiler = &PROFILER;
    ///
    /// {
    ///     let _session = profiler.session();
    ///     assert!(profiler.is_running());
    /// }
    ///
    /// assert!(!profiler.is_running());
    /// ```
    pub fn session(&'static self) -> ProfilingSession {
        ProfilingSession::new(self)
    }

    /// Returns a copy of every live sample recorded after `watermark`, ordered by ordinal.
    ///
    /// A watermark of 0 returns every live sample recorded since the profiler was created.
    #[must_use]
    pub fn samples(&self, watermark: u64) -> Vec<Sample> {
        let _scope = ReentrancyScope::enter();

        let state = self.state();
        state.table.snapshot(watermark)
    }

    /// Estimates the number of live heap bytes allocated after `watermark`.
    ///
    /// This is the sum of [`Sample::total()`] over the samples [`samples()`][Self::samples]
    /// would return, without copying them.
    #[must_use]
    pub fn estimated_live_bytes(&self, watermark: u64) -> usize {
        let _scope = ReentrancyScope::enter();

        let state = self.state();
        state.table.total_since(watermark)
    }

    /// Number of live samples in the table, regardless of when they were recorded.
    #[must_use]
    pub fn live_sample_count(&self) -> usize {
        let _scope = ReentrancyScope::enter();

        self.state().table.len()
    }

    /// The ordinal of the most recently recorded sample, or 0 if none has been recorded.
    #[must_use]
    pub fn last_ordinal(&self) -> u64 {
        let _scope = ReentrancyScope::enter();

        self.state().table.last_ordinal()
    }

    /// Registers an observer to be notified of every sample added to or removed from the
    /// table from now on.
    ///
    /// Samples recorded before the registration are not replayed. An observer registered
    /// multiple times is notified once per registration.
    ///
    /// See [`SamplesObserver`] for the constraints on what an observer may do.
    pub fn add_samples_observer(&self, observer: Arc<dyn SamplesObserver>) {
        let _scope = ReentrancyScope::enter();

        let mut state = self.state();
        state.observers.add(observer);
    }

    /// Unregisters an observer previously registered with
    /// [`add_samples_observer()`][Self::add_samples_observer].
    ///
    /// Once this returns, the observer receives no further notifications. Returns `false` if
    /// the observer was not registered.
    pub fn remove_samples_observer(&self, observer: &Arc<dyn SamplesObserver>) -> bool {
        let _scope = ReentrancyScope::enter();

        let mut state = self.state();
        state.observers.remove(observer)
    }

    /// Registers the installer that wires the instrumented allocator to this profiler.
    ///
    /// If the profiler has already been started, the installer is invoked before this returns.
    /// Otherwise it is invoked on the first [`start()`][Self::start].
    ///
    /// # Errors
    ///
    /// Returns [`Error::HooksInstallerAlreadySet`] if an installer has already been
    /// registered. The new installer is dropped without being invoked.
    pub fn set_hooks_install_callback(&'static self, installer: impl HooksInstaller) -> Result<()> {
        let _scope = ReentrancyScope::enter();

        if self.hooks.register(Box::new(installer), self)? {
            debug!("allocator hooks installed on registration");
        }

        Ok(())
    }

    /// Whether the registered installer has been invoked.
    #[must_use]
    pub fn hooks_installed(&self) -> bool {
        self.hooks.hooks_installed()
    }

    /// Sets the mean number of allocated bytes between two samples.
    ///
    /// Every thread draws a fresh countdown with the new mean on its next allocation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroSamplingInterval`] if `bytes` is zero. The interval is not changed.
    pub fn set_sampling_interval(&self, bytes: usize) -> Result<()> {
        let interval = NonZeroUsize::new(bytes).ok_or(Error::ZeroSamplingInterval)?;

        self.sampler.set_mean(interval);

        let _scope = ReentrancyScope::enter();
        debug!(sampling_interval = bytes, "heap sampling interval changed");

        Ok(())
    }

    /// The mean number of allocated bytes between two samples.
    #[must_use]
    pub fn sampling_interval(&self) -> usize {
        self.sampler.mean()
    }

    /// Makes sampling decisions deterministic, for use in tests.
    ///
    /// While suppressed, the distance between two samples is exactly the sampling interval.
    /// With an interval of one byte, every allocation is sampled with a weight equal to its
    /// size.
    pub fn suppress_randomness_for_test(&self, suppress: bool) {
        self.sampler.set_deterministic(suppress);

        let _scope = ReentrancyScope::enter();
        debug!(suppress, "heap sampling randomness suppression changed");
    }

    /// Whether sampling decisions are currently deterministic.
    #[must_use]
    pub fn is_randomness_suppressed(&self) -> bool {
        self.sampler.is_deterministic()
    }
}

impl Default for HeapProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HeapProfiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapProfiler")
            .field("sampler", &self.sampler)
            .field("running", &self.running)
            .field("unwinder", &self.unwinder)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
