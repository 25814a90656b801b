//! Scoped recording sessions.

use crate::{HeapProfiler, Sample};

/// Keeps recording enabled on a [`HeapProfiler`] from creation until drop.
///
/// The session remembers the watermark returned when it started, so it can read back exactly
/// the live samples recorded since. Other sessions on the same profiler may overlap with this
/// one; each sees the samples recorded since its own start.
///
/// # Examples
///
/// ```
/// use std::sync::LazyLock;
///
/// use heap_sampler::{HeapProfiler, NoopUnwinder};
///
/// static PROFILER: LazyLock<HeapProfiler> = LazyLock::new(|| {
///     HeapProfiler::builder()
///         .sampling_interval(1)
///         .suppress_randomness_for_test(true)
///         .stack_unwinder(NoopUnwinder::new())
///         .build()
/// });
///
/// heap_sampler::init_tls_slot();
/// let profiler: &'static HeapProfiler = &PROFILER;
///
/// let session = profiler.session();
///
/// // Normally called by the instrumented allocator.
/// profiler.record_alloc(0x1000, 256, 0);
///
/// assert_eq!(session.samples().len(), 1);
/// assert_eq!(session.estimated_live_bytes(), 256);
/// ```
#[derive(Debug)]
#[must_use = "recording is only enabled while the session is alive"]
pub struct ProfilingSession {
    profiler: &'static HeapProfiler,
    watermark: u64,
}

impl ProfilingSession {
    pub(crate) fn new(profiler: &'static HeapProfiler) -> Self {
        let watermark = profiler.start();

        Self {
            profiler,
            watermark,
        }
    }

    /// The ordinal of the last sample recorded before this session started.
    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Returns a copy of every live sample recorded since this session started.
    #[must_use]
    pub fn samples(&self) -> Vec<Sample> {
        self.profiler.samples(self.watermark)
    }

    /// Estimates the number of live heap bytes allocated since this session started.
    #[must_use]
    pub fn estimated_live_bytes(&self) -> usize {
        self.profiler.estimated_live_bytes(self.watermark)
    }
}

impl Drop for ProfilingSession {
    fn drop(&mut self) {
        self.profiler.stop();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::NoopUnwinder;

    assert_impl_all!(ProfilingSession: Send, Sync);

    fn profiler() -> &'static HeapProfiler {
        crate::init_tls_slot();

        Box::leak(Box::new(
            HeapProfiler::builder()
                .sampling_interval(1)
                .suppress_randomness_for_test(true)
                .stack_unwinder(NoopUnwinder::new())
                .build(),
        ))
    }

    #[test]
    fn recording_is_enabled_while_session_is_alive() {
        let profiler = profiler();

        let session = profiler.session();
        assert!(profiler.is_running());

        drop(session);
        assert!(!profiler.is_running());
    }

    #[test]
    fn session_sees_only_its_own_samples() {
        let profiler = profiler();

        let outer = profiler.session();
        profiler.record_alloc(0x1000, 10, 0);

        let inner = profiler.session();
        profiler.record_alloc(0x2000, 20, 0);

        assert_eq!(outer.watermark(), 0);
        assert_eq!(inner.watermark(), 1);

        assert_eq!(outer.samples().len(), 2);
        assert_eq!(outer.estimated_live_bytes(), 30);

        let inner_samples = inner.samples();
        assert_eq!(inner_samples.len(), 1);
        assert_eq!(inner_samples[0].size(), 20);
        assert_eq!(inner.estimated_live_bytes(), 20);

        drop(inner);
        assert!(profiler.is_running());

        drop(outer);
        assert!(!profiler.is_running());
    }
}
