use std::num::NonZeroUsize;

use crate::{BacktraceUnwinder, Error, HeapProfiler, Result, StackUnwinder};

/// The mean number of allocated bytes between two samples, unless configured otherwise.
pub const DEFAULT_SAMPLING_INTERVAL: usize = 128 * 1024;

/// Creates instances of [`HeapProfiler`].
///
/// All parameters are optional:
/// * `sampling_interval` - defaults to [`DEFAULT_SAMPLING_INTERVAL`]
/// * `suppress_randomness_for_test` - defaults to `false`
/// * `stack_unwinder` - defaults to [`BacktraceUnwinder`]
///
/// Use `HeapProfiler::builder()` to create a new instance of this builder.
///
/// # Example
///
/// ```
/// use heap_sampler::{HeapProfiler, NoopUnwinder};
///
/// let profiler = HeapProfiler::builder()
///     .sampling_interval(512 * 1024)
///     .stack_unwinder(NoopUnwinder::new())
///     .build();
///
/// assert_eq!(profiler.sampling_interval(), 512 * 1024);
/// ```
#[derive(Debug)]
#[must_use]
pub struct HeapProfilerBuilder {
    sampling_interval: usize,
    suppress_randomness: bool,
    unwinder: Option<Box<dyn StackUnwinder>>,
}

impl HeapProfilerBuilder {
    pub(crate) fn new() -> Self {
        Self {
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            suppress_randomness: false,
            unwinder: None,
        }
    }

    /// Sets the mean number of allocated bytes between two samples.
    ///
    /// Smaller intervals give more precise estimates at a higher cost. An interval of one
    /// byte samples every allocation.
    pub fn sampling_interval(self, bytes: usize) -> Self {
        Self {
            sampling_interval: bytes,
            ..self
        }
    }

    /// Makes sampling decisions deterministic, for use in tests.
    ///
    /// See [`HeapProfiler::suppress_randomness_for_test()`].
    pub fn suppress_randomness_for_test(self, suppress: bool) -> Self {
        Self {
            suppress_randomness: suppress,
            ..self
        }
    }

    /// Sets the unwinder used to capture the call stacks of samples.
    pub fn stack_unwinder(self, unwinder: impl StackUnwinder) -> Self {
        Self {
            unwinder: Some(Box::new(unwinder)),
            ..self
        }
    }

    /// Creates the profiler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroSamplingInterval`] if the sampling interval was set to zero.
    pub fn try_build(self) -> Result<HeapProfiler> {
        let sampling_interval =
            NonZeroUsize::new(self.sampling_interval).ok_or(Error::ZeroSamplingInterval)?;

        let unwinder = self
            .unwinder
            .unwrap_or_else(|| Box::new(BacktraceUnwinder::new()));

        Ok(HeapProfiler::from_parts(
            sampling_interval,
            self.suppress_randomness,
            unwinder,
        ))
    }

    /// Creates the profiler.
    ///
    /// # Panics
    ///
    /// Panics if the sampling interval was set to zero.
    #[must_use]
    pub fn build(self) -> HeapProfiler {
        self.try_build()
            .expect("the sampling interval of a heap profiler must be at least one byte")
    }
}
