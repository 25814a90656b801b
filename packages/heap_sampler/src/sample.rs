use std::fmt;

/// An opaque code address captured from the call stack of a sampled allocation.
///
/// Addresses are not symbolized by this package. Resolve them with an external symbolizer
/// if human-readable frames are needed.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ReturnAddress(usize);

impl ReturnAddress {
    /// Wraps a raw code address.
    #[must_use]
    #[inline]
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    /// The raw code address.
    #[must_use]
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl From<usize> for ReturnAddress {
    #[inline]
    fn from(address: usize) -> Self {
        Self(address)
    }
}

impl fmt::Display for ReturnAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One recorded allocation event.
///
/// Samples are value copies taken from the live sample table by
/// [`HeapProfiler::samples()`][crate::HeapProfiler::samples]. Holding one does not keep the
/// underlying allocation or table entry alive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Sample {
    size: usize,
    total: usize,
    stack: Vec<ReturnAddress>,
    ordinal: u64,
}

impl Sample {
    pub(crate) fn new(size: usize, total: usize, stack: Vec<ReturnAddress>, ordinal: u64) -> Self {
        debug_assert!(total >= size, "sample weight {total} is below its size {size}");

        Self {
            size,
            total,
            stack,
            ordinal,
        }
    }

    /// Bytes requested by the sampled allocation.
    #[must_use]
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes this sample stands for once the sampling probability is undone.
    ///
    /// Summing this value over all live samples estimates the number of live heap bytes.
    /// Always at least [`size()`][Self::size].
    #[must_use]
    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Return addresses of the allocating call stack, outermost frame first.
    ///
    /// May be empty or truncated if the stack could not be fully captured.
    #[must_use]
    #[inline]
    pub fn stack(&self) -> &[ReturnAddress] {
        &self.stack
    }

    /// Identifier assigned when the sample was recorded.
    ///
    /// Ordinals increase monotonically over the lifetime of the profiler and are never reused.
    /// Compare them against a watermark returned by
    /// [`HeapProfiler::start()`][crate::HeapProfiler::start] to tell whether a sample was
    /// recorded during a particular session.
    #[must_use]
    #[inline]
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }
}
