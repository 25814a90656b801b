use thiserror::Error;

/// Errors that can occur when configuring a [`HeapProfiler`][crate::HeapProfiler].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller attempted to configure a mean sampling interval of zero bytes.
    ///
    /// The smallest meaningful interval is one byte, which samples every allocation.
    #[error("the mean sampling interval must be at least one byte")]
    ZeroSamplingInterval,

    /// An allocator hooks installer has already been registered with the profiler.
    ///
    /// Hooks are installed at most once per profiler. The installer registered first
    /// remains in effect and the rejected one is dropped without being invoked.
    #[error("an allocator hooks installer has already been registered")]
    HooksInstallerAlreadySet,
}

/// A specialized `Result` type for profiler configuration, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
