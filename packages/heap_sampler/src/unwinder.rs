use std::fmt::Debug;
use std::hint::black_box;
use std::ptr;

use crate::ReturnAddress;

/// Upper limit on the number of frames captured for one sample.
const MAX_STACK_DEPTH: usize = 256;

/// How deep into the stack we look for the frame of [`BacktraceUnwinder::capture()`] before
/// giving up. Only the frames of the `backtrace` crate itself are inside it.
const MAX_UNWINDER_FRAMES: usize = 32;

/// Captures the return addresses of the current call stack for a sampled allocation.
///
/// The profiler calls this while the current thread is marked as executing profiler
/// bookkeeping, so implementations may allocate freely: such allocations are not sampled.
/// Implementations must not call back into the profiler's snapshot or observer APIs.
///
/// Capture is best-effort. Returning a truncated or empty stack is acceptable and yields a
/// sample with a shorter stack; it never prevents the sample from being recorded.
#[cfg_attr(test, mockall::automock)]
pub trait StackUnwinder: Debug + Send + Sync + 'static {
    /// Returns the addresses of the current call stack, outermost frame first.
    ///
    /// The frames of the unwinder itself are never included. Of the remaining frames, the
    /// innermost `skip_frames` (the profiler and the allocator hook that called it) are left
    /// out as well, so the innermost returned frame belongs to the code that allocated.
    fn capture(&self, skip_frames: usize) -> Vec<ReturnAddress>;
}

/// Captures stacks with the `backtrace` crate.
///
/// This is the unwinder used by a [`HeapProfiler`][crate::HeapProfiler] unless configured
/// otherwise. At most 256 frames are captured. If the unwinder cannot tell where its own frames
/// end on the current platform, it captures an empty stack.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct BacktraceUnwinder;

impl BacktraceUnwinder {
    /// Creates a new unwinder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl StackUnwinder for BacktraceUnwinder {
    #[inline(never)]
    fn capture(&self, skip_frames: usize) -> Vec<ReturnAddress> {
        // Every frame called from here has its canonical frame address at or below this local,
        // while our own frame has its canonical frame address above it.
        let marker = 0_u8;
        let marker_address = ptr::from_ref(black_box(&marker)).addr();
        let own_address = (<Self as StackUnwinder>::capture as *const ()).addr();

        let mut own_frame_seen = false;
        let mut frames_searched: usize = 0;
        let mut skip = skip_frames;
        let mut frames = Vec::new();

        backtrace::trace(|frame| {
            // The innermost frames belong to the `backtrace` crate, followed by this function.
            // Everything up to and including our own frame is left out.
            if !own_frame_seen {
                // Symbol addresses are approximate on some platforms (macOS reports the
                // instruction pointer instead), while on Windows `sp()` is the lowest address
                // of a frame rather than its canonical frame address. Either test suffices.
                own_frame_seen = frame.symbol_address().addr() == own_address
                    || (cfg!(not(windows)) && frame.sp().addr() > marker_address);

                frames_searched = frames_searched.wrapping_add(1);
                return own_frame_seen || frames_searched < MAX_UNWINDER_FRAMES;
            }

            if skip > 0 {
                skip = skip.wrapping_sub(1);
                return true;
            }

            frames.push(ReturnAddress::new(frame.ip().addr()));
            frames.len() < MAX_STACK_DEPTH
        });

        // We could not tell where our own frames end, so we record nothing rather than a stack
        // that starts inside the profiler.
        if !own_frame_seen {
            return Vec::new();
        }

        // The unwinder walks from the innermost frame outwards.
        frames.reverse();
        frames
    }
}

/// Captures nothing, recording every sample with an empty stack.
///
/// Useful when only the size distribution of live memory is of interest, as it removes the
/// cost of unwinding from the sampled path.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct NoopUnwinder;

impl NoopUnwinder {
    /// Creates a new unwinder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl StackUnwinder for NoopUnwinder {
    #[cfg_attr(test, mutants::skip)] // Returning an empty Vec is the entire behavior.
    fn capture(&self, _skip_frames: usize) -> Vec<ReturnAddress> {
        Vec::new()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(BacktraceUnwinder: Send, Sync, Debug);
    assert_impl_all!(NoopUnwinder: Send, Sync, Debug);

    #[inline(never)]
    fn capture_from_nested_call(
        unwinder: &BacktraceUnwinder,
        skip_frames: usize,
    ) -> Vec<ReturnAddress> {
        // black_box keeps the call from becoming a tail call, which would remove this frame.
        black_box(unwinder.capture(skip_frames))
    }

    #[inline(never)]
    fn capture_through_wrapper(
        unwinder: &BacktraceUnwinder,
        skip_frames: usize,
    ) -> Vec<ReturnAddress> {
        black_box(capture_from_nested_call(unwinder, skip_frames))
    }

    /// Start address of the function containing `address`, if it can be resolved.
    fn enclosing_function(address: ReturnAddress) -> Option<usize> {
        let mut start = None;

        // Inlined functions are reported first, the physical function last.
        backtrace::resolve(ptr::without_provenance_mut(address.get()), |symbol| {
            if let Some(addr) = symbol.addr() {
                start = Some(addr.addr());
            }
        });

        start
    }

    fn function_address(function: fn(&BacktraceUnwinder, usize) -> Vec<ReturnAddress>) -> usize {
        (function as *const ()).addr()
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot walk native stacks.
    fn backtrace_unwinder_captures_frames() {
        let stack = capture_from_nested_call(&BacktraceUnwinder::new(), 0);

        assert!(!stack.is_empty());
        assert!(stack.len() <= MAX_STACK_DEPTH);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot walk native stacks.
    fn innermost_frame_is_the_caller() {
        let stack = capture_through_wrapper(&BacktraceUnwinder::new(), 0);
        let innermost = *stack.last().unwrap();

        assert_eq!(
            enclosing_function(innermost),
            Some(function_address(capture_from_nested_call))
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot walk native stacks.
    fn skipped_frames_are_removed_from_the_inner_end() {
        let unwinder = BacktraceUnwinder::new();

        let full = capture_through_wrapper(&unwinder, 0);
        let skipped = capture_through_wrapper(&unwinder, 1);

        assert_eq!(skipped.len().saturating_add(1), full.len());

        let innermost = *skipped.last().unwrap();
        assert_eq!(
            enclosing_function(innermost),
            Some(function_address(capture_through_wrapper))
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot walk native stacks.
    fn skipping_everything_yields_empty_stack() {
        let stack = BacktraceUnwinder::new().capture(usize::MAX);

        assert!(stack.is_empty());
    }

    #[test]
    fn noop_unwinder_captures_nothing() {
        assert!(NoopUnwinder::new().capture(0).is_empty());
    }
}
