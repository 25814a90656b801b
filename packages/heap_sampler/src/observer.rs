use std::fmt;
use std::sync::Arc;

/// Receives live notifications about changes to the sample table of a
/// [`HeapProfiler`][crate::HeapProfiler].
///
/// Notifications are delivered synchronously on the thread that performed the allocation or
/// deallocation, while the profiler holds its internal lock. Implementations must therefore:
///
/// * return quickly and never block, as they stall the allocating thread and every other
///   thread that wants to record a sample;
/// * never call the profiler's snapshot, observer registration or session control methods,
///   which would deadlock.
///
/// Allocating inside a notification is permitted. Such allocations are not sampled.
///
/// A panic in a notification propagates to the thread that allocated; for allocations made
/// through [`SamplingAllocator`][crate::SamplingAllocator] this aborts the process. The
/// profiler itself stays usable: the table is updated before observers are notified.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use heap_sampler::SamplesObserver;
///
/// #[derive(Default)]
/// struct LiveEstimate {
///     bytes: AtomicUsize,
/// }
///
/// impl SamplesObserver for LiveEstimate {
///     fn sample_added(&self, _ordinal: u64, _size: usize, total: usize) {
///         self.bytes.fetch_add(total, Ordering::Relaxed);
///     }
///
///     fn sample_removed(&self, _ordinal: u64) {
///         // A real observer would remember the weight per ordinal to subtract it here.
///     }
/// }
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait SamplesObserver: Send + Sync {
    /// A sample with the given ordinal was recorded.
    ///
    /// `size` is the size of the sampled allocation and `total` the number of bytes
    /// the sample stands for.
    fn sample_added(&self, ordinal: u64, size: usize, total: usize);

    /// The sample with the given ordinal was removed because its allocation was freed.
    fn sample_removed(&self, ordinal: u64);
}

/// The registered observers, in registration order.
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    observers: Vec<Arc<dyn SamplesObserver>>,
}

impl ObserverRegistry {
    pub(crate) fn add(&mut self, observer: Arc<dyn SamplesObserver>) {
        self.observers.push(observer);
    }

    /// Removes the earliest registration of `observer`.
    ///
    /// Returns whether the observer was registered.
    pub(crate) fn remove(&mut self, observer: &Arc<dyn SamplesObserver>) -> bool {
        let target = Arc::as_ptr(observer).cast::<()>();

        // Compare data pointers only. The same object may be reached through different vtables.
        let Some(index) = self
            .observers
            .iter()
            .position(|candidate| Arc::as_ptr(candidate).cast::<()>() == target)
        else {
            return false;
        };

        self.observers.remove(index);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn notify_added(&self, ordinal: u64, size: usize, total: usize) {
        for observer in &self.observers {
            observer.sample_added(ordinal, size, total);
        }
    }

    pub(crate) fn notify_removed(&self, ordinal: u64) {
        for observer in &self.observers {
            observer.sample_removed(ordinal);
        }
    }
}

impl fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Mutex;

    use mockall::Sequence;
    use mockall::predicate::eq;

    use super::*;

    #[derive(Debug, Default)]
    struct NamedObserver {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl SamplesObserver for NamedObserver {
        fn sample_added(&self, ordinal: u64, _size: usize, _total: usize) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{} added {ordinal}", self.name));
        }

        fn sample_removed(&self, ordinal: u64) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{} removed {ordinal}", self.name));
        }
    }

    #[test]
    fn notifies_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ObserverRegistry::default();

        registry.add(Arc::new(NamedObserver {
            name: "first",
            log: Arc::clone(&log),
        }));
        registry.add(Arc::new(NamedObserver {
            name: "second",
            log: Arc::clone(&log),
        }));

        registry.notify_added(1, 8, 8);
        registry.notify_removed(1);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "first added 1",
                "second added 1",
                "first removed 1",
                "second removed 1"
            ]
        );
    }

    #[test]
    fn forwards_sample_details() {
        let mut observer = MockSamplesObserver::new();
        let mut sequence = Sequence::new();

        observer
            .expect_sample_added()
            .with(eq(3), eq(24), eq(4096))
            .times(1)
            .in_sequence(&mut sequence)
            .return_const(());
        observer
            .expect_sample_removed()
            .with(eq(3))
            .times(1)
            .in_sequence(&mut sequence)
            .return_const(());

        let mut registry = ObserverRegistry::default();
        registry.add(Arc::new(observer));

        registry.notify_added(3, 24, 4096);
        registry.notify_removed(3);
    }

    #[test]
    fn removed_observer_is_not_notified() {
        // No expectations - any call fails the test.
        let observer: Arc<dyn SamplesObserver> = Arc::new(MockSamplesObserver::new());

        let mut registry = ObserverRegistry::default();
        registry.add(Arc::clone(&observer));

        assert!(registry.remove(&observer));
        assert_eq!(registry.len(), 0);

        registry.notify_added(1, 1, 1);
        registry.notify_removed(1);
    }

    #[test]
    fn removing_unknown_observer_is_rejected() {
        let registered: Arc<dyn SamplesObserver> = Arc::new(NamedObserver::default());
        let stranger: Arc<dyn SamplesObserver> = Arc::new(NamedObserver::default());

        let mut registry = ObserverRegistry::default();
        registry.add(Arc::clone(&registered));

        assert!(!registry.remove(&stranger));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_registration_is_removed_one_at_a_time() {
        let observer: Arc<dyn SamplesObserver> = Arc::new(NamedObserver::default());

        let mut registry = ObserverRegistry::default();
        registry.add(Arc::clone(&observer));
        registry.add(Arc::clone(&observer));

        assert!(registry.remove(&observer));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(&observer));
        assert!(!registry.remove(&observer));
    }
}
