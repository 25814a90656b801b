use foldhash::{HashMap, HashMapExt};

use crate::Sample;

/// Live samples keyed by allocation address, plus the ordinal counter.
///
/// Not synchronized by itself. The profiler guards it with one lock together with the observer
/// registry, so table growth never happens while another thread holds a reference into it and
/// snapshots are always value copies taken under that lock.
#[derive(Debug)]
pub(crate) struct SampleTable {
    samples: HashMap<usize, Sample>,

    /// The ordinal of the most recently recorded sample, 0 if none yet.
    last_ordinal: u64,
}

impl SampleTable {
    pub(crate) fn new() -> Self {
        Self {
            samples: HashMap::new(),
            last_ordinal: 0,
        }
    }

    pub(crate) fn last_ordinal(&self) -> u64 {
        self.last_ordinal
    }

    /// Advances the ordinal counter by one and returns the new value.
    pub(crate) fn next_ordinal(&mut self) -> u64 {
        self.last_ordinal = self
            .last_ordinal
            .checked_add(1)
            .expect("sample ordinal overflows u64 - this indicates an unrealistic scenario");

        self.last_ordinal
    }

    /// Records the sample for an allocation at `address`.
    ///
    /// If a sample for the same address is still live (its free was never observed), it is
    /// replaced and returned so the caller can report its removal.
    pub(crate) fn insert(&mut self, address: usize, sample: Sample) -> Option<Sample> {
        self.samples.insert(address, sample)
    }

    pub(crate) fn remove(&mut self, address: usize) -> Option<Sample> {
        self.samples.remove(&address)
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    /// Copies out every live sample with an ordinal greater than `watermark`, oldest first.
    pub(crate) fn snapshot(&self, watermark: u64) -> Vec<Sample> {
        let mut samples: Vec<Sample> = self
            .samples
            .values()
            .filter(|sample| sample.ordinal() > watermark)
            .cloned()
            .collect();

        samples.sort_unstable_by_key(Sample::ordinal);
        samples
    }

    /// Sum of sample weights over live samples with an ordinal greater than `watermark`.
    pub(crate) fn total_since(&self, watermark: u64) -> usize {
        self.samples
            .values()
            .filter(|sample| sample.ordinal() > watermark)
            .fold(0_usize, |acc, sample| acc.saturating_add(sample.total()))
    }
}
