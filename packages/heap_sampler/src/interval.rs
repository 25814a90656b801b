//! Sampling decisions based on a Poisson process over allocated bytes.
//!
//! Sampling at a fixed byte interval would alias with allocation patterns that repeat with a
//! similar period (for example, loops allocating power-of-two buffers), systematically over- or
//! under-sampling them. Instead, the distance between two samples is drawn from an exponential
//! distribution, which makes every allocated byte equally likely to trigger a sample.

use std::cell::{Cell, RefCell};
use std::mem;
use std::num::NonZeroUsize;
use std::sync::atomic::{self, AtomicBool, AtomicU64, AtomicUsize};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// The smallest interval we will ever draw.
const MIN_INTERVAL: usize = mem::size_of::<usize>();

/// Drawn intervals are capped at this multiple of the mean, to avoid huge gaps in the sample
/// stream. The probability of hitting the cap is e^-20, so it does not skew the distribution.
const MAX_INTERVAL_MEAN_MULTIPLIER: usize = 20;

/// Identifies "no generator" in thread-local countdown state. Real generators start at 1.
const UNSEEDED_OWNER: u64 = 0;

static NEXT_GENERATOR_ID: AtomicU64 = AtomicU64::new(1);

// Used to derive seeds if the operating system cannot provide entropy for some reason.
static FALLBACK_SEED_SEQUENCE: AtomicU64 = AtomicU64::new(0x2545_f491_4f6c_dd1d);

/// How many bytes the current thread may still allocate before it triggers the next sample.
///
/// Tagged with the generator (and its configuration generation) that drew it, so that
/// a thread that switches to another generator or observes a reconfiguration draws anew.
#[derive(Clone, Copy, Debug)]
struct Countdown {
    owner: u64,
    generation: u64,
    remaining: usize,
}

impl Countdown {
    const UNSEEDED: Self = Self {
        owner: UNSEEDED_OWNER,
        generation: 0,
        remaining: 0,
    };
}

thread_local! {
    static COUNTDOWN: Cell<Countdown> = const { Cell::new(Countdown::UNSEEDED) };

    // Lazily seeded on first draw. Neither type has a destructor, so both slots remain
    // accessible while the thread is being torn down.
    static RNG: RefCell<Option<SmallRng>> = const { RefCell::new(None) };
}

/// Decides which allocations are sampled and what weight each sample carries.
#[derive(Debug)]
pub(crate) struct IntervalGenerator {
    id: u64,

    /// Mean number of bytes between two samples.
    mean: AtomicUsize,

    /// If set, every drawn interval is exactly the mean.
    deterministic: AtomicBool,

    /// Incremented on every reconfiguration, invalidating thread-local countdowns.
    generation: AtomicU64,
}

impl IntervalGenerator {
    pub(crate) fn new(mean: NonZeroUsize, deterministic: bool) -> Self {
        Self {
            id: NEXT_GENERATOR_ID.fetch_add(1, atomic::Ordering::Relaxed),
            mean: AtomicUsize::new(mean.get()),
            deterministic: AtomicBool::new(deterministic),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn mean(&self) -> usize {
        self.mean.load(atomic::Ordering::Relaxed)
    }

    pub(crate) fn set_mean(&self, mean: NonZeroUsize) {
        self.mean.store(mean.get(), atomic::Ordering::Relaxed);
        self.generation.fetch_add(1, atomic::Ordering::Release);
    }

    pub(crate) fn is_deterministic(&self) -> bool {
        self.deterministic.load(atomic::Ordering::Relaxed)
    }

    pub(crate) fn set_deterministic(&self, deterministic: bool) {
        self.deterministic
            .store(deterministic, atomic::Ordering::Relaxed);
        self.generation.fetch_add(1, atomic::Ordering::Release);
    }

    /// Accounts for an allocation of `size` bytes on the current thread.
    ///
    /// Returns the weight of the sample if this allocation is to be sampled.
    /// The weight is never smaller than `size`.
    #[inline]
    pub(crate) fn sample_weight(&self, size: usize) -> Option<usize> {
        let generation = self.generation.load(atomic::Ordering::Acquire);

        let mut countdown = COUNTDOWN.get();

        if countdown.owner != self.id || countdown.generation != generation {
            countdown = Countdown {
                owner: self.id,
                generation,
                remaining: self.draw(self.mean()),
            };
        }

        if size < countdown.remaining {
            countdown.remaining = countdown.remaining.wrapping_sub(size);
            COUNTDOWN.set(countdown);
            return None;
        }

        let weight = self.rearm(&mut countdown, size);
        COUNTDOWN.set(countdown);

        Some(weight)
    }

    #[cold]
    fn rearm(&self, countdown: &mut Countdown, size: usize) -> usize {
        // The mean cannot be zero, enforced by the setter and the constructor.
        let mean = self.mean().max(1);

        // Several sample points may fall within one large allocation. They all collapse into
        // a single sample whose weight accounts for them, so we only carry the remainder over.
        let mut overshoot = size.wrapping_sub(countdown.remaining).checked_rem(mean).unwrap_or(0);

        loop {
            let next = self.draw(mean);

            if next > overshoot {
                countdown.remaining = next.wrapping_sub(overshoot);
                break;
            }

            overshoot = overshoot.wrapping_sub(next);
        }

        size.max(mean)
    }

    fn draw(&self, mean: usize) -> usize {
        if self.is_deterministic() {
            return mean;
        }

        RNG.with_borrow_mut(|rng| {
            let rng = rng.get_or_insert_with(seed_thread_rng);
            next_interval(rng, mean)
        })
    }
}

/// Draws the distance in bytes to the next sample point from an exponential distribution
/// with the given mean, clamped to `[MIN_INTERVAL, MAX_INTERVAL_MEAN_MULTIPLIER * mean]`.
#[expect(
    clippy::cast_precision_loss,
    reason = "intervals far beyond 2^52 bytes are not meaningful, precision loss is irrelevant"
)]
#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "value is clamped to a non-negative range that fits in usize before the cast"
)]
pub(crate) fn next_interval(rng: &mut impl Rng, mean: usize) -> usize {
    let max_value = mean.saturating_mul(MAX_INTERVAL_MEAN_MULTIPLIER).max(MIN_INTERVAL);

    // The standard distribution is [0, 1), we flip it to (0, 1] so the logarithm is finite.
    let uniform = 1.0 - rng.random::<f64>();
    let value = -uniform.ln() * mean as f64;

    if value <= MIN_INTERVAL as f64 {
        MIN_INTERVAL
    } else if value >= max_value as f64 {
        max_value
    } else {
        value as usize
    }
}

fn seed_thread_rng() -> SmallRng {
    SmallRng::try_from_os_rng().unwrap_or_else(|_| {
        SmallRng::seed_from_u64(FALLBACK_SEED_SEQUENCE.fetch_add(
            0x9e37_79b9_7f4a_7c15,
            atomic::Ordering::Relaxed,
        ))
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use super::*;

    fn generator(mean: usize, deterministic: bool) -> IntervalGenerator {
        IntervalGenerator::new(NonZeroUsize::new(mean).unwrap(), deterministic)
    }

    #[test]
    fn interval_of_one_samples_every_allocation() {
        let generator = generator(1, true);

        for size in [1, 2, 7, 100, 4096] {
            assert_eq!(generator.sample_weight(size), Some(size));
        }
    }

    #[test]
    fn deterministic_interval_yields_exact_sample_count() {
        const ALLOCATION_SIZE: usize = 100;
        const ALLOCATIONS: usize = 1000;
        const INTERVAL: usize = 1000;

        let generator = generator(INTERVAL, true);

        let weights: Vec<usize> = (0..ALLOCATIONS)
            .filter_map(|_| generator.sample_weight(ALLOCATION_SIZE))
            .collect();

        assert_eq!(weights.len(), ALLOCATIONS * ALLOCATION_SIZE / INTERVAL);
        assert!(weights.iter().all(|&weight| weight == INTERVAL));
    }

    #[test]
    fn weight_is_at_least_allocation_size() {
        let generator = generator(64, true);

        // Much larger than the interval, so it is always sampled.
        assert_eq!(generator.sample_weight(10_000), Some(10_000));
    }

    #[test]
    fn reconfiguration_reseeds_countdown() {
        let generator = generator(1_000_000, true);

        assert_eq!(generator.sample_weight(10), None);

        generator.set_mean(NonZeroUsize::new(1).unwrap());

        assert_eq!(generator.sample_weight(10), Some(10));
    }

    #[test]
    fn generators_do_not_share_countdowns() {
        let first = generator(100, true);
        let second = generator(100, true);

        assert_eq!(first.sample_weight(60), None);

        // Switching generators reseeds, so the second one starts from a full interval
        // rather than inheriting the 40 bytes left by the first one.
        assert_eq!(second.sample_weight(60), None);
    }

    #[test]
    fn countdowns_are_per_thread() {
        let generator = generator(100, true);

        assert_eq!(generator.sample_weight(99), None);

        thread::scope(|s| {
            s.spawn(|| {
                // A fresh thread has a full interval ahead of it.
                assert_eq!(generator.sample_weight(99), None);
            });
        });

        assert_eq!(generator.sample_weight(1), Some(100));
    }

    #[test]
    fn drawn_intervals_average_to_mean() {
        const MEAN: usize = 4096;
        const DRAWS: usize = 100_000;

        let mut rng = SmallRng::seed_from_u64(42);

        let sum: usize = (0..DRAWS).map(|_| next_interval(&mut rng, MEAN)).sum();

        #[expect(clippy::integer_division, reason = "approximate mean is good enough")]
        let observed_mean = sum / DRAWS;

        // The standard error of the mean is MEAN / sqrt(DRAWS) ~ 13 bytes.
        assert!(
            observed_mean.abs_diff(MEAN) < MEAN / 20,
            "observed mean {observed_mean} too far from {MEAN}"
        );
    }

    #[test]
    fn drawn_intervals_are_clamped() {
        let mut rng = SmallRng::seed_from_u64(7);

        for _ in 0..100_000 {
            let interval = next_interval(&mut rng, 16);

            assert!(interval >= MIN_INTERVAL);
            assert!(interval <= 16 * MAX_INTERVAL_MEAN_MULTIPLIER);
        }
    }

    #[test]
    fn tiny_mean_respects_lower_bound() {
        let mut rng = SmallRng::seed_from_u64(1);

        for _ in 0..1000 {
            assert!(next_interval(&mut rng, 1) >= MIN_INTERVAL);
        }
    }

    #[test]
    fn random_sampling_rate_matches_mean() {
        const ALLOCATION_SIZE: usize = 64;
        const ALLOCATIONS: usize = 200_000;
        const INTERVAL: usize = 4096;

        let generator = generator(INTERVAL, false);

        let samples = (0..ALLOCATIONS)
            .filter(|_| generator.sample_weight(ALLOCATION_SIZE).is_some())
            .count();

        #[expect(clippy::integer_division, reason = "expected count is an exact integer here")]
        let expected = ALLOCATIONS * ALLOCATION_SIZE / INTERVAL;

        // Expected 3125 samples with a standard deviation of roughly 56.
        assert!(
            samples.abs_diff(expected) < expected / 10,
            "sampled {samples} allocations, expected about {expected}"
        );
    }
}
