use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

const JITTER: f64 = 0.1;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`, with
/// ±10% jitter so keys that failed together do not retry together.
pub struct ItemExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: DashMap<K, u32>,
}

impl<K: Hash + Eq + Clone> ItemExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: DashMap::new(),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay before the next retry of `key`; counts one more failure.
    pub fn when(&self, key: &K) -> Duration {
        let exponent = {
            let mut failures = self.failures.entry(key.clone()).or_insert(0);
            let exponent = *failures;
            *failures = failures.saturating_add(1);
            exponent
        };
        self.backoff(exponent)
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or(0)
    }

    pub fn forget(&self, key: &K) {
        self.failures.remove(key);
    }

    fn backoff(&self, exponent: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(exponent.min(63) as i32);
        let capped = exp.min(self.max.as_secs_f64());
        let factor = rand::rng().random_range((1.0 - JITTER)..=(1.0 + JITTER));
        Duration::from_secs_f64((capped * factor).min(self.max.as_secs_f64()))
    }
}
