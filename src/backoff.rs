use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Backoff growth per consecutive failure.
const BACKOFF_MULTIPLIER: f64 = 1.5;
/// Ceiling for the per-key backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(1200);

#[derive(Clone, Copy, Debug)]
struct BackoffEntry {
    last_failure: Instant,
    backoff: Duration,
}

/// Per-key geometric backoff for instance deletions that keep failing, so a
/// wedged provider resource does not get hammered every consolidation tick.
pub struct DeleteBackoffRegistry {
    base: Duration,
    entries: DashMap<String, BackoffEntry>,
}

impl DeleteBackoffRegistry {
    /// `base` is the delay applied after the first failure; the pool
    /// consolidation interval is the natural choice.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            entries: DashMap::new(),
        }
    }

    pub fn record_failure(&self, key: &str) {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(BackoffEntry {
            last_failure: now,
            backoff: Duration::ZERO,
        });
        entry.last_failure = now;
        entry.backoff = if entry.backoff.is_zero() {
            self.base
        } else {
            entry.backoff.mul_f64(BACKOFF_MULTIPLIER).min(MAX_BACKOFF)
        };
    }

    /// Whether the key is clear to be processed now. When it is not, the
    /// earliest time a retry makes sense is returned.
    pub fn should_process(&self, key: &str) -> (bool, Option<Instant>) {
        match self.entries.get(key) {
            None => (true, None),
            Some(entry) => {
                let earliest = entry.last_failure + entry.backoff;
                if Instant::now() > earliest {
                    (true, None)
                } else {
                    (false, Some(earliest))
                }
            }
        }
    }

    /// Clear the entry once the operation finally succeeds.
    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }
}
