//! Delta computation between a persisted baseline and a fresh sample.

use tracing::warn;

use super::cache::CounterCache;
use crate::netlink::error::Result;
use crate::smc::stats::{CounterSnapshot, FallbackEntry, Technology};

/// How a statistics invocation treats the baseline cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsMode {
    /// Report raw kernel counters; the cache is neither read nor written.
    Absolute,
    /// Report counters since the last reset. With `reset` the current
    /// sample becomes the new baseline afterwards.
    Delta { reset: bool },
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// Display-ready counters.
    pub delta: CounterSnapshot,
    /// False when the baseline was inconsistent with the sample and had
    /// to be dropped.
    pub cache_valid: bool,
}

/// Reconcile a fresh sample against a baseline.
///
/// Every scalar and every fallback entry of the baseline must be at
/// most the corresponding current value; entries are matched by their
/// (side, reason) key, never by position. Any regression (kernel
/// restart, foreign baseline, technology mismatch) invalidates the
/// whole baseline and the sample is returned unchanged.
pub fn reconcile(baseline: &CounterSnapshot, current: &CounterSnapshot) -> Reconciled {
    let invalid = Reconciled {
        delta: current.clone(),
        cache_valid: false,
    };

    if baseline.tech != current.tech {
        return invalid;
    }
    for (key, &base) in &baseline.scalars {
        if current.scalar(key) < base {
            return invalid;
        }
    }
    for entry in &baseline.fallback {
        if current.fallback_count(entry.server, entry.reason) < entry.count {
            return invalid;
        }
    }

    let mut delta = CounterSnapshot::zero(current.tech);
    for (key, &cur) in &current.scalars {
        delta.scalars.insert(key.clone(), cur - baseline.scalar(key));
    }
    delta.fallback = current
        .fallback
        .iter()
        .map(|entry| FallbackEntry {
            server: entry.server,
            reason: entry.reason,
            count: entry.count - baseline.fallback_count(entry.server, entry.reason),
        })
        .collect();

    Reconciled {
        delta,
        cache_valid: true,
    }
}

/// Drives the cache lifecycle around [`reconcile`] for one invocation.
pub struct CounterStore {
    cache: CounterCache,
}

impl CounterStore {
    /// Store backed by the invoking user's cache file.
    pub fn for_user(tech: Technology) -> Self {
        Self {
            cache: CounterCache::for_user(tech),
        }
    }

    /// Store backed by an explicit cache location.
    pub fn with_cache(cache: CounterCache) -> Self {
        Self { cache }
    }

    /// Reconcile `current` according to `mode`.
    ///
    /// In delta mode the whole read-decide-write cycle runs under the
    /// cache lock: load the baseline (a missing file is an all-zero
    /// baseline), compute the delta, delete an inconsistent baseline,
    /// and persist `current` when a reset was requested.
    pub fn reconcile(&self, current: &CounterSnapshot, mode: StatsMode) -> Result<Reconciled> {
        let reset = match mode {
            StatsMode::Absolute => {
                return Ok(Reconciled {
                    delta: current.clone(),
                    cache_valid: true,
                });
            }
            StatsMode::Delta { reset } => reset,
        };

        let mut guard = self.cache.open()?;
        let baseline = guard
            .load()?
            .unwrap_or_else(|| CounterSnapshot::zero(current.tech));

        let result = reconcile(&baseline, current);
        if !result.cache_valid {
            guard.discard()?;
        }
        if reset {
            guard.store(current)?;
        }
        Ok(result)
    }

    /// Like [`reconcile`](Self::reconcile), but a cache failure degrades
    /// to absolute counters with a warning instead of failing the
    /// command.
    pub fn reconcile_or_absolute(&self, current: &CounterSnapshot, mode: StatsMode) -> Reconciled {
        match self.reconcile(current, mode) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "baseline cache unusable, reporting absolute counters");
                Reconciled {
                    delta: current.clone(),
                    cache_valid: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_store() -> CounterStore {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        CounterStore::with_cache(CounterCache::at_path(std::env::temp_dir().join(format!(
            ".smc-reconcile-test.{}.{}",
            std::process::id(),
            n
        ))))
    }

    fn snapshot(pairs: &[(&str, u64)]) -> CounterSnapshot {
        let mut snap = CounterSnapshot::zero(Technology::SmcR);
        for (key, value) in pairs {
            snap.scalars.insert((*key).into(), *value);
        }
        snap
    }

    #[test]
    fn test_additivity() {
        let baseline = snapshot(&[("tx_cnt", 100), ("rx_cnt", 40)]);
        let current = snapshot(&[("tx_cnt", 150), ("rx_cnt", 40)]);
        let result = reconcile(&baseline, &current);
        assert!(result.cache_valid);
        for (key, &value) in &current.scalars {
            assert_eq!(result.delta.scalar(key) + baseline.scalar(key), value);
        }
    }

    #[test]
    fn test_regression_invalidates() {
        let baseline = snapshot(&[("tx_cnt", 500)]);
        let current = snapshot(&[("tx_cnt", 10)]);
        let result = reconcile(&baseline, &current);
        assert!(!result.cache_valid);
        assert_eq!(result.delta, current);
    }

    #[test]
    fn test_baseline_key_missing_from_current_invalidates() {
        let baseline = snapshot(&[("tx_cnt", 1)]);
        let current = snapshot(&[("rx_cnt", 5)]);
        assert!(!reconcile(&baseline, &current).cache_valid);
    }

    #[test]
    fn test_technology_mismatch_invalidates() {
        let baseline = CounterSnapshot::zero(Technology::SmcD);
        let current = snapshot(&[("tx_cnt", 5)]);
        assert!(!reconcile(&baseline, &current).cache_valid);
    }

    #[test]
    fn test_fallback_matched_by_reason_key() {
        let mut baseline = CounterSnapshot::zero(Technology::SmcR);
        baseline.fallback.push(FallbackEntry {
            server: false,
            reason: 0x1111,
            count: 3,
        });
        // Same entries, different order and an extra reason.
        let mut current = CounterSnapshot::zero(Technology::SmcR);
        current.fallback.push(FallbackEntry {
            server: true,
            reason: 0x2222,
            count: 8,
        });
        current.fallback.push(FallbackEntry {
            server: false,
            reason: 0x1111,
            count: 5,
        });

        let result = reconcile(&baseline, &current);
        assert!(result.cache_valid);
        assert_eq!(result.delta.fallback_count(false, 0x1111), 2);
        assert_eq!(result.delta.fallback_count(true, 0x2222), 8);
    }

    #[test]
    fn test_fallback_regression_invalidates() {
        let mut baseline = CounterSnapshot::zero(Technology::SmcR);
        baseline.fallback.push(FallbackEntry {
            server: true,
            reason: 0x9,
            count: 4,
        });
        let current = CounterSnapshot::zero(Technology::SmcR);
        assert!(!reconcile(&baseline, &current).cache_valid);
    }

    #[test]
    fn test_delta_then_reset_then_delta() {
        let store = temp_store();

        // First run: no baseline, delta equals the sample.
        let result = store
            .reconcile(&snapshot(&[("tx_cnt", 100)]), StatsMode::Delta { reset: false })
            .unwrap();
        assert!(result.cache_valid);
        assert_eq!(result.delta.scalar("tx_cnt"), 100);

        // Reset at 150: delta is still against the zero baseline, but
        // 150 becomes the new baseline.
        let result = store
            .reconcile(&snapshot(&[("tx_cnt", 150)]), StatsMode::Delta { reset: true })
            .unwrap();
        assert_eq!(result.delta.scalar("tx_cnt"), 150);

        // Next run at 170 reports 20 since the reset.
        let result = store
            .reconcile(&snapshot(&[("tx_cnt", 170)]), StatsMode::Delta { reset: false })
            .unwrap();
        assert!(result.cache_valid);
        assert_eq!(result.delta.scalar("tx_cnt"), 20);

        std::fs::remove_file(store.cache.path()).unwrap();
    }

    #[test]
    fn test_kernel_restart_removes_cache_file() {
        let store = temp_store();

        store
            .reconcile(&snapshot(&[("tx_cnt", 500)]), StatsMode::Delta { reset: true })
            .unwrap();
        assert!(store.cache.path().exists());

        let result = store
            .reconcile(&snapshot(&[("tx_cnt", 10)]), StatsMode::Delta { reset: false })
            .unwrap();
        assert!(!result.cache_valid);
        assert_eq!(result.delta.scalar("tx_cnt"), 10);
        assert!(!store.cache.path().exists());
    }

    #[test]
    fn test_absolute_mode_ignores_cache() {
        let store = temp_store();

        let result = store
            .reconcile(&snapshot(&[("tx_cnt", 77)]), StatsMode::Absolute)
            .unwrap();
        assert!(result.cache_valid);
        assert_eq!(result.delta.scalar("tx_cnt"), 77);
        assert!(!store.cache.path().exists());
    }

    #[test]
    fn test_corrupt_cache_degrades_to_absolute() {
        let store = temp_store();
        std::fs::write(store.cache.path(), "not a baseline").unwrap();

        assert!(store
            .reconcile(&snapshot(&[("tx_cnt", 3)]), StatsMode::Delta { reset: false })
            .is_err());

        let result = store
            .reconcile_or_absolute(&snapshot(&[("tx_cnt", 3)]), StatsMode::Delta { reset: false });
        assert!(!result.cache_valid);
        assert_eq!(result.delta.scalar("tx_cnt"), 3);

        std::fs::remove_file(store.cache.path()).unwrap();
    }
}
