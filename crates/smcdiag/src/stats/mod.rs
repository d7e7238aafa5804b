//! Counter reconciliation: persisted per-user baselines and delta
//! computation for the monotonic kernel statistics counters.

pub mod cache;
pub mod reconcile;

pub use cache::{CacheGuard, CounterCache};
pub use reconcile::{CounterStore, Reconciled, StatsMode, reconcile};
