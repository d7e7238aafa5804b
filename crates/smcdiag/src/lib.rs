//! Diagnostic client for the kernel's SMC (Shared Memory
//! Communications) subsystem.
//!
//! The kernel exposes SMC state over two netlink interfaces: socket
//! diagnostics for link-group dumps and a generic netlink family for
//! statistics and system information. This crate speaks both, decodes
//! the attribute encoding against declared policies, and turns the
//! ever-increasing statistics counters into "since last reset" deltas
//! persisted per user.
//!
//! # Example
//!
//! ```ignore
//! use smcdiag::netlink::genl::GenlConnection;
//! use smcdiag::smc::{self, stats::Technology};
//! use smcdiag::stats::{CounterStore, StatsMode};
//!
//! #[tokio::main]
//! async fn main() -> smcdiag::Result<()> {
//!     let conn = GenlConnection::new()?;
//!     let family = smc::resolve_family(&conn).await?;
//!     let sample = smc::stats::fetch_counters(&conn, &family, Technology::SmcR).await?;
//!
//!     let store = CounterStore::for_user(Technology::SmcR);
//!     let result = store.reconcile_or_absolute(&sample, StatsMode::Delta { reset: false });
//!     println!("tx since reset: {}", result.delta.scalar("tx_cnt"));
//!     Ok(())
//! }
//! ```

pub mod netlink;
pub mod smc;
pub mod stats;

pub use netlink::{Error, Result};
