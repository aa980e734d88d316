#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Self-renewing distributed mutual-exclusion lock.
//!
//! A [`LeaseLock`] takes a named, time-bounded lease on a shared
//! [`LeaseBackend`] and keeps it alive by extending it on a fixed cadence
//! while a long-running critical section executes. If an extension is
//! rejected or the backend cannot be reached, the lease is considered lost
//! and the execution context inside the lock is cancelled, exactly once.
//!
//! This is conventional advisory locking: no fencing-token verification,
//! no leader election, no deadlock avoidance across locks.
//!
//! ```
//! use lease_lock::test_utils::MemoryBackend;
//! use lease_lock::{LeaseConfig, LeaseLock};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> lease_lock::Result<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! let lock = LeaseLock::new(backend, "jobs/nightly", LeaseConfig::new(Duration::from_secs(30)))?;
//!
//! lock.with_lease(None, |cancelled| async move {
//!     // Long-running critical section. This future is dropped the moment
//!     // the lease can no longer be renewed; `cancelled` can also be
//!     // observed cooperatively.
//!     let _ = cancelled;
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod guard;
pub mod lock;
pub mod scheduler;

pub mod test_utils;

pub use backend::LeaseBackend;
pub use error::{Error, Result};
pub use guard::CancellationGuard;
pub use lock::{LeaseConfig, LeaseLock, LockState};
pub use scheduler::RenewalScheduler;
