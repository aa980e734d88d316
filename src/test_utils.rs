//! In-memory backend with fault injection, for exercising the lease
//! protocol without a real store.

use crate::backend::LeaseBackend;
use crate::{Error, Result};
use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

/// How often a blocking acquire re-checks the table.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct HeldEntry {
    token: Uuid,
    expires_at: Instant,
}

impl HeldEntry {
    fn new(token: Uuid, ttl: Duration) -> Self {
        Self {
            token,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Shared in-memory lease table honoring TTLs against the tokio clock, so
/// paused-time tests stay deterministic.
///
/// Fault injection: `set_connected(false)` makes every call fail with
/// `BackendUnavailable` until reconnected, and `fail_extends(n)` rejects
/// the next `n` extension attempts as if the token had been stolen.
#[derive(Debug)]
pub struct MemoryBackend {
    table: DashMap<String, HeldEntry>,
    connected: AtomicBool,
    reject_extends: AtomicUsize,
    extend_calls: AtomicUsize,
    release_writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
            connected: AtomicBool::new(true),
            reject_extends: AtomicUsize::new(0),
            extend_calls: AtomicUsize::new(0),
            release_writes: AtomicUsize::new(0),
        }
    }

    /// Simulates a transport-level connection drop (and the reconnect).
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Rejects the next `count` extension attempts.
    pub fn fail_extends(&self, count: usize) {
        self.reject_extends.store(count, Ordering::SeqCst);
    }

    /// Number of extension attempts that reached this backend.
    pub fn extend_calls(&self) -> usize {
        self.extend_calls.load(Ordering::SeqCst)
    }

    /// Number of release writes that reached this backend.
    pub fn release_writes(&self) -> usize {
        self.release_writes.load(Ordering::SeqCst)
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::BackendUnavailable {
                source: anyhow!("connection refused"),
            })
        }
    }

    fn try_take(&self, name: &str, token: Uuid, ttl: Duration) -> bool {
        match self.table.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.token == token || !current.is_live() {
                    occupied.insert(HeldEntry::new(token, ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(HeldEntry::new(token, ttl));
                true
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseBackend for MemoryBackend {
    async fn acquire(
        &self,
        name: &str,
        token: Uuid,
        ttl: Duration,
        blocking: Option<Duration>,
    ) -> Result<bool> {
        self.check_connected()?;
        let deadline = blocking.map(|wait| Instant::now() + wait);
        loop {
            if self.try_take(name, token, ttl) {
                return Ok(true);
            }
            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    sleep(ACQUIRE_POLL_INTERVAL).await;
                    self.check_connected()?;
                }
                _ => return Ok(false),
            }
        }
    }

    async fn extend(&self, name: &str, token: Uuid, ttl: Duration) -> Result<bool> {
        self.extend_calls.fetch_add(1, Ordering::SeqCst);
        self.check_connected()?;

        let rejected = self
            .reject_extends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Ok(false);
        }

        match self.table.get_mut(name) {
            Some(mut entry) if entry.token == token && entry.is_live() => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Err(Error::NotHeld {
                name: name.to_string(),
            }),
        }
    }

    async fn release(&self, name: &str, token: Uuid) -> Result<bool> {
        self.release_writes.fetch_add(1, Ordering::SeqCst);
        self.check_connected()?;
        let removed = self
            .table
            .remove_if(name, |_, entry| entry.token == token)
            .is_some();
        Ok(removed)
    }

    async fn is_locked(&self, name: &str) -> Result<bool> {
        self.check_connected()?;
        Ok(self.table.get(name).is_some_and(|entry| entry.is_live()))
    }

    async fn is_owned_by(&self, name: &str, token: Uuid) -> Result<bool> {
        self.check_connected()?;
        Ok(self
            .table
            .get(name)
            .is_some_and(|entry| entry.token == token && entry.is_live()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expired_entries_can_be_taken_over() {
        let backend = MemoryBackend::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let ttl = Duration::from_millis(50);

        assert!(backend.acquire("example", first, ttl, None).await.unwrap());
        assert!(!backend.acquire("example", second, ttl, None).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!backend.is_locked("example").await.unwrap());
        assert!(backend.acquire("example", second, ttl, None).await.unwrap());
        assert!(backend.is_owned_by("example", second).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn extend_rejects_a_stale_token() {
        let backend = MemoryBackend::new();
        let holder = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let ttl = Duration::from_millis(50);

        assert!(backend.acquire("example", holder, ttl, None).await.unwrap());
        assert!(backend.extend("example", holder, ttl).await.unwrap());
        assert!(matches!(
            backend.extend("example", stranger, ttl).await,
            Err(Error::NotHeld { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_backend_reports_unavailable() {
        let backend = MemoryBackend::new();
        let token = Uuid::new_v4();
        let ttl = Duration::from_millis(50);

        backend.set_connected(false);
        assert!(matches!(
            backend.acquire("example", token, ttl, None).await,
            Err(Error::BackendUnavailable { .. })
        ));

        backend.set_connected(true);
        assert!(backend.acquire("example", token, ttl, None).await.unwrap());
    }
}
