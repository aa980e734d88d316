use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Atomic lease operations against a shared store, keyed by lock name and
/// holder token. Implementations are shared across lock instances
/// (`Arc<dyn LeaseBackend>`); a lock never owns or closes its backend.
///
/// Ownership of a held lease is defined exclusively by token equality in
/// the store. Retry policy for transient transport faults belongs to the
/// implementation's own I/O layer; the lease protocol never retries.
#[async_trait]
pub trait LeaseBackend: Send + Sync + std::fmt::Debug {
    /// Take the lock, waiting up to `blocking` for another holder to go
    /// away. One logical write per call; any waiting happens inside the
    /// backend. `Ok(false)` means the lock stayed with another token.
    async fn acquire(
        &self,
        name: &str,
        token: Uuid,
        ttl: Duration,
        blocking: Option<Duration>,
    ) -> Result<bool>;

    /// Reset the lease's remaining validity to `ttl` without releasing it.
    /// `Ok(false)` or `Err(NotHeld)` when `token` is not the current holder.
    async fn extend(&self, name: &str, token: Uuid, ttl: Duration) -> Result<bool>;

    /// Drop the lease. No-op (`Ok(false)`) when `token` is not the holder.
    async fn release(&self, name: &str, token: Uuid) -> Result<bool>;

    /// Whether any live lease exists for `name`. Observer query, not used
    /// by the lease protocol itself.
    async fn is_locked(&self, name: &str) -> Result<bool>;

    /// Whether the live lease for `name` is held by `token`.
    async fn is_owned_by(&self, name: &str, token: Uuid) -> Result<bool>;
}
