use crate::backend::LeaseBackend;
use crate::guard::CancellationGuard;
use crate::scheduler::RenewalScheduler;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lease validity and renewal cadence for one lock.
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    /// How long the lease stays valid without an extension. Mandatory and
    /// strictly positive.
    pub timeout: Duration,
    /// Renewal cadence. Defaults to `timeout / 2` and must be strictly
    /// less than `timeout`.
    pub extend_interval: Option<Duration>,
}

impl LeaseConfig {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            extend_interval: None,
        }
    }

    #[must_use]
    pub fn with_extend_interval(mut self, interval: Duration) -> Self {
        self.extend_interval = Some(interval);
        self
    }

    /// Cadence the renewal scheduler runs at: the explicit interval, or
    /// half the lease timeout.
    pub fn effective_interval(&self) -> Duration {
        self.extend_interval.unwrap_or(self.timeout / 2)
    }

    fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "timeout must be strictly positive".to_string(),
            });
        }
        let interval = self.effective_interval();
        if interval.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "extend interval must be strictly positive".to_string(),
            });
        }
        if interval >= self.timeout {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "extend interval {interval:?} must be strictly less than timeout {:?}",
                    self.timeout
                ),
            });
        }
        Ok(())
    }
}

/// Lifecycle of one lock instance's claim on its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Initial, and terminal after a release.
    Released,
    /// Acquired and being kept alive by the renewal scheduler.
    Held,
    /// A renewal attempt failed. One-way: the instance never re-acquires
    /// on its own; a fresh `acquire` creates a new identity.
    Lost,
}

#[derive(Debug)]
struct Holder {
    state: LockState,
    token: Option<Uuid>,
}

/// A distributed mutual-exclusion lock that keeps its lease alive.
///
/// Once acquired, a background scheduler extends the lease every
/// `extend_interval` against wall-clock deadlines. When an extension is
/// rejected or the backend cannot be reached, the lease is lost and the
/// owning execution context (recorded by [`LeaseLock::with_lease`]) is
/// cancelled, exactly once. Renewal failure is never retried here; retry
/// policy belongs to the backend's own I/O layer.
///
/// `acquire`, `release`, and `renew` are serialized against each other, so
/// a renewal in flight can never race a concurrent release.
#[derive(Debug, Clone)]
pub struct LeaseLock {
    inner: Arc<LockInner>,
}

#[derive(Debug)]
struct LockInner {
    backend: Arc<dyn LeaseBackend>,
    name: String,
    config: LeaseConfig,
    /// Serializes acquire, release, and renew. One in-flight critical
    /// operation at a time; others queue.
    gate: tokio::sync::Mutex<()>,
    holder: Mutex<Holder>,
    scheduler: RenewalScheduler,
    guard: CancellationGuard,
}

impl LeaseLock {
    /// Binds a named lock to a shared backend.
    ///
    /// # Errors
    ///
    /// `Error::InvalidConfig` when the config invariants do not hold.
    pub fn new(
        backend: Arc<dyn LeaseBackend>,
        name: impl Into<String>,
        config: LeaseConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(LockInner {
                backend,
                name: name.into(),
                config,
                gate: tokio::sync::Mutex::new(()),
                holder: Mutex::new(Holder {
                    state: LockState::Released,
                    token: None,
                }),
                scheduler: RenewalScheduler::new(),
                guard: CancellationGuard::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> LockState {
        self.inner.holder.lock().state
    }

    pub fn is_held(&self) -> bool {
        self.state() == LockState::Held
    }

    /// Takes the lock with a fresh token, waiting up to `blocking` for a
    /// competing holder. On success the renewal scheduler starts with an
    /// initial delay of one extend interval (the first extension is not
    /// needed right after acquiring).
    ///
    /// Contention is reported as `Ok(false)`, not as an error. A new
    /// acquire supersedes any previous identity of this instance.
    ///
    /// # Errors
    ///
    /// Backend faults during the acquire itself.
    pub async fn acquire(&self, blocking: Option<Duration>) -> Result<bool> {
        Arc::clone(&self.inner).acquire(blocking, None).await
    }

    /// Stops the renewal scheduler, then releases the lease. Idempotent:
    /// releasing an unheld or lost lock is a logged no-op that never
    /// writes a stale token to the backend.
    ///
    /// # Errors
    ///
    /// Backend transport faults during the release write. `NotHeld` from
    /// the backend is suppressed.
    pub async fn release(&self) -> Result<()> {
        self.inner.release().await
    }

    /// One renewal attempt. Invoked by the scheduler, public so tests can
    /// drive it directly. Returns `false` without touching the backend
    /// when the lock is not currently held.
    pub async fn renew(&self) -> bool {
        self.inner.renew().await
    }

    /// Observer query against the backend; not used by the protocol.
    ///
    /// # Errors
    ///
    /// Backend faults.
    pub async fn is_locked(&self) -> Result<bool> {
        self.inner.backend.is_locked(&self.inner.name).await
    }

    /// Whether the backend still maps this lock's name to our token.
    ///
    /// # Errors
    ///
    /// Backend faults.
    pub async fn is_owned(&self) -> Result<bool> {
        let token = self.inner.holder.lock().token;
        match token {
            Some(token) => self.inner.backend.is_owned_by(&self.inner.name, token).await,
            None => Ok(false),
        }
    }

    /// Runs `body` inside the lock's critical section.
    ///
    /// The scope's owning context is recorded under the critical-section
    /// gate, before the renewal scheduler starts, so even a renewal that
    /// fails immediately after acquisition cancels the scope. On loss, the
    /// body future is dropped, which cancels every sub-future composed
    /// inside it (joined or selected), and `Error::LeaseLost` is returned.
    /// The body also receives the context token for cooperative observation.
    ///
    /// The lease is released on every exit path: normal completion, loss,
    /// a panic in the body, or this future itself being dropped mid-body
    /// (the latter two release from a spawned task). A backend fault during
    /// the final release is logged, not returned: the local state is
    /// already cleared and the lease expires server-side on its own, while
    /// the body's outcome has already been produced.
    ///
    /// # Errors
    ///
    /// `Error::Contended` when the lock could not be acquired within
    /// `blocking`, `Error::LeaseLost` when renewal failed mid-body, and
    /// backend faults from the acquire.
    pub async fn with_lease<F, Fut, T>(&self, blocking: Option<Duration>, body: F) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let context = CancellationToken::new();
        let acquired = Arc::clone(&self.inner)
            .acquire(blocking, Some(context.clone()))
            .await?;
        if !acquired {
            return Err(Error::Contended {
                name: self.inner.name.clone(),
            });
        }

        let mut cleanup = ReleaseOnDrop {
            inner: Some(Arc::clone(&self.inner)),
        };

        let outcome = tokio::select! {
            () = context.cancelled() => Err(Error::LeaseLost {
                name: self.inner.name.clone(),
            }),
            value = body(context.clone()) => Ok(value),
        };

        // Normal exit path: disarm the unwind cleanup and release inline,
        // clearing the owning context first.
        cleanup.inner = None;
        self.inner.guard.exit();
        if let Err(err) = self.inner.release().await {
            warn!(name = %self.inner.name, error = %err, "release after the critical section failed");
        }

        outcome
    }
}

impl LockInner {
    async fn acquire(
        self: Arc<Self>,
        blocking: Option<Duration>,
        owner: Option<CancellationToken>,
    ) -> Result<bool> {
        let _section = self.gate.lock().await;

        // A fresh acquire supersedes whatever identity this instance had.
        self.scheduler.stop().await;
        {
            let mut holder = self.holder.lock();
            holder.state = LockState::Released;
            holder.token = None;
        }

        let token = Uuid::new_v4();
        debug!(name = %self.name, %token, "acquiring lock");
        let acquired = self
            .backend
            .acquire(&self.name, token, self.config.timeout, blocking)
            .await?;
        if !acquired {
            debug!(name = %self.name, "lock is held elsewhere");
            return Ok(false);
        }

        {
            let mut holder = self.holder.lock();
            holder.state = LockState::Held;
            holder.token = Some(token);
        }
        // The owning context must be on record before the scheduler starts:
        // renewals only run once the gate is released, so a failure on the
        // very first tick already finds someone to cancel.
        if let Some(owner) = owner {
            self.guard.enter(owner);
        }

        let interval = self.config.effective_interval();
        let weak = Arc::downgrade(&self);
        self.scheduler
            .start(interval, interval, move || renew_tick(weak.clone()))?;
        debug!(name = %self.name, "acquired lock");
        Ok(true)
    }

    async fn release(&self) -> Result<()> {
        let _section = self.gate.lock().await;

        // Stop first so no renewal races the release. Tolerates a scheduler
        // that was never started or already stopped.
        self.scheduler.stop().await;

        let previous = {
            let mut holder = self.holder.lock();
            let previous = (holder.state, holder.token.take());
            holder.state = LockState::Released;
            previous
        };
        self.guard.exit();

        match previous {
            (LockState::Held, Some(token)) => {
                debug!(name = %self.name, "releasing lock");
                match self.backend.release(&self.name, token).await {
                    Ok(_) => Ok(()),
                    Err(Error::NotHeld { .. }) => {
                        debug!(name = %self.name, "lease already gone at release");
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            _ => {
                debug!(name = %self.name, "release on a lock that is not held; nothing to do");
                Ok(())
            }
        }
    }

    async fn renew(&self) -> bool {
        let _section = self.gate.lock().await;

        let token = {
            let holder = self.holder.lock();
            if holder.state != LockState::Held {
                debug!(name = %self.name, state = ?holder.state, "skipping renewal; lock is not held");
                return false;
            }
            holder.token
        };
        let Some(token) = token else {
            return false;
        };

        debug!(name = %self.name, "extending lease");
        match self.backend.extend(&self.name, token, self.config.timeout).await {
            Ok(true) => true,
            Ok(false) => {
                error!(name = %self.name, "lease extension rejected; cancelling owning context");
                self.mark_lost();
                false
            }
            Err(err) => {
                error!(name = %self.name, error = %err, "lease extension failed; cancelling owning context");
                self.mark_lost();
                false
            }
        }
    }

    /// One-way transition to `Lost`. The stale token is dropped so a later
    /// release never writes it back to the backend.
    fn mark_lost(&self) {
        {
            let mut holder = self.holder.lock();
            holder.state = LockState::Lost;
            holder.token = None;
        }
        self.guard.cancel();
    }
}

async fn renew_tick(inner: Weak<LockInner>) -> bool {
    match inner.upgrade() {
        Some(inner) => inner.renew().await,
        None => false,
    }
}

/// Releases the lease from a spawned task when a scope unwinds without
/// reaching the normal exit path.
struct ReleaseOnDrop {
    inner: Option<Arc<LockInner>>,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.guard.exit();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(err) = inner.release().await {
                        warn!(error = %err, "deferred release after scope unwind failed");
                    }
                });
            } else {
                warn!("scope unwound outside a runtime; lease will expire on its own");
            }
        }
    }
}
