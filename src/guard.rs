use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tracks the execution context currently inside a lock's critical section
/// and cancels it when the lease is lost.
///
/// At most one context is recorded at a time; a new `enter` supersedes the
/// previous one. `cancel` takes the recorded token, so cancellation is
/// requested at most once per recorded scope, and a `cancel` racing a
/// normal `exit` resolves to no cancellation.
#[derive(Debug, Default)]
pub struct CancellationGuard {
    context: Mutex<Option<CancellationToken>>,
}

impl CancellationGuard {
    pub fn new() -> Self {
        Self {
            context: Mutex::new(None),
        }
    }

    /// Records `context` as the owning execution context.
    pub fn enter(&self, context: CancellationToken) {
        *self.context.lock() = Some(context);
    }

    /// Clears the recorded context; subsequent `cancel` calls are no-ops.
    pub fn exit(&self) {
        *self.context.lock() = None;
    }

    /// Cancels the recorded context, if any and not already cancelled.
    pub fn cancel(&self) {
        if let Some(context) = self.context.lock().take() {
            if !context.is_cancelled() {
                debug!("cancelling owning context");
                context.cancel();
            }
        }
    }

    pub fn is_entered(&self) -> bool {
        self.context.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_fires_once_per_recorded_context() {
        let guard = CancellationGuard::new();
        let context = CancellationToken::new();

        guard.enter(context.clone());
        guard.cancel();
        assert!(context.is_cancelled());
        assert!(!guard.is_entered());

        // Second cancel has nothing recorded and is a no-op.
        guard.cancel();
    }

    #[test]
    fn exit_prevents_cancellation() {
        let guard = CancellationGuard::new();
        let context = CancellationToken::new();

        guard.enter(context.clone());
        guard.exit();
        guard.cancel();

        assert!(!context.is_cancelled());
    }

    #[test]
    fn a_new_scope_supersedes_the_previous_one() {
        let guard = CancellationGuard::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        guard.enter(first.clone());
        guard.enter(second.clone());
        guard.cancel();

        assert!(!first.is_cancelled());
        assert!(second.is_cancelled());
    }
}
