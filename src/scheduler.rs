use crate::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Invokes a callback on a fixed cadence anchored to absolute deadlines.
///
/// Each tick is due `interval` after the *previous due time*, never after
/// the previous completion time, so a slow or delayed tick does not shift
/// the cadence forward. At most one callback invocation is in flight: a
/// tick that overruns its slot delays the next one, which then fires
/// immediately, while the tick after that re-anchors to the original grid.
///
/// The callback's return value is only logged. Stopping the scheduler is
/// always driven by the callback's own side effects, which keeps the
/// scheduler policy-agnostic.
#[derive(Debug, Default)]
pub struct RenewalScheduler {
    armed: Mutex<Option<Ticker>>,
}

#[derive(Debug)]
struct Ticker {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl RenewalScheduler {
    pub fn new() -> Self {
        Self {
            armed: Mutex::new(None),
        }
    }

    /// Arms the scheduler: the first tick fires `initial_delay` after this
    /// call, each subsequent tick `interval` after the previous due time.
    ///
    /// # Errors
    ///
    /// `Error::SchedulerRunning` when the scheduler is already armed.
    pub fn start<C, F>(&self, interval: Duration, initial_delay: Duration, mut callback: C) -> Result<()>
    where
        C: FnMut() -> F + Send + 'static,
        F: Future<Output = bool> + Send + 'static,
    {
        let mut slot = self.armed.lock();
        if slot.as_ref().is_some_and(|ticker| !ticker.task.is_finished()) {
            return Err(Error::SchedulerRunning);
        }

        let token = CancellationToken::new();
        let tick_token = token.clone();
        let task = tokio::spawn(async move {
            let mut next_due = Instant::now() + initial_delay;
            loop {
                tokio::select! {
                    biased;
                    () = tick_token.cancelled() => break,
                    () = time::sleep_until(next_due) => {}
                }
                // A stop may have landed while the tick slept.
                if tick_token.is_cancelled() {
                    break;
                }
                // Anchor the following due time before the callback runs, so
                // callback latency never accumulates into the cadence.
                next_due += interval;
                let renewed = callback().await;
                debug!(renewed, "renewal tick completed");
            }
        });

        *slot = Some(Ticker { token, task });
        Ok(())
    }

    /// Disarms the scheduler and waits for the tick task to wind down: no
    /// invocation starts after this returns. A no-op when the scheduler is
    /// not running.
    ///
    /// An invocation already in flight is aborted at its next suspension
    /// point, including one parked on a lock the caller currently holds.
    /// Called from inside the callback it is stopping (self-stop), the tick
    /// task is the caller itself and is disarmed without the join.
    pub async fn stop(&self) {
        let Some(ticker) = self.armed.lock().take() else {
            return;
        };
        debug!("stopping renewal scheduler");
        ticker.token.cancel();
        ticker.task.abort();
        if tokio::task::try_id() == Some(ticker.task.id()) {
            return;
        }
        let _ = ticker.task.await;
    }

    pub fn is_running(&self) -> bool {
        self.armed
            .lock()
            .as_ref()
            .is_some_and(|ticker| !ticker.task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn record_times() -> (Arc<Mutex<Vec<Duration>>>, Instant) {
        (Arc::new(Mutex::new(Vec::new())), Instant::now())
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_anchor_to_absolute_deadlines() {
        let scheduler = RenewalScheduler::new();
        let (times, start) = record_times();

        let recorded = times.clone();
        scheduler
            .start(ms(50), ms(50), move || {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().push(Instant::now().duration_since(start));
                    // Tick latency must not push later due times forward.
                    sleep(ms(30)).await;
                    true
                }
            })
            .unwrap();

        sleep(ms(170)).await;
        scheduler.stop().await;

        assert_eq!(*times.lock(), vec![ms(50), ms(100), ms(150)]);
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_tick_delays_next_but_keeps_the_grid() {
        let scheduler = RenewalScheduler::new();
        let (times, start) = record_times();
        let calls = Arc::new(AtomicUsize::new(0));

        let recorded = times.clone();
        let counter = calls.clone();
        scheduler
            .start(ms(50), ms(50), move || {
                let recorded = recorded.clone();
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    recorded.lock().push(Instant::now().duration_since(start));
                    if call == 0 {
                        // Overrun past the next due time (100ms).
                        sleep(ms(80)).await;
                    }
                    true
                }
            })
            .unwrap();

        sleep(ms(170)).await;
        scheduler.stop().await;

        // The tick due at 100ms waits for the overrunning one and fires at
        // 130ms; the tick after it re-anchors to the original 150ms slot.
        assert_eq!(*times.lock(), vec![ms(50), ms(130), ms(150)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_from_inside_the_callback_does_not_deadlock() {
        let scheduler = Arc::new(RenewalScheduler::new());
        let ticks = Arc::new(AtomicUsize::new(0));

        let inner = scheduler.clone();
        let counter = ticks.clone();
        scheduler
            .start(ms(10), ms(10), move || {
                let inner = inner.clone();
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    inner.stop().await;
                    false
                }
            })
            .unwrap();

        sleep(ms(100)).await;

        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn starting_twice_is_rejected_but_restart_after_stop_works() {
        let scheduler = RenewalScheduler::new();
        scheduler.start(ms(10), ms(10), || async { true }).unwrap();
        assert!(matches!(
            scheduler.start(ms(10), ms(10), || async { true }),
            Err(Error::SchedulerRunning)
        ));

        scheduler.stop().await;
        scheduler.stop().await; // no-op on a disarmed scheduler

        scheduler.start(ms(10), ms(10), || async { true }).unwrap();
        assert!(scheduler.is_running());
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_tick_fires_before_the_initial_delay() {
        let scheduler = RenewalScheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        scheduler
            .start(ms(50), ms(50), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }
            })
            .unwrap();

        sleep(ms(49)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        sleep(ms(2)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_invocation_starts_after_stop_returns() {
        let scheduler = RenewalScheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        scheduler
            .start(ms(50), ms(50), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }
            })
            .unwrap();

        // Stop exactly when a tick comes due. Whether that tick got in or
        // not, the count observed when stop returns is final.
        sleep(ms(50)).await;
        scheduler.stop().await;
        let settled = ticks.load(Ordering::SeqCst);

        sleep(ms(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), settled);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_aborts_an_invocation_in_flight() {
        let scheduler = RenewalScheduler::new();
        let entered = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicBool::new(false));

        let enter_counter = entered.clone();
        let completion = completed.clone();
        scheduler
            .start(ms(10), ms(10), move || {
                let enter_counter = enter_counter.clone();
                let completion = completion.clone();
                async move {
                    enter_counter.fetch_add(1, Ordering::SeqCst);
                    sleep(ms(1000)).await;
                    completion.store(true, Ordering::SeqCst);
                    true
                }
            })
            .unwrap();

        // The first tick enters at 10ms and parks in its sleep.
        sleep(ms(15)).await;
        assert_eq!(entered.load(Ordering::SeqCst), 1);

        scheduler.stop().await;
        assert!(!scheduler.is_running());

        // The in-flight invocation was cut off at its suspension point and
        // no later tick ever enters.
        sleep(ms(2000)).await;
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        assert!(!completed.load(Ordering::SeqCst));
    }
}
