//! Background proactive refresh.
//!
//! A single timer task asks the lifecycle manager on every tick whether a
//! refresh is due. Each start bumps a generation counter; a loop that wakes up
//! and finds a newer generation exits without touching the credentials.

use crate::config::RefreshConfig;
use crate::lifecycle::LifecycleManager;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct RefreshScheduler {
    lifecycle: LifecycleManager,
    interval: Duration,
    generation: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn new(lifecycle: LifecycleManager, interval: Duration) -> Self {
        Self {
            lifecycle,
            interval,
            generation: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
        }
    }

    pub fn from_config(lifecycle: LifecycleManager, config: &RefreshConfig) -> Self {
        Self::new(
            lifecycle,
            Duration::from_secs(config.scheduler_interval_secs),
        )
    }

    /// Starts the timer. Returns false if it was already running.
    ///
    /// The first check runs immediately. Must be called within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut handle = self.handle_guard();
        if handle.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Refresh scheduler already running");
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&self.generation);
        let lifecycle = self.lifecycle.clone();
        let period = self.interval;

        *handle = Some(tokio::spawn(async move {
            run_loop(lifecycle, period, generation, current).await;
        }));

        info!(
            interval_secs = period.as_secs(),
            generation,
            "Refresh scheduler started"
        );
        true
    }

    /// Stops the timer. Stopping a stopped scheduler is a no-op returning false.
    pub fn stop(&self) -> bool {
        let Some(task) = self.handle_guard().take() else {
            return false;
        };

        self.generation.fetch_add(1, Ordering::SeqCst);
        task.abort();
        info!("Refresh scheduler stopped");
        true
    }

    pub fn restart(&self) {
        self.stop();
        self.start();
    }

    pub fn is_running(&self) -> bool {
        self.handle_guard()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn handle_guard(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.handle_guard().take() {
            task.abort();
        }
    }
}

async fn run_loop(
    lifecycle: LifecycleManager,
    period: Duration,
    generation: u64,
    current: Arc<AtomicU64>,
) {
    let mut timer = time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        timer.tick().await;

        if current.load(Ordering::SeqCst) != generation {
            debug!(generation, "Refresh scheduler superseded, exiting");
            return;
        }

        match lifecycle.refresh_if_due().await {
            Ok(Some(reason)) => info!(reason = %reason, "Scheduled token refresh complete"),
            Ok(None) => debug!("No token refresh due"),
            Err(e) if e.requires_reauth() => {
                warn!(error = %e, "Scheduled refresh needs re-authentication")
            }
            Err(e) => warn!(error = %e, "Scheduled refresh failed, will retry next tick"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{grant, record, Harness, T0};

    const TICK: Duration = Duration::from_secs(600);

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_idempotent() {
        let h = Harness::new();
        let scheduler = RefreshScheduler::new(h.manager.clone(), TICK);

        assert!(!scheduler.is_running());
        assert!(!scheduler.stop());

        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.is_running());

        assert!(scheduler.stop());
        assert!(!scheduler.stop());
        assert!(!scheduler.is_running());

        assert!(scheduler.start());
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_refreshes_expired_token_once() {
        let h = Harness::new();
        h.seed(&record("T1", Some("R1"), T0 + 3600, T0));
        h.endpoint.push_refresh(Ok(grant("T2", None, 3600)));
        h.clock.set(T0 + 3700);

        let scheduler = RefreshScheduler::new(h.manager.clone(), TICK);
        scheduler.start();

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.endpoint.refresh_calls(), 1);
        assert_eq!(h.stored().unwrap().access_token.as_deref(), Some("T2"));

        // Fresh token: later ticks have nothing to do
        time::sleep(TICK * 3).await;
        assert_eq!(h.endpoint.refresh_calls(), 1);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_scheduler_never_fires() {
        let h = Harness::new();
        h.seed(&record("T1", Some("R1"), T0 + 10, T0));
        h.clock.set(T0 + 20);

        let scheduler = RefreshScheduler::new(h.manager.clone(), TICK);
        scheduler.start();
        scheduler.stop();

        time::sleep(TICK * 3).await;
        assert_eq!(h.endpoint.refresh_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_next_tick() {
        let h = Harness::new();
        h.seed(&record("T1", Some("R1"), T0 + 10, T0));
        h.clock.set(T0 + 20);
        // Script is empty: the first attempt gets a 503
        let scheduler = RefreshScheduler::new(h.manager.clone(), TICK);
        scheduler.start();

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.endpoint.refresh_calls(), 1);

        h.endpoint.push_refresh(Ok(grant("T2", None, 3600)));
        time::sleep(TICK).await;
        assert_eq!(h.endpoint.refresh_calls(), 2);
        assert_eq!(h.manager.get_access_token().as_deref(), Some("T2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_single_loop() {
        let h = Harness::new();
        h.seed(&record("T1", Some("R1"), T0 + 10, T0));
        h.clock.set(T0 + 20);

        let scheduler = RefreshScheduler::new(h.manager.clone(), TICK);
        scheduler.start();
        scheduler.restart();
        scheduler.restart();
        assert!(scheduler.is_running());

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.endpoint.refresh_calls(), 1);
    }
}
