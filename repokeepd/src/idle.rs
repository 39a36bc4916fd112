use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::task::{BackgroundTask, PeriodicWork, TickFlow};

struct IdleState {
    last_activity: Instant,
    /// Set by `IdleMonitor::stop`; an in-flight check that sees it must not fire
    done: bool,
    fires: u32,
}

/// Touched by every inbound call; fires the shutdown token once idle past the threshold.
pub struct IdleTracker {
    threshold: Duration,
    state: Mutex<IdleState>,
    shutdown: CancellationToken,
}

impl IdleTracker {
    /// A zero threshold disables idle shutdown.
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            state: Mutex::new(IdleState {
                last_activity: Instant::now(),
                done: false,
                fires: 0,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.threshold.is_zero()
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    fn lock(&self) -> MutexGuard<'_, IdleState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record activity now. Last-activity never moves backwards.
    pub fn touch(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        if now > state.last_activity {
            state.last_activity = now;
        }
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.lock().last_activity)
    }

    /// Cancelled once, when the idle threshold is reached.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[cfg(test)]
    pub fn fire_count(&self) -> u32 {
        self.lock().fires
    }

    fn mark_done(&self) {
        self.lock().done = true;
    }

    /// Compare idle time against the threshold under the same lock `touch` uses.
    fn check(&self) -> TickFlow {
        let mut state = self.lock();
        if state.done || state.fires > 0 {
            return TickFlow::Finish;
        }

        let idle = Instant::now().saturating_duration_since(state.last_activity);
        if idle < self.threshold {
            return TickFlow::Continue;
        }

        state.fires += 1;
        drop(state);

        info!("Idle for {:?} (threshold {:?}), requesting shutdown", idle, self.threshold);
        self.shutdown.cancel();
        TickFlow::Finish
    }
}

struct IdleCheck {
    tracker: Arc<IdleTracker>,
    interval: Duration,
}

#[async_trait]
impl PeriodicWork for IdleCheck {
    fn name(&self) -> &'static str {
        "idle-monitor"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) -> TickFlow {
        self.tracker.check()
    }
}

pub struct IdleMonitor {
    tracker: Arc<IdleTracker>,
    task: BackgroundTask<IdleCheck>,
}

impl IdleMonitor {
    pub fn new(tracker: Arc<IdleTracker>, check_interval: Duration) -> Self {
        let task = BackgroundTask::new(IdleCheck {
            tracker: Arc::clone(&tracker),
            interval: check_interval,
        });
        Self { tracker, task }
    }

    /// Arm the monitor. Never starts when idle shutdown is disabled.
    pub fn start(&self) {
        if !self.tracker.enabled() {
            debug!("Idle shutdown disabled");
            return;
        }
        info!("Idle shutdown after {:?} without calls", self.tracker.threshold());
        self.task.start();
    }

    /// Disarm and wait for the monitor to exit. A check racing with this call
    /// sees the done flag and exits without firing.
    pub async fn stop(&self) {
        self.tracker.mark_done();
        self.task.stop().await;
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    const THRESHOLD: Duration = Duration::from_secs(10);
    const INTERVAL: Duration = Duration::from_secs(3);

    #[tokio::test(start_paused = true)]
    async fn test_fires_within_one_interval_of_threshold() {
        let tracker = Arc::new(IdleTracker::new(THRESHOLD));
        let monitor = IdleMonitor::new(Arc::clone(&tracker), INTERVAL);

        let t0 = Instant::now();
        tracker.touch();
        monitor.start();

        tracker.shutdown_signal().cancelled().await;
        let fired_after = Instant::now() - t0;
        assert!(fired_after >= THRESHOLD, "fired early: {:?}", fired_after);
        assert!(fired_after < THRESHOLD + INTERVAL, "fired late: {:?}", fired_after);

        // Let plenty of further intervals pass before stopping
        time::sleep(INTERVAL * 10).await;
        assert_eq!(tracker.fire_count(), 1);
        assert!(!monitor.is_running());
        monitor.stop().await;
        assert_eq!(tracker.fire_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_firing() {
        let tracker = Arc::new(IdleTracker::new(THRESHOLD));
        let monitor = IdleMonitor::new(Arc::clone(&tracker), INTERVAL);
        monitor.start();

        time::sleep(Duration::from_secs(8)).await;
        let last = Instant::now();
        tracker.touch();

        tracker.shutdown_signal().cancelled().await;
        let fired_after = Instant::now() - last;
        assert!(fired_after >= THRESHOLD);
        assert!(fired_after < THRESHOLD + INTERVAL);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_monitor_never_starts() {
        let tracker = Arc::new(IdleTracker::new(Duration::ZERO));
        let monitor = IdleMonitor::new(Arc::clone(&tracker), INTERVAL);
        monitor.start();

        assert!(!tracker.enabled());
        assert!(!monitor.is_running());
        time::sleep(Duration::from_secs(3600)).await;
        assert!(!tracker.shutdown_signal().is_cancelled());
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_threshold_never_fires() {
        let tracker = Arc::new(IdleTracker::new(THRESHOLD));
        let monitor = IdleMonitor::new(Arc::clone(&tracker), INTERVAL);
        monitor.start();

        time::sleep(Duration::from_secs(5)).await;
        monitor.stop().await;
        time::sleep(Duration::from_secs(60)).await;

        assert!(!tracker.shutdown_signal().is_cancelled());
        assert_eq!(tracker.fire_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_check_does_not_fire() {
        let tracker = IdleTracker::new(THRESHOLD);
        time::sleep(THRESHOLD * 2).await;

        tracker.mark_done();
        assert_eq!(tracker.check(), TickFlow::Finish);
        assert_eq!(tracker.fire_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_is_monotonic() {
        let tracker = IdleTracker::new(THRESHOLD);
        time::sleep(Duration::from_secs(4)).await;
        tracker.touch();
        assert_eq!(tracker.idle_for(), Duration::ZERO);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(tracker.idle_for(), Duration::from_secs(2));
    }
}
