use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// What the run loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFlow {
    Continue,
    Finish,
}

/// One unit of periodic work driven by a [`BackgroundTask`].
#[async_trait]
pub trait PeriodicWork: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Wait before the first tick.
    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn interval(&self) -> Duration;

    async fn tick(&self) -> TickFlow;
}

enum TaskState {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Owns at most one run loop. A stopped task can not be started again.
pub struct BackgroundTask<W: PeriodicWork> {
    work: Arc<W>,
    cancel: CancellationToken,
    state: Mutex<TaskState>,
}

impl<W: PeriodicWork> BackgroundTask<W> {
    pub fn new(work: W) -> Self {
        Self {
            work: Arc::new(work),
            cancel: CancellationToken::new(),
            state: Mutex::new(TaskState::Idle),
        }
    }

    /// Spawn the run loop. Does nothing if it is already running or the task
    /// has been stopped.
    pub fn start(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !matches!(*state, TaskState::Idle) {
            debug!("{} already started", self.work.name());
            return;
        }

        let work = Arc::clone(&self.work);
        let cancel = self.cancel.clone();
        *state = TaskState::Running(tokio::spawn(run(work, cancel)));
        debug!("{} started", self.work.name());
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        match self.state.lock() {
            Ok(state) => matches!(&*state, TaskState::Running(handle) if !handle.is_finished()),
            Err(_) => false,
        }
    }

    /// Cancel the run loop and wait until it has exited. No work from this
    /// task runs after this returns. Safe to call repeatedly and from any task.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            match std::mem::replace(&mut *state, TaskState::Stopped) {
                TaskState::Running(handle) => Some(handle),
                TaskState::Idle | TaskState::Stopped => None,
            }
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("{} run loop ended abnormally: {}", self.work.name(), e);
            }
            debug!("{} stopped", self.work.name());
        }
    }
}

async fn run<W: PeriodicWork>(work: Arc<W>, cancel: CancellationToken) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        _ = time::sleep(work.initial_delay()) => {}
    }

    let mut ticker = time::interval(work.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if work.tick().await == TickFlow::Finish {
                    debug!("{} finished", work.name());
                    break;
                }
            }
        }
    }
}
