use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};

use crate::engine::{CycleReport, PollEngine};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("poll scheduler failed: {0}")]
    Scheduler(#[from] JobSchedulerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Polling,
}

enum SchedulerSlot {
    Idle,
    Polling { scheduler: JobScheduler },
}

/// Drives [`PollEngine`] on a fixed interval. `start` and `stop` are
/// idempotent.
pub struct PollScheduler {
    engine: Arc<PollEngine>,
    interval: Duration,
    slot: Mutex<SchedulerSlot>,
}

impl PollScheduler {
    pub fn new(engine: Arc<PollEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            slot: Mutex::new(SchedulerSlot::Idle),
        }
    }

    pub fn engine(&self) -> &Arc<PollEngine> {
        &self.engine
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn state(&self) -> PollerState {
        match &*self.slot.lock().await {
            SchedulerSlot::Idle => PollerState::Idle,
            SchedulerSlot::Polling { .. } => PollerState::Polling,
        }
    }

    /// Runs one cycle right away and then one per interval. Returns
    /// `Ok(false)` when already polling.
    pub async fn start(&self) -> Result<bool, SchedulerError> {
        let mut slot = self.slot.lock().await;
        if matches!(*slot, SchedulerSlot::Polling { .. }) {
            info!("poller already running");
            return Ok(false);
        }

        let scheduler = JobScheduler::new().await?;
        let engine = Arc::clone(&self.engine);
        let job = Job::new_repeated_async(self.interval, move |_uuid, _lock| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                run_guarded(engine).await;
            })
        })?;
        scheduler.add(job).await?;
        scheduler.start().await?;

        tokio::spawn(run_guarded(Arc::clone(&self.engine)));
        *slot = SchedulerSlot::Polling { scheduler };
        info!(interval_secs = self.interval.as_secs(), "poller started");
        Ok(true)
    }

    /// Stops future ticks. A cycle already in flight runs to completion.
    /// Returns `Ok(false)` when already idle.
    pub async fn stop(&self) -> Result<bool, SchedulerError> {
        let mut slot = self.slot.lock().await;
        match std::mem::replace(&mut *slot, SchedulerSlot::Idle) {
            SchedulerSlot::Idle => {
                info!("poller already stopped");
                Ok(false)
            }
            SchedulerSlot::Polling { mut scheduler } => {
                scheduler.shutdown().await?;
                info!("poller stopped");
                Ok(true)
            }
        }
    }
}

/// Runs one non-overlapping cycle on its own task so a panic inside the
/// cycle is logged here and never reaches the scheduler.
pub async fn run_guarded(engine: Arc<PollEngine>) -> Option<CycleReport> {
    let handle = tokio::spawn(async move { engine.try_run_cycle().await });
    match handle.await {
        Ok(report) => report,
        Err(err) if err.is_panic() => {
            error!("poll cycle panicked: {err}");
            None
        }
        Err(err) => {
            warn!("poll cycle task cancelled: {err}");
            None
        }
    }
}
