//! Periodic and on-demand pass execution with single-flight passes and ordered shutdown.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use vacsync_core::AppConfig;

use crate::{PassSummary, PassTrigger, SyncError, SyncPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler cannot start while {0}")]
    InvalidState(SchedulerState),
    #[error("scheduler was shut down and its storage released")]
    Released,
    #[error("timer setup failed: {0}")]
    Timer(#[from] JobSchedulerError),
}

#[derive(Debug)]
pub enum TickOutcome {
    Completed(PassSummary),
    /// The pass failed; the error has been logged.
    Failed,
    /// Another pass held the lock.
    Skipped,
    /// The runner no longer accepts passes.
    Stopped,
}

/// Executes passes one at a time.
///
/// Ticks never wait: a tick that finds a pass in flight is skipped. On-demand passes queue
/// behind the running one. Once [`PassRunner::stop_accepting`] is called nothing new starts.
pub struct PassRunner {
    pipeline: SyncPipeline,
    pass_lock: Mutex<()>,
    accepting: AtomicBool,
}

impl PassRunner {
    pub fn new(pipeline: SyncPipeline) -> Self {
        Self {
            pipeline,
            pass_lock: Mutex::new(()),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn pipeline(&self) -> &SyncPipeline {
        &self.pipeline
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Runs a pass for a caller that needs its result, waiting for any pass in flight.
    pub async fn run_on_demand(&self) -> Result<PassSummary, SyncError> {
        if !self.is_accepting() {
            return Err(SyncError::Stopped);
        }
        let _guard = self.pass_lock.lock().await;
        if !self.is_accepting() {
            return Err(SyncError::Stopped);
        }
        self.pipeline.run_once(PassTrigger::OnDemand).await
    }

    /// Runs a timer-driven pass unless one is already executing. Failures are logged here.
    pub async fn run_tick(&self, trigger: PassTrigger) -> TickOutcome {
        if !self.is_accepting() {
            return TickOutcome::Stopped;
        }
        let Ok(_guard) = self.pass_lock.try_lock() else {
            warn!(trigger = trigger.as_str(), "previous sync pass still running, skipping tick");
            return TickOutcome::Skipped;
        };
        if !self.is_accepting() {
            return TickOutcome::Stopped;
        }
        match self.pipeline.run_once(trigger).await {
            Ok(summary) => TickOutcome::Completed(summary),
            Err(err) => {
                error!(trigger = trigger.as_str(), error = %err, "sync pass failed");
                TickOutcome::Failed
            }
        }
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Resolves once no pass is executing.
    pub async fn wait_idle(&self) {
        drop(self.pass_lock.lock().await);
    }
}

struct Lifecycle {
    state: SchedulerState,
    timer: Option<JobScheduler>,
}

/// Owns the periodic timer and the pass runner, and releases storage on stop.
pub struct SyncScheduler {
    runner: Arc<PassRunner>,
    interval: Duration,
    lifecycle: Mutex<Lifecycle>,
    released: AtomicBool,
}

impl SyncScheduler {
    pub fn new(pipeline: SyncPipeline, interval: Duration) -> Self {
        Self {
            runner: Arc::new(PassRunner::new(pipeline)),
            interval,
            lifecycle: Mutex::new(Lifecycle {
                state: SchedulerState::Stopped,
                timer: None,
            }),
            released: AtomicBool::new(false),
        }
    }

    pub fn from_config(pipeline: SyncPipeline, config: &AppConfig) -> Self {
        Self::new(pipeline, config.schedule_interval())
    }

    pub fn runner(&self) -> Arc<PassRunner> {
        Arc::clone(&self.runner)
    }

    pub async fn state(&self) -> SchedulerState {
        self.lifecycle.lock().await.state
    }

    /// Runs the startup pass, then arms the periodic timer.
    ///
    /// A failed startup pass is logged and the timer is armed anyway.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != SchedulerState::Stopped {
            return Err(SchedulerError::InvalidState(lifecycle.state));
        }
        if self.released.load(Ordering::SeqCst) {
            return Err(SchedulerError::Released);
        }
        lifecycle.state = SchedulerState::Starting;
        info!(interval_secs = self.interval.as_secs(), "starting sync scheduler");

        if let TickOutcome::Completed(summary) = self.runner.run_tick(PassTrigger::Startup).await {
            info!(created = summary.created, "startup sync pass finished");
        }

        let timer = match self.arm_timer().await {
            Ok(timer) => timer,
            Err(err) => {
                lifecycle.state = SchedulerState::Stopped;
                return Err(err.into());
            }
        };
        lifecycle.timer = Some(timer);
        lifecycle.state = SchedulerState::Running;
        info!("sync scheduler running");
        Ok(())
    }

    async fn arm_timer(&self) -> Result<JobScheduler, JobSchedulerError> {
        let timer = JobScheduler::new().await?;
        let runner = Arc::clone(&self.runner);
        let job = Job::new_repeated_async(self.interval, move |_uuid, _lock| {
            let runner = Arc::clone(&runner);
            Box::pin(async move {
                runner.run_tick(PassTrigger::Scheduled).await;
            })
        })?;
        timer.add(job).await?;
        timer.start().await?;
        Ok(timer)
    }

    /// On-demand pass for request handlers. Waits for a pass already in flight.
    pub async fn trigger(&self) -> Result<PassSummary, SyncError> {
        self.runner.run_on_demand().await
    }

    /// Cancels the timer, lets an in-flight pass finish, then releases storage exactly once.
    ///
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == SchedulerState::Stopped && self.released.load(Ordering::SeqCst) {
            return;
        }
        lifecycle.state = SchedulerState::Stopping;
        info!("stopping sync scheduler");

        self.runner.stop_accepting();
        if let Some(mut timer) = lifecycle.timer.take() {
            if let Err(err) = timer.shutdown().await {
                warn!(error = %err, "timer shutdown reported an error");
            }
        }
        self.runner.wait_idle().await;

        if !self.released.swap(true, Ordering::SeqCst) {
            self.runner.pipeline().store().close().await;
        }
        lifecycle.state = SchedulerState::Stopped;
        info!("sync scheduler stopped");
    }
}
