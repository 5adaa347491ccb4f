//! Deferred job scheduling and the worker loop that executes jobs.
//!
//! Jobs are at-least-once: a job may run after its subject was cancelled or
//! run twice, so every runner re-reads state and acts idempotently.

use crate::application::NowProvider;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    DeliverNotification { notification_id: String, attempt: u32 },
    ReconcileUser { user_id: String },
}

impl JobSpec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeliverNotification { .. } => "deliver_notification",
            Self::ReconcileUser { .. } => "reconcile_user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub handle: JobHandle,
    pub spec: JobSpec,
}

/// Fire-and-continue scheduling. `revoke` is best-effort: a job that already
/// started keeps running.
pub trait JobScheduler: Send + Sync {
    fn schedule_at(&self, job: JobSpec, eta: DateTime<Utc>) -> Result<JobHandle, InfraError>;
    fn run_now(&self, job: JobSpec) -> Result<JobHandle, InfraError>;
    fn revoke(&self, handle: &JobHandle) -> Result<(), InfraError>;
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, job: JobSpec) -> Result<(), InfraError>;
    /// Safety net for lost deferred jobs; returns how many jobs were re-run.
    async fn sweep(&self) -> Result<usize, InfraError>;
}

/// Sleeps in a tokio task per job and forwards due jobs into a queue.
pub struct TokioJobScheduler {
    sender: mpsc::UnboundedSender<ScheduledJob>,
    timers: Arc<Mutex<HashMap<String, AbortHandle>>>,
    now_provider: NowProvider,
}

impl TokioJobScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScheduledJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                timers: Arc::new(Mutex::new(HashMap::new())),
                now_provider: Arc::new(Utc::now),
            },
            receiver,
        )
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn lock_timers(
        timers: &Mutex<HashMap<String, AbortHandle>>,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, AbortHandle>>, InfraError> {
        timers
            .lock()
            .map_err(|error| InfraError::Scheduler(format!("timer table lock poisoned: {error}")))
    }

    pub fn pending_timers(&self) -> Result<usize, InfraError> {
        Ok(Self::lock_timers(&self.timers)?.len())
    }
}

impl JobScheduler for TokioJobScheduler {
    fn schedule_at(&self, job: JobSpec, eta: DateTime<Utc>) -> Result<JobHandle, InfraError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| InfraError::Scheduler(format!("no tokio runtime: {error}")))?;
        let handle = JobHandle::new(uuid::Uuid::new_v4().to_string());
        let delay = (eta - (self.now_provider)()).to_std().unwrap_or(Duration::ZERO);

        let sender = self.sender.clone();
        let timers = Arc::clone(&self.timers);
        let scheduled = ScheduledJob {
            handle: handle.clone(),
            spec: job,
        };

        // The timer task removes itself under the same lock, so it cannot run
        // ahead of the insert below.
        let mut guard = Self::lock_timers(&self.timers)?;
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut timers) = timers.lock() {
                timers.remove(scheduled.handle.id());
            }
            let job_id = scheduled.handle.id().to_string();
            if sender.send(scheduled).is_err() {
                warn!(job_id, "job queue closed before deferred job fired");
            }
        });
        guard.insert(handle.id().to_string(), timer.abort_handle());
        debug!(job_id = handle.id(), delay_secs = delay.as_secs(), "deferred job scheduled");
        Ok(handle)
    }

    fn run_now(&self, job: JobSpec) -> Result<JobHandle, InfraError> {
        let handle = JobHandle::new(uuid::Uuid::new_v4().to_string());
        self.sender
            .send(ScheduledJob {
                handle: handle.clone(),
                spec: job,
            })
            .map_err(|_| InfraError::Scheduler("job queue closed".to_string()))?;
        Ok(handle)
    }

    fn revoke(&self, handle: &JobHandle) -> Result<(), InfraError> {
        if let Some(timer) = Self::lock_timers(&self.timers)?.remove(handle.id()) {
            timer.abort();
        }
        Ok(())
    }
}

/// Records scheduling calls instead of running them.
#[derive(Debug, Default)]
pub struct InMemoryJobScheduler {
    scheduled: Mutex<Vec<(JobHandle, JobSpec, Option<DateTime<Utc>>)>>,
    revoked: Mutex<Vec<JobHandle>>,
    fail_revoke: std::sync::atomic::AtomicBool,
}

impl InMemoryJobScheduler {
    fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>, InfraError> {
        mutex
            .lock()
            .map_err(|error| InfraError::Scheduler(format!("in-memory scheduler lock poisoned: {error}")))
    }

    pub fn scheduled(&self) -> Vec<(JobHandle, JobSpec, Option<DateTime<Utc>>)> {
        Self::lock(&self.scheduled)
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn revoked(&self) -> Vec<JobHandle> {
        Self::lock(&self.revoked)
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn set_fail_revoke(&self, fail: bool) {
        self.fail_revoke
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn record(&self, job: JobSpec, eta: Option<DateTime<Utc>>) -> Result<JobHandle, InfraError> {
        let mut scheduled = Self::lock(&self.scheduled)?;
        let handle = JobHandle::new(format!("job-{}", scheduled.len() + 1));
        scheduled.push((handle.clone(), job, eta));
        Ok(handle)
    }
}

impl JobScheduler for InMemoryJobScheduler {
    fn schedule_at(&self, job: JobSpec, eta: DateTime<Utc>) -> Result<JobHandle, InfraError> {
        self.record(job, Some(eta))
    }

    fn run_now(&self, job: JobSpec) -> Result<JobHandle, InfraError> {
        self.record(job, None)
    }

    fn revoke(&self, handle: &JobHandle) -> Result<(), InfraError> {
        if self.fail_revoke.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(InfraError::Scheduler(format!("cannot revoke {}", handle.id())));
        }
        Self::lock(&self.revoked)?.push(handle.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    pub sweep_interval: Duration,
    /// Upper bound for a single job or sweep.
    pub job_timeout: Duration,
    pub join_timeout: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            job_timeout: Duration::from_secs(120),
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Drains the job queue and runs the periodic sweep until stopped.
pub struct JobWorker {
    runner: Arc<dyn JobRunner>,
    receiver: Option<mpsc::UnboundedReceiver<ScheduledJob>>,
    config: JobWorkerConfig,
    cancellation: CancellationToken,
    task_handle: Option<JoinHandle<mpsc::UnboundedReceiver<ScheduledJob>>>,
}

impl JobWorker {
    pub fn new(
        runner: Arc<dyn JobRunner>,
        receiver: mpsc::UnboundedReceiver<ScheduledJob>,
        config: JobWorkerConfig,
    ) -> Self {
        Self {
            runner,
            receiver: Some(receiver),
            config,
            cancellation: CancellationToken::new(),
            task_handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.is_some()
    }

    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<(), InfraError> {
        if self.is_running() {
            return Err(InfraError::Scheduler("worker already running".to_string()));
        }
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| InfraError::Scheduler("job queue unavailable".to_string()))?;

        self.cancellation = CancellationToken::new();
        let runner = Arc::clone(&self.runner);
        let config = self.config.clone();
        let cancel = self.cancellation.clone();
        self.task_handle = Some(tokio::spawn(Self::run_loop(runner, receiver, config, cancel)));
        info!("job worker started");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<(), InfraError> {
        let Some(handle) = self.task_handle.take() else {
            return Err(InfraError::Scheduler("worker not running".to_string()));
        };
        self.cancellation.cancel();

        match tokio::time::timeout(self.config.join_timeout, handle).await {
            Ok(Ok(receiver)) => {
                self.receiver = Some(receiver);
                info!("job worker stopped");
                Ok(())
            }
            Ok(Err(error)) => Err(InfraError::Scheduler(format!("worker task panicked: {error}"))),
            Err(_) => Err(InfraError::Scheduler(
                "worker task did not finish within timeout".to_string(),
            )),
        }
    }

    async fn run_loop(
        runner: Arc<dyn JobRunner>,
        mut receiver: mpsc::UnboundedReceiver<ScheduledJob>,
        config: JobWorkerConfig,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<ScheduledJob> {
        let mut sweep = tokio::time::interval(config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("job worker loop cancelled");
                    break;
                }
                received = receiver.recv() => {
                    let Some(job) = received else {
                        debug!("job queue closed");
                        break;
                    };
                    let runner = Arc::clone(&runner);
                    let timeout = config.job_timeout;
                    in_flight.spawn(async move {
                        let job_id = job.handle.id().to_string();
                        let name = job.spec.name();
                        match tokio::time::timeout(timeout, runner.run_job(job.spec)).await {
                            Ok(Ok(())) => debug!(job_id, job = name, "job finished"),
                            Ok(Err(error)) => error!(job_id, job = name, %error, "job failed"),
                            Err(_) => warn!(job_id, job = name, timeout_secs = timeout.as_secs(), "job timed out"),
                        }
                    });
                }
                _ = sweep.tick() => {
                    match tokio::time::timeout(config.job_timeout, runner.sweep()).await {
                        Ok(Ok(count)) if count > 0 => info!(count, "sweep re-dispatched due notifications"),
                        Ok(Ok(_)) => debug!("sweep found nothing due"),
                        Ok(Err(error)) => error!(%error, "sweep failed"),
                        Err(_) => warn!("sweep timed out"),
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(error) = joined {
                        warn!(%error, "job task aborted");
                    }
                }
            }
        }

        in_flight.shutdown().await;
        receiver
    }
}
