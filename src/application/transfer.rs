use crate::application::calendar_sync::CalendarSyncManager;
use crate::application::dispatcher::{CancelKind, NotificationDispatcher};
use crate::application::fallback_scheduler::FallbackScheduler;
use crate::application::jobs::{JobHandle, JobScheduler, JobSpec};
use crate::application::NowProvider;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::notification_repository::NotificationRepository;
use crate::infrastructure::task_repository::TaskRepository;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const REASON_RE_ENABLED: &str = "re-enabled";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectSummary {
    pub tasks_converted: usize,
    pub notifications_scheduled: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSummary {
    pub cancelled: usize,
    pub reconcile_job: JobHandle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub tasks_synced: usize,
    pub failures: usize,
}

/// Moves reminder delivery between calendar events and fallback notifications
/// when a user's calendar integration comes or goes.
pub struct TransferOrchestrator {
    tasks: Arc<dyn TaskRepository>,
    notifications: Arc<dyn NotificationRepository>,
    sync: Arc<CalendarSyncManager>,
    fallback: Arc<FallbackScheduler>,
    dispatcher: Arc<NotificationDispatcher>,
    scheduler: Arc<dyn JobScheduler>,
    now_provider: NowProvider,
}

impl TransferOrchestrator {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        notifications: Arc<dyn NotificationRepository>,
        sync: Arc<CalendarSyncManager>,
        fallback: Arc<FallbackScheduler>,
        dispatcher: Arc<NotificationDispatcher>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        Self {
            tasks,
            notifications,
            sync,
            fallback,
            dispatcher,
            scheduler,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    /// Converts the user's active calendar events on future tasks into fallback
    /// notifications and drops the event links. Running it twice is a no-op.
    #[instrument(skip(self))]
    pub fn on_disconnected(&self, user_id: &str) -> Result<DisconnectSummary, InfraError> {
        let now = (self.now_provider)();
        let mut summary = DisconnectSummary::default();

        for mut task in self.tasks.list_for_participant(user_id)? {
            if !task.has_future_deadline(now) {
                continue;
            }
            let mut converted = false;
            for role in task.roles_of(user_id) {
                if task.linkage(role).active_event_id().is_none() {
                    continue;
                }
                let reminders = task.linkage(role).reminders.clone();
                match self
                    .fallback
                    .schedule_fallback_reminders(&task, &reminders, user_id)
                {
                    Ok(outcome) => {
                        summary.notifications_scheduled += outcome.scheduled();
                        self.sync.detach_event(&mut task, role);
                        converted = true;
                    }
                    Err(error) => {
                        warn!(task_id = %task.id, user_id, role = role.as_str(), %error, "fallback conversion failed");
                        summary.failures += 1;
                    }
                }
            }
            if !converted {
                continue;
            }
            match self.sync.save(&task) {
                Ok(()) => summary.tasks_converted += 1,
                Err(error) => {
                    warn!(task_id = %task.id, user_id, %error, "failed to save detached task");
                    summary.failures += 1;
                }
            }
        }

        info!(
            user_id,
            tasks = summary.tasks_converted,
            scheduled = summary.notifications_scheduled,
            failures = summary.failures,
            "calendar disconnected; reminders moved to fallback"
        );
        Ok(summary)
    }

    /// Cancels the user's pending fallback notifications and queues a
    /// reconciliation job that restores calendar events out of band.
    #[instrument(skip(self))]
    pub fn on_connected(&self, user_id: &str) -> Result<ConnectSummary, InfraError> {
        let mut cancelled = 0;
        for notification in self.notifications.list_pending_reminders_for_user(user_id)? {
            match self
                .dispatcher
                .cancel(&notification.id, REASON_RE_ENABLED, CancelKind::Superseded)
            {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(notification_id = %notification.id, user_id, %error, "failed to cancel fallback notification");
                }
            }
        }

        let reconcile_job = self.scheduler.run_now(JobSpec::ReconcileUser {
            user_id: user_id.to_string(),
        })?;
        info!(user_id, cancelled, job_id = reconcile_job.id(), "calendar connected; reconciliation queued");
        Ok(ConnectSummary {
            cancelled,
            reconcile_job,
        })
    }

    /// Verifies or recreates the user's calendar events on every future task.
    #[instrument(skip(self))]
    pub async fn reconcile_user(&self, user_id: &str) -> Result<ReconcileSummary, InfraError> {
        let now = (self.now_provider)();
        let mut summary = ReconcileSummary::default();
        for task in self.tasks.list_for_participant(user_id)? {
            if !task.has_future_deadline(now) {
                continue;
            }
            match self.sync.sync_user_roles(&task.id, user_id).await {
                Ok(_) => summary.tasks_synced += 1,
                Err(error) => {
                    warn!(task_id = %task.id, user_id, %error, "reconciliation failed for task");
                    summary.failures += 1;
                }
            }
        }
        info!(user_id, synced = summary.tasks_synced, failures = summary.failures, "user reconciled");
        Ok(summary)
    }
}
