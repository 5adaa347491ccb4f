use crate::application::channels::{ChannelRegistry, DeliveryError};
use crate::application::jobs::{JobHandle, JobScheduler, JobSpec};
use crate::application::NowProvider;
use crate::domain::models::{ChannelType, Notification, NotificationStatus};
use crate::infrastructure::config::DeliveryPolicy;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::notification_repository::{NotificationRepository, StatusUpdate};
use crate::infrastructure::recipient_directory::RecipientDirectory;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const SWEEP_BATCH: usize = 200;

/// How a cancelled notification ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// Another mechanism took over reminding; ends `cancelled`.
    Superseded,
    /// The reminder is no longer valid; ends `failed`.
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Skipped,
    Sent,
    Failed(String),
    RetryScheduled { attempt: u32, delay_seconds: i64 },
}

pub struct NotificationDispatcher {
    notifications: Arc<dyn NotificationRepository>,
    recipients: Arc<dyn RecipientDirectory>,
    channels: ChannelRegistry,
    scheduler: Arc<dyn JobScheduler>,
    policy: DeliveryPolicy,
    now_provider: NowProvider,
}

impl NotificationDispatcher {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        recipients: Arc<dyn RecipientDirectory>,
        channels: ChannelRegistry,
        scheduler: Arc<dyn JobScheduler>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            notifications,
            recipients,
            channels,
            scheduler,
            policy,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn fallback_channel(&self) -> ChannelType {
        self.policy.fallback_channel
    }

    /// Defers delivery to `scheduled_for` (or runs it now) and stores the job id.
    pub fn schedule_delivery(&self, notification: &Notification) -> Result<JobHandle, InfraError> {
        self.schedule_attempt(notification, 0, notification.scheduled_for)
    }

    fn schedule_attempt(
        &self,
        notification: &Notification,
        attempt: u32,
        eta: Option<chrono::DateTime<Utc>>,
    ) -> Result<JobHandle, InfraError> {
        let job = JobSpec::DeliverNotification {
            notification_id: notification.id.clone(),
            attempt,
        };
        let handle = match eta {
            Some(eta) if eta > (self.now_provider)() => self.scheduler.schedule_at(job, eta)?,
            _ => self.scheduler.run_now(job)?,
        };
        self.notifications
            .set_delivery_job(&notification.id, Some(handle.id()))?;
        Ok(handle)
    }

    /// Creates and immediately dispatches a notification outside any reminder schedule.
    #[instrument(skip(self, message))]
    pub fn notify_now(
        &self,
        user_id: &str,
        task_id: Option<&str>,
        title: &str,
        message: &str,
    ) -> Result<Notification, InfraError> {
        let notification = Notification::pending(
            user_id,
            task_id.map(ToOwned::to_owned),
            self.policy.fallback_channel,
            title,
            message,
            None,
            (self.now_provider)(),
        );
        notification.validate().map_err(InfraError::Validation)?;
        self.notifications.insert(&notification)?;
        self.schedule_delivery(&notification)?;
        Ok(notification)
    }

    /// Attempts delivery once. Stale or early jobs are no-ops.
    #[instrument(skip(self))]
    pub async fn deliver(&self, notification_id: &str, attempt: u32) -> Result<DeliveryOutcome, InfraError> {
        let now = (self.now_provider)();
        let Some(notification) = self.notifications.get(notification_id)? else {
            debug!(notification_id, "notification vanished before delivery");
            return Ok(DeliveryOutcome::Skipped);
        };
        if notification.status != NotificationStatus::Pending {
            debug!(notification_id, status = notification.status.as_str(), "notification no longer pending");
            return Ok(DeliveryOutcome::Skipped);
        }
        if notification.is_future(now) {
            debug!(notification_id, "delivery job fired early; skipping");
            return Ok(DeliveryOutcome::Skipped);
        }
        if notification.is_backing_off(now) {
            debug!(notification_id, "retry backoff still running; skipping");
            return Ok(DeliveryOutcome::Skipped);
        }

        match self.send(&notification).await {
            Ok(()) => {
                self.notifications.transition(
                    notification_id,
                    NotificationStatus::Pending,
                    StatusUpdate::sent(now),
                )?;
                info!(notification_id, user_id = %notification.user_id, "notification sent");
                Ok(DeliveryOutcome::Sent)
            }
            Err(DeliveryError::Permanent(reason)) => {
                self.notifications.transition(
                    notification_id,
                    NotificationStatus::Pending,
                    StatusUpdate::failed(reason.clone()),
                )?;
                warn!(notification_id, %reason, "notification failed permanently");
                Ok(DeliveryOutcome::Failed(reason))
            }
            Err(DeliveryError::Transient(reason)) => self.retry_or_fail(&notification, attempt, reason),
        }
    }

    fn retry_or_fail(
        &self,
        notification: &Notification,
        attempt: u32,
        reason: String,
    ) -> Result<DeliveryOutcome, InfraError> {
        let attempts = attempt.saturating_add(1);
        let exhausted = attempts >= self.policy.max_attempts;
        let delay = Duration::from_std(self.policy.backoff(attempt))
            .map_err(|error| InfraError::Scheduler(format!("invalid backoff: {error}")))?;
        let eta = (self.now_provider)() + delay;
        if !self.notifications.record_attempt(
            &notification.id,
            attempts,
            &reason,
            (!exhausted).then_some(eta),
        )? {
            return Ok(DeliveryOutcome::Skipped);
        }

        if exhausted {
            let cause = format!("retries exhausted after {attempts} attempts: {reason}");
            self.notifications.transition(
                &notification.id,
                NotificationStatus::Pending,
                StatusUpdate::failed(cause.clone()),
            )?;
            warn!(notification_id = %notification.id, attempts, "giving up on notification");
            return Ok(DeliveryOutcome::Failed(cause));
        }

        self.schedule_attempt(notification, attempts, Some(eta))?;
        warn!(
            notification_id = %notification.id,
            attempt = attempts,
            delay_secs = delay.num_seconds(),
            %reason,
            "transient delivery failure; retry scheduled"
        );
        Ok(DeliveryOutcome::RetryScheduled {
            attempt: attempts,
            delay_seconds: delay.num_seconds(),
        })
    }

    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let channel = self.channels.get(notification.channel).ok_or_else(|| {
            DeliveryError::Permanent(format!("channel {} is not configured", notification.channel.as_str()))
        })?;

        let recipient = if channel.needs_recipient() {
            match self
                .recipients
                .external_id(&notification.user_id, notification.channel)
            {
                Ok(Some(recipient)) => recipient,
                Ok(None) => {
                    return Err(DeliveryError::Permanent(format!(
                        "recipient unreachable: user {} has no {} address",
                        notification.user_id,
                        notification.channel.as_str()
                    )));
                }
                Err(error) => return Err(DeliveryError::Transient(error.to_string())),
            }
        } else {
            notification.user_id.clone()
        };

        channel
            .send(&recipient, &notification.title, &notification.message)
            .await
    }

    /// Revokes the deferred job (best-effort) and ends the notification.
    #[instrument(skip(self))]
    pub fn cancel(&self, notification_id: &str, reason: &str, kind: CancelKind) -> Result<bool, InfraError> {
        let Some(notification) = self.notifications.get(notification_id)? else {
            return Ok(false);
        };
        if notification.status != NotificationStatus::Pending {
            return Ok(false);
        }

        if let Some(job_id) = notification.delivery_job_id.as_deref() {
            if let Err(error) = self.scheduler.revoke(&JobHandle::new(job_id)) {
                warn!(notification_id, job_id, %error, "failed to revoke delivery job");
            }
        }

        let update = match kind {
            CancelKind::Superseded => StatusUpdate::cancelled(reason),
            CancelKind::Revoked => StatusUpdate::failed(reason),
        };
        self.notifications
            .transition(notification_id, NotificationStatus::Pending, update)
    }

    /// Ends every pending fallback reminder of the user for the task; returns how
    /// many changed. Direct notices such as a new assignment are left to deliver.
    pub fn cancel_pending_reminders(
        &self,
        user_id: &str,
        task_id: &str,
        reason: &str,
        kind: CancelKind,
    ) -> Result<usize, InfraError> {
        let mut cancelled = 0;
        for notification in self.notifications.list_pending_reminders(user_id, task_id)? {
            if self.cancel(&notification.id, reason, kind)? {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(user_id, task_id, cancelled, reason, "pending reminders cancelled");
        }
        Ok(cancelled)
    }

    /// Delivers pending notifications that are due but whose job was lost. Rows
    /// waiting out a retry backoff are left to their retry job.
    pub async fn sweep(&self) -> Result<usize, InfraError> {
        let due = self
            .notifications
            .list_due((self.now_provider)(), SWEEP_BATCH)?;
        let mut delivered = 0;
        for notification in due {
            match self.deliver(&notification.id, notification.attempts).await {
                Ok(DeliveryOutcome::Skipped) => {}
                Ok(_) => delivered += 1,
                Err(error) => {
                    warn!(notification_id = %notification.id, %error, "sweep delivery failed");
                }
            }
        }
        Ok(delivered)
    }
}
