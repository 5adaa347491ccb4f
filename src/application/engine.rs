use crate::application::calendar_gateway::CalendarGateway;
use crate::application::calendar_sync::CalendarSyncManager;
use crate::application::dispatcher::NotificationDispatcher;
use crate::application::jobs::{JobRunner, JobSpec};
use crate::application::transfer::TransferOrchestrator;
use crate::domain::events::DomainEvent;
use crate::domain::models::ReminderSpec;
use crate::domain::reminders::{normalize_permissive, normalize_strict, ReminderPolicy};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Entry point for the task-mutation layer and the job worker.
pub struct ReminderEngine {
    gateway: Arc<CalendarGateway>,
    sync: Arc<CalendarSyncManager>,
    transfer: Arc<TransferOrchestrator>,
    dispatcher: Arc<NotificationDispatcher>,
    policy: ReminderPolicy,
}

impl ReminderEngine {
    pub fn new(
        gateway: Arc<CalendarGateway>,
        sync: Arc<CalendarSyncManager>,
        transfer: Arc<TransferOrchestrator>,
        dispatcher: Arc<NotificationDispatcher>,
        policy: ReminderPolicy,
    ) -> Self {
        Self {
            gateway,
            sync,
            transfer,
            dispatcher,
            policy,
        }
    }

    /// Validates a reminder list before it is stored on a task.
    ///
    /// Users without a calendar get strict validation since their reminders
    /// become fallback notifications; calendar users get the permissive repair.
    pub fn validate_reminders(
        &self,
        user_id: &str,
        raw: &[Value],
        require_non_empty: bool,
    ) -> Result<Vec<ReminderSpec>, InfraError> {
        let specs = if self.gateway.has_integration(user_id)? {
            normalize_permissive(raw, &self.policy, require_non_empty)?
        } else {
            let specs = normalize_strict(raw, &self.policy)?;
            if require_non_empty && specs.is_empty() {
                return Err(crate::domain::reminders::ReminderError::Empty.into());
            }
            specs
        };
        Ok(specs)
    }

    /// Applies a committed task or integration change.
    ///
    /// Reminder-side failures are recorded on the task and never returned; only a
    /// missing task or a persistence failure surfaces.
    #[instrument(skip(self, event), fields(event = event.name()))]
    pub async fn handle_event(&self, event: DomainEvent) -> Result<(), InfraError> {
        match event {
            DomainEvent::TaskCreated { task_id } | DomainEvent::TaskUpdated { task_id } => {
                self.sync.sync_task(&task_id).await?;
            }
            DomainEvent::TaskDeadlineChanged {
                task_id,
                previous_deadline,
            } => {
                self.sync
                    .on_deadline_changed(&task_id, previous_deadline)
                    .await?;
            }
            DomainEvent::TaskAssigneeChanged {
                task_id,
                previous_assignee,
                assignee_reminders,
            } => {
                self.sync
                    .on_assignee_changed(
                        &task_id,
                        previous_assignee.as_deref(),
                        assignee_reminders.as_deref(),
                    )
                    .await?;
            }
            DomainEvent::IntegrationConnected { user_id } => {
                self.transfer.on_connected(&user_id)?;
            }
            DomainEvent::IntegrationDisconnected { user_id } => {
                self.transfer.on_disconnected(&user_id)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobRunner for ReminderEngine {
    async fn run_job(&self, job: JobSpec) -> Result<(), InfraError> {
        match job {
            JobSpec::DeliverNotification {
                notification_id,
                attempt,
            } => {
                let outcome = self.dispatcher.deliver(&notification_id, attempt).await?;
                debug!(notification_id, ?outcome, "delivery job finished");
            }
            JobSpec::ReconcileUser { user_id } => {
                let summary = self.transfer.reconcile_user(&user_id).await?;
                info!(user_id, synced = summary.tasks_synced, "reconcile job finished");
            }
        }
        Ok(())
    }

    async fn sweep(&self) -> Result<usize, InfraError> {
        self.dispatcher.sweep().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{NotificationStatus, ReminderSpec, Task};
    use crate::infrastructure::task_repository::TaskRepository;
    use crate::test_support::EngineHarness;
    use chrono::Duration;
    use serde_json::json;

    fn seed(harness: &EngineHarness) -> Task {
        let mut task = Task::new("tsk-1", "Submit grades", "teacher-a");
        task.deadline = Some(harness.clock.now() + Duration::hours(2));
        task.creator.reminders = vec![ReminderSpec::popup(30)];
        harness.tasks.save(&task).expect("save");
        task
    }

    #[test]
    fn strict_validation_without_calendar_rejects_bad_entries() {
        let harness = EngineHarness::new();
        let raw = vec![json!({"method": "email", "minutes": 30})];

        let error = harness
            .engine
            .validate_reminders("teacher-a", &raw, false)
            .expect_err("email rejected without calendar");
        assert!(matches!(error, InfraError::Validation(_)));

        harness.connect("teacher-a");
        let specs = harness
            .engine
            .validate_reminders("teacher-a", &raw, false)
            .expect("calendar users keep email reminders");
        assert_eq!(specs.len(), 1);
    }

    #[test]
    fn empty_list_is_rejected_when_required() {
        let harness = EngineHarness::new();
        assert!(harness.engine.validate_reminders("teacher-a", &[], true).is_err());
        assert_eq!(
            harness
                .engine
                .validate_reminders("teacher-a", &[], false)
                .expect("empty allowed"),
            Vec::new()
        );
    }

    #[tokio::test]
    async fn task_events_drive_sync_and_missing_task_surfaces() {
        let harness = EngineHarness::new();
        seed(&harness);

        harness
            .engine
            .handle_event(DomainEvent::TaskCreated {
                task_id: "tsk-1".to_string(),
            })
            .await
            .expect("created");
        assert_eq!(harness.pending_for("teacher-a").len(), 1);

        let error = harness
            .engine
            .handle_event(DomainEvent::TaskUpdated {
                task_id: "missing".to_string(),
            })
            .await
            .expect_err("unknown task");
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn reminder_failures_do_not_fail_the_event() {
        let harness = EngineHarness::new();
        harness.connect("teacher-a");
        harness
            .provider
            .fail("create_event", crate::test_support::FakeFailure::Provider);
        seed(&harness);

        harness
            .engine
            .handle_event(DomainEvent::TaskCreated {
                task_id: "tsk-1".to_string(),
            })
            .await
            .expect("event accepted");

        let task = harness.tasks.get("tsk-1").expect("load").expect("task");
        assert!(task.last_sync_error.is_some());
        assert_eq!(harness.pending_for("teacher-a").len(), 1);
    }

    #[tokio::test]
    async fn integration_events_route_to_transfer_and_jobs_run() {
        let harness = EngineHarness::new();
        seed(&harness);
        harness
            .engine
            .handle_event(DomainEvent::TaskCreated {
                task_id: "tsk-1".to_string(),
            })
            .await
            .expect("created");

        harness.connect("teacher-a");
        harness
            .engine
            .handle_event(DomainEvent::IntegrationConnected {
                user_id: "teacher-a".to_string(),
            })
            .await
            .expect("connected");
        assert!(harness
            .all_notifications()
            .iter()
            .all(|row| row.status == NotificationStatus::Cancelled));

        harness
            .engine
            .run_job(JobSpec::ReconcileUser {
                user_id: "teacher-a".to_string(),
            })
            .await
            .expect("reconcile job");
        assert_eq!(harness.provider.event_count(), 1);

        harness.disconnect("teacher-a");
        harness
            .engine
            .handle_event(DomainEvent::IntegrationDisconnected {
                user_id: "teacher-a".to_string(),
            })
            .await
            .expect("disconnected");
        assert_eq!(harness.pending_for("teacher-a").len(), 1);
    }

    #[tokio::test]
    async fn delivery_job_and_sweep_send_due_reminders() {
        let harness = EngineHarness::new();
        harness.register_telegram("teacher-a", "1001");
        seed(&harness);
        harness
            .engine
            .handle_event(DomainEvent::TaskCreated {
                task_id: "tsk-1".to_string(),
            })
            .await
            .expect("created");
        let row = harness.all_notifications().remove(0);

        harness
            .engine
            .run_job(JobSpec::DeliverNotification {
                notification_id: row.id.clone(),
                attempt: 0,
            })
            .await
            .expect("early job");
        assert_eq!(harness.notification(&row.id).status, NotificationStatus::Pending);

        harness.clock.advance(Duration::hours(2));
        assert_eq!(harness.engine.sweep().await.expect("sweep"), 1);
        assert_eq!(harness.notification(&row.id).status, NotificationStatus::Sent);
        assert_eq!(harness.channel.sent_to(), vec!["1001".to_string()]);
    }
}
