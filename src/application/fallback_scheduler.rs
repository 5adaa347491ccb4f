use crate::application::dispatcher::NotificationDispatcher;
use crate::application::NowProvider;
use crate::domain::models::{Notification, NotificationKey, NotificationStatus, ReminderSpec, Task};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::notification_repository::NotificationRepository;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackOutcome {
    pub created: usize,
    pub reactivated: usize,
    pub duplicates: usize,
    pub skipped_past: usize,
}

impl FallbackOutcome {
    pub fn scheduled(&self) -> usize {
        self.created + self.reactivated
    }
}

/// Turns reminder offsets into explicitly scheduled notifications for users
/// without a calendar.
pub struct FallbackScheduler {
    notifications: Arc<dyn NotificationRepository>,
    dispatcher: Arc<NotificationDispatcher>,
    time_zone: Option<Tz>,
    now_provider: NowProvider,
}

pub fn reminder_title(task: &Task) -> String {
    format!("Reminder: {}", task.title)
}

impl FallbackScheduler {
    pub fn new(notifications: Arc<dyn NotificationRepository>, dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self {
            notifications,
            dispatcher,
            time_zone: None,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_time_zone(mut self, time_zone: Option<&str>) -> Self {
        self.time_zone = time_zone.and_then(|name| name.parse::<Tz>().ok());
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    /// Idempotently schedules one notification per future reminder instant.
    ///
    /// Re-running never yields a second pending row for the same
    /// `(user, task, title, scheduled_for)`; terminal rows are reactivated.
    #[instrument(skip(self, task, reminders), fields(task_id = %task.id))]
    pub fn schedule_fallback_reminders(
        &self,
        task: &Task,
        reminders: &[ReminderSpec],
        target_user: &str,
    ) -> Result<FallbackOutcome, InfraError> {
        let mut outcome = FallbackOutcome::default();
        let Some(deadline) = task.deadline else {
            return Ok(outcome);
        };
        let now = (self.now_provider)();
        let title = reminder_title(task);

        let mut offsets: Vec<u32> = reminders
            .iter()
            .map(|reminder| reminder.minutes_before_deadline)
            .filter(|minutes| *minutes > 0)
            .collect();
        offsets.sort_unstable_by(|left, right| right.cmp(left));
        offsets.dedup();

        for minutes in offsets {
            let scheduled_for = ReminderSpec::popup(minutes).fire_at(deadline);
            if scheduled_for <= now {
                outcome.skipped_past += 1;
                continue;
            }

            let key = NotificationKey {
                user_id: target_user.to_string(),
                task_id: task.id.clone(),
                title: title.clone(),
                scheduled_for,
            };
            let to_dispatch = match self.notifications.find_by_key(&key)? {
                None => {
                    let notification = Notification::pending(
                        target_user,
                        Some(task.id.clone()),
                        self.dispatcher.fallback_channel(),
                        title.clone(),
                        self.message(task, deadline, minutes),
                        Some(scheduled_for),
                        now,
                    );
                    if self.notifications.insert(&notification)? {
                        outcome.created += 1;
                        Some(notification)
                    } else {
                        outcome.duplicates += 1;
                        None
                    }
                }
                Some(existing) if existing.status == NotificationStatus::Pending => {
                    outcome.duplicates += 1;
                    None
                }
                Some(existing) => {
                    if self.notifications.reactivate(&existing.id)? {
                        outcome.reactivated += 1;
                        self.notifications.get(&existing.id)?
                    } else {
                        outcome.duplicates += 1;
                        None
                    }
                }
            };

            if let Some(notification) = to_dispatch {
                if let Err(error) = self.dispatcher.schedule_delivery(&notification) {
                    // The periodic sweep still delivers it once due.
                    warn!(notification_id = %notification.id, %error, "failed to schedule fallback delivery");
                }
            }
        }

        if outcome.scheduled() > 0 {
            info!(
                user_id = target_user,
                created = outcome.created,
                reactivated = outcome.reactivated,
                "fallback reminders scheduled"
            );
        } else {
            debug!(user_id = target_user, ?outcome, "no fallback reminders scheduled");
        }
        Ok(outcome)
    }

    fn message(&self, task: &Task, deadline: DateTime<Utc>, minutes: u32) -> String {
        let due = match self.time_zone {
            Some(tz) => deadline.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z").to_string(),
            None => deadline.format("%Y-%m-%d %H:%M UTC").to_string(),
        };
        format!("\"{}\" is due {} (in {}).", task.title, due, describe_offset(minutes))
    }
}

fn describe_offset(minutes: u32) -> String {
    match minutes {
        m if m % 1440 == 0 => plural(m / 1440, "day"),
        m if m % 60 == 0 => plural(m / 60, "hour"),
        m => plural(m, "minute"),
    }
}

fn plural(count: u32, unit: &str) -> String {
    if count == 1 {
        format!("1 {unit}")
    } else {
        format!("{count} {unit}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::jobs::JobSpec;
    use crate::test_support::EngineHarness;
    use chrono::Duration;
    use proptest::prelude::*;

    fn task_due_in(harness: &EngineHarness, hours: i64) -> Task {
        let mut task = Task::new("tsk-1", "Grade essays", "teacher-a");
        task.deadline = Some(harness.clock.now() + Duration::hours(hours));
        task
    }

    fn specs(minutes: &[u32]) -> Vec<ReminderSpec> {
        minutes.iter().copied().map(ReminderSpec::popup).collect()
    }

    #[test]
    fn past_offsets_are_skipped_and_duplicates_collapse() {
        let harness = EngineHarness::new();
        let task = task_due_in(&harness, 2);

        let outcome = harness
            .fallback
            .schedule_fallback_reminders(&task, &specs(&[15, 30, 60, 1440, 30]), "teacher-a")
            .expect("schedule");

        assert_eq!(outcome.created, 3);
        assert_eq!(outcome.skipped_past, 1);
        let mut instants: Vec<_> = harness
            .all_notifications()
            .into_iter()
            .map(|row| row.scheduled_for.expect("scheduled"))
            .collect();
        instants.sort();
        let deadline = task.deadline.expect("deadline");
        assert_eq!(
            instants,
            vec![
                deadline - Duration::minutes(60),
                deadline - Duration::minutes(30),
                deadline - Duration::minutes(15),
            ]
        );
        assert_eq!(harness.scheduler.scheduled().len(), 3);
        assert!(harness
            .all_notifications()
            .iter()
            .all(|row| row.delivery_job_id.is_some() && row.title == "Reminder: Grade essays"));
    }

    #[test]
    fn rerun_is_idempotent_and_terminal_rows_are_reactivated() {
        let harness = EngineHarness::new();
        let task = task_due_in(&harness, 5);
        let reminders = specs(&[15, 60]);

        harness
            .fallback
            .schedule_fallback_reminders(&task, &reminders, "teacher-a")
            .expect("first run");
        let rerun = harness
            .fallback
            .schedule_fallback_reminders(&task, &reminders, "teacher-a")
            .expect("second run");
        assert_eq!(rerun.scheduled(), 0);
        assert_eq!(rerun.duplicates, 2);

        let first = harness.all_notifications().remove(0);
        harness
            .dispatcher
            .cancel(&first.id, "re-enabled", crate::application::dispatcher::CancelKind::Superseded)
            .expect("cancel");

        let third = harness
            .fallback
            .schedule_fallback_reminders(&task, &reminders, "teacher-a")
            .expect("third run");
        assert_eq!(third.reactivated, 1);
        let rows = harness.all_notifications();
        assert_eq!(rows.len(), 2);
        let reactivated = rows.iter().find(|row| row.id == first.id).expect("same row");
        assert_eq!(reactivated.status, NotificationStatus::Pending);
        assert_eq!(reactivated.last_error, None);
        assert!(reactivated.delivery_job_id.is_some());
    }

    #[test]
    fn task_without_deadline_schedules_nothing() {
        let harness = EngineHarness::new();
        let task = Task::new("tsk-1", "Undated", "teacher-a");
        let outcome = harness
            .fallback
            .schedule_fallback_reminders(&task, &specs(&[15]), "teacher-a")
            .expect("schedule");
        assert_eq!(outcome, FallbackOutcome::default());
    }

    #[test]
    fn deliveries_are_deferred_to_scheduled_instant() {
        let harness = EngineHarness::new();
        let task = task_due_in(&harness, 3);
        harness
            .fallback
            .schedule_fallback_reminders(&task, &specs(&[120]), "teacher-a")
            .expect("schedule");

        let scheduled = harness.scheduler.scheduled();
        let row = harness.all_notifications().remove(0);
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].2, row.scheduled_for);
        assert_eq!(
            scheduled[0].1,
            JobSpec::DeliverNotification {
                notification_id: row.id.clone(),
                attempt: 0,
            }
        );
        assert!(row.message.contains("in 2 hours"));
    }

    #[test]
    fn offsets_are_described_in_natural_units() {
        assert_eq!(describe_offset(15), "15 minutes");
        assert_eq!(describe_offset(60), "1 hour");
        assert_eq!(describe_offset(120), "2 hours");
        assert_eq!(describe_offset(1440), "1 day");
    }

    proptest! {
        #[test]
        fn scheduled_instants_are_deadline_minus_offset(
            offsets in prop::collection::vec(1u32..2000u32, 0..8),
            hours_ahead in 1i64..72i64,
        ) {
            let harness = EngineHarness::new();
            let task = task_due_in(&harness, hours_ahead);
            let deadline = task.deadline.expect("deadline");
            let now = harness.clock.now();

            let reminders = specs(&offsets);
            harness.fallback.schedule_fallback_reminders(&task, &reminders, "teacher-a").expect("first");
            harness.fallback.schedule_fallback_reminders(&task, &reminders, "teacher-a").expect("second");

            let mut expected: Vec<_> = offsets
                .iter()
                .map(|minutes| deadline - Duration::minutes(i64::from(*minutes)))
                .filter(|at| *at > now)
                .collect();
            expected.sort();
            expected.dedup();

            let mut actual: Vec<_> = harness
                .all_notifications()
                .into_iter()
                .map(|row| row.scheduled_for.expect("scheduled"))
                .collect();
            actual.sort();
            prop_assert_eq!(actual, expected);
        }
    }
}
