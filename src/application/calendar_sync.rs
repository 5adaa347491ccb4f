use crate::application::calendar_gateway::{CalendarGateway, CalendarSession};
use crate::application::dispatcher::{CancelKind, NotificationDispatcher};
use crate::application::fallback_scheduler::{FallbackOutcome, FallbackScheduler};
use crate::domain::models::{ReminderSpec, Role, RoleLinkage, Task};
use crate::domain::reminders::{normalize_permissive, normalize_specs, ReminderPolicy};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::task_repository::TaskRepository;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const REASON_DEADLINE_REMOVED: &str = "Deadline removed";
pub const REASON_DEADLINE_CHANGED: &str = "Deadline changed";
pub const REASON_ASSIGNEE_CHANGED: &str = "Assignee changed";
pub const REASON_ASSIGNEE_CHANGED_NO_CALENDAR: &str =
    "Assignee changed and no calendar integration; fallback disabled";
pub const REASON_CALENDAR_EVENT_CREATED: &str = "Calendar event created";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleSyncOutcome {
    NoParticipant,
    NoDeadline,
    Updated(String),
    /// Stored link was stale; an existing correlated event was adopted.
    Reattached(String),
    Created(String),
    Fallback(FallbackOutcome),
    /// No calendar and no reminders: nothing to deliver.
    NothingToSchedule,
    Failed,
}

/// `Verify` confirms a linked event exists before pushing changes to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncMode {
    Refresh,
    Verify,
}

enum EventSync {
    Linked(RoleSyncOutcome),
    NotCreated,
    /// The existing event could not be refreshed but still reminds the user.
    UpdateFailed(InfraError),
}

/// Keeps calendar events and fallback notifications in line with task state.
///
/// Reminder-side failures never fail the call; they are collected into the
/// task's `last_sync_error`. Only loading or saving the task can error.
pub struct CalendarSyncManager {
    tasks: Arc<dyn TaskRepository>,
    gateway: Arc<CalendarGateway>,
    fallback: Arc<FallbackScheduler>,
    dispatcher: Arc<NotificationDispatcher>,
    policy: ReminderPolicy,
}

impl CalendarSyncManager {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        gateway: Arc<CalendarGateway>,
        fallback: Arc<FallbackScheduler>,
        dispatcher: Arc<NotificationDispatcher>,
        policy: ReminderPolicy,
    ) -> Self {
        Self {
            tasks,
            gateway,
            fallback,
            dispatcher,
            policy,
        }
    }

    pub fn load_task(&self, task_id: &str) -> Result<Task, InfraError> {
        self.tasks
            .get(task_id)?
            .ok_or_else(|| InfraError::NotFound(format!("task {task_id}")))
    }

    /// Syncs every participant role of the task.
    #[instrument(skip(self))]
    pub async fn sync_task(&self, task_id: &str) -> Result<Task, InfraError> {
        let mut task = self.load_task(task_id)?;
        let mut errors = Vec::new();
        if task.deadline.is_none() {
            self.remove_deadline(&mut task, &mut errors).await;
        } else {
            for role in Role::ALL {
                self.sync_role(&mut task, role, &mut errors).await;
            }
        }
        self.finish(task, errors)
    }

    /// Verifies or recreates the events of the roles `user_id` holds on the task.
    pub async fn sync_user_roles(&self, task_id: &str, user_id: &str) -> Result<Task, InfraError> {
        let mut task = self.load_task(task_id)?;
        let mut errors = Vec::new();
        for role in task.roles_of(user_id) {
            self.sync_role_with(&mut task, role, SyncMode::Verify, &mut errors)
                .await;
        }
        self.finish(task, errors)
    }

    #[instrument(skip(self))]
    pub async fn on_deadline_changed(
        &self,
        task_id: &str,
        previous_deadline: Option<DateTime<Utc>>,
    ) -> Result<Task, InfraError> {
        let mut task = self.load_task(task_id)?;
        let mut errors = Vec::new();

        match (previous_deadline, task.deadline) {
            (_, None) => self.remove_deadline(&mut task, &mut errors).await,
            (Some(previous), Some(current)) if previous != current => {
                for role in Role::ALL {
                    let Some(user_id) = task.participant(role).map(ToOwned::to_owned) else {
                        continue;
                    };
                    if !self.is_integrated(&user_id) {
                        self.cancel_pending(
                            &user_id,
                            &task.id,
                            REASON_DEADLINE_CHANGED,
                            CancelKind::Revoked,
                            &mut errors,
                        );
                    }
                }
                for role in Role::ALL {
                    self.sync_role(&mut task, role, &mut errors).await;
                }
            }
            _ => {
                for role in Role::ALL {
                    self.sync_role(&mut task, role, &mut errors).await;
                }
            }
        }
        self.finish(task, errors)
    }

    /// Handles a committed assignee change.
    ///
    /// Fallback reminders of the previous assignee are not transferred; the new
    /// assignee only gets reminders when `assignee_reminders` is supplied.
    #[instrument(skip(self, assignee_reminders))]
    pub async fn on_assignee_changed(
        &self,
        task_id: &str,
        previous_assignee: Option<&str>,
        assignee_reminders: Option<&[Value]>,
    ) -> Result<Task, InfraError> {
        let mut task = self.load_task(task_id)?;
        let mut errors = Vec::new();
        let previous_assignee = previous_assignee
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let current_assignee = task.participant(Role::Assignee).map(ToOwned::to_owned);

        if previous_assignee == current_assignee.as_deref() {
            debug!(task_id, "assignee unchanged; resyncing");
            self.sync_role(&mut task, Role::Assignee, &mut errors).await;
            return self.finish(task, errors);
        }

        if let Some(previous) = previous_assignee {
            self.release_previous_assignee(&task, previous, &mut errors).await;
        }

        let reminders = assignee_reminders
            .map(|raw| normalize_permissive(raw, &self.policy, false))
            .transpose()
            .unwrap_or_else(|error| {
                errors.push(format!("assignee reminders rejected: {error}"));
                None
            })
            .unwrap_or_default();
        task.assignee = RoleLinkage {
            reminders,
            event_id: None,
            event_active: false,
        };

        if let Some(assignee) = current_assignee.as_deref() {
            let message = format!("You have been assigned \"{}\".", task.title);
            if let Err(error) =
                self.dispatcher
                    .notify_now(assignee, Some(&task.id), "New task assigned", &message)
            {
                warn!(task_id, user_id = assignee, %error, "failed to notify new assignee");
                errors.push(format!("new assignee notification failed: {error}"));
            }
            if task.deadline.is_some() {
                self.sync_role(&mut task, Role::Assignee, &mut errors).await;
            }
        }
        self.finish(task, errors)
    }

    /// Detaches `role` from its calendar event without touching the provider.
    pub fn detach_event(&self, task: &mut Task, role: Role) {
        task.linkage_mut(role).detach_event();
    }

    pub fn save(&self, task: &Task) -> Result<(), InfraError> {
        self.tasks.save(task)
    }

    async fn release_previous_assignee(&self, task: &Task, previous: &str, errors: &mut Vec<String>) {
        if !self.is_integrated(previous) {
            self.cancel_pending(
                previous,
                &task.id,
                REASON_ASSIGNEE_CHANGED_NO_CALENDAR,
                CancelKind::Revoked,
                errors,
            );
            return;
        }

        match self.gateway.session(previous).await {
            Ok(Some(session)) => {
                if let Err(error) = session.delete_event(task, Role::Assignee).await {
                    warn!(task_id = %task.id, user_id = previous, %error, "failed to delete previous assignee event");
                    errors.push(format!("previous assignee event delete failed: {error}"));
                }
            }
            Ok(None) => {}
            Err(error) => errors.push(format!("previous assignee calendar unavailable: {error}")),
        }
        self.cancel_pending(previous, &task.id, REASON_ASSIGNEE_CHANGED, CancelKind::Revoked, errors);
    }

    async fn remove_deadline(&self, task: &mut Task, errors: &mut Vec<String>) {
        for role in Role::ALL {
            let user_id = task.participant(role).map(ToOwned::to_owned);
            if task.linkage(role).event_id.is_some() {
                match user_id.as_deref() {
                    Some(user_id) => self.release_event(task, role, user_id, errors).await,
                    None => task.linkage_mut(role).detach_event(),
                }
            }
            if let Some(user_id) = user_id {
                self.cancel_pending(&user_id, &task.id, REASON_DEADLINE_REMOVED, CancelKind::Revoked, errors);
            }
        }
    }

    /// Deletes the role's event if the user's calendar is reachable, then drops the
    /// link. A failed delete keeps the link so the next sync retries it.
    async fn release_event(&self, task: &mut Task, role: Role, user_id: &str, errors: &mut Vec<String>) {
        if !self.is_integrated(user_id) || task.linkage(role).active_event_id().is_none() {
            task.linkage_mut(role).detach_event();
            return;
        }
        match self.gateway.session(user_id).await {
            Ok(Some(session)) => match session.delete_event(task, role).await {
                Ok(_) => task.linkage_mut(role).detach_event(),
                Err(error) => {
                    warn!(task_id = %task.id, user_id, %error, "failed to delete event for removed deadline");
                    errors.push(format!("{} event delete failed: {error}", role.as_str()));
                }
            },
            Ok(None) => task.linkage_mut(role).detach_event(),
            Err(error) => errors.push(format!("{} calendar unavailable: {error}", role.as_str())),
        }
    }

    /// Syncs one role: update or reconcile the calendar event, or fall back to
    /// scheduled notifications when no calendar can take the reminders.
    pub async fn sync_role(&self, task: &mut Task, role: Role, errors: &mut Vec<String>) -> RoleSyncOutcome {
        self.sync_role_with(task, role, SyncMode::Refresh, errors).await
    }

    #[instrument(skip(self, task, role, errors), fields(task_id = %task.id, role = role.as_str()))]
    async fn sync_role_with(
        &self,
        task: &mut Task,
        role: Role,
        mode: SyncMode,
        errors: &mut Vec<String>,
    ) -> RoleSyncOutcome {
        let Some(user_id) = task.participant(role).map(ToOwned::to_owned) else {
            return RoleSyncOutcome::NoParticipant;
        };
        if task.deadline.is_none() {
            return RoleSyncOutcome::NoDeadline;
        }

        let reminders = match normalize_specs(&task.linkage(role).reminders, &self.policy, false) {
            Ok(reminders) => reminders,
            Err(error) => {
                errors.push(format!("{} reminders invalid: {error}", role.as_str()));
                Vec::new()
            }
        };
        task.linkage_mut(role).reminders = reminders.clone();

        let session = match self.gateway.session(&user_id).await {
            Ok(session) => session,
            Err(error) => {
                warn!(user_id, %error, "calendar session unavailable");
                errors.push(format!("{} calendar unavailable: {error}", role.as_str()));
                None
            }
        };

        if let Some(session) = session {
            match self.sync_event(&session, task, role, &reminders, mode).await {
                Ok(EventSync::Linked(outcome)) => {
                    self.cancel_pending(
                        &user_id,
                        &task.id,
                        REASON_CALENDAR_EVENT_CREATED,
                        CancelKind::Superseded,
                        errors,
                    );
                    return outcome;
                }
                Ok(EventSync::UpdateFailed(error)) => {
                    warn!(user_id, %error, "calendar event update failed");
                    errors.push(format!("{} event update failed: {error}", role.as_str()));
                    return RoleSyncOutcome::Failed;
                }
                Ok(EventSync::NotCreated) => {}
                Err(error) => {
                    warn!(user_id, %error, "calendar event sync failed; using fallback");
                    errors.push(format!("{} calendar sync failed: {error}", role.as_str()));
                    if matches!(error, InfraError::AuthRequired(_)) {
                        task.linkage_mut(role).detach_event();
                    }
                }
            }
        }

        if reminders.is_empty() {
            return RoleSyncOutcome::NothingToSchedule;
        }
        match self
            .fallback
            .schedule_fallback_reminders(task, &reminders, &user_id)
        {
            Ok(outcome) => RoleSyncOutcome::Fallback(outcome),
            Err(error) => {
                warn!(user_id, %error, "fallback scheduling failed");
                errors.push(format!("{} fallback failed: {error}", role.as_str()));
                RoleSyncOutcome::Failed
            }
        }
    }

    async fn sync_event(
        &self,
        session: &CalendarSession,
        task: &mut Task,
        role: Role,
        reminders: &[ReminderSpec],
        mode: SyncMode,
    ) -> Result<EventSync, InfraError> {
        if mode == SyncMode::Verify {
            if let Some(event_id) = task.linkage(role).active_event_id().map(ToOwned::to_owned) {
                match session.get_event(&event_id).await {
                    Ok(_) => {}
                    Err(error) if error.is_not_found() => {
                        info!(task_id = %task.id, event_id, "linked event missing on provider; reconciling");
                        task.linkage_mut(role).detach_event();
                    }
                    Err(error @ InfraError::AuthRequired(_)) => return Err(error),
                    Err(error) => return Ok(EventSync::UpdateFailed(error)),
                }
            }
        }

        if let Some(event_id) = task.linkage(role).active_event_id().map(ToOwned::to_owned) {
            match session.update_event(task, role, reminders).await {
                Ok(_) => return Ok(EventSync::Linked(RoleSyncOutcome::Updated(event_id))),
                Err(error) if error.is_not_found() => {
                    info!(task_id = %task.id, event_id, "linked event missing on provider; reconciling");
                    task.linkage_mut(role).detach_event();
                }
                Err(error @ InfraError::AuthRequired(_)) => return Err(error),
                Err(error) => return Ok(EventSync::UpdateFailed(error)),
            }
        }

        // Verify before recreate: a correlated event may survive a lost link.
        if let Some(found_id) = session
            .find_event_for_task(task, role)
            .await
            .and_then(|event| event.id)
        {
            task.linkage_mut(role).attach_event(found_id.clone());
            match session.update_event(task, role, reminders).await {
                Ok(_) => return Ok(EventSync::Linked(RoleSyncOutcome::Reattached(found_id))),
                Err(error) if error.is_not_found() => task.linkage_mut(role).detach_event(),
                Err(error @ InfraError::AuthRequired(_)) => return Err(error),
                Err(error) => return Ok(EventSync::UpdateFailed(error)),
            }
        }

        match session.create_event(task, role, reminders).await? {
            Some(event_id) => {
                task.linkage_mut(role).attach_event(event_id.clone());
                info!(task_id = %task.id, event_id, "calendar event created");
                Ok(EventSync::Linked(RoleSyncOutcome::Created(event_id)))
            }
            None => Ok(EventSync::NotCreated),
        }
    }

    fn cancel_pending(
        &self,
        user_id: &str,
        task_id: &str,
        reason: &str,
        kind: CancelKind,
        errors: &mut Vec<String>,
    ) {
        if let Err(error) = self
            .dispatcher
            .cancel_pending_reminders(user_id, task_id, reason, kind)
        {
            warn!(user_id, task_id, %error, "failed to cancel pending notifications");
            errors.push(format!("cancelling notifications failed: {error}"));
        }
    }

    fn is_integrated(&self, user_id: &str) -> bool {
        self.gateway.has_integration(user_id).unwrap_or_else(|error| {
            warn!(user_id, %error, "integration lookup failed; assuming none");
            false
        })
    }

    fn finish(&self, mut task: Task, errors: Vec<String>) -> Result<Task, InfraError> {
        task.last_sync_error = if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        };
        self.tasks.save(&task)?;
        Ok(task)
    }
}
