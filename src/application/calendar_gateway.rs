use crate::application::calendar_setup::DefaultCalendarInitializer;
use crate::application::oauth::CredentialManager;
use crate::domain::models::{ReminderSpec, Role, Task};
use crate::infrastructure::config::CalendarSettings;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::{decode_correlation, encode_task_event, GoogleCalendarEvent};
use crate::infrastructure::google_calendar_client::CalendarProviderClient;
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Hands out per-user calendar sessions when usable credentials exist.
pub struct CalendarGateway {
    credentials: Arc<CredentialManager>,
    client: Arc<dyn CalendarProviderClient>,
    settings: CalendarSettings,
}

impl CalendarGateway {
    pub fn new(
        credentials: Arc<CredentialManager>,
        client: Arc<dyn CalendarProviderClient>,
        settings: CalendarSettings,
    ) -> Self {
        Self {
            credentials,
            client,
            settings,
        }
    }

    pub fn has_integration(&self, user_id: &str) -> Result<bool, InfraError> {
        self.credentials.has_integration(user_id)
    }

    /// `Ok(None)` when the user has no usable credential. Refresh failures caused by
    /// the network propagate as `Transient`.
    pub async fn session(&self, user_id: &str) -> Result<Option<CalendarSession>, InfraError> {
        let Some(token) = self
            .credentials
            .ensure_access_token(user_id)
            .await?
            .into_token()
        else {
            debug!(user_id, "no calendar session available");
            return Ok(None);
        };

        Ok(Some(CalendarSession {
            user_id: user_id.to_string(),
            access_token: token.access_token,
            client: Arc::clone(&self.client),
            credentials: Arc::clone(&self.credentials),
            settings: self.settings.clone(),
            calendar_id: OnceCell::new(),
        }))
    }
}

/// Authorized view of one user's calendar. The default calendar is resolved on first
/// use and reused for the session's lifetime.
pub struct CalendarSession {
    user_id: String,
    access_token: String,
    client: Arc<dyn CalendarProviderClient>,
    credentials: Arc<CredentialManager>,
    settings: CalendarSettings,
    calendar_id: OnceCell<String>,
}

impl CalendarSession {
    pub async fn calendar_id(&self) -> Result<&str, InfraError> {
        let resolved = self
            .calendar_id
            .get_or_try_init(|| async {
                DefaultCalendarInitializer::new(
                    Arc::clone(&self.client),
                    self.settings.calendar_name.clone(),
                    self.settings.timezone.clone(),
                )
                .ensure_calendar(&self.access_token)
                .await
                .map(|result| result.calendar_id().to_string())
            })
            .await;
        self.guard(resolved).map(String::as_str)
    }

    /// Creates the event for `role`. `Ok(None)` when the task has no deadline.
    pub async fn create_event(
        &self,
        task: &Task,
        role: Role,
        reminders: &[ReminderSpec],
    ) -> Result<Option<String>, InfraError> {
        if task.deadline.is_none() {
            return Ok(None);
        }
        let event = self.encode(task, role, reminders)?;
        let calendar_id = self.calendar_id().await?;
        let created = self
            .client
            .create_event(&self.access_token, calendar_id, &event)
            .await;
        self.guard(created).map(Some)
    }

    /// Fetches a linked event. A 404 surfaces as `NotFound`; a rejected credential
    /// as `AuthRequired`, after the credential is dropped.
    pub async fn get_event(&self, event_id: &str) -> Result<GoogleCalendarEvent, InfraError> {
        let calendar_id = self.calendar_id().await?;
        let event = self
            .client
            .get_event(&self.access_token, calendar_id, event_id)
            .await;
        self.guard(event)
    }

    /// Looks up the event correlated with this task and role. Lookup failures are
    /// logged and reported as `None`.
    pub async fn find_event_for_task(&self, task: &Task, role: Role) -> Option<GoogleCalendarEvent> {
        let calendar_id = match self.calendar_id().await {
            Ok(calendar_id) => calendar_id,
            Err(error) => {
                warn!(task_id = %task.id, user_id = %self.user_id, %error, "calendar lookup unavailable");
                return None;
            }
        };
        let found = self
            .client
            .find_events_by_correlation(&self.access_token, calendar_id, &task.id, role)
            .await;
        match self.guard(found) {
            Ok(events) => events.into_iter().find(|event| {
                decode_correlation(event)
                    .is_some_and(|tag| tag.task_id == task.id && tag.role == role)
                    && event.id.as_deref().is_some_and(|id| !id.trim().is_empty())
            }),
            Err(error) => {
                warn!(task_id = %task.id, user_id = %self.user_id, %error, "correlated event lookup failed");
                None
            }
        }
    }

    /// Pushes the current task state to the linked event.
    ///
    /// Fails with `NotFound` when no event is linked or the provider lost it, so the
    /// caller can create instead.
    pub async fn update_event(
        &self,
        task: &Task,
        role: Role,
        reminders: &[ReminderSpec],
    ) -> Result<bool, InfraError> {
        let Some(event_id) = task.linkage(role).active_event_id() else {
            return Err(InfraError::NotFound(format!(
                "task {} has no {} event",
                task.id,
                role.as_str()
            )));
        };
        if task.deadline.is_none() {
            return Ok(false);
        }
        let mut event = self.encode(task, role, reminders)?;
        event.id = Some(event_id.to_string());
        let calendar_id = self.calendar_id().await?;
        let updated = self
            .client
            .update_event(&self.access_token, calendar_id, event_id, &event)
            .await;
        self.guard(updated).map(|()| true)
    }

    /// Deletes the linked event. An event that is already gone counts as deleted;
    /// `Ok(false)` means nothing was linked.
    pub async fn delete_event(&self, task: &Task, role: Role) -> Result<bool, InfraError> {
        let Some(event_id) = task.linkage(role).active_event_id() else {
            return Ok(false);
        };
        let calendar_id = self.calendar_id().await?;
        let deleted = self
            .client
            .delete_event(&self.access_token, calendar_id, event_id)
            .await;
        match self.guard(deleted) {
            Ok(()) => Ok(true),
            Err(error) if error.is_not_found() => {
                debug!(task_id = %task.id, event_id, "event already gone");
                Ok(true)
            }
            Err(error) => Err(error),
        }
    }

    fn encode(
        &self,
        task: &Task,
        role: Role,
        reminders: &[ReminderSpec],
    ) -> Result<GoogleCalendarEvent, InfraError> {
        encode_task_event(
            task,
            role,
            reminders,
            Duration::minutes(i64::from(self.settings.event_duration_minutes)),
            self.settings.timezone.as_deref(),
        )
    }

    /// Drops the stored credential when the provider rejects it.
    fn guard<T>(&self, result: Result<T, InfraError>) -> Result<T, InfraError> {
        if let Err(InfraError::AuthRequired(message)) = &result {
            warn!(user_id = %self.user_id, error = %message, "calendar rejected credential; invalidating");
            if let Err(error) = self.credentials.invalidate(&self.user_id) {
                warn!(user_id = %self.user_id, %error, "failed to delete rejected credential");
            }
        }
        result
    }
}
