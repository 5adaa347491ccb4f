use crate::infrastructure::error::InfraError;
use crate::infrastructure::google_calendar_client::CalendarProviderClient;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureCalendarResult {
    LinkedExisting(String),
    Created(String),
}

impl EnsureCalendarResult {
    pub fn calendar_id(&self) -> &str {
        match self {
            Self::LinkedExisting(id) | Self::Created(id) => id,
        }
    }
}

/// Finds the task calendar by name, creating it when the account has none.
pub struct DefaultCalendarInitializer {
    calendar_client: Arc<dyn CalendarProviderClient>,
    calendar_name: String,
    time_zone: Option<String>,
}

impl DefaultCalendarInitializer {
    pub fn new(
        calendar_client: Arc<dyn CalendarProviderClient>,
        calendar_name: impl Into<String>,
        time_zone: Option<String>,
    ) -> Self {
        Self {
            calendar_client,
            calendar_name: calendar_name.into(),
            time_zone,
        }
    }

    pub async fn ensure_calendar(&self, access_token: &str) -> Result<EnsureCalendarResult, InfraError> {
        let calendar_name = self.calendar_name.trim();
        let calendars = self.calendar_client.list_calendars(access_token).await?;
        if let Some(existing) = calendars
            .into_iter()
            .find(|calendar| calendar.summary == calendar_name)
        {
            return Ok(EnsureCalendarResult::LinkedExisting(existing.id));
        }

        let created = self
            .calendar_client
            .create_calendar(access_token, calendar_name, self.time_zone.as_deref())
            .await?;
        info!(calendar_id = %created.id, calendar_name, "created task calendar");
        Ok(EnsureCalendarResult::Created(created.id))
    }
}
