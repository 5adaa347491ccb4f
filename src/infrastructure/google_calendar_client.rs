use crate::domain::models::Role;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::{GoogleCalendarEvent, KEY_ROLE, KEY_TASK_ID};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use url::Url;

const CALENDAR_LIST_ENDPOINT: &str = "https://www.googleapis.com/calendar/v3/users/me/calendarList";
const CALENDAR_CREATE_ENDPOINT: &str = "https://www.googleapis.com/calendar/v3/calendars";
const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3/";
const CORRELATION_LOOKUP_LIMIT: &str = "5";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleCalendarSummary {
    pub id: String,
    pub summary: String,
}

/// Remote calendar operations. Errors follow the engine taxonomy:
/// `AuthRequired`, `NotFound`, `Transient` or `Provider`.
#[async_trait]
pub trait CalendarProviderClient: Send + Sync {
    async fn list_calendars(&self, access_token: &str) -> Result<Vec<GoogleCalendarSummary>, InfraError>;

    async fn create_calendar(
        &self,
        access_token: &str,
        summary: &str,
        time_zone: Option<&str>,
    ) -> Result<GoogleCalendarSummary, InfraError>;

    async fn get_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<GoogleCalendarEvent, InfraError>;

    /// Events tagged with the given task id and role.
    async fn find_events_by_correlation(
        &self,
        access_token: &str,
        calendar_id: &str,
        task_id: &str,
        role: Role,
    ) -> Result<Vec<GoogleCalendarEvent>, InfraError>;

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<String, InfraError>;

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<(), InfraError>;

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), InfraError>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestGoogleCalendarClient {
    client: Client,
}

/// Maps a non-success HTTP status onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str, context: &str) -> InfraError {
    let message = if body.trim().is_empty() {
        format!("{context}: http {}", status.as_u16())
    } else {
        format!("{context}: http {}; body={body}", status.as_u16())
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => InfraError::AuthRequired(message),
        StatusCode::NOT_FOUND | StatusCode::GONE => InfraError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => InfraError::Transient(message),
        status if status.is_server_error() => InfraError::Transient(message),
        _ => InfraError::Provider(message),
    }
}

impl ReqwestGoogleCalendarClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::Validation(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn events_endpoint(calendar_id: &str) -> Result<Url, InfraError> {
        let mut url = Url::parse(CALENDAR_API_BASE)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid calendar api base url: {error}")))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("calendar api base URL cannot be a base".to_string())
            })?;
            segments.push("calendars");
            segments.push(calendar_id);
            segments.push("events");
        }
        Ok(url)
    }

    fn event_endpoint(calendar_id: &str, event_id: &str) -> Result<Url, InfraError> {
        let mut url = Self::events_endpoint(calendar_id)?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("calendar events URL cannot be a base".to_string())
            })?;
            segments.push(event_id);
        }
        Ok(url)
    }

    /// Sends the request and returns the body of a 2xx answer.
    async fn execute(&self, request: RequestBuilder, context: &str) -> Result<String, InfraError> {
        let response = request
            .send()
            .await
            .map_err(|error| InfraError::Transient(format!("network error while {context}: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Transient(format!("failed reading response while {context}: {error}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &body, context));
        }
        Ok(body)
    }

    fn parse<T: serde::de::DeserializeOwned>(body: &str, context: &str) -> Result<T, InfraError> {
        serde_json::from_str(body).map_err(|error| {
            InfraError::Provider(format!("invalid payload while {context}: {error}; body={body}"))
        })
    }
}

#[derive(Debug, serde::Deserialize)]
struct CalendarListResponse {
    items: Option<Vec<CalendarListItem>>,
}

#[derive(Debug, serde::Deserialize)]
struct CalendarListItem {
    id: String,
    summary: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct CreateCalendarRequest<'a> {
    summary: &'a str,
    #[serde(rename = "timeZone", skip_serializing_if = "Option::is_none")]
    time_zone: Option<&'a str>,
}

#[derive(Debug, serde::Deserialize)]
struct CalendarResourceResponse {
    id: Option<String>,
    summary: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct EventsPageResponse {
    items: Option<Vec<GoogleCalendarEvent>>,
}

#[async_trait]
impl CalendarProviderClient for ReqwestGoogleCalendarClient {
    async fn list_calendars(&self, access_token: &str) -> Result<Vec<GoogleCalendarSummary>, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;

        let context = "listing calendars";
        let body = self
            .execute(
                self.client
                    .get(CALENDAR_LIST_ENDPOINT)
                    .query(&[("maxResults", 250)])
                    .bearer_auth(access_token),
                context,
            )
            .await?;
        let parsed: CalendarListResponse = Self::parse(&body, context)?;

        Ok(parsed
            .items
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| {
                let id = item.id.trim();
                if id.is_empty() {
                    return None;
                }
                let summary = item
                    .summary
                    .unwrap_or_else(|| id.to_string())
                    .trim()
                    .to_string();
                Some(GoogleCalendarSummary {
                    id: id.to_string(),
                    summary,
                })
            })
            .collect())
    }

    async fn create_calendar(
        &self,
        access_token: &str,
        summary: &str,
        time_zone: Option<&str>,
    ) -> Result<GoogleCalendarSummary, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(summary, "calendar summary")?;

        let summary = summary.trim();
        let request = CreateCalendarRequest {
            summary,
            time_zone: time_zone.map(str::trim).filter(|value| !value.is_empty()),
        };

        let context = "creating calendar";
        let body = self
            .execute(
                self.client
                    .post(CALENDAR_CREATE_ENDPOINT)
                    .bearer_auth(access_token)
                    .json(&request),
                context,
            )
            .await?;
        let parsed: CalendarResourceResponse = Self::parse(&body, context)?;

        let id = parsed
            .id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| InfraError::Provider("calendar create response did not include id".to_string()))?;
        let created_summary = parsed
            .summary
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| summary.to_string());

        Ok(GoogleCalendarSummary {
            id,
            summary: created_summary,
        })
    }

    async fn get_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<GoogleCalendarEvent, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let context = "fetching event";
        let endpoint = Self::event_endpoint(calendar_id, event_id)?;
        let body = self
            .execute(self.client.get(endpoint).bearer_auth(access_token), context)
            .await?;
        let event: GoogleCalendarEvent = Self::parse(&body, context)?;
        // Deleted events stay readable with status "cancelled".
        if event.is_cancelled() {
            return Err(InfraError::NotFound(format!("event {event_id} was cancelled")));
        }
        Ok(event)
    }

    async fn find_events_by_correlation(
        &self,
        access_token: &str,
        calendar_id: &str,
        task_id: &str,
        role: Role,
    ) -> Result<Vec<GoogleCalendarEvent>, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(task_id, "task id")?;

        let context = "searching correlated events";
        let endpoint = Self::events_endpoint(calendar_id)?;
        let body = self
            .execute(
                self.client
                    .get(endpoint)
                    .bearer_auth(access_token)
                    .query(&[
                        ("privateExtendedProperty", format!("{KEY_TASK_ID}={task_id}")),
                        ("privateExtendedProperty", format!("{KEY_ROLE}={}", role.as_str())),
                        ("maxResults", CORRELATION_LOOKUP_LIMIT.to_string()),
                    ]),
                context,
            )
            .await?;
        let parsed: EventsPageResponse = Self::parse(&body, context)?;
        Ok(parsed
            .items
            .unwrap_or_default()
            .into_iter()
            .filter(|event| !event.is_cancelled())
            .collect())
    }

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<String, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;

        let context = "creating event";
        let endpoint = Self::events_endpoint(calendar_id)?;
        let body = self
            .execute(
                self.client.post(endpoint).bearer_auth(access_token).json(event),
                context,
            )
            .await?;
        let parsed: GoogleCalendarEvent = Self::parse(&body, context)?;
        parsed
            .id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| InfraError::Provider("event create response did not include id".to_string()))
    }

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<(), InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let endpoint = Self::event_endpoint(calendar_id, event_id)?;
        self.execute(
            self.client.put(endpoint).bearer_auth(access_token).json(event),
            "updating event",
        )
        .await?;
        Ok(())
    }

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let endpoint = Self::event_endpoint(calendar_id, event_id)?;
        self.execute(self.client.delete(endpoint).bearer_auth(access_token), "deleting event")
            .await?;
        Ok(())
    }
}
