use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Creator,
    Assignee,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Creator, Role::Assignee];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creator => "creator",
            Self::Assignee => "assignee",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "creator" => Some(Self::Creator),
            "assignee" => Some(Self::Assignee),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReminderMethod {
    Popup,
    Email,
}

impl ReminderMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Popup => "popup",
            Self::Email => "email",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "popup" => Some(Self::Popup),
            "email" => Some(Self::Email),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReminderSpec {
    pub method: ReminderMethod,
    #[serde(rename = "minutes")]
    pub minutes_before_deadline: u32,
}

impl ReminderSpec {
    pub fn popup(minutes_before_deadline: u32) -> Self {
        Self {
            method: ReminderMethod::Popup,
            minutes_before_deadline,
        }
    }

    /// Instant at which this reminder fires for the given deadline.
    pub fn fire_at(&self, deadline: DateTime<Utc>) -> DateTime<Utc> {
        deadline - Duration::minutes(i64::from(self.minutes_before_deadline))
    }
}

/// Reminder list plus calendar linkage for one participant role of a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleLinkage {
    pub reminders: Vec<ReminderSpec>,
    pub event_id: Option<String>,
    pub event_active: bool,
}

impl RoleLinkage {
    pub fn attach_event(&mut self, event_id: impl Into<String>) {
        self.event_id = Some(event_id.into());
        self.event_active = true;
    }

    pub fn detach_event(&mut self) {
        self.event_id = None;
        self.event_active = false;
    }

    pub fn active_event_id(&self) -> Option<&str> {
        self.event_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub deadline: Option<DateTime<Utc>>,
    pub creator_id: String,
    pub assignee_id: Option<String>,
    pub creator: RoleLinkage,
    pub assignee: RoleLinkage,
    pub last_sync_error: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, creator_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            deadline: None,
            creator_id: creator_id.into(),
            assignee_id: None,
            creator: RoleLinkage::default(),
            assignee: RoleLinkage::default(),
            last_sync_error: None,
        }
    }

    pub fn linkage(&self, role: Role) -> &RoleLinkage {
        match role {
            Role::Creator => &self.creator,
            Role::Assignee => &self.assignee,
        }
    }

    pub fn linkage_mut(&mut self, role: Role) -> &mut RoleLinkage {
        match role {
            Role::Creator => &mut self.creator,
            Role::Assignee => &mut self.assignee,
        }
    }

    pub fn participant(&self, role: Role) -> Option<&str> {
        match role {
            Role::Creator => Some(self.creator_id.as_str()),
            Role::Assignee => self.assignee_id.as_deref(),
        }
        .map(str::trim)
        .filter(|value| !value.is_empty())
    }

    /// Roles the given user holds on this task.
    pub fn roles_of(&self, user_id: &str) -> Vec<Role> {
        Role::ALL
            .into_iter()
            .filter(|role| self.participant(*role) == Some(user_id))
            .collect()
    }

    pub fn has_future_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline > now)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Telegram,
    Email,
    System,
}

impl ChannelType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Email => "email",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "telegram" => Some(Self::Telegram),
            "email" => Some(Self::Email),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub task_id: Option<String>,
    pub channel: ChannelType,
    pub title: String,
    pub message: String,
    pub status: NotificationStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub delivery_job_id: Option<String>,
    pub attempts: u32,
    /// Earliest retry after a transient delivery failure.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn pending(
        user_id: impl Into<String>,
        task_id: Option<String>,
        channel: ChannelType,
        title: impl Into<String>,
        message: impl Into<String>,
        scheduled_for: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            task_id,
            channel,
            title: title.into(),
            message: message.into(),
            status: NotificationStatus::Pending,
            scheduled_for,
            sent_at: None,
            last_error: None,
            delivery_job_id: None,
            attempts: 0,
            next_attempt_at: None,
            created_at,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "notification.id")?;
        validate_non_empty(&self.user_id, "notification.user_id")?;
        validate_non_empty(&self.title, "notification.title")?;
        if self.status == NotificationStatus::Sent && self.sent_at.is_none() {
            return Err("notification.sent_at is required once sent".to_string());
        }
        Ok(())
    }

    /// True when the notification is not yet due at `now`.
    pub fn is_future(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.is_some_and(|at| at > now)
    }

    /// True while a scheduled retry has not come due.
    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_some_and(|at| at > now)
    }

    /// Fallback reminders carry a schedule; direct notices do not.
    pub fn is_reminder(&self) -> bool {
        self.scheduled_for.is_some()
    }
}

/// Idempotency key of a fallback reminder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NotificationKey {
    pub user_id: String,
    pub task_id: String,
    pub title: String,
    pub scheduled_for: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
    pub scope: Option<String>,
}

impl OAuthToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>, leeway_seconds: i64) -> bool {
        self.expires_at > now + Duration::seconds(leeway_seconds)
            && !self.access_token.trim().is_empty()
    }
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
