use crate::domain::models::{
    ChannelType, Notification, NotificationKey, NotificationStatus,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::{format_timestamp, parse_optional_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Terminal transition applied by [`NotificationRepository::transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: NotificationStatus,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn sent(at: DateTime<Utc>) -> Self {
        Self {
            status: NotificationStatus::Sent,
            last_error: None,
            sent_at: Some(at),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: NotificationStatus::Failed,
            last_error: Some(reason.into()),
            sent_at: None,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            status: NotificationStatus::Cancelled,
            last_error: Some(reason.into()),
            sent_at: None,
        }
    }
}

/// Row store for notifications. Every mutation is a single-row update guarded by the
/// row's current status; concurrent writers resolve by last write wins.
pub trait NotificationRepository: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Notification>, InfraError>;
    /// Returns `false` when a row with the same reminder key already exists.
    fn insert(&self, notification: &Notification) -> Result<bool, InfraError>;
    fn find_by_key(&self, key: &NotificationKey) -> Result<Option<Notification>, InfraError>;
    /// Pending fallback reminders of the user for the task. Direct notices are excluded.
    fn list_pending_reminders(&self, user_id: &str, task_id: &str) -> Result<Vec<Notification>, InfraError>;
    /// Pending fallback reminders of the user across all tasks.
    fn list_pending_reminders_for_user(&self, user_id: &str) -> Result<Vec<Notification>, InfraError>;
    /// Pending notifications whose `scheduled_for` is unset or not after `now`,
    /// skipping rows still inside a retry backoff.
    fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Notification>, InfraError>;
    /// Applies `update` only if the row is currently in `expected`.
    fn transition(
        &self,
        id: &str,
        expected: NotificationStatus,
        update: StatusUpdate,
    ) -> Result<bool, InfraError>;
    /// Moves a terminal row back to pending, clearing error, job handle and attempts.
    fn reactivate(&self, id: &str) -> Result<bool, InfraError>;
    /// Records a failed attempt on a pending row and when the next one may run.
    fn record_attempt(
        &self,
        id: &str,
        attempts: u32,
        last_error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<bool, InfraError>;
    fn set_delivery_job(&self, id: &str, job_id: Option<&str>) -> Result<(), InfraError>;
}

const NOTIFICATION_COLUMNS: &str = "id, user_id, task_id, channel, title, message, status, \
     scheduled_for, sent_at, last_error, delivery_job_id, attempts, next_attempt_at, created_at";

#[derive(Debug, Clone)]
pub struct SqliteNotificationRepository {
    db_path: PathBuf,
}

impl SqliteNotificationRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }

    fn query_many(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Notification>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(sql)?;
        let rows = statement
            .query_map(params, NotificationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(NotificationRow::into_notification).collect()
    }
}

struct NotificationRow {
    id: String,
    user_id: String,
    task_id: Option<String>,
    channel: String,
    title: String,
    message: String,
    status: String,
    scheduled_for: Option<String>,
    sent_at: Option<String>,
    last_error: Option<String>,
    delivery_job_id: Option<String>,
    attempts: u32,
    next_attempt_at: Option<String>,
    created_at: String,
}

impl NotificationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            task_id: row.get(2)?,
            channel: row.get(3)?,
            title: row.get(4)?,
            message: row.get(5)?,
            status: row.get(6)?,
            scheduled_for: row.get(7)?,
            sent_at: row.get(8)?,
            last_error: row.get(9)?,
            delivery_job_id: row.get(10)?,
            attempts: row.get(11)?,
            next_attempt_at: row.get(12)?,
            created_at: row.get(13)?,
        })
    }

    fn into_notification(self) -> Result<Notification, InfraError> {
        let channel = ChannelType::parse(&self.channel).ok_or_else(|| {
            InfraError::InvalidConfig(format!("invalid notifications.channel '{}'", self.channel))
        })?;
        let status = NotificationStatus::parse(&self.status).ok_or_else(|| {
            InfraError::InvalidConfig(format!("invalid notifications.status '{}'", self.status))
        })?;
        Ok(Notification {
            scheduled_for: parse_optional_timestamp(self.scheduled_for, "notifications.scheduled_for")?,
            sent_at: parse_optional_timestamp(self.sent_at, "notifications.sent_at")?,
            next_attempt_at: parse_optional_timestamp(
                self.next_attempt_at,
                "notifications.next_attempt_at",
            )?,
            created_at: parse_timestamp(&self.created_at, "notifications.created_at")?,
            id: self.id,
            user_id: self.user_id,
            task_id: self.task_id,
            channel,
            title: self.title,
            message: self.message,
            status,
            last_error: self.last_error,
            delivery_job_id: self.delivery_job_id,
            attempts: self.attempts,
        })
    }
}

impl NotificationRepository for SqliteNotificationRepository {
    fn get(&self, id: &str) -> Result<Option<Notification>, InfraError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
                params![id],
                NotificationRow::from_row,
            )
            .optional()?;
        row.map(NotificationRow::into_notification).transpose()
    }

    fn insert(&self, notification: &Notification) -> Result<bool, InfraError> {
        let connection = self.connect()?;
        let changed = connection.execute(
            "INSERT OR IGNORE INTO notifications (id, user_id, task_id, channel, title, message,
               status, scheduled_for, sent_at, last_error, delivery_job_id, attempts,
               next_attempt_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                notification.id,
                notification.user_id,
                notification.task_id,
                notification.channel.as_str(),
                notification.title,
                notification.message,
                notification.status.as_str(),
                notification.scheduled_for.map(format_timestamp),
                notification.sent_at.map(format_timestamp),
                notification.last_error,
                notification.delivery_job_id,
                notification.attempts,
                notification.next_attempt_at.map(format_timestamp),
                format_timestamp(notification.created_at),
            ],
        )?;
        Ok(changed == 1)
    }

    fn find_by_key(&self, key: &NotificationKey) -> Result<Option<Notification>, InfraError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                     WHERE user_id = ?1 AND task_id = ?2 AND title = ?3 AND scheduled_for = ?4"
                ),
                params![
                    key.user_id,
                    key.task_id,
                    key.title,
                    format_timestamp(key.scheduled_for)
                ],
                NotificationRow::from_row,
            )
            .optional()?;
        row.map(NotificationRow::into_notification).transpose()
    }

    fn list_pending_reminders(&self, user_id: &str, task_id: &str) -> Result<Vec<Notification>, InfraError> {
        self.query_many(
            &format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE user_id = ?1 AND task_id = ?2 AND status = 'pending'
                   AND scheduled_for IS NOT NULL
                 ORDER BY scheduled_for"
            ),
            params![user_id, task_id],
        )
    }

    fn list_pending_reminders_for_user(&self, user_id: &str) -> Result<Vec<Notification>, InfraError> {
        self.query_many(
            &format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE user_id = ?1 AND task_id IS NOT NULL AND status = 'pending'
                   AND scheduled_for IS NOT NULL
                 ORDER BY scheduled_for"
            ),
            params![user_id],
        )
    }

    fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Notification>, InfraError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query_many(
            &format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE status = 'pending' AND (scheduled_for IS NULL OR scheduled_for <= ?1)
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                 ORDER BY scheduled_for
                 LIMIT ?2"
            ),
            params![format_timestamp(now), limit],
        )
    }

    fn transition(
        &self,
        id: &str,
        expected: NotificationStatus,
        update: StatusUpdate,
    ) -> Result<bool, InfraError> {
        let connection = self.connect()?;
        let changed = connection.execute(
            "UPDATE notifications
             SET status = ?1, last_error = ?2, sent_at = COALESCE(?3, sent_at),
                 delivery_job_id = NULL, next_attempt_at = NULL
             WHERE id = ?4 AND status = ?5",
            params![
                update.status.as_str(),
                update.last_error,
                update.sent_at.map(format_timestamp),
                id,
                expected.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn reactivate(&self, id: &str) -> Result<bool, InfraError> {
        let connection = self.connect()?;
        let changed = connection.execute(
            "UPDATE notifications
             SET status = 'pending', last_error = NULL, delivery_job_id = NULL, sent_at = NULL,
                 attempts = 0, next_attempt_at = NULL
             WHERE id = ?1 AND status != 'pending'",
            params![id],
        )?;
        Ok(changed == 1)
    }

    fn record_attempt(
        &self,
        id: &str,
        attempts: u32,
        last_error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<bool, InfraError> {
        let connection = self.connect()?;
        let changed = connection.execute(
            "UPDATE notifications SET attempts = ?1, last_error = ?2, next_attempt_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            params![attempts, last_error, next_attempt_at.map(format_timestamp), id],
        )?;
        Ok(changed == 1)
    }

    fn set_delivery_job(&self, id: &str, job_id: Option<&str>) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "UPDATE notifications SET delivery_job_id = ?1 WHERE id = ?2",
            params![job_id, id],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryNotificationRepository {
    rows: Mutex<HashMap<String, Notification>>,
}

impl InMemoryNotificationRepository {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Notification>>, InfraError> {
        self.rows.lock().map_err(|error| {
            InfraError::InvalidConfig(format!("notification store lock poisoned: {error}"))
        })
    }

    pub fn all(&self) -> Result<Vec<Notification>, InfraError> {
        let mut rows: Vec<Notification> = self.lock()?.values().cloned().collect();
        rows.sort_by(|left, right| {
            left.scheduled_for
                .cmp(&right.scheduled_for)
                .then_with(|| left.created_at.cmp(&right.created_at))
        });
        Ok(rows)
    }

    fn filtered<F>(&self, predicate: F) -> Result<Vec<Notification>, InfraError>
    where
        F: Fn(&Notification) -> bool,
    {
        Ok(self.all()?.into_iter().filter(|row| predicate(row)).collect())
    }
}

fn matches_key(row: &Notification, key: &NotificationKey) -> bool {
    row.user_id == key.user_id
        && row.task_id.as_deref() == Some(key.task_id.as_str())
        && row.title == key.title
        && row.scheduled_for == Some(key.scheduled_for)
}

impl NotificationRepository for InMemoryNotificationRepository {
    fn get(&self, id: &str) -> Result<Option<Notification>, InfraError> {
        Ok(self.lock()?.get(id).cloned())
    }

    fn insert(&self, notification: &Notification) -> Result<bool, InfraError> {
        let mut rows = self.lock()?;
        let duplicate = match (&notification.task_id, notification.scheduled_for) {
            (Some(task_id), Some(scheduled_for)) => {
                let key = NotificationKey {
                    user_id: notification.user_id.clone(),
                    task_id: task_id.clone(),
                    title: notification.title.clone(),
                    scheduled_for,
                };
                rows.values().any(|row| matches_key(row, &key))
            }
            _ => false,
        };
        if duplicate || rows.contains_key(&notification.id) {
            return Ok(false);
        }
        rows.insert(notification.id.clone(), notification.clone());
        Ok(true)
    }

    fn find_by_key(&self, key: &NotificationKey) -> Result<Option<Notification>, InfraError> {
        Ok(self
            .lock()?
            .values()
            .find(|row| matches_key(row, key))
            .cloned())
    }

    fn list_pending_reminders(&self, user_id: &str, task_id: &str) -> Result<Vec<Notification>, InfraError> {
        self.filtered(|row| {
            row.status == NotificationStatus::Pending
                && row.is_reminder()
                && row.user_id == user_id
                && row.task_id.as_deref() == Some(task_id)
        })
    }

    fn list_pending_reminders_for_user(&self, user_id: &str) -> Result<Vec<Notification>, InfraError> {
        self.filtered(|row| {
            row.status == NotificationStatus::Pending
                && row.is_reminder()
                && row.user_id == user_id
                && row.task_id.is_some()
        })
    }

    fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Notification>, InfraError> {
        let mut due = self.filtered(|row| {
            row.status == NotificationStatus::Pending && !row.is_future(now) && !row.is_backing_off(now)
        })?;
        due.truncate(limit);
        Ok(due)
    }

    fn transition(
        &self,
        id: &str,
        expected: NotificationStatus,
        update: StatusUpdate,
    ) -> Result<bool, InfraError> {
        let mut rows = self.lock()?;
        let Some(row) = rows.get_mut(id).filter(|row| row.status == expected) else {
            return Ok(false);
        };
        row.status = update.status;
        row.last_error = update.last_error;
        if update.sent_at.is_some() {
            row.sent_at = update.sent_at;
        }
        row.delivery_job_id = None;
        row.next_attempt_at = None;
        Ok(true)
    }

    fn reactivate(&self, id: &str) -> Result<bool, InfraError> {
        let mut rows = self.lock()?;
        let Some(row) = rows.get_mut(id).filter(|row| row.status.is_terminal()) else {
            return Ok(false);
        };
        row.status = NotificationStatus::Pending;
        row.last_error = None;
        row.delivery_job_id = None;
        row.sent_at = None;
        row.attempts = 0;
        row.next_attempt_at = None;
        Ok(true)
    }

    fn record_attempt(
        &self,
        id: &str,
        attempts: u32,
        last_error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<bool, InfraError> {
        let mut rows = self.lock()?;
        let Some(row) = rows
            .get_mut(id)
            .filter(|row| row.status == NotificationStatus::Pending)
        else {
            return Ok(false);
        };
        row.attempts = attempts;
        row.last_error = Some(last_error.to_string());
        row.next_attempt_at = next_attempt_at;
        Ok(true)
    }

    fn set_delivery_job(&self, id: &str, job_id: Option<&str>) -> Result<(), InfraError> {
        if let Some(row) = self.lock()?.get_mut(id) {
            row.delivery_job_id = job_id.map(ToOwned::to_owned);
        }
        Ok(())
    }
}
