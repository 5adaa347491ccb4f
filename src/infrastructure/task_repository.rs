use crate::domain::models::{ReminderSpec, RoleLinkage, Task};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::{format_timestamp, parse_optional_timestamp};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait TaskRepository: Send + Sync {
    fn get(&self, task_id: &str) -> Result<Option<Task>, InfraError>;
    fn save(&self, task: &Task) -> Result<(), InfraError>;
    /// Tasks where the user is creator or assignee.
    fn list_for_participant(&self, user_id: &str) -> Result<Vec<Task>, InfraError>;
}

const TASK_COLUMNS: &str = "id, title, deadline, creator_id, assignee_id, creator_reminders, \
     assignee_reminders, creator_event_id, creator_event_active, assignee_event_id, \
     assignee_event_active, last_sync_error";

#[derive(Debug, Clone)]
pub struct SqliteTaskRepository {
    db_path: PathBuf,
}

impl SqliteTaskRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }
}

struct TaskRow {
    id: String,
    title: String,
    deadline: Option<String>,
    creator_id: String,
    assignee_id: Option<String>,
    creator_reminders: String,
    assignee_reminders: String,
    creator_event_id: Option<String>,
    creator_event_active: bool,
    assignee_event_id: Option<String>,
    assignee_event_active: bool,
    last_sync_error: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            deadline: row.get(2)?,
            creator_id: row.get(3)?,
            assignee_id: row.get(4)?,
            creator_reminders: row.get(5)?,
            assignee_reminders: row.get(6)?,
            creator_event_id: row.get(7)?,
            creator_event_active: row.get(8)?,
            assignee_event_id: row.get(9)?,
            assignee_event_active: row.get(10)?,
            last_sync_error: row.get(11)?,
        })
    }

    fn into_task(self) -> Result<Task, InfraError> {
        let creator_reminders: Vec<ReminderSpec> = serde_json::from_str(&self.creator_reminders)?;
        let assignee_reminders: Vec<ReminderSpec> = serde_json::from_str(&self.assignee_reminders)?;
        Ok(Task {
            deadline: parse_optional_timestamp(self.deadline, "tasks.deadline")?,
            id: self.id,
            title: self.title,
            creator_id: self.creator_id,
            assignee_id: self.assignee_id,
            creator: RoleLinkage {
                reminders: creator_reminders,
                event_id: self.creator_event_id,
                event_active: self.creator_event_active,
            },
            assignee: RoleLinkage {
                reminders: assignee_reminders,
                event_id: self.assignee_event_id,
                event_active: self.assignee_event_active,
            },
            last_sync_error: self.last_sync_error,
        })
    }
}

impl TaskRepository for SqliteTaskRepository {
    fn get(&self, task_id: &str) -> Result<Option<Task>, InfraError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![task_id],
                TaskRow::from_row,
            )
            .optional()?;
        row.map(TaskRow::into_task).transpose()
    }

    fn save(&self, task: &Task) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO tasks (id, title, deadline, creator_id, assignee_id, creator_reminders,
               assignee_reminders, creator_event_id, creator_event_active, assignee_event_id,
               assignee_event_active, last_sync_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
               title = excluded.title,
               deadline = excluded.deadline,
               creator_id = excluded.creator_id,
               assignee_id = excluded.assignee_id,
               creator_reminders = excluded.creator_reminders,
               assignee_reminders = excluded.assignee_reminders,
               creator_event_id = excluded.creator_event_id,
               creator_event_active = excluded.creator_event_active,
               assignee_event_id = excluded.assignee_event_id,
               assignee_event_active = excluded.assignee_event_active,
               last_sync_error = excluded.last_sync_error",
            params![
                task.id,
                task.title,
                task.deadline.map(format_timestamp),
                task.creator_id,
                task.assignee_id,
                serde_json::to_string(&task.creator.reminders)?,
                serde_json::to_string(&task.assignee.reminders)?,
                task.creator.event_id,
                task.creator.event_active,
                task.assignee.event_id,
                task.assignee.event_active,
                task.last_sync_error,
            ],
        )?;
        Ok(())
    }

    fn list_for_participant(&self, user_id: &str) -> Result<Vec<Task>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE creator_id = ?1 OR assignee_id = ?1 ORDER BY id"
        ))?;
        let rows = statement
            .query_map(params![user_id], TaskRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    tasks: Mutex<HashMap<String, Task>>,
}

impl InMemoryTaskRepository {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Task>>, InfraError> {
        self.tasks
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("task store lock poisoned: {error}")))
    }
}

impl TaskRepository for InMemoryTaskRepository {
    fn get(&self, task_id: &str) -> Result<Option<Task>, InfraError> {
        Ok(self.lock()?.get(task_id).cloned())
    }

    fn save(&self, task: &Task) -> Result<(), InfraError> {
        self.lock()?.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn list_for_participant(&self, user_id: &str) -> Result<Vec<Task>, InfraError> {
        let mut tasks: Vec<Task> = self
            .lock()?
            .values()
            .filter(|task| !task.roles_of(user_id).is_empty())
            .cloned()
            .collect();
        tasks.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(tasks)
    }
}
