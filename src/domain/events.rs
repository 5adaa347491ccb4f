use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events published by the task-mutation layer after a change is committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskCreated {
        task_id: String,
    },
    /// Title or reminder lists changed; deadline and assignee did not.
    TaskUpdated {
        task_id: String,
    },
    TaskDeadlineChanged {
        task_id: String,
        previous_deadline: Option<DateTime<Utc>>,
    },
    TaskAssigneeChanged {
        task_id: String,
        previous_assignee: Option<String>,
        /// Fresh reminder list supplied for the new assignee, if any.
        assignee_reminders: Option<Vec<Value>>,
    },
    IntegrationConnected {
        user_id: String,
    },
    IntegrationDisconnected {
        user_id: String,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task_created",
            Self::TaskUpdated { .. } => "task_updated",
            Self::TaskDeadlineChanged { .. } => "task_deadline_changed",
            Self::TaskAssigneeChanged { .. } => "task_assignee_changed",
            Self::IntegrationConnected { .. } => "integration_connected",
            Self::IntegrationDisconnected { .. } => "integration_disconnected",
        }
    }
}
