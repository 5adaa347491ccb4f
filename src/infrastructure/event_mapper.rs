use crate::domain::models::{ReminderSpec, Role, Task};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

pub const KEY_TASK_ID: &str = "remindsync_task_id";
pub const KEY_ROLE: &str = "remindsync_role";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CalendarEventDateTime {
    #[serde(rename = "dateTime")]
    pub date_time: String,
    #[serde(rename = "timeZone", skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct CalendarEventExtendedProperties {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub private: HashMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EventReminderOverride {
    pub method: String,
    pub minutes: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EventReminders {
    #[serde(rename = "useDefault")]
    pub use_default: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<EventReminderOverride>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct GoogleCalendarEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub start: CalendarEventDateTime,
    pub end: CalendarEventDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reminders: Option<EventReminders>,
    #[serde(rename = "extendedProperties", skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<CalendarEventExtendedProperties>,
}

impl GoogleCalendarEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }
}

/// Which task and role a provider-side event belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCorrelation {
    pub task_id: String,
    pub role: Role,
}

/// Builds the provider event for one participant role of a task.
///
/// The event ends at the deadline and lasts `duration`. Reminder overrides
/// replace the calendar defaults. The correlation tag survives task renames.
pub fn encode_task_event(
    task: &Task,
    role: Role,
    reminders: &[ReminderSpec],
    duration: Duration,
    time_zone: Option<&str>,
) -> Result<GoogleCalendarEvent, InfraError> {
    let deadline = task
        .deadline
        .ok_or_else(|| InfraError::Validation(format!("task {} has no deadline", task.id)))?;
    let duration = duration.max(Duration::minutes(1));

    let mut private = HashMap::new();
    private.insert(KEY_TASK_ID.to_string(), task.id.clone());
    private.insert(KEY_ROLE.to_string(), role.as_str().to_string());

    let time_zone = time_zone
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned);

    Ok(GoogleCalendarEvent {
        id: None,
        summary: Some(task.title.clone()),
        description: Some(format!("Deadline for task {} ({})", task.id, role.as_str())),
        status: Some("confirmed".to_string()),
        start: CalendarEventDateTime {
            date_time: (deadline - duration).to_rfc3339(),
            time_zone: time_zone.clone(),
        },
        end: CalendarEventDateTime {
            date_time: deadline.to_rfc3339(),
            time_zone,
        },
        reminders: Some(EventReminders {
            use_default: false,
            overrides: reminders
                .iter()
                .map(|reminder| EventReminderOverride {
                    method: reminder.method.as_str().to_string(),
                    minutes: reminder.minutes_before_deadline,
                })
                .collect(),
        }),
        extended_properties: Some(CalendarEventExtendedProperties { private }),
    })
}

/// Reads the correlation tag, `None` for events this engine did not create.
pub fn decode_correlation(event: &GoogleCalendarEvent) -> Option<EventCorrelation> {
    let private = &event.extended_properties.as_ref()?.private;
    let task_id = private
        .get(KEY_TASK_ID)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())?;
    let role = private.get(KEY_ROLE).and_then(|value| Role::parse(value))?;
    Some(EventCorrelation {
        task_id: task_id.to_string(),
        role,
    })
}

pub fn event_end(event: &GoogleCalendarEvent) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(&event.end.date_time)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| {
            InfraError::Provider(format!(
                "invalid calendar event end.dateTime '{}': {error}",
                event.end.date_time
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ReminderMethod;
    use crate::test_support::fixed_time;

    fn sample_task() -> Task {
        let mut task = Task::new("tsk-42", "Submit grades", "teacher-a");
        task.deadline = Some(fixed_time("2026-03-01T12:00:00Z"));
        task
    }

    #[test]
    fn encoded_event_ends_at_deadline_with_overrides() {
        let reminders = vec![
            ReminderSpec::popup(15),
            ReminderSpec {
                method: ReminderMethod::Email,
                minutes_before_deadline: 60,
            },
        ];
        let event = encode_task_event(
            &sample_task(),
            Role::Assignee,
            &reminders,
            Duration::minutes(30),
            Some("Europe/Warsaw"),
        )
        .expect("encode");

        assert_eq!(event_end(&event).expect("end"), fixed_time("2026-03-01T12:00:00Z"));
        assert_eq!(event.start.date_time, "2026-03-01T11:30:00+00:00");
        assert_eq!(event.start.time_zone.as_deref(), Some("Europe/Warsaw"));
        let overrides = event.reminders.expect("reminders").overrides;
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides[1].method, "email");
        assert_eq!(overrides[1].minutes, 60);
    }

    #[test]
    fn correlation_survives_rename() {
        let mut task = sample_task();
        let event = encode_task_event(&task, Role::Creator, &[], Duration::minutes(30), None)
            .expect("encode");
        task.title = "Renamed".to_string();

        assert_eq!(
            decode_correlation(&event),
            Some(EventCorrelation {
                task_id: task.id.clone(),
                role: Role::Creator,
            })
        );
    }

    #[test]
    fn foreign_events_have_no_correlation() {
        let mut event = encode_task_event(&sample_task(), Role::Creator, &[], Duration::minutes(30), None)
            .expect("encode");
        event.extended_properties = Some(CalendarEventExtendedProperties::default());
        assert_eq!(decode_correlation(&event), None);
    }

    #[test]
    fn encoding_requires_deadline() {
        let mut task = sample_task();
        task.deadline = None;
        assert!(matches!(
            encode_task_event(&task, Role::Creator, &[], Duration::minutes(30), None),
            Err(InfraError::Validation(_))
        ));
    }
}
