use crate::domain::models::ChannelType;
use crate::domain::reminders::ReminderPolicy;
use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::time::Duration;

const APP_JSON: &str = "app.json";
const REMINDERS_JSON: &str = "reminders.json";
const DELIVERY_JSON: &str = "delivery.json";
const SUPPORTED_SCHEMA: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub app_name: String,
    pub timezone: String,
    pub calendar_name: String,
    pub event_duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemindersConfig {
    pub allowed_minutes: Vec<u32>,
    pub max_count: usize,
    pub max_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub max_attempts: u32,
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_fallback_channel")]
    pub fallback_channel: ChannelType,
}

fn default_fallback_channel() -> ChannelType {
    ChannelType::Telegram
}

/// Retry and sweep settings for notification delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub sweep_interval: Duration,
    /// Channel used for fallback reminders and direct notifications.
    pub fallback_channel: ChannelType,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            max_attempts: 5,
            sweep_interval: Duration::from_secs(300),
            fallback_channel: ChannelType::Telegram,
        }
    }
}

impl DeliveryPolicy {
    /// Delay before retry number `attempt + 1`: base doubled per attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarSettings {
    pub calendar_name: String,
    pub timezone: Option<String>,
    pub event_duration_minutes: u32,
}

impl Default for CalendarSettings {
    fn default() -> Self {
        Self {
            calendar_name: "Tasks".to_string(),
            timezone: Some("UTC".to_string()),
            event_duration_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSettings {
    pub calendar: CalendarSettings,
    pub reminders: ReminderPolicy,
    pub delivery: DeliveryPolicy,
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": "RemindSync",
                "timezone": "UTC",
                "calendarName": "Tasks",
                "eventDurationMinutes": 30
            }),
        ),
        (
            REMINDERS_JSON,
            serde_json::json!({
                "schema": 1,
                "allowedMinutes": [5, 10, 15, 30, 60, 120, 1440],
                "maxCount": 5,
                "maxMinutes": 40320
            }),
        ),
        (
            DELIVERY_JSON,
            serde_json::json!({
                "schema": 1,
                "baseDelaySeconds": 60,
                "maxDelaySeconds": 3600,
                "maxAttempts": 5,
                "sweepIntervalSeconds": 300,
                "fallbackChannel": "telegram"
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SUPPORTED_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

fn read_typed<T>(path: &Path) -> Result<T, InfraError>
where
    T: serde::de::DeserializeOwned,
{
    let value = read_config(path)?;
    serde_json::from_value(value)
        .map_err(|error| InfraError::InvalidConfig(format!("{}: {error}", path.display())))
}

pub fn load_settings(config_dir: &Path) -> Result<EngineSettings, InfraError> {
    let app: AppConfig = read_typed(&config_dir.join(APP_JSON))?;
    let reminders: RemindersConfig = read_typed(&config_dir.join(REMINDERS_JSON))?;
    let delivery: DeliveryConfig = read_typed(&config_dir.join(DELIVERY_JSON))?;

    let timezone = normalize_timezone(&app.timezone)?;
    let calendar_name = app.calendar_name.trim();
    if calendar_name.is_empty() {
        return Err(InfraError::InvalidConfig(
            "calendarName must not be empty".to_string(),
        ));
    }
    if app.event_duration_minutes == 0 {
        return Err(InfraError::InvalidConfig(
            "eventDurationMinutes must be > 0".to_string(),
        ));
    }

    let allowed_minutes: BTreeSet<u32> = reminders
        .allowed_minutes
        .into_iter()
        .filter(|minutes| *minutes > 0)
        .collect();
    if allowed_minutes.is_empty() {
        return Err(InfraError::InvalidConfig(
            "allowedMinutes must contain at least one positive value".to_string(),
        ));
    }
    if reminders.max_count == 0 {
        return Err(InfraError::InvalidConfig("maxCount must be > 0".to_string()));
    }
    if delivery.max_attempts == 0 {
        return Err(InfraError::InvalidConfig(
            "maxAttempts must be > 0".to_string(),
        ));
    }

    Ok(EngineSettings {
        calendar: CalendarSettings {
            calendar_name: calendar_name.to_string(),
            timezone,
            event_duration_minutes: app.event_duration_minutes,
        },
        reminders: ReminderPolicy {
            allowed_minutes,
            max_count: reminders.max_count,
            max_minutes: reminders.max_minutes.max(1),
        },
        delivery: DeliveryPolicy {
            base_delay: Duration::from_secs(delivery.base_delay_seconds.max(1)),
            max_delay: Duration::from_secs(delivery.max_delay_seconds.max(1)),
            max_attempts: delivery.max_attempts,
            sweep_interval: Duration::from_secs(delivery.sweep_interval_seconds.max(1)),
            fallback_channel: delivery.fallback_channel,
        },
    })
}

fn normalize_timezone(raw: &str) -> Result<Option<String>, InfraError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<Tz>()
        .map(|tz| Some(tz.name().to_string()))
        .map_err(|error| InfraError::InvalidConfig(format!("invalid timezone '{trimmed}': {error}")))
}
