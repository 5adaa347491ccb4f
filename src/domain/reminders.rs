//! Canonicalization of raw reminder lists.
//!
//! Raw reminders arrive as loosely-typed JSON entries (`{"method": "popup", "minutes": 30}`).
//! Two modes exist: [`normalize_strict`] validates user input for accounts without calendar
//! integration and rejects the whole list on the first bad entry; [`normalize_permissive`]
//! repairs what it can and silently drops the rest.

use crate::domain::models::{ReminderMethod, ReminderSpec};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

const MINUTE_KEYS: [&str; 3] = ["minutes", "minutesBeforeDeadline", "minutes_before_deadline"];
const DEFAULT_ALLOWED_MINUTES: [u32; 7] = [5, 10, 15, 30, 60, 120, 1440];
const DEFAULT_MAX_COUNT: usize = 5;
// Upper bound the calendar provider accepts for a reminder override (four weeks).
const DEFAULT_MAX_MINUTES: u32 = 40_320;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderPolicy {
    pub allowed_minutes: BTreeSet<u32>,
    pub max_count: usize,
    pub max_minutes: u32,
}

impl Default for ReminderPolicy {
    fn default() -> Self {
        Self {
            allowed_minutes: DEFAULT_ALLOWED_MINUTES.into_iter().collect(),
            max_count: DEFAULT_MAX_COUNT,
            max_minutes: DEFAULT_MAX_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReminderError {
    #[error("reminder[{index}] is malformed")]
    Malformed { index: usize },
    #[error("reminder[{index}] method '{method}' is not supported without calendar integration")]
    UnsupportedMethod { index: usize, method: String },
    #[error("reminder[{index}] offset {minutes} is not an allowed value")]
    DisallowedOffset { index: usize, minutes: i64 },
    #[error("at most {max} reminders are allowed, got {count}")]
    TooMany { count: usize, max: usize },
    #[error("no valid reminders remain after normalization")]
    Empty,
}

/// Validates user-supplied reminders; any bad entry rejects the whole list.
pub fn normalize_strict(
    raw: &[Value],
    policy: &ReminderPolicy,
) -> Result<Vec<ReminderSpec>, ReminderError> {
    let mut specs = Vec::with_capacity(raw.len());
    for (index, entry) in raw.iter().enumerate() {
        let Some(object) = entry.as_object() else {
            return Err(ReminderError::Malformed { index });
        };

        if let Some(method) = object.get("method") {
            let method = method.as_str().unwrap_or_default();
            if ReminderMethod::parse(method) != Some(ReminderMethod::Popup) {
                return Err(ReminderError::UnsupportedMethod {
                    index,
                    method: method.to_string(),
                });
            }
        }

        let minutes = minutes_field(object).ok_or(ReminderError::Malformed { index })?;
        let allowed = u32::try_from(minutes)
            .ok()
            .filter(|value| policy.allowed_minutes.contains(value));
        let Some(minutes) = allowed else {
            return Err(ReminderError::DisallowedOffset { index, minutes });
        };
        specs.push(ReminderSpec::popup(minutes));
    }

    let specs = dedup_sorted(specs);
    if specs.len() > policy.max_count {
        return Err(ReminderError::TooMany {
            count: specs.len(),
            max: policy.max_count,
        });
    }
    Ok(specs)
}

/// Repairs a raw reminder list: drops malformed entries, coerces offsets, dedups,
/// sorts ascending and keeps the `max_count` earliest offsets.
pub fn normalize_permissive(
    raw: &[Value],
    policy: &ReminderPolicy,
    require_non_empty: bool,
) -> Result<Vec<ReminderSpec>, ReminderError> {
    let specs = raw
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|object| {
            let method = match object.get("method") {
                None | Some(Value::Null) => ReminderMethod::Popup,
                Some(value) => ReminderMethod::parse(value.as_str()?)?,
            };
            let minutes = minutes_field(object)?;
            let minutes = u32::try_from(minutes).ok()?;
            Some(ReminderSpec {
                method,
                minutes_before_deadline: minutes,
            })
        })
        .collect();
    finalize(specs, policy, require_non_empty)
}

/// Permissive normalization for reminder lists that are already typed (stored lists).
pub fn normalize_specs(
    specs: &[ReminderSpec],
    policy: &ReminderPolicy,
    require_non_empty: bool,
) -> Result<Vec<ReminderSpec>, ReminderError> {
    finalize(specs.to_vec(), policy, require_non_empty)
}

pub fn specs_to_values(specs: &[ReminderSpec]) -> Vec<Value> {
    specs
        .iter()
        .map(|spec| {
            serde_json::json!({
                "method": spec.method.as_str(),
                "minutes": spec.minutes_before_deadline,
            })
        })
        .collect()
}

fn finalize(
    specs: Vec<ReminderSpec>,
    policy: &ReminderPolicy,
    require_non_empty: bool,
) -> Result<Vec<ReminderSpec>, ReminderError> {
    let mut specs: Vec<ReminderSpec> = specs
        .into_iter()
        .filter(|spec| {
            spec.minutes_before_deadline > 0 && spec.minutes_before_deadline <= policy.max_minutes
        })
        .collect();
    specs = dedup_sorted(specs);
    specs.truncate(policy.max_count);

    if require_non_empty && specs.is_empty() {
        return Err(ReminderError::Empty);
    }
    Ok(specs)
}

// First occurrence wins on duplicate offsets; the sort is stable.
fn dedup_sorted(specs: Vec<ReminderSpec>) -> Vec<ReminderSpec> {
    let mut seen = HashSet::new();
    let mut unique: Vec<ReminderSpec> = specs
        .into_iter()
        .filter(|spec| seen.insert(spec.minutes_before_deadline))
        .collect();
    unique.sort_by_key(|spec| spec.minutes_before_deadline);
    unique
}

fn minutes_field(object: &serde_json::Map<String, Value>) -> Option<i64> {
    MINUTE_KEYS
        .iter()
        .find_map(|key| object.get(*key))
        .and_then(coerce_integer)
}

fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|value| value.is_finite()).map(|value| value.trunc() as i64)),
        Value::String(raw) => {
            let raw = raw.trim();
            raw.parse::<i64>().ok().or_else(|| {
                raw.parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .map(|value| value.trunc() as i64)
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn minutes(specs: &[ReminderSpec]) -> Vec<u32> {
        specs.iter().map(|spec| spec.minutes_before_deadline).collect()
    }

    #[test]
    fn strict_accepts_allowed_popup_reminders() {
        let raw = vec![
            json!({"method": "popup", "minutes": 60}),
            json!({"minutes": 15}),
            json!({"method": "popup", "minutes": 60}),
        ];
        let specs = normalize_strict(&raw, &ReminderPolicy::default()).expect("valid reminders");
        assert_eq!(minutes(&specs), vec![15, 60]);
    }

    #[test]
    fn strict_rejects_email_method() {
        let raw = vec![json!({"method": "email", "minutes": 15})];
        let result = normalize_strict(&raw, &ReminderPolicy::default());
        assert_eq!(
            result,
            Err(ReminderError::UnsupportedMethod {
                index: 0,
                method: "email".to_string()
            })
        );
    }

    #[test]
    fn strict_rejects_offset_outside_allowed_set() {
        let raw = vec![json!({"minutes": 15}), json!({"minutes": 17})];
        let result = normalize_strict(&raw, &ReminderPolicy::default());
        assert_eq!(
            result,
            Err(ReminderError::DisallowedOffset { index: 1, minutes: 17 })
        );
    }

    #[test]
    fn strict_rejects_non_object_entry() {
        let raw = vec![json!(15)];
        assert_eq!(
            normalize_strict(&raw, &ReminderPolicy::default()),
            Err(ReminderError::Malformed { index: 0 })
        );
    }

    #[test]
    fn permissive_drops_garbage_and_coerces_strings() {
        let raw = vec![
            json!("not a reminder"),
            json!({"method": "popup", "minutes": "30"}),
            json!({"method": "sms", "minutes": 10}),
            json!({"minutes": -5}),
            json!({"minutes": 0}),
            json!({"method": "email", "minutes": 12.7}),
            json!({"minutesBeforeDeadline": 30}),
            json!({"method": "popup"}),
        ];
        let specs =
            normalize_permissive(&raw, &ReminderPolicy::default(), false).expect("normalized");
        assert_eq!(minutes(&specs), vec![12, 30]);
        assert_eq!(specs[0].method, ReminderMethod::Email);
    }

    #[test]
    fn permissive_keeps_earliest_offsets_when_truncating() {
        let policy = ReminderPolicy {
            max_count: 2,
            ..ReminderPolicy::default()
        };
        let raw = vec![json!({"minutes": 60}), json!({"minutes": 5}), json!({"minutes": 30})];
        let specs = normalize_permissive(&raw, &policy, false).expect("normalized");
        assert_eq!(minutes(&specs), vec![5, 30]);
    }

    #[test]
    fn permissive_fails_when_required_and_nothing_survives() {
        let raw = vec![json!({"minutes": "soon"})];
        assert_eq!(
            normalize_permissive(&raw, &ReminderPolicy::default(), true),
            Err(ReminderError::Empty)
        );
        assert_eq!(
            normalize_permissive(&raw, &ReminderPolicy::default(), false),
            Ok(Vec::new())
        );
    }

    #[test]
    fn permissive_drops_offsets_beyond_provider_limit() {
        let raw = vec![json!({"minutes": 40_321}), json!({"minutes": 40_320})];
        let specs =
            normalize_permissive(&raw, &ReminderPolicy::default(), false).expect("normalized");
        assert_eq!(minutes(&specs), vec![40_320]);
    }

    #[test]
    fn specs_roundtrip_through_values() {
        let specs = vec![ReminderSpec::popup(15), ReminderSpec::popup(60)];
        let values = specs_to_values(&specs);
        let normalized =
            normalize_permissive(&values, &ReminderPolicy::default(), true).expect("normalized");
        assert_eq!(normalized, specs);
    }

    fn arb_entry() -> impl Strategy<Value = Value> {
        prop_oneof![
            (-100i64..50_000i64).prop_map(|minutes| json!({"method": "popup", "minutes": minutes})),
            (-100i64..50_000i64).prop_map(|minutes| json!({"minutes": minutes.to_string()})),
            (0u32..2000u32).prop_map(|minutes| json!({"method": "email", "minutes": minutes})),
            "[a-z]{0,8}".prop_map(Value::String),
            Just(Value::Null),
        ]
    }

    proptest! {
        #[test]
        fn permissive_output_is_sorted_unique_and_bounded(
            raw in prop::collection::vec(arb_entry(), 0..20),
            max_count in 1usize..8usize
        ) {
            let policy = ReminderPolicy { max_count, ..ReminderPolicy::default() };
            let specs = normalize_permissive(&raw, &policy, false).expect("never fails when not required");
            let offsets = minutes(&specs);

            prop_assert!(offsets.len() <= max_count);
            prop_assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));
            prop_assert!(offsets.iter().all(|value| *value > 0 && *value <= policy.max_minutes));
        }

        #[test]
        fn permissive_is_deterministic(raw in prop::collection::vec(arb_entry(), 0..20)) {
            let policy = ReminderPolicy::default();
            let first = normalize_permissive(&raw, &policy, false);
            let second = normalize_permissive(&raw, &policy, false);
            prop_assert_eq!(first, second);
        }
    }
}
