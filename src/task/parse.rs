//! Record preprocessing for upstream task payloads.
//!
//! Decodes raw JSON objects into typed [`TaskRecord`] values and derives the
//! timing fields. Records are handled one at a time: a malformed entry is
//! skipped and reported, the rest of the batch goes through.

use chrono::{Datelike, NaiveDateTime};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::classify::{classify, completion_scale, reaction_scale};
use super::{DeliveryMethod, TaskRecord, TaskStatus};

/// Timestamp layout used by the warehouse system, both in payloads and in
/// the `date` query parameter.
pub const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Errors that can occur while deriving a single task record.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("record is not a task object: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("missing required field {field}")]
    MissingField { field: &'static str },

    #[error("invalid timestamp in {field}: {value:?}")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("unknown status {value:?}")]
    UnknownStatus { value: String },

    #[error("unknown delivery method {value:?}")]
    UnknownDeliveryMethod { value: String },

    #[error("invalid quantity in {field}: {value}")]
    InvalidQuantity { field: &'static str, value: String },
}

const FIELD_REFERENCE: &str = "Ссылка";
const FIELD_CREATED: &str = "Дата";
const FIELD_STATUS: &str = "Статус";
const FIELD_DELIVERY: &str = "СпособДоставки";
const FIELD_VOLUME: &str = "Объем";
const FIELD_LINES: &str = "Строк";

/// Task object as sent upstream.
#[derive(Debug, Default, Deserialize)]
struct RawTask {
    #[serde(rename = "Ссылка", default)]
    reference: Option<String>,
    #[serde(rename = "Дата", default)]
    created_at: Option<String>,
    #[serde(rename = "ДатаНачалаВыполнения", default)]
    execution_started_at: Option<String>,
    #[serde(rename = "ДатаОкончанияВыполнения", default)]
    execution_completed_at: Option<String>,
    #[serde(rename = "ИсполнитьК", default)]
    due_at: Option<String>,
    #[serde(rename = "Статус", default)]
    status: Option<String>,
    #[serde(rename = "СпособДоставки", default)]
    delivery_method: Option<String>,
    #[serde(rename = "Объем", default)]
    volume: Option<Value>,
    #[serde(rename = "Строк", default)]
    line_count: Option<Value>,
    #[serde(rename = "БригадаОтветственный", default)]
    team: Option<String>,
    #[serde(rename = "ИнформацияОПолучателе", default)]
    recipient_info: Option<String>,
}

/// Result of preprocessing one fetched batch.
#[derive(Debug, Default)]
pub struct Preprocessed {
    pub records: Vec<TaskRecord>,
    pub skipped: usize,
}

/// Derive typed records from a raw batch, skipping records that fail.
///
/// `now` drives the live reaction/completion clocks of unfinished tasks.
pub fn preprocess(raw: Vec<Value>, now: NaiveDateTime) -> Preprocessed {
    let mut out = Preprocessed {
        records: Vec::with_capacity(raw.len()),
        skipped: 0,
    };

    for value in &raw {
        match parse_task(value, now) {
            Ok(record) => out.records.push(record),
            Err(e) => {
                out.skipped += 1;
                warn!(
                    reference = reference_of(value),
                    error = %e,
                    "skipping task record",
                );
            }
        }
    }

    out
}

/// Parse one raw upstream object into a [`TaskRecord`].
///
/// The `active_*` load fields are left at zero; they are filled when the
/// record becomes part of a snapshot.
pub fn parse_task(value: &Value, now: NaiveDateTime) -> Result<TaskRecord, ParseError> {
    let raw = RawTask::deserialize(value)?;

    let created_at = required_timestamp(FIELD_CREATED, raw.created_at.as_deref())?;
    let execution_started_at = optional_timestamp(raw.execution_started_at.as_deref());
    let execution_completed_at = optional_timestamp(raw.execution_completed_at.as_deref());
    let due_at = optional_timestamp(raw.due_at.as_deref());

    let status_raw = raw
        .status
        .as_deref()
        .ok_or(ParseError::MissingField { field: FIELD_STATUS })?;
    let status = TaskStatus::from_upstream(status_raw).ok_or_else(|| ParseError::UnknownStatus {
        value: status_raw.to_string(),
    })?;

    let delivery_raw = raw
        .delivery_method
        .as_deref()
        .ok_or(ParseError::MissingField {
            field: FIELD_DELIVERY,
        })?;
    let delivery_method = DeliveryMethod::from_upstream(delivery_raw).ok_or_else(|| {
        ParseError::UnknownDeliveryMethod {
            value: delivery_raw.to_string(),
        }
    })?;

    let volume = quantity(FIELD_VOLUME, raw.volume.as_ref())?;
    let line_count = whole_quantity(FIELD_LINES, raw.line_count.as_ref())?;

    let reaction_seconds = reaction_seconds(status, created_at, execution_started_at, now);
    let completion_seconds = completion_seconds(
        status,
        execution_started_at,
        execution_completed_at,
        now,
    );

    Ok(TaskRecord {
        reference: raw.reference.unwrap_or_default(),
        created_at,
        execution_started_at,
        execution_completed_at,
        due_at,
        status,
        delivery_method,
        volume,
        line_count,
        team: raw.team.unwrap_or_default(),
        recipient_info: raw.recipient_info.unwrap_or_default(),
        reaction_seconds,
        completion_seconds,
        classification: classify(status, reaction_seconds, completion_seconds),
        reaction_scale: reaction_scale(reaction_seconds),
        completion_scale: completion_scale(completion_seconds),
        active_line_load: 0,
        active_volume_load: 0.0,
    })
}

/// Seconds from creation until a picker started the task.
///
/// A prepared task is still waiting, so its clock runs against `now`.
pub fn reaction_seconds(
    status: TaskStatus,
    created_at: NaiveDateTime,
    started_at: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> i64 {
    if status == TaskStatus::Prepared {
        return (now - created_at).num_seconds();
    }
    started_at.map_or(0, |start| (start - created_at).num_seconds())
}

/// Seconds spent executing the task.
///
/// An in-progress task is still running, so its clock runs against `now`.
pub fn completion_seconds(
    status: TaskStatus,
    started_at: Option<NaiveDateTime>,
    completed_at: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> i64 {
    match (status, started_at, completed_at) {
        (TaskStatus::InProgress, Some(start), _) => (now - start).num_seconds(),
        (TaskStatus::InProgress, None, _) => 0,
        (_, Some(start), Some(done)) => (done - start).num_seconds(),
        _ => 0,
    }
}

/// Parse an upstream timestamp.
///
/// The warehouse system encodes an unset date as year 1, which is treated as
/// absent.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .filter(|dt| dt.year() > 1)
}

fn required_timestamp(
    field: &'static str,
    raw: Option<&str>,
) -> Result<NaiveDateTime, ParseError> {
    let value = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ParseError::MissingField { field })?;
    parse_timestamp(value).ok_or_else(|| ParseError::InvalidTimestamp {
        field,
        value: value.to_string(),
    })
}

fn optional_timestamp(raw: Option<&str>) -> Option<NaiveDateTime> {
    raw.and_then(parse_timestamp)
}

/// A missing quantity counts as zero; anything else must be a finite,
/// non-negative number (numeric strings with a decimal comma are accepted).
fn quantity(field: &'static str, raw: Option<&Value>) -> Result<f64, ParseError> {
    let parsed = match raw {
        None | Some(Value::Null) => return Ok(0.0),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| if c == ',' { '.' } else { c })
                .collect();
            cleaned.parse::<f64>().ok()
        }
        Some(_) => None,
    };

    match parsed {
        Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
        _ => Err(ParseError::InvalidQuantity {
            field,
            value: raw.map(Value::to_string).unwrap_or_default(),
        }),
    }
}

fn whole_quantity(field: &'static str, raw: Option<&Value>) -> Result<u32, ParseError> {
    let v = quantity(field, raw)?;
    if v.fract() != 0.0 || v > f64::from(u32::MAX) {
        return Err(ParseError::InvalidQuantity {
            field,
            value: raw.map(Value::to_string).unwrap_or_default(),
        });
    }
    Ok(v as u32)
}

fn reference_of(value: &Value) -> &str {
    value
        .get(FIELD_REFERENCE)
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::*;
    use crate::task::Classification;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(h, m, s))
            .expect("valid timestamp")
    }

    fn completed_task() -> Value {
        json!({
            "Ссылка": "Задание кладовщику 000123",
            "Дата": "01.03.2024 09:00:00",
            "ДатаНачалаВыполнения": "01.03.2024 09:00:30",
            "ДатаОкончанияВыполнения": "01.03.2024 09:10:30",
            "ИсполнитьК": "01.03.2024 12:00:00",
            "Статус": "Выполнено",
            "СпособДоставки": "Самовывоз",
            "Объем": 1.5,
            "Строк": 4,
            "БригадаОтветственный": "Бригада 2",
            "ИнформацияОПолучателе": "ООО Ромашка"
        })
    }

    #[test]
    fn test_parse_completed_task() {
        let record = parse_task(&completed_task(), at(18, 0, 0)).expect("should parse");

        assert_eq!(record.reference, "Задание кладовщику 000123");
        assert_eq!(record.created_at, at(9, 0, 0));
        assert_eq!(record.execution_started_at, Some(at(9, 0, 30)));
        assert_eq!(record.execution_completed_at, Some(at(9, 10, 30)));
        assert_eq!(record.due_at, Some(at(12, 0, 0)));
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.delivery_method, DeliveryMethod::Pickup);
        assert_eq!(record.volume, 1.5);
        assert_eq!(record.line_count, 4);
        assert_eq!(record.team, "Бригада 2");
        assert_eq!(record.reaction_seconds, 30);
        assert_eq!(record.completion_seconds, 600);
        assert_eq!(record.classification, Classification::Normal);
        assert_eq!(record.reaction_scale, 1.0);
        assert_eq!(record.completion_scale, 10);
        assert_eq!(record.active_line_load, 0);
    }

    #[test]
    fn test_legacy_status_is_completed() {
        let mut value = completed_task();
        value["Статус"] = json!("Выполнено без ошибок");
        let record = parse_task(&value, at(18, 0, 0)).expect("should parse");
        assert_eq!(record.status, TaskStatus::Completed);
    }

    #[test]
    fn test_prepared_reaction_runs_against_now() {
        let value = json!({
            "Дата": "01.03.2024 09:00:00",
            "ДатаНачалаВыполнения": "",
            "ДатаОкончанияВыполнения": "",
            "Статус": "Подготовлено",
            "СпособДоставки": "До клиента",
            "Объем": 0,
            "Строк": 1
        });
        let record = parse_task(&value, at(9, 5, 0)).expect("should parse");
        assert_eq!(record.reaction_seconds, 300);
        assert_eq!(record.completion_seconds, 0);
        assert_eq!(record.classification, Classification::CustomerWaiting);
        assert_eq!(record.reaction_scale, 1.1);
    }

    #[test]
    fn test_prepared_ignores_stale_start() {
        let value = json!({
            "Дата": "01.03.2024 09:00:00",
            "ДатаНачалаВыполнения": "01.03.2024 09:00:10",
            "Статус": "Подготовлено",
            "СпособДоставки": "Самовывоз"
        });
        let record = parse_task(&value, at(9, 0, 40)).expect("should parse");
        assert_eq!(record.reaction_seconds, 40);
    }

    #[test]
    fn test_in_progress_completion_runs_against_now() {
        let value = json!({
            "Дата": "01.03.2024 07:00:00",
            "ДатаНачалаВыполнения": "01.03.2024 07:00:20",
            "Статус": "В работе",
            "СпособДоставки": "Самовывоз",
            "Строк": 10
        });
        let record = parse_task(&value, at(9, 30, 20)).expect("should parse");
        assert_eq!(record.reaction_seconds, 20);
        assert_eq!(record.completion_seconds, 9000);
        assert_eq!(record.classification, Classification::SlowCompletion);
        assert_eq!(record.completion_scale, 150);
    }

    #[test]
    fn test_unset_dates_are_absent() {
        let value = json!({
            "Дата": "01.03.2024 09:00:00",
            "ДатаНачалаВыполнения": "01.01.0001 0:00:00",
            "ДатаОкончанияВыполнения": null,
            "Статус": "Выполнено",
            "СпособДоставки": "Самовывоз"
        });
        let record = parse_task(&value, at(10, 0, 0)).expect("should parse");
        assert_eq!(record.execution_started_at, None);
        assert_eq!(record.execution_completed_at, None);
        assert_eq!(record.reaction_seconds, 0);
        assert_eq!(record.completion_seconds, 0);
        assert_eq!(record.classification, Classification::InstantCompletion);
    }

    #[test]
    fn test_missing_created_at() {
        let mut value = completed_task();
        value.as_object_mut().expect("object").remove("Дата");
        let err = parse_task(&value, at(10, 0, 0)).expect_err("should fail");
        assert!(matches!(err, ParseError::MissingField { field: "Дата" }));
    }

    #[test]
    fn test_invalid_created_at() {
        let mut value = completed_task();
        value["Дата"] = json!("2024-03-01T09:00:00");
        let err = parse_task(&value, at(10, 0, 0)).expect_err("should fail");
        assert!(err.to_string().contains("invalid timestamp in Дата"));
    }

    #[test]
    fn test_unknown_status() {
        let mut value = completed_task();
        value["Статус"] = json!("Отменено");
        let err = parse_task(&value, at(10, 0, 0)).expect_err("should fail");
        assert!(matches!(err, ParseError::UnknownStatus { .. }));
    }

    #[test]
    fn test_unknown_delivery_method() {
        let mut value = completed_task();
        value["СпособДоставки"] = json!("Дрон");
        let err = parse_task(&value, at(10, 0, 0)).expect_err("should fail");
        assert!(matches!(err, ParseError::UnknownDeliveryMethod { .. }));
    }

    #[test]
    fn test_quantity_forms() {
        assert_eq!(quantity("q", None).expect("missing"), 0.0);
        assert_eq!(quantity("q", Some(&json!(null))).expect("null"), 0.0);
        assert_eq!(quantity("q", Some(&json!(2.25))).expect("number"), 2.25);
        assert_eq!(quantity("q", Some(&json!("1 234,5"))).expect("string"), 1234.5);
        assert!(quantity("q", Some(&json!(-1))).is_err());
        assert!(quantity("q", Some(&json!("abc"))).is_err());
        assert!(quantity("q", Some(&json!([1]))).is_err());
    }

    #[test]
    fn test_fractional_line_count_rejected() {
        let mut value = completed_task();
        value["Строк"] = json!(2.5);
        let err = parse_task(&value, at(10, 0, 0)).expect_err("should fail");
        assert!(matches!(err, ParseError::InvalidQuantity { field: "Строк", .. }));
    }

    #[test]
    fn test_non_object_is_malformed() {
        let err = parse_task(&json!([1, 2, 3]), at(10, 0, 0)).expect_err("should fail");
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn test_null_strings_default_to_empty() {
        let mut value = completed_task();
        value["БригадаОтветственный"] = json!(null);
        let fields = value.as_object_mut().expect("object");
        fields.remove("ИнформацияОПолучателе");
        let record = parse_task(&value, at(18, 0, 0)).expect("should parse");
        assert_eq!(record.team, "");
        assert_eq!(record.recipient_info, "");
    }

    #[test]
    fn test_preprocess_skips_bad_records() {
        let mut bad = completed_task();
        bad["Статус"] = json!("???");
        let batch = vec![completed_task(), bad, json!("not an object"), completed_task()];

        let out = preprocess(batch, at(18, 0, 0));
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.skipped, 2);
    }

    #[test]
    fn test_reference_of() {
        assert_eq!(reference_of(&completed_task()), "Задание кладовщику 000123");
        assert_eq!(reference_of(&json!({})), "<unknown>");
    }
}
