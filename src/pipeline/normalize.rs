//! 取り込んだ生データを正規化済みレコードへ変換する。
//!
//! 純粋関数で、時計にはアクセスしない（`ingested_at` は呼び出し側が渡す）。
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::source::RawItem;
use crate::store::{CanonicalRecord, ClassificationStatus, EngagementMetrics};
use crate::util::text::{hash_text, normalize_text};

const TEXT_FIELDS: [&str; 4] = ["text", "content", "full_text", "body"];
const ID_FIELDS: [&str; 3] = ["id", "id_str", "tweet_id"];
const AUTHOR_FIELDS: [&str; 2] = ["username", "author"];
const NESTED_AUTHOR_FIELDS: [&str; 2] = ["username", "screen_name"];
const CREATED_AT_FIELDS: [&str; 2] = ["created_at", "date"];
const NAIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("item has no usable text field")]
    MissingText,
    #[error("item is not a JSON object (got {0})")]
    InvalidShape(&'static str),
    #[error("field {field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// 生データを [`CanonicalRecord`] に変換する。
///
/// # Errors
/// オブジェクトでない、テキストが無い、またはフィールドの型が不正な場合。
pub fn normalize(
    item: &RawItem,
    ingested_at: DateTime<Utc>,
) -> Result<CanonicalRecord, NormalizationError> {
    let Value::Object(object) = &item.0 else {
        return Err(NormalizationError::InvalidShape(value_kind(&item.0)));
    };

    let text = extract_text(object).ok_or(NormalizationError::MissingText)?;
    let source_id = extract_id(object)?;
    let author = extract_author(object);
    let created_at = extract_created_at(object)?;
    let lang = string_field(object, "lang").map(str::to_string);
    let metrics = extract_metrics(object)?;

    let record_key = match &source_id {
        Some(id) => format!("src:{id}"),
        None => content_key(author.as_deref(), &text, created_at),
    };

    Ok(CanonicalRecord {
        record_key,
        source_id,
        text,
        author,
        lang,
        metrics,
        created_at: created_at.unwrap_or(ingested_at),
        ingested_at,
        status: ClassificationStatus::Unclassified,
    })
}

/// ソース ID が無いときの識別キー。作成時刻は分単位に切り捨てて使う。
fn content_key(author: Option<&str>, text: &str, created_at: Option<DateTime<Utc>>) -> String {
    let minute = created_at
        .and_then(|at| at.with_second(0))
        .and_then(|at| at.with_nanosecond(0))
        .map(|at| at.to_rfc3339())
        .unwrap_or_default();
    let author = author.map(str::to_lowercase).unwrap_or_default();
    let material = format!("{author}\u{1f}{text}\u{1f}{minute}");
    format!("hash:{:016x}", hash_text(&material))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn string_field<'a>(object: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn extract_text(object: &Map<String, Value>) -> Option<String> {
    TEXT_FIELDS
        .iter()
        .filter_map(|field| object.get(*field).and_then(Value::as_str))
        .map(normalize_text)
        .find(|text| !text.is_empty())
}

fn extract_id(object: &Map<String, Value>) -> Result<Option<String>, NormalizationError> {
    for field in ID_FIELDS {
        match object.get(field) {
            None | Some(Value::Null) => {}
            Some(Value::String(raw)) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return Ok(Some(trimmed.to_string()));
                }
            }
            Some(Value::Number(number)) if number.is_i64() || number.is_u64() => {
                return Ok(Some(number.to_string()));
            }
            Some(other) => {
                return Err(NormalizationError::InvalidField {
                    field,
                    reason: format!("expected string or integer id, got {}", value_kind(other)),
                });
            }
        }
    }
    Ok(None)
}

fn extract_author(object: &Map<String, Value>) -> Option<String> {
    let top_level = AUTHOR_FIELDS
        .iter()
        .find_map(|field| string_field(object, field));
    let nested = || {
        object
            .get("user")
            .and_then(Value::as_object)
            .and_then(|user| {
                NESTED_AUTHOR_FIELDS
                    .iter()
                    .find_map(|field| string_field(user, field))
            })
    };
    top_level
        .or_else(nested)
        .map(|handle| handle.trim_start_matches('@').to_string())
        .filter(|handle| !handle.is_empty())
}

fn extract_created_at(
    object: &Map<String, Value>,
) -> Result<Option<DateTime<Utc>>, NormalizationError> {
    for field in CREATED_AT_FIELDS {
        match object.get(field) {
            None | Some(Value::Null) => {}
            Some(value) => return parse_timestamp(field, value).map(Some),
        }
    }
    Ok(None)
}

fn parse_timestamp(field: &'static str, value: &Value) -> Result<DateTime<Utc>, NormalizationError> {
    let invalid = |reason: String| NormalizationError::InvalidField { field, reason };
    match value {
        Value::String(raw) => {
            let raw = raw.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return Ok(parsed.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(raw, NAIVE_TIMESTAMP_FORMAT)
                .map(|naive| naive.and_utc())
                .map_err(|error| invalid(format!("unparseable timestamp {raw:?}: {error}")))
        }
        Value::Number(number) => number
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| invalid(format!("unix timestamp out of range: {number}"))),
        other => Err(invalid(format!(
            "expected timestamp string or unix seconds, got {}",
            value_kind(other)
        ))),
    }
}

fn extract_metrics(object: &Map<String, Value>) -> Result<EngagementMetrics, NormalizationError> {
    let public = object.get("public_metrics").and_then(Value::as_object);
    let count = |field: &'static str| -> Result<Option<i64>, NormalizationError> {
        let value = object
            .get(field)
            .or_else(|| public.and_then(|metrics| metrics.get(field)));
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(number)) => {
                number
                    .as_i64()
                    .map(Some)
                    .ok_or_else(|| NormalizationError::InvalidField {
                        field,
                        reason: format!("expected integer count, got {number}"),
                    })
            }
            Some(Value::String(raw)) => raw.trim().parse::<i64>().map(Some).map_err(|error| {
                NormalizationError::InvalidField {
                    field,
                    reason: format!("unparseable count {raw:?}: {error}"),
                }
            }),
            Some(other) => Err(NormalizationError::InvalidField {
                field,
                reason: format!("expected integer count, got {}", value_kind(other)),
            }),
        }
    };

    Ok(EngagementMetrics {
        retweet_count: count("retweet_count")?,
        reply_count: count("reply_count")?,
        like_count: count("like_count")?,
        quote_count: count("quote_count")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    fn ingested() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap()
    }

    fn run(value: Value) -> Result<CanonicalRecord, NormalizationError> {
        normalize(&RawItem(value), ingested())
    }

    #[test]
    fn source_id_becomes_key() {
        let record = run(json!({"id": "a", "text": "I love this!"})).unwrap();
        assert_eq!(record.record_key, "src:a");
        assert_eq!(record.source_id.as_deref(), Some("a"));
        assert_eq!(record.text, "I love this!");
        assert_eq!(record.status, ClassificationStatus::Unclassified);
        assert_eq!(record.ingested_at, ingested());
        assert_eq!(record.created_at, ingested());
    }

    #[test]
    fn integer_and_string_ids_agree() {
        let from_int = run(json!({"id": 1_234_567_890_123_u64, "text": "x"})).unwrap();
        let from_str = run(json!({"id_str": "1234567890123", "text": "x"})).unwrap();
        assert_eq!(from_int.record_key, from_str.record_key);
    }

    #[rstest]
    #[case(json!({"content": "from content"}), "from content")]
    #[case(json!({"full_text": "  spaced\n\nout  "}), "spaced out")]
    #[case(json!({"text": "   ", "body": "fallback body"}), "fallback body")]
    fn text_is_taken_from_known_fields(#[case] value: Value, #[case] expected: &str) {
        assert_eq!(run(value).unwrap().text, expected);
    }

    #[rstest]
    #[case(json!({"id": "1"}))]
    #[case(json!({"id": "1", "text": " \u{200B} \t"}))]
    #[case(json!({"id": "1", "text": 42}))]
    fn missing_text_is_rejected(#[case] value: Value) {
        assert_eq!(run(value), Err(NormalizationError::MissingText));
    }

    #[test]
    fn non_object_is_invalid_shape() {
        assert_eq!(
            run(json!("{not json")),
            Err(NormalizationError::InvalidShape("string"))
        );
        assert_eq!(run(json!([1, 2])), Err(NormalizationError::InvalidShape("array")));
    }

    #[test]
    fn array_id_is_invalid_field() {
        assert!(matches!(
            run(json!({"id": [1], "text": "x"})),
            Err(NormalizationError::InvalidField { field: "id", .. })
        ));
    }

    #[rstest]
    #[case(json!("2024-05-01T12:34:56Z"))]
    #[case(json!("2024-05-01T14:34:56+02:00"))]
    #[case(json!("2024-05-01 12:34:56"))]
    #[case(json!(1_714_566_896))]
    fn timestamps_in_supported_formats(#[case] created_at: Value) {
        let record = run(json!({"id": "t", "text": "x", "created_at": created_at})).unwrap();
        assert_eq!(
            record.created_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 34, 56).unwrap()
        );
    }

    #[test]
    fn unparseable_timestamp_is_invalid_field() {
        assert!(matches!(
            run(json!({"text": "x", "created_at": "yesterday"})),
            Err(NormalizationError::InvalidField {
                field: "created_at",
                ..
            })
        ));
    }

    #[test]
    fn content_hash_collapses_refetches_within_a_minute() {
        let first = run(json!({
            "username": "@Alice", "text": "Same  text", "created_at": "2024-05-01T12:34:10Z"
        }))
        .unwrap();
        let second = run(json!({
            "user": {"screen_name": "alice"}, "text": "Same text", "created_at": "2024-05-01T12:34:50Z"
        }))
        .unwrap();
        let later = run(json!({
            "username": "alice", "text": "Same text", "created_at": "2024-05-01T12:35:01Z"
        }))
        .unwrap();

        assert!(first.record_key.starts_with("hash:"));
        assert_eq!(first.record_key, second.record_key);
        assert_ne!(first.record_key, later.record_key);
        assert_eq!(first.author.as_deref(), Some("Alice"));
    }

    #[test]
    fn hash_key_without_timestamp_ignores_ingestion_time() {
        let value = json!({"author": "bob", "text": "no timestamp"});
        let a = normalize(&RawItem(value.clone()), ingested()).unwrap();
        let b = normalize(&RawItem(value), ingested() + chrono::Duration::hours(3)).unwrap();
        assert_eq!(a.record_key, b.record_key);
    }

    #[test]
    fn metadata_is_carried_through() {
        let record = run(json!({
            "id": 9,
            "text": "hello",
            "lang": "en",
            "retweet_count": 3,
            "like_count": "12",
            "public_metrics": {"reply_count": 1, "quote_count": 0}
        }))
        .unwrap();
        assert_eq!(record.lang.as_deref(), Some("en"));
        assert_eq!(
            record.metrics,
            EngagementMetrics {
                retweet_count: Some(3),
                reply_count: Some(1),
                like_count: Some(12),
                quote_count: Some(0),
            }
        );
    }

    #[test]
    fn fractional_count_is_invalid_field() {
        assert!(matches!(
            run(json!({"id": 1, "text": "x", "like_count": 1.5})),
            Err(NormalizationError::InvalidField {
                field: "like_count",
                ..
            })
        ));
    }
}
