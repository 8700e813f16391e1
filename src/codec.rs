//! Wire codec for the `BrokerProperties` header.
//!
//! The mapping between wire keys and field kinds lives in a single static
//! table ([`FIELDS`]) consumed by both [`decode`] and [`encode`], so the two
//! directions cannot drift apart. Values are stored per field in a tagged
//! representation; presence in the map is the only "field is set" signal, so
//! a zero or empty value is never confused with an absent one.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, Local, LocalResult, NaiveDateTime, TimeZone};
use serde_json::{Map, Number, Value};
use tracing_error::SpanTrace;

/// Wire key names, shared by the field table, the accessors and the builder.
pub(crate) mod field {
    pub const CONTENT_TYPE: &str = "ContentType";
    pub const CORRELATION_ID: &str = "CorrelationId";
    pub const SESSION_ID: &str = "SessionId";
    pub const DELIVERY_COUNT: &str = "DeliveryCount";
    pub const LOCKED_UNTIL_UTC: &str = "LockedUntilUtc";
    pub const LOCK_TOKEN: &str = "LockToken";
    pub const MESSAGE_ID: &str = "MessageId";
    pub const LABEL: &str = "Label";
    pub const REPLY_TO: &str = "ReplyTo";
    pub const ENQUEUED_TIME_UTC: &str = "EnqueuedTimeUtc";
    pub const SEQUENCE_NUMBER: &str = "SequenceNumber";
    pub const TIME_TO_LIVE: &str = "TimeToLive";
    pub const TO: &str = "To";
    pub const SCHEDULED_ENQUEUE_TIME_UTC: &str = "ScheduledEnqueueTimeUtc";
    pub const REPLY_TO_SESSION_ID: &str = "ReplyToSessionId";
    pub const PARTITION_KEY: &str = "PartitionKey";
}

/// Value kind a wire field carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldKind {
    /// A JSON string, copied verbatim.
    Text,
    /// A JSON integer.
    Integer,
    /// A duration in seconds; the service accepts and emits it as a JSON
    /// number, but tolerates string-encoded numbers on the way in.
    Seconds,
    /// A date-time string, normalized to the process-local timezone.
    Timestamp,
}

/// One entry of the wire mapping.
pub(crate) struct FieldSpec {
    pub(crate) name: &'static str,
    pub(crate) kind: FieldKind,
    /// Server-assigned fields only ever enter a record through decode and
    /// are excluded from the publish-path builder.
    pub(crate) server_assigned: bool,
}

/// The full wire mapping, in the order the service documents the fields.
pub(crate) const FIELDS: [FieldSpec; 16] = [
    FieldSpec { name: field::CONTENT_TYPE, kind: FieldKind::Text, server_assigned: false },
    FieldSpec { name: field::CORRELATION_ID, kind: FieldKind::Text, server_assigned: false },
    FieldSpec { name: field::SESSION_ID, kind: FieldKind::Text, server_assigned: false },
    FieldSpec { name: field::DELIVERY_COUNT, kind: FieldKind::Integer, server_assigned: true },
    FieldSpec { name: field::LOCKED_UNTIL_UTC, kind: FieldKind::Timestamp, server_assigned: true },
    FieldSpec { name: field::LOCK_TOKEN, kind: FieldKind::Text, server_assigned: true },
    FieldSpec { name: field::MESSAGE_ID, kind: FieldKind::Text, server_assigned: false },
    FieldSpec { name: field::LABEL, kind: FieldKind::Text, server_assigned: false },
    FieldSpec { name: field::REPLY_TO, kind: FieldKind::Text, server_assigned: false },
    FieldSpec { name: field::ENQUEUED_TIME_UTC, kind: FieldKind::Timestamp, server_assigned: true },
    FieldSpec { name: field::SEQUENCE_NUMBER, kind: FieldKind::Integer, server_assigned: true },
    FieldSpec { name: field::TIME_TO_LIVE, kind: FieldKind::Seconds, server_assigned: false },
    FieldSpec { name: field::TO, kind: FieldKind::Text, server_assigned: false },
    FieldSpec { name: field::SCHEDULED_ENQUEUE_TIME_UTC, kind: FieldKind::Timestamp, server_assigned: false },
    FieldSpec { name: field::REPLY_TO_SESSION_ID, kind: FieldKind::Text, server_assigned: false },
    FieldSpec { name: field::PARTITION_KEY, kind: FieldKind::Text, server_assigned: false },
];

/// Decoded value of a single wire field.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FieldValue {
    Text(String),
    Integer(i64),
    Seconds(f64),
    Timestamp(DateTime<FixedOffset>),
}

/// Per-field storage keyed by the static wire name.
pub(crate) type FieldMap = HashMap<&'static str, FieldValue>;

/// Format emitted for timestamps.
const WIRE_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

/// Zone-less formats accepted on decode, fractional seconds tolerated.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Decode the raw header value into a field map.
///
/// An empty source means the header carried no properties. Valid JSON that
/// is not an object carries none either; only syntactically invalid JSON and
/// unparsable field values are errors.
pub(crate) fn decode(source: &str) -> Result<FieldMap, DecodeError> {
    let mut values = FieldMap::new();
    if source.is_empty() {
        return Ok(values);
    }

    let parsed: Value = serde_json::from_str(source).map_err(DecodeError::json)?;
    let Value::Object(mut object) = parsed else {
        return Ok(values);
    };

    for spec in &FIELDS {
        let Some(raw) = object.remove(spec.name) else {
            continue;
        };
        // A null carries no value; the service never emits one, but a stored
        // blob might.
        if raw.is_null() {
            continue;
        }
        let value = match spec.kind {
            FieldKind::Text => text(spec.name, raw)?,
            FieldKind::Integer => integer(spec.name, raw)?,
            FieldKind::Seconds => seconds(spec.name, raw)?,
            FieldKind::Timestamp => timestamp(spec.name, raw)?,
        };
        values.insert(spec.name, value);
    }

    if !object.is_empty() {
        tracing::trace!(ignored = ?object.keys().collect::<Vec<_>>(), "Ignoring unknown broker properties");
    }

    Ok(values)
}

/// Encode a field map into the JSON object the service expects.
///
/// Exactly the present fields are emitted; an empty map encodes to `{}`,
/// which the service distinguishes from a missing header.
pub(crate) fn encode(values: &FieldMap) -> Result<String, EncodeError> {
    let mut object = Map::new();

    for spec in &FIELDS {
        let Some(value) = values.get(spec.name) else {
            continue;
        };
        let json = match value {
            FieldValue::Text(text) => Value::String(text.clone()),
            FieldValue::Integer(n) => Value::Number((*n).into()),
            FieldValue::Seconds(secs) => Number::from_f64(*secs)
                .map(Value::Number)
                .ok_or_else(|| EncodeError::non_finite(spec.name, *secs))?,
            // The clock reading is emitted in the zone the value carries,
            // without re-normalizing to UTC.
            // TODO: confirm the service tolerates non-UTC literals here
            // before relying on zone-shifted values on the publish path.
            FieldValue::Timestamp(at) => Value::String(at.format(WIRE_TIMESTAMP).to_string()),
        };
        object.insert(spec.name.to_owned(), json);
    }

    serde_json::to_string(&object).map_err(EncodeError::json)
}

fn text(field: &'static str, raw: Value) -> Result<FieldValue, DecodeError> {
    match raw {
        Value::String(text) => Ok(FieldValue::Text(text)),
        other => Err(DecodeError::unexpected_type(field, "a JSON string", other)),
    }
}

fn integer(field: &'static str, raw: Value) -> Result<FieldValue, DecodeError> {
    match raw.as_i64() {
        Some(n) => Ok(FieldValue::Integer(n)),
        None => Err(DecodeError::unexpected_type(field, "a JSON integer", raw)),
    }
}

fn seconds(field: &'static str, raw: Value) -> Result<FieldValue, DecodeError> {
    match &raw {
        Value::Number(n) => match n.as_f64() {
            Some(secs) => Ok(FieldValue::Seconds(secs)),
            None => Err(DecodeError::unexpected_type(field, "a JSON number", raw)),
        },
        Value::String(text) => match text.trim().parse::<f64>() {
            Ok(secs) => Ok(FieldValue::Seconds(secs)),
            Err(_) => Err(DecodeError::unexpected_type(
                field,
                "a JSON number or a string-encoded number",
                raw,
            )),
        },
        _ => Err(DecodeError::unexpected_type(
            field,
            "a JSON number or a string-encoded number",
            raw,
        )),
    }
}

fn timestamp(field: &'static str, raw: Value) -> Result<FieldValue, DecodeError> {
    let Value::String(text) = raw else {
        return Err(DecodeError::unexpected_type(field, "a date-time string", raw));
    };
    let at = parse_timestamp(&text).ok_or_else(|| DecodeError::timestamp(field, &text))?;
    Ok(FieldValue::Timestamp(at))
}

/// Parse a wire date-time string and normalize it to the process-local
/// timezone.
///
/// Zone-carrying inputs (RFC 3339, RFC 2822 as emitted by the service) are
/// converted to local time. Zone-less readings are interpreted as local
/// clock time, which keeps decode/encode idempotent since [`encode`] emits
/// zone-less literals.
fn parse_timestamp(text: &str) -> Option<DateTime<FixedOffset>> {
    let text = text.trim();

    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Local).fixed_offset());
    }
    if let Ok(at) = DateTime::parse_from_rfc2822(text) {
        return Some(at.with_timezone(&Local).fixed_offset());
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return local_clock(naive);
        }
    }

    None
}

/// Interpret a zone-less clock reading in the process-local timezone.
///
/// A reading inside a DST fold maps to the earlier instant; a reading inside
/// a DST gap has no instant to map to and is rejected.
fn local_clock(naive: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(at) => Some(at.fixed_offset()),
        LocalResult::Ambiguous(earlier, _) => Some(earlier.fixed_offset()),
        LocalResult::None => None,
    }
}

/// Error returned when a `BrokerProperties` header cannot be decoded.
///
/// Decoding is all-or-nothing: a malformed present field fails the whole
/// operation rather than being dropped.
#[derive(Debug)]
pub struct DecodeError {
    context: SpanTrace,
    kind: DecodeErrorKind,
}

/// Decode error kinds.
#[derive(Debug)]
pub enum DecodeErrorKind {
    /// The header value was not valid JSON.
    Json(serde_json::Error),
    /// A timestamp field carried a string no supported format could parse,
    /// or a clock reading that does not exist in the local timezone.
    Timestamp {
        field: &'static str,
        value: String,
    },
    /// A field carried a JSON value of the wrong type.
    UnexpectedType {
        field: &'static str,
        expected: &'static str,
        found: Value,
    },
}

impl DecodeError {
    fn json(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DecodeErrorKind::Json(err),
        }
    }

    fn timestamp(field: &'static str, value: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DecodeErrorKind::Timestamp {
                field,
                value: value.to_owned(),
            },
        }
    }

    fn unexpected_type(field: &'static str, expected: &'static str, found: Value) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DecodeErrorKind::UnexpectedType {
                field,
                expected,
                found,
            },
        }
    }

    /// Classification of the failure.
    pub fn kind(&self) -> &DecodeErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DecodeErrorKind::Json(err) => {
                writeln!(f, "Broker properties are not valid JSON: {err}")
            }
            DecodeErrorKind::Timestamp { field, value } => {
                writeln!(f, "Unsupported date-time `{value}` in `{field}`")
            }
            DecodeErrorKind::UnexpectedType {
                field,
                expected,
                found,
            } => {
                writeln!(f, "`{field}` must be {expected}, got `{found}`")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DecodeErrorKind::Json(err) => Some(err),
            _ => None,
        }
    }
}

/// Error returned when broker properties cannot be serialized.
#[derive(Debug)]
pub struct EncodeError {
    context: SpanTrace,
    kind: EncodeErrorKind,
}

/// Encode error kinds.
#[derive(Debug)]
pub enum EncodeErrorKind {
    /// The JSON serializer failed.
    Json(serde_json::Error),
    /// A seconds field held a value JSON cannot represent.
    NonFinite { field: &'static str, value: f64 },
}

impl EncodeError {
    fn json(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: EncodeErrorKind::Json(err),
        }
    }

    fn non_finite(field: &'static str, value: f64) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: EncodeErrorKind::NonFinite { field, value },
        }
    }

    /// Classification of the failure.
    pub fn kind(&self) -> &EncodeErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            EncodeErrorKind::Json(err) => {
                writeln!(f, "Broker properties could not be serialized: {err}")
            }
            EncodeErrorKind::NonFinite { field, value } => {
                writeln!(f, "`{field}` must be finite to serialize, got {value}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            EncodeErrorKind::Json(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn empty_source_carries_no_properties() {
        let values = decode("").unwrap();
        assert!(values.is_empty());
        assert_eq!(encode(&values).unwrap(), "{}");
    }

    #[test]
    fn non_object_json_carries_no_properties() {
        for source in ["null", "[1,2,3]", "\"text\"", "42"] {
            let values = decode(source).unwrap();
            assert!(values.is_empty(), "expected no properties for {source}");
        }
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = decode("{not json").unwrap_err();
        assert!(matches!(err.kind(), DecodeErrorKind::Json(_)));
    }

    #[test]
    fn zero_valued_fields_are_present() {
        let values = decode(r#"{"SequenceNumber":0,"DeliveryCount":0}"#).unwrap();
        assert_eq!(values.get(field::SEQUENCE_NUMBER), Some(&FieldValue::Integer(0)));
        assert_eq!(values.get(field::DELIVERY_COUNT), Some(&FieldValue::Integer(0)));
    }

    #[test]
    fn null_values_count_as_absent() {
        let values = decode(r#"{"LockToken":null,"Label":"orders"}"#).unwrap();
        assert!(!values.contains_key(field::LOCK_TOKEN));
        assert_eq!(
            values.get(field::LABEL),
            Some(&FieldValue::Text("orders".to_owned()))
        );
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let values = decode(r#"{"NotAProperty":1,"Label":"orders"}"#).unwrap();
        assert_eq!(values.len(), 1);
        assert!(values.contains_key(field::LABEL));
    }

    #[test]
    fn time_to_live_coerces_numbers_and_numeric_strings() {
        for source in [r#"{"TimeToLive":30}"#, r#"{"TimeToLive":"30"}"#] {
            let values = decode(source).unwrap();
            assert_eq!(values.get(field::TIME_TO_LIVE), Some(&FieldValue::Seconds(30.0)));
        }

        let values = decode(r#"{"TimeToLive":"2.5"}"#).unwrap();
        assert_eq!(values.get(field::TIME_TO_LIVE), Some(&FieldValue::Seconds(2.5)));
    }

    #[test]
    fn non_numeric_time_to_live_is_rejected() {
        for source in [r#"{"TimeToLive":"soon"}"#, r#"{"TimeToLive":true}"#] {
            let err = decode(source).unwrap_err();
            assert!(
                matches!(err.kind(), DecodeErrorKind::UnexpectedType { field, .. } if *field == field::TIME_TO_LIVE),
                "expected type error for {source}"
            );
        }
    }

    #[test]
    fn integer_fields_reject_strings_and_fractions() {
        for source in [r#"{"DeliveryCount":"3"}"#, r#"{"SequenceNumber":1.5}"#] {
            let err = decode(source).unwrap_err();
            assert!(matches!(err.kind(), DecodeErrorKind::UnexpectedType { .. }));
        }
    }

    #[test]
    fn text_fields_reject_non_strings() {
        let err = decode(r#"{"ContentType":42}"#).unwrap_err();
        assert!(
            matches!(err.kind(), DecodeErrorKind::UnexpectedType { field, .. } if *field == field::CONTENT_TYPE)
        );
    }

    #[test]
    fn zone_less_timestamps_read_as_local_clock_time() {
        let values = decode(r#"{"EnqueuedTimeUtc":"2024-01-15 12:00:00"}"#).unwrap();
        let expected = Local
            .with_ymd_and_hms(2024, 1, 15, 12, 0, 0)
            .unwrap()
            .fixed_offset();
        assert_eq!(values.get(field::ENQUEUED_TIME_UTC), Some(&FieldValue::Timestamp(expected)));
    }

    #[test]
    fn zoned_timestamps_normalize_to_the_local_zone() {
        let sources = [
            r#"{"LockedUntilUtc":"Mon, 15 Jan 2024 12:00:00 GMT"}"#,
            r#"{"LockedUntilUtc":"2024-01-15T12:00:00Z"}"#,
            r#"{"LockedUntilUtc":"2024-01-15T14:00:00+02:00"}"#,
        ];
        let instant = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();

        for source in sources {
            let values = decode(source).unwrap();
            let Some(FieldValue::Timestamp(at)) = values.get(field::LOCKED_UNTIL_UTC) else {
                panic!("missing timestamp for {source}");
            };
            assert_eq!(*at, instant, "wrong instant for {source}");
            assert_eq!(
                at.offset(),
                instant.with_timezone(&Local).fixed_offset().offset(),
                "wrong zone for {source}"
            );
        }
    }

    #[test]
    fn fractional_seconds_are_accepted_and_truncated_on_encode() {
        let values = decode(r#"{"EnqueuedTimeUtc":"2024-01-15 12:00:00.750"}"#).unwrap();
        let encoded = encode(&values).unwrap();
        let object: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            object[field::ENQUEUED_TIME_UTC],
            Value::String("2024-01-15 12:00:00".to_owned())
        );
    }

    #[test]
    fn unparsable_timestamps_are_rejected() {
        let err = decode(r#"{"EnqueuedTimeUtc":"whenever"}"#).unwrap_err();
        assert!(
            matches!(err.kind(), DecodeErrorKind::Timestamp { field, .. } if *field == field::ENQUEUED_TIME_UTC)
        );

        let err = decode(r#"{"EnqueuedTimeUtc":1704067200}"#).unwrap_err();
        assert!(matches!(err.kind(), DecodeErrorKind::UnexpectedType { .. }));
    }

    #[test]
    fn gmt_timestamp_encodes_as_the_local_clock_reading() {
        let values = decode(r#"{"EnqueuedTimeUtc":"Mon, 15 Jan 2024 12:00:00 GMT"}"#).unwrap();
        let encoded = encode(&values).unwrap();

        let expected = Utc
            .with_ymd_and_hms(2024, 1, 15, 12, 0, 0)
            .unwrap()
            .with_timezone(&Local)
            .format(WIRE_TIMESTAMP)
            .to_string();
        let object: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(object[field::ENQUEUED_TIME_UTC], Value::String(expected));

        // A second decode of our own output lands on the same instant.
        let again = decode(&encoded).unwrap();
        assert_eq!(again.get(field::ENQUEUED_TIME_UTC), values.get(field::ENQUEUED_TIME_UTC));
    }

    #[test]
    fn encode_emits_exactly_the_present_fields() {
        let mut values = FieldMap::new();
        values.insert(field::MESSAGE_ID, FieldValue::Text("m-1".to_owned()));
        values.insert(field::SEQUENCE_NUMBER, FieldValue::Integer(7));
        values.insert(field::TIME_TO_LIVE, FieldValue::Seconds(30.0));

        let object: Value = serde_json::from_str(&encode(&values).unwrap()).unwrap();
        let keys: Vec<_> = object.as_object().unwrap().keys().cloned().collect();
        let mut expected = vec![
            field::MESSAGE_ID.to_owned(),
            field::SEQUENCE_NUMBER.to_owned(),
            field::TIME_TO_LIVE.to_owned(),
        ];
        expected.sort();
        let mut keys_sorted = keys;
        keys_sorted.sort();
        assert_eq!(keys_sorted, expected);

        assert_eq!(object[field::SEQUENCE_NUMBER], Value::Number(7.into()));
        assert_eq!(object[field::TIME_TO_LIVE], Value::Number(Number::from_f64(30.0).unwrap()));
    }

    #[test]
    fn non_finite_seconds_fail_to_encode() {
        let mut values = FieldMap::new();
        values.insert(field::TIME_TO_LIVE, FieldValue::Seconds(f64::INFINITY));

        let err = encode(&values).unwrap_err();
        assert!(
            matches!(err.kind(), EncodeErrorKind::NonFinite { field, .. } if *field == field::TIME_TO_LIVE)
        );
    }

    #[test]
    fn decode_of_encode_is_identity_on_the_field_map() {
        let mut values = FieldMap::new();
        values.insert(field::CONTENT_TYPE, FieldValue::Text("application/json".to_owned()));
        values.insert(field::DELIVERY_COUNT, FieldValue::Integer(2));
        values.insert(field::SEQUENCE_NUMBER, FieldValue::Integer(0));
        values.insert(field::TIME_TO_LIVE, FieldValue::Seconds(90.5));
        values.insert(
            field::SCHEDULED_ENQUEUE_TIME_UTC,
            FieldValue::Timestamp(
                Local
                    .with_ymd_and_hms(2024, 5, 17, 8, 30, 0)
                    .unwrap()
                    .fixed_offset(),
            ),
        );

        let round_tripped = decode(&encode(&values).unwrap()).unwrap();
        assert_eq!(round_tripped, values);
    }
}
