//! Broker properties record and builder.
//!
//! Messages exchanged with the service carry their metadata out-of-band, as
//! a JSON object in a `BrokerProperties` transport header. This module
//! models that metadata as two types converging on one codec:
//!
//! - [`BrokerProperties`]: the read-only record produced by
//!   [`decode`](BrokerProperties::decode) on the receive path. Fields the
//!   service assigns (delivery count, lock data, enqueue data) can only
//!   enter a record this way.
//! - [`BrokerPropertiesBuilder`]: the mutable assembly used on the publish
//!   path, exposing setters for the caller-settable fields only.
//!
//! Every field is independently present or absent. Absence is semantically
//! distinct from a zero or empty value (a `SequenceNumber` of `0` is a real
//! sequence number), and absent fields are omitted from the encoded output
//! entirely.
//!
//! ## Timestamps
//!
//! Wire timestamps are normalized to the process-local timezone when
//! decoded, and encoded as the zone-less `YYYY-MM-DD HH:MM:SS` clock
//! reading of whatever zone the value carries. See
//! [`encode`](BrokerProperties::encode) for the implications on the publish
//! path.

use chrono::{DateTime, FixedOffset, TimeZone};

use crate::codec::{self, field, DecodeError, EncodeError, FieldValue, FIELDS};

/// Name of the transport header carrying encoded broker properties.
///
/// HTTP header names are case-insensitive; receiving stacks commonly hand
/// the value back under the lowercased name.
pub const BROKER_PROPERTIES_HEADER: &str = "BrokerProperties";

/// Metadata attached to a message exchanged with the service.
///
/// A record is read-only: it is either decoded from an inbound header or
/// produced by [`BrokerPropertiesBuilder::finish`]. To derive a new outbound
/// record from a received one, go through
/// [`to_builder`](BrokerProperties::to_builder).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerProperties {
    pub(crate) values: codec::FieldMap,
}

impl BrokerProperties {
    /// Decode properties from the JSON carried in the header.
    ///
    /// An empty string is treated as "no properties": the result has every
    /// field absent. Fails when the source is non-empty, syntactically
    /// invalid JSON, or when a present field holds a value of the wrong type
    /// or an unparsable date-time string. Unknown keys are ignored.
    #[tracing::instrument(skip_all)]
    pub fn decode(source: &str) -> Result<Self, DecodeError> {
        Ok(Self {
            values: codec::decode(source)?,
        })
    }

    /// Decode properties from an optional raw header value.
    ///
    /// A missing header decodes like an empty one.
    pub fn from_header(value: Option<&str>) -> Result<Self, DecodeError> {
        Self::decode(value.unwrap_or_default())
    }

    /// Encode the properties into the JSON object the service expects.
    ///
    /// Exactly the present fields are emitted; a record with every field
    /// absent encodes to `"{}"`, never to null or an empty string.
    ///
    /// Timestamps are emitted as the clock reading of the zone each value
    /// carries. Decoded records hold process-local values, so the emitted
    /// literal is the local reading; callers that need the service to read
    /// the literal as UTC must supply UTC-zoned values when building.
    #[tracing::instrument(skip_all)]
    pub fn encode(&self) -> Result<String, EncodeError> {
        codec::encode(&self.values)
    }

    /// Start a builder carrying over the caller-settable fields.
    ///
    /// Server-assigned fields are dropped: they cannot be supplied on the
    /// publish path, so a republished message never carries stale delivery
    /// or lock data.
    pub fn to_builder(&self) -> BrokerPropertiesBuilder {
        let values = FIELDS
            .iter()
            .filter(|spec| !spec.server_assigned)
            .filter_map(|spec| {
                self.values
                    .get(spec.name)
                    .map(|value| (spec.name, value.clone()))
            })
            .collect();
        BrokerPropertiesBuilder { values }
    }

    /// MIME type of the message body.
    pub fn content_type(&self) -> Option<&str> {
        self.text(field::CONTENT_TYPE)
    }

    /// Identifier correlating this message to another.
    pub fn correlation_id(&self) -> Option<&str> {
        self.text(field::CORRELATION_ID)
    }

    /// Session the message belongs to.
    pub fn session_id(&self) -> Option<&str> {
        self.text(field::SESSION_ID)
    }

    /// Number of deliveries attempted so far. Server-assigned.
    pub fn delivery_count(&self) -> Option<i64> {
        self.integer(field::DELIVERY_COUNT)
    }

    /// Instant the current peek-lock expires. Server-assigned.
    pub fn locked_until_utc(&self) -> Option<DateTime<FixedOffset>> {
        self.timestamp(field::LOCKED_UNTIL_UTC)
    }

    /// Token identifying the current peek-lock. Server-assigned.
    pub fn lock_token(&self) -> Option<&str> {
        self.text(field::LOCK_TOKEN)
    }

    /// Caller-supplied message identifier.
    pub fn message_id(&self) -> Option<&str> {
        self.text(field::MESSAGE_ID)
    }

    /// Application-defined label.
    pub fn label(&self) -> Option<&str> {
        self.text(field::LABEL)
    }

    /// Address replies should be sent to.
    pub fn reply_to(&self) -> Option<&str> {
        self.text(field::REPLY_TO)
    }

    /// Instant the service accepted the message. Server-assigned.
    pub fn enqueued_time_utc(&self) -> Option<DateTime<FixedOffset>> {
        self.timestamp(field::ENQUEUED_TIME_UTC)
    }

    /// Position assigned by the service. Server-assigned; `0` is a valid
    /// position, distinct from the field being absent.
    pub fn sequence_number(&self) -> Option<i64> {
        self.integer(field::SEQUENCE_NUMBER)
    }

    /// Message lifetime in seconds.
    pub fn time_to_live(&self) -> Option<f64> {
        self.seconds(field::TIME_TO_LIVE)
    }

    /// Address the message is intended for.
    pub fn to(&self) -> Option<&str> {
        self.text(field::TO)
    }

    /// Instant before which the message stays invisible to consumers.
    pub fn scheduled_enqueue_time_utc(&self) -> Option<DateTime<FixedOffset>> {
        self.timestamp(field::SCHEDULED_ENQUEUE_TIME_UTC)
    }

    /// Session replies should be sent to.
    pub fn reply_to_session_id(&self) -> Option<&str> {
        self.text(field::REPLY_TO_SESSION_ID)
    }

    /// Partition the message is routed to.
    pub fn partition_key(&self) -> Option<&str> {
        self.text(field::PARTITION_KEY)
    }

    fn text(&self, name: &'static str) -> Option<&str> {
        match self.values.get(name) {
            Some(FieldValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    fn integer(&self, name: &'static str) -> Option<i64> {
        match self.values.get(name) {
            Some(FieldValue::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    fn seconds(&self, name: &'static str) -> Option<f64> {
        match self.values.get(name) {
            Some(FieldValue::Seconds(secs)) => Some(*secs),
            _ => None,
        }
    }

    fn timestamp(&self, name: &'static str) -> Option<DateTime<FixedOffset>> {
        match self.values.get(name) {
            Some(FieldValue::Timestamp(at)) => Some(*at),
            _ => None,
        }
    }
}

/// Builder for properties assembled on the publish path.
///
/// Starts with every field absent. Only caller-settable fields are exposed;
/// server-assigned fields can only enter a [`BrokerProperties`] through
/// [`BrokerProperties::decode`].
#[derive(Debug, Clone, Default)]
pub struct BrokerPropertiesBuilder {
    pub(crate) values: codec::FieldMap,
}

impl BrokerPropertiesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the MIME type of the message body.
    pub fn with_content_type(mut self, value: impl Into<String>) -> Self {
        self.values
            .insert(field::CONTENT_TYPE, FieldValue::Text(value.into()));
        self
    }

    /// Sets the identifier correlating this message to another.
    pub fn with_correlation_id(mut self, value: impl Into<String>) -> Self {
        self.values
            .insert(field::CORRELATION_ID, FieldValue::Text(value.into()));
        self
    }

    /// Sets the session the message belongs to.
    pub fn with_session_id(mut self, value: impl Into<String>) -> Self {
        self.values
            .insert(field::SESSION_ID, FieldValue::Text(value.into()));
        self
    }

    /// Sets the message identifier.
    pub fn with_message_id(mut self, value: impl Into<String>) -> Self {
        self.values
            .insert(field::MESSAGE_ID, FieldValue::Text(value.into()));
        self
    }

    /// Sets the application-defined label.
    pub fn with_label(mut self, value: impl Into<String>) -> Self {
        self.values.insert(field::LABEL, FieldValue::Text(value.into()));
        self
    }

    /// Sets the address replies should be sent to.
    pub fn with_reply_to(mut self, value: impl Into<String>) -> Self {
        self.values
            .insert(field::REPLY_TO, FieldValue::Text(value.into()));
        self
    }

    /// Sets the message lifetime in seconds.
    pub fn with_time_to_live(mut self, seconds: f64) -> Self {
        self.values
            .insert(field::TIME_TO_LIVE, FieldValue::Seconds(seconds));
        self
    }

    /// Sets the address the message is intended for.
    pub fn with_to(mut self, value: impl Into<String>) -> Self {
        self.values.insert(field::TO, FieldValue::Text(value.into()));
        self
    }

    /// Sets the instant before which the message stays invisible.
    ///
    /// The value keeps the zone it arrives in; [`BrokerProperties::encode`]
    /// emits its clock reading literally.
    pub fn with_scheduled_enqueue_time_utc<Tz: TimeZone>(mut self, at: DateTime<Tz>) -> Self {
        self.values.insert(
            field::SCHEDULED_ENQUEUE_TIME_UTC,
            FieldValue::Timestamp(at.fixed_offset()),
        );
        self
    }

    /// Sets the session replies should be sent to.
    pub fn with_reply_to_session_id(mut self, value: impl Into<String>) -> Self {
        self.values
            .insert(field::REPLY_TO_SESSION_ID, FieldValue::Text(value.into()));
        self
    }

    /// Sets the partition the message is routed to.
    pub fn with_partition_key(mut self, value: impl Into<String>) -> Self {
        self.values
            .insert(field::PARTITION_KEY, FieldValue::Text(value.into()));
        self
    }

    /// Finish building, producing an encodable record.
    pub fn finish(self) -> BrokerProperties {
        BrokerProperties {
            values: self.values,
        }
    }
}
