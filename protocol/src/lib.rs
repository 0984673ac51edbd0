//! Shared wire model for the trip realtime channel and REST representation.
//!
//! This crate owns the JSON shapes exchanged with the booking backend: the
//! room join/leave messages the client sends, the events the server pushes,
//! and the canonical trip record returned by REST. Payloads keep unknown
//! fields in a `serde_json::Map` so domain additions on the backend survive a
//! round trip through the client cache.
//!
//! WIRE
//! ====
//! - client → server: `{"type":"join_room","entityId":…}`, `{"type":"leave_room","entityId":…}`
//! - server → client: `{"type":"entity_status_updated","entityId":…,"status":…,"timestamp":…,…}`
//! - server → client: `{"type":"room_joined"|"room_left","entityId":…}`

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Wire `type` of the status push event.
pub const EVENT_ENTITY_STATUS_UPDATED: &str = "entity_status_updated";
/// Wire `type` of the room-joined acknowledgement.
pub const EVENT_ROOM_JOINED: &str = "room_joined";
/// Wire `type` of the room-left acknowledgement.
pub const EVENT_ROOM_LEFT: &str = "room_left";

/// Error returned by the decode helpers in this crate.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The payload was not valid JSON or did not match the expected shape.
    #[error("invalid message json: {0}")]
    Json(#[from] serde_json::Error),
    /// The payload was JSON but carried no string `type` discriminator.
    #[error("message has no `type` field")]
    MissingType,
    /// A required field was absent for the given message type.
    #[error("message `{kind}` is missing field `{field}`")]
    MissingField { kind: String, field: &'static str },
    /// A timestamp string was neither RFC 3339 nor integer milliseconds.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

// =============================================================================
// ENTITY KEY
// =============================================================================

/// Identifier of a watched entity (a trip). Opaque to the client.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for EntityKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =============================================================================
// TIMESTAMP
// =============================================================================

/// Milliseconds since the Unix epoch.
///
/// Decodes from integer or float milliseconds, a string of digits, or an
/// RFC 3339 string (what a JavaScript backend emits for `Date` values).
/// Always encodes as integer milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    #[must_use]
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
            return Self(0);
        };
        Self(i64::try_from(dur.as_millis()).unwrap_or(i64::MAX))
    }

    /// Parse either integer milliseconds or an RFC 3339 timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidTimestamp`] when neither form matches.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let trimmed = raw.trim();
        if let Ok(ms) = trimmed.parse::<i64>() {
            return Ok(Self(ms));
        }
        let parsed = OffsetDateTime::parse(trimmed, &Rfc3339)
            .map_err(|_| ProtocolError::InvalidTimestamp(raw.to_owned()))?;
        let ms = parsed.unix_timestamp_nanos() / 1_000_000;
        i64::try_from(ms).map(Self).map_err(|_| ProtocolError::InvalidTimestamp(raw.to_owned()))
    }

    /// Render as RFC 3339 (UTC). Falls back to raw milliseconds when the value
    /// is outside the representable date range.
    #[must_use]
    pub fn to_rfc3339(self) -> String {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000_000)
            .ok()
            .and_then(|dt| dt.format(&Rfc3339).ok())
            .unwrap_or_else(|| self.0.to_string())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TimestampVisitor)
    }
}

struct TimestampVisitor;

impl Visitor<'_> for TimestampVisitor {
    type Value = Timestamp;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("epoch milliseconds or an RFC 3339 string")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Timestamp, E> {
        Ok(Timestamp(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Timestamp, E> {
        i64::try_from(v).map(Timestamp).map_err(|_| E::custom("timestamp out of range"))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Timestamp, E> {
        if !v.is_finite() {
            return Err(E::custom("timestamp is not finite"));
        }
        Ok(Timestamp(v.trunc() as i64))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Timestamp, E> {
        Timestamp::parse(v).map_err(E::custom)
    }
}

// =============================================================================
// CLIENT → SERVER
// =============================================================================

/// Messages the client sends over the realtime channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the per-entity room.
    JoinRoom {
        #[serde(rename = "entityId")]
        entity_id: EntityKey,
    },
    /// Leave the per-entity room.
    LeaveRoom {
        #[serde(rename = "entityId")]
        entity_id: EntityKey,
    },
}

impl ClientMessage {
    #[must_use]
    pub fn join(entity_id: EntityKey) -> Self {
        Self::JoinRoom { entity_id }
    }

    #[must_use]
    pub fn leave(entity_id: EntityKey) -> Self {
        Self::LeaveRoom { entity_id }
    }

    #[must_use]
    pub fn entity_id(&self) -> &EntityKey {
        match self {
            Self::JoinRoom { entity_id } | Self::LeaveRoom { entity_id } => entity_id,
        }
    }
}

/// Encode a client message as JSON text.
///
/// # Errors
///
/// Returns [`ProtocolError::Json`] if serialization fails.
pub fn encode_client_message(message: &ClientMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a client message from JSON text. Used by server-side peers and
/// test harnesses.
///
/// # Errors
///
/// Returns [`ProtocolError::Json`] for malformed or unknown messages.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

// =============================================================================
// SERVER → CLIENT
// =============================================================================

/// A pushed status change for one entity.
///
/// Only fields present on the wire are `Some`/present in `fields`; absence
/// means "unchanged", not "cleared".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityUpdate {
    pub entity_id: EntityKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Any other domain fields carried by the event.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EntityUpdate {
    /// Status-only update, the minimal diff the backend sends.
    #[must_use]
    pub fn status(entity_id: impl Into<EntityKey>, status: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            status: Some(status.into()),
            payment_status: None,
            timestamp: None,
            fields: Map::new(),
        }
    }

    /// When the change happened: `timestamp`, else an `updatedAt` carried
    /// among the extra fields.
    #[must_use]
    pub fn updated_at(&self) -> Option<Timestamp> {
        self.timestamp.or_else(|| self.fields.get("updatedAt").and_then(|v| Timestamp::deserialize(v).ok()))
    }

    /// Encode as a full server event (with the `type` discriminator).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Json`] if serialization fails.
    pub fn to_event_json(&self) -> Result<String, ProtocolError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.insert("type".to_owned(), Value::String(EVENT_ENTITY_STATUS_UPDATED.to_owned()));
        }
        Ok(serde_json::to_string(&value)?)
    }
}

/// Messages the server pushes over the realtime channel.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    EntityUpdated(EntityUpdate),
    RoomJoined { entity_id: EntityKey },
    RoomLeft { entity_id: EntityKey },
    /// A well-formed message with a `type` this client does not handle.
    Unknown { kind: String },
}

/// Decode one inbound text message.
///
/// # Errors
///
/// Returns [`ProtocolError`] for malformed JSON, a missing `type`, or a known
/// type whose required fields are absent.
pub fn decode_server_event(text: &str) -> Result<ServerEvent, ProtocolError> {
    let mut value: Value = serde_json::from_str(text)?;
    let Some(map) = value.as_object_mut() else {
        return Err(ProtocolError::MissingType);
    };
    let Some(Value::String(kind)) = map.remove("type") else {
        return Err(ProtocolError::MissingType);
    };

    let entity_id = map.get("entityId").and_then(Value::as_str).map(EntityKey::from);
    let missing = |kind: &str| ProtocolError::MissingField { kind: kind.to_owned(), field: "entityId" };

    match kind.as_str() {
        EVENT_ENTITY_STATUS_UPDATED => {
            if entity_id.is_none() {
                return Err(missing(&kind));
            }
            Ok(ServerEvent::EntityUpdated(serde_json::from_value(value)?))
        }
        EVENT_ROOM_JOINED => entity_id
            .map(|entity_id| ServerEvent::RoomJoined { entity_id })
            .ok_or_else(|| missing(&kind)),
        EVENT_ROOM_LEFT => entity_id
            .map(|entity_id| ServerEvent::RoomLeft { entity_id })
            .ok_or_else(|| missing(&kind)),
        _ => Ok(ServerEvent::Unknown { kind: kind.clone() }),
    }
}

// =============================================================================
// REST REPRESENTATION
// =============================================================================

/// Canonical trip representation returned by the REST API.
///
/// The identity may arrive as `id`, as Mongo's `_id`, or as both (documents
/// serialized with virtuals). `id` wins when both are present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawTripRecord")]
pub struct TripRecord {
    pub id: EntityKey,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
    /// Remaining domain fields (destination, guide, notes, …).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTripRecord {
    #[serde(default)]
    id: Option<EntityKey>,
    #[serde(default, rename = "_id")]
    mongo_id: Option<EntityKey>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    updated_at: Option<Timestamp>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl TryFrom<RawTripRecord> for TripRecord {
    type Error = ProtocolError;

    fn try_from(raw: RawTripRecord) -> Result<Self, ProtocolError> {
        let id = raw
            .id
            .or(raw.mongo_id)
            .ok_or_else(|| ProtocolError::MissingField { kind: "trip".to_owned(), field: "id" })?;
        Ok(Self {
            id,
            status: raw.status,
            payment_status: raw.payment_status,
            updated_at: raw.updated_at,
            fields: raw.fields,
        })
    }
}

impl TripRecord {
    #[must_use]
    pub fn new(id: impl Into<EntityKey>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
            payment_status: None,
            updated_at: None,
            fields: Map::new(),
        }
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
