//! Wire message definitions
//!
//! Every frame a peer sends is a single JSON object carrying an identifier, a
//! schema identifier and a numeric message type. The hub never interprets these
//! fields; decoding only proves the frame is well formed before it is relayed.

use std::fmt;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// Maximum accepted frame size (1MB)
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Errors that can occur while decoding or encoding a frame
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame is not valid UTF-8")]
    NotUtf8,

    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_LENGTH})")]
    TooLarge(usize),
}

/// Result type for message operations
pub type MessageResult<T> = Result<T, MessageError>;

/// Top-level fields outside the known schema, in arrival order
///
/// Values are held as raw JSON text, so numbers of any size or precision,
/// string escapes and nested key order reach other peers exactly as sent.
#[derive(Debug, Clone, Default)]
pub struct Extras(Vec<(String, Box<RawValue>)>);

impl Extras {
    /// Create an empty set of extra fields
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field
    pub fn push(&mut self, key: impl Into<String>, value: Box<RawValue>) {
        self.0.push((key.into(), value));
    }

    /// Raw JSON text of the first field named `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.get())
    }

    /// Iterate over `(key, raw JSON)` pairs in arrival order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.get()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for Extras {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

/// A message exchanged between peers
///
/// Unknown top-level fields are captured in `extra` and written back out on
/// encode after the known fields, so a relayed frame carries everything the
/// publisher sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Peer-provided identifier, `ID` on the wire
    pub id: String,
    /// Schema identifier
    pub schema_id: String,
    /// Numeric message type, opaque to the hub
    pub message_type: i64,
    /// Fields outside the known schema, forwarded untouched
    pub extra: Extras,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3 + self.extra.len()))?;
        map.serialize_entry("ID", &self.id)?;
        map.serialize_entry("schema_id", &self.schema_id)?;
        map.serialize_entry("message_type", &self.message_type)?;
        for (key, value) in &self.extra.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(MessageVisitor)
    }
}

struct MessageVisitor;

impl<'de> Visitor<'de> for MessageVisitor {
    type Value = Message;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON object with ID, schema_id and message_type")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Message, A::Error> {
        let mut id = None;
        let mut schema_id = None;
        let mut message_type = None;
        let mut extra = Extras::new();

        while let Some(key) = map.next_key::<String>()? {
            if key == "ID" {
                set_once(&mut id, "ID", map.next_value()?)?;
            } else if key == "schema_id" {
                set_once(&mut schema_id, "schema_id", map.next_value()?)?;
            } else if key == "message_type" {
                set_once(&mut message_type, "message_type", map.next_value()?)?;
            } else {
                extra.push(key, map.next_value()?);
            }
        }

        Ok(Message {
            id: id.ok_or_else(|| de::Error::missing_field("ID"))?,
            schema_id: schema_id.ok_or_else(|| de::Error::missing_field("schema_id"))?,
            message_type: message_type.ok_or_else(|| de::Error::missing_field("message_type"))?,
            extra,
        })
    }
}

fn set_once<T, E: de::Error>(slot: &mut Option<T>, field: &'static str, value: T) -> Result<(), E> {
    if slot.is_some() {
        return Err(E::duplicate_field(field));
    }
    *slot = Some(value);
    Ok(())
}

impl Message {
    /// Create a message with no extra fields
    pub fn new(id: impl Into<String>, schema_id: impl Into<String>, message_type: i64) -> Self {
        Self {
            id: id.into(),
            schema_id: schema_id.into(),
            message_type,
            extra: Extras::new(),
        }
    }

    /// Decode a text frame
    pub fn from_json(text: &str) -> MessageResult<Self> {
        if text.len() > MAX_FRAME_LENGTH {
            return Err(MessageError::TooLarge(text.len()));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Decode a binary frame holding UTF-8 JSON
    pub fn from_bytes(data: &[u8]) -> MessageResult<Self> {
        let text = std::str::from_utf8(data).map_err(|_| MessageError::NotUtf8)?;
        Self::from_json(text)
    }

    /// Encode to a text frame
    pub fn to_json(&self) -> MessageResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
