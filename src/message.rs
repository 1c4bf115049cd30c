//! The message type carried through the broker.
//!
//! A [`Message`] holds the producer-supplied payload and addressing
//! properties; broker-assigned metadata (sequence number, enqueue time,
//! delivery count, lock state) lives on the store's `Envelope` instead, so a
//! single message value can be fanned out to several subscriptions and each
//! copy gets its own broker metadata.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

/// A user-property value. Closed set of scalar types so the filter
/// type-coercion rules are exhaustive.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    /// Canonical string form, used for correlation-filter matching.
    pub fn as_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(s) => f.write_str(s),
            PropertyValue::Int(n) => write!(f, "{n}"),
            PropertyValue::Float(x) => write!(f, "{x}"),
            PropertyValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Int(n)
    }
}

impl From<f64> for PropertyValue {
    fn from(x: f64) -> Self {
        PropertyValue::Float(x)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

/// A message as handed to the broker by a producer.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub message_id: Option<String>,
    /// Opaque payload. `Bytes` so topic fan-out clones cheaply.
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Application label / subject.
    pub label: Option<String>,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
    pub reply_to: Option<String>,
    pub to: Option<String>,
    pub partition_key: Option<String>,
    /// Per-message TTL; overrides the entity default when set.
    pub time_to_live: Option<Duration>,
    pub user_properties: HashMap<String, PropertyValue>,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Looks up a user property by exact (case-sensitive) name.
    pub fn user_property(&self, name: &str) -> Option<&PropertyValue> {
        self.user_properties.get(name)
    }
}

/// Builder for [`Message`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message.message_id = Some(id.into());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.message.body = body.into();
        self
    }

    pub fn content_type(mut self, ct: impl Into<String>) -> Self {
        self.message.content_type = Some(ct.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.message.label = Some(label.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.message.correlation_id = Some(id.into());
        self
    }

    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.message.session_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, addr: impl Into<String>) -> Self {
        self.message.reply_to = Some(addr.into());
        self
    }

    pub fn to(mut self, addr: impl Into<String>) -> Self {
        self.message.to = Some(addr.into());
        self
    }

    pub fn partition_key(mut self, key: impl Into<String>) -> Self {
        self.message.partition_key = Some(key.into());
        self
    }

    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.message.time_to_live = Some(ttl);
        self
    }

    pub fn user_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.message.user_properties.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}
