//! Messages handed to the transport.
//!
//! Payloads are opaque here. Only the fields the claim and management
//! exchanges need to read or write are modelled.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Application property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// UTF-8 string.
    String(String),
    /// Signed integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
}

impl PropertyValue {
    /// Get the value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A message moving over a link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Message id, used to correlate requests and responses.
    pub message_id: Option<String>,
    /// Id of the request this message answers.
    pub correlation_id: Option<String>,
    /// Address replies should be sent to.
    pub reply_to: Option<String>,
    /// Application properties.
    pub application_properties: BTreeMap<String, PropertyValue>,
    /// Opaque body.
    pub body: Bytes,
}

impl Message {
    /// Create a message with the given body.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Create a message builder.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Look up an application property.
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.application_properties.get(key)
    }

    /// Create a reply builder correlated to this message.
    pub fn create_reply(&self) -> MessageBuilder {
        let mut builder = MessageBuilder::default();
        builder.correlation_id = self.message_id.clone();
        builder
    }
}

/// Builder for constructing messages.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    message_id: Option<String>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    application_properties: BTreeMap<String, PropertyValue>,
    body: Bytes,
}

impl MessageBuilder {
    /// Set the message id.
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Set the correlation id.
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the reply-to address.
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    /// Add an application property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Build the message.
    pub fn build(self) -> Message {
        Message {
            message_id: self.message_id,
            correlation_id: self.correlation_id,
            reply_to: self.reply_to,
            application_properties: self.application_properties,
            body: self.body,
        }
    }
}
