//! Wire message exchanged over the transport.
//!
//! ```json
//! {"id": "<uuid>", "type": "query", "name": "GetUserQuery", "data": {...},
//!  "correlation_id": "<uuid>", "reply_to": "user-service_callback_<uuid>"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::correlation::CorrelationId;

/// Message pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Command,
    Event,
    Query,
    Response,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Command => write!(f, "command"),
            MessageType::Event => write!(f, "event"),
            MessageType::Query => write!(f, "query"),
            MessageType::Response => write!(f, "response"),
        }
    }
}

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl Message {
    fn new(message_type: MessageType, name: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            name: name.into(),
            data,
            correlation_id: None,
            reply_to: None,
        }
    }

    pub fn command(name: impl Into<String>, data: Value) -> Self {
        Self::new(MessageType::Command, name, data)
    }

    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self::new(MessageType::Event, name, data)
    }

    pub fn query(
        name: impl Into<String>,
        data: Value,
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
    ) -> Self {
        let mut message = Self::new(MessageType::Query, name, data);
        message.correlation_id = Some(correlation_id.to_string());
        message.reply_to = Some(reply_to.into());
        message
    }

    /// Response to a query, named `<query>_response`.
    pub fn response(query_name: &str, data: Value, correlation_id: impl Into<String>) -> Self {
        let mut message = Self::new(
            MessageType::Response,
            format!("{}_response", query_name),
            data,
        );
        message.correlation_id = Some(correlation_id.into());
        message
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
