//! Typed message contracts and the results returned by the buses.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A named, serializable message schema.
pub trait Contract: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Schema name used for dispatch and on the wire.
    const NAME: &'static str;
}

/// A request to change state, handled by exactly one handler.
pub trait Command: Contract {
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// A request for data, handled by exactly one handler.
pub trait Query: Contract {
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// A fact that happened, delivered to every subscribed handler.
pub trait Event: Contract + Clone {}

/// Which bus a schema belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Command,
    Query,
    Event,
}

/// Dispatch key, resolved once at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaId {
    pub kind: MessageKind,
    pub name: &'static str,
}

impl SchemaId {
    pub fn command<C: Command>() -> Self {
        Self {
            kind: MessageKind::Command,
            name: C::NAME,
        }
    }

    pub fn query<Q: Query>() -> Self {
        Self {
            kind: MessageKind::Query,
            name: Q::NAME,
        }
    }

    pub fn event<E: Event>() -> Self {
        Self {
            kind: MessageKind::Event,
            name: E::NAME,
        }
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            MessageKind::Command => "command",
            MessageKind::Query => "query",
            MessageKind::Event => "event",
        };
        write!(f, "{}:{}", kind, self.name)
    }
}

/// Outcome of [`CommandBus::execute`](super::CommandBus::execute).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl<T> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
            errors,
        }
    }
}

/// Outcome of [`QueryBus::execute`](super::QueryBus::execute).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl<T> QueryResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
            errors,
        }
    }
}
