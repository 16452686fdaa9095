//! Commands understood by every backend and their replies.

use crate::error::CacheError;

/// A single counter store operation. Keys are already prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCommand {
    Get(String),
    Set {
        key: String,
        value: String,
        ttl_secs: Option<u64>,
    },
    Incr(String),
    Expire {
        key: String,
        secs: u64,
    },
    Ttl(String),
    Delete(String),
    Exists(String),
}

impl StoreCommand {
    /// Command name as sent to Redis.
    pub fn name(&self) -> &'static str {
        match self {
            StoreCommand::Get(_) => "GET",
            StoreCommand::Set { .. } => "SET",
            StoreCommand::Incr(_) => "INCR",
            StoreCommand::Expire { .. } => "EXPIRE",
            StoreCommand::Ttl(_) => "TTL",
            StoreCommand::Delete(_) => "DEL",
            StoreCommand::Exists(_) => "EXISTS",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            StoreCommand::Get(key)
            | StoreCommand::Incr(key)
            | StoreCommand::Ttl(key)
            | StoreCommand::Delete(key)
            | StoreCommand::Exists(key) => key,
            StoreCommand::Set { key, .. } | StoreCommand::Expire { key, .. } => key,
        }
    }
}

/// Reply to a [`StoreCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `SET` acknowledged
    Ok,
    /// `GET` result
    Value(Option<String>),
    /// `INCR` / `TTL` result
    Int(i64),
    /// `EXPIRE` / `DEL` / `EXISTS` result
    Bool(bool),
}

impl Reply {
    pub fn into_int(self) -> Result<i64, CacheError> {
        match self {
            Reply::Int(n) => Ok(n),
            other => Err(CacheError::UnexpectedReply {
                command: "integer",
                reply: format!("{:?}", other),
            }),
        }
    }

    pub fn into_value(self) -> Result<Option<String>, CacheError> {
        match self {
            Reply::Value(v) => Ok(v),
            other => Err(CacheError::UnexpectedReply {
                command: "value",
                reply: format!("{:?}", other),
            }),
        }
    }

    pub fn into_bool(self) -> Result<bool, CacheError> {
        match self {
            Reply::Bool(b) => Ok(b),
            other => Err(CacheError::UnexpectedReply {
                command: "bool",
                reply: format!("{:?}", other),
            }),
        }
    }
}
