//! Counter store errors.

/// Errors from the counter store client and its backends.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Redis connection or command failure
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// `INCR` against a value that is not an integer
    #[error("value at '{0}' is not an integer")]
    NotAnInteger(String),

    /// `INCR` past `i64::MAX`; the stored value is left unchanged
    #[error("increment at '{0}' would overflow")]
    Overflow(String),

    /// Backend cannot run commands as one batch
    #[error("backend '{0}' does not support batched execution")]
    BatchUnsupported(&'static str),

    /// Reply did not have the shape the command implies
    #[error("unexpected reply for {command}: {reply}")]
    UnexpectedReply { command: &'static str, reply: String },

    /// Invalid client configuration
    #[error("invalid cache configuration: {0}")]
    Config(String),
}
