//! Redis backend on a reconnecting [`ConnectionManager`].

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::backend::CounterBackend;
use crate::command::{Reply, StoreCommand};
use crate::error::CacheError;

/// Counter store backed by Redis. Pipelines run inside `MULTI`/`EXEC`.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect to a `redis://` or `rediss://` URL.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(backend = "redis", "Counter store connected");
        Ok(Self { conn })
    }

    fn to_cmd(command: &StoreCommand) -> redis::Cmd {
        let mut cmd = redis::cmd(command.name());
        match command {
            StoreCommand::Get(key)
            | StoreCommand::Incr(key)
            | StoreCommand::Ttl(key)
            | StoreCommand::Delete(key)
            | StoreCommand::Exists(key) => {
                cmd.arg(key);
            }
            StoreCommand::Set {
                key,
                value,
                ttl_secs,
            } => {
                cmd.arg(key).arg(value);
                if let Some(secs) = ttl_secs {
                    cmd.arg("EX").arg(*secs);
                }
            }
            StoreCommand::Expire { key, secs } => {
                cmd.arg(key).arg(*secs);
            }
        }
        cmd
    }

    fn to_reply(command: &StoreCommand, value: &redis::Value) -> Result<Reply, CacheError> {
        let reply = match command {
            StoreCommand::Get(_) => Reply::Value(redis::from_redis_value(value)?),
            StoreCommand::Set { .. } => Reply::Ok,
            StoreCommand::Incr(_) | StoreCommand::Ttl(_) => Reply::Int(redis::from_redis_value(value)?),
            StoreCommand::Expire { .. } | StoreCommand::Exists(_) => {
                Reply::Bool(redis::from_redis_value(value)?)
            }
            StoreCommand::Delete(_) => {
                let removed: i64 = redis::from_redis_value(value)?;
                Reply::Bool(removed > 0)
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl CounterBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn run(&self, command: StoreCommand) -> Result<Reply, CacheError> {
        let mut conn = self.conn.clone();
        let value: redis::Value = Self::to_cmd(&command).query_async(&mut conn).await?;
        Self::to_reply(&command, &value)
    }

    async fn run_batch(&self, commands: Vec<StoreCommand>) -> Result<Vec<Reply>, CacheError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in &commands {
            pipe.add_command(Self::to_cmd(command));
        }

        let mut conn = self.conn.clone();
        let values: Vec<redis::Value> = pipe.query_async(&mut conn).await?;
        if values.len() != commands.len() {
            return Err(CacheError::UnexpectedReply {
                command: "EXEC",
                reply: format!("{} replies for {} commands", values.len(), commands.len()),
            });
        }

        commands
            .iter()
            .zip(values.iter())
            .map(|(command, value)| Self::to_reply(command, value))
            .collect()
    }
}
