//! Handler traits and closure adapters.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::contract::{Command, Event, Query};

#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    async fn handle(&self, command: C) -> anyhow::Result<C::Output>;
}

#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    async fn handle(&self, query: Q) -> anyhow::Result<Q::Output>;
}

#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: E) -> anyhow::Result<()>;
}

/// Async closure adapted to a handler trait.
struct HandlerFn<F>(F);

#[async_trait]
impl<C, F, Fut> CommandHandler<C> for HandlerFn<F>
where
    C: Command,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<C::Output>> + Send + 'static,
{
    async fn handle(&self, command: C) -> anyhow::Result<C::Output> {
        (self.0)(command).await
    }
}

#[async_trait]
impl<Q, F, Fut> QueryHandler<Q> for HandlerFn<F>
where
    Q: Query,
    F: Fn(Q) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Q::Output>> + Send + 'static,
{
    async fn handle(&self, query: Q) -> anyhow::Result<Q::Output> {
        (self.0)(query).await
    }
}

#[async_trait]
impl<E, F, Fut> EventHandler<E> for HandlerFn<F>
where
    E: Event,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: E) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Build a command handler from an async closure.
pub fn command_handler_fn<C, F, Fut>(f: F) -> Arc<dyn CommandHandler<C>>
where
    C: Command,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<C::Output>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Build a query handler from an async closure.
pub fn query_handler_fn<Q, F, Fut>(f: F) -> Arc<dyn QueryHandler<Q>>
where
    Q: Query,
    F: Fn(Q) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Q::Output>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Build an event handler from an async closure.
pub fn event_handler_fn<E, F, Fut>(f: F) -> Arc<dyn EventHandler<E>>
where
    E: Event,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}
