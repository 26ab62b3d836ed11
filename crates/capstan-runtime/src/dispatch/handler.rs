//! Action handlers.
//!
//! An extension registers one [`Handler`] per declared action. The variant is
//! fixed when the handler is built, so the dispatcher never has to guess
//! whether a handler returns a value, a future or a stream.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::Value;

use super::Invocation;

/// Result type returned by handlers.
pub type HandlerResult<T> = anyhow::Result<T>;

/// Future produced by a suspending handler.
pub type ValueFuture = BoxFuture<'static, HandlerResult<Value>>;

/// Stream produced by a streaming handler.
pub type ValueStream = BoxStream<'static, HandlerResult<Value>>;

type DirectFn = dyn Fn(Invocation) -> HandlerResult<Value> + Send + Sync;
type SuspendingFn = dyn Fn(Invocation) -> ValueFuture + Send + Sync;
type StreamingFn = dyn Fn(Invocation) -> ValueStream + Send + Sync;

/// Shape of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Runs to completion and returns one value.
    Direct,
    /// Returns a future the dispatcher awaits.
    Suspending,
    /// Returns a lazy stream of values.
    Streaming,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Suspending => "suspending",
            Self::Streaming => "streaming",
        })
    }
}

/// A callable action implementation.
#[derive(Clone)]
pub enum Handler {
    /// See [`HandlerKind::Direct`].
    Direct(Arc<DirectFn>),
    /// See [`HandlerKind::Suspending`].
    Suspending(Arc<SuspendingFn>),
    /// See [`HandlerKind::Streaming`].
    Streaming(Arc<StreamingFn>),
}

impl Handler {
    /// Wrap a synchronous function.
    pub fn direct<F>(f: F) -> Self
    where
        F: Fn(Invocation) -> HandlerResult<Value> + Send + Sync + 'static,
    {
        Self::Direct(Arc::new(f))
    }

    /// Wrap an async function.
    pub fn suspending<F, Fut>(f: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
    {
        Self::Suspending(Arc::new(move |inv| f(inv).boxed()))
    }

    /// Wrap a function returning a stream.
    pub fn streaming<F, S>(f: F) -> Self
    where
        F: Fn(Invocation) -> S + Send + Sync + 'static,
        S: Stream<Item = HandlerResult<Value>> + Send + 'static,
    {
        Self::Streaming(Arc::new(move |inv| f(inv).boxed()))
    }

    /// The handler's shape.
    #[must_use]
    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::Direct(_) => HandlerKind::Direct,
            Self::Suspending(_) => HandlerKind::Suspending,
            Self::Streaming(_) => HandlerKind::Streaming,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}

/// Handlers of one extension instance, keyed by action name.
#[derive(Debug, Clone, Default)]
pub struct HandlerTable {
    handlers: BTreeMap<String, Handler>,
}

impl HandlerTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the handler for `action`.
    #[must_use]
    pub fn with(mut self, action: impl Into<String>, handler: Handler) -> Self {
        self.insert(action, handler);
        self
    }

    /// Add a [`Handler::direct`].
    #[must_use]
    pub fn direct<F>(self, action: impl Into<String>, f: F) -> Self
    where
        F: Fn(Invocation) -> HandlerResult<Value> + Send + Sync + 'static,
    {
        self.with(action, Handler::direct(f))
    }

    /// Add a [`Handler::suspending`].
    #[must_use]
    pub fn suspending<F, Fut>(self, action: impl Into<String>, f: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
    {
        self.with(action, Handler::suspending(f))
    }

    /// Add a [`Handler::streaming`].
    #[must_use]
    pub fn streaming<F, S>(self, action: impl Into<String>, f: F) -> Self
    where
        F: Fn(Invocation) -> S + Send + Sync + 'static,
        S: Stream<Item = HandlerResult<Value>> + Send + 'static,
    {
        self.with(action, Handler::streaming(f))
    }

    /// Add or replace the handler for `action`.
    pub fn insert(&mut self, action: impl Into<String>, handler: Handler) {
        self.handlers.insert(action.into(), handler);
    }

    /// Handler for `action`.
    #[must_use]
    pub fn get(&self, action: &str) -> Option<&Handler> {
        self.handlers.get(action)
    }

    /// Action names with a handler, sorted.
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
