//! Execution dispatcher.
//!
//! An active extension is held as an [`Instance`]: the manifest it was
//! activated with, the [`Extension`] value the loader produced, and the
//! [`HandlerTable`] it returned. Calls go through [`Instance::call`], which
//! validates the action and its arguments before touching the handler, then
//! dispatches on the handler's [`HandlerKind`]. A panicking handler fails its
//! call with [`RuntimeError::HandlerFailed`] instead of unwinding into the
//! caller.

mod args;
mod handler;
mod loader;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt, TryStreamExt};
use semver::Version;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub use args::check_arguments;
pub use handler::{Handler, HandlerKind, HandlerResult, HandlerTable, ValueFuture, ValueStream};
pub use loader::{ExtensionFactory, ExtensionLoader, FactoryLoader, LoadRequest};

use crate::error::{RuntimeError, RuntimeResult};
use crate::id::ExtensionId;
use crate::manifest::Manifest;
use crate::progress::{ProgressReporter, ProgressSink};
use crate::state::StateHandle;

/// A loaded extension.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Handlers for the extension's actions.
    ///
    /// Called once, right after the loader returns the instance.
    fn handlers(&self) -> HandlerTable;

    /// Release resources. Awaited when the extension is deactivated or
    /// superseded.
    async fn shutdown(&self) {}
}

/// Everything a handler receives for one call.
#[derive(Debug, Clone)]
pub struct Invocation {
    extension_id: ExtensionId,
    version: Version,
    action: String,
    arguments: Map<String, Value>,
    progress: ProgressReporter,
    state: StateHandle,
}

impl Invocation {
    /// Id of the extension being called.
    #[must_use]
    pub fn extension_id(&self) -> &ExtensionId {
        &self.extension_id
    }

    /// Version of the extension being called.
    #[must_use]
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Name of the action.
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Validated arguments.
    #[must_use]
    pub fn arguments(&self) -> &Map<String, Value> {
        &self.arguments
    }

    /// Decode an optional argument.
    ///
    /// # Errors
    ///
    /// Fails if the argument is present but does not decode as `T`.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> HandlerResult<Option<T>> {
        self.arguments
            .get(name)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| anyhow::anyhow!("argument '{name}': {e}"))
    }

    /// Decode a required argument.
    ///
    /// # Errors
    ///
    /// Fails if the argument is absent or does not decode as `T`.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> HandlerResult<T> {
        self.arg(name)?
            .ok_or_else(|| anyhow::anyhow!("argument '{name}' is missing"))
    }

    /// Progress reporter for this call.
    #[must_use]
    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// State scoped to the called extension.
    #[must_use]
    pub fn state(&self) -> &StateHandle {
        &self.state
    }
}

/// Result of [`Runtime::invoke`](crate::Runtime::invoke).
#[derive(Debug)]
pub enum InvocationOutput {
    /// A single value from a direct or suspending handler.
    Value(Value),
    /// A lazy stream from a streaming handler.
    Stream(ResultStream),
}

impl InvocationOutput {
    /// Whether the call produced a stream.
    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// The single value, if the call produced one.
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Stream(_) => None,
        }
    }

    /// The stream, if the call produced one.
    #[must_use]
    pub fn into_stream(self) -> Option<ResultStream> {
        match self {
            Self::Value(_) => None,
            Self::Stream(s) => Some(s),
        }
    }

    /// Drain the output into a vector. A single value becomes a one-element
    /// vector.
    ///
    /// # Errors
    ///
    /// Returns the first error the stream yields.
    pub async fn collect(self) -> RuntimeResult<Vec<Value>> {
        match self {
            Self::Value(v) => Ok(vec![v]),
            Self::Stream(s) => s.try_collect().await,
        }
    }
}

/// Where a handler error came from.
#[derive(Debug, Clone)]
struct CallSite {
    id: ExtensionId,
    version: Version,
    action: String,
}

impl CallSite {
    fn fail(&self, source: anyhow::Error) -> RuntimeError {
        RuntimeError::HandlerFailed {
            id: self.id.clone(),
            version: self.version.clone(),
            action: self.action.clone(),
            source,
        }
    }

    fn panicked(&self, payload: Box<dyn Any + Send>) -> RuntimeError {
        let message = panic_message(&*payload);
        warn!(
            extension_id = %self.id,
            version = %self.version,
            action = %self.action,
            panic = %message,
            "Handler panicked"
        );
        self.fail(anyhow::anyhow!("handler panicked: {message}"))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Values produced by a streaming handler.
///
/// Pulled lazily. Handler errors and panics are tagged with the call site and
/// end the stream: nothing is pulled from the handler after the first error.
pub struct ResultStream {
    inner: BoxStream<'static, RuntimeResult<Value>>,
}

impl ResultStream {
    fn new(stream: ValueStream, site: CallSite) -> Self {
        let inner = futures::stream::unfold(Some((stream, site)), |state| async move {
            let (mut stream, site) = state?;
            let next = AssertUnwindSafe(stream.next()).catch_unwind().await;
            match next {
                Ok(Some(Ok(value))) => Some((Ok(value), Some((stream, site)))),
                Ok(Some(Err(e))) => Some((Err(site.fail(e)), None)),
                Ok(None) => None,
                Err(payload) => Some((Err(site.panicked(payload)), None)),
            }
        })
        .boxed();
        Self { inner }
    }
}

impl Stream for ResultStream {
    type Item = RuntimeResult<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream").finish_non_exhaustive()
    }
}

/// An activated extension.
pub(crate) struct Instance {
    manifest: Manifest,
    extension: Box<dyn Extension>,
    handlers: HandlerTable,
    state: StateHandle,
}

impl Instance {
    /// Bind `extension` to `manifest`, checking its handler table.
    ///
    /// Every declared action needs a handler, and a handler is streaming
    /// exactly when the action is declared streaming.
    pub(crate) fn new(
        manifest: Manifest,
        extension: Box<dyn Extension>,
        state: StateHandle,
    ) -> RuntimeResult<Self> {
        let handlers = extension.handlers();
        let mut problems = Vec::new();
        for action in &manifest.actions {
            match handlers.get(&action.name).map(Handler::kind) {
                None => problems.push(format!("no handler for action '{}'", action.name)),
                Some(HandlerKind::Streaming) if !action.streaming => problems.push(format!(
                    "action '{}' is not declared streaming but its handler is",
                    action.name
                )),
                Some(kind @ (HandlerKind::Direct | HandlerKind::Suspending)) if action.streaming => {
                    problems.push(format!(
                        "action '{}' is declared streaming but its handler is {kind}",
                        action.name
                    ));
                },
                Some(_) => {},
            }
        }
        for name in handlers.actions() {
            if manifest.action(name).is_none() {
                debug!(
                    extension_id = %manifest.id,
                    action = name,
                    "Ignoring handler for undeclared action"
                );
            }
        }
        if !problems.is_empty() {
            return Err(RuntimeError::LoadFailed {
                id: manifest.id.clone(),
                version: manifest.version.clone(),
                message: problems.join("; "),
            });
        }

        Ok(Self {
            manifest,
            extension,
            handlers,
            state,
        })
    }

    pub(crate) fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub(crate) fn version(&self) -> &Version {
        &self.manifest.version
    }

    /// Validate and dispatch one call.
    pub(crate) async fn call(
        &self,
        action: &str,
        arguments: Map<String, Value>,
        progress: Option<ProgressSink>,
    ) -> RuntimeResult<InvocationOutput> {
        let id = &self.manifest.id;
        let version = &self.manifest.version;
        let not_found = || RuntimeError::ActionNotFound {
            id: id.clone(),
            version: version.clone(),
            action: action.to_string(),
        };

        let spec = self.manifest.action(action).ok_or_else(not_found)?;
        let problems = check_arguments(spec, &arguments);
        if !problems.is_empty() {
            return Err(RuntimeError::InvalidArguments {
                id: id.clone(),
                action: action.to_string(),
                problems,
            });
        }
        let handler = self.handlers.get(action).ok_or_else(not_found)?;

        debug!(
            extension_id = %id,
            version = %version,
            action,
            kind = %handler.kind(),
            "Invoking action"
        );

        let site = CallSite {
            id: id.clone(),
            version: version.clone(),
            action: action.to_string(),
        };
        let invocation = Invocation {
            extension_id: id.clone(),
            version: version.clone(),
            action: action.to_string(),
            arguments,
            progress: ProgressReporter::new(progress),
            state: self.state.clone(),
        };

        match handler {
            Handler::Direct(f) => match panic::catch_unwind(AssertUnwindSafe(|| f(invocation))) {
                Ok(result) => result.map(InvocationOutput::Value).map_err(|e| site.fail(e)),
                Err(payload) => Err(site.panicked(payload)),
            },
            Handler::Suspending(f) => {
                let future = match panic::catch_unwind(AssertUnwindSafe(|| f(invocation))) {
                    Ok(future) => future,
                    Err(payload) => return Err(site.panicked(payload)),
                };
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(result) => result.map(InvocationOutput::Value).map_err(|e| site.fail(e)),
                    Err(payload) => Err(site.panicked(payload)),
                }
            },
            Handler::Streaming(f) => match panic::catch_unwind(AssertUnwindSafe(|| f(invocation))) {
                Ok(stream) => Ok(InvocationOutput::Stream(ResultStream::new(stream, site))),
                Err(payload) => Err(site.panicked(payload)),
            },
        }
    }

    pub(crate) async fn shutdown(&self) {
        self.extension.shutdown().await;
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.manifest.id)
            .field("version", &self.manifest.version)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use capstan_storage::MemoryStateBackend;
    use serde_json::json;

    use super::*;
    use crate::state::StateStore;

    const MANIFEST: &str = r#"
id = "echo"
name = "Echo"
version = "1.0.0"
entry_point = "builtin:echo"

[[actions]]
name = "say"
parameters = [{ name = "text", type = "string" }]

[[actions]]
name = "later"

[[actions]]
name = "count"
streaming = true
parameters = [{ name = "fail_at", type = "integer", required = false }]
"#;

    struct Echo;

    #[async_trait]
    impl Extension for Echo {
        fn handlers(&self) -> HandlerTable {
            HandlerTable::new()
                .direct("say", |inv| Ok(json!(inv.require::<String>("text")?)))
                .suspending("later", |inv| async move {
                    inv.progress().report_percent(100.0, "done");
                    Ok(json!("later"))
                })
                .streaming("count", |inv| {
                    let fail_at = inv.arg::<i64>("fail_at").ok().flatten();
                    futures::stream::iter((1..=3_i64).map(move |n| {
                        if Some(n) == fail_at {
                            Err(anyhow::anyhow!("boom at {n}"))
                        } else {
                            Ok(json!(n))
                        }
                    }))
                })
        }
    }

    struct Incomplete;

    #[async_trait]
    impl Extension for Incomplete {
        fn handlers(&self) -> HandlerTable {
            HandlerTable::new()
                .direct("say", |_| Ok(Value::Null))
                .direct("count", |_| Ok(Value::Null))
        }
    }

    fn instance(ext: Box<dyn Extension>) -> RuntimeResult<Instance> {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        let store = StateStore::new(Arc::new(MemoryStateBackend::new()));
        let state = store.handle(&manifest.id, &manifest.version).unwrap();
        Instance::new(manifest, ext, state)
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_direct_and_suspending() {
        let inst = instance(Box::new(Echo)).unwrap();
        let out = inst.call("say", args(json!({"text": "hi"})), None).await.unwrap();
        assert_eq!(out.into_value(), Some(json!("hi")));

        let (sink, mut rx) = ProgressSink::channel();
        let out = inst.call("later", Map::new(), Some(sink)).await.unwrap();
        assert_eq!(out.into_value(), Some(json!("later")));
        assert_eq!(rx.try_recv().unwrap().percentage, Some(100.0));
    }

    #[tokio::test]
    async fn test_stream_yields_in_order() {
        let inst = instance(Box::new(Echo)).unwrap();
        let out = inst.call("count", Map::new(), None).await.unwrap();
        assert!(out.is_stream());
        assert_eq!(out.collect().await.unwrap(), vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_stream_error_ends_stream() {
        let inst = instance(Box::new(Echo)).unwrap();
        let mut stream = inst
            .call("count", args(json!({"fail_at": 2})), None)
            .await
            .unwrap()
            .into_stream()
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), json!(1));
        let err = stream.next().await.unwrap().unwrap_err();
        match err {
            RuntimeError::HandlerFailed { action, source, .. } => {
                assert_eq!(action, "count");
                assert_eq!(source.to_string(), "boom at 2");
            },
            other => panic!("unexpected: {other}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_validation_before_dispatch() {
        let inst = instance(Box::new(Echo)).unwrap();
        let err = inst.call("shout", Map::new(), None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ActionNotFound { .. }));

        let err = inst.call("say", args(json!({"text": 5})), None).await.unwrap_err();
        match err {
            RuntimeError::InvalidArguments { problems, .. } => assert_eq!(problems.len(), 1),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_handler_table_must_match_manifest() {
        let err = instance(Box::new(Incomplete)).unwrap_err();
        match err {
            RuntimeError::LoadFailed { message, .. } => {
                assert!(message.contains("no handler for action 'later'"), "{message}");
                assert!(message.contains("'count' is declared streaming"), "{message}");
            },
            other => panic!("unexpected: {other}"),
        }
    }
}
