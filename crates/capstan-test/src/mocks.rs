//! Mock verifiers and sample extensions.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use capstan_crypto::TrustedKeys;
use capstan_runtime::integrity::VerificationResult;
use capstan_runtime::{
    Extension, FactoryLoader, HandlerTable, IntegrityVerifier, Manifest, PackageVerifier,
};
use futures::StreamExt;
use serde_json::json;

// ---------------------------------------------------------------------------
// Verifiers
// ---------------------------------------------------------------------------

/// Verifier wrapper counting how often packages are verified.
pub struct CountingVerifier {
    inner: Box<dyn IntegrityVerifier>,
    calls: AtomicUsize,
}

impl CountingVerifier {
    /// Wrap the standard verifier with no trusted keys.
    #[must_use]
    pub fn new() -> Self {
        Self::wrapping(PackageVerifier::default())
    }

    /// Wrap the standard verifier trusting `trusted`.
    #[must_use]
    pub fn trusting(trusted: TrustedKeys) -> Self {
        Self::wrapping(PackageVerifier::new(trusted))
    }

    /// Wrap any verifier.
    #[must_use]
    pub fn wrapping(inner: impl IntegrityVerifier + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            calls: AtomicUsize::new(0),
        }
    }

    /// Verifications so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Reset the counter.
    pub fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }
}

impl Default for CountingVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrityVerifier for CountingVerifier {
    fn verify(&self, source: &Path, manifest: &Manifest) -> VerificationResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.verify(source, manifest)
    }
}

impl std::fmt::Debug for CountingVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingVerifier")
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Sample extensions
// ---------------------------------------------------------------------------

/// Direct handler: `count` returns the number of words in `text`.
#[derive(Debug, Default)]
pub struct WordCount;

#[async_trait]
impl Extension for WordCount {
    fn handlers(&self) -> HandlerTable {
        HandlerTable::new().direct("count", |inv| {
            let text: String = inv.require("text")?;
            let unique = inv.arg::<bool>("unique")?.unwrap_or(false);
            let words: Vec<&str> = text.split_whitespace().collect();
            let count = if unique {
                words.iter().collect::<BTreeSet<_>>().len()
            } else {
                words.len()
            };
            Ok(json!({ "words": count }))
        })
    }
}

/// Suspending handler: `wait` sleeps for `ms` milliseconds, reporting progress.
#[derive(Debug, Default)]
pub struct Sleeper;

#[async_trait]
impl Extension for Sleeper {
    fn handlers(&self) -> HandlerTable {
        HandlerTable::new().suspending("wait", |inv| async move {
            let ms: u64 = inv.require("ms")?;
            inv.progress().report_percent(0.0, "sleeping");
            tokio::time::sleep(Duration::from_millis(ms)).await;
            inv.progress().report_percent(100.0, "awake");
            Ok::<_, anyhow::Error>(json!("slept"))
        })
    }
}

/// Streaming handlers: `count` yields `1..=to` (default 3), `forever` never ends.
#[derive(Debug, Default)]
pub struct Counter;

#[async_trait]
impl Extension for Counter {
    fn handlers(&self) -> HandlerTable {
        HandlerTable::new()
            .streaming("count", |inv| {
                let to = inv.arg::<u64>("to").ok().flatten().unwrap_or(3);
                futures::stream::iter((1..=to).map(|n| Ok(json!(n))))
            })
            .streaming("forever", |_| {
                futures::stream::iter((1_u64..).map(|n| Ok(json!(n))))
            })
    }
}

/// Streaming handler: `count` yields `1`, then fails, then would yield `3`.
#[derive(Debug, Default)]
pub struct FailingStream;

#[async_trait]
impl Extension for FailingStream {
    fn handlers(&self) -> HandlerTable {
        HandlerTable::new().streaming("count", |_| {
            futures::stream::iter(vec![
                Ok(json!(1)),
                Err(anyhow::anyhow!("stream broke")),
                Ok(json!(3)),
            ])
        })
    }
}

/// Stateful handlers: `increment` bumps a counter in extension state,
/// `peek` reads it.
#[derive(Debug, Default)]
pub struct Tally;

#[async_trait]
impl Extension for Tally {
    fn handlers(&self) -> HandlerTable {
        HandlerTable::new()
            .suspending("increment", |inv| async move {
                let state = inv.state();
                let current: u64 = state.load_json().await?.unwrap_or(0);
                let next = current.saturating_add(1);
                state.save_json(&next).await?;
                Ok::<_, anyhow::Error>(json!(next))
            })
            .suspending("peek", |inv| async move {
                let current: Option<u64> = inv.state().load_json().await?;
                Ok::<_, anyhow::Error>(json!(current.unwrap_or(0)))
            })
    }
}

/// Handlers that panic: `crash` directly, `crash_later` after a short sleep,
/// `crash_stream` after yielding `1`.
#[derive(Debug, Default)]
pub struct Faulty;

#[async_trait]
impl Extension for Faulty {
    fn handlers(&self) -> HandlerTable {
        HandlerTable::new()
            .direct("crash", |_| panic!("direct handler gave up"))
            .suspending("crash_later", |inv| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                assert!(inv.action().is_empty(), "suspended handler gave up");
                Ok::<_, anyhow::Error>(json!(null))
            })
            .streaming("crash_stream", |_| {
                futures::stream::iter(1_u64..).map(|n| {
                    assert!(n < 2, "stream gave up at {n}");
                    Ok(json!(n))
                })
            })
    }
}

/// `ping` returns the called id and version; shutdowns are counted.
#[derive(Debug, Default, Clone)]
pub struct Pinger {
    shutdowns: Arc<AtomicUsize>,
}

impl Pinger {
    /// A pinger sharing `shutdowns` with the test.
    #[must_use]
    pub fn new(shutdowns: Arc<AtomicUsize>) -> Self {
        Self { shutdowns }
    }
}

#[async_trait]
impl Extension for Pinger {
    fn handlers(&self) -> HandlerTable {
        HandlerTable::new().direct("ping", |inv| {
            Ok(json!({
                "id": inv.extension_id().as_str(),
                "version": inv.version().to_string(),
            }))
        })
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Loader for every sample extension.
///
/// Locators: `builtin:word-count`, `builtin:sleeper`, `builtin:counter`,
/// `builtin:failing-stream`, `builtin:tally`, `builtin:faulty`,
/// `builtin:pinger`. Pinger shutdowns are counted in `shutdowns`.
#[must_use]
pub fn sample_loader(shutdowns: Arc<AtomicUsize>) -> FactoryLoader {
    FactoryLoader::new()
        .with("builtin:word-count", |_| Ok(Box::new(WordCount) as Box<dyn Extension>))
        .with("builtin:sleeper", |_| Ok(Box::new(Sleeper) as Box<dyn Extension>))
        .with("builtin:counter", |_| Ok(Box::new(Counter) as Box<dyn Extension>))
        .with("builtin:failing-stream", |_| {
            Ok(Box::new(FailingStream) as Box<dyn Extension>)
        })
        .with("builtin:tally", |_| Ok(Box::new(Tally) as Box<dyn Extension>))
        .with("builtin:faulty", |_| Ok(Box::new(Faulty) as Box<dyn Extension>))
        .with("builtin:pinger", move |_| {
            Ok(Box::new(Pinger::new(Arc::clone(&shutdowns))) as Box<dyn Extension>)
        })
}
