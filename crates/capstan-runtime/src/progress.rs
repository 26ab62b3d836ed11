//! Progress reporting.
//!
//! A host that wants progress passes a [`ProgressSink`] to `invoke`. The
//! handler receives a [`ProgressReporter`] either way; without a sink every
//! report is dropped. Updates are forwarded as-is.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One intermediate progress update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Completion, nominally 0 to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    /// Human-readable status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Structured extras.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ProgressUpdate {
    /// An update carrying only a percentage.
    #[must_use]
    pub fn percent(percentage: f64) -> Self {
        Self {
            percentage: Some(percentage),
            ..Self::default()
        }
    }

    /// An update carrying only a message.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Write-only channel end supplied by the host.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    sender: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressSink {
    /// Wrap an existing sender.
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self { sender }
    }

    /// A sink plus the receiver the host reads updates from.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

/// Handler-side progress handle.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    sink: Option<ProgressSink>,
}

impl ProgressReporter {
    pub(crate) fn new(sink: Option<ProgressSink>) -> Self {
        Self { sink }
    }

    /// A reporter that drops every update.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Whether anyone is listening.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.sink.as_ref().is_some_and(|s| !s.sender.is_closed())
    }

    /// Forward an update. A closed or absent sink is ignored.
    pub fn report(&self, update: ProgressUpdate) {
        if let Some(sink) = &self.sink {
            // The host may stop listening at any time.
            let _ = sink.sender.send(update);
        }
    }

    /// Shorthand for a percentage plus message.
    pub fn report_percent(&self, percentage: f64, message: impl Into<String>) {
        self.report(ProgressUpdate {
            percentage: Some(percentage),
            message: Some(message.into()),
            details: None,
        });
    }
}
