//! Transition notifications
//!
//! Every committed state transition is offered to the configured sinks.
//! Delivery happens on a background task fed through a bounded queue; a full
//! queue or a failing sink drops the event with a warning and never slows
//! the coordinator down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::job::JobState;

/// Notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Webhook receiving each event as JSON.
    pub webhook_url: Option<String>,
    /// Per-delivery timeout.
    pub timeout_ms: u64,
    /// Events buffered before new ones are dropped.
    pub queue_depth: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: 5_000,
            queue_depth: 256,
        }
    }
}

/// Delivery failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// A committed state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    /// Job id.
    pub job_id: String,
    /// Attempt number of the job.
    pub attempt: u32,
    /// Previous state.
    pub from: JobState,
    /// New state.
    pub to: JobState,
    /// Reason logged with the transition.
    pub reason: String,
    /// Commit time.
    pub at: DateTime<Utc>,
}

/// Receives transition events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one event.
    async fn send(&self, event: &TransitionEvent) -> Result<(), NotifyError>;
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, event: &TransitionEvent) -> Result<(), NotifyError> {
        info!(
            job_id = %event.job_id,
            from = %event.from,
            to = %event.to,
            reason = %event.reason,
            "job transition"
        );
        Ok(())
    }
}

/// Posts events to a webhook.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    /// Sink posting to `url`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, event: &TransitionEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| NotifyError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError(format!("status {}", response.status())));
        }
        Ok(())
    }
}

/// Fire-and-forget fan-out to sinks.
pub struct Notifier {
    tx: Mutex<Option<mpsc::Sender<TransitionEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Notifier {
    /// Start delivering to `sinks`. Must be called inside a runtime.
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>, queue_depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<TransitionEvent>(queue_depth.max(1));
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for sink in &sinks {
                    if let Err(e) = sink.send(&event).await {
                        warn!(job_id = %event.job_id, to = %event.to, error = %e, "notification dropped");
                    }
                }
            }
        });
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Log sink plus the configured webhook, if any.
    pub fn from_config(config: &NotificationConfig) -> Self {
        let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];
        if let Some(ref url) = config.webhook_url {
            match WebhookSink::new(url, Duration::from_millis(config.timeout_ms)) {
                Ok(sink) => sinks.push(Arc::new(sink)),
                Err(e) => warn!(error = %e, "notification webhook disabled"),
            }
        }
        Self::new(sinks, config.queue_depth)
    }

    /// Queue an event. Never blocks; drops the event if the queue is full.
    pub fn notify(&self, event: TransitionEvent) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            warn!(error = %e, "notification queue full, event dropped");
        }
    }

    /// Stop accepting events and wait for queued ones to be delivered.
    pub async fn close(&self) {
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    struct Recording(Mutex<Vec<TransitionEvent>>);

    #[async_trait]
    impl NotificationSink for Recording {
        async fn send(&self, event: &TransitionEvent) -> Result<(), NotifyError> {
            self.0.lock().push(event.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl NotificationSink for Failing {
        async fn send(&self, _event: &TransitionEvent) -> Result<(), NotifyError> {
            Err(NotifyError("down".into()))
        }
    }

    fn event(to: JobState) -> TransitionEvent {
        TransitionEvent {
            job_id: "j".into(),
            attempt: 1,
            from: JobState::Initiated,
            to,
            reason: "test".into(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let notifier = Notifier::new(vec![Arc::new(Failing), recording.clone()], 8);
        notifier.notify(event(JobState::SnapshotExported));
        notifier.notify(event(JobState::Failed));
        notifier.close().await;
        assert_eq!(recording.0.lock().len(), 2);
        // closed notifier silently ignores events
        notifier.notify(event(JobState::Failed));
    }
}
