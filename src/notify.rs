use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::{channel, Sender};
use tracing::{debug, info, warn};

use crate::config;

/// key: notify -> best-effort member notifications
///
/// Sends never block or roll back the ledger transition that triggered them;
/// the outcome is reported explicitly instead of being discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyResult {
    Sent,
    Skipped,
    Failed,
}

impl NotifyResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyResult::Sent => "sent",
            NotifyResult::Skipped => "skipped",
            NotifyResult::Failed => "failed",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, event_key: &str, recipient: &str, variables: &Value) -> NotifyResult;
}

/// Posts notification events to the configured delivery endpoint. The
/// downstream service owns templates and channels; this side only reports
/// the event key and variables.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl WebhookNotifier {
    pub fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config::NOTIFY_ENDPOINT.clone(),
        }
    }

    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, event_key: &str, recipient: &str, variables: &Value) -> NotifyResult {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return NotifyResult::Skipped;
        };
        let body = serde_json::json!({
            "event": event_key,
            "recipient": recipient,
            "variables": variables,
        });
        match self.client.post(endpoint).json(&body).send().await {
            Ok(response) if response.status().is_success() => NotifyResult::Sent,
            Ok(response) => {
                warn!(event_key, status = %response.status(), "notifier rejected event");
                NotifyResult::Failed
            }
            Err(err) => {
                warn!(?err, event_key, "notifier unreachable");
                NotifyResult::Failed
            }
        }
    }
}

/// Drops every event; used by tests and headless runs.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(&self, _event_key: &str, _recipient: &str, _variables: &Value) -> NotifyResult {
        NotifyResult::Skipped
    }
}

#[derive(Debug)]
struct NotifyJob {
    event_key: String,
    recipient: String,
    variables: Value,
}

/// key: notify-handle -> fire-and-forget enqueue interface
#[derive(Clone)]
pub struct NotifyHandle {
    sender: Sender<NotifyJob>,
}

impl NotifyHandle {
    /// Enqueues a notification without waiting for delivery. A full queue
    /// drops the event and logs it as failed rather than blocking the caller.
    pub fn dispatch(&self, event_key: &str, recipient: &str, variables: Value) {
        let job = NotifyJob {
            event_key: event_key.to_string(),
            recipient: recipient.to_string(),
            variables,
        };
        if let Err(err) = self.sender.try_send(job) {
            warn!(?err, "notification queue full, event dropped");
        }
    }

    /// Handle backed by a worker that discards everything.
    pub fn null() -> Self {
        start_notify_worker(Arc::new(NullNotifier))
    }
}

pub fn start_notify_worker(notifier: Arc<dyn Notifier>) -> NotifyHandle {
    let (tx, mut rx) = channel::<NotifyJob>(256);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let result = notifier
                .send(&job.event_key, &job.recipient, &job.variables)
                .await;
            match result {
                NotifyResult::Sent => info!(
                    event = %job.event_key,
                    recipient = %job.recipient,
                    "notification sent"
                ),
                NotifyResult::Skipped => debug!(
                    event = %job.event_key,
                    "notification skipped, no delivery endpoint configured"
                ),
                NotifyResult::Failed => warn!(
                    event = %job.event_key,
                    recipient = %job.recipient,
                    "notification delivery failed"
                ),
            }
        }
    });

    NotifyHandle { sender: tx }
}
