//! Lifecycle events published on the per-queue pub/sub channel.
//!
//! Events are best-effort: a lost event never corrupts queue state, so
//! publish failures are logged and swallowed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::gateway::{Gateway, KeyCodec};
use crate::utils::errors::QueueResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueEventKind {
    #[serde(rename = "job:added")]
    JobAdded,
    #[serde(rename = "job:active")]
    JobActive,
    #[serde(rename = "job:completed")]
    JobCompleted,
    #[serde(rename = "job:failed")]
    JobFailed,
    #[serde(rename = "job:retry")]
    JobRetry,
    #[serde(rename = "queue:paused")]
    QueuePaused,
    #[serde(rename = "queue:resumed")]
    QueueResumed,
    #[serde(rename = "batch:added")]
    BatchAdded,
    #[serde(rename = "batch:removed")]
    BatchRemoved,
    #[serde(rename = "batch:retried")]
    BatchRetried,
    #[serde(rename = "batch:cleaned")]
    BatchCleaned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    #[serde(rename = "type")]
    pub kind: QueueEventKind,
    #[serde(rename = "jobId", skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(rename = "queueName")]
    pub queue_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl QueueEvent {
    pub fn job(kind: QueueEventKind, queue: &str, job_id: &str, data: Value) -> Self {
        Self {
            kind,
            job_id: Some(job_id.to_string()),
            queue_name: queue.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn queue(kind: QueueEventKind, queue: &str, data: Value) -> Self {
        Self {
            kind,
            job_id: None,
            queue_name: queue.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Serializes and publishes events on the queue channel.
#[derive(Clone)]
pub struct EventPublisher {
    gateway: Arc<dyn Gateway>,
    codec: KeyCodec,
}

impl EventPublisher {
    pub fn new(gateway: Arc<dyn Gateway>, codec: KeyCodec) -> Self {
        Self { gateway, codec }
    }

    pub async fn publish(&self, event: QueueEvent) {
        let channel = self.codec.events_channel(&event.queue_name);
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to serialize queue event: {}", e);
                return;
            }
        };
        if let Err(e) = self.gateway.publish(&channel, &payload).await {
            warn!("failed to publish event on {}: {}", channel, e);
        }
    }

    /// Typed subscription stream. Unparseable payloads are skipped.
    pub async fn subscribe(
        &self,
        queue: &str,
    ) -> QueueResult<tokio::sync::mpsc::Receiver<QueueEvent>> {
        let channel = self.codec.events_channel(queue);
        let mut raw = self.gateway.subscribe(&channel).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(payload) = raw.recv().await {
                match serde_json::from_str::<QueueEvent>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("skipping malformed queue event: {}", e),
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_envelope_shape() {
        let event = QueueEvent::job(
            QueueEventKind::JobFailed,
            "chat",
            "job-1",
            serde_json::json!({"error": "provider 500"}),
        );
        let raw = serde_json::to_value(&event).unwrap();
        assert_eq!(raw["type"], "job:failed");
        assert_eq!(raw["jobId"], "job-1");
        assert_eq!(raw["queueName"], "chat");
        assert_eq!(raw["data"]["error"], "provider 500");
        assert!(raw["timestamp"].is_string());
    }

    #[test]
    fn queue_events_omit_job_id() {
        let event = QueueEvent::queue(QueueEventKind::QueuePaused, "chat", Value::Null);
        let raw = serde_json::to_value(&event).unwrap();
        assert!(raw.get("jobId").is_none());
    }

    #[test]
    fn kind_round_trips() {
        for kind in [
            QueueEventKind::JobAdded,
            QueueEventKind::BatchCleaned,
            QueueEventKind::QueueResumed,
        ] {
            let raw = serde_json::to_string(&kind).unwrap();
            let parsed: QueueEventKind = serde_json::from_str(&raw).unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
