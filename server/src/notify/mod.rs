//! Notification dispatcher: fans actionable records out to external channels.

pub mod slack;
pub mod webhook;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;

use crate::{model::mail_record::ClassifiedRecord, observability::PipelineTracker};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{channel} responded with {status}")]
    Status { channel: String, status: u16 },
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, record: &ClassifiedRecord) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationResult {
    pub uid: u32,
    pub channel: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
    inter_record_delay: Duration,
    tracker: PipelineTracker,
}

impl NotificationDispatcher {
    pub fn new(
        channels: Vec<Arc<dyn NotificationChannel>>,
        inter_record_delay: Duration,
        tracker: PipelineTracker,
    ) -> Self {
        Self {
            channels,
            inter_record_delay,
            tracker,
        }
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    /// Notify every channel about each actionable record. Channels run
    /// concurrently per record; failures are returned, never raised.
    pub async fn dispatch(&self, records: &[ClassifiedRecord]) -> Vec<NotificationResult> {
        let actionable: Vec<&ClassifiedRecord> =
            records.iter().filter(|r| r.is_actionable()).collect();
        if actionable.is_empty() || self.channels.is_empty() {
            return Vec::new();
        }

        tracing::info!(count = actionable.len(), "Sending notifications");
        let mut results = Vec::with_capacity(actionable.len() * self.channels.len());
        for (i, record) in actionable.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.inter_record_delay).await;
            }

            let round = join_all(self.channels.iter().map(|channel| async move {
                let outcome = channel.send(record).await;
                NotificationResult {
                    uid: record.record.uid,
                    channel: channel.name().to_string(),
                    success: outcome.is_ok(),
                    error: outcome.err().map(|e| e.to_string()),
                }
            }))
            .await;

            for result in &round {
                self.tracker.record_notification(result.success);
                match &result.error {
                    None => tracing::info!(uid = result.uid, channel = %result.channel, "Notification sent"),
                    Some(error) => tracing::warn!(
                        uid = result.uid,
                        channel = %result.channel,
                        "Notification failed: {}",
                        error
                    ),
                }
            }
            results.extend(round);
        }
        results
    }
}
