use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use url::Url;

use super::{NotificationChannel, NotifyError};
use crate::{model::mail_record::ClassifiedRecord, HttpClient};

const PREVIEW_CHARS: usize = 200;

/// Slack incoming webhook.
pub struct SlackChannel {
    http_client: HttpClient,
    webhook_url: Url,
}

impl SlackChannel {
    pub fn new(http_client: HttpClient, webhook_url: Url) -> Self {
        Self {
            http_client,
            webhook_url,
        }
    }
}

pub fn slack_message(classified: &ClassifiedRecord) -> Value {
    let record = &classified.record;
    let from = if record.from.is_empty() {
        "Unknown"
    } else {
        record.from.as_str()
    };
    let preview: String = record.subject.chars().take(PREVIEW_CHARS).collect();
    let ellipsis = if record.subject.chars().count() > PREVIEW_CHARS {
        "..."
    } else {
        ""
    };

    json!({
        "blocks": [
            {
                "type": "header",
                "text": { "type": "plain_text", "text": "New Interested Lead!", "emoji": true }
            },
            {
                "type": "section",
                "fields": [
                    { "type": "mrkdwn", "text": format!("*From:*\n{from}") },
                    { "type": "mrkdwn", "text": format!("*Subject:*\n{}", record.subject) }
                ]
            },
            {
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!("*Email Preview:*\n{preview}{ellipsis}")
                }
            },
            {
                "type": "context",
                "elements": [
                    {
                        "type": "mrkdwn",
                        "text": format!(
                            "{} | {} {:.0}% via {}",
                            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
                            classified.category,
                            classified.confidence * 100.0,
                            classified.method
                        )
                    }
                ]
            },
            { "type": "divider" }
        ]
    })
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, record: &ClassifiedRecord) -> Result<(), NotifyError> {
        let resp = self
            .http_client
            .post(self.webhook_url.clone())
            .json(&slack_message(record))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(NotifyError::Status {
                channel: self.name().to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}
