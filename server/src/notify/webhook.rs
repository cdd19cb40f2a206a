use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use url::Url;

use super::{NotificationChannel, NotifyError};
use crate::{model::mail_record::ClassifiedRecord, HttpClient};

/// Generic JSON webhook.
pub struct WebhookChannel {
    http_client: HttpClient,
    url: Url,
    user_agent: String,
    source: String,
}

impl WebhookChannel {
    pub fn new(http_client: HttpClient, url: Url, user_agent: String, source: String) -> Self {
        Self {
            http_client,
            url,
            user_agent,
            source,
        }
    }

    pub fn payload(&self, classified: &ClassifiedRecord) -> Value {
        let record = &classified.record;
        json!({
            "event": "interested_email",
            "timestamp": Utc::now().to_rfc3339(),
            "email": {
                "uid": record.uid,
                "from": record.from,
                "to": record.to,
                "subject": record.subject,
                "category": classified.category,
                "confidence": classified.confidence,
                "method": classified.method,
                "receivedAt": record.date.to_rfc3339(),
            },
            "metadata": {
                "source": self.source,
                "priority": "high"
            }
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, record: &ClassifiedRecord) -> Result<(), NotifyError> {
        let resp = self
            .http_client
            .post(self.url.clone())
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .json(&self.payload(record))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mail_record::{Category, ClassificationMethod};
    use crate::testing::common::classified;

    #[test]
    fn test_payload_shape() {
        let channel = WebhookChannel::new(
            HttpClient::new(),
            Url::parse("https://hooks.example.com/lead").unwrap(),
            "inbox-triage-bot/1.0".to_string(),
            "inbox-triage".to_string(),
        );
        let payload = channel.payload(&classified(
            8,
            Category::Interested,
            ClassificationMethod::RuleFallback,
        ));

        assert_eq!(payload["event"], "interested_email");
        assert_eq!(payload["email"]["uid"], 8);
        assert_eq!(payload["email"]["category"], "Interested");
        assert_eq!(payload["email"]["method"], "Rules");
        assert_eq!(payload["metadata"]["priority"], "high");
        assert_eq!(payload["metadata"]["source"], "inbox-triage");
    }
}
