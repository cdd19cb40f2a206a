//! Chat-completion oracle for OpenAI compatible endpoints (Groq by default).

use async_trait::async_trait;
use indoc::formatdoc;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ClassificationOracle, OracleError, OracleLabel};
use crate::{
    model::mail_record::{Category, EmailText, MailRecord},
    rate_limiters::RateLimiters,
    server_config::OracleConfig,
    util::truncate_chars,
    HttpClient,
};

const SYSTEM_PROMPT: &str =
    "You are an expert email classifier. Respond ONLY with a valid JSON array.";
const BODY_PREVIEW_CHARS: usize = 200;

fn user_prompt(batch: &[MailRecord]) -> String {
    let categories = Category::assignable().map(|c| c.label()).join(", ");
    let emails = batch
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let text = EmailText::from(record);
            format!(
                "{}. Subject: {} | From: {} | Body: {}",
                i + 1,
                text.subject.as_deref().unwrap_or("No Subject"),
                text.from.as_deref().filter(|f| !f.is_empty()).unwrap_or("Unknown"),
                text.body
                    .as_deref()
                    .map(|b| truncate_chars(b, BODY_PREVIEW_CHARS))
                    .unwrap_or_default(),
            )
        })
        .join("\n");

    formatdoc! {r#"
        Categorize each email into ONE of these categories:
        [{categories}]

        Emails:
        {emails}

        Return ONLY a JSON array with one entry per email, in the same order:
        [
          {{"subject": "...", "category": "Interested"}},
          {{"subject": "...", "category": "Spam"}}
        ]"#}
}

pub struct ChatCompletionOracle {
    http_client: HttpClient,
    rate_limiters: RateLimiters,
    api_key: String,
    config: OracleConfig,
}

impl ChatCompletionOracle {
    pub fn new(
        http_client: HttpClient,
        rate_limiters: RateLimiters,
        api_key: String,
        config: OracleConfig,
    ) -> Self {
        Self {
            http_client,
            rate_limiters,
            api_key,
            config,
        }
    }
}

#[async_trait]
impl ClassificationOracle for ChatCompletionOracle {
    async fn classify(&self, batch: &[MailRecord]) -> Result<Vec<OracleLabel>, OracleError> {
        let resp = self
            .http_client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!(
              {
                "model": &self.config.model_id,
                "temperature": self.config.temperature,
                "max_tokens": self.config.max_tokens,
                "messages": [
                  { "role": "system", "content": SYSTEM_PROMPT },
                  { "role": "user", "content": user_prompt(batch) }
                ],
                "response_format": { "type": "json_object" }
              }
            ))
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .json::<Value>()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))?;

        let parsed = match serde_json::from_value::<ChatApiResponseOrError>(body.clone()) {
            Ok(ChatApiResponseOrError::Response(parsed)) if status.is_success() => parsed,
            Ok(ChatApiResponseOrError::Error(ChatApiErrorBody { error })) => {
                return Err(self.map_api_error(status, &error.message));
            }
            _ if !status.is_success() => return Err(self.map_api_error(status, &body.to_string())),
            _ => {
                return Err(OracleError::Malformed(format!(
                    "Could not parse chat response: {}",
                    body
                )))
            }
        };

        let content = parsed
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| OracleError::Malformed("No choices in response".to_string()))?;

        parse_labels(content, batch.len(), self.config.default_confidence)
    }
}

impl ChatCompletionOracle {
    fn map_api_error(&self, status: StatusCode, message: &str) -> OracleError {
        let error = classify_api_error(status, message);
        if matches!(error, OracleError::RateLimited(_)) {
            self.rate_limiters.trigger_backoff();
        }
        error
    }
}

fn classify_api_error(status: StatusCode, message: &str) -> OracleError {
    let lowered = message.to_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS || lowered.contains("rate limit") {
        return OracleError::RateLimited(message.to_string());
    }
    if lowered.contains("decommissioned")
        || lowered.contains("model_not_found")
        || lowered.contains("does not exist")
    {
        return OracleError::Unsupported(message.to_string());
    }
    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND => OracleError::Unsupported(format!("{status}: {message}")),
        _ => OracleError::Transport(format!("{status}: {message}")),
    }
}

/// Parse the model's answer into one label per record.
///
/// Accepts a bare array, an object wrapping it under `categories` or `emails`,
/// or an array embedded in surrounding text.
pub fn parse_labels(
    content: &str,
    expected: usize,
    default_confidence: f32,
) -> Result<Vec<OracleLabel>, OracleError> {
    static RE_ARRAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\[.*\]").unwrap());

    let entries = match serde_json::from_str::<Value>(content) {
        Ok(Value::Array(entries)) => entries,
        Ok(Value::Object(mut obj)) => match ["categories", "emails"]
            .iter()
            .find_map(|key| obj.remove(*key))
        {
            Some(Value::Array(entries)) => entries,
            _ if obj.contains_key("category") => vec![Value::Object(obj)],
            _ => {
                return Err(OracleError::Malformed(format!(
                    "No category array in: {}",
                    truncate_chars(content, 200)
                )))
            }
        },
        _ => RE_ARRAY
            .find(content)
            .and_then(|m| serde_json::from_str::<Vec<Value>>(m.as_str()).ok())
            .ok_or_else(|| {
                OracleError::Malformed(format!(
                    "Could not parse response: {}",
                    truncate_chars(content, 200)
                ))
            })?,
    };

    if entries.len() != expected {
        return Err(OracleError::Impossible {
            expected,
            got: entries.len(),
        });
    }

    Ok(entries
        .iter()
        .map(|entry| label_from_entry(entry, default_confidence))
        .collect())
}

fn label_from_entry(entry: &Value, default_confidence: f32) -> OracleLabel {
    let (label, confidence) = match entry {
        Value::String(label) => (Some(label.as_str()), None),
        Value::Object(obj) => (
            obj.get("category").and_then(Value::as_str),
            obj.get("confidence").and_then(Value::as_f64),
        ),
        _ => (None, None),
    };

    OracleLabel {
        category: label
            .and_then(Category::from_label)
            .unwrap_or(Category::Uncategorized),
        confidence: confidence
            .map(|c| c as f32)
            .unwrap_or(default_confidence)
            .clamp(0.0, 1.0),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: i32,
    pub message: ChatMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiError {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiErrorBody {
    pub error: ChatApiError,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatApiResponseOrError {
    Response(ChatApiResponse),
    Error(ChatApiErrorBody),
}
