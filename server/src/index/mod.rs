//! Document store capability: searchable copies of mail records keyed by UID.

pub mod elastic;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::mail_record::{Category, ClassificationMethod, ClassifiedRecord, MailRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("unexpected store response: {0}")]
    Malformed(String),
    #[error("document {uid} failed: {reason}")]
    Document { uid: u32, reason: String },
}

/// Indexed shape of a message. Classification fields stay empty until the
/// classified update lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailDocument {
    pub uid: u32,
    pub from: String,
    pub to: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub date: DateTime<Utc>,
    pub folder: String,
    pub account: String,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_important: bool,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_method: Option<ClassificationMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classified_at: Option<DateTime<Utc>>,
}

impl From<&MailRecord> for EmailDocument {
    fn from(record: &MailRecord) -> Self {
        Self {
            uid: record.uid,
            from: record.from.clone(),
            to: record.to.clone(),
            subject: record.subject.clone(),
            body: None,
            date: record.date,
            folder: record.folder.clone(),
            account: record.account.clone(),
            is_read: record.flags.seen,
            is_important: record.flags.flagged,
            has_attachments: false,
            labels: Vec::new(),
            ai_category: None,
            ai_confidence: None,
            ai_method: None,
            classified_at: None,
        }
    }
}

impl From<&ClassifiedRecord> for EmailDocument {
    fn from(classified: &ClassifiedRecord) -> Self {
        Self {
            ai_category: Some(classified.category),
            ai_confidence: Some(classified.confidence),
            ai_method: Some(classified.method),
            classified_at: Some(Utc::now()),
            ..EmailDocument::from(&classified.record)
        }
    }
}

/// Fields written by a partial (classification only) update.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationUpdate {
    pub ai_category: Option<Category>,
    pub ai_confidence: Option<f32>,
    pub ai_method: Option<ClassificationMethod>,
    pub classified_at: Option<DateTime<Utc>>,
}

impl From<&EmailDocument> for ClassificationUpdate {
    fn from(doc: &EmailDocument) -> Self {
        Self {
            ai_category: doc.ai_category,
            ai_confidence: doc.ai_confidence,
            ai_method: doc.ai_method,
            classified_at: doc.classified_at,
        }
    }
}

/// Per-document outcome of a bulk write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkReport {
    pub succeeded: Vec<u32>,
    pub failed: Vec<(u32, String)>,
}

impl BulkReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchFilter {
    pub query: Option<String>,
    pub folder: Option<String>,
    pub account: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub is_read: Option<bool>,
    pub is_important: Option<bool>,
    pub has_attachments: Option<bool>,
    pub labels: Vec<String>,
    pub category: Option<Category>,
    pub size: usize,
    pub offset: usize,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            query: None,
            folder: None,
            account: None,
            from: None,
            to: None,
            date_from: None,
            date_to: None,
            is_read: None,
            is_important: None,
            has_attachments: None,
            labels: Vec::new(),
            category: None,
            size: 20,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    #[serde(rename = "emails")]
    pub hits: Vec<EmailDocument>,
    pub total: u64,
    #[serde(rename = "took")]
    pub took_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub key: String,
    pub doc_count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total: u64,
    pub by_folder: Vec<Bucket>,
    pub by_account: Vec<Bucket>,
    pub unread: u64,
    pub important: u64,
    pub with_attachments: u64,
    pub by_category: Vec<Bucket>,
}

/// All writes are idempotent upserts keyed by `uid`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    async fn upsert(&self, doc: &EmailDocument) -> Result<(), StoreError>;

    /// `Err` means the request as a whole failed; per-document failures are
    /// reported in the `BulkReport`. A partial update only touches the
    /// classification fields of existing documents.
    async fn bulk_upsert(
        &self,
        docs: &[EmailDocument],
        partial: bool,
    ) -> Result<BulkReport, StoreError>;

    async fn search(&self, filter: &SearchFilter) -> Result<SearchResult, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}
