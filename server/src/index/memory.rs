use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use itertools::Itertools;
use tokio::sync::RwLock;

use super::{
    Bucket, BulkReport, DocumentStore, EmailDocument, SearchFilter, SearchResult, StoreError,
    StoreStats,
};

/// Process-local store. Same contract as the Elasticsearch store; used in
/// tests and when no search cluster is configured.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<u32, EmailDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, uid: u32) -> Option<EmailDocument> {
        self.docs.read().await.get(&uid).cloned()
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn matches(doc: &EmailDocument, filter: &SearchFilter) -> bool {
    if let Some(query) = filter.query.as_deref() {
        let hit = [
            Some(doc.subject.as_str()),
            doc.body.as_deref(),
            Some(doc.from.as_str()),
            Some(doc.to.as_str()),
        ]
        .into_iter()
        .flatten()
        .any(|field| contains_ci(field, query));
        if !hit {
            return false;
        }
    }

    filter.folder.as_deref().map_or(true, |f| doc.folder == f)
        && filter.account.as_deref().map_or(true, |a| doc.account == a)
        && filter.from.as_deref().map_or(true, |f| contains_ci(&doc.from, f))
        && filter.to.as_deref().map_or(true, |t| contains_ci(&doc.to, t))
        && filter.date_from.map_or(true, |d| doc.date >= d)
        && filter.date_to.map_or(true, |d| doc.date <= d)
        && filter.is_read.map_or(true, |r| doc.is_read == r)
        && filter.is_important.map_or(true, |i| doc.is_important == i)
        && filter.has_attachments.map_or(true, |a| doc.has_attachments == a)
        && (filter.labels.is_empty() || filter.labels.iter().any(|l| doc.labels.contains(l)))
        && filter.category.map_or(true, |c| doc.ai_category == Some(c))
}

fn buckets<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<Bucket> {
    keys.counts()
        .into_iter()
        .map(|(key, count)| Bucket {
            key: key.to_string(),
            doc_count: count as u64,
        })
        .sorted_by(|a, b| b.doc_count.cmp(&a.doc_count).then_with(|| a.key.cmp(&b.key)))
        .collect()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert(&self, doc: &EmailDocument) -> Result<(), StoreError> {
        self.docs.write().await.insert(doc.uid, doc.clone());
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        docs: &[EmailDocument],
        partial: bool,
    ) -> Result<BulkReport, StoreError> {
        let mut store = self.docs.write().await;
        let mut report = BulkReport::default();
        for doc in docs {
            if !partial {
                store.insert(doc.uid, doc.clone());
                report.succeeded.push(doc.uid);
                continue;
            }
            match store.get_mut(&doc.uid) {
                Some(existing) => {
                    existing.ai_category = doc.ai_category;
                    existing.ai_confidence = doc.ai_confidence;
                    existing.ai_method = doc.ai_method;
                    existing.classified_at = doc.classified_at;
                    report.succeeded.push(doc.uid);
                }
                None => report
                    .failed
                    .push((doc.uid, "document_missing_exception".to_string())),
            }
        }
        Ok(report)
    }

    async fn search(&self, filter: &SearchFilter) -> Result<SearchResult, StoreError> {
        let started = Instant::now();
        let store = self.docs.read().await;
        let matching = store
            .values()
            .filter(|doc| matches(doc, filter))
            .sorted_by(|a, b| b.date.cmp(&a.date).then_with(|| b.uid.cmp(&a.uid)))
            .collect_vec();

        Ok(SearchResult {
            total: matching.len() as u64,
            hits: matching
                .into_iter()
                .skip(filter.offset)
                .take(filter.size)
                .cloned()
                .collect(),
            took_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let store = self.docs.read().await;
        let docs = store.values().collect_vec();
        Ok(StoreStats {
            total: docs.len() as u64,
            by_folder: buckets(docs.iter().map(|d| d.folder.as_str())),
            by_account: buckets(docs.iter().map(|d| d.account.as_str())),
            unread: docs.iter().filter(|d| !d.is_read).count() as u64,
            important: docs.iter().filter(|d| d.is_important).count() as u64,
            with_attachments: docs.iter().filter(|d| d.has_attachments).count() as u64,
            by_category: buckets(
                docs.iter()
                    .filter_map(|d| d.ai_category.as_ref().map(|c| c.label())),
            ),
        })
    }
}
