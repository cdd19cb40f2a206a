//! Elasticsearch store over the REST API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use super::{
    Bucket, BulkReport, ClassificationUpdate, DocumentStore, EmailDocument, SearchFilter,
    SearchResult, StoreError, StoreStats,
};
use crate::HttpClient;

pub struct ElasticStore {
    http_client: HttpClient,
    base_url: Url,
    index: String,
}

impl ElasticStore {
    pub fn new(http_client: HttpClient, base_url: Url, index: &str) -> Self {
        Self {
            http_client,
            base_url,
            index: index.to_string(),
        }
    }

    fn url(&self, path: &str) -> Result<Url, StoreError> {
        self.base_url
            .join(&format!("{}/{}", self.index, path))
            .map_err(|e| StoreError::Malformed(format!("bad store url: {e}")))
    }

    fn index_url(&self) -> Result<Url, StoreError> {
        self.base_url
            .join(&self.index)
            .map_err(|e| StoreError::Malformed(format!("bad store url: {e}")))
    }
}

fn unreachable(e: reqwest::Error) -> StoreError {
    StoreError::Unreachable(e.to_string())
}

async fn checked_json(resp: reqwest::Response) -> Result<Value, StoreError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(StoreError::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    resp.json::<Value>()
        .await
        .map_err(|e| StoreError::Malformed(e.to_string()))
}

pub fn index_mapping() -> Value {
    let text_with_keyword = json!({
        "type": "text",
        "fields": { "keyword": { "type": "keyword" } }
    });
    json!({
        "mappings": {
            "properties": {
                "uid": { "type": "long" },
                "from": text_with_keyword,
                "to": text_with_keyword,
                "subject": {
                    "type": "text",
                    "analyzer": "standard",
                    "fields": { "keyword": { "type": "keyword" } }
                },
                "body": { "type": "text", "analyzer": "standard" },
                "date": { "type": "date" },
                "folder": { "type": "keyword" },
                "account": { "type": "keyword" },
                "isRead": { "type": "boolean" },
                "isImportant": { "type": "boolean" },
                "hasAttachments": { "type": "boolean" },
                "labels": { "type": "keyword" },
                "aiCategory": { "type": "keyword" },
                "aiConfidence": { "type": "float" },
                "aiMethod": { "type": "keyword" },
                "classifiedAt": { "type": "date" }
            }
        },
        "settings": {
            "analysis": {
                "analyzer": {
                    "email_analyzer": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase", "stop", "snowball"]
                    }
                }
            }
        }
    })
}

/// NDJSON body for `_bulk`. Partial updates carry only classification fields.
pub fn bulk_body(index: &str, docs: &[EmailDocument], partial: bool) -> Result<String, StoreError> {
    let mut body = String::new();
    for doc in docs {
        let (action, source) = if partial {
            (
                json!({ "update": { "_index": index, "_id": doc.uid.to_string() } }),
                json!({ "doc": ClassificationUpdate::from(doc) }),
            )
        } else {
            (
                json!({ "index": { "_index": index, "_id": doc.uid.to_string() } }),
                serde_json::to_value(doc).map_err(|e| StoreError::Malformed(e.to_string()))?,
            )
        };
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&source.to_string());
        body.push('\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<Value>,
}

fn bulk_report(resp: BulkResponse) -> BulkReport {
    let mut report = BulkReport::default();
    for item in resp.items {
        let Some(result) = item.as_object().and_then(|o| o.values().next()) else {
            continue;
        };
        let Some(uid) = result
            .get("_id")
            .and_then(Value::as_str)
            .and_then(|id| id.parse::<u32>().ok())
        else {
            continue;
        };
        match result.get("error") {
            Some(error) => {
                let reason = error
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                report.failed.push((uid, reason));
            }
            None => report.succeeded.push(uid),
        }
    }
    report
}

/// Case-insensitive substring match on a keyword field. Wildcard
/// metacharacters in `needle` match literally.
fn contains_filter(field: &str, needle: &str) -> Value {
    let escaped: String = needle
        .chars()
        .flat_map(|c| match c {
            '\\' | '*' | '?' => vec!['\\', c],
            _ => vec![c],
        })
        .collect();
    json!({
        "wildcard": {
            field: {
                "value": format!("*{escaped}*"),
                "case_insensitive": true
            }
        }
    })
}

pub fn search_query(filter: &SearchFilter) -> Value {
    let mut must: Vec<Value> = Vec::new();
    let mut should: Vec<Value> = Vec::new();

    if let Some(query) = filter.query.as_deref() {
        should.push(json!({
            "multi_match": {
                "query": query,
                "fields": ["subject^2", "body", "from", "to"],
                "type": "best_fields",
                "fuzziness": "AUTO"
            }
        }));
    }
    if let Some(folder) = filter.folder.as_deref() {
        must.push(json!({ "term": { "folder": folder } }));
    }
    if let Some(account) = filter.account.as_deref() {
        must.push(json!({ "term": { "account": account } }));
    }
    if let Some(from) = filter.from.as_deref() {
        must.push(contains_filter("from.keyword", from));
    }
    if let Some(to) = filter.to.as_deref() {
        must.push(contains_filter("to.keyword", to));
    }
    if let Some(is_read) = filter.is_read {
        must.push(json!({ "term": { "isRead": is_read } }));
    }
    if let Some(is_important) = filter.is_important {
        must.push(json!({ "term": { "isImportant": is_important } }));
    }
    if let Some(has_attachments) = filter.has_attachments {
        must.push(json!({ "term": { "hasAttachments": has_attachments } }));
    }
    if !filter.labels.is_empty() {
        must.push(json!({ "terms": { "labels": filter.labels } }));
    }
    if let Some(category) = filter.category {
        must.push(json!({ "term": { "aiCategory": category.label() } }));
    }
    if filter.date_from.is_some() || filter.date_to.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(from) = filter.date_from {
            range.insert("gte".to_string(), json!(from.to_rfc3339()));
        }
        if let Some(to) = filter.date_to {
            range.insert("lte".to_string(), json!(to.to_rfc3339()));
        }
        must.push(json!({ "range": { "date": range } }));
    }

    let query = match (must.is_empty(), should.len()) {
        (true, 0) => json!({ "match_all": {} }),
        (true, 1) => should.remove(0),
        _ => {
            let mut bool_query = serde_json::Map::new();
            if !must.is_empty() {
                bool_query.insert("must".to_string(), json!(must));
            }
            if !should.is_empty() {
                bool_query.insert("should".to_string(), json!(should));
                bool_query.insert("minimum_should_match".to_string(), json!(1));
            }
            json!({ "bool": bool_query })
        }
    };

    json!({
        "query": query,
        "sort": [{ "date": { "order": "desc" } }],
        "size": filter.size,
        "from": filter.offset,
        "_source": true
    })
}

fn parse_search(resp: &Value) -> Result<SearchResult, StoreError> {
    let hits = resp
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| StoreError::Malformed("missing hits".to_string()))?
        .iter()
        .filter_map(|hit| hit.get("_source"))
        .filter_map(|source| match serde_json::from_value::<EmailDocument>(source.clone()) {
            Ok(doc) => Some(doc),
            Err(e) => {
                tracing::warn!("Skipping unreadable search hit: {}", e);
                None
            }
        })
        .collect();

    let total = match resp.pointer("/hits/total") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(total) => total.get("value").and_then(Value::as_u64).unwrap_or(0),
        None => 0,
    };

    Ok(SearchResult {
        hits,
        total,
        took_ms: resp.get("took").and_then(Value::as_u64).unwrap_or(0),
    })
}

fn parse_buckets(resp: &Value, agg: &str) -> Vec<Bucket> {
    resp.pointer(&format!("/aggregations/{agg}/buckets"))
        .cloned()
        .and_then(|b| serde_json::from_value::<Vec<Bucket>>(b).ok())
        .unwrap_or_default()
}

fn parse_stats(resp: &Value) -> StoreStats {
    let doc_count = |agg: &str| {
        resp.pointer(&format!("/aggregations/{agg}/doc_count"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    StoreStats {
        total: resp
            .pointer("/aggregations/total_emails/value")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        by_folder: parse_buckets(resp, "by_folder"),
        by_account: parse_buckets(resp, "by_account"),
        unread: doc_count("unread_count"),
        important: doc_count("important_count"),
        with_attachments: doc_count("with_attachments"),
        by_category: parse_buckets(resp, "by_category"),
    }
}

#[async_trait]
impl DocumentStore for ElasticStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let exists = self
            .http_client
            .head(self.index_url()?)
            .send()
            .await
            .map_err(unreachable)?;

        match exists.status() {
            StatusCode::OK => {
                tracing::info!("Index {} already exists", self.index);
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                let resp = self
                    .http_client
                    .put(self.index_url()?)
                    .json(&index_mapping())
                    .send()
                    .await
                    .map_err(unreachable)?;
                checked_json(resp).await?;
                tracing::info!("Created index: {}", self.index);
                Ok(())
            }
            status => Err(StoreError::Rejected {
                status: status.as_u16(),
                body: "index existence check failed".to_string(),
            }),
        }
    }

    async fn upsert(&self, doc: &EmailDocument) -> Result<(), StoreError> {
        let resp = self
            .http_client
            .put(self.url(&format!("_doc/{}", doc.uid))?)
            .json(doc)
            .send()
            .await
            .map_err(unreachable)?;

        checked_json(resp).await.map_err(|e| match e {
            StoreError::Rejected { body, .. } => StoreError::Document {
                uid: doc.uid,
                reason: body,
            },
            other => other,
        })?;
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        docs: &[EmailDocument],
        partial: bool,
    ) -> Result<BulkReport, StoreError> {
        if docs.is_empty() {
            return Ok(BulkReport::default());
        }

        let mut url = self.url("_bulk")?;
        url.set_query(Some("refresh=true"));
        let resp = self
            .http_client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(bulk_body(&self.index, docs, partial)?)
            .send()
            .await
            .map_err(unreachable)?;

        let body = checked_json(resp).await?;
        let report = bulk_report(
            serde_json::from_value::<BulkResponse>(body)
                .map_err(|e| StoreError::Malformed(e.to_string()))?,
        );
        for (uid, reason) in &report.failed {
            tracing::error!(uid, partial, "Bulk write failed: {}", reason);
        }
        Ok(report)
    }

    async fn search(&self, filter: &SearchFilter) -> Result<SearchResult, StoreError> {
        let resp = self
            .http_client
            .post(self.url("_search")?)
            .json(&search_query(filter))
            .send()
            .await
            .map_err(unreachable)?;
        parse_search(&checked_json(resp).await?)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let resp = self
            .http_client
            .post(self.url("_search")?)
            .json(&json!({
                "size": 0,
                "aggs": {
                    "total_emails": { "value_count": { "field": "uid" } },
                    "by_folder": { "terms": { "field": "folder" } },
                    "by_account": { "terms": { "field": "account" } },
                    "unread_count": { "filter": { "term": { "isRead": false } } },
                    "important_count": { "filter": { "term": { "isImportant": true } } },
                    "with_attachments": { "filter": { "term": { "hasAttachments": true } } },
                    "by_category": { "terms": { "field": "aiCategory" } }
                }
            }))
            .send()
            .await
            .map_err(unreachable)?;
        Ok(parse_stats(&checked_json(resp).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mail_record::{Category, ClassificationMethod, ClassifiedRecord};
    use crate::testing::common::record;

    #[test]
    fn test_bulk_body_partial_carries_only_classification() {
        let classified = ClassifiedRecord::new(
            record(17, "Hello"),
            Category::Interested,
            ClassificationMethod::Oracle,
            0.9,
        );
        let body = bulk_body("emails", &[EmailDocument::from(&classified)], true).unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["update"]["_id"], "17");
        let doc = lines[1]["doc"].as_object().unwrap();
        assert_eq!(doc["aiCategory"], "Interested");
        assert_eq!(doc["aiMethod"], "AI");
        assert!(!doc.contains_key("subject"));
    }

    #[test]
    fn test_bulk_body_full_index() {
        let body = bulk_body("emails", &[EmailDocument::from(&record(3, "Hi"))], false).unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["index"]["_index"], "emails");
        assert_eq!(lines[1]["subject"], "Hi");
        assert_eq!(lines[1]["isRead"], false);
        assert!(lines[1].get("aiCategory").is_none());
    }

    #[test]
    fn test_bulk_report_splits_failures() {
        let resp: BulkResponse = serde_json::from_value(json!({
            "errors": true,
            "items": [
                { "update": { "_id": "1", "status": 200 } },
                { "update": { "_id": "2", "status": 404,
                    "error": { "type": "document_missing_exception", "reason": "missing" } } }
            ]
        }))
        .unwrap();
        let report = bulk_report(resp);
        assert_eq!(report.succeeded, vec![1]);
        assert_eq!(
            report.failed,
            vec![(2, "document_missing_exception".to_string())]
        );
    }

    #[test]
    fn test_search_query_shapes() {
        let all = search_query(&SearchFilter::default());
        assert!(all["query"]["match_all"].is_object());
        assert_eq!(all["size"], 20);

        let text_only = search_query(&SearchFilter {
            query: Some("demo".to_string()),
            ..Default::default()
        });
        assert_eq!(text_only["query"]["multi_match"]["query"], "demo");

        let combined = search_query(&SearchFilter {
            query: Some("demo".to_string()),
            from: Some("acme".to_string()),
            category: Some(Category::MeetingBooked),
            offset: 40,
            ..Default::default()
        });
        let must = combined["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must[0]["wildcard"]["from.keyword"]["value"], "*acme*");
        assert_eq!(must[0]["wildcard"]["from.keyword"]["case_insensitive"], true);
        assert_eq!(must[1]["term"]["aiCategory"], "Meeting Booked");
        assert_eq!(combined["query"]["bool"]["minimum_should_match"], 1);
        assert_eq!(combined["from"], 40);
    }

    #[test]
    fn test_sender_filter_escapes_wildcards() {
        let query = search_query(&SearchFilter {
            from: Some("Bob*?\\".to_string()),
            to: Some("Team".to_string()),
            ..Default::default()
        });
        let must = query["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must[0]["wildcard"]["from.keyword"]["value"], r"*Bob\*\?\\*");
        assert_eq!(must[1]["wildcard"]["to.keyword"]["value"], "*Team*");
        assert_eq!(must[1]["wildcard"]["to.keyword"]["case_insensitive"], true);
    }

    #[test]
    fn test_parse_search_and_stats() {
        let rec = record(4, "Hi");
        let resp = json!({
            "took": 7,
            "hits": {
                "total": { "value": 1, "relation": "eq" },
                "hits": [ { "_id": "4", "_source": EmailDocument::from(&rec) } ]
            }
        });
        let result = parse_search(&resp).unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.took_ms, 7);
        assert_eq!(result.hits[0].uid, 4);

        let stats = parse_stats(&json!({
            "aggregations": {
                "total_emails": { "value": 3 },
                "by_folder": { "buckets": [ { "key": "INBOX", "doc_count": 3 } ] },
                "unread_count": { "doc_count": 2 }
            }
        }));
        assert_eq!(stats.total, 3);
        assert_eq!(stats.unread, 2);
        assert_eq!(stats.by_folder[0].key, "INBOX");
        assert!(stats.by_category.is_empty());
    }
}
