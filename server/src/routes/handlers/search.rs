use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, AppJsonResult, AppResult},
    index::{DocumentStore, SearchFilter, SearchResult, StoreStats},
    model::mail_record::Category,
    ServerState,
};

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub q: Option<String>,
    /// Alias of `q`
    pub query: Option<String>,
    pub folder: Option<String>,
    pub account: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub is_read: Option<bool>,
    pub is_important: Option<bool>,
    pub has_attachments: Option<bool>,
    /// Comma separated
    pub labels: Option<String>,
    pub ai_category: Option<String>,
    pub size: Option<usize>,
    pub page: Option<usize>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// RFC 3339 timestamp or a bare `YYYY-MM-DD` day. A bare `dateTo` covers the
/// whole day.
fn parse_date(field: &str, value: &str, end_of_day: bool) -> AppResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest(format!("Invalid {field}: {value}")))?;
    let time = if end_of_day {
        day.and_hms_opt(23, 59, 59)
    } else {
        day.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| AppError::BadRequest(format!("Invalid {field}: {value}")))
}

impl SearchParams {
    pub fn into_filter(self) -> AppResult<SearchFilter> {
        let size = self.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let page = self.page.unwrap_or(0);

        let category = non_empty(self.ai_category)
            .map(|label| {
                Category::from_label(&label)
                    .ok_or_else(|| AppError::BadRequest(format!("Unknown category: {label}")))
            })
            .transpose()?;

        Ok(SearchFilter {
            query: non_empty(self.q).or_else(|| non_empty(self.query)),
            folder: non_empty(self.folder),
            account: non_empty(self.account),
            from: non_empty(self.from),
            to: non_empty(self.to),
            date_from: non_empty(self.date_from)
                .map(|d| parse_date("dateFrom", &d, false))
                .transpose()?,
            date_to: non_empty(self.date_to)
                .map(|d| parse_date("dateTo", &d, true))
                .transpose()?,
            is_read: self.is_read,
            is_important: self.is_important,
            has_attachments: self.has_attachments,
            labels: self
                .labels
                .map(|labels| {
                    labels
                        .split(',')
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            category,
            size,
            offset: page.saturating_mul(size),
        })
    }
}

/// # GET /search
pub async fn search(
    State(state): State<ServerState>,
    Query(params): Query<SearchParams>,
) -> AppJsonResult<SearchResult> {
    let filter = params.into_filter()?;
    let result = state.store.search(&filter).await?;
    Ok(Json(result))
}

/// # GET /stats
pub async fn stats(State(state): State<ServerState>) -> AppJsonResult<StoreStats> {
    Ok(Json(state.store.stats().await?))
}

#[derive(Debug, Serialize)]
pub struct FoldersResponse {
    pub folders: Vec<String>,
}

/// # GET /folders
pub async fn folders(State(state): State<ServerState>) -> AppJsonResult<FoldersResponse> {
    let stats = state.store.stats().await?;
    Ok(Json(FoldersResponse {
        folders: stats.by_folder.into_iter().map(|b| b.key).collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct AccountsResponse {
    pub accounts: Vec<String>,
}

/// # GET /accounts
pub async fn accounts(State(state): State<ServerState>) -> AppJsonResult<AccountsResponse> {
    let stats = state.store.stats().await?;
    Ok(Json(AccountsResponse {
        accounts: stats.by_account.into_iter().map(|b| b.key).collect(),
    }))
}
