use std::collections::BTreeMap;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::{
    email::rules,
    error::{AppError, AppJsonResult},
    index::{DocumentStore, SearchFilter},
    model::mail_record::{Category, ClassificationMethod, EmailText},
    ServerState,
};

/// Documents sampled for `/ai-stats`.
const AI_STATS_SAMPLE: usize = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Categorization {
    pub category: Category,
    pub confidence: f32,
    pub method: ClassificationMethod,
    pub matches: usize,
}

impl From<&EmailText> for Categorization {
    fn from(text: &EmailText) -> Self {
        let verdict = rules::classify(text);
        Self {
            category: verdict.category,
            confidence: verdict.confidence,
            method: ClassificationMethod::RuleFallback,
            matches: verdict.matches,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStat {
    pub count: u64,
    pub percentage: f32,
    pub average_confidence: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryStats {
    pub total: u64,
    pub categories: BTreeMap<String, CategoryStat>,
}

/// Per-category count, share and mean confidence.
pub fn category_stats(items: impl IntoIterator<Item = (Category, f32)>) -> CategoryStats {
    let mut sums: BTreeMap<Category, (u64, f32)> = BTreeMap::new();
    let mut total = 0u64;
    for (category, confidence) in items {
        let entry = sums.entry(category).or_default();
        entry.0 += 1;
        entry.1 += confidence;
        total += 1;
    }

    let categories = sums
        .into_iter()
        .map(|(category, (count, confidence_sum))| {
            (
                category.label().to_string(),
                CategoryStat {
                    count,
                    percentage: count as f32 * 100.0 / total as f32,
                    average_confidence: confidence_sum / count as f32,
                },
            )
        })
        .collect();

    CategoryStats { total, categories }
}

#[derive(Debug, Deserialize)]
pub struct CategorizeRequest {
    pub email: Option<EmailText>,
}

/// # POST /categorize
pub async fn categorize(Json(body): Json<CategorizeRequest>) -> AppJsonResult<Categorization> {
    let email = body
        .email
        .ok_or_else(|| AppError::BadRequest("Email data is required".to_string()))?;
    Ok(Json(Categorization::from(&email)))
}

#[derive(Debug, Deserialize)]
pub struct CategorizeBatchRequest {
    pub emails: Option<Vec<EmailText>>,
}

#[derive(Debug, Serialize)]
pub struct CategorizeBatchResponse {
    pub categorizations: Vec<Categorization>,
    pub stats: CategoryStats,
    pub total: usize,
}

/// # POST /categorize/batch
pub async fn categorize_batch(
    Json(body): Json<CategorizeBatchRequest>,
) -> AppJsonResult<CategorizeBatchResponse> {
    let emails = body
        .emails
        .ok_or_else(|| AppError::BadRequest("Emails array is required".to_string()))?;

    let categorizations: Vec<Categorization> = emails.iter().map(Categorization::from).collect();
    let stats = category_stats(categorizations.iter().map(|c| (c.category, c.confidence)));

    Ok(Json(CategorizeBatchResponse {
        total: emails.len(),
        categorizations,
        stats,
    }))
}

/// # GET /ai-stats
///
/// Category distribution over the most recent indexed documents. Documents
/// not yet classified count as `Uncategorized` with confidence 0.
pub async fn ai_stats(State(state): State<ServerState>) -> AppJsonResult<CategoryStats> {
    let result = state
        .store
        .search(&SearchFilter {
            size: AI_STATS_SAMPLE,
            ..Default::default()
        })
        .await?;

    Ok(Json(category_stats(result.hits.iter().map(|doc| {
        (
            doc.ai_category.unwrap_or(Category::Uncategorized),
            doc.ai_confidence.unwrap_or(0.0),
        )
    }))))
}

#[derive(Debug, Serialize)]
pub struct CategoriesResponse {
    pub categories: Vec<&'static str>,
}

/// # GET /ai-categories
pub async fn ai_categories() -> Json<CategoriesResponse> {
    Json(CategoriesResponse {
        categories: Category::iter().map(|c| c.label()).collect(),
    })
}
