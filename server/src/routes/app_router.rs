use axum::{
    http::{HeaderValue, Method, Uri},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers::{categorize, feed, search, status};
use crate::{error::AppError, request_tracing, ServerState};

pub struct AppRouter;

impl AppRouter {
    pub fn create(state: ServerState, allowed_origins: &[String]) -> Router {
        let origins = allowed_origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Ignoring invalid CORS origin {}", origin);
                    None
                }
            })
            .collect::<Vec<_>>();

        let cors_layer = CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([http::header::CONTENT_TYPE]);

        let router = Router::new()
            .route("/", get(|| async { "Inbox triage server" }))
            .route("/search", get(search::search))
            .route("/stats", get(search::stats))
            .route("/folders", get(search::folders))
            .route("/accounts", get(search::accounts))
            .route("/categorize", post(categorize::categorize))
            .route("/categorize/batch", post(categorize::categorize_batch))
            .route("/ai-stats", get(categorize::ai_stats))
            .route("/ai-categories", get(categorize::ai_categories))
            .route("/status", get(status::status))
            .route("/ws", get(feed::feed_ws))
            .fallback(handler_404)
            .with_state(state);

        request_tracing::with_request_tracing(router).layer(cors_layer)
    }
}

pub async fn handler_404(uri: Uri) -> AppError {
    AppError::NotFound(format!("Route {} does not exist", uri.path()))
}
