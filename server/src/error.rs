use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use derive_more::derive::Display;
use serde_json::json;

use crate::index::StoreError;

pub type AppResult<T> = Result<T, AppError>;
pub type AppJsonResult<T> = AppResult<Json<T>>;

#[derive(Debug, Display)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Store(StoreError),
    Unavailable(String),
}

impl std::error::Error for AppError {}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Unreachable(msg) => AppError::Unavailable(msg),
            other => AppError::Store(other),
        }
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(json!({"error": {
            "code": status.as_u16(),
            "message": message.into()
        }})),
    )
}

// This centralizes all different errors from our app in one place
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = match self {
            AppError::BadRequest(error) => error_body(StatusCode::BAD_REQUEST, error),
            AppError::NotFound(msg) => error_body(StatusCode::NOT_FOUND, msg),
            AppError::Store(err) => {
                tracing::error!("Store error: {:?}", err);
                error_body(StatusCode::INTERNAL_SERVER_ERROR, "Search failed")
            }
            AppError::Unavailable(msg) => {
                tracing::warn!("Store unavailable: {}", msg);
                error_body(StatusCode::SERVICE_UNAVAILABLE, "Search backend unavailable")
            }
        };
        tracing::error!("Error: {:?}", err.1);

        err.into_response()
    }
}
