//! Access token capability for the mail protocol.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::util::check_expired;

pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token has been expired or revoked")]
    ExpiredOrRevoked,
    #[error("bad token endpoint response: {0}")]
    BadResponse(String),
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Clone)]
pub struct AccessToken {
    token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(check_expired).unwrap_or(false)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn get_access_token(&self) -> Result<AccessToken, TokenError>;
}

/// Serves a fixed token. Useful against local servers and in development.
pub struct StaticTokenProvider(AccessToken);

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self(AccessToken::new(token, None))
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn get_access_token(&self) -> Result<AccessToken, TokenError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct RefreshTokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Exchanges a long-lived refresh token for access tokens and caches them
/// until shortly before expiry.
pub struct GoogleTokenProvider {
    http_client: reqwest::Client,
    token_uri: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    cached: Mutex<Option<AccessToken>>,
}

impl GoogleTokenProvider {
    pub fn new(
        http_client: reqwest::Client,
        client_id: String,
        client_secret: String,
        refresh_token: String,
    ) -> Self {
        Self::with_token_uri(
            http_client,
            GOOGLE_TOKEN_URI.to_string(),
            client_id,
            client_secret,
            refresh_token,
        )
    }

    pub fn with_token_uri(
        http_client: reqwest::Client,
        token_uri: String,
        client_id: String,
        client_secret: String,
        refresh_token: String,
    ) -> Self {
        Self {
            http_client,
            token_uri,
            client_id,
            client_secret,
            refresh_token,
            cached: Mutex::new(None),
        }
    }

    async fn exchange_refresh_token(&self) -> Result<AccessToken, TokenError> {
        let resp = self
            .http_client
            .post(&self.token_uri)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let resp = resp.json::<serde_json::Value>().await?;
        parse_token_response(resp)
    }
}

fn parse_token_response(resp: serde_json::Value) -> Result<AccessToken, TokenError> {
    if resp.get("error").is_some() {
        return match resp.get("error_description").and_then(|d| d.as_str()) {
            Some("Token has been expired or revoked.") => Err(TokenError::ExpiredOrRevoked),
            Some(desc) => Err(TokenError::BadResponse(desc.to_string())),
            None => Err(TokenError::BadResponse(resp.to_string())),
        };
    }

    let parsed = serde_json::from_value::<RefreshTokenResponse>(resp)
        .map_err(|e| TokenError::BadResponse(e.to_string()))?;
    Ok(AccessToken::new(
        parsed.access_token,
        Some(Utc::now() + Duration::seconds(parsed.expires_in)),
    ))
}

#[async_trait]
impl AccessTokenProvider for GoogleTokenProvider {
    async fn get_access_token(&self) -> Result<AccessToken, TokenError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| !t.is_expired()) {
            return Ok(token.clone());
        }

        tracing::debug!("Refreshing mail access token");
        let token = self.exchange_refresh_token().await.map_err(|e| {
            tracing::error!("Error refreshing token: {:?}", e);
            e
        })?;
        *cached = Some(token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_token_response() {
        let token = parse_token_response(json!({
            "access_token": "ya29.abc",
            "expires_in": 3599,
            "scope": "https://mail.google.com/",
            "token_type": "Bearer"
        }))
        .unwrap();
        assert_eq!(token.secret(), "ya29.abc");
        assert!(!token.is_expired());
    }

    #[test]
    fn test_parse_revoked_token() {
        let err = parse_token_response(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        }))
        .unwrap_err();
        assert!(matches!(err, TokenError::ExpiredOrRevoked));
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticTokenProvider::new("dev-token");
        let token = provider.get_access_token().await.unwrap();
        assert_eq!(token.secret(), "dev-token");
        assert!(format!("{:?}", token).contains("<redacted>"));
    }
}
