pub mod groq;

use async_trait::async_trait;

use crate::model::mail_record::{Category, MailRecord};

#[derive(Debug, Clone, thiserror::Error)]
pub enum OracleError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("unsupported request: {0}")]
    Unsupported(String),
    #[error("expected {expected} labels, got {got}")]
    Impossible { expected: usize, got: usize },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl OracleError {
    /// Whether another attempt could succeed. Unsupported and impossible
    /// answers abandon the oracle path at once.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OracleError::RateLimited(_) | OracleError::Malformed(_) | OracleError::Transport(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OracleLabel {
    pub category: Category,
    pub confidence: f32,
}

/// Natural-language classification capability.
///
/// Returns exactly one label per input record, in input order, or fails.
#[async_trait]
pub trait ClassificationOracle: Send + Sync {
    async fn classify(&self, batch: &[MailRecord]) -> Result<Vec<OracleLabel>, OracleError>;
}
