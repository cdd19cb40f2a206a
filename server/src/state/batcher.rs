//! Classification Batcher
//!
//! Every batch runs the state machine
//! `Pending -> (OracleAttempt <-> RetryWait)* -> {OracleSuccess | FallbackApplied}`
//! and always yields one `ClassifiedRecord` per input record, in input order.

use std::{sync::Arc, time::Duration};

use crate::{
    email::rules,
    model::mail_record::{ClassificationMethod, ClassifiedRecord, MailRecord},
    observability::PipelineTracker,
    prompt::{ClassificationOracle, OracleError, OracleLabel},
    rate_limiters::RateLimiters,
    server_config::OracleConfig,
};

#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    pub max_attempts: u32,
    pub rate_limit_backoff: Duration,
    pub error_retry_delay: Duration,
}

impl From<&OracleConfig> for BatcherConfig {
    fn from(config: &OracleConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1) as u32,
            rate_limit_backoff: config.rate_limit_backoff(),
            error_retry_delay: config.error_retry_delay(),
        }
    }
}

#[derive(Debug)]
enum BatchState {
    Pending,
    OracleAttempt { attempt: u32 },
    RetryWait { attempt: u32, delay: Duration },
    OracleSuccess(Vec<OracleLabel>),
    FallbackApplied,
}

#[derive(Clone)]
pub struct ClassificationBatcher {
    oracle: Option<Arc<dyn ClassificationOracle>>,
    rate_limiters: RateLimiters,
    config: BatcherConfig,
    tracker: PipelineTracker,
}

impl ClassificationBatcher {
    pub fn new(
        oracle: Option<Arc<dyn ClassificationOracle>>,
        rate_limiters: RateLimiters,
        config: BatcherConfig,
        tracker: PipelineTracker,
    ) -> Self {
        Self {
            oracle,
            rate_limiters,
            config,
            tracker,
        }
    }

    pub fn has_oracle(&self) -> bool {
        self.oracle.is_some()
    }

    /// Never fails: when the oracle path is exhausted or abandoned the rule
    /// classifier labels the whole batch.
    pub async fn classify(&self, batch: Vec<MailRecord>) -> Vec<ClassifiedRecord> {
        if batch.is_empty() {
            return Vec::new();
        }

        let mut state = BatchState::Pending;
        loop {
            state = match state {
                BatchState::Pending => match self.oracle {
                    Some(_) => BatchState::OracleAttempt { attempt: 1 },
                    None => BatchState::FallbackApplied,
                },
                BatchState::OracleAttempt { attempt } => {
                    self.attempt_oracle(&batch, attempt).await
                }
                BatchState::RetryWait { attempt, delay } => {
                    tokio::time::sleep(delay).await;
                    BatchState::OracleAttempt {
                        attempt: attempt + 1,
                    }
                }
                BatchState::OracleSuccess(labels) => {
                    let classified = batch
                        .into_iter()
                        .zip(labels)
                        .map(|(record, label)| {
                            ClassifiedRecord::new(
                                record,
                                label.category,
                                ClassificationMethod::Oracle,
                                label.confidence,
                            )
                        })
                        .collect::<Vec<_>>();
                    self.tracker
                        .record_classified(ClassificationMethod::Oracle, classified.len());
                    return classified;
                }
                BatchState::FallbackApplied => {
                    let classified = fallback(batch);
                    self.tracker
                        .record_classified(ClassificationMethod::RuleFallback, classified.len());
                    return classified;
                }
            };
        }
    }

    async fn attempt_oracle(&self, batch: &[MailRecord], attempt: u32) -> BatchState {
        let Some(oracle) = self.oracle.as_ref() else {
            return BatchState::FallbackApplied;
        };

        self.rate_limiters.acquire_one().await;
        self.tracker.record_oracle_attempt();

        let error = match oracle.classify(batch).await {
            Ok(labels) if labels.len() == batch.len() => {
                tracing::debug!(batch_size = batch.len(), attempt, "Oracle classified batch");
                return BatchState::OracleSuccess(labels);
            }
            Ok(labels) => OracleError::Impossible {
                expected: batch.len(),
                got: labels.len(),
            },
            Err(error) => error,
        };

        if !error.is_retryable() {
            tracing::warn!(
                batch_size = batch.len(),
                attempt,
                "Oracle failed, using rule fallback: {}",
                error
            );
            return BatchState::FallbackApplied;
        }
        if attempt >= self.config.max_attempts {
            tracing::warn!(
                batch_size = batch.len(),
                attempt,
                "Oracle retries exhausted, using rule fallback: {}",
                error
            );
            return BatchState::FallbackApplied;
        }

        let delay = match error {
            OracleError::RateLimited(_) => self.config.rate_limit_backoff,
            _ => self.config.error_retry_delay,
        };
        tracing::info!(
            batch_size = batch.len(),
            attempt,
            "Oracle attempt failed, retrying in {:?}: {}",
            delay,
            error
        );
        BatchState::RetryWait { attempt, delay }
    }
}

fn fallback(batch: Vec<MailRecord>) -> Vec<ClassifiedRecord> {
    batch
        .into_iter()
        .map(|record| {
            let verdict = rules::classify_record(&record);
            ClassifiedRecord::new(
                record,
                verdict.category,
                ClassificationMethod::RuleFallback,
                verdict.confidence,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mail_record::Category;
    use crate::testing::common::{record, ScriptedOracle};
    use itertools::Itertools;

    fn config() -> BatcherConfig {
        BatcherConfig {
            max_attempts: 2,
            rate_limit_backoff: Duration::from_secs(3),
            error_retry_delay: Duration::from_secs(2),
        }
    }

    fn limiters() -> RateLimiters {
        RateLimiters::new(100, Duration::from_secs(60), 10, Duration::from_secs(60))
    }

    fn batcher(oracle: Option<Arc<ScriptedOracle>>) -> (ClassificationBatcher, PipelineTracker) {
        let tracker = PipelineTracker::new();
        let oracle = oracle.map(|o| o as Arc<dyn ClassificationOracle>);
        (
            ClassificationBatcher::new(oracle, limiters(), config(), tracker.clone()),
            tracker,
        )
    }

    fn batch() -> Vec<MailRecord> {
        vec![
            record(1, "Re: Demo Request - I'm interested"),
            record(2, "Automatic reply: out of office"),
            record(3, "Quarterly numbers"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_oracle_success_keeps_order() {
        let oracle = Arc::new(ScriptedOracle::always(Category::Spam));
        let (batcher, tracker) = batcher(Some(oracle.clone()));

        let classified = batcher.classify(batch()).await;
        assert_eq!(classified.iter().map(|c| c.record.uid).collect_vec(), vec![1, 2, 3]);
        assert!(classified
            .iter()
            .all(|c| c.method == ClassificationMethod::Oracle && c.category == Category::Spam));
        assert_eq!(oracle.calls(), 1);
        assert_eq!(tracker.get_stats().classified_oracle, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_twice_falls_back_without_third_attempt() {
        let oracle = Arc::new(ScriptedOracle::scripted(vec![
            Err(OracleError::Malformed("garbage".into())),
            Err(OracleError::Malformed("garbage".into())),
            Ok(vec![]),
        ]));
        let (batcher, tracker) = batcher(Some(oracle.clone()));

        let classified = batcher.classify(batch()).await;
        assert_eq!(oracle.calls(), 2);
        assert_eq!(classified.len(), 3);
        assert!(classified
            .iter()
            .all(|c| c.method == ClassificationMethod::RuleFallback));
        assert_eq!(classified[0].category, Category::Interested);
        assert_eq!(classified[1].category, Category::OutOfOffice);
        assert_eq!(classified[2].category, Category::Uncategorized);
        assert_eq!(tracker.get_stats().oracle_attempts, 2);
        assert_eq!(tracker.get_stats().classified_fallback, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_then_success() {
        let oracle = Arc::new(ScriptedOracle::scripted(vec![Err(OracleError::RateLimited(
            "429".into(),
        ))]));
        oracle.then_always(Category::Interested);
        let (batcher, _) = batcher(Some(oracle.clone()));

        let started = tokio::time::Instant::now();
        let classified = batcher.classify(batch()).await;
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(oracle.calls(), 2);
        assert!(classified
            .iter()
            .all(|c| c.method == ClassificationMethod::Oracle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_abandons_oracle_at_once() {
        let oracle = Arc::new(ScriptedOracle::scripted(vec![Err(OracleError::Unsupported(
            "model decommissioned".into(),
        ))]));
        let (batcher, _) = batcher(Some(oracle.clone()));

        let classified = batcher.classify(batch()).await;
        assert_eq!(oracle.calls(), 1);
        assert!(classified
            .iter()
            .all(|c| c.method == ClassificationMethod::RuleFallback));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_label_list_is_impossible() {
        let oracle = Arc::new(ScriptedOracle::scripted(vec![Ok(vec![OracleLabel {
            category: Category::Spam,
            confidence: 0.9,
        }])]));
        let (batcher, _) = batcher(Some(oracle.clone()));

        let classified = batcher.classify(batch()).await;
        assert_eq!(oracle.calls(), 1);
        assert_eq!(classified.len(), 3);
        assert!(classified
            .iter()
            .all(|c| c.method == ClassificationMethod::RuleFallback));
    }

    #[tokio::test]
    async fn test_without_oracle_uses_rules() {
        let (batcher, _) = batcher(None);
        let classified = batcher.classify(batch()).await;
        assert_eq!(classified.len(), 3);
        assert_eq!(classified[0].method, ClassificationMethod::RuleFallback);
        assert!(batcher.classify(Vec::new()).await.is_empty());
    }
}
