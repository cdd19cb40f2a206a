//! Pipeline Orchestrator
//!
//! Owns the mailbox session and drives it through
//! `Disconnected -> Connecting -> Backfilling -> Watching -> {Watching | Reconnecting}`.
//! Every fetched record is indexed unclassified, advances the watermark and is
//! queued for the drain worker.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use tokio_util::sync::CancellationToken;

use super::{
    drain::DrainScheduler,
    feed::{FeedEvent, MailFeed},
    sync_state::SyncState,
};
use crate::{
    auth::token::AccessTokenProvider,
    email::{
        client::{MailSession, MailSource, SessionEvent},
        fetcher::{self, FetchCriteria, SessionContext},
    },
    index::{DocumentStore, EmailDocument},
    model::mail_record::MailRecord,
    observability::{PipelineTracker, SessionPhase},
    server_config::ServerConfig,
};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub user: String,
    pub account: String,
    pub folder: String,
    pub lookback_days: i64,
    pub auth_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl From<&ServerConfig> for OrchestratorConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            user: config.secrets.mail_user.clone(),
            account: config.account().to_string(),
            folder: config.mailbox.folder.clone(),
            lookback_days: config.mailbox.lookback_days,
            auth_timeout: config.mailbox.auth_timeout(),
            reconnect_delay: config.mailbox.reconnect_delay(),
        }
    }
}

pub struct Orchestrator {
    pub source: Arc<dyn MailSource>,
    pub tokens: Arc<dyn AccessTokenProvider>,
    pub store: Arc<dyn DocumentStore>,
    pub sync_state: Arc<SyncState>,
    pub drain: DrainScheduler,
    pub feed: MailFeed,
    pub tracker: PipelineTracker,
    pub config: OrchestratorConfig,
}

impl Orchestrator {
    /// Runs until `cancel` fires. Session faults are logged and followed by
    /// a reconnect after `reconnect_delay`; the watermark survives reconnects.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            folder = %self.config.folder,
            account = %self.config.account,
            "Starting mailbox orchestrator"
        );

        loop {
            self.tracker.set_phase(SessionPhase::Connecting);
            let result = tokio::select! {
                result = self.run_session() => result,
                _ = cancel.cancelled() => break,
            };

            match result {
                Ok(()) => tracing::warn!("Mailbox session ended"),
                Err(e) => tracing::error!("Mailbox session failed: {:?}", e),
            }

            self.tracker.set_phase(SessionPhase::Reconnecting);
            tracing::info!("Reconnecting in {:?}", self.config.reconnect_delay);
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = cancel.cancelled() => break,
            }
            self.tracker.record_reconnect();
        }

        self.tracker.set_phase(SessionPhase::Stopped);
        tracing::info!("Mailbox orchestrator stopped");
    }

    async fn run_session(&self) -> anyhow::Result<()> {
        let mut session = self.connect().await?;
        let result = self.drive(session.as_mut()).await;
        if let Err(e) = session.logout().await {
            tracing::debug!("Logout failed: {}", e);
        }
        result
    }

    async fn connect(&self) -> anyhow::Result<Box<dyn MailSession>> {
        let token = self
            .tokens
            .get_access_token()
            .await
            .context("Could not get mailbox access token")?;

        let session = tokio::time::timeout(
            self.config.auth_timeout,
            self.source.connect(&self.config.user, &token),
        )
        .await
        .map_err(|_| anyhow!("Authentication timed out after {:?}", self.config.auth_timeout))?
        .context("Could not connect to mailbox")?;

        tracing::info!(user = %self.config.user, "Mailbox session authenticated");
        Ok(session)
    }

    async fn drive(&self, session: &mut dyn MailSession) -> anyhow::Result<()> {
        let status = session
            .open_folder(&self.config.folder, true)
            .await
            .context("Could not open folder")?;
        tracing::info!(
            folder = %self.config.folder,
            exists = status.exists,
            "Folder opened read-only"
        );

        let ctx = SessionContext {
            folder: self.config.folder.clone(),
            account: self.config.account.clone(),
        };

        self.tracker.set_phase(SessionPhase::Backfilling);
        let backfill = FetchCriteria::Backfill {
            since_days: self.config.lookback_days,
        };
        let records = fetcher::fetch(session, backfill, &ctx)
            .await
            .context("Backfill fetch failed")?;
        let fetched = records.len();
        let admitted: Vec<MailRecord> = records
            .into_iter()
            .filter(|record| self.sync_state.needs_processing(record.uid))
            .collect();
        tracing::info!(
            fetched,
            admitted = admitted.len(),
            "Backfill complete"
        );
        self.ingest(admitted).await;

        self.tracker.set_phase(SessionPhase::Watching);
        loop {
            match session.next_event().await.context("Mailbox session error")? {
                SessionEvent::NewMail(count) => {
                    let criteria = match self.sync_state.last_seen_uid() {
                        0 => backfill,
                        uid_floor => FetchCriteria::Incremental { uid_floor },
                    };
                    tracing::info!(count, ?criteria, "New mail");
                    let records = fetcher::fetch(session, criteria, &ctx)
                        .await
                        .context("Incremental fetch failed")?;
                    self.ingest(records).await;
                }
                SessionEvent::Idle => continue,
                SessionEvent::Closed => return Ok(()),
            }
        }
    }

    /// Index, advance, enqueue. Triggers the drain worker once for the whole
    /// fetch. Returns the number of records queued.
    pub async fn ingest(&self, mut records: Vec<MailRecord>) -> usize {
        if records.is_empty() {
            return 0;
        }
        records.sort_by_key(|record| record.uid);
        self.tracker.record_fetched(records.len());

        let mut queued = 0;
        for record in records {
            let uid = record.uid;
            if let Err(e) = self.store.upsert(&EmailDocument::from(&record)).await {
                tracing::warn!(uid, "Could not index record: {}", e);
                self.tracker.record_index_failures(1);
                self.sync_state.mark_index_failed(uid);
                continue;
            }

            self.tracker.record_indexed();
            self.sync_state.advance_watermark(uid);
            self.sync_state.clear_index_failure(uid);
            self.feed.publish(FeedEvent::Indexed(record.clone()));
            if self.sync_state.enqueue(record) {
                queued += 1;
            }
        }

        if queued > 0 {
            tracing::debug!(queued, watermark = self.sync_state.last_seen_uid(), "Records queued");
            self.drain.trigger();
        }
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::StaticTokenProvider;
    use crate::index::memory::MemoryStore;
    use crate::model::mail_record::Category;
    use crate::notify::NotificationDispatcher;
    use crate::prompt::ClassificationOracle;
    use crate::rate_limiters::RateLimiters;
    use crate::state::batcher::{BatcherConfig, ClassificationBatcher};
    use crate::state::drain::DrainWorker;
    use crate::testing::common::{
        raw_headers, wait_until, FailingStore, ScriptStep, ScriptedOracle, ScriptedSession,
        ScriptedSource,
    };
    use crate::email::client::MailError;

    struct Harness {
        orchestrator: Orchestrator,
        sync_state: Arc<SyncState>,
        tracker: PipelineTracker,
        drain: DrainScheduler,
    }

    fn harness(source: ScriptedSource, store: Arc<dyn DocumentStore>) -> Harness {
        let sync_state = Arc::new(SyncState::new());
        let tracker = PipelineTracker::new();
        let feed = MailFeed::new();
        let batcher = ClassificationBatcher::new(
            Some(Arc::new(ScriptedOracle::always(Category::Spam)) as Arc<dyn ClassificationOracle>),
            RateLimiters::new(100, Duration::from_secs(60), 10, Duration::from_secs(60)),
            BatcherConfig {
                max_attempts: 2,
                rate_limit_backoff: Duration::from_secs(3),
                error_retry_delay: Duration::from_secs(2),
            },
            tracker.clone(),
        );
        let drain = DrainScheduler::new(
            DrainWorker {
                sync_state: sync_state.clone(),
                batcher,
                store: store.clone(),
                dispatcher: NotificationDispatcher::new(
                    Vec::new(),
                    Duration::from_millis(500),
                    tracker.clone(),
                ),
                feed: feed.clone(),
                tracker: tracker.clone(),
                batch_size: 5,
                requeue_delay: Duration::from_secs(5),
            },
            CancellationToken::new(),
        );
        let orchestrator = Orchestrator {
            source: Arc::new(source),
            tokens: Arc::new(StaticTokenProvider::new("token")),
            store,
            sync_state: sync_state.clone(),
            drain: drain.clone(),
            feed,
            tracker: tracker.clone(),
            config: OrchestratorConfig {
                user: "me@example.com".to_string(),
                account: "me@example.com".to_string(),
                folder: "INBOX".to_string(),
                lookback_days: 30,
                auth_timeout: Duration::from_secs(30),
                reconnect_delay: Duration::from_secs(5),
            },
        };
        Harness {
            orchestrator,
            sync_state,
            tracker,
            drain,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backfill_then_new_mail() {
        let session = ScriptedSession::with_messages(vec![
            raw_headers(1, "Welcome"),
            raw_headers(2, "Invoice"),
        ])
        .with_script(vec![
            ScriptStep::Event(SessionEvent::Idle),
            ScriptStep::Arrive(vec![raw_headers(3, "Pricing"), raw_headers(4, "Demo")]),
        ]);
        let store = Arc::new(MemoryStore::new());
        let h = harness(ScriptedSource::new(vec![session]), store.clone());
        let cancel = CancellationToken::new();
        let tracker = h.tracker.clone();
        let task = tokio::spawn(h.orchestrator.run(cancel.clone()));

        wait_until(|| h.sync_state.last_seen_uid() == 4).await;
        h.drain.wait_idle().await;
        wait_until(|| tracker.get_stats().classified_oracle == 4).await;

        assert_eq!(tracker.phase(), SessionPhase::Watching);
        assert_eq!(store.len().await, 4);
        assert_eq!(
            store.get(3).await.unwrap().ai_category,
            Some(Category::Spam)
        );
        assert_eq!(tracker.get_stats().fetched, 4);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(tracker.phase(), SessionPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_watermark_and_skips_processed() {
        let first = ScriptedSession::with_messages(vec![raw_headers(1, "a"), raw_headers(2, "b")])
            .with_script(vec![ScriptStep::Fail(MailError::Session("connection reset".into()))]);
        let second = ScriptedSession::with_messages(vec![
            raw_headers(1, "a"),
            raw_headers(2, "b"),
            raw_headers(3, "c"),
        ]);
        let store = Arc::new(MemoryStore::new());
        let h = harness(ScriptedSource::new(vec![first, second]), store.clone());
        let cancel = CancellationToken::new();
        let tracker = h.tracker.clone();
        let task = tokio::spawn(h.orchestrator.run(cancel.clone()));

        wait_until(|| h.sync_state.last_seen_uid() == 3).await;

        let stats = tracker.get_stats();
        assert_eq!(stats.reconnects, 1);
        // Second backfill only admits uid 3
        assert_eq!(stats.indexed, 3);
        assert_eq!(store.len().await, 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_failure_is_retried_on_next_backfill() {
        let store = Arc::new(FailingStore::failing_upserts(vec![2]));
        let first = ScriptedSession::with_messages(vec![
            raw_headers(1, "a"),
            raw_headers(2, "b"),
            raw_headers(3, "c"),
        ])
        .with_script(vec![ScriptStep::Event(SessionEvent::Closed)]);
        let second = ScriptedSession::with_messages(vec![
            raw_headers(1, "a"),
            raw_headers(2, "b"),
            raw_headers(3, "c"),
        ]);
        let h = harness(ScriptedSource::new(vec![first, second]), store.clone());

        // First session: uid 2 fails, the others advance the watermark
        let records = vec![
            crate::testing::common::record(1, "a"),
            crate::testing::common::record(2, "b"),
            crate::testing::common::record(3, "c"),
        ];
        assert_eq!(h.orchestrator.ingest(records).await, 2);
        assert_eq!(h.sync_state.last_seen_uid(), 3);
        assert_eq!(h.sync_state.index_retry_len(), 1);
        assert!(store.inner.get(2).await.is_none());

        store.heal();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.orchestrator.run(cancel.clone()));
        wait_until(|| h.sync_state.index_retry_len() == 0).await;
        assert!(store.inner.get(2).await.is_some());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_backfill_queues_nothing() {
        let store = Arc::new(MemoryStore::new());
        let h = harness(
            ScriptedSource::new(vec![ScriptedSession::with_messages(vec![])]),
            store.clone(),
        );
        let cancel = CancellationToken::new();
        let tracker = h.tracker.clone();
        let task = tokio::spawn(h.orchestrator.run(cancel.clone()));

        wait_until(|| tracker.phase() == SessionPhase::Watching).await;
        assert_eq!(h.sync_state.queue_len(), 0);
        assert_eq!(store.len().await, 0);
        assert_eq!(h.drain.phase(), super::super::drain::DrainPhase::Idle);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout_leads_to_reconnect() {
        let source = ScriptedSource::new(vec![ScriptedSession::with_messages(vec![])])
            .with_connect_delay(Duration::from_secs(60));
        let h = harness(source, Arc::new(MemoryStore::new()));
        let cancel = CancellationToken::new();
        let tracker = h.tracker.clone();
        let task = tokio::spawn(h.orchestrator.run(cancel.clone()));

        wait_until(|| tracker.get_stats().reconnects >= 1).await;
        assert_ne!(tracker.phase(), SessionPhase::Watching);

        cancel.cancel();
        task.await.unwrap();
    }
}
