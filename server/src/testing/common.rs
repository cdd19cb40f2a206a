//! Fakes and builders shared by unit tests.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::token::AccessToken,
    email::client::{
        FolderStatus, MailError, MailSession, MailSource, RawHeaders, SearchCriteria, SessionEvent,
    },
    index::{
        memory::MemoryStore, BulkReport, DocumentStore, EmailDocument, SearchFilter, SearchResult,
        StoreError, StoreStats,
    },
    model::mail_record::{
        Category, ClassificationMethod, ClassifiedRecord, MailFlags, MailRecord,
    },
    notify::{NotificationChannel, NotificationDispatcher, NotifyError},
    observability::PipelineTracker,
    prompt::{ClassificationOracle, OracleError, OracleLabel},
    rate_limiters::RateLimiters,
    state::{
        batcher::{BatcherConfig, ClassificationBatcher},
        drain::{DrainScheduler, DrainWorker},
        feed::MailFeed,
        sync_state::SyncState,
    },
    HttpClient, ServerState,
};

// ============================================================================
// Builders
// ============================================================================

pub fn record(uid: u32, subject: &str) -> MailRecord {
    MailRecord {
        uid,
        from: format!("sender{uid}@example.com"),
        to: "me@example.com".to_string(),
        subject: subject.to_string(),
        date: Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap() + chrono::Duration::minutes(uid as i64),
        folder: "INBOX".to_string(),
        account: "me@example.com".to_string(),
        flags: MailFlags::default(),
    }
}

pub fn classified(uid: u32, category: Category, method: ClassificationMethod) -> ClassifiedRecord {
    ClassifiedRecord::new(record(uid, "Re: your product"), category, method, 0.9)
}

pub fn raw_headers(uid: u32, subject: &str) -> RawHeaders {
    RawHeaders {
        uid: Some(uid),
        header: format!(
            "From: sender{uid}@example.com\r\n\
             To: me@example.com\r\n\
             Subject: {subject}\r\n\
             Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\r\n"
        )
        .into_bytes(),
        seen: false,
        flagged: false,
    }
}

/// Poll `condition` every 50ms (virtual time under `start_paused`).
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

pub fn test_state() -> (ServerState, Arc<MemoryStore>) {
    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn DocumentStore> = memory.clone();
    let sync_state = Arc::new(SyncState::new());
    let tracker = PipelineTracker::new();
    let feed = MailFeed::new();
    let rate_limiters = RateLimiters::new(100, Duration::from_secs(60), 10, Duration::from_secs(60));
    let dispatcher = NotificationDispatcher::new(Vec::new(), Duration::from_millis(500), tracker.clone());
    let drain = DrainScheduler::new(
        DrainWorker {
            sync_state: sync_state.clone(),
            batcher: ClassificationBatcher::new(
                None,
                rate_limiters.clone(),
                BatcherConfig {
                    max_attempts: 2,
                    rate_limit_backoff: Duration::from_secs(3),
                    error_retry_delay: Duration::from_secs(2),
                },
                tracker.clone(),
            ),
            store: store.clone(),
            dispatcher: dispatcher.clone(),
            feed: feed.clone(),
            tracker: tracker.clone(),
            batch_size: 5,
            requeue_delay: Duration::from_secs(5),
        },
        CancellationToken::new(),
    );

    let state = ServerState {
        http_client: HttpClient::new(),
        store,
        sync_state,
        drain,
        feed,
        tracker,
        rate_limiters,
        dispatcher,
    };
    (state, memory)
}

// ============================================================================
// Mail source
// ============================================================================

pub enum ScriptStep {
    Event(SessionEvent),
    /// Messages land in the folder and a `NewMail` event is reported.
    Arrive(Vec<RawHeaders>),
    Fail(MailError),
}

/// In-memory folder driven by a fixed script of session events. Once the
/// script runs out the session waits forever.
#[derive(Default)]
pub struct ScriptedSession {
    messages: BTreeMap<u32, RawHeaders>,
    script: VecDeque<ScriptStep>,
    pub search_override: Option<Vec<u32>>,
    pub fetch_calls: usize,
    pub fail_fetch: bool,
}

impl ScriptedSession {
    pub fn with_messages(messages: Vec<RawHeaders>) -> Self {
        let mut session = Self::default();
        session.add(messages);
        session
    }

    pub fn with_script(mut self, script: Vec<ScriptStep>) -> Self {
        self.script = script.into();
        self
    }

    fn add(&mut self, messages: Vec<RawHeaders>) {
        for message in messages {
            if let Some(uid) = message.uid {
                self.messages.insert(uid, message);
            }
        }
    }
}

#[async_trait]
impl MailSession for ScriptedSession {
    async fn open_folder(&mut self, _name: &str, _readonly: bool) -> Result<FolderStatus, MailError> {
        Ok(FolderStatus {
            exists: self.messages.len() as u32,
            uid_validity: Some(1),
        })
    }

    async fn search(&mut self, criteria: SearchCriteria) -> Result<Vec<u32>, MailError> {
        if let Some(uids) = &self.search_override {
            return Ok(uids.clone());
        }
        let all: Vec<u32> = self.messages.keys().copied().collect();
        Ok(match criteria {
            SearchCriteria::Since(_) => all,
            SearchCriteria::UidAfter(floor) => {
                let after: Vec<u32> = all.iter().copied().filter(|uid| *uid > floor).collect();
                // `UID n:*` always matches the newest message
                match (after.is_empty(), all.last()) {
                    (true, Some(last)) => vec![*last],
                    _ => after,
                }
            }
        })
    }

    async fn fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<RawHeaders>, MailError> {
        self.fetch_calls += 1;
        if self.fail_fetch {
            return Err(MailError::Fetch("scripted failure".to_string()));
        }
        Ok(uids
            .iter()
            .filter_map(|uid| self.messages.get(uid).cloned())
            .collect())
    }

    async fn next_event(&mut self) -> Result<SessionEvent, MailError> {
        match self.script.pop_front() {
            Some(ScriptStep::Event(event)) => Ok(event),
            Some(ScriptStep::Arrive(messages)) => {
                let count = messages.len() as u32;
                self.add(messages);
                Ok(SessionEvent::NewMail(count))
            }
            Some(ScriptStep::Fail(error)) => Err(error),
            None => std::future::pending().await,
        }
    }

    async fn logout(&mut self) -> Result<(), MailError> {
        Ok(())
    }
}

/// Hands out the scripted sessions in order, then refuses to connect.
pub struct ScriptedSource {
    sessions: Mutex<VecDeque<ScriptedSession>>,
    connect_delay: Option<Duration>,
    pub connects: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(sessions: Vec<ScriptedSession>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            connect_delay: None,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }
}

#[async_trait]
impl MailSource for ScriptedSource {
    async fn connect(
        &self,
        _user: &str,
        _token: &AccessToken,
    ) -> Result<Box<dyn MailSession>, MailError> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.sessions.lock().unwrap().pop_front();
        match next {
            Some(session) => Ok(Box::new(session)),
            None => Err(MailError::Connect("no scripted session left".to_string())),
        }
    }
}

// ============================================================================
// Oracle
// ============================================================================

/// Replays scripted answers, then labels every record with the fallback
/// category (or fails if none is set).
#[derive(Default)]
pub struct ScriptedOracle {
    script: Mutex<VecDeque<Result<Vec<OracleLabel>, OracleError>>>,
    otherwise: Mutex<Option<Category>>,
    batches: Mutex<Vec<usize>>,
    panic_next: AtomicBool,
}

impl ScriptedOracle {
    pub fn always(category: Category) -> Self {
        let oracle = Self::default();
        oracle.then_always(category);
        oracle
    }

    /// Panics on the first call, then labels everything `category`.
    pub fn panicking_once(category: Category) -> Self {
        let oracle = Self::always(category);
        oracle.panic_next.store(true, Ordering::SeqCst);
        oracle
    }

    pub fn scripted(script: Vec<Result<Vec<OracleLabel>, OracleError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn then_always(&self, category: Category) {
        *self.otherwise.lock().unwrap() = Some(category);
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClassificationOracle for ScriptedOracle {
    async fn classify(&self, batch: &[MailRecord]) -> Result<Vec<OracleLabel>, OracleError> {
        self.batches.lock().unwrap().push(batch.len());
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("oracle crashed");
        }
        if let Some(answer) = self.script.lock().unwrap().pop_front() {
            return answer;
        }
        match *self.otherwise.lock().unwrap() {
            Some(category) => Ok(batch
                .iter()
                .map(|_| OracleLabel {
                    category,
                    confidence: 0.9,
                })
                .collect()),
            None => Err(OracleError::Transport("script exhausted".to_string())),
        }
    }
}

// ============================================================================
// Notification channels
// ============================================================================

pub struct RecordingChannel {
    name: String,
    fail: bool,
    sent: Mutex<Vec<u32>>,
}

impl RecordingChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail: false,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn sent_uids(&self) -> Vec<u32> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, record: &ClassifiedRecord) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Status {
                channel: self.name.clone(),
                status: 500,
            });
        }
        self.sent.lock().unwrap().push(record.record.uid);
        Ok(())
    }
}

// ============================================================================
// Document store
// ============================================================================

/// Wraps a `MemoryStore`, failing selected writes until healed.
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    bulk_failures: AtomicUsize,
    reject_bulk: AtomicBool,
    failing_uids: Mutex<HashSet<u32>>,
}

impl FailingStore {
    /// The next `count` bulk requests fail as a whole.
    pub fn failing_bulk(count: usize) -> Self {
        Self {
            bulk_failures: AtomicUsize::new(count),
            ..Default::default()
        }
    }

    /// Every bulk request is refused by the store.
    pub fn rejecting_bulk() -> Self {
        Self {
            reject_bulk: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn failing_upserts(uids: Vec<u32>) -> Self {
        Self {
            failing_uids: Mutex::new(uids.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn heal(&self) {
        self.bulk_failures.store(0, Ordering::SeqCst);
        self.reject_bulk.store(false, Ordering::SeqCst);
        self.failing_uids.lock().unwrap().clear();
    }
}

#[async_trait]
impl DocumentStore for FailingStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.inner.ensure_schema().await
    }

    async fn upsert(&self, doc: &EmailDocument) -> Result<(), StoreError> {
        if self.failing_uids.lock().unwrap().contains(&doc.uid) {
            return Err(StoreError::Document {
                uid: doc.uid,
                reason: "scripted failure".to_string(),
            });
        }
        self.inner.upsert(doc).await
    }

    async fn bulk_upsert(
        &self,
        docs: &[EmailDocument],
        partial: bool,
    ) -> Result<BulkReport, StoreError> {
        if self.reject_bulk.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected {
                status: 401,
                body: "security_exception".to_string(),
            });
        }
        let remaining = self.bulk_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.bulk_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unreachable("scripted outage".to_string()));
        }
        self.inner.bulk_upsert(docs, partial).await
    }

    async fn search(&self, filter: &SearchFilter) -> Result<SearchResult, StoreError> {
        self.inner.search(filter).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.inner.stats().await
    }
}
