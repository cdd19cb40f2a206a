//! Mail source capability consumed by the pipeline.
//!
//! A [`MailSource`] opens sessions; a [`MailSession`] is owned by exactly one
//! caller (the orchestrator) and is driven sequentially.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::auth::token::AccessToken;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("could not open folder {folder}: {reason}")]
    Folder { folder: String, reason: String },
    #[error("search failed: {0}")]
    Search(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("session error: {0}")]
    Session(String),
}

/// Selection criterion for a mailbox search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchCriteria {
    /// Messages whose internal date is on or after the given day.
    Since(NaiveDate),
    /// Messages with a UID strictly greater than the given one.
    UidAfter(u32),
}

/// Raw header block for one message as returned by the server.
#[derive(Debug, Clone, Default)]
pub struct RawHeaders {
    pub uid: Option<u32>,
    pub header: Vec<u8>,
    pub seen: bool,
    pub flagged: bool,
}

/// Result of opening a folder.
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderStatus {
    pub exists: u32,
    pub uid_validity: Option<u32>,
}

/// What the session observed while waiting for server pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// New messages arrived; carries the count the server reported.
    NewMail(u32),
    /// Keep-alive timeout, nothing happened.
    Idle,
    /// Server closed the session.
    Closed,
}

#[async_trait]
pub trait MailSource: Send + Sync {
    async fn connect(
        &self,
        user: &str,
        token: &AccessToken,
    ) -> Result<Box<dyn MailSession>, MailError>;
}

#[async_trait]
pub trait MailSession: Send {
    async fn open_folder(&mut self, name: &str, readonly: bool) -> Result<FolderStatus, MailError>;

    /// UIDs matching the criteria, ascending.
    async fn search(&mut self, criteria: SearchCriteria) -> Result<Vec<u32>, MailError>;

    /// Header fields {From, To, Subject, Date} and flags for the given UIDs.
    /// Fails as a whole; never returns a partial result.
    async fn fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<RawHeaders>, MailError>;

    /// Wait for the next server push. An `Err` ends the session.
    async fn next_event(&mut self) -> Result<SessionEvent, MailError>;

    async fn logout(&mut self) -> Result<(), MailError>;
}
