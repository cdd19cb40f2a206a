//! IMAP implementation of the mail source capability.

use std::sync::Arc;
use std::time::Duration;

use async_imap::{
    extensions::idle::IdleResponse,
    imap_proto::{MailboxDatum, Response, Status},
    types::Flag,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use itertools::Itertools;
use tokio::net::TcpStream;
use tokio_rustls::{
    client::TlsStream,
    rustls::{self, pki_types::ServerName},
    TlsConnector,
};

use super::client::{
    FolderStatus, MailError, MailSession, MailSource, RawHeaders, SearchCriteria, SessionEvent,
};
use crate::auth::token::AccessToken;

type ImapStream = TlsStream<TcpStream>;

const FETCH_CHUNK_SIZE: usize = 200;
const HEADER_QUERY: &str = "(UID FLAGS BODY.PEEK[HEADER.FIELDS (FROM TO SUBJECT DATE)])";

/// XOAUTH2 authenticator for IMAP
struct XOAuth2 {
    user: String,
    access_token: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// Implicit-TLS IMAP server.
pub struct ImapMailSource {
    host: String,
    port: u16,
    idle_timeout: Duration,
    connector: TlsConnector,
}

impl ImapMailSource {
    pub fn new(host: &str, port: u16, idle_timeout: Duration) -> Result<Self, MailError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| MailError::Connect(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            host: host.to_string(),
            port,
            idle_timeout,
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl MailSource for ImapMailSource {
    async fn connect(
        &self,
        user: &str,
        token: &AccessToken,
    ) -> Result<Box<dyn MailSession>, MailError> {
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| MailError::Connect(format!("invalid host {}: {e}", self.host)))?;
        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| MailError::Connect(e.to_string()))?;
        let tls = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| MailError::Connect(format!("tls handshake: {e}")))?;

        let mut client = async_imap::Client::new(tls);
        let _greeting = client.read_response().await;

        let auth = XOAuth2 {
            user: user.to_string(),
            access_token: token.secret().to_string(),
        };
        let session = client
            .authenticate("XOAUTH2", auth)
            .await
            .map_err(|(e, _client)| MailError::Auth(e.to_string()))?;

        tracing::info!(host = %self.host, user, "IMAP session authenticated");
        Ok(Box::new(ImapSession {
            session: Some(session),
            idle_timeout: self.idle_timeout,
            exists: 0,
        }))
    }
}

pub struct ImapSession {
    /// Taken while an IDLE is in flight; `None` afterwards means the
    /// connection was lost mid-IDLE.
    session: Option<async_imap::Session<ImapStream>>,
    idle_timeout: Duration,
    exists: u32,
}

impl ImapSession {
    fn session(&mut self) -> Result<&mut async_imap::Session<ImapStream>, MailError> {
        self.session
            .as_mut()
            .ok_or_else(|| MailError::Session("session is closed".to_string()))
    }
}

#[async_trait]
impl MailSession for ImapSession {
    async fn open_folder(&mut self, name: &str, readonly: bool) -> Result<FolderStatus, MailError> {
        let session = self.session()?;
        let mailbox = if readonly {
            session.examine(name).await
        } else {
            session.select(name).await
        }
        .map_err(|e| MailError::Folder {
            folder: name.to_string(),
            reason: e.to_string(),
        })?;

        self.exists = mailbox.exists;
        Ok(FolderStatus {
            exists: mailbox.exists,
            uid_validity: mailbox.uid_validity,
        })
    }

    async fn search(&mut self, criteria: SearchCriteria) -> Result<Vec<u32>, MailError> {
        let query = search_query(criteria);
        let uids = self
            .session()?
            .uid_search(&query)
            .await
            .map_err(|e| MailError::Search(e.to_string()))?;
        Ok(uids.into_iter().sorted().collect())
    }

    async fn fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<RawHeaders>, MailError> {
        let session = self.session()?;
        let mut out = Vec::with_capacity(uids.len());

        for chunk in uids.chunks(FETCH_CHUNK_SIZE) {
            let set = uid_set(chunk);
            let fetches: Vec<_> = session
                .uid_fetch(&set, HEADER_QUERY)
                .await
                .map_err(|e| MailError::Fetch(e.to_string()))?
                .try_collect()
                .await
                .map_err(|e| MailError::Fetch(e.to_string()))?;

            out.extend(fetches.iter().map(|fetch| {
                let mut raw = RawHeaders {
                    uid: fetch.uid,
                    header: fetch
                        .header()
                        .or_else(|| fetch.body())
                        .unwrap_or_default()
                        .to_vec(),
                    ..Default::default()
                };
                for flag in fetch.flags() {
                    match flag {
                        Flag::Seen => raw.seen = true,
                        Flag::Flagged => raw.flagged = true,
                        _ => {}
                    }
                }
                raw
            }));
        }

        Ok(out)
    }

    async fn next_event(&mut self) -> Result<SessionEvent, MailError> {
        let session = self
            .session
            .take()
            .ok_or_else(|| MailError::Session("session is closed".to_string()))?;

        let mut idle = session.idle();
        idle.init()
            .await
            .map_err(|e| MailError::Session(format!("IDLE init: {e}")))?;

        let response = {
            let (wait, _interrupt) = idle.wait_with_timeout(self.idle_timeout);
            wait.await
                .map_err(|e| MailError::Session(format!("IDLE wait: {e}")))?
        };

        let event = match response {
            IdleResponse::NewData(data) => match data.parsed() {
                Response::MailboxData(MailboxDatum::Exists(count)) => {
                    let count = *count;
                    let previous = std::mem::replace(&mut self.exists, count);
                    if count > previous {
                        SessionEvent::NewMail(count - previous)
                    } else {
                        SessionEvent::Idle
                    }
                }
                Response::Expunge(_) => {
                    self.exists = self.exists.saturating_sub(1);
                    SessionEvent::Idle
                }
                Response::Data {
                    status: Status::Bye,
                    ..
                } => SessionEvent::Closed,
                _ => SessionEvent::Idle,
            },
            IdleResponse::Timeout | IdleResponse::ManualInterrupt => SessionEvent::Idle,
        };

        if event == SessionEvent::Closed {
            return Ok(event);
        }

        let session = idle
            .done()
            .await
            .map_err(|e| MailError::Session(format!("IDLE done: {e}")))?;
        self.session = Some(session);
        Ok(event)
    }

    async fn logout(&mut self) -> Result<(), MailError> {
        if let Some(mut session) = self.session.take() {
            session
                .logout()
                .await
                .map_err(|e| MailError::Session(e.to_string()))?;
        }
        Ok(())
    }
}

fn search_query(criteria: SearchCriteria) -> String {
    match criteria {
        SearchCriteria::Since(day) => format!("SINCE {}", day.format("%d-%b-%Y")),
        SearchCriteria::UidAfter(uid) => format!("UID {}:*", uid.saturating_add(1)),
    }
}

/// Compress UIDs into an IMAP sequence set, e.g. `1:3,7,9:10`.
pub fn uid_set(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for uid in sorted {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == uid => *end = uid,
            _ => ranges.push((uid, uid)),
        }
    }

    ranges
        .into_iter()
        .map(|(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}:{end}")
            }
        })
        .join(",")
}
