//! Header fetcher: turns a search criterion into normalized `MailRecord`s.

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use mail_parser::{Address, MessageParser};

use super::client::{MailError, MailSession, RawHeaders, SearchCriteria};
use crate::model::mail_record::{MailFlags, MailRecord, NO_SUBJECT};

/// Backfill and incremental selection are mutually exclusive per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCriteria {
    /// All messages dated on or after now - `since_days`.
    Backfill { since_days: i64 },
    /// Messages whose UID is strictly greater than `uid_floor`.
    Incremental { uid_floor: u32 },
}

/// Session context stamped on every record.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub folder: String,
    pub account: String,
}

impl FetchCriteria {
    fn search_criteria(&self, now: DateTime<Utc>) -> SearchCriteria {
        match *self {
            FetchCriteria::Backfill { since_days } => {
                SearchCriteria::Since((now - Duration::days(since_days)).date_naive())
            }
            FetchCriteria::Incremental { uid_floor } => SearchCriteria::UidAfter(uid_floor),
        }
    }

    fn admits(&self, uid: u32) -> bool {
        match *self {
            FetchCriteria::Backfill { .. } => true,
            // `UID n+1:*` also matches the newest message when its uid is <= n
            FetchCriteria::Incremental { uid_floor } => uid > uid_floor,
        }
    }
}

/// Run one fresh search + header fetch. Either every matching record is
/// returned or the call fails; records come back in server order.
pub async fn fetch(
    session: &mut dyn MailSession,
    criteria: FetchCriteria,
    ctx: &SessionContext,
) -> Result<Vec<MailRecord>, MailError> {
    let uids = session
        .search(criteria.search_criteria(Utc::now()))
        .await?
        .into_iter()
        .filter(|uid| criteria.admits(*uid))
        .collect_vec();

    if uids.is_empty() {
        tracing::debug!(?criteria, "No messages matched");
        return Ok(Vec::new());
    }

    let raw = session.fetch_headers(&uids).await?;
    let fetched_at = Utc::now();

    let records = raw
        .into_iter()
        .filter_map(|raw| normalize(raw, ctx, fetched_at))
        .filter(|record| criteria.admits(record.uid))
        .collect_vec();

    tracing::debug!(?criteria, matched = uids.len(), fetched = records.len(), "Fetched headers");
    Ok(records)
}

/// Build a record from a raw header block; items without a UID are dropped.
pub fn normalize(
    raw: RawHeaders,
    ctx: &SessionContext,
    fetched_at: DateTime<Utc>,
) -> Option<MailRecord> {
    let Some(uid) = raw.uid else {
        tracing::warn!("Dropping fetched item without a UID");
        return None;
    };

    let parsed = MessageParser::default().parse(raw.header.as_slice());
    let (from, to, subject, date) = match parsed.as_ref() {
        Some(msg) => (
            msg.from().map(render_address).unwrap_or_default(),
            msg.to().map(render_address).unwrap_or_default(),
            msg.subject()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            msg.date()
                .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0)),
        ),
        None => (String::new(), String::new(), None, None),
    };

    Some(MailRecord {
        uid,
        from,
        to,
        subject: subject.unwrap_or_else(|| NO_SUBJECT.to_string()),
        date: date.unwrap_or(fetched_at),
        folder: ctx.folder.clone(),
        account: ctx.account.clone(),
        flags: MailFlags {
            seen: raw.seen,
            flagged: raw.flagged,
        },
    })
}

/// `Name <address>` or the bare address, recipients joined with `, `.
fn render_address(address: &Address) -> String {
    address
        .iter()
        .filter_map(|addr| match (addr.name(), addr.address()) {
            (Some(name), Some(email)) if !name.trim().is_empty() => {
                Some(format!("{} <{}>", name.trim(), email))
            }
            (_, Some(email)) => Some(email.to_string()),
            (Some(name), None) => Some(name.trim().to_string()),
            (None, None) => None,
        })
        .join(", ")
}
