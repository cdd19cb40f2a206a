//! Mail records flowing through the triage pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoEnumIterator};

pub const NO_SUBJECT: &str = "(No subject)";

/// Flags read alongside the headers. Only metadata, never the body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailFlags {
    pub seen: bool,
    pub flagged: bool,
}

/// Header projection of one mailbox message. Immutable once built by the fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailRecord {
    pub uid: u32,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub folder: String,
    pub account: String,
    #[serde(default)]
    pub flags: MailFlags,
}

/// Closed set of intent categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, Serialize, Deserialize)]
pub enum Category {
    Interested,
    #[serde(rename = "Meeting Booked")]
    MeetingBooked,
    #[serde(rename = "Not Interested")]
    NotInterested,
    Spam,
    #[serde(rename = "Out of Office")]
    OutOfOffice,
    Uncategorized,
}

impl Category {
    /// Category that triggers external notification.
    pub const ACTIONABLE: Category = Category::Interested;

    pub fn label(&self) -> &'static str {
        match self {
            Category::Interested => "Interested",
            Category::MeetingBooked => "Meeting Booked",
            Category::NotInterested => "Not Interested",
            Category::Spam => "Spam",
            Category::OutOfOffice => "Out of Office",
            Category::Uncategorized => "Uncategorized",
        }
    }

    /// Lenient label lookup: case, spacing, `_` and `-` are ignored.
    pub fn from_label(label: &str) -> Option<Category> {
        let wanted = squash(label);
        Category::iter().find(|c| squash(c.label()) == wanted)
    }

    /// Categories an oracle may assign (everything but `Uncategorized`).
    pub fn assignable() -> impl Iterator<Item = Category> {
        Category::iter().filter(|c| *c != Category::Uncategorized)
    }
}

fn squash(label: &str) -> String {
    label
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassificationMethod {
    #[serde(rename = "AI")]
    Oracle,
    #[serde(rename = "Rules")]
    RuleFallback,
}

impl std::fmt::Display for ClassificationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassificationMethod::Oracle => write!(f, "AI"),
            ClassificationMethod::RuleFallback => write!(f, "Rules"),
        }
    }
}

/// A `MailRecord` with the outcome of one classification attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedRecord {
    #[serde(flatten)]
    pub record: MailRecord,
    pub category: Category,
    pub method: ClassificationMethod,
    pub confidence: f32,
}

impl ClassifiedRecord {
    pub fn new(
        record: MailRecord,
        category: Category,
        method: ClassificationMethod,
        confidence: f32,
    ) -> Self {
        Self {
            record,
            category,
            method,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.category == Category::ACTIONABLE
    }
}

/// Free text scored by the rule classifier. Records fetched from the mailbox
/// have no body; the categorize endpoints may supply one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailText {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
}

impl From<&MailRecord> for EmailText {
    fn from(record: &MailRecord) -> Self {
        Self {
            subject: Some(record.subject.clone()),
            body: None,
            from: Some(record.from.clone()),
        }
    }
}
