//! Pipeline Tracker
//!
//! Lock-free counters shared by every pipeline component, plus the current
//! mailbox session phase.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;

use crate::model::mail_record::ClassificationMethod;

/// Orchestrator session state, as reported by `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Backfilling,
    Watching,
    Reconnecting,
    Stopped,
}

#[derive(Default)]
struct Counters {
    fetched: AtomicU64,
    indexed: AtomicU64,
    index_failures: AtomicU64,
    classified_oracle: AtomicU64,
    classified_fallback: AtomicU64,
    oracle_attempts: AtomicU64,
    batches_requeued: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_failed: AtomicU64,
    reconnects: AtomicU64,
}

struct Inner {
    counters: Counters,
    phase: RwLock<SessionPhase>,
    started_at: Instant,
}

#[derive(Clone)]
pub struct PipelineTracker {
    inner: Arc<Inner>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub phase: SessionPhase,
    pub uptime_secs: u64,
    pub fetched: u64,
    pub indexed: u64,
    pub index_failures: u64,
    pub classified_oracle: u64,
    pub classified_fallback: u64,
    pub oracle_attempts: u64,
    pub batches_requeued: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub reconnects: u64,
}

impl Default for PipelineTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: Counters::default(),
                phase: RwLock::new(SessionPhase::Disconnected),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        if let Ok(mut current) = self.inner.phase.write() {
            *current = phase;
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner
            .phase
            .read()
            .map(|p| *p)
            .unwrap_or(SessionPhase::Disconnected)
    }

    pub fn record_fetched(&self, count: usize) {
        self.inner.counters.fetched.fetch_add(count as u64, Relaxed);
    }

    pub fn record_indexed(&self) {
        self.inner.counters.indexed.fetch_add(1, Relaxed);
    }

    pub fn record_index_failures(&self, count: usize) {
        self.inner
            .counters
            .index_failures
            .fetch_add(count as u64, Relaxed);
    }

    pub fn record_classified(&self, method: ClassificationMethod, count: usize) {
        let counter = match method {
            ClassificationMethod::Oracle => &self.inner.counters.classified_oracle,
            ClassificationMethod::RuleFallback => &self.inner.counters.classified_fallback,
        };
        counter.fetch_add(count as u64, Relaxed);
    }

    pub fn record_oracle_attempt(&self) {
        self.inner.counters.oracle_attempts.fetch_add(1, Relaxed);
    }

    pub fn record_requeue(&self) {
        self.inner.counters.batches_requeued.fetch_add(1, Relaxed);
    }

    pub fn record_notification(&self, success: bool) {
        let counter = if success {
            &self.inner.counters.notifications_sent
        } else {
            &self.inner.counters.notifications_failed
        };
        counter.fetch_add(1, Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.inner.counters.reconnects.fetch_add(1, Relaxed);
    }

    pub fn get_stats(&self) -> PipelineStats {
        let c = &self.inner.counters;
        PipelineStats {
            phase: self.phase(),
            uptime_secs: self.inner.started_at.elapsed().as_secs(),
            fetched: c.fetched.load(Relaxed),
            indexed: c.indexed.load(Relaxed),
            index_failures: c.index_failures.load(Relaxed),
            classified_oracle: c.classified_oracle.load(Relaxed),
            classified_fallback: c.classified_fallback.load(Relaxed),
            oracle_attempts: c.oracle_attempts.load(Relaxed),
            batches_requeued: c.batches_requeued.load(Relaxed),
            notifications_sent: c.notifications_sent.load(Relaxed),
            notifications_failed: c.notifications_failed.load(Relaxed),
            reconnects: c.reconnects.load(Relaxed),
        }
    }

    /// Status table for periodic logging. `extra` rows are appended as-is.
    pub fn get_status_table(&self, extra: &[(&str, String)]) -> String {
        let stats = self.get_stats();
        let mut rows: Vec<Vec<String>> = vec![
            vec!["phase".into(), stats.phase.to_string()],
            vec!["uptime".into(), format_elapsed_secs(stats.uptime_secs)],
            vec!["fetched".into(), stats.fetched.to_string()],
            vec![
                "indexed".into(),
                format!("{} ({} failed)", stats.indexed, stats.index_failures),
            ],
            vec![
                "classified".into(),
                format!(
                    "{} oracle / {} rules",
                    stats.classified_oracle, stats.classified_fallback
                ),
            ],
            vec!["oracle attempts".into(), stats.oracle_attempts.to_string()],
            vec!["batches requeued".into(), stats.batches_requeued.to_string()],
            vec![
                "notifications".into(),
                format!(
                    "{} sent / {} failed",
                    stats.notifications_sent, stats.notifications_failed
                ),
            ],
            vec!["reconnects".into(), stats.reconnects.to_string()],
        ];
        rows.extend(
            extra
                .iter()
                .map(|(name, value)| vec![name.to_string(), value.clone()]),
        );
        format_table_with_title("Triage Pipeline", &["metric", "value"], &rows)
    }
}

// ============================================================================
// Table Formatting
// ============================================================================

fn format_elapsed_secs(secs: u64) -> String {
    match secs {
        s if s >= 3600 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        s if s >= 60 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}s", s),
    }
}

fn format_table_with_title(title: &str, headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    // Title wider than the columns: give the slack to the last column
    let columns_width = widths.iter().sum::<usize>() + widths.len().saturating_sub(1) * 3;
    let inner_width = columns_width.max(title.len());
    if let Some(last) = widths.last_mut() {
        *last += inner_width - columns_width;
    }

    let line = |cells: &[String]| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:width$}", cell, width = width))
            .collect();
        format!("| {} |\n", padded.join(" | "))
    };
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();

    let mut output = String::new();
    output.push_str(&format!(" {} \n", "=".repeat(inner_width + 2)));
    output.push_str(&format!("| {:<inner_width$} |\n", title));
    output.push_str(&line(&headers.iter().map(|h| h.to_string()).collect::<Vec<_>>()));
    output.push_str(&format!("|-{}-|\n", separator.join("-|-")));
    for row in rows {
        output.push_str(&line(row));
    }
    output.push_str(&format!(" {} \n", "-".repeat(inner_width + 2)));
    output
}
