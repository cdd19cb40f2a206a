//! Sync watermark and pending classification queue.
//!
//! One instance per mailbox, shared by the orchestrator (producer) and the
//! drain worker (consumer). Every operation takes the lock once, so
//! operations are atomic with respect to each other.

use std::{
    collections::{BTreeSet, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use crate::model::mail_record::MailRecord;

#[derive(Default)]
struct PendingQueue {
    records: VecDeque<MailRecord>,
    uids: HashSet<u32>,
}

#[derive(Default)]
pub struct SyncState {
    last_seen_uid: AtomicU32,
    pending: Mutex<PendingQueue>,
    /// UIDs whose unclassified write failed; re-admitted by the next backfill.
    index_retry: Mutex<BTreeSet<u32>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Watermark
    // ========================================================================

    pub fn last_seen_uid(&self) -> u32 {
        self.last_seen_uid.load(Ordering::SeqCst)
    }

    /// Raise the watermark to `uid` if higher. Returns the resulting watermark.
    pub fn advance_watermark(&self, uid: u32) -> u32 {
        let previous = self.last_seen_uid.fetch_max(uid, Ordering::SeqCst);
        previous.max(uid)
    }

    // ========================================================================
    // Pending queue
    // ========================================================================

    /// Append to the tail. A record already waiting in the queue is not added twice.
    pub fn enqueue(&self, record: MailRecord) -> bool {
        let mut queue = lock(&self.pending);
        if !queue.uids.insert(record.uid) {
            return false;
        }
        queue.records.push_back(record);
        true
    }

    /// Remove up to `batch_size` records from the head.
    pub fn drain(&self, batch_size: usize) -> Vec<MailRecord> {
        let mut queue = lock(&self.pending);
        let take = batch_size.min(queue.records.len());
        let batch: Vec<MailRecord> = queue.records.drain(..take).collect();
        for record in &batch {
            queue.uids.remove(&record.uid);
        }
        batch
    }

    /// Put a failed batch back at the head, keeping its relative order.
    pub fn requeue_front(&self, records: Vec<MailRecord>) {
        let mut queue = lock(&self.pending);
        for record in records.into_iter().rev() {
            if queue.uids.insert(record.uid) {
                queue.records.push_front(record);
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.pending).records.len()
    }

    // ========================================================================
    // Index retry set
    // ========================================================================

    pub fn mark_index_failed(&self, uid: u32) {
        lock(&self.index_retry).insert(uid);
    }

    pub fn clear_index_failure(&self, uid: u32) {
        lock(&self.index_retry).remove(&uid);
    }

    pub fn index_retry_len(&self) -> usize {
        lock(&self.index_retry).len()
    }

    /// Whether a backfilled record still needs processing: it is above the
    /// watermark or its earlier unclassified write failed.
    pub fn needs_processing(&self, uid: u32) -> bool {
        uid > self.last_seen_uid() || lock(&self.index_retry).contains(&uid)
    }
}
