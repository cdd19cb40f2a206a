//! Single-worker drain scheduler.
//!
//! At most one drain cycle runs at a time. Triggers that arrive while a cycle
//! is running collapse into one follow-up check, taken when the cycle ends.

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{
    batcher::ClassificationBatcher,
    feed::{FeedEvent, MailFeed},
    sync_state::SyncState,
};
use crate::{
    index::{DocumentStore, EmailDocument, StoreError},
    model::mail_record::{ClassifiedRecord, MailRecord},
    notify::NotificationDispatcher,
    observability::PipelineTracker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum DrainPhase {
    Idle,
    Running,
    RunningWithFollowUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    /// The queue was empty when checked.
    Drained,
    /// A batch went back to the head of the queue.
    Requeued,
    Cancelled,
}

pub struct DrainWorker {
    pub sync_state: Arc<SyncState>,
    pub batcher: ClassificationBatcher,
    pub store: Arc<dyn DocumentStore>,
    pub dispatcher: NotificationDispatcher,
    pub feed: MailFeed,
    pub tracker: PipelineTracker,
    pub batch_size: usize,
    pub requeue_delay: Duration,
}

/// Work the drain cycle holds between taking a batch and settling it.
#[derive(Default)]
struct InFlight {
    /// Batch taken from the queue and not yet settled.
    batch: Mutex<Option<Vec<MailRecord>>>,
    /// Classifications whose write is waiting for the store to come back.
    unwritten: Mutex<HashMap<u32, ClassifiedRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InFlight {
    fn take_batch(&self) -> Option<Vec<MailRecord>> {
        lock(&self.batch).take()
    }
}

impl DrainWorker {
    async fn cycle(&self, in_flight: &InFlight, cancel: &CancellationToken) -> CycleOutcome {
        loop {
            if cancel.is_cancelled() {
                return CycleOutcome::Cancelled;
            }

            let batch = self.sync_state.drain(self.batch_size.max(1));
            if batch.is_empty() {
                return CycleOutcome::Drained;
            }

            *lock(&in_flight.batch) = Some(batch.clone());
            let outcome = self.process_batch(batch, in_flight, cancel).await;
            in_flight.take_batch();
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    /// Classify, store and announce one batch. Returns `Some` when the cycle
    /// must stop.
    async fn process_batch(
        &self,
        batch: Vec<MailRecord>,
        in_flight: &InFlight,
        cancel: &CancellationToken,
    ) -> Option<CycleOutcome> {
        let batch_size = batch.len();

        // Records classified before a store outage are only written again
        let known: Vec<Option<ClassifiedRecord>> = {
            let unwritten = lock(&in_flight.unwritten);
            batch.iter().map(|r| unwritten.get(&r.uid).cloned()).collect()
        };
        let unclassified: Vec<MailRecord> = batch
            .iter()
            .zip(&known)
            .filter(|(_, known)| known.is_none())
            .map(|(record, _)| record.clone())
            .collect();
        tracing::debug!(batch_size, unclassified = unclassified.len(), "Classifying batch");

        let fresh = tokio::select! {
            classified = self.batcher.classify(unclassified) => classified,
            _ = cancel.cancelled() => {
                self.sync_state.requeue_front(batch);
                return Some(CycleOutcome::Cancelled);
            }
        };
        let mut fresh = fresh.into_iter();
        let classified: Vec<ClassifiedRecord> = known
            .into_iter()
            .filter_map(|known| known.or_else(|| fresh.next()))
            .collect();

        let docs: Vec<EmailDocument> = classified.iter().map(EmailDocument::from).collect();
        match self.store.bulk_upsert(&docs, true).await {
            Ok(report) => {
                for (uid, reason) in &report.failed {
                    tracing::warn!(uid, "Classified update failed: {}", reason);
                }
                self.tracker.record_index_failures(report.failed.len());
            }
            Err(StoreError::Unreachable(e)) => {
                tracing::error!(batch_size, "Store unreachable, requeueing batch: {}", e);
                lock(&in_flight.unwritten)
                    .extend(classified.into_iter().map(|c| (c.record.uid, c)));
                self.sync_state.requeue_front(batch);
                self.tracker.record_requeue();
                return Some(CycleOutcome::Requeued);
            }
            Err(e) => {
                tracing::error!(batch_size, "Classified bulk update rejected: {}", e);
                self.tracker.record_index_failures(batch_size);
            }
        }

        {
            let mut unwritten = lock(&in_flight.unwritten);
            for record in &batch {
                unwritten.remove(&record.uid);
            }
        }

        for record in &classified {
            self.feed.publish(FeedEvent::Classified(record.clone()));
        }
        self.dispatcher.dispatch(&classified).await;
        None
    }
}

#[derive(Clone)]
pub struct DrainScheduler {
    worker: Arc<DrainWorker>,
    in_flight: Arc<InFlight>,
    phase: Arc<watch::Sender<DrainPhase>>,
    cancel: CancellationToken,
}

impl DrainScheduler {
    pub fn new(worker: DrainWorker, cancel: CancellationToken) -> Self {
        let (phase, _) = watch::channel(DrainPhase::Idle);
        Self {
            worker: Arc::new(worker),
            in_flight: Arc::new(InFlight::default()),
            phase: Arc::new(phase),
            cancel,
        }
    }

    pub fn phase(&self) -> DrainPhase {
        *self.phase.borrow()
    }

    /// Start a drain cycle, or mark a follow-up if one is already running.
    pub fn trigger(&self) {
        if self.cancel.is_cancelled() {
            return;
        }

        let mut start = false;
        self.phase.send_if_modified(|phase| match phase {
            DrainPhase::Idle => {
                *phase = DrainPhase::Running;
                start = true;
                true
            }
            DrainPhase::Running => {
                *phase = DrainPhase::RunningWithFollowUp;
                true
            }
            DrainPhase::RunningWithFollowUp => false,
        });

        if start {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run().await });
        }
    }

    /// Resolves once no cycle is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == DrainPhase::Idle).await;
    }

    async fn run(&self) {
        loop {
            let outcome = AssertUnwindSafe(self.worker.cycle(&self.in_flight, &self.cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "Unknown panic".to_string());
                    tracing::error!("Drain cycle panicked, recovering: {}", msg);
                    if let Some(batch) = self.in_flight.take_batch() {
                        self.worker.tracker.record_requeue();
                        self.worker.sync_state.requeue_front(batch);
                    }
                    CycleOutcome::Requeued
                });

            if outcome == CycleOutcome::Requeued {
                tokio::select! {
                    _ = tokio::time::sleep(self.worker.requeue_delay) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }

            let cancelled = self.cancel.is_cancelled();
            let sync_state = &self.worker.sync_state;
            let mut again = false;
            self.phase.send_modify(|phase| {
                let follow_up = *phase == DrainPhase::RunningWithFollowUp;
                again = !cancelled && (follow_up || sync_state.queue_len() > 0);
                *phase = if again {
                    DrainPhase::Running
                } else {
                    DrainPhase::Idle
                };
            });

            if !again {
                return;
            }
        }
    }
}
