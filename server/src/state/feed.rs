//! Real-time mail feed. Subscribers register a callback and receive every
//! indexed and classified record until their [`Subscription`] is dropped.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
};

use serde::Serialize;

use crate::model::mail_record::{ClassifiedRecord, MailRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "email", rename_all = "lowercase")]
pub enum FeedEvent {
    Indexed(MailRecord),
    Classified(ClassifiedRecord),
}

type Callback = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    callbacks: RwLock<HashMap<u64, Callback>>,
}

impl Subscribers {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<u64, Callback>> {
        self.callbacks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u64, Callback>> {
        self.callbacks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Default)]
pub struct MailFeed {
    inner: Arc<Subscribers>,
}

/// Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    feed: Weak<Subscribers>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.write().remove(&self.id);
        }
    }
}

impl MailFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.write().insert(id, Arc::new(callback));
        Subscription {
            id,
            feed: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, event: FeedEvent) {
        // Snapshot so a callback may subscribe or unsubscribe without deadlocking
        let callbacks: Vec<Callback> = self.inner.read().values().cloned().collect();
        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.read().len()
    }
}
