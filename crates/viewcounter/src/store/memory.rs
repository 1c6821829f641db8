//! In-memory counter store.
//!
//! The reference implementation of the store contract: every mutation
//! happens under one lock, and the change is published before the lock is
//! released so subscribers observe counts in the order they were written.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::trace;

use crate::counter::CounterRecord;
use crate::error::{Error, Result};

use super::{ChangeFeed, CounterStore, Subscription};

/// Counter store held in process memory.
///
/// Cloning yields another handle to the same counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    counters: Mutex<HashMap<String, CounterRecord>>,
    feed: ChangeFeed,
    latency: Option<Duration>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that delays every request, to widen race windows.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                latency: Some(latency),
                ..MemoryInner::default()
            }),
        }
    }

    /// Number of live subscriptions across all pages.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.feed.receiver_count()
    }

    async fn round_trip(&self) {
        if let Some(latency) = self.inner.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn counters(&self) -> Result<MutexGuard<'_, HashMap<String, CounterRecord>>> {
        self.inner
            .counters
            .lock()
            .map_err(|_| Error::internal("memory store lock poisoned"))
    }
}

#[async_trait::async_trait]
impl CounterStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch(&self, page_id: &str) -> Result<Option<CounterRecord>> {
        self.round_trip().await;
        Ok(self.counters()?.get(page_id).cloned())
    }

    async fn initialize(&self, page_id: &str, initial_count: u64) -> Result<CounterRecord> {
        self.round_trip().await;
        let mut counters = self.counters()?;
        if let Some(existing) = counters.get(page_id) {
            return Ok(existing.clone());
        }

        let record = CounterRecord::new(page_id, initial_count);
        counters.insert(page_id.to_string(), record.clone());
        self.inner.feed.publish(record.clone());
        Ok(record)
    }

    async fn increment(&self, page_id: &str) -> Result<CounterRecord> {
        self.round_trip().await;
        let mut counters = self.counters()?;
        let record = counters
            .entry(page_id.to_string())
            .or_insert_with(|| CounterRecord::new(page_id, 0));

        record.count = record
            .count
            .checked_add(1)
            .ok_or_else(|| Error::internal(format!("counter '{page_id}' overflowed")))?;
        record.updated_at = Some(Utc::now());

        let record = record.clone();
        trace!(%record, "Incremented");
        self.inner.feed.publish(record.clone());
        Ok(record)
    }

    async fn subscribe(&self, page_id: &str) -> Result<Subscription> {
        Ok(self.inner.feed.subscribe(page_id))
    }
}
