//! Counter store abstraction.
//!
//! A counter store holds one non-negative integer per page id and pushes a
//! [`CounterRecord`] to every subscriber whenever that integer changes. The
//! only mutation is [`CounterStore::increment`], and it must be performed by
//! the store as a single atomic read-modify-write. A client that reads the
//! count, adds one and writes it back will lose updates as soon as two
//! clients race, so no such write path exists in this API.

pub mod memory;
pub mod migrations;
pub mod schema;
pub mod sqlite;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::counter::CounterRecord;
use crate::error::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Number of undelivered changes a slow subscriber may fall behind by before
/// it starts skipping to newer values.
const FEED_CAPACITY: usize = 64;

/// A shared counter store.
///
/// Implementations must make `initialize` idempotent under concurrent
/// callers and `increment` atomic with respect to every other increment.
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Short name of the backend, for logs.
    fn name(&self) -> &'static str;

    /// Read the current record for `page_id`, or `None` if it was never created.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn fetch(&self, page_id: &str) -> Result<Option<CounterRecord>>;

    /// Create the record for `page_id` with `initial_count` if it is absent.
    ///
    /// When another client created it first, the existing record is
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn initialize(&self, page_id: &str, initial_count: u64) -> Result<CounterRecord>;

    /// Atomically add one to the count for `page_id` and return the new record.
    ///
    /// An absent record is created with a count of one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn increment(&self, page_id: &str) -> Result<CounterRecord>;

    /// Subscribe to changes of `page_id`, including changes made through this
    /// same store handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the change feed cannot be established.
    async fn subscribe(&self, page_id: &str) -> Result<Subscription>;
}

/// Read the record for `page_id`, creating it at zero when absent.
///
/// A failed `initialize` is assumed to be a lost creation race: the record
/// is fetched again and the original error is returned only if it is still
/// missing.
///
/// # Errors
///
/// Returns an error if the store cannot be reached.
pub async fn fetch_or_initialize(store: &dyn CounterStore, page_id: &str) -> Result<CounterRecord> {
    if let Some(record) = store.fetch(page_id).await? {
        return Ok(record);
    }

    debug!(page_id, store = store.name(), "Counter not found, initializing");
    match store.initialize(page_id, 0).await {
        Ok(record) => Ok(record),
        Err(err) => {
            warn!(page_id, error = %err, "Initialize failed, re-fetching");
            store.fetch(page_id).await?.ok_or(err)
        }
    }
}

/// Live stream of changes to a single page's counter.
///
/// Dropping the subscription (or calling [`Subscription::cancel`]) stops
/// delivery.
#[derive(Debug)]
pub struct Subscription {
    page_id: String,
    receiver: broadcast::Receiver<CounterRecord>,
}

impl Subscription {
    /// The page this subscription follows.
    #[must_use]
    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    /// Wait for the next change of the subscribed page.
    ///
    /// Returns `None` once the store side of the feed is gone. A subscriber
    /// that fell behind skips straight to the newest buffered changes.
    pub async fn next(&mut self) -> Option<CounterRecord> {
        loop {
            match self.receiver.recv().await {
                Ok(record) if record.is_for(&self.page_id) => return Some(record),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(page_id = %self.page_id, skipped, "Subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Stop receiving changes and release the subscription.
    pub fn cancel(self) {
        debug!(page_id = %self.page_id, "Subscription cancelled");
    }
}

/// Fan-out of counter changes to subscriptions, shared by the store backends.
#[derive(Debug, Clone)]
pub(crate) struct ChangeFeed {
    sender: broadcast::Sender<CounterRecord>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        Self { sender }
    }
}

impl ChangeFeed {
    /// Deliver a change to every current subscriber.
    pub(crate) fn publish(&self, record: CounterRecord) {
        // No subscribers is not an error
        let _ = self.sender.send(record);
    }

    pub(crate) fn subscribe(&self, page_id: &str) -> Subscription {
        Subscription {
            page_id: page_id.to_string(),
            receiver: self.sender.subscribe(),
        }
    }

    pub(crate) fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    /// Store whose `initialize` always fails. With `rival_count` set, another
    /// writer creates the record first, like a lost creation race.
    #[derive(Debug, Default)]
    struct FailingInitStore {
        inner: MemoryStore,
        rival_count: Option<u64>,
    }

    #[async_trait::async_trait]
    impl CounterStore for FailingInitStore {
        fn name(&self) -> &'static str {
            "failing-init"
        }

        async fn fetch(&self, page_id: &str) -> Result<Option<CounterRecord>> {
            self.inner.fetch(page_id).await
        }

        async fn initialize(&self, page_id: &str, _initial_count: u64) -> Result<CounterRecord> {
            if let Some(count) = self.rival_count {
                self.inner.initialize(page_id, count).await?;
            }
            Err(Error::store_unreachable("initialize", "conflict"))
        }

        async fn increment(&self, page_id: &str) -> Result<CounterRecord> {
            self.inner.increment(page_id).await
        }

        async fn subscribe(&self, page_id: &str) -> Result<Subscription> {
            self.inner.subscribe(page_id).await
        }
    }

    #[tokio::test]
    async fn test_subscription_filters_other_pages() {
        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe("main");

        feed.publish(CounterRecord::new("other", 99));
        feed.publish(CounterRecord::new("main", 1));

        assert_eq!(sub.page_id(), "main");
        let record = sub.next().await.unwrap();
        assert_eq!(record.page_id, "main");
        assert_eq!(record.count, 1);
    }

    #[tokio::test]
    async fn test_subscription_ends_when_feed_dropped() {
        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe("main");
        drop(feed);

        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscription_skips_ahead() {
        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe("main");

        let total = u64::try_from(FEED_CAPACITY).unwrap() + 10;
        for count in 1..=total {
            feed.publish(CounterRecord::new("main", count));
        }

        let first = sub.next().await.unwrap();
        assert!(first.count > 1);
    }

    #[test]
    fn test_cancel_releases_receiver() {
        let feed = ChangeFeed::default();
        let sub = feed.subscribe("main");
        assert_eq!(feed.receiver_count(), 1);

        sub.cancel();
        assert_eq!(feed.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_or_initialize_creates_zero() {
        let store = MemoryStore::new();

        let record = fetch_or_initialize(&store, "fresh").await.unwrap();
        assert_eq!(record.count, 0);

        let again = store.fetch("fresh").await.unwrap();
        assert_eq!(again.map(|r| r.count), Some(0));
    }

    #[tokio::test]
    async fn test_fetch_or_initialize_keeps_existing() {
        let store = MemoryStore::new();
        store.increment("main").await.unwrap();
        store.increment("main").await.unwrap();

        let record = fetch_or_initialize(&store, "main").await.unwrap();
        assert_eq!(record.count, 2);
    }

    #[tokio::test]
    async fn test_fetch_or_initialize_recovers_lost_race() {
        let store = FailingInitStore {
            rival_count: Some(7),
            ..FailingInitStore::default()
        };

        let record = fetch_or_initialize(&store, "main").await.unwrap();
        assert_eq!(record.page_id, "main");
        assert_eq!(record.count, 7);
    }

    #[tokio::test]
    async fn test_fetch_or_initialize_returns_error_when_still_missing() {
        let store = FailingInitStore::default();

        let err = fetch_or_initialize(&store, "main").await.unwrap_err();
        assert!(err.is_store_unreachable());
        assert!(err.to_string().contains("conflict"));
        assert!(store.fetch("main").await.unwrap().is_none());
    }
}
