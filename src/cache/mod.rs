//! Stale-while-revalidate cache for derived aggregate reads.
//!
//! The cache paints instantly from its persisted entry when fresh, then
//! revalidates in the background. Concurrent fetches collapse into one
//! network call through a shared future, and bursts of manual refreshes are
//! debounced into a single fetch.

mod balance;
mod debounce;

pub use balance::{BalanceSummary, WalletBalance};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use crate::session::storage::Storage;
use crate::{Error, Result};

use debounce::Debouncer;

pub use crate::config::DEFAULT_CACHE_TTL;

/// Persisted cache record. Fresh iff `now - fetched_at < ttl`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct CacheEntry<T> {
    data: T,
    fetched_at: DateTime<Utc>,
}

/// Observable per-consumer state.
///
/// A fetch failure sets `error` without touching `data`, so a stale value
/// stays on screen with an inline error instead of blanking the view.
#[derive(Clone, Debug)]
pub struct CacheSnapshot<T> {
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl<T> Default for CacheSnapshot<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            fetched_at: None,
        }
    }
}

/// Fetch function injected at construction, keeping the cache decoupled
/// from the request pipeline.
pub type FetchFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

type FetchFuture<T> = Shared<BoxFuture<'static, std::result::Result<T, String>>>;

/// Read-through stale-while-revalidate cache for one aggregate value.
pub struct AggregateCache<T> {
    storage: Arc<dyn Storage>,
    key: String,
    ttl: Duration,
    fetch: FetchFn<T>,
    state: watch::Sender<CacheSnapshot<T>>,
    in_flight: Mutex<Option<FetchFuture<T>>>,
    debounce: Debouncer,
}

impl<T> AggregateCache<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn new(
        storage: Arc<dyn Storage>,
        key: impl Into<String>,
        ttl: Duration,
        fetch: FetchFn<T>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(CacheSnapshot::default());
        Arc::new(Self {
            storage,
            key: key.into(),
            ttl,
            fetch,
            state,
            in_flight: Mutex::new(None),
            debounce: Debouncer::new(),
        })
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<CacheSnapshot<T>> {
        self.state.subscribe()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> CacheSnapshot<T> {
        self.state.borrow().clone()
    }

    /// Read the persisted entry, purging it when expired. Corrupt entries
    /// count as a miss and are discarded silently.
    pub async fn load_from_cache(&self) -> Option<T> {
        self.load_entry().await.map(|entry| entry.data)
    }

    /// Persist `data` with `fetched_at = now`, superseding any prior entry.
    pub async fn save_to_cache(&self, data: &T) {
        let entry = CacheEntry {
            data: data.clone(),
            fetched_at: Utc::now(),
        };
        let serialized = match serde_json::to_string(&entry) {
            Ok(serialized) => serialized,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to serialize cache entry");
                return;
            }
        };
        if let Err(e) = self.storage.set(&self.key, &serialized).await {
            tracing::warn!(key = %self.key, error = %e, "Failed to persist cache entry");
        }
    }

    /// Purge the persisted entry only; in-memory state is untouched.
    pub async fn clear_cache(&self) {
        if let Err(e) = self.storage.remove(&self.key).await {
            tracing::warn!(key = %self.key, error = %e, "Failed to clear cache entry");
        }
    }

    /// Fetch the aggregate now. Concurrent invocations collapse into the
    /// already-running call and all receive the same resolved value.
    ///
    /// `show_spinner` controls whether the snapshot reports `loading`; pass
    /// `false` when a cached value is already painted.
    pub async fn fetch_now(self: &Arc<Self>, show_spinner: bool) -> Result<T> {
        let fut = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    self.state.send_modify(|snapshot| {
                        snapshot.loading = show_spinner;
                        snapshot.error = None;
                    });

                    let this = Arc::clone(self);
                    let fut = async move { this.run_fetch().await }.boxed().shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        let outcome = fut.clone().await;

        {
            let mut slot = self.in_flight.lock().await;
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&fut)) {
                *slot = None;
            }
        }

        outcome.map_err(Error::Fetch)
    }

    /// Coalesce a burst of refresh calls into one `fetch_now(false)` run
    /// once `debounce` has elapsed since the last call. Each call cancels
    /// and restarts the window.
    pub fn refresh_debounced(self: &Arc<Self>, debounce: Duration) {
        let this = Arc::clone(self);
        self.debounce.schedule(debounce, async move {
            let _ = this.fetch_now(false).await;
        });
    }

    /// Cancel a pending debounced refresh.
    pub fn cancel_pending_refresh(&self) {
        self.debounce.cancel();
    }

    /// Mount protocol: paint from cache when fresh, then always revalidate
    /// in the background. The spinner shows only when nothing was painted.
    ///
    /// Returns the painted value, if any.
    pub async fn activate(self: &Arc<Self>) -> Option<T> {
        let entry = self.load_entry().await;
        if let Some(ref entry) = entry {
            let data = entry.data.clone();
            let fetched_at = entry.fetched_at;
            self.state.send_modify(|snapshot| {
                snapshot.data = Some(data);
                snapshot.fetched_at = Some(fetched_at);
            });
        }

        let missed = entry.is_none();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = this.fetch_now(missed).await;
        });

        entry.map(|entry| entry.data)
    }

    async fn run_fetch(self: Arc<Self>) -> std::result::Result<T, String> {
        match (self.fetch)().await {
            Ok(data) => {
                self.save_to_cache(&data).await;
                let painted = data.clone();
                self.state.send_modify(move |snapshot| {
                    snapshot.data = Some(painted);
                    snapshot.loading = false;
                    snapshot.error = None;
                    snapshot.fetched_at = Some(Utc::now());
                });
                Ok(data)
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(key = %self.key, error = %message, "Aggregate fetch failed");
                let surfaced = message.clone();
                self.state.send_modify(move |snapshot| {
                    snapshot.loading = false;
                    snapshot.error = Some(surfaced);
                });
                Err(message)
            }
        }
    }

    async fn load_entry(&self) -> Option<CacheEntry<T>> {
        let raw = match self.storage.get(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Cache storage read failed");
                return None;
            }
        };

        let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Discarding corrupt cache entry");
                self.clear_cache().await;
                return None;
            }
        };

        if self.is_expired(&entry) {
            self.clear_cache().await;
            return None;
        }

        Some(entry)
    }

    fn is_expired(&self, entry: &CacheEntry<T>) -> bool {
        entry_expired_at(entry.fetched_at, self.ttl, Utc::now())
    }
}

/// Fresh iff `now - fetched_at < ttl`.
fn entry_expired_at(fetched_at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(fetched_at) >= ttl
}

impl<T> std::fmt::Debug for AggregateCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateCache")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::storage::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_fetch(calls: Arc<AtomicUsize>, value: i64) -> FetchFn<i64> {
        Arc::new(move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(value)
            }
            .boxed()
        })
    }

    fn failing_fetch(message: &'static str) -> FetchFn<i64> {
        Arc::new(move || {
            async move { Err::<i64, _>(Error::config(message)) }.boxed()
        })
    }

    fn cache_with(
        storage: Arc<dyn Storage>,
        ttl: Duration,
        fetch: FetchFn<i64>,
    ) -> Arc<AggregateCache<i64>> {
        AggregateCache::new(storage, "cache.test", ttl, fetch)
    }

    async fn write_entry(storage: &dyn Storage, key: &str, data: i64, age: chrono::Duration) {
        let entry = CacheEntry {
            data,
            fetched_at: Utc::now() - age,
        };
        storage
            .set(key, &serde_json::to_string(&entry).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache_with(
            Arc::clone(&storage),
            Duration::from_secs(60),
            counting_fetch(calls, 42),
        );

        cache.save_to_cache(&42).await;
        assert_eq!(cache.load_from_cache().await, Some(42));
    }

    #[test]
    fn test_ttl_millisecond_boundary() {
        let ttl = Duration::from_secs(60);
        let now = Utc::now();
        let fresh = now - chrono::Duration::seconds(60) + chrono::Duration::milliseconds(1);
        let stale = now - chrono::Duration::seconds(60) - chrono::Duration::milliseconds(1);
        let exact = now - chrono::Duration::seconds(60);

        assert!(!entry_expired_at(fresh, ttl, now));
        assert!(entry_expired_at(stale, ttl, now));
        assert!(entry_expired_at(exact, ttl, now));
    }

    #[tokio::test]
    async fn test_expired_entry_is_purged() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(60);
        let cache = cache_with(Arc::clone(&storage), ttl, counting_fetch(calls, 1));

        // Comfortably inside the window: fresh.
        write_entry(
            storage.as_ref(),
            "cache.test",
            7,
            chrono::Duration::seconds(30),
        )
        .await;
        assert_eq!(cache.load_from_cache().await, Some(7));

        // Past the window: absent, and purged.
        write_entry(
            storage.as_ref(),
            "cache.test",
            7,
            chrono::Duration::seconds(61),
        )
        .await;
        assert_eq!(cache.load_from_cache().await, None);
        assert_eq!(storage.get("cache.test").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage.set("cache.test", "{definitely not json").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache_with(
            Arc::clone(&storage),
            Duration::from_secs(60),
            counting_fetch(calls, 1),
        );

        assert_eq!(cache.load_from_cache().await, None);
        assert_eq!(storage.get("cache.test").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_collapse() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache_with(
            storage,
            Duration::from_secs(60),
            counting_fetch(Arc::clone(&calls), 99),
        );

        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch_now(true).await })
        };
        let b = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch_now(true).await })
        };

        assert_eq!(a.await.unwrap().unwrap(), 99);
        assert_eq!(b.await.unwrap().unwrap(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_stale_data() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache_with(
            Arc::clone(&storage),
            Duration::from_secs(60),
            counting_fetch(Arc::clone(&calls), 5),
        );

        cache.fetch_now(true).await.unwrap();
        assert_eq!(cache.snapshot().data, Some(5));

        let failing = cache_with(storage, Duration::from_secs(60), failing_fetch("boom"));
        // Carry the painted value over to the failing cache's state.
        failing.state.send_modify(|s| s.data = Some(5));

        let err = failing.fetch_now(false).await.unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));

        let snapshot = failing.snapshot();
        assert_eq!(snapshot.data, Some(5));
        assert!(snapshot.error.is_some());
        assert!(!snapshot.loading);
    }

    #[tokio::test]
    async fn test_activate_paints_then_revalidates() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache_with(
            Arc::clone(&storage),
            Duration::from_secs(60),
            counting_fetch(Arc::clone(&calls), 10),
        );

        write_entry(
            storage.as_ref(),
            "cache.test",
            3,
            chrono::Duration::seconds(1),
        )
        .await;

        let painted = cache.activate().await;
        assert_eq!(painted, Some(3));
        // Cached paint never shows the spinner.
        assert!(!cache.snapshot().loading);

        let mut updates = cache.subscribe();
        updates
            .wait_for(|snapshot| snapshot.data == Some(10))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_cache_keeps_snapshot() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache_with(
            Arc::clone(&storage),
            Duration::from_secs(60),
            counting_fetch(calls, 5),
        );

        cache.fetch_now(true).await.unwrap();
        cache.clear_cache().await;

        assert_eq!(cache.load_from_cache().await, None);
        assert_eq!(cache.snapshot().data, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_refresh_coalesces() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache_with(
            storage,
            Duration::from_secs(60),
            counting_fetch(Arc::clone(&calls), 8),
        );

        for _ in 0..4 {
            cache.refresh_debounced(Duration::from_millis(200));
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
