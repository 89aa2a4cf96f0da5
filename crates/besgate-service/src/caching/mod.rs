//! In-memory cache for executed BES transactions.
//!
//! In practice this caches BES API responses such as catalog (`showNode`)
//! listings, not data payloads. Entries keep the request descriptor that
//! produced them so a background task can periodically re-execute every
//! cached transaction and replace stale results in place.
//!
//! All mutation happens under one lock per cache instance. The refresh pass
//! intentionally performs BES I/O while holding that lock, processing one key
//! at a time and checking a halt flag in between so shutdown stays
//! responsive; `get` and `put` never touch the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bes::{BesClient, BesCommand, CommandSnapshot, TransactionOutcome};
use crate::config::CatalogCacheConfig;

mod recency;

use recency::{RecencyIndex, RecencyKey};

/// Fraction of the cache dropped when capacity is reached.
const CACHE_REDUCTION_FACTOR: f64 = 0.2;

/// Capacity and refresh policy for a [`TransactionCache`].
#[derive(Clone, Copy, Debug)]
pub struct CacheSettings {
    /// Number of entries kept. Must be greater than 0.
    pub max_entries: usize,
    /// Interval between refresh passes. 0 disables the background task.
    pub refresh_interval: Duration,
}

impl From<CatalogCacheConfig> for CacheSettings {
    fn from(config: CatalogCacheConfig) -> Self {
        CacheSettings {
            max_entries: config.max_entries,
            refresh_interval: config.refresh_interval,
        }
    }
}

/// Error returned for unusable [`CacheSettings`].
#[derive(Debug, thiserror::Error)]
#[error("cache capacity must be greater than 0")]
pub struct InvalidCacheSettings;

struct CacheEntry {
    snapshot: CommandSnapshot,
    outcome: TransactionOutcome,
    last_update: Instant,
    last_access: Instant,
    serial: u64,
}

impl CacheEntry {
    fn recency_key(&self) -> RecencyKey {
        RecencyKey {
            last_access: self.last_access,
            serial: self.serial,
        }
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    recency: RecencyIndex,
}

/// A bounded cache of executed BES transactions with least-recently-accessed
/// eviction and periodic background refresh.
///
/// A cache that was never [configured](TransactionCache::configure) is
/// disabled: `get` always misses and `put` is a no-op.
pub struct TransactionCache {
    settings: OnceCell<CacheSettings>,
    serial: AtomicU64,
    halted: AtomicBool,
    inner: Mutex<CacheInner>,
}

impl Default for TransactionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionCache {
    /// Creates a disabled cache. Call [`configure`](Self::configure) to
    /// enable it.
    pub fn new() -> Self {
        TransactionCache {
            settings: OnceCell::new(),
            serial: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Enables the cache with the given settings.
    ///
    /// The first configuration wins; later calls are no-ops so independent
    /// handlers can race to configure a shared instance safely.
    pub fn configure(&self, settings: CacheSettings) -> Result<(), InvalidCacheSettings> {
        if settings.max_entries == 0 {
            return Err(InvalidCacheSettings);
        }
        match self.settings.set(settings) {
            Ok(()) => tracing::debug!(
                max_entries = settings.max_entries,
                refresh_interval = ?settings.refresh_interval,
                "transaction cache configured"
            ),
            Err(_) => tracing::debug!("transaction cache already configured, keeping settings"),
        }
        Ok(())
    }

    fn enabled(&self) -> Option<&CacheSettings> {
        self.settings.get()
    }

    /// Stores or overwrites the outcome for `key`.
    ///
    /// The descriptor is snapshotted (per-call timeout stripped) so later
    /// mutation by the caller cannot reach cache state. Eviction, when
    /// needed, happens in the same critical section as the insertion, so no
    /// reader ever observes an over-capacity cache.
    pub async fn put(&self, key: &str, command: &BesCommand, outcome: TransactionOutcome) {
        let Some(settings) = self.enabled() else {
            return;
        };
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.entries.remove(key) {
            inner.recency.remove(&old.recency_key());
        }
        if inner.entries.len() >= settings.max_entries {
            Self::purge_least_recently_accessed(&mut inner, settings.max_entries);
        }

        let now = Instant::now();
        let entry = CacheEntry {
            snapshot: CommandSnapshot::of(command),
            outcome,
            last_update: now,
            last_access: now,
            serial: self.serial.fetch_add(1, Ordering::Relaxed),
        };
        inner.recency.insert(entry.recency_key(), key.to_owned());
        inner.entries.insert(key.to_owned(), entry);
        tracing::debug!(key, size = inner.entries.len(), "cached transaction");
    }

    /// Looks up the outcome for `key`, marking the entry most recently used.
    pub async fn get(&self, key: &str) -> Option<TransactionOutcome> {
        self.enabled()?;
        let mut inner = self.inner.lock().await;
        let CacheInner { entries, recency } = &mut *inner;
        let entry = entries.get_mut(key)?;

        recency.remove(&entry.recency_key());
        // Instant::now() may not have ticked since the last touch; access
        // times must stay strictly increasing for the reinsertion to land at
        // the most-recent end.
        let now = Instant::now();
        entry.last_access = if now > entry.last_access {
            now
        } else {
            entry.last_access + Duration::from_nanos(1)
        };
        recency.insert(entry.recency_key(), key.to_owned());

        tracing::debug!(key, "transaction cache hit");
        Some(entry.outcome.clone())
    }

    fn purge_least_recently_accessed(inner: &mut CacheInner, max_entries: usize) {
        // A strict floor would purge nothing for very small capacities and
        // let the cache exceed its bound.
        let drop_count = ((max_entries as f64 * CACHE_REDUCTION_FACTOR) as usize).max(1);
        for (_, key) in inner.recency.pop_oldest(drop_count) {
            inner.entries.remove(&key);
            tracing::debug!(key, "purged least recently accessed transaction");
        }
    }

    /// Re-executes every cached transaction and replaces its result.
    ///
    /// Neither access times nor the recency order change; only `last_update`
    /// and the stored outcome do. A transaction that fails with a transient
    /// BES error has that error recorded as its new outcome. A fatal error
    /// halts the cache permanently and is returned to the caller.
    pub async fn refresh_all(&self, bes: &dyn BesClient) -> Result<(), crate::bes::BesError> {
        if self.enabled().is_none() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        let keys: Vec<String> = inner.entries.keys().cloned().collect();
        for key in keys {
            if self.halted.load(Ordering::Relaxed) {
                return Ok(());
            }
            let Some(command) = inner.entries.get(&key).map(|e| e.snapshot.command().clone())
            else {
                continue;
            };
            let outcome = match bes.transaction(&command).await {
                Ok(payload) => TransactionOutcome::Success(payload),
                Err(err) if err.is_fatal() => {
                    self.halted.store(true, Ordering::Relaxed);
                    return Err(err);
                }
                Err(err) => {
                    tracing::info!(key, error = %err, "refresh got a BES error, caching it");
                    TransactionOutcome::BackendError(err)
                }
            };
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.outcome = outcome;
                entry.last_update = Instant::now();
            }
        }
        Ok(())
    }

    /// Spawns the periodic refresh task for this cache.
    ///
    /// Returns `None` when the cache is disabled or the refresh interval is
    /// zero. The task runs until [`shutdown`](Self::shutdown) or a fatal BES
    /// error.
    pub fn spawn_refresh_task(
        self: &Arc<Self>,
        bes: Arc<dyn BesClient>,
    ) -> Option<JoinHandle<()>> {
        let interval = self.enabled()?.refresh_interval;
        if interval.is_zero() {
            return None;
        }
        let cache = Arc::clone(self);
        Some(tokio::spawn(async move {
            tracing::info!("catalog refresh task started");
            let mut pass: u64 = 0;
            while !cache.halted.load(Ordering::Relaxed) {
                let started = Instant::now();
                if let Err(err) = cache.refresh_all(bes.as_ref()).await {
                    tracing::error!(
                        error = %err,
                        "fatal BES error during refresh, catalog refresh task halting"
                    );
                    return;
                }
                pass += 1;
                let elapsed = started.elapsed();
                tracing::debug!(pass, elapsed_ms = elapsed.as_millis() as u64, "refresh pass done");
                // A pass slower than the interval starts the next one
                // immediately rather than sleeping a negative amount.
                let sleep = interval.saturating_sub(elapsed);
                if !sleep.is_zero() {
                    tokio::time::sleep(sleep).await;
                }
            }
            tracing::info!("catalog refresh task exiting");
        }))
    }

    /// Stops the refresh task at its next halt check and clears all entries.
    pub async fn shutdown(&self) {
        self.halted.store(true, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.recency.clear();
        tracing::debug!("transaction cache cleared");
    }

    /// Number of cached transactions.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use besgate_test::ScriptedBes;

    use crate::bes::{BesError, BesPayload};

    use super::*;

    fn success(text: &str) -> TransactionOutcome {
        TransactionOutcome::Success(BesPayload(text.to_owned()))
    }

    fn configured(max_entries: usize) -> TransactionCache {
        let cache = TransactionCache::new();
        cache
            .configure(CacheSettings {
                max_entries,
                refresh_interval: Duration::ZERO,
            })
            .unwrap();
        cache
    }

    async fn recency_order(cache: &TransactionCache) -> Vec<String> {
        cache.inner.lock().await.recency.keys_oldest_first()
    }

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let cache = TransactionCache::new();
        let command = BesCommand::show_node("/a");
        cache.put("/a", &command, success("x")).await;
        assert_eq!(cache.get("/a").await, None);
        assert!(cache.is_empty().await);
    }

    #[test]
    fn test_first_configuration_wins() {
        let cache = TransactionCache::new();
        cache
            .configure(CacheSettings {
                max_entries: 10,
                refresh_interval: Duration::ZERO,
            })
            .unwrap();
        cache
            .configure(CacheSettings {
                max_entries: 999,
                refresh_interval: Duration::from_secs(1),
            })
            .unwrap();
        assert_eq!(cache.settings.get().unwrap().max_entries, 10);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let cache = TransactionCache::new();
        let result = cache.configure(CacheSettings {
            max_entries: 0,
            refresh_interval: Duration::ZERO,
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_capacity_invariant() {
        let max_entries = 5;
        let cache = configured(max_entries);
        for i in 0..100 {
            let key = format!("/node/{i}");
            cache
                .put(&key, &BesCommand::show_node(&key), success("listing"))
                .await;
            assert!(cache.len().await <= max_entries, "over capacity after put {i}");
        }
    }

    #[tokio::test]
    async fn test_eviction_removes_least_recently_accessed() {
        let cache = configured(10);
        for i in 0..10 {
            let key = format!("/node/{i}");
            cache
                .put(&key, &BesCommand::show_node(&key), success("listing"))
                .await;
        }
        // Touch the two oldest so they move to the most-recent end.
        assert!(cache.get("/node/0").await.is_some());
        assert!(cache.get("/node/1").await.is_some());

        // floor(10 * 0.2) = 2: the next put drops the two oldest untouched
        // entries, which are now /node/2 and /node/3.
        cache
            .put("/node/10", &BesCommand::show_node("/node/10"), success("listing"))
            .await;

        assert_eq!(cache.get("/node/2").await, None);
        assert_eq!(cache.get("/node/3").await, None);
        assert!(cache.get("/node/0").await.is_some());
        assert!(cache.get("/node/4").await.is_some());
        assert!(cache.get("/node/10").await.is_some());
    }

    #[tokio::test]
    async fn test_get_moves_entry_to_most_recent_end() {
        let cache = configured(10);
        for key in ["/a", "/b", "/c"] {
            cache
                .put(key, &BesCommand::show_node(key), success("listing"))
                .await;
        }
        assert_eq!(recency_order(&cache).await, ["/a", "/b", "/c"]);

        assert!(cache.get("/a").await.is_some());
        assert_eq!(recency_order(&cache).await, ["/b", "/c", "/a"]);
    }

    #[tokio::test]
    async fn test_get_strictly_increases_access_time() {
        let cache = configured(10);
        cache
            .put("/a", &BesCommand::show_node("/a"), success("listing"))
            .await;
        let before = cache.inner.lock().await.entries["/a"].last_access;
        assert!(cache.get("/a").await.is_some());
        let after = cache.inner.lock().await.entries["/a"].last_access;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_entry() {
        let cache = configured(10);
        let command = BesCommand::show_node("/a");
        cache.put("/a", &command, success("one")).await;
        cache.put("/a", &command, success("two")).await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("/a").await, Some(success("two")));
    }

    #[tokio::test]
    async fn test_cached_descriptor_has_no_timeout() {
        let cache = configured(10);
        let command = BesCommand::show_node("/a").with_timeout(Duration::from_secs(7));
        cache.put("/a", &command, success("listing")).await;
        let inner = cache.inner.lock().await;
        assert_eq!(inner.entries["/a"].snapshot.command().timeout, None);
    }

    #[tokio::test]
    async fn test_refresh_updates_results_not_order() {
        let cache = configured(10);
        for key in ["/a", "/b", "/c"] {
            cache
                .put(key, &BesCommand::show_node(key), success("stale"))
                .await;
        }
        assert!(cache.get("/b").await.is_some());
        let order_before = recency_order(&cache).await;
        let access_before = cache.inner.lock().await.entries["/b"].last_access;

        let bes = ScriptedBes::new().respond_all("fresh");
        cache.refresh_all(&bes).await.unwrap();

        assert_eq!(recency_order(&cache).await, order_before);
        let inner = cache.inner.lock().await;
        assert_eq!(inner.entries["/b"].last_access, access_before);
        for key in ["/a", "/b", "/c"] {
            assert_eq!(inner.entries[key].outcome, success("fresh"));
        }
    }

    #[tokio::test]
    async fn test_refresh_caches_transient_errors() {
        let cache = configured(10);
        cache
            .put("/a", &BesCommand::show_node("/a"), success("stale"))
            .await;

        let bes = ScriptedBes::new().fail_all(BesError::NotFound("gone".to_owned()));
        cache.refresh_all(&bes).await.unwrap();

        assert_eq!(
            cache.get("/a").await,
            Some(TransactionOutcome::BackendError(BesError::NotFound(
                "gone".to_owned()
            )))
        );
    }

    #[tokio::test]
    async fn test_refresh_halts_on_fatal_error() {
        let cache = configured(10);
        cache
            .put("/a", &BesCommand::show_node("/a"), success("stale"))
            .await;

        let bes = ScriptedBes::new().fail_all(BesError::Protocol("framing".to_owned()));
        let err = cache.refresh_all(&bes).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(cache.halted.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_shutdown_clears() {
        let cache = configured(10);
        cache
            .put("/a", &BesCommand::show_node("/a"), success("listing"))
            .await;
        cache.shutdown().await;
        assert!(cache.is_empty().await);
        assert_eq!(cache.get("/a").await, None);
    }
}
