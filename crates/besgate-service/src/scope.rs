//! Per-request key/value storage shared by cooperating handlers.
//!
//! Handlers that take part in answering one inbound request often compute
//! the same intermediate values (resolved resource ids, parsed constraint
//! expressions). This cache gives each request a private store for such
//! values, keyed by an explicit [`ScopeId`] threaded through the call chain.
//!
//! The id is passed explicitly rather than derived from the current thread:
//! async runtimes reuse worker threads across logical requests, so ambient
//! thread-keyed storage would leak values between requests.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use uuid::Uuid;

/// Identifies one inbound request's execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId(Uuid);

impl ScopeId {
    /// Creates a fresh identifier.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        ScopeId(Uuid::new_v4())
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Values stored in a request scope.
pub type ScopeValue = Arc<dyn Any + Send + Sync>;

/// Lifecycle errors for scope operations.
///
/// Using a scope that was never opened (or was already closed) is a
/// programming error in the calling handler; it fails fast instead of
/// silently auto-opening, so lifecycle bugs surface immediately.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    /// The scope is not open.
    #[error("request scope {0} is not open")]
    NotOpen(ScopeId),
}

struct ScopeStore {
    values: HashMap<String, ScopeValue>,
    opened_at: Instant,
}

/// The registry of per-request stores.
///
/// Stores for different requests are fully independent; no cross-scope
/// visibility exists. One instance is shared process-wide and all access is
/// mediated by a single short-hold mutex.
#[derive(Default)]
pub struct RequestScopedCache {
    stores: Mutex<HashMap<ScopeId, ScopeStore>>,
}

impl RequestScopedCache {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a fresh, empty store for `id`.
    ///
    /// Opening an id that already has a store is a no-op ("open if needed"),
    /// so a second open never wipes values the first one accumulated.
    pub fn open(&self, id: ScopeId) {
        let mut stores = self.stores.lock().unwrap();
        if stores.contains_key(&id) {
            tracing::debug!(scope = %id, "request scope already open");
            return;
        }
        stores.insert(
            id,
            ScopeStore {
                values: HashMap::new(),
                opened_at: Instant::now(),
            },
        );
        tracing::debug!(scope = %id, "opened request scope");
    }

    /// Stores `value` under `key` in the scope's store, replacing any
    /// previous value.
    pub fn put(&self, id: ScopeId, key: &str, value: ScopeValue) -> Result<(), ScopeError> {
        let mut stores = self.stores.lock().unwrap();
        let store = stores.get_mut(&id).ok_or(ScopeError::NotOpen(id))?;
        if store.values.insert(key.to_owned(), value).is_some() {
            tracing::debug!(scope = %id, key, "replaced request scope value");
        }
        Ok(())
    }

    /// Stores `value` under `key` unless one is already present; returns the
    /// value that is in the store afterwards.
    pub fn put_if_absent(
        &self,
        id: ScopeId,
        key: &str,
        value: ScopeValue,
    ) -> Result<ScopeValue, ScopeError> {
        let mut stores = self.stores.lock().unwrap();
        let store = stores.get_mut(&id).ok_or(ScopeError::NotOpen(id))?;
        Ok(store
            .values
            .entry(key.to_owned())
            .or_insert(value)
            .clone())
    }

    /// Looks up `key` in the scope's store.
    pub fn get(&self, id: ScopeId, key: &str) -> Result<Option<ScopeValue>, ScopeError> {
        let stores = self.stores.lock().unwrap();
        let store = stores.get(&id).ok_or(ScopeError::NotOpen(id))?;
        Ok(store.values.get(key).cloned())
    }

    /// Discards the scope's store.
    ///
    /// Must be called exactly once per [`open`](Self::open), on error paths
    /// included, so a store never outlives the request it belongs to. Prefer
    /// [`open_guarded`](Self::open_guarded), which ties the close to a drop.
    pub fn close(&self, id: ScopeId) {
        let removed = self.stores.lock().unwrap().remove(&id);
        match removed {
            Some(store) => tracing::debug!(
                scope = %id,
                values = store.values.len(),
                lived_ms = store.opened_at.elapsed().as_millis() as u64,
                "closed request scope"
            ),
            None => tracing::warn!(scope = %id, "closing a request scope that is not open"),
        }
    }

    /// Opens a fresh scope and returns a guard that closes it on drop.
    pub fn open_guarded(self: &Arc<Self>) -> ScopeGuard {
        let id = ScopeId::new();
        self.open(id);
        ScopeGuard {
            cache: Arc::clone(self),
            id,
        }
    }
}

/// Closes its scope when dropped, covering early returns and panics in the
/// request handler.
pub struct ScopeGuard {
    cache: Arc<RequestScopedCache>,
    id: ScopeId,
}

impl ScopeGuard {
    /// The scope this guard owns.
    pub fn id(&self) -> ScopeId {
        self.id
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.cache.close(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(n: u32) -> ScopeValue {
        Arc::new(n)
    }

    fn as_u32(v: ScopeValue) -> u32 {
        *v.downcast::<u32>().unwrap()
    }

    #[test]
    fn test_open_is_idempotent() {
        let cache = RequestScopedCache::new();
        let id = ScopeId::new();
        cache.open(id);
        cache.put(id, "a", value(1)).unwrap();
        cache.open(id);
        let got = cache.get(id, "a").unwrap().expect("second open wiped the store");
        assert_eq!(as_u32(got), 1);
    }

    #[test]
    fn test_scopes_are_isolated() {
        let cache = RequestScopedCache::new();
        let first = ScopeId::new();
        let second = ScopeId::new();
        cache.open(first);
        cache.open(second);

        cache.put(first, "x", value(1)).unwrap();
        cache.put(second, "x", value(2)).unwrap();

        assert_eq!(as_u32(cache.get(first, "x").unwrap().unwrap()), 1);
        assert_eq!(as_u32(cache.get(second, "x").unwrap().unwrap()), 2);

        cache.close(first);
        // Closing one scope does not disturb the other.
        assert_eq!(as_u32(cache.get(second, "x").unwrap().unwrap()), 2);
    }

    #[test]
    fn test_unopened_scope_fails_fast() {
        let cache = RequestScopedCache::new();
        let id = ScopeId::new();
        assert!(matches!(
            cache.put(id, "a", value(1)),
            Err(ScopeError::NotOpen(_))
        ));
        assert!(matches!(cache.get(id, "a"), Err(ScopeError::NotOpen(_))));
    }

    #[test]
    fn test_closed_scope_fails_fast() {
        let cache = RequestScopedCache::new();
        let id = ScopeId::new();
        cache.open(id);
        cache.close(id);
        assert!(matches!(cache.get(id, "a"), Err(ScopeError::NotOpen(_))));
    }

    #[test]
    fn test_put_if_absent() {
        let cache = RequestScopedCache::new();
        let id = ScopeId::new();
        cache.open(id);

        let stored = cache.put_if_absent(id, "a", value(1)).unwrap();
        assert_eq!(as_u32(stored), 1);
        // The existing value wins.
        let stored = cache.put_if_absent(id, "a", value(2)).unwrap();
        assert_eq!(as_u32(stored), 1);
    }

    #[test]
    fn test_guard_closes_on_drop() {
        let cache = Arc::new(RequestScopedCache::new());
        let id = {
            let guard = cache.open_guarded();
            cache.put(guard.id(), "a", value(1)).unwrap();
            guard.id()
        };
        assert!(matches!(cache.get(id, "a"), Err(ScopeError::NotOpen(_))));
    }

    #[test]
    fn test_reused_context_sees_no_stale_entries() {
        // A new request on the same worker gets a new ScopeId, so nothing
        // from the previous request is visible.
        let cache = Arc::new(RequestScopedCache::new());
        {
            let guard = cache.open_guarded();
            cache.put(guard.id(), "request-id", value(7)).unwrap();
        }
        let guard = cache.open_guarded();
        assert!(cache.get(guard.id(), "request-id").unwrap().is_none());
    }
}
