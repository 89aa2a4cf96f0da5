//! The shared state behind the HTTP endpoints.
//!
//! A [`GatewayService`] owns one connection policy to the BES, the catalog
//! transaction cache with its background refresh task, the per-request scope
//! registry, and the deferred-response tracker. It is cheap to clone and is
//! handed to axum as router state.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use besgate_service::bes::{
    BesClient, BesCommand, BesError, PptClient, TransactionOutcome,
};
use besgate_service::caching::{CacheSettings, TransactionCache};
use besgate_service::config::Config;
use besgate_service::deferred::{
    AsyncCompletionTracker, DeferredOutcome, DeferredPolicy, DelaySignals,
};
use besgate_service::scope::{RequestScopedCache, ScopeGuard, ScopeId};

/// The key under which a request's canonical resource path is memoized in
/// its scope.
const SCOPE_KEY_RESOURCE: &str = "bes.resource";

/// The shared gateway state.
#[derive(Clone)]
pub struct GatewayService {
    inner: Arc<GatewayServiceInner>,
}

struct GatewayServiceInner {
    config: Config,
    bes: Arc<dyn BesClient>,
    catalog_cache: Arc<TransactionCache>,
    scopes: Arc<RequestScopedCache>,
    tracker: AsyncCompletionTracker,
    refresh_task: Option<JoinHandle<()>>,
}

impl GatewayService {
    /// Creates the service with a live PPT connection to the configured BES.
    pub fn create(config: Config) -> Result<Self> {
        let bes: Arc<dyn BesClient> = Arc::new(PptClient::new(&config.bes));
        Self::with_backend(config, bes)
    }

    /// Creates the service on top of an arbitrary backend.
    ///
    /// Tests use this to substitute a scripted backend for the PPT client.
    pub fn with_backend(config: Config, bes: Arc<dyn BesClient>) -> Result<Self> {
        let catalog_cache = Arc::new(TransactionCache::new());
        catalog_cache
            .configure(CacheSettings::from(config.catalog_cache))
            .context("invalid catalog cache configuration")?;
        let refresh_task = catalog_cache.spawn_refresh_task(Arc::clone(&bes));

        let tracker = AsyncCompletionTracker::new(DeferredPolicy::from(&config.deferred));

        Ok(GatewayService {
            inner: Arc::new(GatewayServiceInner {
                config,
                bes,
                catalog_cache,
                scopes: Arc::new(RequestScopedCache::new()),
                tracker,
                refresh_task,
            }),
        })
    }

    /// The loaded configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Opens a request scope that closes itself when the handler finishes.
    pub fn open_scope(&self) -> ScopeGuard {
        self.inner.scopes.open_guarded()
    }

    /// The canonical resource path for a raw request path, memoized per
    /// request so cooperating handlers agree on the identity they use for
    /// cache and tracker lookups.
    pub fn resolve_resource(&self, scope: ScopeId, raw_path: &str) -> Result<Arc<String>, BesError> {
        let cached = self
            .inner
            .scopes
            .get(scope, SCOPE_KEY_RESOURCE)
            .map_err(|e| BesError::Internal(e.to_string()))?;
        if let Some(value) = cached {
            if let Ok(resource) = value.downcast::<String>() {
                return Ok(resource);
            }
        }

        let resource: Arc<String> = Arc::new(format!("/{}", raw_path.trim_matches('/')));
        self.inner
            .scopes
            .put(scope, SCOPE_KEY_RESOURCE, resource.clone())
            .map_err(|e| BesError::Internal(e.to_string()))?;
        Ok(resource)
    }

    /// Serves a catalog listing for `resource`, from the transaction cache
    /// when possible.
    ///
    /// Backend-reported failures are cached like successes so repeated
    /// requests for a broken node do not hammer the BES; transport-level
    /// failures propagate without entering the cache.
    pub async fn catalog_node(&self, resource: &str) -> Result<TransactionOutcome, BesError> {
        if let Some(outcome) = self.inner.catalog_cache.get(resource).await {
            metric!(counter("catalog.cache.hit") += 1);
            return Ok(outcome);
        }
        metric!(counter("catalog.cache.miss") += 1);

        let command =
            BesCommand::show_node(resource).with_timeout(self.inner.config.bes.timeout);
        let outcome = match self.inner.bes.transaction(&command).await {
            Ok(payload) => TransactionOutcome::Success(payload),
            Err(error) if error.is_fatal() => return Err(error),
            Err(error @ (BesError::Connection(_) | BesError::Timeout(_))) => return Err(error),
            Err(error) => TransactionOutcome::BackendError(error),
        };

        self.inner
            .catalog_cache
            .put(resource, &command, outcome.clone())
            .await;
        Ok(outcome)
    }

    /// Runs the deferred-response decision table for a data request.
    pub async fn data_request(
        &self,
        resource_key: &str,
        command: &BesCommand,
        signals: &DelaySignals,
        poll_link: &str,
    ) -> Result<DeferredOutcome, BesError> {
        self.inner
            .tracker
            .evaluate(resource_key, command, signals, poll_link, &*self.inner.bes)
            .await
    }

    /// Stops the background refresh task and empties the catalog cache.
    pub async fn shutdown(&self) {
        self.inner.catalog_cache.shutdown().await;
        if let Some(task) = &self.inner.refresh_task {
            task.abort();
        }
        tracing::info!("gateway service shut down");
    }
}

impl std::fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayService").finish_non_exhaustive()
    }
}
