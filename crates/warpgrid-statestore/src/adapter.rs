//! The public state store contract.
//!
//! ```text
//! Uninitialized ──init──▶ Initialized ──close──▶ Closed
//!       └────────────────────close───────────────▲
//! ```
//!
//! Data operations hold a read guard on the lifecycle for their whole
//! duration; `init` and `close` take the write guard, so `close` waits for
//! in-flight operations to finish before tearing the pool down.
//! Waiting for either guard is bounded by the caller's [`OpContext`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::bulk::BulkCoordinator;
use crate::config::{BackendKind, StoreConfig};
use crate::context::OpContext;
use crate::error::{StoreError, StoreResult};
use crate::pool::{ConnectionManager, PoolStats, SessionFactory, Target};
use crate::retry::{JitterSource, OsJitter, QuadraticBackoff, RetryPolicy};
use crate::store::{BackendStore, ItemStore};
use crate::translate;
use crate::types::{
    BulkGetItem, DeleteRequest, Feature, GetRequest, GetResponse, QueryItem, QueryRequest,
    QueryResponse, SetRequest,
};

const FEATURES: &[Feature] = &[Feature::ETag, Feature::BulkFallback, Feature::Query];

/// Everything that exists only while the adapter is initialized.
struct Engine {
    config: StoreConfig,
    store: Arc<BackendStore>,
    bulk: BulkCoordinator<BackendStore>,
    shutdown: CancellationToken,
    maintenance: Option<JoinHandle<()>>,
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum Lifecycle {
    Uninitialized,
    Ready(Engine),
    Closed,
}

impl Lifecycle {
    fn engine(&self) -> StoreResult<&Engine> {
        match self {
            Lifecycle::Ready(engine) => Ok(engine),
            Lifecycle::Uninitialized => Err(StoreError::Uninitialized),
            Lifecycle::Closed => Err(StoreError::Closed),
        }
    }
}

/// A state store over one graph or column backend.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct StateStoreAdapter {
    kind: BackendKind,
    factory: Arc<dyn SessionFactory>,
    jitter: Arc<dyn JitterSource>,
    span: Span,
    state: RwLock<Lifecycle>,
}

impl StateStoreAdapter {
    pub fn new(kind: BackendKind, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            kind,
            factory,
            jitter: Arc::new(OsJitter),
            span: info_span!("statestore", backend = %kind, namespace = tracing::field::Empty),
            state: RwLock::new(Lifecycle::Uninitialized),
        }
    }

    /// Use `span` as the parent of every event this adapter emits.
    ///
    /// A `namespace` field on the span, if declared, is filled in by `init`.
    pub fn with_span(self, span: Span) -> Self {
        Self { span, ..self }
    }

    /// Replace the random source behind retry jitter.
    pub fn with_jitter(self, jitter: Arc<dyn JitterSource>) -> Self {
        Self { jitter, ..self }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn features(&self) -> &'static [Feature] {
        FEATURES
    }

    /// Parse `metadata`, create the namespace and warm the pool.
    ///
    /// On failure the adapter stays uninitialized and may be initialized again.
    pub async fn init(&self, ctx: &OpContext, metadata: &HashMap<String, String>) -> StoreResult<()> {
        let config = StoreConfig::from_metadata(self.kind, metadata)?;
        self.init_with_config(ctx, config).await
    }

    /// Initialize from an already parsed config (e.g. from TOML).
    pub async fn init_with_config(&self, ctx: &OpContext, config: StoreConfig) -> StoreResult<()> {
        if config.kind != self.kind {
            return Err(StoreError::Config(format!(
                "config is for a {} backend, adapter is {}",
                config.kind, self.kind
            )));
        }
        let mut state = ctx.run(async { Ok(self.state.write().await) }).await?;
        match *state {
            Lifecycle::Ready(_) => return Err(StoreError::AlreadyInitialized),
            Lifecycle::Closed => return Err(StoreError::Closed),
            Lifecycle::Uninitialized => {}
        }
        self.span.record("namespace", config.namespace.as_str());
        let engine = self.start(ctx, config).instrument(self.span.clone()).await?;
        *state = Lifecycle::Ready(engine);
        Ok(())
    }

    /// Wait for the lifecycle read guard, giving up when `ctx` ends.
    async fn read_state(&self, ctx: &OpContext) -> StoreResult<RwLockReadGuard<'_, Lifecycle>> {
        ctx.run(async { Ok(self.state.read().await) }).await
    }

    async fn start(&self, ctx: &OpContext, config: StoreConfig) -> StoreResult<Engine> {
        let translator = translate::for_config(&config);
        let target = Target {
            hosts: config.hosts.clone(),
            credentials: config.credentials.clone(),
            probe: translator.probe(),
            session_init: translator.session_init(),
        };
        let retry = RetryPolicy::new(
            config.retry.max_attempts,
            Arc::new(QuadraticBackoff::new(config.retry.base_delay, Arc::clone(&self.jitter))),
        );
        let manager = Arc::new(ConnectionManager::new(
            config.pool.clone(),
            retry,
            target,
            Arc::clone(&self.factory),
        ));

        let ready = async {
            manager.bootstrap(ctx, &translator.bootstrap()).await?;
            manager.warm(ctx).await
        }
        .await;
        if let Err(e) = ready {
            warn!(error = %e, "state store init failed");
            manager.close().await;
            return Err(e);
        }

        let shutdown = CancellationToken::new();
        let maintenance = manager.spawn_maintenance(shutdown.clone());
        let store = Arc::new(BackendStore::new(manager, translator));
        let bulk = BulkCoordinator::new(Arc::clone(&store), config.bulk_threshold);
        info!(
            namespace = %config.namespace,
            table = %config.table,
            hosts = config.hosts.len(),
            bulk_threshold = config.bulk_threshold,
            "state store initialized"
        );
        Ok(Engine {
            config,
            store,
            bulk,
            shutdown,
            maintenance: Some(maintenance),
        })
    }

    pub async fn get(&self, ctx: &OpContext, request: &GetRequest) -> StoreResult<GetResponse> {
        require_key(&request.key)?;
        async {
            let state = self.read_state(ctx).await?;
            let engine = state.engine()?;
            let entry = engine.store.get(ctx, &request.key).await?;
            Ok(entry.map(GetResponse::from).unwrap_or_default())
        }
        .instrument(self.span.clone())
        .await
    }

    /// Write one key; returns the new etag.
    pub async fn set(&self, ctx: &OpContext, request: &SetRequest) -> StoreResult<String> {
        require_key(&request.key)?;
        async {
            let state = self.read_state(ctx).await?;
            let engine = state.engine()?;
            engine.store.set(ctx, request).await
        }
        .instrument(self.span.clone())
        .await
    }

    pub async fn delete(&self, ctx: &OpContext, request: &DeleteRequest) -> StoreResult<()> {
        require_key(&request.key)?;
        async {
            let state = self.read_state(ctx).await?;
            let engine = state.engine()?;
            engine.store.delete(ctx, request).await
        }
        .instrument(self.span.clone())
        .await
    }

    pub async fn bulk_get(&self, ctx: &OpContext, keys: &[String]) -> StoreResult<Vec<BulkGetItem>> {
        keys.iter().try_for_each(|k| require_key(k))?;
        async {
            let state = self.read_state(ctx).await?;
            let engine = state.engine()?;
            engine.bulk.bulk_get(ctx, keys).await
        }
        .instrument(self.span.clone())
        .await
    }

    pub async fn bulk_set(&self, ctx: &OpContext, requests: &[SetRequest]) -> StoreResult<()> {
        requests.iter().try_for_each(|r| require_key(&r.key))?;
        async {
            let state = self.read_state(ctx).await?;
            let engine = state.engine()?;
            engine.bulk.bulk_set(ctx, requests).await
        }
        .instrument(self.span.clone())
        .await
    }

    pub async fn bulk_delete(&self, ctx: &OpContext, requests: &[DeleteRequest]) -> StoreResult<()> {
        requests.iter().try_for_each(|r| require_key(&r.key))?;
        async {
            let state = self.read_state(ctx).await?;
            let engine = state.engine()?;
            engine.bulk.bulk_delete(ctx, requests).await
        }
        .instrument(self.span.clone())
        .await
    }

    /// Return up to one page of entries, optionally filtered by key prefix.
    ///
    /// The filter runs over the scanned page, so a filtered response may
    /// hold fewer rows than the limit while `truncated` is still set.
    pub async fn query(&self, ctx: &OpContext, request: &QueryRequest) -> StoreResult<QueryResponse> {
        async {
            let state = self.read_state(ctx).await?;
            let engine = state.engine()?;
            let page = engine.store.scan(ctx, request.effective_limit()).await?;
            let results: Vec<QueryItem> = page
                .entries
                .into_iter()
                .filter(|e| request.filter.as_ref().is_none_or(|f| f.matches(&e.key)))
                .map(|e| QueryItem {
                    key: e.key,
                    data: e.data,
                    etag: e.etag,
                })
                .collect();
            debug!(results = results.len(), truncated = page.truncated, "query");
            Ok(QueryResponse {
                results,
                truncated: page.truncated,
            })
        }
        .instrument(self.span.clone())
        .await
    }

    /// Check that a healthy session can be leased.
    pub async fn ping(&self, ctx: &OpContext) -> StoreResult<()> {
        async {
            let state = self.read_state(ctx).await?;
            state.engine()?.store.ping(ctx).await
        }
        .instrument(self.span.clone())
        .await
    }

    pub async fn pool_stats(&self) -> StoreResult<PoolStats> {
        let state = self.state.read().await;
        Ok(state.engine()?.store.manager().stats())
    }

    /// The config the adapter was initialized with.
    pub async fn config(&self) -> StoreResult<StoreConfig> {
        let state = self.state.read().await;
        Ok(state.engine()?.config.clone())
    }

    /// Release every backend resource. Idempotent.
    pub async fn close(&self) -> StoreResult<()> {
        async {
            let mut state = self.state.write().await;
            let previous = std::mem::replace(&mut *state, Lifecycle::Closed);
            let Lifecycle::Ready(mut engine) = previous else {
                debug!("close on a store that is not running");
                return Ok(());
            };
            engine.shutdown.cancel();
            if let Some(task) = engine.maintenance.take() {
                if let Err(e) = task.await {
                    warn!(error = %e, "pool maintenance task ended abnormally");
                }
            }
            let manager = engine.store.manager();
            manager.log_stats();
            manager.close().await;
            info!("state store closed");
            Ok(())
        }
        .instrument(self.span.clone())
        .await
    }
}

impl std::fmt::Debug for StateStoreAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStoreAdapter")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

fn require_key(key: &str) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::Validation("key must not be empty".to_string()));
    }
    Ok(())
}
