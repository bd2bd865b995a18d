//! Single-item and batch primitives for one backend.
//!
//! Composes the [`ConnectionManager`], a [`QueryTranslator`] and the
//! [`ConcurrencyController`]. Every logical operation leases one session,
//! runs its statements on it and releases it; transient failures rerun the
//! whole operation on a fresh session under the pool's retry policy.
//!
//! Conditional writes read the current etag on the same session that then
//! issues the write. The read and the write are not one transaction.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::debug;

use crate::context::OpContext;
use crate::error::{StoreError, StoreResult};
use crate::etag::{ConcurrencyController, EtagCheck};
use crate::pool::{ConnectionManager, SessionHandle};
use crate::statement::{Batch, Statement};
use crate::translate::QueryTranslator;
use crate::types::{DeleteRequest, SetRequest, StateEntry};

/// Single-key operations.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Read one key; `None` when absent.
    async fn get(&self, ctx: &OpContext, key: &str) -> StoreResult<Option<StateEntry>>;

    /// Write one key and return its new etag.
    async fn set(&self, ctx: &OpContext, request: &SetRequest) -> StoreResult<String>;

    async fn delete(&self, ctx: &OpContext, request: &DeleteRequest) -> StoreResult<()>;
}

/// Multi-key operations shipped as one backend round trip.
///
/// Batches cannot validate etags; conditional requests must go through
/// [`ItemStore`].
#[async_trait]
pub trait BatchStore: ItemStore {
    /// Rows for the keys that exist, in backend order.
    async fn batch_get(&self, ctx: &OpContext, keys: &[String]) -> StoreResult<Vec<StateEntry>>;

    async fn batch_set(&self, ctx: &OpContext, requests: &[SetRequest]) -> StoreResult<()>;

    async fn batch_delete(&self, ctx: &OpContext, keys: &[String]) -> StoreResult<()>;
}

/// One scanned page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub entries: Vec<StateEntry>,
    /// More rows existed past the requested limit.
    pub truncated: bool,
}

#[derive(Debug)]
pub struct BackendStore {
    manager: Arc<ConnectionManager>,
    translator: Box<dyn QueryTranslator>,
    etags: ConcurrencyController,
}

impl BackendStore {
    pub fn new(manager: Arc<ConnectionManager>, translator: Box<dyn QueryTranslator>) -> Self {
        Self {
            manager,
            translator,
            etags: ConcurrencyController::new(),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn translator(&self) -> &dyn QueryTranslator {
        self.translator.as_ref()
    }

    /// Lease a session (probe included) and hand it straight back.
    pub async fn ping(&self, ctx: &OpContext) -> StoreResult<()> {
        let handle = self.manager.acquire(ctx).await?;
        self.manager.release(handle).await;
        Ok(())
    }

    /// Read up to `limit` rows, noting whether more exist.
    pub async fn scan(&self, ctx: &OpContext, limit: usize) -> StoreResult<ScanPage> {
        let statement = self.translator.scan(limit.saturating_add(1))?;
        let mut entries = self
            .manager
            .with_retry(ctx, "scan", || self.fetch(ctx, &statement))
            .await?;
        let truncated = entries.len() > limit;
        entries.truncate(limit);
        debug!(rows = entries.len(), truncated, "scan complete");
        Ok(ScanPage { entries, truncated })
    }

    // ── single attempts ────────────────────────────────────────────

    /// Lookup on a leased session, trying the fallback form on a miss.
    async fn read(
        &self,
        ctx: &OpContext,
        handle: &mut SessionHandle,
        key: &str,
        statement: &Statement,
    ) -> StoreResult<Option<StateEntry>> {
        let rows = handle.execute(ctx, statement).await?;
        if let Some(row) = rows.rows.first() {
            return self.translator.decode(row).map(Some);
        }
        let Some(fallback) = self.translator.get_fallback(key)? else {
            return Ok(None);
        };
        debug!(key, "primary lookup empty, trying fallback");
        let rows = handle.execute(ctx, &fallback).await?;
        rows.rows
            .first()
            .map(|row| self.translator.decode(row))
            .transpose()
    }

    async fn get_once(&self, ctx: &OpContext, key: &str, statement: &Statement) -> StoreResult<Option<StateEntry>> {
        let mut handle = self.manager.try_acquire(ctx).await?;
        let result = self.read(ctx, &mut handle, key, statement).await;
        self.manager.release(handle).await;
        result
    }

    async fn set_once(
        &self,
        ctx: &OpContext,
        entry: &StateEntry,
        expected: Option<&str>,
        write: &Statement,
    ) -> StoreResult<()> {
        let mut handle = self.manager.try_acquire(ctx).await?;
        let result = async {
            if let Some(expected) = expected {
                let lookup = self.translator.get(&entry.key)?;
                let current = self.read(ctx, &mut handle, &entry.key, &lookup).await?;
                let current = current.as_ref().map(|e| e.etag.as_str());
                if current == Some(entry.etag.as_str()) {
                    // An earlier attempt landed before its reply was lost.
                    debug!(key = %entry.key, "write already applied");
                    return Ok(());
                }
                self.etags
                    .validate(&entry.key, expected, current)
                    .into_result(&entry.key, expected)?;
            }
            handle.execute(ctx, write).await.map(|_| ())
        }
        .await;
        self.manager.release(handle).await;
        result
    }

    async fn delete_once(
        &self,
        ctx: &OpContext,
        key: &str,
        expected: Option<&str>,
        write: &Statement,
    ) -> StoreResult<()> {
        let mut handle = self.manager.try_acquire(ctx).await?;
        let result = async {
            if let Some(expected) = expected {
                let lookup = self.translator.get(key)?;
                let current = self.read(ctx, &mut handle, key, &lookup).await?;
                let check = self
                    .etags
                    .validate(key, expected, current.as_ref().map(|e| e.etag.as_str()))
                    .into_result(key, expected)?;
                if check == EtagCheck::NotFound {
                    debug!(key, "conditional delete of absent key");
                    return Ok(());
                }
            }
            handle.execute(ctx, write).await.map(|_| ())
        }
        .await;
        self.manager.release(handle).await;
        result
    }

    async fn fetch(&self, ctx: &OpContext, statement: &Statement) -> StoreResult<Vec<StateEntry>> {
        let mut handle = self.manager.try_acquire(ctx).await?;
        let result = handle.execute(ctx, statement).await;
        self.manager.release(handle).await;
        result?
            .rows
            .iter()
            .map(|row| self.translator.decode(row))
            .collect()
    }

    async fn apply_once(&self, ctx: &OpContext, batch: &Batch) -> StoreResult<()> {
        let mut handle = self.manager.try_acquire(ctx).await?;
        let result = match batch {
            Batch::Single(statement) => handle.execute(ctx, statement).await.map(|_| ()),
            Batch::Logged(statements) => handle.execute_batch(ctx, statements).await,
        };
        self.manager.release(handle).await;
        result
    }

    fn entry_for(&self, request: &SetRequest) -> StateEntry {
        StateEntry {
            key: request.key.clone(),
            data: request.data.clone(),
            etag: self.etags.stamp(&request.key),
            last_modified: SystemTime::now(),
        }
    }
}

#[async_trait]
impl ItemStore for BackendStore {
    async fn get(&self, ctx: &OpContext, key: &str) -> StoreResult<Option<StateEntry>> {
        let statement = self.translator.get(key)?;
        let entry = self
            .manager
            .with_retry(ctx, "get", || self.get_once(ctx, key, &statement))
            .await
            .map_err(|e| e.context("get", key))?;
        debug!(key, found = entry.is_some(), "get");
        Ok(entry)
    }

    async fn set(&self, ctx: &OpContext, request: &SetRequest) -> StoreResult<String> {
        // The etag is stamped once so that a retried write is recognisable.
        let entry = self.entry_for(request);
        let write = self.translator.set(&entry)?;
        let expected = request.expected_etag();
        self.manager
            .with_retry(ctx, "set", || self.set_once(ctx, &entry, expected, &write))
            .await
            .map_err(|e| e.context("set", &request.key))?;
        debug!(key = %request.key, etag = %entry.etag, conditional = expected.is_some(), "set");
        Ok(entry.etag)
    }

    async fn delete(&self, ctx: &OpContext, request: &DeleteRequest) -> StoreResult<()> {
        let write = self.translator.delete(&request.key)?;
        let expected = request.expected_etag();
        self.manager
            .with_retry(ctx, "delete", || self.delete_once(ctx, &request.key, expected, &write))
            .await
            .map_err(|e| e.context("delete", &request.key))?;
        debug!(key = %request.key, conditional = expected.is_some(), "delete");
        Ok(())
    }
}

#[async_trait]
impl BatchStore for BackendStore {
    async fn batch_get(&self, ctx: &OpContext, keys: &[String]) -> StoreResult<Vec<StateEntry>> {
        let statement = self.translator.bulk_get(keys)?;
        let entries = self
            .manager
            .with_retry(ctx, "bulk-get", || self.fetch(ctx, &statement))
            .await?;
        debug!(requested = keys.len(), found = entries.len(), "batch get");
        Ok(entries)
    }

    async fn batch_set(&self, ctx: &OpContext, requests: &[SetRequest]) -> StoreResult<()> {
        if let Some(conditional) = requests.iter().find(|r| r.expected_etag().is_some()) {
            return Err(StoreError::Validation(format!(
                "batch write cannot check the etag of {:?}",
                conditional.key
            )));
        }
        let entries: Vec<StateEntry> = requests.iter().map(|r| self.entry_for(r)).collect();
        let batch = self.translator.bulk_set(&entries)?;
        self.manager
            .with_retry(ctx, "bulk-set", || self.apply_once(ctx, &batch))
            .await?;
        debug!(count = entries.len(), "batch set");
        Ok(())
    }

    async fn batch_delete(&self, ctx: &OpContext, keys: &[String]) -> StoreResult<()> {
        let batch = self.translator.bulk_delete(keys)?;
        self.manager
            .with_retry(ctx, "bulk-delete", || self.apply_once(ctx, &batch))
            .await?;
        debug!(count = keys.len(), "batch delete");
        Ok(())
    }
}
