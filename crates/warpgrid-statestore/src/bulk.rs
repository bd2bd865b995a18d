//! Bulk operations: threshold policy, batch attempt, sequential fallback.
//!
//! ```text
//! bulk op (n items)
//!   → n <= threshold         → one individual op per item, in order
//!   → otherwise              → one batch
//!       → batch fails        → warn, one individual op per item, in order
//! ```
//!
//! Writes keep input order: each run of consecutive unconditional items is
//! batched, and conditional writes (non-empty etag) go individually where
//! they fall. A failed batch may have been partly applied; replaying its
//! items individually is safe because upserts and deletes are idempotent
//! per key.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::DEFAULT_BULK_THRESHOLD;
use crate::context::OpContext;
use crate::error::StoreResult;
use crate::store::BatchStore;
use crate::types::{BulkGetItem, DeleteRequest, GetResponse, SetRequest};

#[derive(Debug)]
pub struct BulkCoordinator<S: ?Sized> {
    store: Arc<S>,
    threshold: usize,
}

impl<S: BatchStore + ?Sized> BulkCoordinator<S> {
    pub fn new(store: Arc<S>, threshold: usize) -> Self {
        Self { store, threshold }
    }

    pub fn with_default_threshold(store: Arc<S>) -> Self {
        Self::new(store, DEFAULT_BULK_THRESHOLD)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Read every key, one result per input key in input order.
    ///
    /// Absent keys yield an empty item. On the individual path a key that
    /// fails to read records its error on its item; cancellation still
    /// aborts the whole call.
    pub async fn bulk_get(&self, ctx: &OpContext, keys: &[String]) -> StoreResult<Vec<BulkGetItem>> {
        if keys.len() <= self.threshold {
            return self.get_each(ctx, keys).await;
        }
        match self.store.batch_get(ctx, keys).await {
            Ok(entries) => {
                let found: HashMap<String, GetResponse> = entries
                    .into_iter()
                    .map(|e| (e.key.clone(), GetResponse::from(e)))
                    .collect();
                debug!(requested = keys.len(), found = found.len(), "bulk get batched");
                Ok(keys
                    .iter()
                    .map(|key| match found.get(key) {
                        Some(resp) => BulkGetItem::from_response(key, resp.clone()),
                        None => BulkGetItem::empty(key),
                    })
                    .collect())
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(op = "bulk-get", count = keys.len(), error = %e, "batch failed, falling back to individual reads");
                self.get_each(ctx, keys).await
            }
        }
    }

    /// Write every request in input order. Stops at the first failure,
    /// leaving earlier items applied.
    pub async fn bulk_set(&self, ctx: &OpContext, requests: &[SetRequest]) -> StoreResult<()> {
        if requests.len() <= self.threshold {
            return self.set_each(ctx, requests).await;
        }
        for run in runs(requests, |r| r.expected_etag().is_some()) {
            match run {
                Run::One(request) => {
                    ctx.check()?;
                    self.store.set(ctx, request).await?;
                }
                Run::Batch(batch) => match self.store.batch_set(ctx, batch).await {
                    Ok(()) => debug!(count = batch.len(), "bulk set batched"),
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!(op = "bulk-set", count = batch.len(), error = %e, "batch failed, falling back to individual writes");
                        self.set_each(ctx, batch).await?;
                    }
                },
            }
        }
        Ok(())
    }

    /// Delete every request in input order. Stops at the first failure,
    /// leaving earlier items applied.
    pub async fn bulk_delete(&self, ctx: &OpContext, requests: &[DeleteRequest]) -> StoreResult<()> {
        if requests.len() <= self.threshold {
            return self.delete_each(ctx, requests).await;
        }
        for run in runs(requests, |r| r.expected_etag().is_some()) {
            match run {
                Run::One(request) => {
                    ctx.check()?;
                    self.store.delete(ctx, request).await?;
                }
                Run::Batch(batch) => {
                    let keys: Vec<String> = batch.iter().map(|r| r.key.clone()).collect();
                    match self.store.batch_delete(ctx, &keys).await {
                        Ok(()) => debug!(count = keys.len(), "bulk delete batched"),
                        Err(e) if e.is_cancelled() => return Err(e),
                        Err(e) => {
                            warn!(op = "bulk-delete", count = keys.len(), error = %e, "batch failed, falling back to individual deletes");
                            self.delete_each(ctx, batch).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn get_each(&self, ctx: &OpContext, keys: &[String]) -> StoreResult<Vec<BulkGetItem>> {
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            ctx.check()?;
            let item = match self.store.get(ctx, key).await {
                Ok(Some(entry)) => BulkGetItem::from_response(key, entry.into()),
                Ok(None) => BulkGetItem::empty(key),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    debug!(key = %key, error = %e, "bulk get item failed");
                    BulkGetItem::failed(key, e.to_string())
                }
            };
            items.push(item);
        }
        Ok(items)
    }

    async fn set_each(&self, ctx: &OpContext, requests: &[SetRequest]) -> StoreResult<()> {
        for request in requests {
            ctx.check()?;
            self.store.set(ctx, request).await?;
        }
        Ok(())
    }

    async fn delete_each(&self, ctx: &OpContext, requests: &[DeleteRequest]) -> StoreResult<()> {
        for request in requests {
            ctx.check()?;
            self.store.delete(ctx, request).await?;
        }
        Ok(())
    }
}

/// A step of an ordered bulk write.
#[derive(Debug)]
enum Run<'a, T> {
    /// Conditional items, and plain items standing alone.
    One(&'a T),
    /// Two or more consecutive plain items.
    Batch(&'a [T]),
}

/// Split `items` into ordered steps, batching consecutive items that are
/// not `conditional`.
fn runs<T>(items: &[T], conditional: impl Fn(&T) -> bool) -> Vec<Run<'_, T>> {
    let mut steps = Vec::new();
    let mut start = 0;
    while start < items.len() {
        if conditional(&items[start]) {
            steps.push(Run::One(&items[start]));
            start += 1;
            continue;
        }
        let end = items[start..]
            .iter()
            .position(&conditional)
            .map_or(items.len(), |offset| start + offset);
        match &items[start..end] {
            [single] => steps.push(Run::One(single)),
            run => steps.push(Run::Batch(run)),
        }
        start = end;
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::ItemStore;
    use crate::types::StateEntry;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::SystemTime;

    #[derive(Default)]
    struct MemStore {
        rows: Mutex<HashMap<String, StateEntry>>,
        batch_fails: AtomicBool,
        batch_calls: AtomicU32,
        item_calls: AtomicU32,
        /// Keys whose individual operations fail permanently.
        poisoned: Mutex<Vec<String>>,
    }

    impl MemStore {
        fn seeded(keys: &[&str]) -> Self {
            let store = Self::default();
            for key in keys {
                store.put(key, key.as_bytes());
            }
            store
        }

        fn put(&self, key: &str, data: &[u8]) {
            self.rows.lock().unwrap().insert(
                key.to_string(),
                StateEntry {
                    key: key.to_string(),
                    data: data.to_vec(),
                    etag: format!("etag-{key}"),
                    last_modified: SystemTime::now(),
                },
            );
        }

        fn item(&self, key: &str) -> StoreResult<()> {
            self.item_calls.fetch_add(1, Ordering::Relaxed);
            if self.poisoned.lock().unwrap().iter().any(|k| k == key) {
                return Err(StoreError::Backend(format!("poisoned {key}")));
            }
            Ok(())
        }

        fn batch(&self) -> StoreResult<()> {
            self.batch_calls.fetch_add(1, Ordering::Relaxed);
            if self.batch_fails.load(Ordering::Relaxed) {
                return Err(StoreError::Backend("batch too large".into()));
            }
            Ok(())
        }

        fn keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self.rows.lock().unwrap().keys().cloned().collect();
            keys.sort();
            keys
        }
    }

    #[async_trait]
    impl ItemStore for MemStore {
        async fn get(&self, _ctx: &OpContext, key: &str) -> StoreResult<Option<StateEntry>> {
            self.item(key)?;
            Ok(self.rows.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, _ctx: &OpContext, request: &SetRequest) -> StoreResult<String> {
            self.item(&request.key)?;
            if let Some(expected) = request.expected_etag() {
                let current = self.rows.lock().unwrap().get(&request.key).map(|e| e.etag.clone());
                if let Some(actual) = current.filter(|a| a != expected) {
                    return Err(StoreError::EtagMismatch {
                        key: request.key.clone(),
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
            self.put(&request.key, &request.data);
            Ok(format!("etag-{}", request.key))
        }

        async fn delete(&self, _ctx: &OpContext, request: &DeleteRequest) -> StoreResult<()> {
            self.item(&request.key)?;
            self.rows.lock().unwrap().remove(&request.key);
            Ok(())
        }
    }

    #[async_trait]
    impl BatchStore for MemStore {
        async fn batch_get(&self, _ctx: &OpContext, keys: &[String]) -> StoreResult<Vec<StateEntry>> {
            self.batch()?;
            let rows = self.rows.lock().unwrap();
            // Reverse order: callers must not rely on backend order.
            Ok(keys.iter().rev().filter_map(|k| rows.get(k).cloned()).collect())
        }

        async fn batch_set(&self, _ctx: &OpContext, requests: &[SetRequest]) -> StoreResult<()> {
            self.batch()?;
            for r in requests {
                self.put(&r.key, &r.data);
            }
            Ok(())
        }

        async fn batch_delete(&self, _ctx: &OpContext, keys: &[String]) -> StoreResult<()> {
            self.batch()?;
            let mut rows = self.rows.lock().unwrap();
            for k in keys {
                rows.remove(k);
            }
            Ok(())
        }
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    fn sets(list: &[&str]) -> Vec<SetRequest> {
        list.iter().map(|k| SetRequest::new(*k, k.as_bytes().to_vec())).collect()
    }

    fn coordinator(store: MemStore) -> (BulkCoordinator<MemStore>, Arc<MemStore>) {
        let store = Arc::new(store);
        (BulkCoordinator::new(Arc::clone(&store), 5), store)
    }

    #[tokio::test]
    async fn small_bulk_get_goes_individually_and_keeps_order() {
        let (bulk, store) = coordinator(MemStore::seeded(&["a", "c"]));
        let items = bulk
            .bulk_get(&OpContext::background(), &keys(&["c", "b", "a"]))
            .await
            .unwrap();
        assert_eq!(items.iter().map(|i| i.key.as_str()).collect::<Vec<_>>(), ["c", "b", "a"]);
        assert!(items[0].found());
        assert!(!items[1].found());
        assert_eq!(items[2].data, b"a");
        assert_eq!(store.batch_calls.load(Ordering::Relaxed), 0);
        assert_eq!(store.item_calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn large_bulk_get_batches_in_input_order() {
        let (bulk, store) = coordinator(MemStore::seeded(&["k1", "k3", "k5"]));
        let input = keys(&["k1", "k2", "k3", "k4", "k5", "k6"]);
        let items = bulk.bulk_get(&OpContext::background(), &input).await.unwrap();
        let found: Vec<bool> = items.iter().map(BulkGetItem::found).collect();
        assert_eq!(found, [true, false, true, false, true, false]);
        assert_eq!(items[2].data, b"k3");
        assert_eq!(store.batch_calls.load(Ordering::Relaxed), 1);
        assert_eq!(store.item_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn repeated_keys_each_get_the_row() {
        let (bulk, _) = coordinator(MemStore::seeded(&["a"]));
        let input = keys(&["a", "a", "x", "y", "z", "a"]);
        let items = bulk.bulk_get(&OpContext::background(), &input).await.unwrap();
        assert!(items[0].found() && items[1].found() && items[5].found());
    }

    #[tokio::test]
    async fn failed_batch_get_falls_back_with_per_key_errors() {
        let store = MemStore::seeded(&["k1", "k2", "k3", "k4", "k5", "k6"]);
        store.batch_fails.store(true, Ordering::Relaxed);
        store.poisoned.lock().unwrap().push("k4".into());
        let (bulk, store) = coordinator(store);

        let input = keys(&["k1", "k2", "k3", "k4", "k5", "k6"]);
        let items = bulk.bulk_get(&OpContext::background(), &input).await.unwrap();
        assert_eq!(items.len(), 6);
        assert!(items[3].error.as_deref().unwrap().contains("poisoned"));
        assert!(items.iter().enumerate().all(|(i, it)| i == 3 || it.found()));
        assert_eq!(store.batch_calls.load(Ordering::Relaxed), 1);
        assert_eq!(store.item_calls.load(Ordering::Relaxed), 6);
    }

    #[tokio::test]
    async fn threshold_is_inclusive() {
        let (bulk, store) = coordinator(MemStore::default());
        bulk.bulk_set(&OpContext::background(), &sets(&["a", "b", "c", "d", "e"]))
            .await
            .unwrap();
        assert_eq!(store.batch_calls.load(Ordering::Relaxed), 0);
        assert_eq!(store.item_calls.load(Ordering::Relaxed), 5);

        bulk.bulk_set(&OpContext::background(), &sets(&["a", "b", "c", "d", "e", "f"]))
            .await
            .unwrap();
        assert_eq!(store.batch_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn failed_batch_set_falls_back_to_same_final_state() {
        let store = MemStore::default();
        store.batch_fails.store(true, Ordering::Relaxed);
        let (bulk, store) = coordinator(store);
        let input = sets(&["a", "b", "c", "d", "e", "f", "g"]);
        bulk.bulk_set(&OpContext::background(), &input).await.unwrap();
        assert_eq!(store.keys(), keys(&["a", "b", "c", "d", "e", "f", "g"]));
        assert_eq!(store.item_calls.load(Ordering::Relaxed), 7);
    }

    #[tokio::test]
    async fn individual_writes_stop_at_first_error() {
        let store = MemStore::default();
        store.poisoned.lock().unwrap().push("b".into());
        let (bulk, store) = coordinator(store);
        let err = bulk
            .bulk_set(&OpContext::background(), &sets(&["a", "b", "c"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("poisoned b"));
        assert_eq!(store.keys(), keys(&["a"]));
    }

    #[tokio::test]
    async fn conditional_items_skip_the_batch() {
        let (bulk, store) = coordinator(MemStore::seeded(&["z"]));
        let mut input = sets(&["a", "b", "c", "d", "e", "f"]);
        input.push(SetRequest::new("z", b"new".to_vec()).with_etag("etag-z"));
        bulk.bulk_set(&OpContext::background(), &input).await.unwrap();
        assert_eq!(store.batch_calls.load(Ordering::Relaxed), 1);
        assert_eq!(store.item_calls.load(Ordering::Relaxed), 1);

        let stale = vec![SetRequest::new("z", b"x".to_vec()).with_etag("old")];
        let err = bulk.bulk_set(&OpContext::background(), &stale).await.unwrap_err();
        assert!(err.is_etag_mismatch());
    }

    #[tokio::test]
    async fn stale_conditional_item_stops_later_writes() {
        let (bulk, store) = coordinator(MemStore::seeded(&["z"]));
        let mut input = vec![SetRequest::new("z", b"x".to_vec()).with_etag("old")];
        input.extend(sets(&["a", "b", "c", "d", "e", "f"]));
        let err = bulk.bulk_set(&OpContext::background(), &input).await.unwrap_err();
        assert!(err.is_etag_mismatch());
        assert_eq!(store.keys(), keys(&["z"]));
        assert_eq!(store.batch_calls.load(Ordering::Relaxed), 0);

        let small = vec![
            SetRequest::new("z", b"x".to_vec()).with_etag("old"),
            SetRequest::new("a", b"1".to_vec()),
        ];
        assert!(bulk.bulk_set(&OpContext::background(), &small).await.is_err());
        assert_eq!(store.keys(), keys(&["z"]));
    }

    #[tokio::test]
    async fn mixed_writes_batch_each_plain_run_in_order() {
        let (bulk, store) = coordinator(MemStore::seeded(&["z"]));
        let mut input = sets(&["a", "b", "c"]);
        input.push(SetRequest::new("z", b"new".to_vec()).with_etag("etag-z"));
        input.extend(sets(&["d", "e", "f"]));
        bulk.bulk_set(&OpContext::background(), &input).await.unwrap();
        assert_eq!(store.batch_calls.load(Ordering::Relaxed), 2);
        assert_eq!(store.item_calls.load(Ordering::Relaxed), 1);
        assert_eq!(store.keys(), keys(&["a", "b", "c", "d", "e", "f", "z"]));
        assert_eq!(store.rows.lock().unwrap()["z"].data, b"new");
    }

    #[tokio::test]
    async fn mixed_deletes_keep_input_order() {
        let (bulk, store) = coordinator(MemStore::seeded(&["a", "b", "c", "d", "e", "f", "keep"]));
        let mut input: Vec<DeleteRequest> = ["a", "b", "c"].iter().map(|k| DeleteRequest::new(*k)).collect();
        input.push(DeleteRequest::new("d").with_etag("etag-d"));
        input.extend(["e", "f"].iter().map(|k| DeleteRequest::new(*k)));
        bulk.bulk_delete(&OpContext::background(), &input).await.unwrap();
        assert_eq!(store.keys(), keys(&["keep"]));
        assert_eq!(store.batch_calls.load(Ordering::Relaxed), 2);
        assert_eq!(store.item_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn runs_split_on_conditional_items() {
        let items = [false, false, true, false, true, true, false, false, false];
        let steps = runs(&items, |c| *c);
        let shape: Vec<String> = steps
            .iter()
            .map(|step| match step {
                Run::One(c) => format!("one({c})"),
                Run::Batch(run) => format!("batch({})", run.len()),
            })
            .collect();
        assert_eq!(
            shape,
            ["batch(2)", "one(true)", "one(false)", "one(true)", "one(true)", "batch(3)"]
        );
    }

    #[tokio::test]
    async fn bulk_delete_batches_and_falls_back() {
        let store = MemStore::seeded(&["a", "b", "c", "d", "e", "f", "keep"]);
        store.batch_fails.store(true, Ordering::Relaxed);
        let (bulk, store) = coordinator(store);
        let input: Vec<DeleteRequest> = ["a", "b", "c", "d", "e", "f"]
            .iter()
            .map(|k| DeleteRequest::new(*k))
            .collect();
        bulk.bulk_delete(&OpContext::background(), &input).await.unwrap();
        assert_eq!(store.keys(), keys(&["keep"]));
        assert_eq!(store.batch_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cancelled_context_stops_individual_path() {
        let (bulk, store) = coordinator(MemStore::seeded(&["a"]));
        let ctx = OpContext::background();
        ctx.cancel();
        let err = bulk.bulk_get(&ctx, &keys(&["a", "b"])).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(store.item_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn empty_input_is_a_noop() {
        let (bulk, store) = coordinator(MemStore::default());
        let ctx = OpContext::background();
        assert!(bulk.bulk_get(&ctx, &[]).await.unwrap().is_empty());
        bulk.bulk_set(&ctx, &[]).await.unwrap();
        bulk.bulk_delete(&ctx, &[]).await.unwrap();
        assert_eq!(store.item_calls.load(Ordering::Relaxed), 0);
        assert_eq!(store.batch_calls.load(Ordering::Relaxed), 0);
    }
}
