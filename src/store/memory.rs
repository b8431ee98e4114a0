//! In-memory reference implementation of [`Store`].
//!
//! Buckets are maps of record id → JSON object. Live queries are named
//! closures over the bucket set; every mutation bumps a dirty epoch and a
//! background revalidator re-runs all subscribed queries, pushing values
//! that changed. `settle` awaits the revalidator catching up to the epoch
//! observed at call time, which is what makes pushes observable
//! deterministically from tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::StoreError;
use crate::store::{PushSink, Store, SubscriptionGrant};

pub type Buckets = HashMap<String, BTreeMap<String, Value>>;

/// A named, re-evaluable query over the bucket set.
pub type QueryFn = Arc<dyn Fn(&Buckets, &Value) -> Value + Send + Sync>;

struct SubEntry {
    query: QueryFn,
    params: Value,
    sink: PushSink,
    last_value: Value,
}

struct StoreInner {
    buckets: RwLock<Buckets>,
    queries: RwLock<HashMap<String, QueryFn>>,
    subscriptions: Mutex<HashMap<String, SubEntry>>,
    next_record: AtomicU64,
    next_subscription: AtomicU64,
    dirty_epoch: AtomicU64,
    nudge: Notify,
    processed_tx: watch::Sender<u64>,
}

impl StoreInner {
    /// Re-run every subscribed query and push values that changed.
    fn revalidate(&self) {
        let buckets = self.buckets.read().expect("bucket lock poisoned");
        let mut subs = self.subscriptions.lock().expect("subscription lock poisoned");
        for (id, entry) in subs.iter_mut() {
            let value = (entry.query)(&buckets, &entry.params);
            if value != entry.last_value {
                trace!(subscription = %id, "query result changed");
                entry.last_value = value.clone();
                entry.sink.push(id, value);
            }
        }
    }
}

pub struct MemoryStore {
    inner: Arc<StoreInner>,
    processed_rx: watch::Receiver<u64>,
    revalidator: JoinHandle<()>,
}

impl MemoryStore {
    /// Create an empty store. Must be called inside a tokio runtime — the
    /// revalidator runs as a background task.
    pub fn new() -> Self {
        let (processed_tx, processed_rx) = watch::channel(0u64);
        let inner = Arc::new(StoreInner {
            buckets: RwLock::new(HashMap::new()),
            queries: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_record: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
            dirty_epoch: AtomicU64::new(0),
            nudge: Notify::new(),
            processed_tx,
        });

        let worker = inner.clone();
        let revalidator = tokio::spawn(async move {
            loop {
                worker.nudge.notified().await;
                loop {
                    let target = worker.dirty_epoch.load(Ordering::SeqCst);
                    worker.revalidate();
                    let _ = worker.processed_tx.send(target);
                    if worker.dirty_epoch.load(Ordering::SeqCst) == target {
                        break;
                    }
                }
            }
        });

        Self {
            inner,
            processed_rx,
            revalidator,
        }
    }

    /// Register a named query.
    pub fn define_query(
        &self,
        name: &str,
        query: impl Fn(&Buckets, &Value) -> Value + Send + Sync + 'static,
    ) {
        self.inner
            .queries
            .write()
            .expect("query lock poisoned")
            .insert(name.to_string(), Arc::new(query));
    }

    /// Register the common case: a query returning every record of one
    /// bucket as an array.
    pub fn define_bucket_query(&self, name: &str, bucket: &str) {
        let bucket = bucket.to_string();
        self.define_query(name, move |buckets, _params| bucket_all(buckets, &bucket));
    }

    fn mark_dirty(&self) {
        self.inner.dirty_epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.nudge.notify_one();
    }

    fn lookup_query(&self, name: &str) -> Result<QueryFn, StoreError> {
        self.inner
            .queries
            .read()
            .expect("query lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("unknown query: {name}")))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.revalidator.abort();
    }
}

/// Every record of one bucket as an array; empty for unknown buckets.
pub fn bucket_all(buckets: &Buckets, bucket: &str) -> Value {
    match buckets.get(bucket) {
        Some(records) => Value::Array(records.values().cloned().collect()),
        None => Value::Array(Vec::new()),
    }
}

fn str_field<'a>(fields: &'a Map<String, Value>, name: &str) -> Result<&'a str, StoreError> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Validation(format!("missing field: {name}")))
}

fn object_field(fields: &Map<String, Value>, name: &str) -> Result<Map<String, Value>, StoreError> {
    match fields.get(name) {
        Some(Value::Object(obj)) => Ok(obj.clone()),
        _ => Err(StoreError::Validation(format!(
            "missing or non-object field: {name}"
        ))),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn execute(
        &self,
        operation: &str,
        fields: &Map<String, Value>,
    ) -> Result<Value, StoreError> {
        match operation {
            "insert" => {
                let bucket = str_field(fields, "bucket")?;
                let mut record = object_field(fields, "data")?;
                let n = self.inner.next_record.fetch_add(1, Ordering::SeqCst);
                let id = format!("rec-{n:08}");
                record.insert("id".to_string(), Value::String(id.clone()));
                let record = Value::Object(record);
                self.inner
                    .buckets
                    .write()
                    .expect("bucket lock poisoned")
                    .entry(bucket.to_string())
                    .or_default()
                    .insert(id, record.clone());
                self.mark_dirty();
                Ok(record)
            }
            "update" => {
                let bucket = str_field(fields, "bucket")?;
                let id = str_field(fields, "id")?;
                let patch = object_field(fields, "data")?;
                let updated = {
                    let mut buckets = self.inner.buckets.write().expect("bucket lock poisoned");
                    let record = buckets
                        .get_mut(bucket)
                        .and_then(|records| records.get_mut(id))
                        .ok_or_else(|| {
                            StoreError::NotFound(format!("record not found: {bucket}/{id}"))
                        })?;
                    if let Value::Object(existing) = record {
                        for (k, v) in patch {
                            if k != "id" {
                                existing.insert(k, v);
                            }
                        }
                    }
                    record.clone()
                };
                self.mark_dirty();
                Ok(updated)
            }
            "delete" => {
                let bucket = str_field(fields, "bucket")?;
                let id = str_field(fields, "id")?;
                let removed = self
                    .inner
                    .buckets
                    .write()
                    .expect("bucket lock poisoned")
                    .get_mut(bucket)
                    .and_then(|records| records.remove(id));
                if removed.is_none() {
                    return Err(StoreError::NotFound(format!(
                        "record not found: {bucket}/{id}"
                    )));
                }
                self.mark_dirty();
                Ok(json!({ "deleted": true, "id": id }))
            }
            "get" => {
                let bucket = str_field(fields, "bucket")?;
                let id = str_field(fields, "id")?;
                self.inner
                    .buckets
                    .read()
                    .expect("bucket lock poisoned")
                    .get(bucket)
                    .and_then(|records| records.get(id))
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(format!("record not found: {bucket}/{id}")))
            }
            "all" => {
                let bucket = str_field(fields, "bucket")?;
                let buckets = self.inner.buckets.read().expect("bucket lock poisoned");
                Ok(bucket_all(&buckets, bucket))
            }
            "query" => {
                let name = str_field(fields, "query")?;
                let params = fields.get("params").cloned().unwrap_or(Value::Null);
                let query = self.lookup_query(name)?;
                let buckets = self.inner.buckets.read().expect("bucket lock poisoned");
                Ok(query(&buckets, &params))
            }
            "clear" => {
                let bucket = str_field(fields, "bucket")?;
                let cleared = self
                    .inner
                    .buckets
                    .write()
                    .expect("bucket lock poisoned")
                    .remove(bucket)
                    .map(|records| records.len())
                    .unwrap_or(0);
                self.mark_dirty();
                Ok(json!({ "cleared": cleared }))
            }
            other => Err(StoreError::UnknownOperation(format!(
                "unknown store operation: store.{other}"
            ))),
        }
    }

    async fn subscribe(
        &self,
        query: &str,
        params: Value,
        sink: PushSink,
    ) -> Result<SubscriptionGrant, StoreError> {
        let query_fn = self.lookup_query(query)?;
        let initial_data = {
            let buckets = self.inner.buckets.read().expect("bucket lock poisoned");
            query_fn(&buckets, &params)
        };

        let n = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
        let subscription_id = format!("sub-{n}");
        self.inner
            .subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .insert(
                subscription_id.clone(),
                SubEntry {
                    query: query_fn,
                    params,
                    sink,
                    last_value: initial_data.clone(),
                },
            );

        let inner = self.inner.clone();
        let cancel_id = subscription_id.clone();
        let canceler = Box::new(move || {
            inner
                .subscriptions
                .lock()
                .expect("subscription lock poisoned")
                .remove(&cancel_id);
        });

        Ok(SubscriptionGrant {
            subscription_id,
            initial_data,
            canceler,
        })
    }

    async fn settle(&self) {
        let target = self.inner.dirty_epoch.load(Ordering::SeqCst);
        let mut rx = self.processed_rx.clone();
        while *rx.borrow() < target {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn fields(pairs: Value) -> Map<String, Value> {
        match pairs {
            Value::Object(map) => map,
            _ => panic!("fields must be an object"),
        }
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let store = MemoryStore::new();
        let rec = store
            .execute("insert", &fields(json!({ "bucket": "users", "data": { "name": "Alice" } })))
            .await
            .unwrap();
        let id = rec["id"].as_str().unwrap().to_string();
        assert_eq!(rec["name"], "Alice");

        let got = store
            .execute("get", &fields(json!({ "bucket": "users", "id": id })))
            .await
            .unwrap();
        assert_eq!(got, rec);

        let updated = store
            .execute(
                "update",
                &fields(json!({ "bucket": "users", "id": id, "data": { "name": "Bob" } })),
            )
            .await
            .unwrap();
        assert_eq!(updated["name"], "Bob");
        assert_eq!(updated["id"], json!(id));

        let all = store
            .execute("all", &fields(json!({ "bucket": "users" })))
            .await
            .unwrap();
        assert_eq!(all.as_array().unwrap().len(), 1);

        store
            .execute("delete", &fields(json!({ "bucket": "users", "id": id })))
            .await
            .unwrap();
        let err = store
            .execute("get", &fields(json!({ "bucket": "users", "id": id })))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_operation_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .execute("vacuum", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownOperation(_)));
    }

    #[tokio::test]
    async fn subscription_pushes_on_change_and_cancel_stops_them() {
        let store = MemoryStore::new();
        store.define_bucket_query("all-users", "users");

        let seen: Arc<StdMutex<Vec<Value>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_sink = seen.clone();
        let sink = PushSink::new(move |ev| {
            seen_sink.lock().unwrap().push(ev.data);
        });

        let grant = store
            .subscribe("all-users", Value::Null, sink)
            .await
            .unwrap();
        assert_eq!(grant.initial_data, json!([]));

        store
            .execute("insert", &fields(json!({ "bucket": "users", "data": { "name": "Bob" } })))
            .await
            .unwrap();
        store.settle().await;
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].as_array().unwrap()[0]["name"], "Bob");
        }

        // Unchanged result does not re-push.
        store
            .execute("insert", &fields(json!({ "bucket": "other", "data": {} })))
            .await
            .unwrap();
        store.settle().await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        (grant.canceler)();
        store
            .execute("insert", &fields(json!({ "bucket": "users", "data": { "name": "Eve" } })))
            .await
            .unwrap();
        store.settle().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_to_unknown_query_fails() {
        let store = MemoryStore::new();
        let err = store
            .subscribe("nope", Value::Null, PushSink::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
