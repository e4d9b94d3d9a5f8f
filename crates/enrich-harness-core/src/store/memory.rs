//! In-memory [`DocumentStore`] implementation for testing.
//!
//! Indices are ordered `Vec`s with an id → position map behind
//! `std::sync::RwLock`. Failures can be injected per document, per bulk
//! call, or for aggregations, and query counters let tests assert how many
//! round-trips a component made.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::bulk::{parse_ndjson, BulkFailure, BulkOutcome};
use crate::dates::{format_iso, parse_datetime};
use crate::models::Filter;

use super::{
    compare_values, DocumentStore, GroupSpan, MaxValue, ScanHit, ScanPage, ScanQuery, StoreError,
    StoreResult,
};

#[derive(Default)]
struct StoredIndex {
    docs: Vec<(String, Value)>,
    positions: HashMap<String, usize>,
    aliases: Vec<String>,
    mapping: Option<Value>,
}

impl StoredIndex {
    fn upsert(&mut self, id: String, doc: Value) {
        match self.positions.get(&id) {
            Some(&pos) => self.docs[pos].1 = doc,
            None => {
                self.positions.insert(id.clone(), self.docs.len());
                self.docs.push((id, doc));
            }
        }
    }

    fn reindex(&mut self) {
        self.positions = self
            .docs
            .iter()
            .enumerate()
            .map(|(pos, (id, _))| (id.clone(), pos))
            .collect();
    }
}

#[derive(Default)]
struct Injections {
    rejected_ids: HashSet<String>,
    bulk_errors: VecDeque<StoreError>,
    reject_non_ascii: bool,
    fail_aggregations: bool,
    fail_updates: bool,
}

/// In-memory document store for tests.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    indices: RwLock<HashMap<String, StoredIndex>>,
    injections: Mutex<Injections>,
    bulk_calls: AtomicUsize,
    max_lookups: AtomicUsize,
    aggregation_queries: AtomicUsize,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, StoredIndex>> {
        self.indices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, StoredIndex>> {
        self.indices.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn injections(&self) -> MutexGuard<'_, Injections> {
        self.injections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse these document ids on every bulk write.
    pub fn reject_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.injections()
            .rejected_ids
            .extend(ids.into_iter().map(Into::into));
    }

    /// Fail the next bulk call with `err`. Queued errors are used in order.
    pub fn fail_next_bulk(&self, err: StoreError) {
        self.injections().bulk_errors.push_back(err);
    }

    /// Refuse bulk bodies containing non-ASCII bytes with an encoding error.
    pub fn reject_non_ascii(&self, reject: bool) {
        self.injections().reject_non_ascii = reject;
    }

    pub fn fail_aggregations(&self, fail: bool) {
        self.injections().fail_aggregations = fail;
    }

    pub fn fail_updates(&self, fail: bool) {
        self.injections().fail_updates = fail;
    }

    /// Number of bulk calls received, including failed ones.
    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(AtomicOrdering::SeqCst)
    }

    /// Number of `max` lookups run.
    pub fn max_lookups(&self) -> usize {
        self.max_lookups.load(AtomicOrdering::SeqCst)
    }

    /// Number of grouped aggregations run.
    pub fn aggregation_queries(&self) -> usize {
        self.aggregation_queries.load(AtomicOrdering::SeqCst)
    }

    /// Write a document directly, bypassing injections and counters.
    pub fn insert(&self, index: &str, id: &str, doc: Value) {
        self.write()
            .entry(index.to_string())
            .or_default()
            .upsert(id.to_string(), doc);
    }

    pub fn count(&self, index: &str) -> usize {
        self.read().get(index).map_or(0, |i| i.docs.len())
    }

    pub fn get(&self, index: &str, id: &str) -> Option<Value> {
        let indices = self.read();
        let idx = indices.get(index)?;
        idx.positions.get(id).map(|&pos| idx.docs[pos].1.clone())
    }

    /// All documents of an index in insertion order.
    pub fn docs(&self, index: &str) -> Vec<Value> {
        self.read()
            .get(index)
            .map(|i| i.docs.iter().map(|(_, d)| d.clone()).collect())
            .unwrap_or_default()
    }

    pub fn ids(&self, index: &str) -> Vec<String> {
        self.read()
            .get(index)
            .map(|i| i.docs.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn mapping(&self, index: &str) -> Option<Value> {
        self.read().get(index).and_then(|i| i.mapping.clone())
    }

    pub fn exists(&self, index: &str) -> bool {
        self.read().contains_key(index)
    }

    fn check_aggregations(&self, counter: &AtomicUsize) -> StoreResult<()> {
        counter.fetch_add(1, AtomicOrdering::SeqCst);
        if self.injections().fail_aggregations {
            return Err(StoreError::Unavailable("aggregation failed".to_string()));
        }
        Ok(())
    }
}

fn date_of(doc: &Value, field: &str) -> Option<DateTime<Utc>> {
    doc.get(field).and_then(Value::as_str).and_then(parse_datetime)
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn ensure_index(&self, index: &str, mapping: Option<&Value>) -> StoreResult<bool> {
        let mut indices = self.write();
        if indices.contains_key(index) {
            return Ok(false);
        }
        indices.insert(
            index.to_string(),
            StoredIndex {
                mapping: mapping.cloned(),
                ..Default::default()
            },
        );
        Ok(true)
    }

    async fn bulk(&self, index: &str, body: &str, attempted: usize) -> StoreResult<BulkOutcome> {
        self.bulk_calls.fetch_add(1, AtomicOrdering::SeqCst);
        let rejected = {
            let mut inj = self.injections();
            if let Some(err) = inj.bulk_errors.pop_front() {
                return Err(err);
            }
            if inj.reject_non_ascii && !body.is_ascii() {
                return Err(StoreError::Encoding(
                    "invalid UTF-8 start byte in bulk body".to_string(),
                ));
            }
            inj.rejected_ids.clone()
        };

        let pairs = parse_ndjson(body).map_err(StoreError::Encoding)?;
        let mut outcome = BulkOutcome {
            attempted,
            ..Default::default()
        };
        let mut indices = self.write();
        let idx = indices.entry(index.to_string()).or_default();
        for (id, doc) in pairs {
            if rejected.contains(&id) {
                outcome.failures.push(BulkFailure {
                    id,
                    reason: "mapper_parsing_exception: injected rejection".to_string(),
                });
            } else {
                idx.upsert(id, doc);
                outcome.accepted += 1;
            }
        }
        Ok(outcome)
    }

    async fn max_value(
        &self,
        index: &str,
        field: &str,
        filters: &[Filter],
    ) -> StoreResult<MaxValue> {
        self.check_aggregations(&self.max_lookups)?;
        let indices = self.read();
        let idx = indices
            .get(index)
            .ok_or_else(|| StoreError::IndexMissing(index.to_string()))?;

        let mut best = MaxValue::default();
        for (_, doc) in &idx.docs {
            if !filters.iter().all(|f| f.matches(doc)) {
                continue;
            }
            let candidate = match doc.get(field) {
                Some(Value::Number(n)) => n.as_f64().map(|v| MaxValue {
                    value: Some(v),
                    as_string: None,
                }),
                Some(Value::String(s)) => parse_datetime(s).map(|dt| MaxValue {
                    value: Some(dt.timestamp_millis() as f64),
                    as_string: Some(format_iso(dt)),
                }),
                _ => None,
            };
            if let Some(c) = candidate {
                if best.value.map_or(true, |b| c.value.unwrap_or(f64::MIN) > b) {
                    best = c;
                }
            }
        }
        Ok(best)
    }

    async fn scan(
        &self,
        index: &str,
        query: &ScanQuery,
        cursor: Option<&str>,
    ) -> StoreResult<ScanPage> {
        let start = match cursor {
            None => 0,
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| StoreError::Rejected {
                    status: 404,
                    reason: format!("unknown scan cursor '{c}'"),
                })?,
        };
        let indices = self.read();
        let idx = indices
            .get(index)
            .ok_or_else(|| StoreError::IndexMissing(index.to_string()))?;

        let mut matching: Vec<(&String, &Value)> = idx
            .docs
            .iter()
            .map(|(id, d)| (id, d))
            .filter(|(_, d)| query.matches(d))
            .collect();
        if let Some(sort) = &query.sort_field {
            matching.sort_by(|(_, a), (_, b)| match (a.get(sort), b.get(sort)) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            });
        }

        let page_size = query.page_size.max(1);
        let hits: Vec<ScanHit> = matching
            .iter()
            .skip(start)
            .take(page_size)
            .map(|(id, d)| ScanHit {
                id: (*id).clone(),
                source: (*d).clone(),
            })
            .collect();
        let next = start + hits.len();
        let cursor = if !hits.is_empty() && next < matching.len() {
            Some(next.to_string())
        } else {
            None
        };
        Ok(ScanPage { hits, cursor })
    }

    async fn group_date_span(
        &self,
        index: &str,
        group_field: &str,
        date_field: &str,
        max_groups: usize,
    ) -> StoreResult<Vec<GroupSpan>> {
        self.check_aggregations(&self.aggregation_queries)?;
        let indices = self.read();
        let idx = indices
            .get(index)
            .ok_or_else(|| StoreError::IndexMissing(index.to_string()))?;

        let mut groups: BTreeMap<String, (DateTime<Utc>, DateTime<Utc>)> = BTreeMap::new();
        for (_, doc) in &idx.docs {
            let Some(key) = doc.get(group_field).and_then(Value::as_str) else {
                continue;
            };
            let Some(date) = date_of(doc, date_field) else {
                continue;
            };
            groups
                .entry(key.to_string())
                .and_modify(|(min, max)| {
                    *min = (*min).min(date);
                    *max = (*max).max(date);
                })
                .or_insert((date, date));
        }
        Ok(groups
            .into_iter()
            .take(max_groups)
            .map(|(key, (min, max))| GroupSpan { key, min, max })
            .collect())
    }

    async fn update_by_query(
        &self,
        index: &str,
        filter: &Filter,
        fields: &Map<String, Value>,
    ) -> StoreResult<u64> {
        if self.injections().fail_updates {
            return Err(StoreError::Rejected {
                status: 500,
                reason: "script_exception: injected failure".to_string(),
            });
        }
        let mut indices = self.write();
        let idx = indices
            .get_mut(index)
            .ok_or_else(|| StoreError::IndexMissing(index.to_string()))?;
        let mut updated = 0;
        for (_, doc) in idx.docs.iter_mut() {
            if !filter.matches(doc) {
                continue;
            }
            if let Value::Object(obj) = doc {
                for (k, v) in fields {
                    obj.insert(k.clone(), v.clone());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn aliases(&self, index: &str) -> StoreResult<Vec<String>> {
        self.read()
            .get(index)
            .map(|i| i.aliases.clone())
            .ok_or_else(|| StoreError::IndexMissing(index.to_string()))
    }

    async fn add_alias(&self, index: &str, alias: &str) -> StoreResult<()> {
        let mut indices = self.write();
        let idx = indices
            .get_mut(index)
            .ok_or_else(|| StoreError::IndexMissing(index.to_string()))?;
        if !idx.aliases.iter().any(|a| a == alias) {
            idx.aliases.push(alias.to_string());
        }
        Ok(())
    }

    async fn delete_before(
        &self,
        index: &str,
        field: &str,
        before: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut indices = self.write();
        let idx = indices
            .get_mut(index)
            .ok_or_else(|| StoreError::IndexMissing(index.to_string()))?;
        let before_len = idx.docs.len();
        idx.docs
            .retain(|(_, doc)| date_of(doc, field).map_or(true, |d| d > before));
        idx.reindex();
        Ok((before_len - idx.docs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::BulkBatch;
    use serde_json::json;

    fn batch(docs: &[(&str, Value)]) -> BulkBatch {
        let mut b = BulkBatch::new();
        for (id, doc) in docs {
            b.push(id, doc).unwrap();
        }
        b
    }

    #[tokio::test]
    async fn bulk_upserts_by_id() {
        let store = InMemoryDocumentStore::new();
        let b = batch(&[("a", json!({ "v": 1 })), ("b", json!({ "v": 2 }))]);
        let out = store.bulk("idx", b.body(), b.len()).await.unwrap();
        assert_eq!(out.accepted, 2);

        let b = batch(&[("a", json!({ "v": 3 }))]);
        store.bulk("idx", b.body(), b.len()).await.unwrap();
        assert_eq!(store.count("idx"), 2);
        assert_eq!(store.get("idx", "a").unwrap()["v"], 3);
        assert_eq!(store.ids("idx"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn injected_rejections_are_reported_per_document() {
        let store = InMemoryDocumentStore::new();
        store.reject_ids(["b"]);
        let b = batch(&[("a", json!({})), ("b", json!({}))]);
        let out = store.bulk("idx", b.body(), b.len()).await.unwrap();
        assert_eq!(out.accepted, 1);
        assert_eq!(out.deficit(), 1);
        assert_eq!(out.failures[0].id, "b");
    }

    #[tokio::test]
    async fn non_ascii_rejection_accepts_escaped_body() {
        let store = InMemoryDocumentStore::new();
        store.reject_non_ascii(true);
        let b = batch(&[("a", json!({ "name": "Zoë" }))]);
        let err = store.bulk("idx", b.body(), 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Encoding(_)));
        store.bulk("idx", &b.to_ascii(), 1).await.unwrap();
        assert_eq!(store.get("idx", "a").unwrap()["name"], "Zoë");
        assert_eq!(store.bulk_calls(), 2);
    }

    #[tokio::test]
    async fn max_value_over_dates_and_numbers() {
        let store = InMemoryDocumentStore::new();
        store.insert("idx", "1", json!({ "o": "x", "d": "2024-01-05T00:00:00+00:00", "n": 4 }));
        store.insert("idx", "2", json!({ "o": "x", "d": "2024-01-07T00:00:00+00:00", "n": 2 }));
        store.insert("idx", "3", json!({ "o": "y", "d": "2024-03-01T00:00:00+00:00", "n": 9 }));

        let max = store
            .max_value("idx", "d", &[Filter::term("o", "x")])
            .await
            .unwrap();
        assert_eq!(max.as_datetime(), parse_datetime("2024-01-07"));
        let max = store.max_value("idx", "n", &[]).await.unwrap();
        assert_eq!(max.as_offset(), Some(9));
        assert_eq!(store.max_lookups(), 2);
        assert_eq!(store.aggregation_queries(), 0);

        let err = store.max_value("missing", "d", &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::IndexMissing(_)));
    }

    #[tokio::test]
    async fn scan_pages_in_sort_order() {
        let store = InMemoryDocumentStore::new();
        for (id, ts) in [("c", 3), ("a", 1), ("b", 2)] {
            store.insert("idx", id, json!({ "id": id, "ts": ts }));
        }
        let query = ScanQuery::all(2).sorted_by("ts").since("ts", 1);
        let first = store.scan("idx", &query, None).await.unwrap();
        assert_eq!(first.hits.len(), 2);
        assert_eq!(first.hits[0].source["id"], "a");
        let second = store
            .scan("idx", &query, first.cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(second.hits[0].source["id"], "c");
        assert!(second.cursor.is_none());
    }

    #[tokio::test]
    async fn group_spans_and_updates() {
        let store = InMemoryDocumentStore::new();
        store.insert("e", "1", json!({ "u": "alice", "d": "2023-01-01T00:00:00+00:00" }));
        store.insert("e", "2", json!({ "u": "alice", "d": "2024-06-01T00:00:00+00:00" }));
        store.insert("e", "3", json!({ "u": "bob", "d": "2024-02-01T00:00:00+00:00" }));
        store.insert("e", "4", json!({ "d": "2024-02-01T00:00:00+00:00" }));

        let spans = store.group_date_span("e", "u", "d", 100).await.unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].key, "alice");
        assert_eq!(spans[0].min, parse_datetime("2023-01-01").unwrap());
        assert_eq!(spans[0].max, parse_datetime("2024-06-01").unwrap());

        let mut fields = Map::new();
        fields.insert("tagged".into(), json!(true));
        let n = store
            .update_by_query("e", &Filter::term("u", "alice"), &fields)
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.get("e", "1").unwrap()["tagged"], true);
        assert!(store.get("e", "3").unwrap().get("tagged").is_none());
    }

    #[tokio::test]
    async fn delete_before_is_inclusive() {
        let store = InMemoryDocumentStore::new();
        store.insert("r", "old", json!({ "d": "2024-01-01T00:00:00+00:00" }));
        store.insert("r", "edge", json!({ "d": "2024-01-02T00:00:00+00:00" }));
        store.insert("r", "new", json!({ "d": "2024-01-03T00:00:00+00:00" }));
        let n = store
            .delete_before("r", "d", parse_datetime("2024-01-02").unwrap())
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.ids("r"), vec!["new"]);
        assert!(store.get("r", "new").is_some());
    }

    #[tokio::test]
    async fn aliases_are_unique() {
        let store = InMemoryDocumentStore::new();
        assert!(store.ensure_index("e", None).await.unwrap());
        assert!(!store.ensure_index("e", None).await.unwrap());
        store.add_alias("e", "demographics").await.unwrap();
        store.add_alias("e", "demographics").await.unwrap();
        assert_eq!(store.aliases("e").await.unwrap(), vec!["demographics"]);
    }
}
