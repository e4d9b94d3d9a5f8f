//! Document store abstraction.
//!
//! The [`DocumentStore`] trait covers every index operation the feeder,
//! enrichment driver, watermark tracker, and studies need, so the pipeline
//! runs unchanged against Elasticsearch or the in-memory store used in
//! tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::bulk::BulkOutcome;
use crate::dates::parse_datetime;
use crate::models::Filter;

/// Failure talking to a document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection refused, timeout, or a 5xx answer.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered but refused the request.
    #[error("store rejected request (status {status}): {reason}")]
    Rejected { status: u16, reason: String },
    /// The store could not decode the request body.
    #[error("store could not decode request body: {0}")]
    Encoding(String),
    /// The store answered with something we could not interpret.
    #[error("malformed store response: {0}")]
    Malformed(String),
    #[error("index '{0}' does not exist")]
    IndexMissing(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Inclusive lower bound on a field.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeBound {
    pub field: String,
    pub gte: Value,
}

/// A filtered, sorted full scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanQuery {
    pub filters: Vec<Filter>,
    pub lower_bound: Option<RangeBound>,
    pub sort_field: Option<String>,
    pub page_size: usize,
}

impl ScanQuery {
    pub fn all(page_size: usize) -> Self {
        Self {
            filters: Vec::new(),
            lower_bound: None,
            sort_field: None,
            page_size,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn since(mut self, field: impl Into<String>, gte: impl Into<Value>) -> Self {
        self.lower_bound = Some(RangeBound {
            field: field.into(),
            gte: gte.into(),
        });
        self
    }

    pub fn sorted_by(mut self, field: impl Into<String>) -> Self {
        self.sort_field = Some(field.into());
        self
    }

    /// Whether a document satisfies the filters and lower bound.
    pub fn matches(&self, doc: &Value) -> bool {
        if !self.filters.iter().all(|f| f.matches(doc)) {
            return false;
        }
        match &self.lower_bound {
            None => true,
            Some(bound) => doc
                .get(&bound.field)
                .and_then(|v| compare_values(v, &bound.gte))
                .is_some_and(|ord| ord != Ordering::Less),
        }
    }
}

/// A scanned document: its id and source.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanHit {
    pub id: String,
    pub source: Value,
}

/// One page of scan hits and the cursor for the next.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub hits: Vec<ScanHit>,
    pub cursor: Option<String>,
}

/// Result of a `max` aggregation.
///
/// Date fields come back as epoch milliseconds in `value` with the
/// formatted date in `as_string`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaxValue {
    pub value: Option<f64>,
    pub as_string: Option<String>,
}

impl MaxValue {
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.as_string.is_none()
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        if let Some(dt) = self.as_string.as_deref().and_then(parse_datetime) {
            return Some(dt);
        }
        self.value
            .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
    }

    pub fn as_offset(&self) -> Option<i64> {
        self.value.map(|v| v as i64)
    }
}

/// Earliest and latest date of one group in a terms aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpan {
    pub key: String,
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
}

/// Abstract document index backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_index`](DocumentStore::ensure_index) | Create an index if absent |
/// | [`bulk`](DocumentStore::bulk) | Write an NDJSON bulk body |
/// | [`max_value`](DocumentStore::max_value) | `max` aggregation, optionally filtered |
/// | [`scan`](DocumentStore::scan) | Paged filtered scan |
/// | [`group_date_span`](DocumentStore::group_date_span) | Per-group min/max dates |
/// | [`update_by_query`](DocumentStore::update_by_query) | Set fields on matching docs |
/// | [`aliases`](DocumentStore::aliases) / [`add_alias`](DocumentStore::add_alias) | Alias management |
/// | [`delete_before`](DocumentStore::delete_before) | Retention |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Human-readable location, safe to log.
    fn describe(&self) -> String;

    /// Create `index` with the optional mapping. Returns `true` when created.
    async fn ensure_index(&self, index: &str, mapping: Option<&Value>) -> StoreResult<bool>;

    /// Send a bulk body holding `attempted` documents.
    ///
    /// Per-document rejections are reported in the outcome, not as errors.
    async fn bulk(&self, index: &str, body: &str, attempted: usize) -> StoreResult<BulkOutcome>;

    /// Maximum of `field` over documents matching every filter.
    async fn max_value(&self, index: &str, field: &str, filters: &[Filter])
        -> StoreResult<MaxValue>;

    /// Fetch one page. Pass `None` to start, then the returned cursor.
    async fn scan(
        &self,
        index: &str,
        query: &ScanQuery,
        cursor: Option<&str>,
    ) -> StoreResult<ScanPage>;

    /// Release a scan cursor early.
    async fn clear_scan(&self, _cursor: &str) -> StoreResult<()> {
        Ok(())
    }

    /// Min and max of `date_field` per distinct `group_field` value.
    async fn group_date_span(
        &self,
        index: &str,
        group_field: &str,
        date_field: &str,
        max_groups: usize,
    ) -> StoreResult<Vec<GroupSpan>>;

    /// Set `fields` on every document matching `filter`. Returns the count.
    async fn update_by_query(
        &self,
        index: &str,
        filter: &Filter,
        fields: &Map<String, Value>,
    ) -> StoreResult<u64>;

    async fn aliases(&self, index: &str) -> StoreResult<Vec<String>>;

    async fn add_alias(&self, index: &str, alias: &str) -> StoreResult<()>;

    /// Delete documents whose `field` date is at or before `before`.
    async fn delete_before(
        &self,
        index: &str,
        field: &str,
        before: DateTime<Utc>,
    ) -> StoreResult<u64>;
}

/// Order two JSON scalars: numbers numerically, dates chronologically,
/// other strings lexically.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (parse_datetime(x), parse_datetime(y)) {
            (Some(dx), Some(dy)) => Some(dx.cmp(&dy)),
            _ => Some(x.cmp(y)),
        },
        _ => None,
    }
}
