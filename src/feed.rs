//! Incremental feeder.
//!
//! Pulls payloads from a [`Collector`], normalizes them into [`RawItem`]s and
//! bulk-writes them to the raw index, advancing the stream's watermark after
//! every stored batch:
//!
//! ```text
//! watermark ──▶ cursor ──▶ collector.fetch ──▶ normalize ──▶ fixup ──▶ batch ──▶ bulk
//!     ▲                                                                          │
//!     └──────────────────────── advance(batch max position) ─────────────────────┘
//! ```
//!
//! A batch that errors is retried once as a whole. If it still fails the
//! run stops there: nothing after the lost batch is written, so neither a
//! checkpoint nor the newest stored item of the raw index moves past the
//! lost items, and the next run fetches them again.
//!
//! Documents the store rejects one by one are reported by id. They hold a
//! checkpoint watermark for the rest of the run, but an index watermark
//! still moves with the documents accepted around them.

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use tracing::{debug, error, info, warn};

use enrich_harness_core::bulk::{BulkBatch, BulkOutcome};
use enrich_harness_core::collector::{Collector, CursorKind, FetchCursor};
use enrich_harness_core::dates::to_naive_utc;
use enrich_harness_core::models::{Filter, RawItem, WatermarkValue, FIELD_UPDATED_ON};
use enrich_harness_core::store::{DocumentStore, StoreError};
use enrich_harness_core::transform::Transform;
use enrich_harness_core::watermark::WatermarkTracker;

use crate::elastic::{anonymize_url, raw_mapping};

#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// Maximum items per bulk request.
    pub bulk_size: usize,
    /// Ignore the watermark and fetch everything.
    pub full: bool,
    /// Explicit start position, overriding the watermark.
    pub since: Option<WatermarkValue>,
    /// Static project attached to every item.
    pub project: Option<String>,
    /// Delete raw items older than this many minutes after the feed.
    pub retention_minutes: Option<i64>,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            bulk_size: 1000,
            full: false,
            since: None,
            project: None,
            retention_minutes: None,
        }
    }
}

/// Counters of one feed run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedReport {
    pub fetched: usize,
    pub stored: usize,
    pub dropped: usize,
    /// Payloads that could not be normalized.
    pub invalid: usize,
    /// Items the store refused individually.
    pub rejected: usize,
    pub failed_batches: usize,
    pub cursor: Option<FetchCursor>,
    pub watermark: Option<WatermarkValue>,
    /// Raw items removed by retention.
    pub expired: u64,
}

pub struct Feeder<'a> {
    store: &'a dyn DocumentStore,
    watermarks: &'a dyn WatermarkTracker,
    hooks: Option<&'a dyn Transform>,
    options: FeedOptions,
}

/// Per-run batching state.
struct Pending {
    batch: BulkBatch,
    /// Highest source position seen since the last stored batch, dropped
    /// items included.
    max_position: Option<WatermarkValue>,
    /// Set once a batch is lost; the watermark stays put afterwards.
    hold: bool,
}

impl<'a> Feeder<'a> {
    pub fn new(store: &'a dyn DocumentStore, watermarks: &'a dyn WatermarkTracker) -> Self {
        Self {
            store,
            watermarks,
            hooks: None,
            options: FeedOptions::default(),
        }
    }

    /// Source-specific `fixup` / `drop_item` hooks.
    pub fn with_hooks(mut self, transform: &'a dyn Transform) -> Self {
        self.hooks = Some(transform);
        self
    }

    pub fn with_options(mut self, options: FeedOptions) -> Self {
        self.options = options;
        self
    }

    /// Where to start fetching `collector` for `stream_key`.
    pub async fn start_cursor(
        &self,
        collector: &dyn Collector,
        stream_key: &str,
    ) -> Result<FetchCursor> {
        let Some(kind) = collector.cursor_kind().watermark_kind() else {
            return Ok(FetchCursor::Full);
        };

        let value = match self.options.since {
            Some(since) => {
                if since.kind() != kind {
                    bail!(
                        "collector '{}' resumes by {:?}, got a {:?} start position",
                        collector.name(),
                        kind,
                        since.kind()
                    );
                }
                Some(since)
            }
            None if self.options.full => None,
            None => {
                let filters = [Filter::term("origin", collector.origin())];
                self.watermarks
                    .get(stream_key, kind, &filters)
                    .await?
                    .map(|wm| wm.value)
            }
        };

        Ok(match value {
            None => FetchCursor::Full,
            Some(WatermarkValue::Date(dt)) => FetchCursor::FromDate(to_naive_utc(&dt)),
            Some(WatermarkValue::Offset(offset)) => FetchCursor::Offset(offset),
        })
    }

    pub async fn feed(
        &self,
        collector: &dyn Collector,
        stream_key: &str,
        raw_index: &str,
    ) -> Result<FeedReport> {
        let mut report = FeedReport::default();
        let kind = collector.cursor_kind();

        let cursor = self.start_cursor(collector, stream_key).await?;
        report.cursor = Some(cursor);
        match cursor {
            FetchCursor::Full => info!(
                stream = stream_key,
                origin = %anonymize_url(collector.origin()),
                "not incremental"
            ),
            cursor => info!(
                stream = stream_key,
                origin = %anonymize_url(collector.origin()),
                ?cursor,
                "incremental"
            ),
        }

        self.store
            .ensure_index(raw_index, Some(&raw_mapping()))
            .await
            .with_context(|| format!("creating raw index {}", raw_index))?;

        let mut stream = collector
            .fetch(cursor)
            .await
            .with_context(|| format!("fetching from collector '{}'", collector.name()))?;

        let mut pending = Pending {
            batch: BulkBatch::new(),
            max_position: None,
            hold: false,
        };

        while let Some(payload) = stream
            .next_item()
            .await
            .with_context(|| format!("reading from collector '{}'", collector.name()))?
        {
            report.fetched += 1;
            let mut item = match RawItem::from_payload(payload) {
                Ok(item) => item,
                Err(e) => {
                    warn!(stream = stream_key, error = %e, "skipping unreadable payload");
                    report.invalid += 1;
                    continue;
                }
            };

            if let Some(hooks) = self.hooks {
                hooks.fixup(&mut item);
            }
            if let Some(project) = &self.options.project {
                item.project = Some(project.clone());
            }

            if pending.batch.len() >= self.options.bulk_size {
                self.flush(&mut pending, stream_key, raw_index, &mut report)
                    .await?;
                if report.failed_batches > 0 {
                    warn!(
                        stream = stream_key,
                        index = raw_index,
                        "stopping after a lost batch, remaining items wait for the next run"
                    );
                    break;
                }
            }

            if let Some(position) = position_of(&item, kind) {
                pending.max_position = Some(match pending.max_position {
                    Some(current) => current.max(position),
                    None => position,
                });
            }

            if self.hooks.is_some_and(|h| h.drop_item(&item)) {
                debug!(stream = stream_key, uuid = %item.uuid, "dropped by filter");
                report.dropped += 1;
                continue;
            }
            pending
                .batch
                .push(&item.uuid, &item)
                .with_context(|| format!("serializing item {}", item.uuid))?;
        }
        self.flush(&mut pending, stream_key, raw_index, &mut report)
            .await?;

        if let Some(minutes) = self.options.retention_minutes.filter(|m| *m > 0) {
            let before = Utc::now() - Duration::minutes(minutes);
            report.expired = self
                .store
                .delete_before(raw_index, FIELD_UPDATED_ON, before)
                .await
                .with_context(|| format!("applying retention to {}", raw_index))?;
            info!(index = raw_index, deleted = report.expired, "retention applied");
        }

        if pending.hold {
            warn!(
                stream = stream_key,
                failed_batches = report.failed_batches,
                rejected = report.rejected,
                "watermark held back after lost items"
            );
        }
        info!(
            stream = stream_key,
            index = raw_index,
            fetched = report.fetched,
            stored = report.stored,
            dropped = report.dropped,
            "feed finished"
        );
        Ok(report)
    }

    async fn flush(
        &self,
        pending: &mut Pending,
        stream_key: &str,
        raw_index: &str,
        report: &mut FeedReport,
    ) -> Result<()> {
        if pending.batch.is_empty() {
            return Ok(());
        }
        let attempted = pending.batch.len();

        let outcome = match self.write(&pending.batch, raw_index).await {
            Ok(outcome) => outcome,
            Err(first) => {
                warn!(index = raw_index, attempted, error = %first, "bulk write failed, retrying once");
                match self.write(&pending.batch, raw_index).await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_unavailable() => {
                        return Err(e).with_context(|| format!("writing to {}", raw_index))
                    }
                    Err(e) => {
                        error!(
                            index = raw_index,
                            attempted,
                            accepted = 0,
                            error = %e,
                            "bulk write failed twice, batch skipped"
                        );
                        report.failed_batches += 1;
                        pending.hold = true;
                        pending.batch.clear();
                        pending.max_position = None;
                        return Ok(());
                    }
                }
            }
        };

        report.stored += outcome.accepted;
        if outcome.deficit() > 0 {
            report.rejected += outcome.deficit();
            pending.hold = true;
            let ids: Vec<&str> = outcome.failures.iter().map(|f| f.id.as_str()).collect();
            error!(
                index = raw_index,
                attempted = outcome.attempted,
                accepted = outcome.accepted,
                failed = ?ids,
                "items missing after bulk write"
            );
        }

        if let (false, Some(position)) = (pending.hold, pending.max_position) {
            self.watermarks.advance(stream_key, position).await?;
            report.watermark = Some(match report.watermark {
                Some(current) => current.max(position),
                None => position,
            });
        }
        pending.batch.clear();
        pending.max_position = None;
        Ok(())
    }

    async fn write(&self, batch: &BulkBatch, index: &str) -> Result<BulkOutcome, StoreError> {
        self.store.bulk(index, batch.body(), batch.len()).await
    }
}

/// Position of a normalized item in its stream.
fn position_of(item: &RawItem, kind: CursorKind) -> Option<WatermarkValue> {
    match kind {
        CursorKind::FromDate => item.updated_at().map(WatermarkValue::Date),
        CursorKind::Offset => item.offset.map(WatermarkValue::Offset),
        CursorKind::Unsupported => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use enrich_harness_core::collector::StaticCollector;
    use enrich_harness_core::dates::parse_datetime;
    use enrich_harness_core::models::{EnrichedDocument, Identity, WatermarkKind};
    use enrich_harness_core::store::memory::InMemoryDocumentStore;
    use enrich_harness_core::transform::EnrichContext;
    use enrich_harness_core::watermark::IndexWatermarks;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn payload(day: u32) -> Value {
        let dt = parse_datetime(&format!("2024-01-{day:02}")).unwrap();
        json!({
            "origin": "https://example.com/repo",
            "uuid": format!("item-{day}"),
            "updated_on": dt.timestamp(),
            "timestamp": dt.timestamp(),
            "data": { "day": day }
        })
    }

    fn collector(days: &[u32]) -> StaticCollector {
        StaticCollector::new(
            "static",
            "https://example.com/repo",
            CursorKind::FromDate,
            days.iter().map(|d| payload(*d)).collect(),
        )
    }

    struct DropOdd;

    #[async_trait]
    impl Transform for DropOdd {
        fn source(&self) -> &str {
            "odd"
        }

        async fn document(
            &self,
            _item: &RawItem,
            _ctx: &EnrichContext<'_>,
        ) -> Result<Vec<EnrichedDocument>> {
            Ok(Vec::new())
        }

        fn identities<'a>(&'a self, _item: &'a RawItem) -> Box<dyn Iterator<Item = Identity> + 'a> {
            Box::new(std::iter::empty())
        }

        fn fixup(&self, item: &mut RawItem) {
            item.category = Some("fixed".into());
        }

        fn drop_item(&self, item: &RawItem) -> bool {
            item.data["day"].as_u64().is_some_and(|d| d % 2 == 1)
        }
    }

    #[tokio::test]
    async fn test_first_run_is_full_and_advances() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let marks = IndexWatermarks::new(store.clone(), "raw");
        let feeder = Feeder::new(store.as_ref(), &marks);

        let report = feeder.feed(&collector(&[1, 3, 5]), "repo", "raw").await.unwrap();
        assert_eq!(report.cursor, Some(FetchCursor::Full));
        assert_eq!(report.stored, 3);
        assert_eq!(
            report.watermark,
            Some(WatermarkValue::Date(parse_datetime("2024-01-05").unwrap()))
        );
        let doc = store.get("raw", "item-3").unwrap();
        assert_eq!(doc["metadata__updated_on"], "2024-01-03T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_small_batches_and_project_override() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let marks = IndexWatermarks::new(store.clone(), "raw");
        let feeder = Feeder::new(store.as_ref(), &marks).with_options(FeedOptions {
            bulk_size: 2,
            project: Some("widgets".into()),
            ..Default::default()
        });
        let report = feeder.feed(&collector(&[1, 2, 3, 4, 5]), "repo", "raw").await.unwrap();
        assert_eq!(report.stored, 5);
        assert_eq!(store.bulk_calls(), 3);
        assert_eq!(store.get("raw", "item-1").unwrap()["project"], "widgets");
    }

    #[tokio::test]
    async fn test_dropped_items_counted_separately() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let marks = IndexWatermarks::new(store.clone(), "raw");
        let hooks = DropOdd;
        let feeder = Feeder::new(store.as_ref(), &marks).with_hooks(&hooks);

        let report = feeder.feed(&collector(&[2, 4, 5]), "repo", "raw").await.unwrap();
        assert_eq!(report.stored, 2);
        assert_eq!(report.dropped, 1);
        assert!(store.get("raw", "item-5").is_none());
        assert_eq!(store.get("raw", "item-2").unwrap()["category"], "fixed");
        // Advanced from the source position of the dropped item too
        assert_eq!(
            report.watermark,
            Some(WatermarkValue::Date(parse_datetime("2024-01-05").unwrap()))
        );
    }

    #[tokio::test]
    async fn test_only_dropped_items_do_not_advance() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let marks = IndexWatermarks::new(store.clone(), "raw");
        let hooks = DropOdd;
        let feeder = Feeder::new(store.as_ref(), &marks).with_hooks(&hooks);

        let report = feeder.feed(&collector(&[1, 3]), "repo", "raw").await.unwrap();
        assert_eq!(report.dropped, 2);
        assert_eq!(report.watermark, None);
    }

    #[tokio::test]
    async fn test_failed_batch_is_retried_once_then_skipped() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let marks = IndexWatermarks::new(store.clone(), "raw");
        let feeder = Feeder::new(store.as_ref(), &marks).with_options(FeedOptions {
            bulk_size: 2,
            ..Default::default()
        });
        let rejected = || StoreError::Rejected {
            status: 413,
            reason: "too large".into(),
        };
        store.fail_next_bulk(rejected());
        store.fail_next_bulk(rejected());

        let report = feeder.feed(&collector(&[1, 2, 3]), "repo", "raw").await.unwrap();
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.stored, 0);
        assert_eq!(report.watermark, None);
        assert!(store.get("raw", "item-3").is_none());
    }

    #[tokio::test]
    async fn test_lost_batch_is_fetched_again_with_index_watermark() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let marks = IndexWatermarks::new(store.clone(), "raw");
        let feeder = Feeder::new(store.as_ref(), &marks).with_options(FeedOptions {
            bulk_size: 2,
            ..Default::default()
        });
        feeder.feed(&collector(&[1, 2]), "repo", "raw").await.unwrap();

        let lost = || StoreError::Rejected {
            status: 413,
            reason: "too large".into(),
        };
        store.fail_next_bulk(lost());
        store.fail_next_bulk(lost());
        let day2 = FetchCursor::FromDate(parse_datetime("2024-01-02").unwrap().naive_utc());

        let report = feeder.feed(&collector(&[2, 3, 4, 5]), "repo", "raw").await.unwrap();
        assert_eq!(report.cursor, Some(day2));
        assert_eq!(report.failed_batches, 1);
        // Nothing past the lost batch was written
        assert!(store.get("raw", "item-3").is_none());
        assert!(store.get("raw", "item-4").is_none());
        assert!(store.get("raw", "item-5").is_none());

        let again = feeder.feed(&collector(&[2, 3, 4, 5]), "repo", "raw").await.unwrap();
        assert_eq!(again.cursor, Some(day2));
        assert_eq!(again.failed_batches, 0);
        assert_eq!(again.stored, 4);
        assert_eq!(store.count("raw"), 5);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_one_failure() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let marks = IndexWatermarks::new(store.clone(), "raw");
        let feeder = Feeder::new(store.as_ref(), &marks);
        store.fail_next_bulk(StoreError::Unavailable("reset".into()));

        let report = feeder.feed(&collector(&[1, 2]), "repo", "raw").await.unwrap();
        assert_eq!(report.failed_batches, 0);
        assert_eq!(report.stored, 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_propagates() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let marks = IndexWatermarks::new(store.clone(), "raw");
        let feeder = Feeder::new(store.as_ref(), &marks);
        store.fail_next_bulk(StoreError::Unavailable("down".into()));
        store.fail_next_bulk(StoreError::Unavailable("down".into()));

        assert!(feeder.feed(&collector(&[1]), "repo", "raw").await.is_err());
    }

    #[tokio::test]
    async fn test_watermark_lookup_failure_propagates() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("raw", "x", json!({ "origin": "https://example.com/repo" }));
        store.fail_aggregations(true);
        let marks = IndexWatermarks::new(store.clone(), "raw");
        let feeder = Feeder::new(store.as_ref(), &marks);

        assert!(feeder.feed(&collector(&[1]), "repo", "raw").await.is_err());
        assert_eq!(store.count("raw"), 1);
    }

    #[tokio::test]
    async fn test_explicit_since_must_match_cursor_kind() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let marks = IndexWatermarks::new(store.clone(), "raw");
        let feeder = Feeder::new(store.as_ref(), &marks).with_options(FeedOptions {
            since: Some(WatermarkValue::Offset(3)),
            ..Default::default()
        });
        assert!(feeder.start_cursor(&collector(&[1]), "repo").await.is_err());

        let feeder = Feeder::new(store.as_ref(), &marks).with_options(FeedOptions {
            since: Some(WatermarkValue::Date(parse_datetime("2024-01-03").unwrap())),
            ..Default::default()
        });
        let report = feeder.feed(&collector(&[1, 3, 5]), "repo", "raw").await.unwrap();
        assert_eq!(report.stored, 2);
    }

    #[tokio::test]
    async fn test_offset_collector_resumes_from_offset() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let marks = IndexWatermarks::new(store.clone(), "raw");
        let items: Vec<Value> = (0..4)
            .map(|i| {
                json!({
                    "origin": "mbox:dev", "uuid": format!("m{i}"), "offset": i,
                    "updated_on": 1704067200 + i, "timestamp": 1704067200,
                    "data": { "n": i }
                })
            })
            .collect();
        let c = StaticCollector::new("mbox", "mbox:dev", CursorKind::Offset, items);
        let feeder = Feeder::new(store.as_ref(), &marks);
        feeder.feed(&c, "dev", "raw").await.unwrap();

        let wm = marks
            .get("dev", WatermarkKind::Offset, &[Filter::term("origin", "mbox:dev")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wm.value, WatermarkValue::Offset(3));
        assert_eq!(
            feeder.start_cursor(&c, "dev").await.unwrap(),
            FetchCursor::Offset(3)
        );
    }

    #[tokio::test]
    async fn test_retention_deletes_old_items() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let marks = IndexWatermarks::new(store.clone(), "raw");
        let feeder = Feeder::new(store.as_ref(), &marks).with_options(FeedOptions {
            retention_minutes: Some(60),
            ..Default::default()
        });
        let report = feeder.feed(&collector(&[1, 2]), "repo", "raw").await.unwrap();
        assert_eq!(report.expired, 2);
        assert_eq!(store.count("raw"), 0);
    }
}
