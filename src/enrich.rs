//! Enrichment driver.
//!
//! Streams raw items out of the raw index, hands each to the source's
//! [`Transform`], stamps the bookkeeping fields every enriched document
//! carries, and bulk-writes the results in batches bounded by document
//! count and body size.
//!
//! ```text
//! Streaming ─▶ (Accumulating ─▶ Flushing)* ─▶ FinalFlush ─▶ Done
//! ```
//!
//! Nothing moves backwards on error. A failing transform skips its item,
//! a refused batch is recorded as unaccepted, and the run goes on. Only
//! an unreachable store ends the run early.
//!
//! The same driver rewrites identity fields of enriched documents in
//! place; see [`EnrichmentDriver::refresh_identities`].

use std::collections::VecDeque;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use enrich_harness_core::bulk::{BulkBatch, BulkFailure, BulkOutcome};
use enrich_harness_core::dates::format_iso;
use enrich_harness_core::models::{
    EnrichedDocument, Filter, RawItem, WatermarkValue, FIELD_OFFSET, FIELD_TIMESTAMP,
    FIELD_UPDATED_ON,
};
use enrich_harness_core::project::{project_fields, ProjectMapper};
use enrich_harness_core::store::{DocumentStore, ScanHit, ScanQuery, StoreError, StoreResult};
use enrich_harness_core::transform::{EnrichContext, Transform};

use crate::elastic::enriched_mapping;

mod refresh;

/// Value of `metadata__enrich_version`.
pub const ENRICH_VERSION: &str = env!("CARGO_PKG_VERSION");

// ═══════════════════════════════════════════════════════════════════════
// Raw source
// ═══════════════════════════════════════════════════════════════════════

/// Paged reader over the raw items of one origin.
///
/// Items come back in ascending `metadata__timestamp` order (or `offset`
/// order after [`resume_from`](Self::resume_from) an offset), so an
/// interrupted enrichment can resume from the enriched index's maximum.
pub struct RawSource<'a> {
    store: &'a dyn DocumentStore,
    index: String,
    query: ScanQuery,
    cursor: Option<String>,
    buffer: VecDeque<ScanHit>,
    done: bool,
}

impl<'a> RawSource<'a> {
    pub fn new(store: &'a dyn DocumentStore, index: &str, origin: &str, page_size: usize) -> Self {
        Self {
            store,
            index: index.to_string(),
            query: ScanQuery::all(page_size)
                .filter(Filter::term("origin", origin))
                .sorted_by(FIELD_TIMESTAMP),
            cursor: None,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Extra term filter (category, project, ...).
    pub fn filter(mut self, filter: Filter) -> Self {
        self.query = self.query.filter(filter);
        self
    }

    /// Only items at or after `position`.
    pub fn resume_from(mut self, position: WatermarkValue) -> Self {
        self.query = match position {
            WatermarkValue::Date(dt) => self
                .query
                .since(FIELD_TIMESTAMP, format_iso(dt))
                .sorted_by(FIELD_TIMESTAMP),
            WatermarkValue::Offset(offset) => {
                self.query.since(FIELD_OFFSET, offset).sorted_by(FIELD_OFFSET)
            }
        };
        self
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Next stored item source, `None` once the scan is exhausted.
    pub async fn next_hit(&mut self) -> StoreResult<Option<Value>> {
        Ok(self.next_document().await?.map(|hit| hit.source))
    }

    /// Next stored document with its id. A missing index reads as empty.
    pub async fn next_document(&mut self) -> StoreResult<Option<ScanHit>> {
        loop {
            if let Some(hit) = self.buffer.pop_front() {
                return Ok(Some(hit));
            }
            if self.done {
                return Ok(None);
            }
            let page = match self
                .store
                .scan(&self.index, &self.query, self.cursor.as_deref())
                .await
            {
                Ok(page) => page,
                Err(StoreError::IndexMissing(index)) if self.cursor.is_none() => {
                    warn!(index = %index, "index does not exist, nothing to read");
                    self.done = true;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            self.done = page.cursor.is_none() || page.hits.is_empty();
            self.cursor = page.cursor;
            self.buffer.extend(page.hits);
        }
    }

    /// Start over from the first page.
    pub async fn restart(&mut self) -> StoreResult<()> {
        self.close().await?;
        self.buffer.clear();
        self.done = false;
        Ok(())
    }

    /// Release the server-side cursor, if any.
    pub async fn close(&mut self) -> StoreResult<()> {
        if let Some(cursor) = self.cursor.take() {
            self.store.clear_scan(&cursor).await?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Driver
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Streaming,
    Accumulating,
    Flushing,
    FinalFlush,
    Done,
}

#[derive(Debug, Clone)]
pub struct EnrichOptions {
    pub bulk_size: usize,
    pub bulk_bytes: usize,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            bulk_size: 1000,
            bulk_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Counters of one enrichment run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichReport {
    /// Raw items read.
    pub items: usize,
    /// Documents sent to the store.
    pub produced: usize,
    /// Documents the store committed.
    pub accepted: usize,
    /// Items skipped because the transform failed on them.
    pub transform_errors: usize,
    pub failed_batches: usize,
    /// Documents not committed, with the store's reason.
    pub failures: Vec<BulkFailure>,
}

impl EnrichReport {
    pub fn deficit(&self) -> usize {
        self.produced.saturating_sub(self.accepted)
    }
}

pub struct EnrichmentDriver<'a> {
    store: &'a dyn DocumentStore,
    transform: &'a dyn Transform,
    ctx: EnrichContext<'a>,
    options: EnrichOptions,
    run_time: Option<DateTime<Utc>>,
    phase: Phase,
}

impl<'a> EnrichmentDriver<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        transform: &'a dyn Transform,
        ctx: EnrichContext<'a>,
    ) -> Self {
        Self {
            store,
            transform,
            ctx,
            options: EnrichOptions::default(),
            run_time: None,
            phase: Phase::Streaming,
        }
    }

    pub fn with_options(mut self, options: EnrichOptions) -> Self {
        self.options = options;
        self
    }

    /// Pin `metadata__enriched_on` instead of reading the clock.
    pub fn with_run_time(mut self, at: DateTime<Utc>) -> Self {
        self.run_time = Some(at);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "enrichment phase");
            self.phase = phase;
        }
    }

    pub async fn run(&mut self, source: &mut RawSource<'_>, index: &str) -> Result<EnrichReport> {
        let mut report = EnrichReport::default();
        let enriched_on = format_iso(self.run_time.unwrap_or_else(Utc::now));
        let tag = self.transform.source().to_string();
        self.enter(Phase::Streaming);

        self.store
            .ensure_index(index, Some(&enriched_mapping()))
            .await
            .with_context(|| format!("creating enriched index {}", index))?;

        let mut batch = BulkBatch::new();
        while let Some(hit) = source
            .next_hit()
            .await
            .with_context(|| format!("reading raw items from {}", source.index()))?
        {
            report.items += 1;
            let item: RawItem = match serde_json::from_value(hit) {
                Ok(item) => item,
                Err(e) => {
                    warn!(source = %tag, error = %e, "skipping unreadable raw item");
                    report.transform_errors += 1;
                    continue;
                }
            };

            let docs = match self.transform.document(&item, &self.ctx).await {
                Ok(docs) => docs,
                Err(e) => {
                    warn!(
                        source = %tag,
                        origin = %item.origin,
                        uuid = %item.uuid,
                        error = %e,
                        "transform failed, item skipped"
                    );
                    report.transform_errors += 1;
                    continue;
                }
            };

            let project = self.project_fields(&item);
            for mut doc in docs {
                stamp(&mut doc, &item, &tag, &enriched_on, &project);
                self.enter(Phase::Accumulating);
                if let Err(e) = batch.push(&doc.id, &doc.fields) {
                    warn!(source = %tag, id = %doc.id, error = %e, "document not serializable");
                    report.produced += 1;
                    report.failures.push(BulkFailure {
                        id: doc.id,
                        reason: e.to_string(),
                    });
                    continue;
                }
                if batch.is_full(self.options.bulk_size, self.options.bulk_bytes) {
                    self.enter(Phase::Flushing);
                    self.flush(&mut batch, index, &mut report).await?;
                    self.enter(Phase::Streaming);
                }
            }
        }

        self.enter(Phase::FinalFlush);
        self.flush(&mut batch, index, &mut report).await?;
        self.enter(Phase::Done);

        if report.deficit() > 0 {
            let ids: Vec<&str> = report.failures.iter().map(|f| f.id.as_str()).collect();
            error!(
                source = %tag,
                index,
                produced = report.produced,
                accepted = report.accepted,
                missing = report.deficit(),
                failed = ?ids,
                "enrichment left documents behind"
            );
        }
        if let Some(cache) = self.ctx.identities {
            let stats = cache.stats();
            debug!(hits = stats.hits, misses = stats.misses, "identity cache");
        }
        info!(
            source = %tag,
            index,
            items = report.items,
            produced = report.produced,
            accepted = report.accepted,
            "enrichment finished"
        );
        Ok(report)
    }

    fn project_fields(&self, item: &RawItem) -> Map<String, Value> {
        let repository = self.transform.project_repository(item);
        match &item.project {
            Some(project) => {
                let pinned = PinnedProject {
                    project,
                    inner: self.ctx.projects,
                };
                project_fields(&pinned, self.transform.source(), repository.as_deref(), &item.origin)
            }
            None => self.ctx.project_fields(
                self.transform.source(),
                repository.as_deref(),
                &item.origin,
            ),
        }
    }

    async fn flush(
        &self,
        batch: &mut BulkBatch,
        index: &str,
        report: &mut EnrichReport,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let attempted = batch.len();

        let outcome = match self.store.bulk(index, batch.body(), attempted).await {
            Ok(outcome) => outcome,
            Err(StoreError::Encoding(reason)) => {
                warn!(index, attempted, reason = %reason, "store could not decode batch, escaping non-ASCII");
                match self.store.bulk(index, &batch.to_ascii(), attempted).await {
                    Ok(outcome) => outcome,
                    Err(e) if attempted > 1 && !e.is_unavailable() => {
                        warn!(index, attempted, error = %e, "escaped batch refused, writing documents one by one");
                        self.write_singles(batch, index).await?
                    }
                    Err(e) => self.lost_batch(batch, index, e, report)?,
                }
            }
            Err(e) => self.lost_batch(batch, index, e, report)?,
        };

        if outcome.deficit() > 0 {
            warn!(
                index,
                attempted = outcome.attempted,
                accepted = outcome.accepted,
                missing = outcome.deficit(),
                "bulk write partially failed"
            );
        }
        report.produced += outcome.attempted;
        report.accepted += outcome.accepted;
        report.failures.extend(outcome.failures);
        batch.clear();
        Ok(())
    }

    /// Write each document of `batch` on its own, escaped, so only the
    /// documents the store refuses are lost.
    async fn write_singles(&self, batch: &BulkBatch, index: &str) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        for single in batch.singles() {
            outcome.attempted += 1;
            match self.store.bulk(index, &single.to_ascii(), 1).await {
                Ok(one) => {
                    outcome.accepted += one.accepted;
                    outcome.failures.extend(one.failures);
                }
                Err(e) if e.is_unavailable() => {
                    return Err(e).with_context(|| format!("writing to {}", index))
                }
                Err(e) => {
                    let id = single.ids().first().cloned().unwrap_or_default();
                    error!(index, id = %id, error = %e, "document refused");
                    outcome.failures.push(BulkFailure {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(outcome)
    }

    /// Account a batch the store refused outright. Unreachable stores
    /// propagate.
    fn lost_batch(
        &self,
        batch: &BulkBatch,
        index: &str,
        err: StoreError,
        report: &mut EnrichReport,
    ) -> Result<BulkOutcome> {
        if err.is_unavailable() {
            return Err(err).with_context(|| format!("writing to {}", index));
        }
        error!(index, attempted = batch.len(), error = %err, "bulk write refused");
        report.failed_batches += 1;
        let reason = err.to_string();
        Ok(BulkOutcome {
            attempted: batch.len(),
            accepted: 0,
            failures: batch
                .ids()
                .iter()
                .map(|id| BulkFailure {
                    id: id.clone(),
                    reason: reason.clone(),
                })
                .collect(),
        })
    }
}

/// Mapper answering one fixed project, with metadata from `inner`.
struct PinnedProject<'a> {
    project: &'a str,
    inner: &'a dyn ProjectMapper,
}

impl ProjectMapper for PinnedProject<'_> {
    fn project_for(&self, _source: &str, _repository: Option<&str>, _origin: &str) -> Option<String> {
        Some(self.project.to_string())
    }

    fn project_meta(&self, project: &str) -> Option<Map<String, Value>> {
        self.inner.project_meta(project)
    }
}

/// Fill the bookkeeping fields a transform left out.
fn stamp(
    doc: &mut EnrichedDocument,
    item: &RawItem,
    source: &str,
    enriched_on: &str,
    project: &Map<String, Value>,
) {
    let mut raw = Map::new();
    raw.insert(FIELD_UPDATED_ON.to_string(), json!(item.metadata_updated_on));
    raw.insert(FIELD_TIMESTAMP.to_string(), json!(item.metadata_timestamp));
    if let Some(offset) = item.offset {
        raw.insert(FIELD_OFFSET.to_string(), json!(offset));
    }
    raw.insert("origin".to_string(), json!(item.origin));
    if let Some(tag) = &item.tag {
        raw.insert("tag".to_string(), json!(tag));
    }
    raw.insert("uuid".to_string(), json!(item.uuid));

    let backend = item
        .extra
        .get("backend_name")
        .and_then(Value::as_str)
        .unwrap_or(source);
    raw.insert("metadata__enrich_version".to_string(), json!(ENRICH_VERSION));
    raw.insert("metadata__enriched_on".to_string(), json!(enriched_on));
    raw.insert("metadata__backend_name".to_string(), json!(backend));

    for (k, v) in raw.into_iter().chain(project.clone()) {
        if !doc.contains(&k) {
            doc.insert(k, v);
        }
    }
}
