//! Watermark tracking.
//!
//! A watermark is the last synchronized position of a stream: a date for
//! from-date collectors, an offset for offset collectors. `get` returning
//! `None` means no prior run and triggers a full fetch, so a failed lookup
//! must surface as an error and never as `None`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::models::{Filter, Watermark, WatermarkKind, WatermarkValue, FIELD_OFFSET, FIELD_UPDATED_ON};
use crate::store::{DocumentStore, StoreError};

#[async_trait]
pub trait WatermarkTracker: Send + Sync {
    /// Last position of `stream_key`, scoped by `filters`.
    async fn get(
        &self,
        stream_key: &str,
        kind: WatermarkKind,
        filters: &[Filter],
    ) -> Result<Option<Watermark>>;

    /// Record progress. Never moves a stream backwards.
    async fn advance(&self, stream_key: &str, value: WatermarkValue) -> Result<()>;
}

/// Watermarks read back from the raw index itself.
///
/// The position is the maximum `metadata__updated_on` (or `offset`) of the
/// stored items matching the filters, so storing a batch is what advances
/// it. [`advance`](WatermarkTracker::advance) keeps an in-process floor so
/// reads within a run never go backwards while the index refreshes.
pub struct IndexWatermarks {
    store: Arc<dyn DocumentStore>,
    index: String,
    date_field: String,
    offset_field: String,
    floor: Mutex<HashMap<String, WatermarkValue>>,
}

impl IndexWatermarks {
    pub fn new(store: Arc<dyn DocumentStore>, index: &str) -> Self {
        Self {
            store,
            index: index.to_string(),
            date_field: FIELD_UPDATED_ON.to_string(),
            offset_field: FIELD_OFFSET.to_string(),
            floor: Mutex::new(HashMap::new()),
        }
    }

    /// Track dates on another field (`metadata__timestamp` for enriched
    /// indices).
    pub fn with_date_field(mut self, field: &str) -> Self {
        self.date_field = field.to_string();
        self
    }

    fn floor(&self, stream_key: &str) -> Option<WatermarkValue> {
        self.floor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_key)
            .copied()
    }
}

#[async_trait]
impl WatermarkTracker for IndexWatermarks {
    async fn get(
        &self,
        stream_key: &str,
        kind: WatermarkKind,
        filters: &[Filter],
    ) -> Result<Option<Watermark>> {
        let field = match kind {
            WatermarkKind::Date => &self.date_field,
            WatermarkKind::Offset => &self.offset_field,
        };
        let stored = match self.store.max_value(&self.index, field, filters).await {
            Ok(max) => match kind {
                WatermarkKind::Date => max.as_datetime().map(WatermarkValue::Date),
                WatermarkKind::Offset => max.as_offset().map(WatermarkValue::Offset),
            },
            Err(StoreError::IndexMissing(_)) => None,
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("reading watermark of '{}' from {}", stream_key, self.index)
                })
            }
        };

        let floor = self.floor(stream_key).filter(|f| f.kind() == kind);
        let value = match (stored, floor) {
            (Some(s), Some(f)) => Some(s.max(f)),
            (s, f) => s.or(f),
        };
        debug!(stream = stream_key, index = %self.index, ?value, "watermark");
        Ok(value.map(|value| Watermark {
            stream_key: stream_key.to_string(),
            value,
        }))
    }

    async fn advance(&self, stream_key: &str, value: WatermarkValue) -> Result<()> {
        let mut floor = self.floor.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match floor.get(stream_key) {
            Some(current) if current.kind() == value.kind() => current.max(value),
            _ => value,
        };
        floor.insert(stream_key.to_string(), next);
        Ok(())
    }
}
