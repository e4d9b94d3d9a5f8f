//! Collector interface.
//!
//! A collector yields raw item payloads from a live source. Each collector
//! supports exactly one resume mode, advertised by
//! [`Collector::cursor_kind`]; the feeder reads it to decide whether to
//! pass a from-date, an offset, or nothing.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::Value;

use crate::dates::unixtime_to_datetime;
use crate::models::WatermarkKind;

/// Which resume parameter a collector accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    FromDate,
    Offset,
    /// Always fetches everything.
    Unsupported,
}

impl CursorKind {
    pub fn watermark_kind(self) -> Option<WatermarkKind> {
        match self {
            CursorKind::FromDate => Some(WatermarkKind::Date),
            CursorKind::Offset => Some(WatermarkKind::Offset),
            CursorKind::Unsupported => None,
        }
    }
}

/// Where a fetch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCursor {
    Full,
    /// Items updated at or after this naive UTC instant.
    FromDate(NaiveDateTime),
    /// Items at or after this offset.
    Offset(i64),
}

/// A lazy, possibly unbounded sequence of payloads.
#[async_trait]
pub trait ItemStream: Send {
    /// Next payload, `Ok(None)` at end of stream.
    async fn next_item(&mut self) -> Result<Option<Value>>;
}

/// Producer of raw item payloads for one origin.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    /// Origin stamped on every item (repository URL, mailing list, ...).
    fn origin(&self) -> &str;

    fn cursor_kind(&self) -> CursorKind;

    async fn fetch(&self, cursor: FetchCursor) -> Result<Box<dyn ItemStream>>;
}

/// Stream over an in-memory list of payloads.
pub struct VecStream {
    items: std::vec::IntoIter<Value>,
}

impl VecStream {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

#[async_trait]
impl ItemStream for VecStream {
    async fn next_item(&mut self) -> Result<Option<Value>> {
        Ok(self.items.next())
    }
}

/// Whether a payload falls at or after `cursor`.
///
/// Payloads without a readable position are kept.
pub fn payload_after(payload: &Value, cursor: FetchCursor) -> bool {
    match cursor {
        FetchCursor::Full => true,
        FetchCursor::FromDate(since) => payload
            .get("updated_on")
            .and_then(epoch_of)
            .and_then(unixtime_to_datetime)
            .map_or(true, |dt| dt.naive_utc() >= since),
        FetchCursor::Offset(offset) => payload
            .get("offset")
            .and_then(Value::as_i64)
            .map_or(true, |o| o >= offset),
    }
}

fn epoch_of(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Collector over a fixed payload list, honoring either cursor mode.
pub struct StaticCollector {
    name: String,
    origin: String,
    kind: CursorKind,
    items: Vec<Value>,
}

impl StaticCollector {
    pub fn new(name: &str, origin: &str, kind: CursorKind, items: Vec<Value>) -> Self {
        Self {
            name: name.to_string(),
            origin: origin.to_string(),
            kind,
            items,
        }
    }
}

#[async_trait]
impl Collector for StaticCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn cursor_kind(&self) -> CursorKind {
        self.kind
    }

    async fn fetch(&self, cursor: FetchCursor) -> Result<Box<dyn ItemStream>> {
        let items = self
            .items
            .iter()
            .filter(|p| payload_after(p, cursor))
            .cloned()
            .collect();
        Ok(Box::new(VecStream::new(items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dates::parse_naive_utc;
    use serde_json::json;

    #[tokio::test]
    async fn static_collector_filters_by_date() {
        let collector = StaticCollector::new(
            "c",
            "o",
            CursorKind::FromDate,
            vec![
                json!({ "origin": "o", "updated_on": 1704067200, "timestamp": 1 }),
                json!({ "origin": "o", "updated_on": 1704412800, "timestamp": 1 }),
            ],
        );
        let since = parse_naive_utc("2024-01-05").unwrap();
        let mut stream = collector.fetch(FetchCursor::FromDate(since)).await.unwrap();
        let first = stream.next_item().await.unwrap().unwrap();
        assert_eq!(first["updated_on"], 1704412800);
        assert!(stream.next_item().await.unwrap().is_none());
    }

    #[test]
    fn offset_cursor_is_inclusive() {
        let p = json!({ "offset": 5 });
        assert!(payload_after(&p, FetchCursor::Offset(5)));
        assert!(!payload_after(&p, FetchCursor::Offset(6)));
        assert!(payload_after(&json!({}), FetchCursor::Offset(6)));
    }

    #[test]
    fn cursor_kind_maps_to_watermark_kind() {
        assert_eq!(CursorKind::Offset.watermark_kind(), Some(WatermarkKind::Offset));
        assert_eq!(CursorKind::Unsupported.watermark_kind(), None);
    }
}
