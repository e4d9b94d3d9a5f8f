//! JSON-lines collector.
//!
//! Reads one payload per line from a file, lazily. Lines are collector
//! output as written by an external fetcher: an object with `updated_on`
//! (epoch seconds) and either a `data` object or the record's own fields.
//! The collector fills in what a fetcher may leave out:
//!
//! - `origin`: always the configured origin, replacing the line's own
//! - `timestamp`: the time the line was read
//! - `offset`: the zero-based line number, in offset mode
//! - `backend_name`: the collector name
//!
//! Blank lines are skipped; lines that are not JSON objects are logged and
//! skipped.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::warn;

use enrich_harness_core::collector::{payload_after, Collector, CursorKind, FetchCursor, ItemStream};

use crate::config::{CursorMode, SourceConfig};

pub struct JsonlCollector {
    name: String,
    origin: String,
    path: PathBuf,
    kind: CursorKind,
}

impl JsonlCollector {
    pub fn new(name: &str, origin: &str, path: &Path, kind: CursorKind) -> Self {
        Self {
            name: name.to_string(),
            origin: origin.to_string(),
            path: path.to_path_buf(),
            kind,
        }
    }

    pub fn from_config(name: &str, source: &SourceConfig) -> Self {
        let kind = match source.cursor {
            CursorMode::FromDate => CursorKind::FromDate,
            CursorMode::Offset => CursorKind::Offset,
            CursorMode::None => CursorKind::Unsupported,
        };
        Self::new(name, &source.origin, &source.path, kind)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Collector for JsonlCollector {
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
        if !self.path.exists() {
            bail!("collector file does not exist: {}", self.path.display());
        }
        let file = File::open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        Ok(Box::new(JsonlStream {
            lines: BufReader::new(file).lines(),
            line_no: 0,
            cursor,
            collector: self.name.clone(),
            origin: self.origin.clone(),
            numbered: self.kind == CursorKind::Offset,
            path: self.path.clone(),
        }))
    }
}

struct JsonlStream {
    lines: Lines<BufReader<File>>,
    line_no: i64,
    cursor: FetchCursor,
    collector: String,
    origin: String,
    numbered: bool,
    path: PathBuf,
}

impl JsonlStream {
    fn complete(&self, payload: &mut Value, offset: i64) {
        let Some(obj) = payload.as_object_mut() else {
            return;
        };
        match obj.get("origin").and_then(Value::as_str) {
            Some(origin) if origin != self.origin => warn!(
                path = %self.path.display(),
                line = offset + 1,
                origin,
                configured = %self.origin,
                "line origin replaced by the configured origin"
            ),
            _ => {}
        }
        obj.insert("origin".to_string(), json!(self.origin));
        obj.entry("backend_name")
            .or_insert_with(|| json!(self.collector));
        obj.entry("timestamp")
            .or_insert_with(|| json!(Utc::now().timestamp_millis() as f64 / 1000.0));
        if self.numbered {
            obj.entry("offset").or_insert_with(|| json!(offset));
        }
    }
}

#[async_trait]
impl ItemStream for JsonlStream {
    async fn next_item(&mut self) -> Result<Option<Value>> {
        while let Some(line) = self
            .lines
            .next_line()
            .await
            .with_context(|| format!("reading {}", self.path.display()))?
        {
            let offset = self.line_no;
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let mut payload: Value = match serde_json::from_str(&line) {
                Ok(v @ Value::Object(_)) => v,
                Ok(_) => {
                    warn!(path = %self.path.display(), line = offset + 1, "line is not a JSON object, skipped");
                    continue;
                }
                Err(e) => {
                    warn!(path = %self.path.display(), line = offset + 1, error = %e, "invalid JSON line, skipped");
                    continue;
                }
            };
            self.complete(&mut payload, offset);
            if payload_after(&payload, self.cursor) {
                return Ok(Some(payload));
            }
        }
        Ok(None)
    }
}
