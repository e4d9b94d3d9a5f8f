//! NDJSON bulk codec.
//!
//! A bulk body is a sequence of `{"index":{"_id":..}}` action lines, each
//! followed by the document line. [`BulkBatch`] accumulates documents and
//! tracks both the item count and the encoded size so callers can flush on
//! whichever bound is hit first.

use serde::Serialize;
use serde_json::{json, Value};

/// An NDJSON bulk body under construction.
#[derive(Debug, Default, Clone)]
pub struct BulkBatch {
    body: String,
    ids: Vec<String>,
}

impl BulkBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one document with its id.
    pub fn push<T: Serialize + ?Sized>(&mut self, id: &str, doc: &T) -> serde_json::Result<()> {
        let action = json!({ "index": { "_id": id } });
        let line = serde_json::to_string(doc)?;
        self.body.push_str(&action.to_string());
        self.body.push('\n');
        self.body.push_str(&line);
        self.body.push('\n');
        self.ids.push(id.to_string());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Encoded size in bytes.
    pub fn byte_len(&self) -> usize {
        self.body.len()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Whether either flush bound has been reached.
    pub fn is_full(&self, max_items: usize, max_bytes: usize) -> bool {
        self.len() >= max_items || self.byte_len() >= max_bytes
    }

    /// The same body with every non-ASCII character escaped as `\uXXXX`.
    ///
    /// Used to re-send a batch the store refused to decode.
    pub fn to_ascii(&self) -> String {
        escape_non_ascii(&self.body)
    }

    /// One single-document batch per document, in order.
    ///
    /// Used to find the document a store keeps refusing.
    pub fn singles(&self) -> Vec<BulkBatch> {
        let mut lines = self.body.lines();
        self.ids
            .iter()
            .map(|id| {
                let mut body = String::new();
                for line in lines.by_ref().take(2) {
                    body.push_str(line);
                    body.push('\n');
                }
                BulkBatch {
                    body,
                    ids: vec![id.clone()],
                }
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.body.clear();
        self.ids.clear();
    }
}

/// Escape non-ASCII characters as JSON `\uXXXX` sequences (surrogate pairs
/// above the BMP).
///
/// Only valid on JSON text: raw non-ASCII may only appear inside strings,
/// where an escape decodes back to the same character.
pub fn escape_non_ascii(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut buf = [0u16; 2];
    for c in s.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            for unit in c.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Split an NDJSON bulk body back into `(id, document)` pairs.
pub fn parse_ndjson(body: &str) -> Result<Vec<(String, Value)>, String> {
    let mut out = Vec::new();
    let mut lines = body.lines().filter(|l| !l.trim().is_empty());
    while let Some(action) = lines.next() {
        let action: Value =
            serde_json::from_str(action).map_err(|e| format!("bad action line: {e}"))?;
        let id = action
            .pointer("/index/_id")
            .and_then(Value::as_str)
            .ok_or_else(|| "action line without index._id".to_string())?
            .to_string();
        let doc = lines
            .next()
            .ok_or_else(|| format!("action for '{id}' has no document line"))?;
        let doc: Value =
            serde_json::from_str(doc).map_err(|e| format!("bad document line for '{id}': {e}"))?;
        out.push((id, doc));
    }
    Ok(out)
}

/// A document the store refused.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkFailure {
    pub id: String,
    pub reason: String,
}

/// Result of one bulk write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkOutcome {
    pub attempted: usize,
    pub accepted: usize,
    pub failures: Vec<BulkFailure>,
}

impl BulkOutcome {
    pub fn all_accepted(attempted: usize) -> Self {
        Self {
            attempted,
            accepted: attempted,
            failures: Vec::new(),
        }
    }

    /// Documents attempted but not accepted.
    pub fn deficit(&self) -> usize {
        self.attempted.saturating_sub(self.accepted)
    }

    pub fn merge(&mut self, other: BulkOutcome) {
        self.attempted += other.attempted;
        self.accepted += other.accepted;
        self.failures.extend(other.failures);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_writes_action_and_document_lines() {
        let mut batch = BulkBatch::new();
        batch.push("a1", &json!({ "title": "x" })).unwrap();
        batch.push("a2", &json!({ "title": "y" })).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.body(),
            "{\"index\":{\"_id\":\"a1\"}}\n{\"title\":\"x\"}\n{\"index\":{\"_id\":\"a2\"}}\n{\"title\":\"y\"}\n"
        );
        assert_eq!(batch.ids(), &["a1".to_string(), "a2".to_string()]);
    }

    #[test]
    fn fullness_tracks_both_bounds() {
        let mut batch = BulkBatch::new();
        batch.push("1", &json!({ "v": "0123456789" })).unwrap();
        assert!(!batch.is_full(2, 1024));
        assert!(batch.is_full(1, 1024));
        assert!(batch.is_full(10, batch.byte_len()));
    }

    #[test]
    fn singles_split_per_document() {
        let mut batch = BulkBatch::new();
        batch.push("a1", &json!({ "title": "x" })).unwrap();
        batch.push("a2", &json!({ "title": "y" })).unwrap();
        let singles = batch.singles();
        assert_eq!(singles.len(), 2);
        assert_eq!(singles[1].ids(), &["a2".to_string()]);
        assert_eq!(singles[1].body(), "{\"index\":{\"_id\":\"a2\"}}\n{\"title\":\"y\"}\n");
        let joined: String = singles.iter().map(BulkBatch::body).collect();
        assert_eq!(joined, batch.body());
    }

    #[test]
    fn ascii_escaping_keeps_json_equivalent() {
        let mut batch = BulkBatch::new();
        batch.push("n", &json!({ "name": "Jösé 🦀" })).unwrap();
        let ascii = batch.to_ascii();
        assert!(ascii.is_ascii());
        assert!(ascii.contains("\\u00f6"));
        assert!(ascii.contains("\\ud83e\\udd80"));
        let parsed = parse_ndjson(&ascii).unwrap();
        assert_eq!(parsed[0].1["name"], "Jösé 🦀");
    }

    #[test]
    fn parse_rejects_dangling_action() {
        let err = parse_ndjson("{\"index\":{\"_id\":\"x\"}}\n").unwrap_err();
        assert!(err.contains("no document line"));
    }

    #[test]
    fn outcome_deficit_and_merge() {
        let mut outcome = BulkOutcome::all_accepted(3);
        outcome.merge(BulkOutcome {
            attempted: 2,
            accepted: 1,
            failures: vec![BulkFailure {
                id: "b".into(),
                reason: "mapper_parsing_exception".into(),
            }],
        });
        assert_eq!(outcome.attempted, 5);
        assert_eq!(outcome.deficit(), 1);
        assert_eq!(outcome.failures.len(), 1);
    }
}
