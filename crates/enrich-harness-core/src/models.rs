//! Core data models used throughout Enrich Harness.
//!
//! These types represent the raw items, enriched documents, identities,
//! and watermarks that flow through the feed and enrichment pipeline.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::dates::unixtime_to_iso;

/// Field carrying the normalized event time of a raw item.
pub const FIELD_UPDATED_ON: &str = "metadata__updated_on";
/// Field carrying the normalized collection time of a raw item.
pub const FIELD_TIMESTAMP: &str = "metadata__timestamp";
/// Field carrying the monotonic position of offset-based sources.
pub const FIELD_OFFSET: &str = "offset";

/// Collector payload keys that are item metadata rather than source data.
const METADATA_KEYS: &[&str] = &[
    "origin",
    "uuid",
    "updated_on",
    "timestamp",
    "offset",
    "category",
    "tag",
    "backend_name",
    "backend_version",
    "perceval_version",
    "classified_fields_filtered",
    "search_fields",
];

/// Why a collector payload could not be turned into a [`RawItem`].
#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no '{0}' field")]
    MissingField(&'static str),
    #[error("payload field '{0}' is not a valid epoch")]
    BadEpoch(&'static str),
}

/// One ingested record with normalized metadata.
///
/// Built once by the feeder from collector output; afterwards the shape is
/// uniform: `data` always holds the source payload, and both metadata
/// dates are ISO-8601 strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub origin: String,
    pub uuid: String,
    /// Event time, epoch seconds as reported by the source.
    pub updated_on: f64,
    /// Collection time, epoch seconds.
    pub timestamp: f64,
    #[serde(rename = "metadata__updated_on")]
    pub metadata_updated_on: String,
    #[serde(rename = "metadata__timestamp")]
    pub metadata_timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub data: Value,
    /// Remaining collector metadata (`backend_name`, `perceval_version`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawItem {
    /// Normalize a collector payload.
    ///
    /// Converts the epoch `updated_on` / `timestamp` pair to ISO-8601,
    /// derives a content-addressed `uuid` when the collector gave none,
    /// and wraps payloads without a `data` key so that `data` is always
    /// the source record.
    pub fn from_payload(payload: Value) -> Result<Self, PayloadError> {
        let Value::Object(mut obj) = payload else {
            return Err(PayloadError::NotAnObject);
        };

        let origin = match obj.get("origin").and_then(Value::as_str) {
            Some(o) if !o.is_empty() => o.to_string(),
            _ => return Err(PayloadError::MissingField("origin")),
        };
        let updated_on = epoch_field(&obj, "updated_on")?;
        let timestamp = epoch_field(&obj, "timestamp")?;
        let metadata_updated_on =
            unixtime_to_iso(updated_on).ok_or(PayloadError::BadEpoch("updated_on"))?;
        let metadata_timestamp =
            unixtime_to_iso(timestamp).ok_or(PayloadError::BadEpoch("timestamp"))?;

        let offset = obj.get("offset").and_then(Value::as_i64);
        let category = obj
            .get("category")
            .and_then(Value::as_str)
            .map(str::to_string);
        let tag = obj.get("tag").and_then(Value::as_str).map(str::to_string);
        let given_uuid = obj
            .get("uuid")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        let data = match obj.remove("data") {
            Some(data) => data,
            None => {
                let mut data = Map::new();
                for (k, v) in obj.iter() {
                    if !METADATA_KEYS.contains(&k.as_str()) {
                        data.insert(k.clone(), v.clone());
                    }
                }
                Value::Object(data)
            }
        };

        let uuid = given_uuid.unwrap_or_else(|| content_uuid(&origin, &data));

        let mut extra = Map::new();
        for key in [
            "backend_name",
            "backend_version",
            "perceval_version",
            "classified_fields_filtered",
            "search_fields",
        ] {
            if let Some(v) = obj.remove(key) {
                extra.insert(key.to_string(), v);
            }
        }

        Ok(RawItem {
            origin,
            uuid,
            updated_on,
            timestamp,
            metadata_updated_on,
            metadata_timestamp,
            offset,
            category,
            tag,
            project: None,
            data,
            extra,
        })
    }

    /// Event time as a UTC datetime.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        crate::dates::unixtime_to_datetime(self.updated_on)
    }

    /// Look up a nested value in `data` by dotted path (`"author.login"`).
    pub fn data_path(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.data, |cur, segment| cur.get(segment))
    }
}

fn epoch_field(obj: &Map<String, Value>, field: &'static str) -> Result<f64, PayloadError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(PayloadError::MissingField(field)),
        Some(Value::Number(n)) => n.as_f64().ok_or(PayloadError::BadEpoch(field)),
        Some(Value::String(s)) => s.trim().parse::<f64>().map_err(|_| PayloadError::BadEpoch(field)),
        Some(_) => Err(PayloadError::BadEpoch(field)),
    }
}

/// Derive a stable id from the origin and the canonical payload JSON.
pub fn content_uuid(origin: &str, data: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(origin.as_bytes());
    hasher.update(b":");
    hasher.update(data.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..40].to_string()
}

/// The analytics-ready projection of a raw item.
///
/// `id` is the document id inside the destination index; `fields` is the
/// JSON body written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedDocument {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl EnrichedDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// A document for a sub-entity (comment, answer, event) of a raw item.
    ///
    /// Ids take the form `<parent_uuid>_<suffix>` so the parent and all its
    /// sub-entities coexist in one index.
    pub fn sub_entity(parent_uuid: &str, suffix: &str) -> Self {
        Self::new(format!("{}_{}", parent_uuid, suffix))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Merge a field map, overwriting existing keys.
    pub fn extend(&mut self, other: Map<String, Value>) {
        self.fields.extend(other);
    }
}

/// A free-form person-like identity found in a raw item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
}

impl Identity {
    pub fn new(name: Option<&str>, email: Option<&str>, username: Option<&str>) -> Self {
        let clean = |v: Option<&str>| v.filter(|s| !s.trim().is_empty()).map(str::to_string);
        Self {
            name: clean(name),
            email: clean(email),
            username: clean(username),
        }
    }

    /// True when no field carries a value.
    pub fn is_empty(&self) -> bool {
        [&self.name, &self.email, &self.username]
            .iter()
            .all(|f| f.as_deref().map_or(true, |s| s.trim().is_empty()))
    }

    /// Domain part of the email, if any.
    pub fn email_domain(&self) -> Option<String> {
        self.email.as_deref().and_then(email_domain)
    }
}

pub fn email_domain(email: &str) -> Option<String> {
    email
        .split_once('@')
        .map(|(_, domain)| domain.to_string())
        .filter(|d| !d.is_empty())
}

/// Canonical keys an identity resolves to in the identity store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIds {
    pub id: Option<String>,
    pub uuid: Option<String>,
}

impl ResolvedIds {
    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn is_resolved(&self) -> bool {
        self.uuid.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Profile data attached to a unique identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: Option<String>,
    pub email: Option<String>,
    pub gender: Option<String>,
    pub gender_acc: Option<i64>,
    #[serde(default)]
    pub is_bot: bool,
}

/// A time-bounded organization affiliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub organization: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Enrollment {
    pub fn covers(&self, at: NaiveDateTime) -> bool {
        at >= self.start && at <= self.end
    }
}

/// Which kind of position a stream is tracked by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkKind {
    Date,
    Offset,
}

/// A last-synchronized position.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub enum WatermarkValue {
    Date(DateTime<Utc>),
    Offset(i64),
}

impl WatermarkValue {
    pub fn kind(&self) -> WatermarkKind {
        match self {
            WatermarkValue::Date(_) => WatermarkKind::Date,
            WatermarkValue::Offset(_) => WatermarkKind::Offset,
        }
    }

    /// Serialized form used by persistent trackers.
    pub fn encode(&self) -> String {
        match self {
            WatermarkValue::Date(dt) => crate::dates::format_iso(*dt),
            WatermarkValue::Offset(o) => o.to_string(),
        }
    }

    pub fn decode(kind: WatermarkKind, raw: &str) -> Option<Self> {
        match kind {
            WatermarkKind::Date => crate::dates::parse_datetime(raw).map(WatermarkValue::Date),
            WatermarkKind::Offset => raw.trim().parse().ok().map(WatermarkValue::Offset),
        }
    }

    /// The larger of two positions of the same kind.
    pub fn max(self, other: WatermarkValue) -> WatermarkValue {
        match (self, other) {
            (WatermarkValue::Date(a), WatermarkValue::Date(b)) => WatermarkValue::Date(a.max(b)),
            (WatermarkValue::Offset(a), WatermarkValue::Offset(b)) => {
                WatermarkValue::Offset(a.max(b))
            }
            (a, _) => a,
        }
    }
}

/// The last-synchronized position of one logical stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Watermark {
    pub stream_key: String,
    pub value: WatermarkValue,
}

/// A field-equality predicate (`term` query).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Whether a JSON document satisfies this predicate.
    pub fn matches(&self, doc: &Value) -> bool {
        doc.get(&self.field) == Some(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn perceval_payload() -> Value {
        json!({
            "backend_name": "GitHub",
            "origin": "https://github.com/acme/widgets",
            "uuid": "0f1e2d",
            "updated_on": 1704412800.0,
            "timestamp": 1704499200.25,
            "category": "issue",
            "tag": "https://github.com/acme/widgets",
            "data": { "number": 7, "user": { "login": "jdoe" } }
        })
    }

    #[test]
    fn normalizes_perceval_payload() {
        let item = RawItem::from_payload(perceval_payload()).unwrap();
        assert_eq!(item.origin, "https://github.com/acme/widgets");
        assert_eq!(item.uuid, "0f1e2d");
        assert_eq!(item.metadata_updated_on, "2024-01-05T00:00:00+00:00");
        assert_eq!(item.metadata_timestamp, "2024-01-06T00:00:00.250+00:00");
        assert_eq!(item.category.as_deref(), Some("issue"));
        assert_eq!(item.data["number"], 7);
        assert_eq!(item.extra["backend_name"], "GitHub");
    }

    #[test]
    fn serialized_item_carries_metadata_fields() {
        let item = RawItem::from_payload(perceval_payload()).unwrap();
        let doc = serde_json::to_value(&item).unwrap();
        assert_eq!(doc[FIELD_UPDATED_ON], "2024-01-05T00:00:00+00:00");
        assert_eq!(doc["backend_name"], "GitHub");
        assert!(doc.get("offset").is_none());
        let back: RawItem = serde_json::from_value(doc).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn payload_without_data_is_wrapped() {
        let payload = json!({
            "origin": "mbox:dev",
            "updated_on": 1704412800,
            "timestamp": "1704412801",
            "subject": "hello",
            "from": "a@b.c"
        });
        let item = RawItem::from_payload(payload).unwrap();
        assert_eq!(item.data, json!({ "subject": "hello", "from": "a@b.c" }));
        assert_eq!(item.uuid.len(), 40);
        assert_eq!(item.timestamp, 1704412801.0);
    }

    #[test]
    fn content_uuid_is_deterministic() {
        let data = json!({ "id": 1 });
        assert_eq!(content_uuid("o", &data), content_uuid("o", &data));
        assert_ne!(content_uuid("o", &data), content_uuid("p", &data));
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert_eq!(
            RawItem::from_payload(json!([1, 2])),
            Err(PayloadError::NotAnObject)
        );
        assert_eq!(
            RawItem::from_payload(json!({ "updated_on": 1, "timestamp": 1 })),
            Err(PayloadError::MissingField("origin"))
        );
        assert_eq!(
            RawItem::from_payload(json!({ "origin": "x", "updated_on": "soon", "timestamp": 1 })),
            Err(PayloadError::BadEpoch("updated_on"))
        );
    }

    #[test]
    fn data_path_walks_nested_objects() {
        let item = RawItem::from_payload(perceval_payload()).unwrap();
        assert_eq!(item.data_path("user.login"), Some(&json!("jdoe")));
        assert_eq!(item.data_path("user.email"), None);
    }

    #[test]
    fn identity_emptiness_and_domain() {
        assert!(Identity::default().is_empty());
        assert!(Identity::new(Some(" "), None, Some("")).is_empty());
        let id = Identity::new(Some("Jane"), Some("jane@acme.org"), None);
        assert!(!id.is_empty());
        assert_eq!(id.email_domain().as_deref(), Some("acme.org"));
        assert_eq!(email_domain("broken"), None);
    }

    #[test]
    fn watermark_values_round_trip_and_order() {
        let a = WatermarkValue::Offset(5);
        assert_eq!(WatermarkValue::decode(WatermarkKind::Offset, &a.encode()), Some(a));
        assert_eq!(a.max(WatermarkValue::Offset(9)), WatermarkValue::Offset(9));
        let d = WatermarkValue::Date(crate::dates::parse_datetime("2024-01-05").unwrap());
        assert_eq!(WatermarkValue::decode(WatermarkKind::Date, &d.encode()), Some(d));
    }

    #[test]
    fn sub_entity_ids_share_parent_prefix() {
        let doc = EnrichedDocument::sub_entity("abc", "answer_3");
        assert_eq!(doc.id, "abc_answer_3");
    }
}
