//! Per-source transforms and the registry that selects them.
//!
//! A [`Transform`] turns one normalized [`RawItem`] into one or more
//! [`EnrichedDocument`]s and lists the identities found in an item. Each
//! data source provides one as an ordinary value; the pipeline looks it up
//! by source tag in a [`TransformRegistry`].
//!
//! ```text
//! RawItem ──▶ Transform::document(item, ctx) ──▶ [EnrichedDocument]
//!                 │
//!                 ├── ctx.role_fields(...)   (IdentityCache)
//!                 └── ctx.project_fields(...) (ProjectMapper)
//! ```
//!
//! Bookkeeping fields (raw metadata copies, enrichment version and time,
//! project fields) are stamped by the enrichment driver afterwards, so a
//! transform only produces its business fields.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::{json, Map, Value};

use crate::dates::{format_iso, parse_datetime};
use crate::identity::IdentityCache;
use crate::models::{EnrichedDocument, Identity, RawItem};
use crate::project::{project_fields, ProjectMapper};

// ═══════════════════════════════════════════════════════════════════════
// Enrichment context
// ═══════════════════════════════════════════════════════════════════════

/// Collaborators available to a transform for one run.
#[derive(Clone, Copy)]
pub struct EnrichContext<'a> {
    /// `None` when identity resolution is disabled.
    pub identities: Option<&'a IdentityCache>,
    pub projects: &'a dyn ProjectMapper,
}

impl<'a> EnrichContext<'a> {
    pub fn new(identities: Option<&'a IdentityCache>, projects: &'a dyn ProjectMapper) -> Self {
        Self {
            identities,
            projects,
        }
    }

    /// `<role>_*` identity fields, or nothing when resolution is disabled.
    pub async fn role_fields(
        &self,
        identity: Option<&Identity>,
        source: &str,
        role: &str,
        at: Option<NaiveDateTime>,
    ) -> Map<String, Value> {
        match self.identities {
            Some(cache) => cache.role_fields(identity, source, role, at).await,
            None => Map::new(),
        }
    }

    pub fn project_fields(
        &self,
        source: &str,
        repository: Option<&str>,
        origin: &str,
    ) -> Map<String, Value> {
        project_fields(self.projects, source, repository, origin)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Transform trait
// ═══════════════════════════════════════════════════════════════════════

/// Source-specific mapping from raw items to enriched documents.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Source tag (`"git"`, `"github"`, ...) used for registry lookup,
    /// identity resolution, and project mapping.
    fn source(&self) -> &str;

    /// Identity roles this source fills (`author`, `assignee`, ...).
    fn roles(&self) -> Vec<String> {
        vec!["author".to_string()]
    }

    /// Enriched documents for one item. Sub-entities share the parent's
    /// uuid as id prefix (see [`EnrichedDocument::sub_entity`]).
    async fn document(&self, item: &RawItem, ctx: &EnrichContext<'_>)
        -> Result<Vec<EnrichedDocument>>;

    /// Identities mentioned in an item, for identity loading.
    fn identities<'a>(&'a self, item: &'a RawItem) -> Box<dyn Iterator<Item = Identity> + 'a>;

    /// Pre-store adjustment applied by the feeder.
    fn fixup(&self, _item: &mut RawItem) {}

    /// Items for which this returns `true` are not stored.
    fn drop_item(&self, _item: &RawItem) -> bool {
        false
    }

    /// Repository key used for project mapping, when it differs from the
    /// item's origin.
    fn project_repository(&self, _item: &RawItem) -> Option<String> {
        None
    }
}

/// `grimoire_creation_date` and the `is_<source>_<type>` marker.
pub fn grimoire_fields(creation_date: &str, source: &str, item_type: &str) -> Map<String, Value> {
    let date = parse_datetime(creation_date)
        .map(format_iso)
        .unwrap_or_else(|| creation_date.to_string());
    let mut fields = Map::new();
    fields.insert("grimoire_creation_date".to_string(), json!(date));
    fields.insert(format!("is_{source}_{item_type}"), json!(1));
    fields
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Transforms keyed by source tag.
#[derive(Clone)]
pub struct TransformRegistry {
    transforms: BTreeMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self {
            transforms: BTreeMap::new(),
        }
    }

    /// Register a transform, replacing any previous one for its source.
    pub fn register(&mut self, transform: Arc<dyn Transform>) {
        self.transforms
            .insert(transform.source().to_string(), transform);
    }

    pub fn get(&self, source: &str) -> Option<Arc<dyn Transform>> {
        self.transforms.get(source).cloned()
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.transforms.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::NoProjects;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Transform for Echo {
        fn source(&self) -> &str {
            "echo"
        }

        async fn document(
            &self,
            item: &RawItem,
            ctx: &EnrichContext<'_>,
        ) -> Result<Vec<EnrichedDocument>> {
            let mut doc = EnrichedDocument::new(item.uuid.clone());
            doc.extend(ctx.role_fields(None, self.source(), "author", None).await);
            doc.insert("title", item.data["title"].clone());
            Ok(vec![doc])
        }

        fn identities<'a>(&'a self, _item: &'a RawItem) -> Box<dyn Iterator<Item = Identity> + 'a> {
            Box::new(std::iter::empty())
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_source() {
        let mut registry = TransformRegistry::new();
        registry.register(Arc::new(Echo));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("git").is_none());

        let item = RawItem::from_payload(json!({
            "origin": "o", "uuid": "u1", "updated_on": 1, "timestamp": 1,
            "data": { "title": "hello" }
        }))
        .unwrap();
        let ctx = EnrichContext::new(None, &NoProjects);
        let docs = registry
            .get("echo")
            .unwrap()
            .document(&item, &ctx)
            .await
            .unwrap();
        assert_eq!(docs[0].id, "u1");
        assert_eq!(docs[0].get("title"), Some(&json!("hello")));
        assert_eq!(registry.get("echo").unwrap().roles(), vec!["author"]);
    }

    #[test]
    fn grimoire_fields_normalize_date() {
        let fields = grimoire_fields("2024-01-05 10:00:00", "github", "issue");
        assert_eq!(fields["grimoire_creation_date"], "2024-01-05T10:00:00+00:00");
        assert_eq!(fields["is_github_issue"], 1);
    }
}
