//! Configurable field-map transform.
//!
//! Builds enriched documents from a `[sources.<name>.fieldmap]` table
//! instead of source-specific code: business fields are copied from dotted
//! paths into `data`, identity roles are read from configured name, email
//! and username paths, and an optional array inside `data` fans out into
//! sub-entity documents (`<uuid>_<type>_<id>`).

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use enrich_harness_core::dates::parse_naive_utc;
use enrich_harness_core::models::{EnrichedDocument, Identity, RawItem};
use enrich_harness_core::transform::{grimoire_fields, EnrichContext, Transform};

use crate::config::{ChildrenConfig, FieldMapConfig, RoleMapConfig};

pub struct FieldMapTransform {
    source: String,
    config: FieldMapConfig,
}

fn value_at<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.')
        .try_fold(root, |cur, segment| cur.get(segment))
        .filter(|v| !v.is_null())
}

fn str_at<'v>(root: &'v Value, path: Option<&str>) -> Option<&'v str> {
    path.and_then(|p| value_at(root, p)).and_then(Value::as_str)
}

fn identity_at(root: &Value, role: &RoleMapConfig) -> Option<Identity> {
    let identity = Identity::new(
        str_at(root, role.name.as_deref()),
        str_at(root, role.email.as_deref()),
        str_at(root, role.username.as_deref()),
    );
    (!identity.is_empty()).then_some(identity)
}

fn scalar_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl FieldMapTransform {
    pub fn new(source: &str, config: FieldMapConfig) -> Self {
        Self {
            source: source.to_string(),
            config,
        }
    }

    fn creation_date(&self, root: &Value, path: &str, item: &RawItem) -> String {
        str_at(root, Some(path))
            .map(str::to_string)
            .unwrap_or_else(|| item.metadata_updated_on.clone())
    }

    async fn child_documents(
        &self,
        item: &RawItem,
        children: &ChildrenConfig,
        parent_date: &str,
        ctx: &EnrichContext<'_>,
    ) -> Vec<EnrichedDocument> {
        let Some(entries) = value_at(&item.data, &children.path).and_then(Value::as_array) else {
            return Vec::new();
        };
        let mut docs = Vec::with_capacity(entries.len());
        for (pos, entry) in entries.iter().enumerate() {
            let id = value_at(entry, &children.id)
                .and_then(scalar_id)
                .unwrap_or_else(|| pos.to_string());
            let mut doc = EnrichedDocument::sub_entity(
                &item.uuid,
                &format!("{}_{}", children.item_type, id),
            );
            for (field, path) in &children.fields {
                doc.insert(field.clone(), value_at(entry, path).cloned().unwrap_or(Value::Null));
            }
            let date = children
                .date
                .as_deref()
                .and_then(|p| str_at(entry, Some(p)))
                .unwrap_or(parent_date)
                .to_string();
            doc.extend(grimoire_fields(&date, &self.source, &children.item_type));
            if let Some(author) = &children.author {
                let identity = identity_at(entry, author);
                doc.extend(
                    ctx.role_fields(identity.as_ref(), &self.source, "author", parse_naive_utc(&date))
                        .await,
                );
            }
            docs.push(doc);
        }
        docs
    }
}

#[async_trait]
impl Transform for FieldMapTransform {
    fn source(&self) -> &str {
        &self.source
    }

    fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.config.roles.keys().cloned().collect();
        let child_authors = self
            .config
            .children
            .as_ref()
            .is_some_and(|c| c.author.is_some());
        if child_authors && !roles.iter().any(|r| r == "author") {
            roles.push("author".to_string());
        }
        roles
    }

    async fn document(
        &self,
        item: &RawItem,
        ctx: &EnrichContext<'_>,
    ) -> Result<Vec<EnrichedDocument>> {
        let date = self.creation_date(&item.data, &self.config.date, item);
        let at = parse_naive_utc(&date);

        let mut doc = EnrichedDocument::new(item.uuid.clone());
        for (field, path) in &self.config.fields {
            doc.insert(
                field.clone(),
                value_at(&item.data, path).cloned().unwrap_or(Value::Null),
            );
        }
        if let Some(category) = &item.category {
            doc.insert("category", category.clone());
        }
        doc.extend(grimoire_fields(&date, &self.source, &self.config.item_type));

        for (role, paths) in &self.config.roles {
            let identity = identity_at(&item.data, paths);
            doc.extend(ctx.role_fields(identity.as_ref(), &self.source, role, at).await);
        }

        let mut docs = vec![doc];
        if let Some(children) = &self.config.children {
            docs.extend(self.child_documents(item, children, &date, ctx).await);
        }
        Ok(docs)
    }

    fn identities<'a>(&'a self, item: &'a RawItem) -> Box<dyn Iterator<Item = Identity> + 'a> {
        let own = self
            .config
            .roles
            .values()
            .filter_map(move |paths| identity_at(&item.data, paths));

        let children = self.config.children.as_ref().and_then(|c| {
            let author = c.author.as_ref()?;
            let entries = value_at(&item.data, &c.path)?.as_array()?;
            Some(entries.iter().filter_map(move |e| identity_at(e, author)))
        });

        Box::new(own.chain(children.into_iter().flatten()))
    }

    fn fixup(&self, item: &mut RawItem) {
        for (path, max) in &self.config.truncate {
            let pointer = format!("/{}", path.replace('.', "/"));
            if let Some(Value::String(s)) = item.data.pointer_mut(&pointer) {
                if s.chars().count() > *max {
                    *s = s.chars().take(*max).collect();
                }
            }
        }
        if item.category.is_none() {
            if let Some(path) = &self.config.category_from {
                item.category = str_at(&item.data, Some(path)).map(str::to_string);
            }
        }
    }

    fn drop_item(&self, item: &RawItem) -> bool {
        self.config
            .require
            .iter()
            .any(|path| value_at(&item.data, path).is_none())
    }

    fn project_repository(&self, item: &RawItem) -> Option<String> {
        str_at(&item.data, self.config.repository.as_deref()).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrich_harness_core::identity::memory::InMemoryIdentityStore;
    use enrich_harness_core::identity::{IdentityCache, UNDEFINED_VALUE, UNKNOWN_VALUE};
    use enrich_harness_core::project::NoProjects;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn config() -> FieldMapConfig {
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "title".to_string());
        fields.insert("login".to_string(), "user.login".to_string());
        let mut roles = BTreeMap::new();
        roles.insert(
            "author".to_string(),
            RoleMapConfig {
                name: Some("user.name".into()),
                email: Some("user.email".into()),
                username: Some("user.login".into()),
            },
        );
        let mut truncate = BTreeMap::new();
        truncate.insert("body".to_string(), 5);
        FieldMapConfig {
            item_type: "question".into(),
            date: "created_at".into(),
            fields,
            roles,
            repository: Some("repo".into()),
            require: vec!["title".into()],
            truncate,
            category_from: Some("kind".into()),
            children: Some(ChildrenConfig {
                path: "answers".into(),
                id: "id".into(),
                item_type: "answer".into(),
                date: Some("created_at".into()),
                fields: BTreeMap::from([("body".to_string(), "body".to_string())]),
                author: Some(RoleMapConfig {
                    name: None,
                    email: None,
                    username: Some("by".into()),
                }),
            }),
        }
    }

    fn item(data: Value) -> RawItem {
        RawItem::from_payload(json!({
            "origin": "https://qa.example.com", "uuid": "q1",
            "updated_on": 1704067200, "timestamp": 1704067200,
            "data": data
        }))
        .unwrap()
    }

    fn question() -> Value {
        json!({
            "title": "How?",
            "created_at": "2024-01-02T10:00:00Z",
            "kind": "question",
            "repo": "qa/main",
            "body": "a very long body",
            "user": { "name": "Jane", "email": "jane@acme.org", "login": "jdoe" },
            "answers": [
                { "id": 7, "body": "like this", "by": "bob", "created_at": "2024-01-03T00:00:00Z" },
                { "id": 8, "body": "or that" }
            ]
        })
    }

    #[tokio::test]
    async fn test_document_fans_out_children() {
        let t = FieldMapTransform::new("qa", config());
        let ctx = EnrichContext::new(None, &NoProjects);
        let docs = t.document(&item(question()), &ctx).await.unwrap();

        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].id, "q1");
        assert_eq!(docs[0].get("title"), Some(&json!("How?")));
        assert_eq!(docs[0].get("login"), Some(&json!("jdoe")));
        assert_eq!(
            docs[0].get("grimoire_creation_date"),
            Some(&json!("2024-01-02T10:00:00+00:00"))
        );
        assert_eq!(docs[0].get("is_qa_question"), Some(&json!(1)));
        assert_eq!(docs[1].id, "q1_answer_7");
        assert_eq!(
            docs[1].get("grimoire_creation_date"),
            Some(&json!("2024-01-03T00:00:00+00:00"))
        );
        // Second answer has no date and inherits the question's
        assert_eq!(
            docs[2].get("grimoire_creation_date"),
            Some(&json!("2024-01-02T10:00:00+00:00"))
        );
    }

    #[tokio::test]
    async fn test_role_fields_use_sentinels() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let jane = Identity::new(Some("Jane"), Some("jane@acme.org"), Some("jdoe"));
        store.add_identity("qa", jane, "uuid-jane");
        let cache = IdentityCache::new(store, 100);
        let ctx = EnrichContext::new(Some(&cache), &NoProjects);

        let t = FieldMapTransform::new("qa", config());
        let docs = t.document(&item(question()), &ctx).await.unwrap();
        assert_eq!(docs[0].get("author_uuid"), Some(&json!("uuid-jane")));
        assert_eq!(docs[0].get("author_org_name"), Some(&json!(UNKNOWN_VALUE)));
        // bob is not registered
        assert_eq!(docs[1].get("author_uuid"), Some(&json!(UNDEFINED_VALUE)));
        // the second answer names no author
        assert!(docs[2].get("author_uuid").is_none());
    }

    #[test]
    fn test_identities_cover_roles_and_children() {
        let t = FieldMapTransform::new("qa", config());
        let it = item(question());
        let found: Vec<Identity> = t.identities(&it).collect();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].username.as_deref(), Some("jdoe"));
        assert_eq!(found[1].username.as_deref(), Some("bob"));
        assert_eq!(t.roles(), vec!["author"]);
    }

    #[test]
    fn test_fixup_drop_and_repository() {
        let t = FieldMapTransform::new("qa", config());
        let mut it = item(question());
        t.fixup(&mut it);
        assert_eq!(it.data["body"], "a ver");
        assert_eq!(it.category.as_deref(), Some("question"));
        assert!(!t.drop_item(&it));
        assert_eq!(t.project_repository(&it).as_deref(), Some("qa/main"));

        let untitled = item(json!({ "body": "x" }));
        assert!(t.drop_item(&untitled));
    }
}
