//! Project mapping.
//!
//! Maps a repository of a data source to the project it belongs to, as
//! declared in a `projects.json` file:
//!
//! ```json
//! {
//!   "eclipse.platform": {
//!     "meta": { "title": "Eclipse Platform" },
//!     "git": ["https://git.eclipse.org/platform.git"]
//!   }
//! }
//! ```
//!
//! Every enriched document gets a `project` field, one `project_<n>` field
//! per dotted level, and the project's `meta` entries as `cm_<field>`.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use tracing::debug;

/// Project for repositories not found in the map.
pub const DEFAULT_PROJECT: &str = "Main";
/// Project name reserved for repositories explicitly left unassigned.
pub const UNKNOWN_PROJECT: &str = "unknown";
const CUSTOM_META_PREFIX: &str = "cm";

/// Resolves the project of a repository.
pub trait ProjectMapper: Send + Sync {
    /// Project of `repository` (falling back to `origin`) in `source`, or
    /// `None` when unmapped.
    fn project_for(&self, source: &str, repository: Option<&str>, origin: &str) -> Option<String>;

    /// `meta` block of a project.
    fn project_meta(&self, _project: &str) -> Option<Map<String, Value>> {
        None
    }
}

/// A mapper that knows no projects; everything lands in [`DEFAULT_PROJECT`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProjects;

impl ProjectMapper for NoProjects {
    fn project_for(&self, _source: &str, _repository: Option<&str>, _origin: &str) -> Option<String> {
        None
    }
}

/// Mapper built from a `projects.json` document.
#[derive(Debug, Default, Clone)]
pub struct JsonProjectMap {
    /// source → repository → project
    repos: HashMap<String, HashMap<String, String>>,
    meta: HashMap<String, Map<String, Value>>,
}

impl JsonProjectMap {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(json)?;
        Ok(Self::from_value(&value))
    }

    /// Build the map. Repositories listed in several projects go to the
    /// deepest (most dotted) one; the `unknown` project is applied last.
    pub fn from_value(json: &Value) -> Self {
        let mut map = JsonProjectMap::default();
        let Some(projects) = json.as_object() else {
            return map;
        };

        let mut names: Vec<&String> = projects.keys().filter(|k| *k != UNKNOWN_PROJECT).collect();
        if let Some((name, _)) = projects.get_key_value(UNKNOWN_PROJECT) {
            names.push(name);
        }

        for name in names {
            let Some(sources) = projects[name.as_str()].as_object() else {
                continue;
            };
            for (source, repos) in sources {
                if source == "meta" {
                    if let Some(meta) = repos.as_object() {
                        map.meta.insert(name.clone(), meta.clone());
                    }
                    continue;
                }
                let Some(repos) = repos.as_array() else {
                    continue;
                };
                let by_repo = map.repos.entry(source.clone()).or_default();
                for repo in repos {
                    let repo = match repo {
                        Value::String(s) => strip_labels(s).to_string(),
                        other => other.to_string(),
                    };
                    match by_repo.get(&repo) {
                        Some(existing) if existing == name => {
                            debug!(source = source.as_str(), repo = repo.as_str(), project = name.as_str(), "duplicated repo");
                        }
                        Some(existing) => {
                            if depth(name) > depth(existing) {
                                debug!(
                                    source = source.as_str(),
                                    repo = repo.as_str(),
                                    leaf = name.as_str(),
                                    previous = existing.as_str(),
                                    "repo moved to leaf project"
                                );
                                by_repo.insert(repo, name.clone());
                            }
                        }
                        None => {
                            by_repo.insert(repo, name.clone());
                        }
                    }
                }
            }
        }
        map
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }
}

fn depth(project: &str) -> usize {
    project.split('.').count()
}

/// Drop a trailing ` --labels=[...]` from a repository entry.
pub fn strip_labels(repo: &str) -> &str {
    match repo.find("--labels=") {
        Some(pos) => repo[..pos].trim_end(),
        None => repo,
    }
}

impl ProjectMapper for JsonProjectMap {
    fn project_for(&self, source: &str, repository: Option<&str>, origin: &str) -> Option<String> {
        let by_repo = self.repos.get(source)?;
        let found = repository
            .and_then(|r| by_repo.get(r))
            .or_else(|| by_repo.get(origin))
            .or_else(|| {
                let mut keys: Vec<&String> = by_repo.keys().filter(|k| k.contains(origin)).collect();
                keys.sort();
                keys.first().and_then(|k| by_repo.get(*k))
            })?;
        if found == UNKNOWN_PROJECT {
            None
        } else {
            Some(found.clone())
        }
    }

    fn project_meta(&self, project: &str) -> Option<Map<String, Value>> {
        self.meta.get(project).cloned()
    }
}

/// `project_1`, `project_2`, ... holding each dotted prefix.
pub fn project_levels(project: &str) -> Map<String, Value> {
    let mut levels = Map::new();
    let mut path = String::new();
    for (i, part) in project.split('.').enumerate() {
        if i > 0 {
            path.push('.');
        }
        path.push_str(part);
        levels.insert(format!("project_{}", i + 1), json!(path));
    }
    levels
}

/// All project fields for a document.
pub fn project_fields(
    mapper: &dyn ProjectMapper,
    source: &str,
    repository: Option<&str>,
    origin: &str,
) -> Map<String, Value> {
    let project = mapper
        .project_for(source, repository, origin)
        .unwrap_or_else(|| DEFAULT_PROJECT.to_string());
    let mut fields = Map::new();
    fields.insert("project".to_string(), json!(project));
    fields.extend(project_levels(&project));
    if let Some(meta) = mapper.project_meta(&project) {
        for (k, v) in meta {
            fields.insert(format!("{CUSTOM_META_PREFIX}_{k}"), v);
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JsonProjectMap {
        JsonProjectMap::from_value(&json!({
            "unknown": {
                "git": ["https://example.com/orphan.git", "https://example.com/shared.git"]
            },
            "eclipse": {
                "meta": { "title": "Eclipse", "program": "top" },
                "git": ["https://example.com/shared.git", "https://example.com/top.git --labels=[core]"]
            },
            "eclipse.platform": {
                "git": ["https://example.com/shared.git"],
                "gerrit": ["gerrit.example.com_platform"]
            }
        }))
    }

    #[test]
    fn leaf_project_wins_on_duplicates() {
        let map = sample();
        assert_eq!(
            map.project_for("git", Some("https://example.com/shared.git"), "x").as_deref(),
            Some("eclipse.platform")
        );
    }

    #[test]
    fn unknown_project_maps_to_none() {
        let map = sample();
        assert_eq!(map.project_for("git", None, "https://example.com/orphan.git"), None);
    }

    #[test]
    fn labels_are_stripped() {
        let map = sample();
        assert_eq!(
            map.project_for("git", None, "https://example.com/top.git").as_deref(),
            Some("eclipse")
        );
        assert_eq!(strip_labels("repo --labels=[a, b]"), "repo");
    }

    #[test]
    fn origin_substring_fallback() {
        let map = sample();
        assert_eq!(
            map.project_for("gerrit", None, "gerrit.example.com").as_deref(),
            Some("eclipse.platform")
        );
        assert_eq!(map.project_for("jira", None, "anything"), None);
    }

    #[test]
    fn levels_are_cumulative() {
        let levels = project_levels("eclipse.platform.releng");
        assert_eq!(levels["project_1"], "eclipse");
        assert_eq!(levels["project_2"], "eclipse.platform");
        assert_eq!(levels["project_3"], "eclipse.platform.releng");
        assert_eq!(levels.len(), 3);
    }

    #[test]
    fn fields_include_custom_meta() {
        let map = sample();
        let fields = project_fields(&map, "git", None, "https://example.com/top.git");
        assert_eq!(fields["project"], "eclipse");
        assert_eq!(fields["project_1"], "eclipse");
        assert_eq!(fields["cm_title"], "Eclipse");
        assert_eq!(fields["cm_program"], "top");
    }

    #[test]
    fn unmapped_goes_to_default_project() {
        let fields = project_fields(&NoProjects, "git", None, "o");
        assert_eq!(fields["project"], DEFAULT_PROJECT);
        assert_eq!(fields["project_1"], DEFAULT_PROJECT);
    }
}
