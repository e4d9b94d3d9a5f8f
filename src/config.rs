//! Configuration parsing and validation.
//!
//! Enrich Harness is configured via a TOML file (default:
//! `config/enrich.toml`). The file declares the SQLite registry path, the
//! Elasticsearch endpoint and batch bounds, identity and project settings,
//! one `[sources.<name>]` table per data stream, and study settings.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/enrich.sqlite"
//!
//! [elastic]
//! url = "http://localhost:9200"
//! bulk_size = 1000
//!
//! [sources.widgets]
//! source = "github"
//! path = "./data/widgets.jsonl"
//! origin = "https://github.com/acme/widgets"
//! raw_index = "github_raw"
//! enriched_index = "github_enriched"
//!
//! [sources.widgets.fieldmap]
//! item_type = "issue"
//! date = "created_at"
//! fields = { title = "title", state = "state" }
//! roles.author = { name = "user.name", username = "user.login" }
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Collectors built into the binary.
pub const COLLECTORS: &[&str] = &["jsonl"];
/// Transforms built into the binary.
pub const TRANSFORMS: &[&str] = &["fieldmap"];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub elastic: ElasticConfig,
    #[serde(default)]
    pub identities: IdentitiesConfig,
    #[serde(default)]
    pub projects: ProjectsConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub studies: StudiesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ElasticConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Maximum documents per bulk request.
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    /// Approximate maximum bulk body size in bytes.
    #[serde(default = "default_bulk_bytes")]
    pub bulk_bytes: usize,
    #[serde(default = "default_scroll_size")]
    pub scroll_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            bulk_size: default_bulk_size(),
            bulk_bytes: default_bulk_bytes(),
            scroll_size: default_scroll_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_url() -> String {
    "http://localhost:9200".to_string()
}
fn default_bulk_size() -> usize {
    1000
}
fn default_bulk_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_scroll_size() -> usize {
    100
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentitiesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_unknown")]
    pub unaffiliated_group: String,
    #[serde(default = "default_unknown")]
    pub unknown_gender: String,
}

impl Default for IdentitiesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_capacity: default_cache_capacity(),
            unaffiliated_group: default_unknown(),
            unknown_gender: default_unknown(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_cache_capacity() -> usize {
    10_000
}
fn default_unknown() -> String {
    "Unknown".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProjectsConfig {
    /// Path to a `projects.json` file.
    #[serde(default)]
    pub json_path: Option<PathBuf>,
}

/// How a source's feed position is tracked.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkMode {
    /// Read back the maximum position stored in the raw index.
    #[default]
    Index,
    /// Persist the position in the SQLite `checkpoints` table.
    Checkpoint,
}

/// Resume parameter accepted by the JSON-lines collector.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CursorMode {
    #[default]
    FromDate,
    Offset,
    None,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Data-source tag for transforms, identities, and projects.
    /// Defaults to the section name.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_collector")]
    pub collector: String,
    pub path: PathBuf,
    pub origin: String,
    #[serde(default)]
    pub cursor: CursorMode,
    #[serde(default = "default_transform")]
    pub transform: String,
    pub raw_index: String,
    pub enriched_index: String,
    /// Static project attached to every fed item.
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub watermark: WatermarkMode,
    /// Delete raw items older than this after each feed.
    #[serde(default)]
    pub retention_minutes: Option<i64>,
    #[serde(default)]
    pub fieldmap: FieldMapConfig,
}

fn default_collector() -> String {
    "jsonl".to_string()
}
fn default_transform() -> String {
    "fieldmap".to_string()
}

/// Identity paths for one role, as dotted paths into the item's `data`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RoleMapConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Fan-out of an array inside `data` into sub-entity documents.
#[derive(Debug, Deserialize, Clone)]
pub struct ChildrenConfig {
    pub path: String,
    #[serde(default = "default_child_id")]
    pub id: String,
    pub item_type: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub author: Option<RoleMapConfig>,
}

fn default_child_id() -> String {
    "id".to_string()
}

/// Settings of the built-in field-map transform.
#[derive(Debug, Deserialize, Clone)]
pub struct FieldMapConfig {
    #[serde(default = "default_item_type")]
    pub item_type: String,
    /// Data path of the creation date.
    #[serde(default = "default_date_path")]
    pub date: String,
    /// Enriched field name → data path.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleMapConfig>,
    /// Data path of the repository used for project mapping.
    #[serde(default)]
    pub repository: Option<String>,
    /// Items missing any of these data paths are not stored.
    #[serde(default)]
    pub require: Vec<String>,
    /// Data path → maximum length; longer strings are cut before storage.
    #[serde(default)]
    pub truncate: BTreeMap<String, usize>,
    /// Data path copied into `category` when the collector set none.
    #[serde(default)]
    pub category_from: Option<String>,
    #[serde(default)]
    pub children: Option<ChildrenConfig>,
}

impl Default for FieldMapConfig {
    fn default() -> Self {
        Self {
            item_type: default_item_type(),
            date: default_date_path(),
            fields: BTreeMap::new(),
            roles: BTreeMap::new(),
            repository: None,
            require: Vec::new(),
            truncate: BTreeMap::new(),
            category_from: None,
            children: None,
        }
    }
}

fn default_item_type() -> String {
    "item".to_string()
}
fn default_date_path() -> String {
    "updated_at".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StudiesConfig {
    #[serde(default)]
    pub demography: DemographyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DemographyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum seconds between two runs on the same index.
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    #[serde(default = "default_study_date_field")]
    pub date_field: String,
    #[serde(default = "default_study_author_field")]
    pub author_field: String,
}

impl Default for DemographyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_secs: default_min_interval_secs(),
            date_field: default_study_date_field(),
            author_field: default_study_author_field(),
        }
    }
}

fn default_min_interval_secs() -> u64 {
    7 * 24 * 3600
}
fn default_study_date_field() -> String {
    "grimoire_creation_date".to_string()
}
fn default_study_author_field() -> String {
    "author_uuid".to_string()
}

impl SourceConfig {
    /// The data-source tag, falling back to the section name.
    pub fn source_tag<'a>(&'a self, name: &'a str) -> &'a str {
        self.source.as_deref().unwrap_or(name)
    }
}

impl Config {
    pub fn source(&self, name: &str) -> Result<&SourceConfig> {
        self.sources.get(name).with_context(|| {
            let known: Vec<&str> = self.sources.keys().map(String::as_str).collect();
            format!(
                "Unknown source: '{}'. Configured: {}",
                name,
                if known.is_empty() {
                    "(none)".to_string()
                } else {
                    known.join(", ")
                }
            )
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.elastic.bulk_size == 0 {
        bail!("elastic.bulk_size must be > 0");
    }
    if config.elastic.bulk_bytes == 0 {
        bail!("elastic.bulk_bytes must be > 0");
    }
    if config.elastic.scroll_size == 0 {
        bail!("elastic.scroll_size must be > 0");
    }
    if config.identities.cache_capacity == 0 {
        bail!("identities.cache_capacity must be > 0");
    }

    for (name, source) in &config.sources {
        if !COLLECTORS.contains(&source.collector.as_str()) {
            bail!(
                "sources.{}: unknown collector '{}'. Must be one of: {}",
                name,
                source.collector,
                COLLECTORS.join(", ")
            );
        }
        if !TRANSFORMS.contains(&source.transform.as_str()) {
            bail!(
                "sources.{}: unknown transform '{}'. Must be one of: {}",
                name,
                source.transform,
                TRANSFORMS.join(", ")
            );
        }
        if source.origin.trim().is_empty() {
            bail!("sources.{}: origin must not be empty", name);
        }
        if source.raw_index == source.enriched_index {
            bail!(
                "sources.{}: raw_index and enriched_index must differ (both '{}')",
                name,
                source.raw_index
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [db]
        path = "./data/enrich.sqlite"

        [sources.widgets]
        source = "github"
        path = "./data/widgets.jsonl"
        origin = "https://github.com/acme/widgets"
        raw_index = "github_raw"
        enriched_index = "github_enriched"

        [sources.widgets.fieldmap]
        item_type = "issue"
        fields = { title = "title" }
        roles.author = { name = "user.name", username = "user.login" }
    "#;

    #[test]
    fn test_defaults_applied() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.elastic.url, "http://localhost:9200");
        assert_eq!(config.elastic.bulk_size, 1000);
        assert_eq!(config.elastic.scroll_size, 100);
        assert!(config.identities.enabled);
        assert_eq!(config.identities.cache_capacity, 10_000);
        assert_eq!(config.studies.demography.min_interval_secs, 604_800);

        let source = config.source("widgets").unwrap();
        assert_eq!(source.collector, "jsonl");
        assert_eq!(source.transform, "fieldmap");
        assert_eq!(source.watermark, WatermarkMode::Index);
        assert_eq!(source.cursor, CursorMode::FromDate);
        assert_eq!(source.source_tag("widgets"), "github");
        assert_eq!(source.fieldmap.date, "updated_at");
        assert_eq!(
            source.fieldmap.roles["author"].username.as_deref(),
            Some("user.login")
        );
    }

    #[test]
    fn test_unknown_source_lists_configured() {
        let config = parse_config(MINIMAL).unwrap();
        let err = config.source("gadgets").unwrap_err().to_string();
        assert!(err.contains("widgets"));
    }

    #[test]
    fn test_rejects_zero_bulk_size() {
        let toml = format!("{MINIMAL}\n[elastic]\nbulk_size = 0\n");
        let err = parse_config(&toml).unwrap_err().to_string();
        assert!(err.contains("bulk_size"));
    }

    #[test]
    fn test_rejects_same_raw_and_enriched_index() {
        let toml = MINIMAL.replace("github_enriched", "github_raw");
        let err = parse_config(&toml).unwrap_err().to_string();
        assert!(err.contains("must differ"));
    }

    #[test]
    fn test_rejects_unknown_collector() {
        let toml = MINIMAL.replace(
            "source = \"github\"",
            "source = \"github\"\ncollector = \"perceval\"",
        );
        let err = parse_config(&toml).unwrap_err().to_string();
        assert!(err.contains("unknown collector 'perceval'"));
    }

    #[test]
    fn test_checkpoint_watermark_mode() {
        let toml = MINIMAL.replace(
            "source = \"github\"",
            "source = \"github\"\nwatermark = \"checkpoint\"\ncursor = \"offset\"",
        );
        let config = parse_config(&toml).unwrap();
        let source = config.source("widgets").unwrap();
        assert_eq!(source.watermark, WatermarkMode::Checkpoint);
        assert_eq!(source.cursor, CursorMode::Offset);
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(include_str!("../config/enrich.example.toml")).unwrap();
        let widgets = config.source("widgets").unwrap();
        assert_eq!(widgets.fieldmap.roles.len(), 2);
        let children = widgets.fieldmap.children.as_ref().unwrap();
        assert_eq!(children.item_type, "comment");
        assert!(children.author.is_some());
    }
}
