//! Source registry.
//!
//! Builds the runtime pieces of every `[sources.<name>]` table once: the
//! collector that produces its items and the transform that enriches
//! them. Watermark trackers are built per run since they hold store or
//! database handles.
//!
//! # Lookup
//!
//! Sources are looked up by section name. Several sections may share a
//! data-source tag (two repositories of the same forge); each keeps its own
//! transform since field maps are per section.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use enrich_harness_core::collector::Collector;
use enrich_harness_core::models::FIELD_TIMESTAMP;
use enrich_harness_core::store::DocumentStore;
use enrich_harness_core::transform::{Transform, TransformRegistry};
use enrich_harness_core::watermark::{IndexWatermarks, WatermarkTracker};

use crate::checkpoints::SqliteWatermarks;
use crate::collector_jsonl::JsonlCollector;
use crate::config::{Config, SourceConfig, WatermarkMode};
use crate::transform_fieldmap::FieldMapTransform;

/// One configured source with its collector and transform.
pub struct SourceEntry {
    pub name: String,
    pub config: SourceConfig,
    pub collector: Arc<dyn Collector>,
    pub transform: Arc<dyn Transform>,
}

impl SourceEntry {
    pub fn source_tag(&self) -> &str {
        self.config.source_tag(&self.name)
    }

    pub fn origin(&self) -> &str {
        &self.config.origin
    }

    /// Tracker for the feed position of this source.
    pub fn feed_watermarks(
        &self,
        store: Arc<dyn DocumentStore>,
        pool: &SqlitePool,
    ) -> Box<dyn WatermarkTracker> {
        match self.config.watermark {
            WatermarkMode::Index => Box::new(IndexWatermarks::new(store, &self.config.raw_index)),
            WatermarkMode::Checkpoint => Box::new(SqliteWatermarks::new(pool.clone())),
        }
    }

    /// Tracker reading the enrichment position back from the enriched
    /// index. Enriched documents carry the raw item's retrieval time, so
    /// the date position is `metadata__timestamp`.
    pub fn enrich_watermarks(&self, store: Arc<dyn DocumentStore>) -> IndexWatermarks {
        IndexWatermarks::new(store, &self.config.enriched_index).with_date_field(FIELD_TIMESTAMP)
    }
}

/// Registry of configured sources.
pub struct SourceRegistry {
    entries: BTreeMap<String, SourceEntry>,
    transforms: TransformRegistry,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            transforms: TransformRegistry::new(),
        }
    }

    /// Build an entry for every `[sources.<name>]` table.
    ///
    /// The configuration has been validated, so only the built-in
    /// collector and transform names can appear.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for (name, source) in &config.sources {
            let collector: Arc<dyn Collector> = Arc::new(JsonlCollector::from_config(name, source));
            let transform: Arc<dyn Transform> = Arc::new(FieldMapTransform::new(
                source.source_tag(name),
                source.fieldmap.clone(),
            ));
            registry.register(SourceEntry {
                name: name.clone(),
                config: source.clone(),
                collector,
                transform,
            });
        }
        Ok(registry)
    }

    /// Add an entry. The first transform seen for a data-source tag also
    /// answers tag lookups.
    pub fn register(&mut self, entry: SourceEntry) {
        if self.transforms.get(entry.source_tag()).is_none() {
            self.transforms.register(entry.transform.clone());
        }
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&SourceEntry> {
        self.entries.get(name)
    }

    /// Entries in section-name order.
    pub fn entries(&self) -> impl Iterator<Item = &SourceEntry> {
        self.entries.values()
    }

    /// Transform answering for a data-source tag.
    pub fn transform_for(&self, source: &str) -> Option<Arc<dyn Transform>> {
        self.transforms.get(source)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
