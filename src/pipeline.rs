//! Pipeline orchestration.
//!
//! Wires configuration into the feeder, enrichment driver, identity
//! commands, and studies for one source at a time, and prints the run
//! summaries the CLI shows:
//!
//! ```text
//! feed ─▶ (identities load) ─▶ enrich ─▶ studies
//! ```
//!
//! [`Pipeline`] owns the shared handles (document store, registry pool,
//! source registry, project map). The `run_*` functions open one from a
//! [`Config`] and print what happened.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Duration;
use sqlx::SqlitePool;
use tracing::{error, info};

use enrich_harness_core::identity::IdentityCache;
use enrich_harness_core::models::{Filter, WatermarkKind, WatermarkValue};
use enrich_harness_core::project::{JsonProjectMap, NoProjects, ProjectMapper};
use enrich_harness_core::store::DocumentStore;
use enrich_harness_core::transform::EnrichContext;
use enrich_harness_core::watermark::WatermarkTracker;

use crate::config::{Config, ProjectsConfig};
use crate::db;
use crate::elastic::ElasticStore;
use crate::enrich::{EnrichOptions, EnrichReport, EnrichmentDriver, RawSource};
use crate::feed::{FeedOptions, FeedReport, Feeder};
use crate::identities::{load_identities, LoadReport, SqliteIdentityStore};
use crate::migrate::migrate_pool;
use crate::registry::{SourceEntry, SourceRegistry};
use crate::studies::{DemographyStudy, StudiesRunner, StudyOutcome};

pub struct Pipeline {
    config: Config,
    store: Arc<dyn DocumentStore>,
    pool: SqlitePool,
    registry: SourceRegistry,
    projects: Box<dyn ProjectMapper>,
}

fn load_projects(config: &ProjectsConfig) -> Result<Box<dyn ProjectMapper>> {
    let Some(path) = &config.json_path else {
        return Ok(Box::new(NoProjects));
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading projects file {}", path.display()))?;
    let map = JsonProjectMap::parse(&json)
        .with_context(|| format!("parsing projects file {}", path.display()))?;
    info!(path = %path.display(), "projects loaded");
    Ok(Box::new(map))
}

impl Pipeline {
    /// Connect to Elasticsearch and the SQLite registry named in `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate_pool(&pool).await?;
        let store = ElasticStore::new(&config.elastic.url, config.elastic.timeout_secs)?;
        Self::with_store(config, Arc::new(store), pool)
    }

    /// Build on an existing store and registry pool.
    pub fn with_store(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        pool: SqlitePool,
    ) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            store,
            pool,
            registry: SourceRegistry::from_config(config)?,
            projects: load_projects(&config.projects)?,
        })
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    fn entry(&self, name: &str) -> Result<&SourceEntry> {
        self.config.source(name)?;
        self.registry
            .get(name)
            .with_context(|| format!("source '{}' is not registered", name))
    }

    /// A fresh cache per run, or `None` when identities are disabled.
    fn identity_cache(&self) -> Option<IdentityCache> {
        let settings = &self.config.identities;
        settings.enabled.then(|| {
            IdentityCache::new(
                Arc::new(SqliteIdentityStore::new(self.pool.clone())),
                settings.cache_capacity,
            )
            .with_unaffiliated_group(settings.unaffiliated_group.clone())
            .with_unknown_gender(settings.unknown_gender.clone())
        })
    }

    fn enrich_options(&self) -> EnrichOptions {
        EnrichOptions {
            bulk_size: self.config.elastic.bulk_size,
            bulk_bytes: self.config.elastic.bulk_bytes,
        }
    }

    fn raw_source(&self, entry: &SourceEntry) -> RawSource<'_> {
        RawSource::new(
            self.store.as_ref(),
            &entry.config.raw_index,
            entry.origin(),
            self.config.elastic.scroll_size,
        )
    }

    // ═══════════════════════════════════════════════════════════════════
    // Feed
    // ═══════════════════════════════════════════════════════════════════

    /// Fetch new items of source `name` into its raw index.
    ///
    /// `since` overrides the stored watermark: a date for date-resumed
    /// collectors, an integer for offset-resumed ones.
    pub async fn feed(&self, name: &str, full: bool, since: Option<&str>) -> Result<FeedReport> {
        let entry = self.entry(name)?;
        let since = match since {
            None => None,
            Some(raw) => {
                let Some(kind) = entry.collector.cursor_kind().watermark_kind() else {
                    bail!("source '{}' cannot resume, --since is not supported", name);
                };
                match WatermarkValue::decode(kind, raw) {
                    Some(value) => Some(value),
                    None => bail!("invalid start position '{}' for source '{}'", raw, name),
                }
            }
        };

        let watermarks = entry.feed_watermarks(self.store.clone(), &self.pool);
        let options = FeedOptions {
            bulk_size: self.config.elastic.bulk_size,
            full,
            since,
            project: entry.config.project.clone(),
            retention_minutes: entry.config.retention_minutes,
        };
        Feeder::new(self.store.as_ref(), watermarks.as_ref())
            .with_hooks(entry.transform.as_ref())
            .with_options(options)
            .feed(entry.collector.as_ref(), &entry.name, &entry.config.raw_index)
            .await
            .with_context(|| format!("feeding source '{}'", name))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Enrich
    // ═══════════════════════════════════════════════════════════════════

    /// Enrich the raw items of source `name`.
    ///
    /// Resumes from the newest item already in the enriched index unless
    /// `full`. With identities enabled the raw items' identities are
    /// registered first.
    pub async fn enrich(&self, name: &str, full: bool) -> Result<EnrichReport> {
        let entry = self.entry(name)?;
        let cache = self.identity_cache();
        if cache.is_some() {
            self.load_identities(name).await?;
        }

        let mut source = self.raw_source(entry);
        if !full {
            let kind = entry
                .collector
                .cursor_kind()
                .watermark_kind()
                .unwrap_or(WatermarkKind::Date);
            let filters = [Filter::term("origin", entry.origin())];
            let position = entry
                .enrich_watermarks(self.store.clone())
                .get(&entry.name, kind, &filters)
                .await?;
            if let Some(wm) = position {
                info!(source = name, from = %wm.value.encode(), "incremental enrichment");
                source = source.resume_from(wm.value);
            }
        }

        let ctx = EnrichContext::new(cache.as_ref(), self.projects.as_ref());
        let mut driver = EnrichmentDriver::new(self.store.as_ref(), entry.transform.as_ref(), ctx)
            .with_options(self.enrich_options());
        let result = driver.run(&mut source, &entry.config.enriched_index).await;
        source.close().await?;
        result.with_context(|| format!("enriching source '{}'", name))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Identities
    // ═══════════════════════════════════════════════════════════════════

    /// Register the identities found in the raw index of source `name`.
    pub async fn load_identities(&self, name: &str) -> Result<LoadReport> {
        let entry = self.entry(name)?;
        let registry = SqliteIdentityStore::new(self.pool.clone());
        let mut source = self.raw_source(entry);
        load_identities(&registry, &mut source, entry.transform.as_ref())
            .await
            .with_context(|| format!("loading identities of source '{}'", name))
    }

    /// Rebuild the identity fields of the enriched documents of source
    /// `name`, optionally only those of one unique identity.
    pub async fn refresh_identities(
        &self,
        name: &str,
        author_uuid: Option<&str>,
    ) -> Result<EnrichReport> {
        let entry = self.entry(name)?;
        let Some(cache) = self.identity_cache() else {
            bail!("identities are disabled in the configuration");
        };

        let mut source = RawSource::new(
            self.store.as_ref(),
            &entry.config.enriched_index,
            entry.origin(),
            self.config.elastic.scroll_size,
        );
        if let Some(uuid) = author_uuid {
            source = source.filter(Filter::term("author_uuid", uuid));
        }

        let ctx = EnrichContext::new(Some(&cache), self.projects.as_ref());
        let mut driver = EnrichmentDriver::new(self.store.as_ref(), entry.transform.as_ref(), ctx)
            .with_options(self.enrich_options());
        let result = driver
            .refresh_identities(&mut source, &entry.config.enriched_index)
            .await;
        source.close().await?;
        result.with_context(|| format!("refreshing identities of source '{}'", name))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Studies
    // ═══════════════════════════════════════════════════════════════════

    fn studies(&self) -> StudiesRunner<'_> {
        let mut runner = StudiesRunner::new(self.store.as_ref());
        let demography = &self.config.studies.demography;
        if demography.enabled {
            runner = runner.add(
                Box::new(DemographyStudy::from_config(demography)),
                Duration::seconds(demography.min_interval_secs as i64),
            );
        }
        runner
    }

    /// Run the configured studies on the enriched index of source `name`.
    ///
    /// Every study runs; the call fails afterwards if any of them did.
    pub async fn study(&self, name: &str) -> Result<Vec<(String, StudyOutcome)>> {
        let entry = self.entry(name)?;
        let results = self.studies().run_all(&entry.config.enriched_index).await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        for (study, result) in results {
            match result {
                Ok(outcome) => outcomes.push((study, outcome)),
                Err(e) => failed.push(format!("{study}: {e:#}")),
            }
        }
        if !failed.is_empty() {
            bail!("studies failed on source '{}': {}", name, failed.join("; "));
        }
        Ok(outcomes)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// CLI entry points
// ═══════════════════════════════════════════════════════════════════════

fn print_feed(name: &str, report: &FeedReport) {
    println!("feed {}", name);
    println!("  fetched: {} items", report.fetched);
    println!("  stored: {}", report.stored);
    println!("  dropped: {}", report.dropped);
    if report.invalid > 0 {
        println!("  invalid: {}", report.invalid);
    }
    if report.rejected > 0 || report.failed_batches > 0 {
        println!("  rejected: {}", report.rejected);
        println!("  failed batches: {}", report.failed_batches);
    }
    if report.expired > 0 {
        println!("  expired: {}", report.expired);
    }
    match &report.watermark {
        Some(wm) => println!("  watermark: {}", wm.encode()),
        None => println!("  watermark: (unchanged)"),
    }
    println!("ok");
}

fn print_enrich(label: &str, name: &str, report: &EnrichReport) {
    println!("{} {}", label, name);
    println!("  items: {}", report.items);
    println!("  documents written: {}", report.produced);
    println!("  accepted: {}", report.accepted);
    if report.transform_errors > 0 {
        println!("  transform errors: {}", report.transform_errors);
    }
    if report.deficit() > 0 {
        println!("  not accepted: {}", report.deficit());
        for failure in &report.failures {
            println!("    {}: {}", failure.id, failure.reason);
        }
    }
    println!("ok");
}

fn print_studies(name: &str, outcomes: &[(String, StudyOutcome)]) {
    println!("study {}", name);
    if outcomes.is_empty() {
        println!("  (no studies enabled)");
    }
    for (study, outcome) in outcomes {
        match outcome {
            StudyOutcome::Throttled { last_run } => {
                println!("  {}: skipped, last run {}", study, last_run.to_rfc3339())
            }
            StudyOutcome::Completed { groups, updated } => {
                println!("  {}: {} groups, {} documents updated", study, groups, updated)
            }
        }
    }
    println!("ok");
}

pub async fn run_feed(config: &Config, name: &str, full: bool, since: Option<String>) -> Result<()> {
    let pipeline = Pipeline::open(config).await?;
    let report = pipeline.feed(name, full, since.as_deref()).await?;
    print_feed(name, &report);
    Ok(())
}

pub async fn run_enrich(config: &Config, name: &str, full: bool) -> Result<()> {
    let pipeline = Pipeline::open(config).await?;
    let report = pipeline.enrich(name, full).await?;
    print_enrich("enrich", name, &report);
    Ok(())
}

pub async fn run_study(config: &Config, name: &str) -> Result<()> {
    let pipeline = Pipeline::open(config).await?;
    let outcomes = pipeline.study(name).await?;
    print_studies(name, &outcomes);
    Ok(())
}

pub async fn run_load_identities(config: &Config, name: &str) -> Result<()> {
    let pipeline = Pipeline::open(config).await?;
    let report = pipeline.load_identities(name).await?;
    println!("identities load {}", name);
    println!("  items: {}", report.items);
    println!("  identities: {}", report.identities);
    println!("  new: {}", report.created);
    println!("ok");
    Ok(())
}

pub async fn run_refresh_identities(
    config: &Config,
    name: &str,
    author_uuid: Option<String>,
) -> Result<()> {
    let pipeline = Pipeline::open(config).await?;
    let report = pipeline
        .refresh_identities(name, author_uuid.as_deref())
        .await?;
    print_enrich("identities refresh", name, &report);
    Ok(())
}

/// Feed, enrich, and study one source, or every configured source in
/// name order. A failing source does not stop the others; the run fails
/// at the end if any did.
pub async fn run_all(config: &Config, name: Option<&str>) -> Result<()> {
    let pipeline = Pipeline::open(config).await?;
    info!(store = %pipeline.store().describe(), "pipeline starting");

    let names: Vec<String> = match name {
        Some(name) => {
            config.source(name)?;
            vec![name.to_string()]
        }
        None => pipeline.registry().entries().map(|e| e.name.clone()).collect(),
    };
    if names.is_empty() {
        bail!("no sources configured");
    }

    let mut failed = Vec::new();
    for name in &names {
        if let Err(e) = run_source(&pipeline, name).await {
            error!(source = %name, error = %format!("{e:#}"), "source failed");
            failed.push(name.as_str());
        }
    }
    if !failed.is_empty() {
        bail!("{} of {} sources failed: {}", failed.len(), names.len(), failed.join(", "));
    }
    Ok(())
}

async fn run_source(pipeline: &Pipeline, name: &str) -> Result<()> {
    let feed = pipeline.feed(name, false, None).await?;
    print_feed(name, &feed);
    let enrich = pipeline.enrich(name, false).await?;
    print_enrich("enrich", name, &enrich);
    let studies = pipeline.study(name).await?;
    print_studies(name, &studies);
    Ok(())
}
