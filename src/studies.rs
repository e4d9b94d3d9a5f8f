//! Periodic studies over an enriched index.
//!
//! A study aggregates the enriched documents of an index and writes derived
//! fields back into them with update-by-query. Studies are expensive, so
//! the runner first reads the study's marker field (the most recent time
//! it wrote) and skips the run when that is younger than the minimum
//! interval.
//!
//! Any failed aggregation or update ends the study run with an error. The
//! next run recomputes everything, so a partially updated index is
//! repaired rather than patched.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map};
use tracing::{error, info};

use enrich_harness_core::dates::format_iso;
use enrich_harness_core::models::Filter;
use enrich_harness_core::store::DocumentStore;

use crate::config::DemographyConfig;

/// Alias marking indices processed by the demography study.
pub const DEMOGRAPHICS_ALIAS: &str = "demographics";
/// Upper bound on authors aggregated in one pass.
const MAX_AUTHORS: usize = 30_000;

#[derive(Debug, Clone, PartialEq)]
pub enum StudyOutcome {
    /// Ran too recently; nothing was queried.
    Throttled { last_run: DateTime<Utc> },
    Completed { groups: usize, updated: u64 },
}

#[async_trait]
pub trait Study: Send + Sync {
    fn name(&self) -> &str;

    /// Date field stamped on every document the study writes.
    fn marker_field(&self) -> &str;

    /// Alias added to the index after a complete run.
    fn alias(&self) -> &str;

    /// Aggregate and write back. Returns groups seen and documents updated.
    async fn compute(
        &self,
        store: &dyn DocumentStore,
        index: &str,
        now: DateTime<Utc>,
    ) -> Result<(usize, u64)>;
}

// ═══════════════════════════════════════════════════════════════════════
// Demography
// ═══════════════════════════════════════════════════════════════════════

/// First and last activity date of every author, written to all of the
/// author's documents as `demography_min_date` / `demography_max_date`.
pub struct DemographyStudy {
    author_field: String,
    date_field: String,
}

impl DemographyStudy {
    pub fn new(author_field: &str, date_field: &str) -> Self {
        Self {
            author_field: author_field.to_string(),
            date_field: date_field.to_string(),
        }
    }

    pub fn from_config(config: &DemographyConfig) -> Self {
        Self::new(&config.author_field, &config.date_field)
    }
}

impl Default for DemographyStudy {
    fn default() -> Self {
        Self::new("author_uuid", "grimoire_creation_date")
    }
}

#[async_trait]
impl Study for DemographyStudy {
    fn name(&self) -> &str {
        "demography"
    }

    fn marker_field(&self) -> &str {
        "demography_updated_on"
    }

    fn alias(&self) -> &str {
        DEMOGRAPHICS_ALIAS
    }

    async fn compute(
        &self,
        store: &dyn DocumentStore,
        index: &str,
        now: DateTime<Utc>,
    ) -> Result<(usize, u64)> {
        let spans = store
            .group_date_span(index, &self.author_field, &self.date_field, MAX_AUTHORS)
            .await
            .with_context(|| format!("aggregating author activity in {}", index))?;

        let stamp = format_iso(now);
        let mut updated = 0;
        for span in &spans {
            let mut fields = Map::new();
            fields.insert("demography_min_date".to_string(), json!(format_iso(span.min)));
            fields.insert("demography_max_date".to_string(), json!(format_iso(span.max)));
            fields.insert(self.marker_field().to_string(), json!(stamp));
            let filter = Filter::term(self.author_field.clone(), span.key.clone());
            updated += store
                .update_by_query(index, &filter, &fields)
                .await
                .with_context(|| format!("updating activity dates of author {}", span.key))?;
        }
        Ok((spans.len(), updated))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════

pub struct StudiesRunner<'a> {
    store: &'a dyn DocumentStore,
    studies: Vec<(Box<dyn Study>, Duration)>,
    now: Option<DateTime<Utc>>,
}

impl<'a> StudiesRunner<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            studies: Vec::new(),
            now: None,
        }
    }

    /// Schedule a study with its minimum re-run interval.
    pub fn add(mut self, study: Box<dyn Study>, min_interval: Duration) -> Self {
        self.studies.push((study, min_interval));
        self
    }

    /// Use a fixed clock.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    /// Run one study against `index` unless it ran within `min_interval`.
    pub async fn run(
        &self,
        study: &dyn Study,
        index: &str,
        min_interval: Duration,
    ) -> Result<StudyOutcome> {
        let now = self.now.unwrap_or_else(Utc::now);
        let last = self
            .store
            .max_value(index, study.marker_field(), &[])
            .await
            .with_context(|| format!("reading last {} run on {}", study.name(), index))?
            .as_datetime();

        if let Some(last_run) = last {
            if now - last_run < min_interval {
                info!(
                    study = study.name(),
                    index,
                    last_run = %format_iso(last_run),
                    "study ran recently, skipped"
                );
                return Ok(StudyOutcome::Throttled { last_run });
            }
        }

        info!(study = study.name(), index, "study starting");
        let (groups, updated) = study.compute(self.store, index, now).await?;

        let aliases = self
            .store
            .aliases(index)
            .await
            .with_context(|| format!("listing aliases of {}", index))?;
        if !aliases.iter().any(|a| a == study.alias()) {
            info!(study = study.name(), index, alias = study.alias(), "creating alias");
            self.store
                .add_alias(index, study.alias())
                .await
                .with_context(|| format!("adding alias {} to {}", study.alias(), index))?;
        }

        info!(study = study.name(), index, groups, updated, "study finished");
        Ok(StudyOutcome::Completed { groups, updated })
    }

    /// Run every scheduled study. A failing study is logged and does not
    /// stop the others.
    pub async fn run_all(&self, index: &str) -> Vec<(String, Result<StudyOutcome>)> {
        let mut results = Vec::with_capacity(self.studies.len());
        for (study, min_interval) in &self.studies {
            let outcome = self.run(study.as_ref(), index, *min_interval).await;
            if let Err(e) = &outcome {
                error!(study = study.name(), index, error = %format!("{e:#}"), "study aborted");
            }
            results.push((study.name().to_string(), outcome));
        }
        results
    }
}
