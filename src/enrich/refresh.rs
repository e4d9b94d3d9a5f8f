//! Identity refresh of already enriched documents.
//!
//! After identities are merged or re-affiliated in the registry, the
//! `<role>_*` fields of enriched documents are stale. A refresh scans the
//! enriched index, rebuilds the fields of every role from the stored
//! `<role>_id` at the document's `grimoire_creation_date`, and writes back
//! only the documents that changed.

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use tracing::{info, warn};

use enrich_harness_core::bulk::{BulkBatch, BulkFailure};
use enrich_harness_core::dates::parse_naive_utc;
use enrich_harness_core::identity::{IdentityCache, IdentityResult, UNDEFINED_VALUE};

use super::{EnrichReport, EnrichmentDriver, Phase, RawSource};

impl EnrichmentDriver<'_> {
    /// Rebuild the identity fields of the documents `source` yields and
    /// write back the changed ones to `index`.
    ///
    /// `items` counts documents scanned and `produced` those rewritten.
    /// Identity resolution must be enabled.
    pub async fn refresh_identities(
        &mut self,
        source: &mut RawSource<'_>,
        index: &str,
    ) -> Result<EnrichReport> {
        let Some(cache) = self.ctx.identities else {
            bail!("identity refresh needs identity resolution enabled");
        };
        let roles = self.transform.roles();
        let mut report = EnrichReport::default();
        let mut batch = BulkBatch::new();
        self.enter(Phase::Streaming);

        while let Some(hit) = source
            .next_document()
            .await
            .with_context(|| format!("reading enriched documents from {}", source.index()))?
        {
            report.items += 1;
            let Value::Object(mut fields) = hit.source else {
                warn!(index, id = %hit.id, "enriched document is not an object, skipped");
                continue;
            };
            let changed = refresh_roles(cache, &roles, &mut fields)
                .await
                .with_context(|| format!("refreshing identities of document {}", hit.id))?;
            if !changed {
                continue;
            }

            self.enter(Phase::Accumulating);
            if let Err(e) = batch.push(&hit.id, &fields) {
                report.produced += 1;
                report.failures.push(BulkFailure {
                    id: hit.id,
                    reason: e.to_string(),
                });
                continue;
            }
            if batch.is_full(self.options.bulk_size, self.options.bulk_bytes) {
                self.enter(Phase::Flushing);
                self.flush(&mut batch, index, &mut report).await?;
                self.enter(Phase::Streaming);
            }
        }

        self.enter(Phase::FinalFlush);
        self.flush(&mut batch, index, &mut report).await?;
        self.enter(Phase::Done);

        info!(
            source = %self.transform.source(),
            index,
            scanned = report.items,
            rewritten = report.produced,
            accepted = report.accepted,
            "identity refresh finished"
        );
        Ok(report)
    }
}

/// Overwrite the `<role>_*` fields of one document. Returns whether any
/// field changed. Fails without touching `fields` when the identity store
/// is unavailable.
async fn refresh_roles(
    cache: &IdentityCache,
    roles: &[String],
    fields: &mut Map<String, Value>,
) -> IdentityResult<bool> {
    let at = fields
        .get("grimoire_creation_date")
        .and_then(Value::as_str)
        .and_then(parse_naive_utc);
    let mut updates = Map::new();
    for role in roles {
        let Some(id) = fields
            .get(&format!("{role}_id"))
            .and_then(Value::as_str)
            .filter(|id| *id != UNDEFINED_VALUE)
            .map(str::to_string)
        else {
            continue;
        };
        updates.extend(cache.role_fields_from_id(&id, role, at).await?);
    }
    let mut changed = false;
    for (k, v) in updates {
        if fields.get(&k) != Some(&v) {
            fields.insert(k, v);
            changed = true;
        }
    }
    Ok(changed)
}
