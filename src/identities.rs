//! SQLite-backed identity registry.
//!
//! Stores identity tuples per source, the unique identities they belong
//! to, profiles, and enrollments. Implements [`IdentityStore`] for the
//! identity cache, and exposes the write side used by identity loading:
//! [`load_identities`] registers every identity found in a raw index.

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use tracing::{info, warn};

use enrich_harness_core::dates::parse_naive_utc;
use enrich_harness_core::identity::{identity_id, IdentityError, IdentityResult, IdentityStore};
use enrich_harness_core::models::{Enrollment, Identity, Profile, RawItem, ResolvedIds};
use enrich_harness_core::transform::Transform;

use crate::enrich::RawSource;

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub struct SqliteIdentityStore {
    pool: SqlitePool,
}

fn unavailable(e: sqlx::Error) -> IdentityError {
    IdentityError::Unavailable(e.to_string())
}

impl SqliteIdentityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register an identity tuple from `source`. A new tuple gets its own
    /// unique identity (uuid = identity id) and a profile seeded from the
    /// tuple. Returns the identity id and whether it was new.
    pub async fn add_identity(&self, source: &str, identity: &Identity) -> Result<(String, bool)> {
        let id = identity_id(source, identity);
        let existing: Option<String> = sqlx::query_scalar("SELECT id FROM identities WHERE id = ?")
            .bind(&id)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Ok((id, false));
        }

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO uidentities (uuid, created_at) VALUES (?, ?)")
            .bind(&id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO identities (id, uuid, source, name, email, username, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&id)
        .bind(source)
        .bind(&identity.name)
        .bind(&identity.email)
        .bind(&identity.username)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT OR IGNORE INTO profiles (uuid, name, email, is_bot) VALUES (?, ?, ?, 0)")
            .bind(&id)
            .bind(identity.name.as_ref().or(identity.username.as_ref()))
            .bind(&identity.email)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((id, true))
    }

    /// Move an identity under another unique identity.
    pub async fn assign(&self, id: &str, uuid: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query("INSERT OR IGNORE INTO uidentities (uuid, created_at) VALUES (?, ?)")
            .bind(uuid)
            .bind(now)
            .execute(&self.pool)
            .await?;
        let updated = sqlx::query("UPDATE identities SET uuid = ? WHERE id = ?")
            .bind(uuid)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            anyhow::bail!("no identity with id '{}'", id);
        }
        Ok(())
    }

    pub async fn set_profile(&self, uuid: &str, profile: &Profile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (uuid, name, email, gender, gender_acc, is_bot)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(uuid) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                gender = excluded.gender,
                gender_acc = excluded.gender_acc,
                is_bot = excluded.is_bot
            "#,
        )
        .bind(uuid)
        .bind(&profile.name)
        .bind(&profile.email)
        .bind(&profile.gender)
        .bind(profile.gender_acc)
        .bind(profile.is_bot as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_enrollment(
        &self,
        uuid: &str,
        organization: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<()> {
        if start > end {
            anyhow::bail!("enrollment of {} in {} ends before it starts", uuid, organization);
        }
        sqlx::query("INSERT OR IGNORE INTO organizations (name) VALUES (?)")
            .bind(organization)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"INSERT OR IGNORE INTO enrollments (uuid, organization, start, "end") VALUES (?, ?, ?, ?)"#,
        )
        .bind(uuid)
        .bind(organization)
        .bind(start.format(DATE_FORMAT).to_string())
        .bind(end.format(DATE_FORMAT).to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_identities(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM identities")
            .fetch_one(&self.pool)
            .await?)
    }
}

/// Counters of one identity load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub items: usize,
    /// Distinct identities found in the items.
    pub identities: usize,
    /// Identities the registry did not know yet.
    pub created: usize,
}

/// Register every identity the transform finds in the raw items of
/// `source`. Identities already registered are left untouched.
pub async fn load_identities(
    registry: &SqliteIdentityStore,
    source: &mut RawSource<'_>,
    transform: &dyn Transform,
) -> Result<LoadReport> {
    let mut report = LoadReport::default();
    let mut seen = HashSet::new();
    while let Some(hit) = source
        .next_hit()
        .await
        .with_context(|| format!("reading raw items from {}", source.index()))?
    {
        report.items += 1;
        let item: RawItem = match serde_json::from_value(hit) {
            Ok(item) => item,
            Err(e) => {
                warn!(source = %transform.source(), error = %e, "skipping unreadable raw item");
                continue;
            }
        };
        for identity in transform.identities(&item) {
            if identity.is_empty() || !seen.insert(identity.clone()) {
                continue;
            }
            let (_, created) = registry.add_identity(transform.source(), &identity).await?;
            if created {
                report.created += 1;
            }
        }
    }
    report.identities = seen.len();
    info!(
        source = %transform.source(),
        items = report.items,
        identities = report.identities,
        created = report.created,
        "identities loaded"
    );
    Ok(report)
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn find_ids(&self, identity: &Identity, source: &str) -> IdentityResult<ResolvedIds> {
        if identity.is_empty() {
            return Err(IdentityError::Invalid("empty identity".to_string()));
        }
        let id = identity_id(source, identity);
        let uuid: Option<String> = sqlx::query_scalar("SELECT uuid FROM identities WHERE id = ?")
            .bind(&id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        match uuid {
            Some(uuid) => Ok(ResolvedIds {
                id: Some(id),
                uuid: Some(uuid),
            }),
            None => Err(IdentityError::NotFound(id)),
        }
    }

    async fn lookup_id(&self, id: &str) -> IdentityResult<(Identity, ResolvedIds)> {
        let row: Option<(String, Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as("SELECT uuid, name, email, username FROM identities WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
        let (uuid, name, email, username) =
            row.ok_or_else(|| IdentityError::NotFound(id.to_string()))?;
        Ok((
            Identity {
                name,
                email,
                username,
            },
            ResolvedIds {
                id: Some(id.to_string()),
                uuid: Some(uuid),
            },
        ))
    }

    async fn profile(&self, uuid: &str) -> IdentityResult<Option<Profile>> {
        let row: Option<(Option<String>, Option<String>, Option<String>, Option<i64>, i64)> =
            sqlx::query_as(
                "SELECT name, email, gender, gender_acc, is_bot FROM profiles WHERE uuid = ?",
            )
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(row.map(|(name, email, gender, gender_acc, is_bot)| Profile {
            name,
            email,
            gender,
            gender_acc,
            is_bot: is_bot != 0,
        }))
    }

    async fn enrollments(&self, uuid: &str) -> IdentityResult<Vec<Enrollment>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"SELECT organization, start, "end" FROM enrollments WHERE uuid = ? ORDER BY start"#,
        )
        .bind(uuid)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.into_iter()
            .map(|(organization, start, end)| {
                match (parse_naive_utc(&start), parse_naive_utc(&end)) {
                    (Some(start), Some(end)) => Ok(Enrollment {
                        organization,
                        start,
                        end,
                    }),
                    _ => Err(IdentityError::Invalid(format!(
                        "enrollment of {uuid} in {organization} has unreadable dates"
                    ))),
                }
            })
            .collect()
    }
}
