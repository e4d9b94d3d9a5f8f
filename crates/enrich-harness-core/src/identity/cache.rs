//! Read-through identity cache.
//!
//! Wraps an [`IdentityStore`] with bounded LRU caches for resolutions,
//! id lookups, profiles, enrollments, and the per-role field maps built
//! from them. One cache belongs to one pipeline run.
//!
//! Resolution failures never reach the caller: an identity that cannot be
//! resolved yields an unresolved result, which is cached too, so each
//! distinct failure is logged once. Rebuilding fields from a stored id
//! ([`IdentityCache::role_fields_from_id`]) is the exception: there an
//! unavailable store is returned as an error and never cached.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::NaiveDateTime;
use lru::LruCache;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::models::{email_domain, Enrollment, Identity, Profile, ResolvedIds};

use super::{IdentityError, IdentityResult, IdentityStore};

/// Field value when the identity tuple could not be resolved.
pub const UNDEFINED_VALUE: &str = "-- UNDEFINED --";
/// Field value when the identity resolved but the data is not on file.
pub const UNKNOWN_VALUE: &str = "Unknown";

type ResolveKey = (Identity, String);
type RoleKey = (Identity, String, String, Option<NaiveDateTime>);

/// Hit/miss counters across all caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct IdentityCache {
    store: Arc<dyn IdentityStore>,
    unaffiliated_group: String,
    unknown_gender: String,

    resolutions: Mutex<LruCache<ResolveKey, ResolvedIds>>,
    by_id: Mutex<LruCache<String, Option<(Identity, ResolvedIds)>>>,
    profiles: Mutex<LruCache<String, Option<Profile>>>,
    enrollments: Mutex<LruCache<String, Vec<Enrollment>>>,
    role_fields: Mutex<LruCache<RoleKey, Map<String, Value>>>,

    hits: AtomicU64,
    misses: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl IdentityCache {
    pub fn new(store: Arc<dyn IdentityStore>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            unaffiliated_group: UNKNOWN_VALUE.to_string(),
            unknown_gender: UNKNOWN_VALUE.to_string(),
            resolutions: Mutex::new(LruCache::new(capacity)),
            by_id: Mutex::new(LruCache::new(capacity)),
            profiles: Mutex::new(LruCache::new(capacity)),
            enrollments: Mutex::new(LruCache::new(capacity)),
            role_fields: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Override the organization reported for identities without a
    /// covering enrollment.
    pub fn with_unaffiliated_group(mut self, group: impl Into<String>) -> Self {
        self.unaffiliated_group = group.into();
        self
    }

    pub fn with_unknown_gender(mut self, gender: impl Into<String>) -> Self {
        self.unknown_gender = gender.into();
        self
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn cached<K: Hash + Eq, V: Clone>(&self, cache: &Mutex<LruCache<K, V>>, key: &K) -> Option<V> {
        let found = lock(cache).get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Canonical keys for `identity` as seen in `source`.
    ///
    /// Returns [`ResolvedIds::unresolved`] when the identity is empty,
    /// unknown, or the store fails.
    pub async fn resolve(&self, identity: &Identity, source: &str) -> ResolvedIds {
        let key = (identity.clone(), source.to_string());
        if let Some(ids) = self.cached(&self.resolutions, &key) {
            return ids;
        }

        let ids = if identity.is_empty() {
            debug!(source, "empty identity, leaving unresolved");
            ResolvedIds::unresolved()
        } else {
            match self.store.find_ids(identity, source).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(
                        source,
                        name = identity.name.as_deref().unwrap_or(""),
                        username = identity.username.as_deref().unwrap_or(""),
                        error = %e,
                        "identity unresolved"
                    );
                    ResolvedIds::unresolved()
                }
            }
        };
        lock(&self.resolutions).put(key, ids.clone());
        ids
    }

    /// The identity tuple and keys registered under an identity id.
    ///
    /// Unknown ids give `None`. A store failure also gives `None` and is
    /// logged.
    pub async fn lookup_id(&self, id: &str) -> Option<(Identity, ResolvedIds)> {
        self.try_lookup_id(id).await.unwrap_or_else(|e| {
            warn!(id, error = %e, "identity id lookup failed");
            None
        })
    }

    /// Like [`lookup_id`](Self::lookup_id), but an unavailable store is an
    /// error instead of a missing identity. Outages are not cached.
    pub async fn try_lookup_id(&self, id: &str) -> IdentityResult<Option<(Identity, ResolvedIds)>> {
        let key = id.to_string();
        if let Some(found) = self.cached(&self.by_id, &key) {
            return Ok(found);
        }
        let found = match self.store.lookup_id(id).await {
            Ok(found) => Some(found),
            Err(e @ IdentityError::Unavailable(_)) => return Err(e),
            Err(e) => {
                debug!(id, error = %e, "identity id not on file");
                None
            }
        };
        lock(&self.by_id).put(key, found.clone());
        Ok(found)
    }

    pub async fn profile(&self, uuid: &str) -> Option<Profile> {
        self.try_profile(uuid).await.unwrap_or_else(|e| {
            warn!(uuid, error = %e, "profile lookup failed");
            None
        })
    }

    async fn try_profile(&self, uuid: &str) -> IdentityResult<Option<Profile>> {
        let key = uuid.to_string();
        if let Some(profile) = self.cached(&self.profiles, &key) {
            return Ok(profile);
        }
        let profile = match self.store.profile(uuid).await {
            Ok(profile) => profile,
            Err(e @ IdentityError::Unavailable(_)) => return Err(e),
            Err(e) => {
                debug!(uuid, error = %e, "no profile");
                None
            }
        };
        lock(&self.profiles).put(key, profile.clone());
        Ok(profile)
    }

    pub async fn enrollments(&self, uuid: &str) -> Vec<Enrollment> {
        self.try_enrollments(uuid).await.unwrap_or_else(|e| {
            warn!(uuid, error = %e, "enrollment lookup failed");
            Vec::new()
        })
    }

    async fn try_enrollments(&self, uuid: &str) -> IdentityResult<Vec<Enrollment>> {
        let key = uuid.to_string();
        if let Some(list) = self.cached(&self.enrollments, &key) {
            return Ok(list);
        }
        let list = match self.store.enrollments(uuid).await {
            Ok(list) => list,
            Err(e @ IdentityError::Unavailable(_)) => return Err(e),
            Err(e) => {
                debug!(uuid, error = %e, "no enrollments");
                Vec::new()
            }
        };
        lock(&self.enrollments).put(key, list.clone());
        Ok(list)
    }

    /// Organizations covering `at` (naive UTC). Without a date, the first
    /// enrollment on file.
    pub async fn organizations(&self, uuid: &str, at: Option<NaiveDateTime>) -> Vec<String> {
        organizations_at(&self.enrollments(uuid).await, at)
    }

    /// Organization of `uuid` at `at`, or the unaffiliated group.
    pub async fn enrollment(&self, uuid: &str, at: Option<NaiveDateTime>) -> String {
        self.organizations(uuid, at)
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| self.unaffiliated_group.clone())
    }

    pub async fn is_bot(&self, uuid: &str) -> bool {
        self.profile(uuid).await.is_some_and(|p| p.is_bot)
    }

    /// Flat `<role>_*` fields for one identity at one event date.
    ///
    /// No identity gives an empty map; an unresolved identity gives
    /// [`UNDEFINED_VALUE`] everywhere; a resolved identity with missing
    /// data gives [`UNKNOWN_VALUE`] for the missing parts.
    pub async fn role_fields(
        &self,
        identity: Option<&Identity>,
        source: &str,
        role: &str,
        at: Option<NaiveDateTime>,
    ) -> Map<String, Value> {
        let Some(identity) = identity else {
            return Map::new();
        };
        let key = (identity.clone(), source.to_string(), role.to_string(), at);
        if let Some(fields) = self.cached(&self.role_fields, &key) {
            return fields;
        }

        let ids = self.resolve(identity, source).await;
        let fields = if ids.is_resolved() {
            self.populated_fields(role, identity, &ids, at).await
        } else {
            undefined_fields(role)
        };
        lock(&self.role_fields).put(key, fields.clone());
        fields
    }

    /// Role fields rebuilt from a stored identity id.
    ///
    /// An id the store does not know gives [`UNDEFINED_VALUE`] fields. An
    /// unavailable store is an error so callers never mistake an outage
    /// for a missing identity.
    pub async fn role_fields_from_id(
        &self,
        id: &str,
        role: &str,
        at: Option<NaiveDateTime>,
    ) -> IdentityResult<Map<String, Value>> {
        match self.try_lookup_id(id).await? {
            Some((identity, ids)) if ids.is_resolved() => {
                let uuid = ids.uuid.clone().unwrap_or_default();
                let profile = self.try_profile(&uuid).await?.unwrap_or_default();
                let orgs = organizations_at(&self.try_enrollments(&uuid).await?, at);
                Ok(self.build_fields(role, &identity, &ids, profile, orgs))
            }
            _ => Ok(undefined_fields(role)),
        }
    }

    async fn populated_fields(
        &self,
        role: &str,
        identity: &Identity,
        ids: &ResolvedIds,
        at: Option<NaiveDateTime>,
    ) -> Map<String, Value> {
        let uuid = ids.uuid.clone().unwrap_or_default();
        let profile = self.profile(&uuid).await.unwrap_or_default();
        let orgs = self.organizations(&uuid, at).await;
        self.build_fields(role, identity, ids, profile, orgs)
    }

    fn build_fields(
        &self,
        role: &str,
        identity: &Identity,
        ids: &ResolvedIds,
        profile: Profile,
        mut orgs: Vec<String>,
    ) -> Map<String, Value> {
        let uuid = ids.uuid.clone().unwrap_or_default();
        if orgs.is_empty() {
            orgs.push(self.unaffiliated_group.clone());
        }

        let known = |v: Option<&str>| {
            v.filter(|s| !s.trim().is_empty())
                .unwrap_or(UNKNOWN_VALUE)
                .to_string()
        };
        let name = known(profile.name.as_deref().or(identity.name.as_deref()));
        let domain = profile
            .email
            .as_deref()
            .and_then(email_domain)
            .or_else(|| identity.email_domain());

        let mut fields = Map::new();
        fields.insert(format!("{role}_id"), json!(ids.id));
        fields.insert(format!("{role}_uuid"), json!(uuid));
        fields.insert(format!("{role}_name"), json!(name));
        fields.insert(
            format!("{role}_user_name"),
            json!(known(identity.username.as_deref())),
        );
        fields.insert(format!("{role}_domain"), json!(known(domain.as_deref())));
        fields.insert(
            format!("{role}_gender"),
            json!(profile
                .gender
                .clone()
                .unwrap_or_else(|| self.unknown_gender.clone())),
        );
        fields.insert(
            format!("{role}_gender_acc"),
            json!(profile.gender_acc.unwrap_or(0)),
        );
        fields.insert(format!("{role}_org_name"), json!(orgs[0]));
        fields.insert(format!("{role}_multi_org_names"), json!(orgs));
        fields.insert(format!("{role}_bot"), json!(profile.is_bot));
        fields
    }
}

fn organizations_at(enrollments: &[Enrollment], at: Option<NaiveDateTime>) -> Vec<String> {
    match at {
        Some(at) => enrollments
            .iter()
            .filter(|e| e.covers(at))
            .map(|e| e.organization.clone())
            .collect(),
        None => enrollments
            .first()
            .map(|e| vec![e.organization.clone()])
            .unwrap_or_default(),
    }
}

/// Role fields for an identity that could not be resolved.
pub fn undefined_fields(role: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    for suffix in ["id", "uuid", "name", "user_name", "domain", "gender", "org_name"] {
        fields.insert(format!("{role}_{suffix}"), json!(UNDEFINED_VALUE));
    }
    fields.insert(format!("{role}_multi_org_names"), json!([UNDEFINED_VALUE]));
    fields.insert(format!("{role}_gender_acc"), Value::Null);
    fields.insert(format!("{role}_bot"), json!(false));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::memory::InMemoryIdentityStore;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn jane() -> Identity {
        Identity::new(Some("Jane Doe"), Some("jane@acme.org"), Some("jdoe"))
    }

    fn setup() -> (Arc<InMemoryIdentityStore>, IdentityCache) {
        let store = Arc::new(InMemoryIdentityStore::new());
        store.add_identity("git", jane(), "u-jane");
        store.set_profile(
            "u-jane",
            Profile {
                name: Some("Jane D.".into()),
                email: Some("jane@acme.org".into()),
                gender: Some("female".into()),
                gender_acc: Some(90),
                is_bot: false,
            },
        );
        store.add_enrollment(
            "u-jane",
            Enrollment {
                organization: "Acme".into(),
                start: at(2020, 1, 1),
                end: at(2022, 12, 31),
            },
        );
        store.add_enrollment(
            "u-jane",
            Enrollment {
                organization: "Globex".into(),
                start: at(2023, 1, 1),
                end: at(2100, 1, 1),
            },
        );
        let cache = IdentityCache::new(store.clone(), 100);
        (store, cache)
    }

    #[tokio::test]
    async fn resolve_hits_store_once() {
        let (store, cache) = setup();
        let first = cache.resolve(&jane(), "git").await;
        let second = cache.resolve(&jane(), "git").await;
        assert_eq!(first, second);
        assert_eq!(first.uuid.as_deref(), Some("u-jane"));
        assert_eq!(store.lookups(), 1);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[tokio::test]
    async fn unresolved_results_are_cached() {
        let (store, cache) = setup();
        let stranger = Identity::new(Some("Nobody"), None, None);
        assert!(!cache.resolve(&stranger, "git").await.is_resolved());
        assert!(!cache.resolve(&stranger, "git").await.is_resolved());
        assert_eq!(store.lookups(), 1);
    }

    #[tokio::test]
    async fn store_outage_yields_unresolved() {
        let (store, cache) = setup();
        store.set_unavailable(true);
        let ids = cache.resolve(&jane(), "git").await;
        assert_eq!(ids, ResolvedIds::unresolved());
    }

    #[tokio::test]
    async fn enrollment_follows_event_date() {
        let (_, cache) = setup();
        assert_eq!(cache.enrollment("u-jane", Some(at(2021, 6, 1))).await, "Acme");
        assert_eq!(cache.enrollment("u-jane", Some(at(2024, 6, 1))).await, "Globex");
        assert_eq!(cache.enrollment("u-jane", Some(at(2019, 6, 1))).await, UNKNOWN_VALUE);
        assert_eq!(cache.enrollment("u-jane", None).await, "Acme");
        assert_eq!(cache.enrollment("u-nobody", None).await, UNKNOWN_VALUE);
    }

    #[tokio::test]
    async fn empty_identity_gives_undefined_sentinels() {
        let (_, cache) = setup();
        let empty = Identity::default();
        let fields = cache.role_fields(Some(&empty), "git", "author", None).await;
        assert_eq!(fields["author_name"], UNDEFINED_VALUE);
        assert_eq!(fields["author_org_name"], UNDEFINED_VALUE);
        assert_eq!(fields["author_uuid"], UNDEFINED_VALUE);
        assert_eq!(fields["author_bot"], false);
        assert!(fields["author_gender_acc"].is_null());
        assert!(fields.values().all(|v| v != UNKNOWN_VALUE));
    }

    #[tokio::test]
    async fn resolved_identity_without_enrollment_gives_unknown() {
        let (_, cache) = setup();
        let fields = cache
            .role_fields(Some(&jane()), "git", "author", Some(at(2019, 6, 1)))
            .await;
        assert_eq!(fields["author_uuid"], "u-jane");
        assert_eq!(fields["author_name"], "Jane D.");
        assert_eq!(fields["author_user_name"], "jdoe");
        assert_eq!(fields["author_domain"], "acme.org");
        assert_eq!(fields["author_gender"], "female");
        assert_eq!(fields["author_gender_acc"], 90);
        assert_eq!(fields["author_org_name"], UNKNOWN_VALUE);
        assert!(fields.values().all(|v| v != UNDEFINED_VALUE));
    }

    #[tokio::test]
    async fn role_fields_are_memoized() {
        let (store, cache) = setup();
        let a = cache
            .role_fields(Some(&jane()), "git", "author", Some(at(2024, 1, 1)))
            .await;
        let lookups = store.lookups();
        let b = cache
            .role_fields(Some(&jane()), "git", "author", Some(at(2024, 1, 1)))
            .await;
        assert_eq!(a, b);
        assert_eq!(store.lookups(), lookups);
        assert_eq!(a["author_org_name"], "Globex");
    }

    #[tokio::test]
    async fn no_identity_gives_no_fields() {
        let (_, cache) = setup();
        assert!(cache.role_fields(None, "git", "author", None).await.is_empty());
    }

    #[tokio::test]
    async fn fields_from_stored_id() {
        let (store, cache) = setup();
        let id = store.add_identity("git", jane(), "u-jane");
        let fields = cache
            .role_fields_from_id(&id, "assignee", Some(at(2021, 1, 1)))
            .await
            .unwrap();
        assert_eq!(fields["assignee_id"], id.as_str());
        assert_eq!(fields["assignee_org_name"], "Acme");
        let missing = cache
            .role_fields_from_id("nope", "assignee", None)
            .await
            .unwrap();
        assert_eq!(missing["assignee_id"], UNDEFINED_VALUE);
    }

    #[tokio::test]
    async fn custom_unaffiliated_group() {
        let store = Arc::new(InMemoryIdentityStore::new());
        store.add_identity("git", jane(), "u-jane");
        let cache = IdentityCache::new(store, 10).with_unaffiliated_group("Independent");
        let fields = cache.role_fields(Some(&jane()), "git", "author", None).await;
        assert_eq!(fields["author_org_name"], "Independent");
        assert_eq!(fields["author_gender"], UNKNOWN_VALUE);
        assert_eq!(fields["author_gender_acc"], 0);
        assert_eq!(fields["author_name"], "Jane Doe");
    }

    #[tokio::test]
    async fn fields_from_id_fail_while_store_is_down() {
        let (store, cache) = setup();
        let id = store.add_identity("git", jane(), "u-jane");
        store.set_unavailable(true);
        let err = cache
            .role_fields_from_id(&id, "author", Some(at(2021, 1, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::Unavailable(_)));

        // The outage was not cached
        store.set_unavailable(false);
        let fields = cache
            .role_fields_from_id(&id, "author", Some(at(2021, 1, 1)))
            .await
            .unwrap();
        assert_eq!(fields["author_uuid"], "u-jane");
        assert_eq!(fields["author_org_name"], "Acme");
    }
}
