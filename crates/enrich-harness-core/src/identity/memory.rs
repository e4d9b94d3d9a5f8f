//! In-memory [`IdentityStore`] for tests.
//!
//! Counts every lookup so tests can verify the cache in front of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::models::{Enrollment, Identity, Profile, ResolvedIds};

use super::{identity_id, IdentityError, IdentityResult, IdentityStore};

#[derive(Default)]
struct Registry {
    identities: HashMap<String, (Identity, String)>,
    profiles: HashMap<String, Profile>,
    enrollments: HashMap<String, Vec<Enrollment>>,
}

#[derive(Default)]
pub struct InMemoryIdentityStore {
    registry: RwLock<Registry>,
    lookups: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `identity` from `source` under unique identity `uuid`.
    /// Returns the identity id.
    pub fn add_identity(&self, source: &str, identity: Identity, uuid: &str) -> String {
        let id = identity_id(source, &identity);
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .identities
            .insert(id.clone(), (identity, uuid.to_string()));
        id
    }

    pub fn set_profile(&self, uuid: &str, profile: Profile) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .profiles
            .insert(uuid.to_string(), profile);
    }

    pub fn add_enrollment(&self, uuid: &str, enrollment: Enrollment) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let list = registry.enrollments.entry(uuid.to_string()).or_default();
        list.push(enrollment);
        list.sort_by_key(|e| e.start);
    }

    /// Make every call fail as if the backend were down.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Total number of backend calls.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn enter(&self) -> IdentityResult<()> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IdentityError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn find_ids(&self, identity: &Identity, source: &str) -> IdentityResult<ResolvedIds> {
        self.enter()?;
        if identity.is_empty() {
            return Err(IdentityError::Invalid("empty identity".to_string()));
        }
        let id = identity_id(source, identity);
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        match registry.identities.get(&id) {
            Some((_, uuid)) => Ok(ResolvedIds {
                id: Some(id),
                uuid: Some(uuid.clone()),
            }),
            None => Err(IdentityError::NotFound(id)),
        }
    }

    async fn lookup_id(&self, id: &str) -> IdentityResult<(Identity, ResolvedIds)> {
        self.enter()?;
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .identities
            .get(id)
            .map(|(identity, uuid)| {
                (
                    identity.clone(),
                    ResolvedIds {
                        id: Some(id.to_string()),
                        uuid: Some(uuid.clone()),
                    },
                )
            })
            .ok_or_else(|| IdentityError::NotFound(id.to_string()))
    }

    async fn profile(&self, uuid: &str) -> IdentityResult<Option<Profile>> {
        self.enter()?;
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        Ok(registry.profiles.get(uuid).cloned())
    }

    async fn enrollments(&self, uuid: &str) -> IdentityResult<Vec<Enrollment>> {
        self.enter()?;
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        Ok(registry.enrollments.get(uuid).cloned().unwrap_or_default())
    }
}
