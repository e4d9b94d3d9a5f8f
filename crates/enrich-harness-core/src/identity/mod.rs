//! Identity resolution.
//!
//! An [`IdentityStore`] maps free-form `{name, email, username}` tuples to
//! canonical ids, profiles, and enrollments. Lookups are expensive and
//! repeat heavily within a run, so the pipeline always goes through an
//! [`IdentityCache`](cache::IdentityCache), which memoizes every answer
//! and turns failures into sentinel field values.

pub mod cache;
pub mod memory;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::{Enrollment, Identity, Profile, ResolvedIds};

pub use cache::{CacheStats, IdentityCache, UNDEFINED_VALUE, UNKNOWN_VALUE};

/// Failure resolving an identity. Only an unavailable store rebuilding
/// fields from a stored id gets past the cache.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IdentityError {
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid identity: {0}")]
    Invalid(String),
    #[error("identity not found: {0}")]
    NotFound(String),
}

pub type IdentityResult<T> = Result<T, IdentityError>;

/// Backend holding unique identities, profiles, and enrollments.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Canonical keys for an identity seen in `source`.
    async fn find_ids(&self, identity: &Identity, source: &str) -> IdentityResult<ResolvedIds>;

    /// The identity tuple and canonical keys registered under `id`.
    async fn lookup_id(&self, id: &str) -> IdentityResult<(Identity, ResolvedIds)>;

    async fn profile(&self, uuid: &str) -> IdentityResult<Option<Profile>>;

    /// Enrollments of a unique identity, ordered by start date.
    async fn enrollments(&self, uuid: &str) -> IdentityResult<Vec<Enrollment>>;
}

/// Stable id of an identity tuple within a source.
///
/// SHA-256 over `source:email:name:username`, with absent fields empty.
pub fn identity_id(source: &str, identity: &Identity) -> String {
    let part = |v: &Option<String>| v.clone().unwrap_or_default();
    let key = format!(
        "{}:{}:{}:{}",
        source.to_lowercase(),
        part(&identity.email),
        part(&identity.name),
        part(&identity.username)
    );
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_id_is_stable_and_source_scoped() {
        let id = Identity::new(Some("Jane"), Some("jane@acme.org"), None);
        assert_eq!(identity_id("git", &id), identity_id("GIT", &id));
        assert_ne!(identity_id("git", &id), identity_id("github", &id));
        assert_eq!(identity_id("git", &id).len(), 64);
    }
}
