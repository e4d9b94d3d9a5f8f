//! # Enrich Harness Core
//!
//! Shared, I/O-free logic for Enrich Harness: raw and enriched item models,
//! date normalization, the NDJSON bulk codec, the document store
//! abstraction, the identity resolution cache, project mapping, and the
//! collector/transform extension traits.
//!
//! This crate contains no tokio, sqlx, HTTP client, or filesystem I/O.
//! Native backends (Elasticsearch, SQLite) live in the `enrich-harness`
//! app crate and plug in through the traits defined here.

pub mod bulk;
pub mod collector;
pub mod dates;
pub mod identity;
pub mod models;
pub mod project;
pub mod store;
pub mod transform;
pub mod watermark;
