//! # Enrich Harness
//!
//! An incremental sync and enrichment engine for software-development
//! activity data.
//!
//! Collectors emit raw items; the feeder stores them in a raw
//! Elasticsearch index and remembers how far it got. The enrichment driver
//! turns raw items into flat, analysis-ready documents with identity and
//! project fields, and studies compute aggregate fields over the result.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────┐   ┌───────────┐   ┌──────────┐   ┌───────────┐
//! │ Collectors │──▶│  Feed  │──▶│ raw index │──▶│  Enrich  │──▶│ enriched  │
//! │  (JSONL)   │   └───┬────┘   └───────────┘   └────┬─────┘   │   index   │
//! └────────────┘       │ watermarks                  │         └─────┬─────┘
//!                      ▼                             ▼               ▼
//!                ┌───────────┐                ┌────────────┐   ┌─────────┐
//!                │ SQLite /  │                │ identities │   │ studies │
//!                │ raw index │                │  (SQLite)  │   └─────────┘
//!                └───────────┘                └────────────┘
//! ```
//!
//! The storage-independent pieces (models, watermarks, identity cache,
//! project mapping, the [`DocumentStore`](enrich_harness_core::store::DocumentStore)
//! trait) live in `enrich-harness-core`; this crate holds the backends and
//! the pipeline.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`elastic`] | Elasticsearch document store |
//! | [`feed`] | Incremental feeder |
//! | [`enrich`] | Raw source reader, enrichment driver, identity refresh |
//! | [`studies`] | Studies runner and the demography study |
//! | [`collector_jsonl`] | JSON-lines collector |
//! | [`transform_fieldmap`] | Configurable field-map transform |
//! | [`identities`] | SQLite identity registry and identity loading |
//! | [`checkpoints`] | SQLite-persisted watermarks |
//! | [`registry`] | Per-source collector and transform registry |
//! | [`pipeline`] | Orchestration and CLI entry points |
//! | [`sources`] | Source listing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod checkpoints;
pub mod collector_jsonl;
pub mod config;
pub mod db;
pub mod elastic;
pub mod enrich;
pub mod feed;
pub mod identities;
pub mod migrate;
pub mod pipeline;
pub mod registry;
pub mod sources;
pub mod studies;
pub mod transform_fieldmap;
