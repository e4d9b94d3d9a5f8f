//! # Enrich Harness CLI (`enrich`)
//!
//! The `enrich` binary drives the pipeline: it feeds collector output into
//! raw indices, enriches raw items into enriched indices, maintains the
//! identity registry, and runs studies.
//!
//! ## Usage
//!
//! ```bash
//! enrich --config ./config/enrich.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `enrich init` | Create the SQLite registry and run schema migrations |
//! | `enrich sources` | List configured sources |
//! | `enrich feed <source>` | Fetch new items into the raw index |
//! | `enrich enrich <source>` | Enrich new raw items into the enriched index |
//! | `enrich study <source>` | Run studies on the enriched index |
//! | `enrich identities load <source>` | Register identities found in raw items |
//! | `enrich identities refresh <source>` | Rebuild identity fields of enriched documents |
//! | `enrich run [source]` | Feed, enrich, and study one or all sources |
//!
//! Logging goes to stderr and follows `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use enrich_harness::{config, migrate, pipeline, sources};

/// Enrich Harness CLI: incremental sync and enrichment of raw items into
/// Elasticsearch.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/enrich.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "enrich",
    about = "Enrich Harness: incremental sync and enrichment engine",
    version,
    long_about = "Enrich Harness feeds collector output into raw Elasticsearch indices, \
    enriches raw items with identities and projects into enriched indices, and runs \
    aggregate studies over them. Every stage resumes from where the last run stopped."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/enrich.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the registry database.
    ///
    /// Creates the SQLite file and the identity and checkpoint tables.
    /// Safe to run more than once.
    Init,

    /// List configured sources.
    Sources,

    /// Fetch new items of a source into its raw index.
    ///
    /// Resumes from the source's watermark unless `--full` or `--since`
    /// is given.
    Feed {
        /// Source name (`[sources.<name>]`).
        source: String,

        /// Ignore the watermark and fetch everything.
        #[arg(long)]
        full: bool,

        /// Start position: a date (YYYY-MM-DD or ISO-8601) or, for
        /// offset-resumed sources, an offset.
        #[arg(long)]
        since: Option<String>,
    },

    /// Enrich raw items of a source into its enriched index.
    Enrich {
        source: String,

        /// Re-enrich every raw item instead of only new ones.
        #[arg(long)]
        full: bool,
    },

    /// Run studies on the enriched index of a source.
    Study { source: String },

    /// Identity registry commands.
    Identities {
        #[command(subcommand)]
        action: IdentitiesAction,
    },

    /// Feed, enrich, and study one source, or all of them.
    Run { source: Option<String> },
}

#[derive(Subcommand)]
enum IdentitiesAction {
    /// Register the identities found in a source's raw items.
    Load { source: String },

    /// Rebuild the identity fields of a source's enriched documents.
    Refresh {
        source: String,

        /// Only documents of this unique identity.
        #[arg(long)]
        author_uuid: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Registry initialized at {}.", cfg.db.path.display());
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Feed {
            source,
            full,
            since,
        } => {
            pipeline::run_feed(&cfg, &source, full, since).await?;
        }
        Commands::Enrich { source, full } => {
            pipeline::run_enrich(&cfg, &source, full).await?;
        }
        Commands::Study { source } => {
            pipeline::run_study(&cfg, &source).await?;
        }
        Commands::Identities { action } => match action {
            IdentitiesAction::Load { source } => {
                pipeline::run_load_identities(&cfg, &source).await?;
            }
            IdentitiesAction::Refresh {
                source,
                author_uuid,
            } => {
                pipeline::run_refresh_identities(&cfg, &source, author_uuid).await?;
            }
        },
        Commands::Run { source } => {
            pipeline::run_all(&cfg, source.as_deref()).await?;
        }
    }

    Ok(())
}
