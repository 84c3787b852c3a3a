//! # Knowledge Gateway CLI (`kgw`)
//!
//! ## Usage
//!
//! ```bash
//! kgw --config ./config/gateway.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kgw init` | Create the SQLite database and run schema migrations |
//! | `kgw serve` | Start the HTTP gateway |
//! | `kgw space create --name <n>` | Create a knowledge space |
//! | `kgw extract <file>` | Print the cleaned text extracted from a local file |
//! | `kgw search <space_id> [query]` | Search document titles in a space |
//! | `kgw remote docs` | List documents held by the remote index |
//!
//! Log verbosity follows `RUST_LOG` (default `knowledge_gateway=info,kgw=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use knowledge_gateway::config::{self, Config};
use knowledge_gateway::extract::{self, ExtractLimits};
use knowledge_gateway::mapping::MappingStore;
use knowledge_gateway::models::SpaceId;
use knowledge_gateway::remote::{DifyClient, RemoteIndex};
use knowledge_gateway::spaces::SpaceStore;
use knowledge_gateway::{db, migrate, server};

/// Knowledge Gateway: document ingestion and streaming question answering
/// over a remote RAG platform.
#[derive(Parser)]
#[command(name = "kgw", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/gateway.toml`.
    #[arg(long, global = true, default_value = "./config/gateway.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the `spaces` and `file_map`
    /// tables. Running it again is harmless.
    Init,

    /// Start the HTTP gateway.
    Serve,

    /// Manage knowledge spaces.
    Space {
        #[command(subcommand)]
        action: SpaceAction,
    },

    /// Extract and print the cleaned text of a local file.
    ///
    /// Uses the same extractor as uploads. Works without a config file.
    Extract {
        /// File to extract; its extension selects the format.
        file: PathBuf,
    },

    /// Search document titles within a space (local mapping table only).
    Search {
        space_id: String,

        /// Substring to match; omit to list every document.
        query: Option<String>,
    },

    /// Inspect the remote RAG platform.
    Remote {
        #[command(subcommand)]
        action: RemoteAction,
    },
}

#[derive(Subcommand)]
enum SpaceAction {
    /// Create a knowledge space and print its id.
    Create {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        description: String,
    },
}

#[derive(Subcommand)]
enum RemoteAction {
    /// List documents in the configured dataset.
    Docs {
        #[arg(long)]
        keyword: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: u32,

        /// Page size, clamped to 1..=100.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "knowledge_gateway=info,kgw=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Extract { file } = &cli.command {
        let limits = config::load_config(&cli.config)
            .map(|c| c.extract.limits())
            .unwrap_or_else(|_| ExtractLimits::default());
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = extract::extract_file(file, &name, &limits)?;
        println!("{}", text);
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Space {
            action: SpaceAction::Create { name, description },
        } => {
            let pool = open_pool(&cfg).await?;
            let space = SpaceStore::new(pool.clone())
                .create(&name, &description)
                .await?;
            pool.close().await;
            println!("{}", space.space_id);
        }
        Commands::Search { space_id, query } => {
            let pool = open_pool(&cfg).await?;
            let rows = MappingStore::new(pool.clone())
                .search_by_name(&SpaceId::new(space_id), query.as_deref().unwrap_or(""))
                .await?;
            pool.close().await;

            if rows.is_empty() {
                println!("No documents found.");
            }
            for row in rows {
                println!("{}\t{}{}", row.document_id, row.file_name, row.extension);
            }
        }
        Commands::Remote {
            action:
                RemoteAction::Docs {
                    keyword,
                    page,
                    limit,
                },
        } => {
            let (dataset_key, app_key) = cfg.remote.api_keys()?;
            let client = DifyClient::new(reqwest::Client::new(), &cfg.remote, dataset_key, app_key);
            let listing = client
                .list_documents(keyword.as_deref(), page, limit)
                .await?;
            for doc in &listing.data {
                println!("{}\t{}", doc.id, doc.name);
            }
            println!(
                "page {} ({} shown, {} total{})",
                page.max(1),
                listing.data.len(),
                listing.total,
                if listing.has_more { ", more available" } else { "" }
            );
        }
        Commands::Extract { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn open_pool(cfg: &Config) -> anyhow::Result<sqlx::SqlitePool> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    Ok(pool)
}
