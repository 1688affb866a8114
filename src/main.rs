//! # `dchat`
//!
//! Every stage of the pipeline is a subcommand:
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dchat init` | Create the SQLite database and run schema migrations |
//! | `dchat auth` | Obtain or refresh the Drive token |
//! | `dchat tree` | Print the remote folder tree |
//! | `dchat download` | Reconcile the local mirror with the drive |
//! | `dchat ingest` | Load, chunk, embed and store the mirror |
//! | `dchat sync` | `download` then `ingest` |
//! | `dchat search "<query>"` | Search stored documents |
//! | `dchat get <id>` | Print a stored document |
//! | `dchat embed pending\|rebuild` | Backfill or regenerate embeddings |
//! | `dchat stats` | Document store summary |
//! | `dchat status` | Credentials, token, mirror and database checks |
//! | `dchat chat` | Terminal chat over the documents |
//! | `dchat serve` | HTTP chat server |

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use drive_chat::config::{self, Config};
use drive_chat::download::{self, DownloadOptions};
use drive_chat::ingest::{self, IngestOptions};
use drive_chat::progress::ProgressMode;
use drive_chat::search::{self, SearchFilter, SearchMode};
use drive_chat::{chat, embed_cmd, get, migrate, server, stats, status};

/// Mirror a Google Drive locally, index it, and chat with your documents.
#[derive(Parser)]
#[command(name = "dchat", version, about)]
struct Cli {
    /// Path to the configuration file (TOML). Built-in defaults are used
    /// when the file does not exist.
    #[arg(long, global = true, default_value = "./config/dchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Authorize access to Google Drive and cache the token.
    Auth,

    /// Print the remote folder tree.
    Tree,

    /// Mirror the drive into the local download directory.
    Download {
        #[command(flatten)]
        args: DownloadArgs,
    },

    /// Load the mirror into the document store.
    Ingest {
        #[command(flatten)]
        args: IngestArgs,
    },

    /// Download, then ingest.
    Sync {
        #[command(flatten)]
        download: DownloadArgs,

        /// Re-chunk every document even when its content is unchanged.
        #[arg(long)]
        full: bool,
    },

    /// Search stored documents.
    Search {
        query: String,

        #[arg(long, value_enum, default_value_t = SearchMode::Keyword)]
        mode: SearchMode,

        /// Only documents from this top-level folder.
        #[arg(long)]
        doc_type: Option<String>,

        /// Only documents modified on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print a stored document and its chunks.
    Get { id: String },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Document store summary.
    Stats,

    /// Check credentials, token, mirror and database.
    Status,

    /// Chat with your documents in the terminal.
    Chat,

    /// Serve the chat over HTTP.
    Serve,
}

#[derive(clap::Args)]
struct DownloadArgs {
    /// Show what would change without touching disk.
    #[arg(long)]
    dry_run: bool,

    /// Do not print the remote tree first.
    #[arg(long)]
    quiet_tree: bool,

    /// Progress on stderr; defaults to `human` on a terminal.
    #[arg(long, value_enum)]
    progress: Option<ProgressMode>,
}

#[derive(clap::Args)]
struct IngestArgs {
    /// Re-chunk every document even when its content is unchanged.
    #[arg(long)]
    full: bool,

    /// Count documents and chunks without writing.
    #[arg(long)]
    dry_run: bool,

    /// Maximum number of documents to process. Disables pruning.
    #[arg(long)]
    limit: Option<usize>,

    /// Only this top-level folder.
    #[arg(long)]
    doc_type: Option<String>,

    #[arg(long, value_enum)]
    progress: Option<ProgressMode>,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that are missing or have stale embeddings.
    Pending {
        #[arg(long)]
        limit: Option<usize>,

        /// Texts per provider call; overrides `embedding.batch_size`.
        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate all embeddings.
    Rebuild {
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

impl DownloadArgs {
    fn options(&self) -> DownloadOptions {
        DownloadOptions {
            dry_run: self.dry_run,
            quiet_tree: self.quiet_tree,
            progress: self.progress.unwrap_or_else(ProgressMode::default_for_tty),
        }
    }
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::info!("{} not found, using defaults", path.display());
        Ok(Config::minimal())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Auth => download::run_auth(&cfg).await?,
        Commands::Tree => download::run_tree(&cfg).await?,
        Commands::Download { args } => {
            download::run_download(&cfg, &args.options()).await?;
        }
        Commands::Ingest { args } => {
            let options = IngestOptions {
                full: args.full,
                dry_run: args.dry_run,
                limit: args.limit,
                doc_type: args.doc_type,
                progress: args.progress.unwrap_or_else(ProgressMode::default_for_tty),
            };
            ingest::run_ingest(&cfg, &options).await?;
        }
        Commands::Sync { download: args, full } => {
            let options = args.options();
            let report = download::run_download(&cfg, &options).await?;
            if report.is_some() {
                let ingest_options = IngestOptions {
                    full,
                    progress: options.progress,
                    ..IngestOptions::default()
                };
                ingest::run_ingest(&cfg, &ingest_options).await?;
            }
        }
        Commands::Search {
            query,
            mode,
            doc_type,
            since,
            limit,
        } => {
            let filter = SearchFilter { doc_type, since };
            search::run_search(&cfg, &query, mode, &filter, limit).await?;
        }
        Commands::Get { id } => get::run_get(&cfg, &id).await?,
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size, dry_run).await?;
            }
            EmbedAction::Rebuild { batch_size } => {
                embed_cmd::run_embed_rebuild(&cfg, batch_size).await?;
            }
        },
        Commands::Stats => stats::run_stats(&cfg).await?,
        Commands::Status => status::run_status(&cfg).await?,
        Commands::Chat => chat::run_chat(&cfg).await?,
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}
