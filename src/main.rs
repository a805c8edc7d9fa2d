//! # mdkb CLI (`kb`)
//!
//! Commands for building and querying a local Markdown archive index.
//!
//! ```bash
//! kb --config ./kb.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite index database and schema |
//! | `kb index` | Scan the archive tree and sync the index |
//! | `kb search "<query>"` | Search indexed passages |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mdkb::config::load_config;
use mdkb::embedding::create_provider;
use mdkb::indexer::{index_archive, IndexOptions};
use mdkb::search::{search_archive, SearchOptions};
use mdkb::{db, store};

/// mdkb — a local-first Markdown archive with hybrid retrieval.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "mdkb — a local-first Markdown archive with hybrid (keyword + semantic) retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Missing file uses defaults.
    #[arg(long, global = true, default_value = "./kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index database schema. Idempotent.
    Init,

    /// Scan the archive tree and bring the index in sync.
    ///
    /// Unchanged files (same content hash, size, and mtime) are skipped;
    /// changed files are re-chunked and replaced transactionally; files
    /// that disappeared are deleted from the index.
    Index {
        /// Discard the index database and re-derive it from the tree.
        #[arg(long)]
        rebuild: bool,

        /// Request embeddings for updated chunks. Requires an embedding
        /// backend in config; backend failures skip embedding but never
        /// abort indexing.
        #[arg(long)]
        embed: bool,

        /// Restrict the run to these archive-relative paths.
        #[arg(long = "only")]
        only: Vec<String>,
    },

    /// Search indexed passages.
    Search {
        /// Query text.
        query: String,

        /// Number of results to return.
        #[arg(long, default_value_t = 8)]
        top_k: usize,

        /// Vector similarity only (requires an embedding backend).
        #[arg(long)]
        semantic: bool,

        /// Fuse keyword and vector scores (0.6 / 0.4).
        #[arg(long)]
        hybrid: bool,

        /// Emit results as a JSON array.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.db.path).await?;
            store::init_schema(&pool).await?;
            pool.close().await;
            println!("initialized {}", config.db.path.display());
        }

        Commands::Index {
            rebuild,
            embed,
            only,
        } => {
            let provider = create_provider(&config.embedding)?;
            let opts = IndexOptions {
                rebuild,
                embed,
                only_paths: if only.is_empty() { None } else { Some(only) },
            };
            let stats = index_archive(&config, provider.as_ref(), &opts).await?;
            println!("index {}", config.archive.root.display());
            println!("  deleted docs:    {}", stats.deleted_docs);
            println!("  updated docs:    {}", stats.updated_docs);
            println!("  updated chunks:  {}", stats.updated_chunks);
            println!("  embedded chunks: {}", stats.embedded_chunks);
            println!("  unchanged docs:  {}", stats.unchanged_docs);
            println!("ok");
        }

        Commands::Search {
            query,
            top_k,
            semantic,
            hybrid,
            json,
        } => {
            let provider = create_provider(&config.embedding)?;
            let opts = SearchOptions {
                top_k,
                semantic,
                hybrid,
            };
            let results = search_archive(&config, provider.as_ref(), &query, &opts).await?;

            if json {
                let values: Vec<serde_json::Value> =
                    results.iter().map(|r| r.to_value()).collect();
                println!("{}", serde_json::to_string_pretty(&values)?);
            } else if results.is_empty() {
                println!("No results.");
            } else {
                for (i, result) in results.iter().enumerate() {
                    let title = if result.title.is_empty() {
                        "(untitled)"
                    } else {
                        &result.title
                    };
                    println!(
                        "{}. [{:.3}] ({}) {} / {}",
                        i + 1,
                        result.score,
                        result.source.as_str(),
                        result.rel_path,
                        title
                    );
                    if !result.heading_path.is_empty() {
                        println!("    heading: {}", result.heading_path);
                    }
                    println!(
                        "    lines: {}-{}",
                        result.start_line, result.end_line
                    );
                    let excerpt: String = result.text.replace('\n', " ");
                    let excerpt: String = excerpt.chars().take(160).collect();
                    println!("    excerpt: \"{}\"", excerpt.trim());
                    println!();
                }
            }
        }
    }

    Ok(())
}
