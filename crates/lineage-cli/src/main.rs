//! `lineage` — operator CLI for a lineage store.
//!
//! # Usage
//!
//! ```
//! lineage create study S-1 --payload '{"phase": 1}'
//! lineage select add <STUDY_UID> arms --payload '{"name": "placebo"}'
//! lineage --config ~/.config/lineage/lineage.toml audit <STUDY_UID>
//! ```

mod commands;
mod settings;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use commands::Command;
use lineage_core::AggregateRepository;
use lineage_store_sqlite::SqliteStore;
use settings::{Settings, expand_tilde};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "lineage", version, about = "Versioned aggregates with an audit trail")]
struct Cli {
  /// Path to a TOML config file (store_path, author, [repository]).
  #[arg(short, long, value_name = "FILE")]
  config: Option<PathBuf>,

  /// SQLite database file; overrides the config file.
  #[arg(long)]
  store: Option<PathBuf>,

  /// Author recorded on every change; overrides the config file.
  #[arg(long)]
  author: Option<String>,

  #[command(subcommand)]
  command: Command,
}

// ─── Entry point ──────────────────────────────────────────────────────────────

fn main() -> Result<()> {
  // Logs go to stderr so stdout stays a single JSON document.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  let mut settings = Settings::load(cli.config.as_deref())?;
  if let Some(store) = &cli.store {
    settings.store_path = expand_tilde(store);
  }
  if let Some(author) = cli.author {
    settings.author = author;
  }

  let store = SqliteStore::open(&settings.store_path)
    .with_context(|| format!("failed to open store at {:?}", settings.store_path))?;
  let repo = AggregateRepository::new(store).with_config(settings.repository);

  let output = commands::run(&repo, &settings.author, cli.command)?;
  println!("{}", serde_json::to_string_pretty(&output)?);

  Ok(())
}
