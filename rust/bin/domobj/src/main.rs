//! `domobj`: inspector for domain object stores.
//!
//! Usage:
//!   domobj [-c <config.toml>] [--data-dir <dir>] [--db <file>] [--mapping <path>] <command>
//!
//! Flags override values from the config file; unset paths resolve against
//! the data directory.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use domobj_core::EngineConfig;
use tracing::debug;

/// Domain object store inspector.
#[derive(Parser, Debug)]
#[command(name = "domobj", about = "Inspect mappings and stored domain objects")]
struct Cli {
    /// Path to an engine config file (TOML).
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Base directory for the database and mapping.
    #[arg(long = "data-dir", global = true)]
    data_dir: Option<PathBuf>,

    /// redb database file.
    #[arg(long = "db", global = true)]
    db: Option<PathBuf>,

    /// Mapping file or directory.
    #[arg(long = "mapping", global = true)]
    mapping: Option<PathBuf>,

    /// Output format: table or json.
    #[arg(long = "output", short = 'o', global = true, default_value = "table")]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the mapping and print its classes and relations.
    Check,

    /// Load one object by id (e.g. `Order|1|System.Int32`).
    Get {
        id: String,
    },

    /// List stored objects of a class.
    List {
        class: String,
        /// Only these columns.
        #[arg(long = "column")]
        columns: Vec<String>,
        /// Limit results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Resolve a relation property of an object.
    Related {
        id: String,
        property: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = engine_config(&cli)?;
    debug!("Engine config: {:?}", config);

    let json = match cli.output.as_str() {
        "json" => true,
        "table" => false,
        other => anyhow::bail!("Unknown output format: {}", other),
    };

    match cli.command {
        Commands::Check => commands::inspect::check(&config, json),
        Commands::Get { id } => commands::inspect::get(&config, &id, json),
        Commands::List { class, columns, limit } => {
            commands::inspect::list(&config, &class, &columns, limit, json)
        }
        Commands::Related { id, property } => commands::inspect::related(&config, &id, &property, json),
    }
}

/// Config file first, then command-line flags on top.
fn engine_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(db) = &cli.db {
        config.db_path = Some(db.clone());
    }
    if let Some(mapping) = &cli.mapping {
        config.mapping_path = Some(mapping.clone());
    }
    Ok(config)
}
