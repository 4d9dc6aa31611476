//! Shoal: normalized record cache driver
//!
//! Main binary with subcommands:
//! - `query`: Evaluate a query against a JSON dataset
//! - `count`: Count dataset records matching a query
//! - `paginate`: Page through a dataset and replay pages from the ledger
//! - `replay`: Feed live events through a store, optionally debounced

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "Normalized record cache driver", long_about = None)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct StoreArgs {
    /// Store config file (JSON, camelCase keys)
    #[arg(long, global = true, env = "SHOAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Permanent id field, overriding the config
    #[arg(long, global = true, env = "SHOAL_ID_FIELD")]
    pub id_field: Option<String>,

    /// Temp id field, overriding the config
    #[arg(long, global = true, env = "SHOAL_TEMP_ID_FIELD")]
    pub temp_id_field: Option<String>,

    /// Extra operators to allow in local queries (e.g. `$regex`)
    #[arg(long = "allow", global = true, value_delimiter = ',')]
    pub whitelist: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a query against a JSON array of records
    Query {
        /// Dataset file
        #[arg(long)]
        data: PathBuf,

        /// Query object, e.g. '{"name": {"$ilike": "%mo%"}, "$sort": {"name": 1}}'
        #[arg(long, default_value = "{}")]
        query: String,
    },

    /// Count dataset records matching a query (paging directives ignored)
    Count {
        /// Dataset file
        #[arg(long)]
        data: PathBuf,

        /// Query object
        #[arg(long, default_value = "{}")]
        query: String,
    },

    /// Page through a dataset served by an in-memory paginated service
    Paginate {
        /// Dataset file
        #[arg(long)]
        data: PathBuf,

        /// Query object (paging directives are set per page)
        #[arg(long, default_value = "{}")]
        query: String,

        /// Records per page
        #[arg(long, default_value = "3")]
        page_size: usize,

        /// Largest page the service will return
        #[arg(long, default_value = "50")]
        max_page_size: usize,
    },

    /// Apply a JSON array of `{"kind", "record"}` events to a store
    Replay {
        /// Events file
        #[arg(long)]
        events: PathBuf,

        /// Debounce window in milliseconds, overriding the config
        #[arg(long)]
        debounce_ms: Option<u64>,

        /// Delay between events in milliseconds
        #[arg(long, default_value = "0")]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "shoal=info,shoal_store=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(&cli.store).await?;

    let output = match cli.command {
        Commands::Query { data, query } => commands::run_query(config, &data, &query).await?,
        Commands::Count { data, query } => commands::run_count(config, &data, &query).await?,
        Commands::Paginate {
            data,
            query,
            page_size,
            max_page_size,
        } => commands::run_paginate(config, &data, &query, page_size, max_page_size).await?,
        Commands::Replay {
            events,
            debounce_ms,
            interval_ms,
        } => commands::run_replay(config, &events, debounce_ms, interval_ms).await?,
    };

    let rendered =
        serde_json::to_string_pretty(&output).map_err(|e| miette::miette!("{}", e))?;
    println!("{rendered}");
    Ok(())
}
