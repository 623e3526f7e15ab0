//! CLI command definitions for fleet-scheduler.
//!
//! Processing itself needs an embedding application to supply the worker
//! factory and task pipeline, so the binary covers administration only:
//! inspecting and toggling stores, validating configuration files and
//! dumping the metric families.

use crate::config::SchedulerConfig;
use crate::metrics::{export_metrics, init_metrics};
use crate::registry::{JsonFileCatalog, Priority, Store, StoreRegistry};
use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Default directory holding the store catalog.
const DEFAULT_CATALOG_DIR: &str = "./fleet-catalog";

/// Multi-tenant store scheduler administration.
#[derive(Parser)]
#[command(name = "fleet-scheduler")]
#[command(about = "Administer the fleet store scheduler")]
#[command(version)]
#[command(
    long_about = "fleet-scheduler manages the store catalog and configuration used by the fleet scheduler.\n\nExample usage:\n  fleet-scheduler stores list --catalog-dir ./fleet-catalog\n  fleet-scheduler stores release store-42\n  fleet-scheduler config check ./scheduler.yaml"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Inspect and administer stores in the catalog.
    Stores(StoresArgs),

    /// Validate scheduler configuration.
    Config(ConfigArgs),

    /// Print the exported Prometheus metric families in text format.
    ///
    /// This is a schema dump: the command runs no scheduler, so every
    /// value reads zero.
    Metrics,
}

/// `fleet-scheduler stores` arguments.
#[derive(Parser, Debug)]
pub struct StoresArgs {
    /// Directory containing stores.json.
    #[arg(long, env = "FLEET_CATALOG_DIR", default_value = DEFAULT_CATALOG_DIR, global = true)]
    pub catalog_dir: PathBuf,

    #[command(subcommand)]
    pub command: StoresSubcommand,
}

/// Store administration subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum StoresSubcommand {
    /// List all stores with their scheduling state.
    List {
        /// Output JSON instead of a table.
        #[arg(short = 'j', long)]
        json: bool,
    },

    /// Register a new active store.
    Add {
        /// Store identifier.
        id: String,

        /// Display name (defaults to the id).
        #[arg(long)]
        name: Option<String>,

        /// Priority tier (high, medium, low).
        #[arg(short, long, default_value = "medium", value_parser = parse_priority)]
        priority: Priority,
    },

    /// Mark a store active.
    Enable { id: String },

    /// Mark a store inactive.
    Disable { id: String },

    /// Release a store from quarantine and reset its failure count.
    Release { id: String },
}

/// `fleet-scheduler config` arguments.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

/// Configuration subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Load and validate a YAML configuration file.
    Check {
        /// Path to the configuration file.
        file: PathBuf,

        /// Print the effective configuration as JSON.
        #[arg(short = 'j', long)]
        json: bool,
    },
}

/// One row of `stores list --json`.
#[derive(Debug, Serialize)]
struct StoreRow {
    id: String,
    name: String,
    priority: Priority,
    state: String,
    failure_count: u32,
    last_processed_at: Option<String>,
    quarantine_reason: Option<String>,
}

impl From<&Store> for StoreRow {
    fn from(store: &Store) -> Self {
        Self {
            id: store.id.clone(),
            name: store.name.clone(),
            priority: store.priority,
            state: store.state().to_string(),
            failure_count: store.metadata.failure_count,
            last_processed_at: store.metadata.last_processed_at.map(|t| t.to_rfc3339()),
            quarantine_reason: store.metadata.quarantine_reason.clone(),
        }
    }
}

fn parse_priority(value: &str) -> Result<Priority, String> {
    value.parse()
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    let cli = parse_cli();
    run_with_cli(cli).await
}

/// Run an already parsed command line.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Stores(args) => run_stores_command(args)?,
        Commands::Config(args) => run_config_command(args)?,
        Commands::Metrics => run_metrics_command()?,
    }
    Ok(())
}

fn open_registry(catalog_dir: &Path) -> anyhow::Result<StoreRegistry> {
    let catalog = Arc::new(JsonFileCatalog::new(catalog_dir));
    StoreRegistry::open(catalog)
        .with_context(|| format!("Failed to open store catalog at {}", catalog_dir.display()))
}

fn run_stores_command(args: StoresArgs) -> anyhow::Result<()> {
    let registry = open_registry(&args.catalog_dir)?;

    match args.command {
        StoresSubcommand::List { json } => {
            let stores = registry.list();
            let rows: Vec<StoreRow> = stores.iter().map(StoreRow::from).collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(());
            }

            if rows.is_empty() {
                println!("No stores registered.");
                return Ok(());
            }

            println!(
                "{:<24} {:<8} {:<12} {:>8}  {}",
                "ID", "PRIORITY", "STATE", "FAILURES", "LAST PROCESSED"
            );
            for row in &rows {
                println!(
                    "{:<24} {:<8} {:<12} {:>8}  {}",
                    row.id,
                    row.priority.to_string(),
                    row.state,
                    row.failure_count,
                    row.last_processed_at.as_deref().unwrap_or("never")
                );
            }
        }
        StoresSubcommand::Add { id, name, priority } => {
            let name = name.unwrap_or_else(|| id.clone());
            let id = registry
                .register(Store::new(id, name, priority))
                .context("Failed to register store")?;
            println!("✓ Registered store {} ({})", id, priority);
        }
        StoresSubcommand::Enable { id } => {
            registry
                .enable(&id)
                .with_context(|| format!("Failed to enable store '{}'", id))?;
            println!("✓ Store {} enabled", id);
        }
        StoresSubcommand::Disable { id } => {
            registry
                .disable(&id)
                .with_context(|| format!("Failed to disable store '{}'", id))?;
            println!("✓ Store {} disabled", id);
        }
        StoresSubcommand::Release { id } => {
            registry
                .release_from_quarantine(&id)
                .with_context(|| format!("Failed to release store '{}'", id))?;
            println!("✓ Store {} released from quarantine", id);
        }
    }

    Ok(())
}

fn run_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigSubcommand::Check { file, json } => {
            let config = SchedulerConfig::from_file(&file)
                .with_context(|| format!("Invalid configuration in {}", file.display()))?;
            info!(path = %file.display(), "Configuration is valid");

            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(());
            }

            println!("✓ {} is valid", file.display());
            println!("  Max concurrent stores: {}", config.max_concurrent_stores);
            println!("  Pool size:             {}", config.pool.size);
            println!("  Workers per store:     {}", config.resource_units_per_store);
            println!(
                "  API rate limit:        {} rpm (burst {})",
                config.api_rate_limit.requests_per_minute, config.api_rate_limit.burst_limit
            );
            println!("  API quota per store:   {}", config.api_quota_per_store());
            let ladder: Vec<String> = config
                .failure_isolation
                .retry_ladder()
                .iter()
                .map(|d| format!("{}s", d.as_secs()))
                .collect();
            println!("  Retry ladder:          [{}]", ladder.join(", "));
            println!(
                "  Quarantine threshold:  {}",
                config.failure_isolation.quarantine_threshold
            );
            if !config.processing_windows.is_empty() {
                let mut ids: Vec<&String> = config.processing_windows.keys().collect();
                ids.sort();
                println!("  Window overrides:      {}", ids.len());
                for id in ids {
                    let window = &config.processing_windows[id];
                    println!(
                        "    {}: {}-{} {}",
                        id, window.start, window.end, window.timezone
                    );
                }
            }
        }
    }

    Ok(())
}

fn run_metrics_command() -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;
    print!("{}", export_metrics());
    Ok(())
}
