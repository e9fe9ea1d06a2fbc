//! # docflow CLI
//!
//! Every command maps to one pipeline operation.
//!
//! ## Usage
//!
//! ```bash
//! docflow --config ./config/docflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docflow init` | Create the SQLite registry and its schema |
//! | `docflow config template` | Print a default pipeline configuration |
//! | `docflow config load <name> <file>` | Store a pipeline configuration |
//! | `docflow config show [<name>]` | Print a stored configuration |
//! | `docflow provision` | Create missing storage containers |
//! | `docflow scan` | Register new objects from the raw container |
//! | `docflow stage <stage>` | Run one processing stage |
//! | `docflow run` | Scan, then run every stage in order |
//! | `docflow status` | Per-state counts and recent failures |
//! | `docflow get <id>` | Print one document record |

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use docflow::config::{self, Config};
use docflow::configuration::{ConfigurationStore, PipelineConfig};
use docflow::ingest::ScanReport;
use docflow::pipeline::{Pipeline, StageKind};
use docflow::provision::ProvisionReport;
use docflow::stages::StageReport;
use docflow::{db, logging, migrate};

/// docflow: register raw documents from object storage once and track
/// them through text extraction, question generation and evaluation.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docflow.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "docflow", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docflow.toml")]
    config: PathBuf,

    /// Debug-level logging for docflow modules.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the registry database.
    ///
    /// Creates the SQLite file and the `configuration` and `documents`
    /// tables. Safe to run repeatedly.
    Init,

    /// Manage stored pipeline configurations.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Create the storage containers of the pipeline configuration that
    /// do not exist yet.
    Provision,

    /// Register every object of the raw container that is not yet known.
    Scan {
        /// Count what would be registered without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run one processing stage over the documents waiting for it.
    Stage {
        /// `extract-text`, `ai-process`, or `evaluate`.
        stage: StageKind,

        /// Maximum number of documents to process.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Scan, then run every stage in order.
    Run {
        /// Maximum number of documents per stage.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Show per-state document counts and recent failures.
    Status,

    /// Print a document record as JSON.
    Get {
        /// Document UUID.
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the default pipeline configuration as JSON.
    Template {
        #[arg(long, default_value = "ai_pipeline")]
        name: String,
    },
    /// Validate a JSON file and store it under `name`, replacing any
    /// previous configuration of that name.
    Load { name: String, file: PathBuf },
    /// Print a stored configuration. Defaults to `pipeline.config_name`.
    Show { name: Option<String> },
    /// List stored configuration names.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    // Commands that don't require config
    if let Commands::Config {
        action: ConfigAction::Template { name },
    } = &cli.command
    {
        let template = PipelineConfig::template(name);
        println!("{}", serde_json::to_string_pretty(&template)?);
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Registry initialized at {}", cfg.db.path.display());
        }
        Commands::Config { action } => run_config(&cfg, action).await?,
        Commands::Provision => {
            let pipeline = Pipeline::open(&cfg).await?;
            let report = pipeline.provision().await;
            pipeline.close().await;
            print_provision(&report?);
        }
        Commands::Scan { dry_run } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let report = pipeline.scan(dry_run).await;
            pipeline.close().await;
            print_scan(&report?);
        }
        Commands::Stage { stage, limit } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let report = pipeline.run_stage(stage, limit).await;
            pipeline.close().await;
            print_stage(&report?);
        }
        Commands::Run { limit } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let report = pipeline.run_all(limit).await;
            pipeline.close().await;
            let report = report?;
            print_scan(&report.scan);
            for stage in &report.stages {
                print_stage(stage);
            }
        }
        Commands::Status => {
            let pipeline = Pipeline::open(&cfg).await?;
            let report = pipeline.status().await;
            pipeline.close().await;
            print!("{}", report?.render());
        }
        Commands::Get { id } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let doc = pipeline.registry().get(&id).await;
            pipeline.close().await;
            println!("{}", serde_json::to_string_pretty(&doc?)?);
        }
    }

    Ok(())
}

async fn run_config(cfg: &Config, action: ConfigAction) -> anyhow::Result<()> {
    let pool = db::connect(&cfg.db).await?;
    migrate::run_migrations(&pool).await?;
    let store = ConfigurationStore::new(pool.clone());

    let result = match action {
        ConfigAction::Template { .. } => Ok(()),
        ConfigAction::Load { name, file } => load_config_file(&store, &name, &file).await,
        ConfigAction::Show { name } => {
            let name = name.unwrap_or_else(|| cfg.pipeline.config_name.clone());
            match store.read(&name).await {
                Ok(config) => {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
        ConfigAction::List => match store.list().await {
            Ok(names) => {
                for name in names {
                    println!("{}", name);
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
    };

    pool.close().await;
    result
}

async fn load_config_file(store: &ConfigurationStore, name: &str, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read pipeline configuration: {}", file.display()))?;
    let mut config: PipelineConfig =
        serde_json::from_str(&content).with_context(|| "Failed to parse pipeline configuration")?;
    config.name = name.to_string();

    store.write(name, &config).await?;

    println!("config {}", name);
    println!("  containers: {}", config.containers.len());
    println!("  filetypes: {}", config.filetypes.len());
    println!("ok");
    Ok(())
}

fn print_provision(report: &ProvisionReport) {
    println!("provision");
    println!("  existing: {}", report.existing.len());
    println!("  created: {}", report.created.len());
    for name in &report.created {
        println!("    + {}", name);
    }
    println!("  failed: {}", report.failed.len());
    for failure in &report.failed {
        println!("    ! {} ({}): {}", failure.container, failure.tier, failure.message);
    }
    println!("ok");
}

fn print_scan(report: &ScanReport) {
    if report.dry_run {
        println!("scan {} (dry-run)", report.container);
    } else {
        println!("scan {}", report.container);
    }
    println!("  listed: {}", report.listed);
    println!("  registered: {}", report.registered);
    println!("  skipped: {}", report.skipped);
    println!("  failed: {}", report.failed);
    println!("ok");
}

fn print_stage(report: &StageReport) {
    println!("stage {}", report.stage);
    println!("  selected: {}", report.selected);
    println!("  advanced: {}", report.advanced);
    println!("  failed: {}", report.failed);
    println!("  skipped: {}", report.skipped);
    println!("ok");
}
