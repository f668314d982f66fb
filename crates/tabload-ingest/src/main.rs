//! tabload - streaming partition loader

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tabload_common::logging::{init_logging, LogConfig, LogLevel};
use tabload_ingest::coordinator::IngestCoordinator;
use tabload_ingest::discovery::{discover_local_files, register_new_files};
use tabload_ingest::ledger::{JobLedger, MemoryLedger, PgLedger};
use tabload_ingest::notify::{self, Notifier};
use tabload_ingest::schema::PartitionRegistry;
use tabload_ingest::store::{MemoryStore, PgStore};
use tabload_ingest::{FileBounds, IngestConfig, IngestRunner};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tabload")]
#[command(author, version, about = "Load tab-delimited partition extracts with staged cutover")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Partition catalog (JSON)
    #[arg(long, global = true, env = "TABLOAD_CATALOG")]
    catalog: Option<PathBuf>,

    /// Directory holding the source files
    #[arg(long, global = true, env = "LOCAL_DIRECTORY")]
    dir: Option<PathBuf>,

    /// Use in-memory storage and ledger instead of Postgres
    #[arg(long, global = true)]
    dry_run: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register new local files in the job ledger
    Discover,

    /// Load registered files
    Load(LoadArgs),

    /// Promote a partition's staging table to production
    Promote {
        /// Partition key, e.g. CA
        partition: String,
    },

    /// List job ledger entries
    Status,
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// First file index to load (inclusive)
    #[arg(long)]
    start_file: Option<usize>,

    /// Last file index to load (inclusive)
    #[arg(long)]
    end_file: Option<usize>,

    /// Skip this many rows at the start of each file
    #[arg(long)]
    resume: Option<u64>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Concurrent batch writes per file
    #[arg(long)]
    max_concurrent_writes: Option<usize>,

    /// Files loaded at the same time
    #[arg(long)]
    job_concurrency: Option<usize>,

    /// Derive a geohash from the residence coordinates
    #[arg(long)]
    geohash: bool,

    /// Empty each staging table before loading
    #[arg(long)]
    truncate_staging: bool,

    /// Load only this file name
    #[arg(long)]
    file: Option<String>,
}

impl LoadArgs {
    fn apply(&self, config: &mut IngestConfig) -> Result<()> {
        if let Some(v) = self.start_file {
            config.start_file = v;
        }
        if let Some(v) = self.end_file {
            config.end_file = Some(v);
        }
        if let Some(v) = self.resume {
            config.resume = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.max_concurrent_writes {
            config.max_concurrent_writes = v;
        }
        if let Some(v) = self.job_concurrency {
            config.job_concurrency = v;
        }
        config.geohash |= self.geohash;
        config.truncate_staging |= self.truncate_staging;
        config.validate()?;
        Ok(())
    }
}

enum Store {
    Postgres(Arc<PgStore>),
    Memory(Arc<MemoryStore>),
}

struct Backends {
    ledger: Arc<dyn JobLedger>,
    store: Store,
}

impl Backends {
    async fn connect(config: &IngestConfig, dry_run: bool) -> Result<Self> {
        if dry_run {
            info!("Dry run: using in-memory storage");
            return Ok(Self {
                ledger: Arc::new(MemoryLedger::new()),
                store: Store::Memory(Arc::new(MemoryStore::new())),
            });
        }

        let store = PgStore::connect(&config.database_url, config.max_connections)
            .await
            .context("Failed to connect to database")?;
        let ledger = PgLedger::new(store.pool().clone());
        ledger.migrate().await.context("Failed to run migrations")?;

        Ok(Self {
            ledger: Arc::new(ledger),
            store: Store::Postgres(Arc::new(store)),
        })
    }

    fn coordinator(
        &self,
        config: &IngestConfig,
        registry: Arc<PartitionRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> IngestCoordinator {
        let options = config.coordinator_options();
        match &self.store {
            Store::Postgres(store) => {
                IngestCoordinator::new(registry, self.ledger.clone(), store.clone(), notifier, options)
            }
            Store::Memory(store) => {
                IngestCoordinator::new(registry, self.ledger.clone(), store.clone(), notifier, options)
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::at_level(log_level).merge_env()?;
    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env().context("Invalid configuration")?;
    if let Some(ref catalog) = cli.catalog {
        config.catalog_path = catalog.clone();
    }
    if let Some(ref dir) = cli.dir {
        config.local_directory = dir.clone();
    }
    if let Command::Load(ref args) = cli.command {
        args.apply(&mut config)?;
    }

    let registry = Arc::new(
        PartitionRegistry::load(&config.catalog_path)
            .with_context(|| format!("Failed to load catalog {}", config.catalog_path.display()))?,
    );
    let notifier = notify::from_url(config.slack_webhook_url.as_deref())?;
    let backends = Backends::connect(&config, cli.dry_run).await?;

    match cli.command {
        Command::Discover => {
            let report = register_new_files(
                backends.ledger.as_ref(),
                &registry,
                &config.local_directory,
                notifier.as_ref(),
            )
            .await?;
            info!(
                registered = report.registered.len(),
                known = report.already_known.len(),
                unrouted = report.unrouted.len(),
                "Discovery complete"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Load(args) => {
            if cli.dry_run {
                register_new_files(
                    backends.ledger.as_ref(),
                    &registry,
                    &config.local_directory,
                    notifier.as_ref(),
                )
                .await?;
            }

            let mut files = discover_local_files(&config.local_directory).await?;
            if let Some(ref name) = args.file {
                files.retain(|f| &f.filename == name);
                if files.is_empty() {
                    anyhow::bail!("{} not found in {}", name, config.local_directory.display());
                }
            }

            let coordinator = Arc::new(backends.coordinator(&config, registry, notifier));
            let bounds =
                FileBounds::for_run(config.start_file, config.end_file, args.file.is_some());
            let runner = IngestRunner::new(coordinator, bounds, config.job_concurrency);
            let summaries = runner.run(&files).await;

            println!("{}", serde_json::to_string_pretty(&summaries)?);

            let failed = summaries.iter().filter(|s| s.state.is_failed()).count();
            if failed > 0 {
                warn!(failed, "Some jobs failed");
                return Ok(ExitCode::FAILURE);
            }
        }

        Command::Promote { partition } => {
            let coordinator = backends.coordinator(&config, registry, notifier);
            let report = coordinator.promote(&partition).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Status => {
            let jobs = backends.ledger.list().await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
