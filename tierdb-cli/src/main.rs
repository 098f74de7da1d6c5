//! # TierDB CLI
//!
//! Run with: `cargo run --bin tierdb -- --home ./db create table:t "key_format=S,value_format=S"`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tierdb_storage::Connection;
use tierdb_verify::{OracleConfig, WorkloadConfig};

#[derive(Parser)]
#[command(name = "tierdb")]
#[command(about = "TierDB - schema objects and tiered storage over a local database home")]
struct Cli {
    /// Database home directory
    #[arg(long, default_value = "./data")]
    home: PathBuf,

    /// Connection configuration string, e.g. `tiered_storage=(bucket=./bucket)`
    #[arg(long, default_value = "")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (or import) a schema object
    Create {
        uri: String,
        #[arg(default_value = "")]
        config: String,
    },
    /// Switch modified tiered trees and copy sealed generations to the bucket
    FlushTier {
        #[arg(default_value = "")]
        config: String,
    },
    /// List metadata entries
    List {
        /// Only entries whose URI starts with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Write the metadata to an export file usable by `import.metadata_file`
    Export { path: PathBuf },
    /// Run a randomized snapshot-isolation workload against the reference store
    Verify {
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = 1000)]
        transactions: usize,
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Periodically roll back to stable and replay what it kept
        #[arg(long)]
        rollback_to_stable: bool,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    if let Commands::Verify {
        seed,
        transactions,
        workers,
        rollback_to_stable,
    } = cli.command
    {
        return verify(seed, transactions, workers, rollback_to_stable);
    }

    let conn = Connection::open(&cli.home, &cli.config)
        .with_context(|| format!("opening {}", cli.home.display()))?;

    match &cli.command {
        Commands::Create { uri, config } => {
            let mut session = conn.open_session();
            session.create(uri, config).with_context(|| format!("creating {}", uri))?;
            println!("{}", conn.metadata_search(uri)?);
        }
        Commands::FlushTier { config } => {
            let mut session = conn.open_session();
            session.flush_tier(config).context("flush_tier")?;
            let stats = conn.stats();
            info!(
                "flush_tier: {} work units queued, {} freed",
                stats.work_queued, stats.work_freed
            );
        }
        Commands::List { prefix } => {
            for (uri, value) in conn.metadata_list() {
                if prefix.as_deref().map_or(true, |p| uri.starts_with(p)) {
                    println!("{}\n    {}", uri, value);
                }
            }
        }
        Commands::Export { path } => {
            let entries = conn.export_metadata(path)?;
            println!("{} entries", entries);
        }
        Commands::Verify { .. } => {}
    }

    conn.close()?;
    Ok(())
}

fn verify(seed: u64, transactions: usize, workers: usize, rollback_to_stable: bool) -> Result<()> {
    let config = WorkloadConfig {
        seed,
        transactions,
        workers,
        oracle: OracleConfig {
            rollback_to_stable,
            ..Default::default()
        },
        rollback_every: if rollback_to_stable { 100 } else { 0 },
        ..Default::default()
    };
    let report = tierdb_verify::run(&config).context("snapshot-isolation workload")?;
    println!(
        "committed {} rolled back {} ({} conflicts), {} operations, {} replayed, {} replayed after {} rollback_to_stable runs",
        report.committed,
        report.rolled_back,
        report.conflicts,
        report.operations,
        report.replayed,
        report.rts_replayed,
        report.rts_runs
    );
    Ok(())
}
