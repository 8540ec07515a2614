//! ChainRange CLI: plan range imports and inspect RPC endpoint limits.
//!
//! # Commands
//! ```text
//! chainrange plan      --input <states.json> [--axis block|date]
//! chainrange limits    --chain <slug> [--url <rpc>]
//! chainrange head      --chain <slug> --url <rpc>
//! chainrange progress  --db <progress.db> [--entity <key>]
//! chainrange info
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Serialize;

use chainrange_core::{ProgressStore, RangeValue, TieBreak};
use chainrange_fetch::{FetchGuard, FileCache, MemoryLockService};
use chainrange_rpc::{CallThrottle, FindingsFile, HttpTransport, LimitationRegistry, LimitedRpcClient};
use chainrange_storage::SqliteProgressStore;

mod cmd_limits;
mod cmd_plan;
mod config;
mod logging;

use config::ChainRangeConfig;

#[derive(Parser)]
#[command(
    name = "chainrange",
    about = "Range planning for incremental, rate-limited chain imports",
    long_about = "
ChainRange CLI: plan which block or date ranges to query next, and inspect
the limitations measured for each RPC endpoint.

ENVIRONMENT VARIABLES:
  CHAINRANGE_LOG    tracing filter, e.g. `debug,chainrange_rpc=trace`
",
    version
)]
struct Cli {
    /// Path to a chainrange.json config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Axis {
    /// Block numbers
    Block,
    /// RFC 3339 timestamps
    Date,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan query batches for the entity states in a JSON file
    Plan {
        /// JSON array of `{ key, full_range, covered_ranges, to_retry }`
        #[arg(short, long)]
        input: PathBuf,
        #[arg(long, value_enum, default_value = "block")]
        axis: Axis,
        /// Contracts allowed per address query (1 disables address batching)
        #[arg(long)]
        max_addresses: Option<usize>,
        /// Widest range one query may span
        #[arg(long)]
        max_range_size: Option<u64>,
        /// Cap on JSON-RPC queries per entity and slice
        #[arg(long)]
        max_queries_per_product: Option<usize>,
        /// Plan the full ranges regardless of recorded progress
        #[arg(long)]
        ignore_import_state: bool,
        /// Prefer JSON-RPC batches when both strategies tie
        #[arg(long)]
        prefer_json_rpc: bool,
        /// Take the range size from this chain's endpoint limitations
        #[arg(long, requires = "url")]
        chain: Option<String>,
        #[arg(long, requires = "chain")]
        url: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show derived RPC limitations for a chain
    Limits {
        #[arg(long)]
        chain: String,
        /// Only this endpoint (default: every known endpoint of the chain)
        #[arg(long)]
        url: Option<String>,
        /// Findings file (overrides the config)
        #[arg(long)]
        findings: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fetch the latest block number, cached and rate limited
    Head {
        #[arg(long)]
        chain: String,
        #[arg(long)]
        url: String,
    },

    /// Show import progress stored in a SQLite database
    Progress {
        #[arg(long)]
        db: String,
        /// Only this entity (default: all)
        #[arg(long)]
        entity: Option<String>,
        #[arg(long, value_enum, default_value = "block")]
        axis: Axis,
    },

    /// Show ChainRange build info and effective defaults
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ChainRangeConfig::load(cli.config.as_deref())?;
    if cli.verbose {
        config.log.level = "debug".into();
    }
    logging::init_tracing(&config.log);

    match cli.command {
        Commands::Plan {
            input,
            axis,
            max_addresses,
            max_range_size,
            max_queries_per_product,
            ignore_import_state,
            prefer_json_rpc,
            chain,
            url,
            json,
        } => {
            let mut options = config.planner.clone();
            if let (Some(chain), Some(url)) = (&chain, &url) {
                let registry = LimitationRegistry::load(&FindingsFile::new(&config.findings), &config.safety_margins).await?;
                options = registry.get_limitations(chain, url).planner_options(options);
            }
            if let Some(n) = max_addresses {
                options = options.max_addresses_per_query(n);
            }
            if let Some(n) = max_range_size {
                options = options.max_range_size(n);
            }
            if let Some(n) = max_queries_per_product {
                options = options.max_queries_per_product(n);
            }
            if ignore_import_state {
                options = options.ignore_import_state(true);
            }
            if prefer_json_rpc {
                options = options.tie_break(TieBreak::PreferJsonRpc);
            }
            match axis {
                Axis::Block => cmd_plan::run::<u64>(&input, &options, json),
                Axis::Date => cmd_plan::run::<DateTime<Utc>>(&input, &options, json),
            }
        }

        Commands::Limits { chain, url, findings, json } => {
            let findings = FindingsFile::new(findings.unwrap_or_else(|| config.findings.clone()));
            cmd_limits::run(&findings, &config.safety_margins, &chain, url.as_deref(), json).await
        }

        Commands::Head { chain, url } => cmd_head(&config, &chain, &url).await,

        Commands::Progress { db, entity, axis } => match axis {
            Axis::Block => cmd_progress::<u64>(&db, entity.as_deref()).await,
            Axis::Date => cmd_progress::<DateTime<Utc>>(&db, entity.as_deref()).await,
        },

        Commands::Info => cmd_info(&config),
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_head(config: &ChainRangeConfig, chain: &str, url: &str) -> Result<()> {
    let registry = LimitationRegistry::load(&FindingsFile::new(&config.findings), &config.safety_margins).await?;
    let transport = HttpTransport::default_for(url)?;
    let client = LimitedRpcClient::new(
        chain,
        Arc::new(transport),
        registry.get_limitations(chain, url),
        Arc::new(CallThrottle::new()),
    );
    let guard = FetchGuard::new(
        Arc::new(FileCache::new(&config.cache_dir)),
        Arc::new(MemoryLockService::new()),
        config.fetch.clone(),
    );

    let key = format!("{chain}:head:{url}");
    let head: u64 = guard
        .fetch(&key, url, || client.block_number())
        .await
        .with_context(|| format!("fetch latest block of {chain} from {url}"))?;
    println!("{head}");
    Ok(())
}

async fn cmd_progress<T>(db: &str, entity: Option<&str>) -> Result<()>
where
    T: RangeValue + Serialize + DeserializeOwned,
{
    let store = SqliteProgressStore::<T>::open(db).await?;
    let keys = match entity {
        Some(key) => vec![key.to_string()],
        None => store.keys().await?,
    };

    for key in keys {
        let Some(progress) = store.load(&key).await? else {
            println!("{key}: no progress recorded");
            continue;
        };
        let status = if progress.is_complete() { "complete" } else { "in progress" };
        println!("{key} ({status})");
        println!("  full range: {}", progress.full_range);
        println!("  covered:    {} ({} ranges)", progress.covered_size(), progress.covered_ranges.len());
        println!("  pending:    {}", progress.pending_size());
        println!("  to retry:   {} ({} ranges)", progress.retry_size(), progress.to_retry.len());
    }
    Ok(())
}

fn cmd_info(config: &ChainRangeConfig) -> Result<()> {
    println!("ChainRange v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Effective configuration:");
    println!("{}", serde_json::to_string_pretty(config)?);
    println!();
    println!("Supported range axes: block numbers, UTC timestamps");
    println!("Progress storage:     SQLite (WAL), in-memory");
    println!("RPC transport:        HTTP JSON-RPC with true batching");
    Ok(())
}
