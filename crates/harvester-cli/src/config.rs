use clap::{Parser, Subcommand};
use harvester_core::config::CheckpointBackend;
use std::path::PathBuf;
use std::sync::LazyLock;

static VERSION_INFO: LazyLock<String> = LazyLock::new(|| {
    let version = env!("CARGO_PKG_VERSION");

    let commit = option_env!("VERGEN_GIT_SHA")
        .map(|s| s.chars().take(7).collect::<String>())
        .unwrap_or_else(|| "unknown".to_string());

    let built = option_env!("VERGEN_BUILD_DATE").unwrap_or("unknown"); // YYYY-MM-DD
    let target = option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown");
    let rustc = option_env!("VERGEN_RUSTC_SEMVER").unwrap_or("unknown");

    format!("{version}\ncommit: {commit}\nbuilt: {built}\ntarget: {target}\nrustc: {rustc}")
});

pub fn version_info() -> &'static str {
    &VERSION_INFO
}

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(
    author,
    version = version_info(),
    about = "Continuous harvesting engine for enumerable web sources"
)]
#[command(after_help = "Examples:
  harvester migrate
  harvester run
  harvester run --source uzum --max-cycles 1
  harvester status
  harvester reset --source uzum --stream products

Checkpoint backends:
  CHECKPOINT_BACKEND=postgres (default) - harvest_checkpoints / harvest_seen tables
  CHECKPOINT_BACKEND=redis              - Redis-compatible server at REDIS_URL
  CHECKPOINT_BACKEND=memory             - process memory, for dry runs")]
pub struct Config {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Where checkpoints and seen sets are stored
    #[arg(long, env = "CHECKPOINT_BACKEND", default_value = "postgres")]
    pub checkpoint_backend: CheckpointBackend,

    /// Redis connection URL (required when checkpoint_backend=redis)
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Identity recorded in checkpoints and position claims
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "HARVEST_LOG_JSON")]
    pub json_logs: bool,

    /// Custom path to sources.toml configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Harvest every enabled stream until interrupted
    #[command(after_help = "Examples:
  harvester run                          # All enabled streams, restarted by the watchdog
  harvester run --source uzum            # Streams of one source
  harvester run --max-cycles 1           # Stop each stream after one full cycle")]
    Run {
        /// Only run the streams of this source
        #[arg(short, long, value_name = "NAME")]
        source: Option<String>,

        /// Stop each stream after this many completed cycles
        #[arg(long, value_name = "N")]
        max_cycles: Option<u64>,
    },
    /// Show checkpoint health of every configured stream
    Status,
    /// List configured streams
    List,
    /// Delete checkpoints so streams restart from the beginning of their range
    Reset {
        /// Source whose checkpoints are deleted
        #[arg(short, long, value_name = "NAME")]
        source: String,

        /// Only reset this stream
        #[arg(long, value_name = "NAME")]
        stream: Option<String>,
    },
    /// Create the harvester tables if they do not exist
    Migrate,
}
