use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use dotenvy::dotenv;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use harvester_cli::{Command, Config};
use harvester_client::SourceRegistry;
use harvester_core::traits::{CheckpointStore, StreamLauncher};
use harvester_core::{
    AppError, Checkpoint, CheckpointBackend, CircuitBreaker, ControllerSummary, CycleController,
    DbConfig, FetchPool, SourceConfig, SourcesConfig, StreamHealth, StreamKey, Supervisor,
    TracingReporter, Watchdog, WatchdogConfig, load_sources_config, stream_health,
};
use harvester_db::{CheckpointStoreEnum, EntityRepository, ensure_schema};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = Config::parse();
    init_tracing(config.json_logs);

    match &config.command {
        Command::Run { source, max_cycles } => {
            let pool = connect(&config).await?;
            ensure_schema(&pool)
                .await
                .context("Failed to prepare database schema")?;
            let checkpoints = checkpoint_store(&config, &pool).await?;
            let sources = load_sources(config.config.clone())?;
            run(
                &config,
                pool,
                checkpoints,
                &sources,
                source.as_deref(),
                *max_cycles,
            )
            .await?;
        }
        Command::Status => {
            let pool = connect(&config).await?;
            let checkpoints = checkpoint_store(&config, &pool).await?;
            let sources = load_sources(config.config.clone())?;
            show_status(&checkpoints, &sources).await?;
        }
        Command::List => {
            let sources = load_sources(config.config.clone())?;
            list_sources(&sources);
        }
        Command::Reset { source, stream } => {
            let pool = connect(&config).await?;
            let checkpoints = checkpoint_store(&config, &pool).await?;
            reset(&checkpoints, source, stream.as_deref()).await?;
        }
        Command::Migrate => {
            let pool = connect(&config).await?;
            ensure_schema(&pool)
                .await
                .context("Failed to create harvester tables")?;
            info!("Schema is up to date");
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set. Use --database-url or .env"))?;

    info!("Connecting to database...");
    let db_config = DbConfig::from_env();
    PgPoolOptions::new()
        .max_connections(db_config.max_connections)
        .connect(url)
        .await
        .context("Failed to connect to database")
}

async fn checkpoint_store(config: &Config, pool: &PgPool) -> anyhow::Result<CheckpointStoreEnum> {
    let store =
        CheckpointStoreEnum::connect(config.checkpoint_backend, pool, config.redis_url.as_deref())
            .await
            .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    if store.backend() == CheckpointBackend::Memory {
        warn!("Using the memory checkpoint backend: progress is lost on exit");
    }
    Ok(store)
}

fn load_sources(path: Option<PathBuf>) -> anyhow::Result<SourcesConfig> {
    let sources = load_sources_config(path)
        .map_err(|e| anyhow::anyhow!(e.user_message()))?
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No configuration file found. Create ~/.config/harvester/sources.toml or use --config"
            )
        })?;

    Ok(SourcesConfig {
        sources: sources
            .sources
            .into_iter()
            .map(SourceConfig::with_env_overrides)
            .collect(),
    })
}

// =============================================================================
// run
// =============================================================================

/// Builds one controller per stream from the registry.
#[derive(Clone)]
struct HarvestLauncher {
    registry: Arc<SourceRegistry>,
    store: EntityRepository,
    checkpoints: CheckpointStoreEnum,
    worker_id: String,
    max_cycles: Option<u64>,
}

impl StreamLauncher for HarvestLauncher {
    fn launch(
        &self,
        key: &StreamKey,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<ControllerSummary, AppError>>, AppError> {
        let source = self
            .registry
            .get(key)
            .ok_or_else(|| AppError::ConfigError(format!("Unknown stream {}", key)))?;

        let breaker = CircuitBreaker::new(key.to_string(), source.config.breaker_config());
        let pool = FetchPool::new(source.client.clone(), source.config.fetch_config(), breaker);

        let controller_config = source
            .config
            .controller_config()
            .with_max_cycles(self.max_cycles)
            .with_worker_id(self.worker_id.clone());

        let controller = CycleController::new(
            key.clone(),
            pool,
            source.parser.clone(),
            self.store.clone(),
            self.checkpoints.clone(),
            controller_config,
        );
        Ok(tokio::spawn(async move {
            controller.run(cancel, &TracingReporter).await
        }))
    }
}

async fn run(
    config: &Config,
    pool: PgPool,
    checkpoints: CheckpointStoreEnum,
    sources: &SourcesConfig,
    source_name: Option<&str>,
    max_cycles: Option<u64>,
) -> anyhow::Result<()> {
    let selected: Vec<&SourceConfig> = match source_name {
        Some(name) => {
            let found = sources.find_by_name(name);
            if found.is_empty() {
                anyhow::bail!("Source '{}' not found in configuration", name);
            }
            found
        }
        None => sources.enabled_sources(),
    };
    if selected.is_empty() {
        info!("No enabled streams found in configuration.");
        return Ok(());
    }

    let registry = Arc::new(
        SourceRegistry::from_sources(selected.iter().copied())
            .map_err(|e| anyhow::anyhow!(e.user_message()))?,
    );
    let launcher = HarvestLauncher {
        registry: registry.clone(),
        store: EntityRepository::new(pool),
        checkpoints: checkpoints.clone(),
        worker_id: worker_id(config.worker_id.as_deref()),
        max_cycles,
    };

    let root = CancellationToken::new();
    let watchdog_config = WatchdogConfig::from_env();
    let supervisor = Arc::new(
        Supervisor::new(launcher, root.clone())
            .with_shutdown_grace(watchdog_config.shutdown_grace),
    );

    let mut watchdog = Watchdog::new(checkpoints.clone(), supervisor.clone(), watchdog_config);
    for key in registry.keys() {
        if let Some(source) = registry.get(&key) {
            watchdog = watchdog.watch_with_threshold(key.clone(), source.config.staleness_threshold());
        }
        supervisor
            .ensure_started(&key)
            .with_context(|| format!("Failed to start stream {}", key))?;
        info!(stream = %key, "Stream started");
    }

    let shutdown = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, flushing staged entities...");
            shutdown.cancel();
        }
    });

    if max_cycles.is_some() {
        // Bounded runs end when every controller has finished its cycles.
        while !root.is_cancelled() && !supervisor.running().is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = root.cancelled() => {}
            }
        }
    } else {
        watchdog.run(root.clone(), &TracingReporter).await;
    }

    let results = supervisor.shutdown().await;
    print_run_summary(&results);

    if results.iter().any(|(_, result)| result.is_err()) {
        anyhow::bail!("One or more streams ended with an error");
    }
    Ok(())
}

/// Restarted controllers keep the process identity, so they can take over
/// the claims of the controller they replace.
fn worker_id(configured: Option<&str>) -> String {
    match configured {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => format!("harvester-{}", &Uuid::new_v4().simple().to_string()[..8]),
    }
}

fn print_run_summary(results: &[(StreamKey, Result<ControllerSummary, AppError>)]) {
    info!("");
    info!("═══════════════════════════════════════════════════════");
    info!("HARVEST STOPPED");
    info!("═══════════════════════════════════════════════════════");
    for (key, result) in results {
        match result {
            Ok(summary) => {
                let position = summary
                    .checkpoint
                    .as_ref()
                    .map(|c| c.position.to_string())
                    .unwrap_or_else(|| "-".to_string());
                info!(
                    "  {:<30} cycles: {:>4}  fetched: {:>9}  written: {:>9}  position: {}",
                    key.to_string(),
                    summary.cycles_completed,
                    summary.positions_fetched,
                    summary.entities_written,
                    position
                );
            }
            Err(e) => error!("  {:<30} failed: {}", key.to_string(), e.user_message()),
        }
    }
    info!("═══════════════════════════════════════════════════════");
}

// =============================================================================
// status / list / reset
// =============================================================================

async fn show_status(
    checkpoints: &CheckpointStoreEnum,
    sources: &SourcesConfig,
) -> anyhow::Result<()> {
    let stored = checkpoints
        .list()
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    let watchdog = WatchdogConfig::from_env();
    let now = Utc::now();

    println!("\nStream status ({} backend)\n", checkpoints.backend());
    for source in &sources.sources {
        let key = source.key();
        let checkpoint = stored.iter().find(|c| c.key() == key);
        let health = stream_health(checkpoint, now, source.staleness_threshold());
        print_stream_status(&key, source, checkpoint, &health, &watchdog);
    }

    let unconfigured: Vec<&Checkpoint> = stored
        .iter()
        .filter(|c| sources.find(&c.key()).is_none())
        .collect();
    if !unconfigured.is_empty() {
        println!("Checkpoints without a configured stream:");
        for checkpoint in unconfigured {
            println!("  {} at position {}", checkpoint.key(), checkpoint.position);
        }
        println!();
    }

    Ok(())
}

fn print_stream_status(
    key: &StreamKey,
    source: &SourceConfig,
    checkpoint: Option<&Checkpoint>,
    health: &StreamHealth,
    watchdog: &WatchdogConfig,
) {
    let enabled = if source.enabled { "" } else { " (disabled)" };
    println!("  {}{}", key, enabled);
    println!("    Health:        {}", health.label());

    if let Some(checkpoint) = checkpoint {
        let range = match source.range_max {
            Some(max) => format!("{}..={}", source.range_min, max),
            None => format!("{}.. (paginated)", source.range_min),
        };
        println!("    Position:      {} in {}", checkpoint.position, range);
        println!("    Cycle:         {}", checkpoint.cycle_count);
        println!("    Processed:     {}", checkpoint.total_processed);
        println!("    Rate:          {:.1} positions/s", checkpoint.observed_rate);
        if let Some(age) = health.age() {
            println!("    Last update:   {} ago", format_age(age));
        }
        if let Some(worker_id) = &checkpoint.worker_id {
            println!("    Worker:        {}", worker_id);
        }
    }

    if health.is_stale() {
        println!(
            "    Checkpoint older than {}; watchdog will restart within {} seconds",
            format_age(source.staleness_threshold()),
            watchdog.poll_interval.as_secs()
        );
    }
    println!();
}

fn list_sources(sources: &SourcesConfig) {
    println!("\nConfigured streams ({})\n", sources.sources.len());
    for source in &sources.sources {
        let range = match source.range_max {
            Some(max) => format!("{}..={}", source.range_min, max),
            None => format!("{}.. (paginated)", source.range_min),
        };
        let state = if source.enabled { "enabled" } else { "disabled" };
        println!("  {:<30} {:<9} {}", source.key().to_string(), state, range);
        println!("    {}", source.url_template);
        if let Some(description) = &source.description {
            println!("    {}", description);
        }
    }
    println!();
}

async fn reset(
    checkpoints: &CheckpointStoreEnum,
    source: &str,
    stream: Option<&str>,
) -> anyhow::Result<()> {
    let keys: Vec<StreamKey> = match stream {
        Some(stream) => vec![StreamKey::new(source, stream)],
        None => checkpoints
            .list()
            .await
            .map_err(|e| anyhow::anyhow!(e.user_message()))?
            .into_iter()
            .map(|c| c.key())
            .filter(|key| key.source.eq_ignore_ascii_case(source))
            .collect(),
    };

    let mut deleted = 0;
    for key in &keys {
        if checkpoints
            .delete(key)
            .await
            .map_err(|e| anyhow::anyhow!(e.user_message()))?
        {
            info!(stream = %key, "Checkpoint deleted");
            deleted += 1;
        }
    }

    if deleted == 0 {
        println!("No checkpoints found for '{}'", source);
    } else {
        println!("Deleted {} checkpoint(s); streams restart at range_min", deleted);
    }
    Ok(())
}

/// Renders a duration as `1h 05m`, `4m 10s` or `12s`.
fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
