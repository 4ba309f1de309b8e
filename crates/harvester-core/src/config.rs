//! Configuration types for harvester components.
//!
//! Sources are declared in `sources.toml` (see [`load_sources_config`]).
//! Each `[[sources]]` entry describes one stream: where positions are
//! fetched from, how fast, and how payloads become entities. Runtime
//! structs ([`FetchConfig`], [`CircuitBreakerConfig`], [`ControllerConfig`])
//! are derived from an entry with [`SourceConfig::fetch_config`] and friends.
//!
//! A few knobs can be overridden from the environment without touching the
//! file; see [`SourceConfig::with_env_overrides`] and [`WatchdogConfig::from_env`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::controller::ControllerConfig;
use crate::error::AppError;
use crate::fetch::{FetchConfig, RetryPolicy};
use crate::models::{PositionRange, StreamKey, UpdateMode};

pub(crate) fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

// =============================================================================
// Checkpoint backend
// =============================================================================

/// Where checkpoints and seen sets are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// `harvest_checkpoints` / `harvest_seen` tables (default).
    #[default]
    Postgres,
    /// Redis-compatible key-value store.
    Redis,
    /// Process memory; progress is lost on exit.
    Memory,
}

impl fmt::Display for CheckpointBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Redis => write!(f, "redis"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for CheckpointBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            _ => Err(AppError::ConfigError(format!(
                "Unknown checkpoint backend: '{}'. Valid options: postgres, redis, memory",
                s
            ))),
        }
    }
}

/// Database connection pool configuration.
pub struct DbConfig {
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { max_connections: 10 }
    }
}

impl DbConfig {
    /// Reads `DB_MAX_CONNECTIONS`, falling back to the default.
    pub fn from_env() -> Self {
        Self {
            max_connections: env_parse("DB_MAX_CONNECTIONS")
                .unwrap_or(Self::default().max_connections),
        }
    }
}

// =============================================================================
// Watchdog Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// A stream whose checkpoint is older than this is restarted.
    pub staleness_threshold: Duration,
    /// Time between two health checks.
    pub poll_interval: Duration,
    /// How long a replaced controller may take to flush before it is aborted.
    pub shutdown_grace: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(7200),
            poll_interval: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(120),
        }
    }
}

impl WatchdogConfig {
    /// Reads `HARVEST_STALENESS_THRESHOLD_SECS`, `HARVEST_WATCHDOG_POLL_SECS`
    /// and `HARVEST_SHUTDOWN_GRACE_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            staleness_threshold: env_parse("HARVEST_STALENESS_THRESHOLD_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.staleness_threshold),
            poll_interval: env_parse("HARVEST_WATCHDOG_POLL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            shutdown_grace: env_parse("HARVEST_SHUTDOWN_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
        }
    }

    pub fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

// =============================================================================
// Entity extraction rules
// =============================================================================

/// Reference from an extracted object to another entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefRule {
    /// Kind of the referenced entity.
    pub kind: String,
    /// JSON pointer to the referenced id.
    pub pointer: String,
}

/// How to extract one entity kind from a payload.
///
/// `pointer` selects an object (one entity) or an array of objects (one
/// entity each) from the payload. `references` are resolved relative to the
/// selected object, `parent` relative to the payload root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRule {
    pub kind: String,
    #[serde(default)]
    pub pointer: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Fields to keep. All fields are kept when absent.
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub references: Vec<RefRule>,
    pub parent: Option<RefRule>,
}

fn default_id_field() -> String {
    "id".to_string()
}

// =============================================================================
// Source Configuration (sources.toml)
// =============================================================================

fn default_enabled() -> bool {
    true
}

fn default_stream() -> String {
    "default".to_string()
}

fn default_range_min() -> i64 {
    1
}

fn default_empty_page_threshold() -> u32 {
    3
}

fn default_concurrency() -> usize {
    50
}

fn default_block_size() -> usize {
    500
}

fn default_batch_flush_size() -> usize {
    1000
}

fn default_inter_cycle_pause_secs() -> u64 {
    60
}

fn default_staleness_threshold_secs() -> u64 {
    7200
}

fn default_max_consecutive_errors() -> u32 {
    10
}

fn default_backoff_base_secs() -> u64 {
    60
}

fn default_backoff_cap_secs() -> u64 {
    300
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

/// Root configuration structure for sources.toml.
///
/// # Example
///
/// ```toml
/// [[sources]]
/// name = "uzum"
/// stream = "products"
/// url_template = "https://api.uzum.uz/api/v2/product/{position}"
/// range_min = 1
/// range_max = 2000000
/// required_pointer = "/payload/data"
///
/// [[sources.entities]]
/// kind = "product"
/// pointer = "/payload/data"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub sources: Vec<SourceConfig>,
}

impl SourcesConfig {
    /// Sources with `enabled = true`.
    pub fn enabled_sources(&self) -> Vec<&SourceConfig> {
        self.sources.iter().filter(|s| s.enabled).collect()
    }

    /// Finds a source by stream key (case-insensitive).
    pub fn find(&self, key: &StreamKey) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| {
            s.name.eq_ignore_ascii_case(&key.source) && s.stream.eq_ignore_ascii_case(&key.stream)
        })
    }

    /// All streams of a source (case-insensitive).
    pub fn find_by_name(&self, name: &str) -> Vec<&SourceConfig> {
        self.sources
            .iter()
            .filter(|s| s.name.eq_ignore_ascii_case(name))
            .collect()
    }

    /// Validates every entry; the first invalid one is reported.
    pub fn validate(&self) -> Result<(), AppError> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.key()) {
                return Err(AppError::ConfigError(format!(
                    "Duplicate stream '{}' in configuration",
                    source.key()
                )));
            }
        }
        Ok(())
    }
}

/// A single stream entry in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source name, used for `--source <name>` lookup, logging and as the
    /// `source` column of harvested entities.
    pub name: String,

    /// Stream name within the source. Defaults to `"default"`.
    #[serde(default = "default_stream")]
    pub stream: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Request URL with a `{position}` placeholder.
    pub url_template: String,

    /// Static request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default = "default_range_min")]
    pub range_min: i64,

    /// Last position of the range. Absent means the source is paginated and
    /// the cycle ends after `empty_page_threshold` empty blocks.
    pub range_max: Option<i64>,

    #[serde(default = "default_empty_page_threshold")]
    pub empty_page_threshold: u32,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Staging buffer cap.
    #[serde(default = "default_batch_flush_size")]
    pub batch_flush_size: usize,

    #[serde(default = "default_inter_cycle_pause_secs")]
    pub inter_cycle_pause_secs: u64,

    /// Politeness pause between blocks.
    #[serde(default)]
    pub inter_block_delay_ms: u64,

    /// Random pause of up to this long before each request.
    #[serde(default)]
    pub request_jitter_ms: u64,

    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,

    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// First circuit breaker cooldown, doubled on consecutive trips.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default)]
    pub update_mode: UpdateMode,

    /// JSON pointer that must exist in a 2xx body, otherwise the position is
    /// treated as not found.
    pub required_pointer: Option<String>,

    /// Body substrings that reveal an anti-bot page.
    #[serde(default)]
    pub block_markers: Vec<String>,

    /// Entity extraction rules, in declared kind order.
    #[serde(default)]
    pub entities: Vec<EntityRule>,

    pub description: Option<String>,
}

impl SourceConfig {
    /// Minimal entry with defaults, mostly useful in tests.
    pub fn new(name: impl Into<String>, url_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stream: default_stream(),
            enabled: true,
            url_template: url_template.into(),
            headers: BTreeMap::new(),
            range_min: default_range_min(),
            range_max: None,
            empty_page_threshold: default_empty_page_threshold(),
            concurrency: default_concurrency(),
            block_size: default_block_size(),
            batch_flush_size: default_batch_flush_size(),
            inter_cycle_pause_secs: default_inter_cycle_pause_secs(),
            inter_block_delay_ms: 0,
            request_jitter_ms: 0,
            staleness_threshold_secs: default_staleness_threshold_secs(),
            max_consecutive_errors: default_max_consecutive_errors(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            update_mode: UpdateMode::default(),
            required_pointer: None,
            block_markers: Vec::new(),
            entities: Vec::new(),
            description: None,
        }
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.name.clone(), self.stream.clone())
    }

    pub fn range(&self) -> PositionRange {
        PositionRange {
            min: self.range_min,
            max: self.range_max,
        }
    }

    /// Declared kind order of the extraction rules.
    pub fn kind_order(&self) -> Vec<String> {
        let mut kinds: Vec<String> = Vec::new();
        for rule in &self.entities {
            if !kinds.contains(&rule.kind) {
                kinds.push(rule.kind.clone());
            }
        }
        kinds
    }

    /// Rejects entries the engine cannot run.
    pub fn validate(&self) -> Result<(), AppError> {
        let fail = |msg: String| Err(AppError::ConfigError(format!("{}: {}", self.key(), msg)));

        if self.name.trim().is_empty() {
            return fail("name must not be empty".to_string());
        }
        if !self.url_template.contains("{position}") {
            return fail("url_template must contain a {position} placeholder".to_string());
        }
        if let Some(max) = self.range_max {
            if max < self.range_min {
                return fail(format!(
                    "range_max ({}) is below range_min ({})",
                    max, self.range_min
                ));
            }
        } else if self.empty_page_threshold == 0 {
            return fail("empty_page_threshold must be at least 1".to_string());
        }
        if self.concurrency == 0 || self.block_size == 0 || self.batch_flush_size == 0 {
            return fail("concurrency, block_size and batch_flush_size must be positive".to_string());
        }
        if self.max_attempts == 0 || self.max_consecutive_errors == 0 {
            return fail("max_attempts and max_consecutive_errors must be positive".to_string());
        }
        if self.backoff_cap_secs < self.backoff_base_secs {
            return fail(format!(
                "backoff_cap_secs ({}) is below backoff_base_secs ({})",
                self.backoff_cap_secs, self.backoff_base_secs
            ));
        }
        for rule in &self.entities {
            if rule.kind.trim().is_empty() {
                return fail("entity rules need a kind".to_string());
            }
            let pointers = std::iter::once(&rule.pointer)
                .chain(rule.references.iter().map(|r| &r.pointer))
                .chain(rule.parent.iter().map(|r| &r.pointer));
            for pointer in pointers {
                if !pointer.is_empty() && !pointer.starts_with('/') {
                    return fail(format!(
                        "JSON pointer '{}' of kind '{}' must start with '/'",
                        pointer, rule.kind
                    ));
                }
            }
        }
        Ok(())
    }

    /// Applies `HARVEST_*` environment overrides.
    ///
    /// Supported: `HARVEST_CONCURRENCY`, `HARVEST_BLOCK_SIZE`,
    /// `HARVEST_BATCH_FLUSH_SIZE`, `HARVEST_INTER_CYCLE_PAUSE_SECS`,
    /// `HARVEST_REQUEST_TIMEOUT_SECS`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse("HARVEST_CONCURRENCY") {
            self.concurrency = v;
        }
        if let Some(v) = env_parse("HARVEST_BLOCK_SIZE") {
            self.block_size = v;
        }
        if let Some(v) = env_parse("HARVEST_BATCH_FLUSH_SIZE") {
            self.batch_flush_size = v;
        }
        if let Some(v) = env_parse("HARVEST_INTER_CYCLE_PAUSE_SECS") {
            self.inter_cycle_pause_secs = v;
        }
        if let Some(v) = env_parse("HARVEST_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = v;
        }
        self
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig::default()
            .with_concurrency(self.concurrency)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_retry(RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                ..RetryPolicy::default()
            })
            .with_request_jitter(Some(Duration::from_millis(self.request_jitter_ms)))
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.max_consecutive_errors,
            recovery_timeout: Duration::from_secs(self.backoff_base_secs),
            max_recovery_timeout: Duration::from_secs(self.backoff_cap_secs),
            ..CircuitBreakerConfig::default()
        }
        .with_env_overrides()
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::new(self.range())
            .with_block_size(self.block_size)
            .with_batch_flush_size(self.batch_flush_size)
            .with_empty_page_threshold(self.empty_page_threshold)
            .with_inter_cycle_pause(Duration::from_secs(self.inter_cycle_pause_secs))
            .with_inter_block_delay(Duration::from_millis(self.inter_block_delay_ms))
            .with_update_mode(self.update_mode)
            .with_kind_order(self.kind_order())
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }
}

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "sources.toml";

/// Returns the default configuration directory path: `~/.config/harvester/`
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("harvester"))
}

/// Returns the default configuration file path: `~/.config/harvester/sources.toml`
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join(CONFIG_FILE_NAME))
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Harvester Source Configuration
#
# Usage:
#   harvester run                    # Harvest all enabled streams until Ctrl+C
#   harvester run --source uzum      # Harvest the streams of one source
#   harvester status                 # Show checkpoint health of every stream
#
# Each [[sources]] entry is one stream. url_template must contain {position}.
# Leave out range_max for paginated listings: the cycle ends after
# empty_page_threshold consecutive empty blocks.

[[sources]]
name = "uzum"
stream = "products"
url_template = "https://api.uzum.uz/api/v2/product/{position}"
range_min = 1
range_max = 2000000
concurrency = 50
block_size = 500
batch_flush_size = 1000
required_pointer = "/payload/data"
block_markers = ["captcha"]
enabled = false

[[sources.entities]]
kind = "seller"
pointer = "/payload/data/seller"
fields = ["title", "link", "rating", "reviews", "orders"]

[[sources.entities]]
kind = "category"
pointer = "/payload/data/category"
fields = ["title", "parent"]

[[sources.entities]]
kind = "product"
pointer = "/payload/data"
fields = ["title", "rating", "reviewsAmount", "ordersAmount", "totalAvailableAmount"]
references = [
    { kind = "seller", pointer = "/seller/id" },
    { kind = "category", pointer = "/category/id" },
]

[[sources.entities]]
kind = "sku"
pointer = "/payload/data/skuList"
fields = ["availableAmount", "fullPrice", "purchasePrice"]
parent = { kind = "product", pointer = "/payload/data/id" }
"#;

/// Load source configuration from a TOML file.
///
/// # Returns
/// * `Ok(Some(config))` - Configuration loaded and validated
/// * `Ok(None)` - No configuration file and none could be created
/// * `Err(e)` - Configuration file exists but is invalid
///
/// # Behavior
/// If no configuration file exists at the default path, a template file is
/// created so the user has something to edit.
pub fn load_sources_config(path: Option<PathBuf>) -> Result<Option<SourcesConfig>, AppError> {
    let using_default_path = path.is_none();
    let config_path = match path {
        Some(p) => p,
        None => match default_config_path() {
            Some(p) => p,
            None => return Ok(None),
        },
    };

    if !config_path.exists() {
        if using_default_path {
            if let Err(e) = create_default_config(&config_path) {
                tracing::warn!("Could not create default config template: {}", e);
                return Ok(None);
            }
            tracing::info!(
                "Config file created at {}. Enable a source there to start harvesting.",
                config_path.display()
            );
        } else {
            return Err(AppError::ConfigError(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }
    }

    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        AppError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            config_path.display(),
            e
        ))
    })?;

    let config: SourcesConfig = toml::from_str(&content).map_err(|e| {
        AppError::ConfigError(format!(
            "Invalid TOML in '{}': {}",
            config_path.display(),
            e
        ))
    })?;
    config.validate()?;

    Ok(Some(config))
}

fn create_default_config(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    tracing::info!("Created default config template at: {}", path.display());

    Ok(())
}
