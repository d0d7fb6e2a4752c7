//! Application configuration for RaveDigest.
//!
//! User config lives at `~/.ravedigest/ravedigest.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DigestError, Result};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::types::StageName;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "ravedigest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".ravedigest";

// ---------------------------------------------------------------------------
// Config structs (matching ravedigest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    #[serde(default)]
    pub composer: ComposerConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// `[bus]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Database file backing the message bus.
    #[serde(default = "default_bus_path")]
    pub path: String,

    /// Consumer groups are named `{group_prefix}-{stage}`.
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,

    /// Maximum messages per claim.
    #[serde(default = "default_claim_batch")]
    pub claim_batch: u32,

    /// How long an empty claim blocks before returning.
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    /// Re-check interval while a claim is blocked.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Pending entries idle longer than this are reclaimable.
    #[serde(default = "default_reclaim_idle_ms")]
    pub reclaim_idle_ms: u64,

    /// How often a running worker sweeps for stalled entries.
    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,

    /// Delivery count at which an entry is dead-lettered instead of reclaimed.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// Approximate per-topic length cap applied after publishing. 0 disables.
    #[serde(default = "default_max_len")]
    pub max_len: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            path: default_bus_path(),
            group_prefix: default_group_prefix(),
            claim_batch: default_claim_batch(),
            block_timeout_ms: default_block_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            reclaim_idle_ms: default_reclaim_idle_ms(),
            reclaim_interval_ms: default_reclaim_interval_ms(),
            max_deliveries: default_max_deliveries(),
            max_len: default_max_len(),
        }
    }
}

impl BusConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reclaim_idle(&self) -> Duration {
        Duration::from_millis(self.reclaim_idle_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    /// Resolved database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

fn default_bus_path() -> String {
    "~/.ravedigest/bus.db".into()
}
fn default_group_prefix() -> String {
    "ravedigest".into()
}
fn default_claim_batch() -> u32 {
    10
}
fn default_block_timeout_ms() -> u64 {
    5_000
}
fn default_poll_interval_ms() -> u64 {
    200
}
fn default_reclaim_idle_ms() -> u64 {
    60_000
}
fn default_reclaim_interval_ms() -> u64 {
    30_000
}
fn default_max_deliveries() -> u32 {
    5
}
fn default_max_len() -> u64 {
    1_000
}

/// `[retry]` section with its two named policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "RetryConfig::transient")]
    pub transient: RetryConfig,

    #[serde(default = "RetryConfig::polling")]
    pub polling: RetryConfig,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            transient: RetryConfig::transient(),
            polling: RetryConfig::polling(),
        }
    }
}

impl RetrySection {
    pub fn transient_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.transient)
    }

    pub fn polling_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.polling)
    }
}

/// `[collector]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Control server bind address.
    #[serde(default = "default_collector_listen")]
    pub listen: String,

    /// Base URL the orchestrator uses to reach this stage.
    #[serde(default = "default_collector_url")]
    pub url: String,

    /// RSS / Atom feeds to collect.
    #[serde(default = "default_feeds")]
    pub feeds: Vec<String>,

    /// Per-request timeout for feed fetches.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen: default_collector_listen(),
            url: default_collector_url(),
            feeds: default_feeds(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_collector_listen() -> String {
    "127.0.0.1:8001".into()
}
fn default_collector_url() -> String {
    "http://127.0.0.1:8001".into()
}
fn default_feeds() -> Vec<String> {
    [
        "https://techcrunch.com/category/artificial-intelligence/feed",
        "https://www.wired.com/feed/tag/ai/latest/rss",
        "https://www.theverge.com/rss/ai-artificial-intelligence/index.xml",
        "https://thenewstack.io/blog/feed/",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_http_timeout_secs() -> u64 {
    30
}

/// `[analyzer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default = "default_analyzer_listen")]
    pub listen: String,

    #[serde(default = "default_analyzer_url")]
    pub url: String,

    /// Keywords that mark an article as developer-focused.
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,

    /// Sentences kept in the extractive summary.
    #[serde(default = "default_summary_sentences")]
    pub summary_sentences: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            listen: default_analyzer_listen(),
            url: default_analyzer_url(),
            keywords: default_keywords(),
            summary_sentences: default_summary_sentences(),
        }
    }
}

fn default_analyzer_listen() -> String {
    "127.0.0.1:8002".into()
}
fn default_analyzer_url() -> String {
    "http://127.0.0.1:8002".into()
}
fn default_keywords() -> Vec<String> {
    [
        "ai",
        "machine learning",
        "deep learning",
        "neural network",
        "developer",
        "programming",
        "mcp",
        "langchain",
        "openai",
        "anthropic",
        "python",
        "rust",
        "javascript",
        "typescript",
        "api",
        "microservices",
        "kubernetes",
        "docker",
        "aws",
        "gcp",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_summary_sentences() -> usize {
    2
}

/// `[composer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposerConfig {
    #[serde(default = "default_composer_listen")]
    pub listen: String,

    #[serde(default = "default_composer_url")]
    pub url: String,

    /// Articles included in one digest.
    #[serde(default = "default_max_articles")]
    pub max_articles: usize,

    /// Digest title prefix; the date is appended.
    #[serde(default = "default_digest_title")]
    pub title: String,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            listen: default_composer_listen(),
            url: default_composer_url(),
            max_articles: default_max_articles(),
            title: default_digest_title(),
        }
    }
}

fn default_composer_listen() -> String {
    "127.0.0.1:8003".into()
}
fn default_composer_url() -> String {
    "http://127.0.0.1:8003".into()
}
fn default_max_articles() -> usize {
    20
}
fn default_digest_title() -> String {
    "Daily Dev Digest".into()
}

/// Where the publisher delivers digests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PublishTarget {
    /// POST the digest as JSON.
    Webhook { url: String },
    /// Write `<digest_id>.md` files.
    Directory { path: String },
}

impl Default for PublishTarget {
    fn default() -> Self {
        Self::Directory {
            path: "~/.ravedigest/digests".into(),
        }
    }
}

/// `[publisher]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_publisher_listen")]
    pub listen: String,

    #[serde(default = "default_publisher_url")]
    pub url: String,

    #[serde(default)]
    pub target: PublishTarget,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            listen: default_publisher_listen(),
            url: default_publisher_url(),
            target: PublishTarget::default(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_publisher_listen() -> String {
    "127.0.0.1:8004".into()
}
fn default_publisher_url() -> String {
    "http://127.0.0.1:8004".into()
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Daily run time, `HH:MM` in UTC.
    #[serde(default = "default_schedule")]
    pub schedule: String,

    /// Timeout for a single trigger call. Triggered jobs run to completion
    /// inside the call, so this is generous.
    #[serde(default = "default_trigger_timeout_secs")]
    pub trigger_timeout_secs: u64,

    /// Timeout for a single status call.
    #[serde(default = "default_status_timeout_secs")]
    pub status_timeout_secs: u64,

    /// Wall-clock limit for the analyzer to go idle.
    #[serde(default = "default_idle_timeout_secs")]
    pub analyzer_idle_timeout_secs: u64,

    /// Wall-clock limit for the publisher to go idle.
    #[serde(default = "default_idle_timeout_secs")]
    pub publisher_idle_timeout_secs: u64,

    /// Pause after a trigger before the first status poll.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Run history database.
    #[serde(default = "default_history_path")]
    pub history_path: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            trigger_timeout_secs: default_trigger_timeout_secs(),
            status_timeout_secs: default_status_timeout_secs(),
            analyzer_idle_timeout_secs: default_idle_timeout_secs(),
            publisher_idle_timeout_secs: default_idle_timeout_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            history_path: default_history_path(),
        }
    }
}

fn default_schedule() -> String {
    "07:00".into()
}
fn default_trigger_timeout_secs() -> u64 {
    300
}
fn default_status_timeout_secs() -> u64 {
    10
}
fn default_idle_timeout_secs() -> u64 {
    350
}
fn default_settle_delay_ms() -> u64 {
    2_000
}
fn default_history_path() -> String {
    "~/.ravedigest/history.db".into()
}

impl AppConfig {
    /// Control URL for a stage.
    pub fn stage_url(&self, stage: StageName) -> &str {
        match stage {
            StageName::Collector => &self.collector.url,
            StageName::Analyzer => &self.analyzer.url,
            StageName::Composer => &self.composer.url,
            StageName::Publisher => &self.publisher.url,
        }
    }

    /// Control server bind address for a stage.
    pub fn stage_listen(&self, stage: StageName) -> &str {
        match stage {
            StageName::Collector => &self.collector.listen,
            StageName::Analyzer => &self.analyzer.listen,
            StageName::Composer => &self.composer.listen,
            StageName::Publisher => &self.publisher.listen,
        }
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.bus.claim_batch == 0 {
            return Err(DigestError::config("bus.claim_batch must be at least 1"));
        }
        if self.bus.max_deliveries == 0 {
            return Err(DigestError::config("bus.max_deliveries must be at least 1"));
        }
        for (name, retry) in [
            ("retry.transient", &self.retry.transient),
            ("retry.polling", &self.retry.polling),
        ] {
            if retry.max_attempts == 0 {
                return Err(DigestError::config(format!(
                    "{name}.max_attempts must be at least 1"
                )));
            }
            if !(0.0..=1.0).contains(&retry.jitter) {
                return Err(DigestError::config(format!(
                    "{name}.jitter must be between 0 and 1"
                )));
            }
        }
        parse_schedule(&self.orchestrator.schedule)?;
        Ok(())
    }
}

/// Parse a `HH:MM` schedule into `(hour, minute)`.
pub fn parse_schedule(s: &str) -> Result<(u32, u32)> {
    let bad = || DigestError::config(format!("schedule '{s}' is not HH:MM"));
    let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
    let hour: u32 = h.parse().map_err(|_| bad())?;
    let minute: u32 = m.parse().map_err(|_| bad())?;
    if hour > 23 || minute > 59 {
        return Err(bad());
    }
    Ok((hour, minute))
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.ravedigest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| DigestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.ravedigest/ravedigest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DigestError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| DigestError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DigestError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DigestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DigestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
