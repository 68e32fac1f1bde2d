use crate::seen::TtlPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub scraper: ScraperConfig,
    pub storage: StorageConfig,
    pub watcher: WatcherDefaults,
    pub delivery: DeliveryConfig,
    pub analysis: AnalysisConfig,
}

/// Scraper configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub timeout_secs: u64,
    pub detail_timeout_secs: u64,
    pub request_delay_ms: u64,
    pub jitter_ms: u64,
    pub max_retries: u32,
    pub user_agent: String,
    pub accept_language: String,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub catalog_path: PathBuf,
    pub seen_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub run_migrations: bool,
}

/// Defaults applied to every watcher unless its options override them
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatcherDefaults {
    pub default_interval_secs: u64,
    pub scan_limit: usize,
    pub take_limit: usize,
    /// `0` keeps seen entries forever.
    pub seen_ttl_secs: u64,
    pub delivery_timeout_secs: u64,
    pub verify_url_on_add: bool,
    pub force_first_page: bool,
    pub cache_bust: bool,
    pub announce: bool,
}

/// Delivery sinks
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub tsv_log: bool,
    pub duckdb: bool,
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

/// AI commentary
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            detail_timeout_secs: 15,
            request_delay_ms: 400,
            jitter_ms: 300,
            max_retries: 2,
            user_agent: "Mozilla/5.0 (compatible; listing-watcher/0.1)".to_string(),
            accept_language: "cs,en;q=0.9".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("data/watchers.json"),
            seen_dir: PathBuf::from("data/seen"),
            db_path: PathBuf::from("data/listings.duckdb"),
            log_dir: PathBuf::from("logs"),
            run_migrations: true,
        }
    }
}

impl Default for WatcherDefaults {
    fn default() -> Self {
        Self {
            default_interval_secs: 60,
            scan_limit: 300,
            take_limit: 20,
            seen_ttl_secs: 3 * 24 * 3600,
            delivery_timeout_secs: 30,
            verify_url_on_add: true,
            force_first_page: true,
            cache_bust: true,
            announce: true,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            tsv_log: true,
            duckdb: true,
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4.1-mini".to_string(),
            timeout_secs: 60,
            temperature: 0.0,
        }
    }
}

impl WatcherDefaults {
    pub fn ttl_policy(&self) -> TtlPolicy {
        if self.seen_ttl_secs == 0 {
            TtlPolicy::Never
        } else {
            TtlPolicy::Expire(Duration::from_secs(self.seen_ttl_secs))
        }
    }

    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.default_interval_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("LISTWATCH").separator("__"))
            .build()
            .context("Failed to read configuration sources")?;

        let mut app_cfg: AppConfig = cfg
            .try_deserialize()
            .context("Invalid configuration")?;

        if app_cfg.analysis.api_key.is_none() {
            app_cfg.analysis.api_key = std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty());
        }

        Ok(app_cfg)
    }
}
