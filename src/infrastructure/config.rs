//! Configuration infrastructure
//!
//! Pipeline configuration is layered:
//! 1. Built-in defaults (`defaults` module)
//! 2. JSON config file (written with defaults on first run)
//! 3. Environment overrides (`FMCSA_*`, `TWO_CAPTCHA_API_KEY`)

#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },

    #[error("politeness delay range is inverted: {min_ms}ms > {max_ms}ms")]
    InvertedDelay { min_ms: u64, max_ms: u64 },
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub captcha: CaptchaConfig,
    pub register: RegisterConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

/// Batch partitioning and concurrency bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Entries per batch (one browser context each)
    pub batch_size: usize,

    /// Batches running at once
    pub max_workers: usize,

    /// Concurrent page workflows inside one batch
    pub page_concurrency: usize,

    /// Random delay before each SAFER query, lower bound
    pub politeness_delay_min_ms: u64,

    /// Random delay before each SAFER query, upper bound
    pub politeness_delay_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

/// Per-operation timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub navigation_secs: u64,
    pub selector_secs: u64,
    pub submit_secs: u64,
    pub captcha_secs: u64,
    pub launch_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptchaConfig {
    /// 2Captcha API key; solver is disabled when absent
    pub api_key: Option<String>,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterConfig {
    pub listing_url: String,
    /// How many of the newest published register dates to read
    pub register_dates: usize,
    /// Two-letter state codes to keep; empty keeps everything
    pub state_filter: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub output_dir: PathBuf,
    pub progress_file: String,
    pub json_file: String,
    pub csv_file: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    /// Defaults to `<output_dir>/logs` when unset
    pub log_dir: Option<PathBuf>,
    pub file_name: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            max_workers: defaults::MAX_WORKERS,
            page_concurrency: defaults::PAGE_CONCURRENCY,
            politeness_delay_min_ms: defaults::POLITENESS_DELAY_MIN_MS,
            politeness_delay_max_ms: defaults::POLITENESS_DELAY_MAX_MS,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            backoff_secs: defaults::RETRY_BACKOFF_SECS,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            navigation_secs: defaults::NAVIGATION_TIMEOUT_SECS,
            selector_secs: defaults::SELECTOR_TIMEOUT_SECS,
            submit_secs: defaults::SUBMIT_TIMEOUT_SECS,
            captcha_secs: defaults::CAPTCHA_TIMEOUT_SECS,
            launch_secs: defaults::LAUNCH_TIMEOUT_SECS,
        }
    }
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            poll_interval_secs: defaults::CAPTCHA_POLL_INTERVAL_SECS,
        }
    }
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            listing_url: defaults::REGISTER_LISTING_URL.to_string(),
            register_dates: defaults::REGISTER_DATES,
            state_filter: defaults::STATE_FILTER.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(defaults::OUTPUT_DIR),
            progress_file: defaults::PROGRESS_FILE.to_string(),
            json_file: defaults::JSON_FILE.to_string(),
            csv_file: defaults::CSV_FILE.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            log_dir: None,
            file_name: defaults::LOG_FILE_NAME.to_string(),
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub const fn navigation(&self) -> Duration {
        Duration::from_secs(self.navigation_secs)
    }

    #[must_use]
    pub const fn selector(&self) -> Duration {
        Duration::from_secs(self.selector_secs)
    }

    #[must_use]
    pub const fn submit(&self) -> Duration {
        Duration::from_secs(self.submit_secs)
    }

    #[must_use]
    pub const fn captcha(&self) -> Duration {
        Duration::from_secs(self.captcha_secs)
    }

    #[must_use]
    pub const fn launch(&self) -> Duration {
        Duration::from_secs(self.launch_secs)
    }
}

impl OutputConfig {
    #[must_use]
    pub fn progress_path(&self) -> PathBuf {
        self.output_dir.join(&self.progress_file)
    }

    #[must_use]
    pub fn json_path(&self) -> PathBuf {
        self.output_dir.join(&self.json_file)
    }

    #[must_use]
    pub fn csv_path(&self) -> PathBuf {
        self.output_dir.join(&self.csv_file)
    }
}

impl PipelineConfig {
    /// Reject settings that would stall the pipeline
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, usize); 4] = [
            ("batch.batch_size", self.batch.batch_size),
            ("batch.max_workers", self.batch.max_workers),
            ("batch.page_concurrency", self.batch.page_concurrency),
            ("retry.max_attempts", self.retry.max_attempts as usize),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field });
        }
        if self.batch.politeness_delay_min_ms > self.batch.politeness_delay_max_ms {
            return Err(ConfigError::InvertedDelay {
                min_ms: self.batch.politeness_delay_min_ms,
                max_ms: self.batch.politeness_delay_max_ms,
            });
        }
        Ok(())
    }

    /// Apply `FMCSA_*` / `TWO_CAPTCHA_API_KEY` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Same as [`Self::apply_env_overrides`] with an injectable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T, ConfigError> {
            raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value: raw.to_string(),
            })
        }

        if let Some(v) = lookup(env::BATCH_SIZE) {
            self.batch.batch_size = parsed(env::BATCH_SIZE, &v)?;
        }
        if let Some(v) = lookup(env::MAX_WORKERS) {
            self.batch.max_workers = parsed(env::MAX_WORKERS, &v)?;
        }
        if let Some(v) = lookup(env::PAGE_CONCURRENCY) {
            self.batch.page_concurrency = parsed(env::PAGE_CONCURRENCY, &v)?;
        }
        if let Some(v) = lookup(env::MAX_ATTEMPTS) {
            self.retry.max_attempts = parsed(env::MAX_ATTEMPTS, &v)?;
        }
        if let Some(v) = lookup(env::RETRY_BACKOFF_SECS) {
            self.retry.backoff_secs = parsed(env::RETRY_BACKOFF_SECS, &v)?;
        }
        if let Some(v) = lookup(env::OUTPUT_DIR) {
            self.output.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(env::LOG_LEVEL) {
            self.logging.level = v;
        }
        if let Some(v) = lookup(env::TWO_CAPTCHA_API_KEY).filter(|k| !k.trim().is_empty()) {
            self.captcha.api_key = Some(v);
        }
        Ok(())
    }
}

/// Loads and persists [`PipelineConfig`] as JSON
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Manager for the per-user config file
    pub fn new() -> Result<Self> {
        let config_path = Self::get_app_config_dir()?.join(defaults::CONFIG_FILE);
        Ok(Self { config_path })
    }

    #[must_use]
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    pub fn get_app_config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("fmcsa-enrich");
        Ok(dir)
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load the file (creating it with defaults if missing), then apply env overrides
    pub async fn load(&self) -> Result<PipelineConfig> {
        let mut config = self.load_config().await?;
        config
            .apply_env_overrides()
            .context("Invalid environment override")?;
        config.validate().context("Invalid pipeline configuration")?;
        Ok(config)
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub async fn load_config(&self) -> Result<PipelineConfig> {
        if !self.config_path.exists() {
            info!("Configuration file not found, creating default: {:?}", self.config_path);
            let default_config = PipelineConfig::default();
            if let Err(e) = self.save_config(&default_config).await {
                warn!("⚠️ Could not write default configuration: {}", e);
            }
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read configuration file")?;
        let config = serde_json::from_str::<PipelineConfig>(&content)
            .with_context(|| format!("Failed to parse configuration file {:?}", self.config_path))?;

        info!("Loaded configuration from: {:?}", self.config_path);
        Ok(config)
    }

    pub async fn save_config(&self, config: &PipelineConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }
}

/// Environment variable names
pub mod env {
    pub const BATCH_SIZE: &str = "FMCSA_BATCH_SIZE";
    pub const MAX_WORKERS: &str = "FMCSA_MAX_WORKERS";
    pub const PAGE_CONCURRENCY: &str = "FMCSA_PAGE_CONCURRENCY";
    pub const MAX_ATTEMPTS: &str = "FMCSA_MAX_ATTEMPTS";
    pub const RETRY_BACKOFF_SECS: &str = "FMCSA_RETRY_BACKOFF_SECS";
    pub const OUTPUT_DIR: &str = "FMCSA_OUTPUT_DIR";
    pub const LOG_LEVEL: &str = "FMCSA_LOG_LEVEL";
    pub const TWO_CAPTCHA_API_KEY: &str = "TWO_CAPTCHA_API_KEY";
}

/// FMCSA endpoints
pub mod fmcsa {
    /// SAFER company snapshot query
    pub const SAFER_SNAPSHOT_URL: &str = "https://safer.fmcsa.dot.gov/CompanySnapshot.aspx";

    /// SMS carrier registration page, `{usdot}` substituted
    pub const SMS_REGISTRATION_URL: &str =
        "https://ai.fmcsa.dot.gov/SMS/Carrier/{usdot}/CarrierRegistration.aspx";

    /// Licensing & Insurance public site, base for relative insurance links
    pub const LI_PUBLIC_BASE: &str = "https://li-public.fmcsa.dot.gov";

    /// 2Captcha endpoints
    pub const TWO_CAPTCHA_IN_URL: &str = "https://2captcha.com/in.php";
    pub const TWO_CAPTCHA_RES_URL: &str = "https://2captcha.com/res.php";

    #[must_use]
    pub fn sms_registration_url(usdot: &str) -> String {
        SMS_REGISTRATION_URL.replace("{usdot}", usdot.trim())
    }
}

/// Default pipeline configuration values
pub mod defaults {
    pub const BATCH_SIZE: usize = 100;
    pub const MAX_WORKERS: usize = 15;
    pub const PAGE_CONCURRENCY: usize = 3;
    pub const POLITENESS_DELAY_MIN_MS: u64 = 2000;
    pub const POLITENESS_DELAY_MAX_MS: u64 = 5000;

    pub const MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_BACKOFF_SECS: u64 = 3;

    pub const NAVIGATION_TIMEOUT_SECS: u64 = 120;
    pub const SELECTOR_TIMEOUT_SECS: u64 = 30;
    pub const SUBMIT_TIMEOUT_SECS: u64 = 60;
    pub const CAPTCHA_TIMEOUT_SECS: u64 = 180;
    pub const LAUNCH_TIMEOUT_SECS: u64 = 30;

    pub const CAPTCHA_POLL_INTERVAL_SECS: u64 = 5;

    /// Published register dates listing
    pub const REGISTER_LISTING_URL: &str =
        "https://li-public.fmcsa.dot.gov/LIVIEW/pkg_REGISTER.prc_reg_list";
    pub const REGISTER_DATES: usize = 1;
    pub const STATE_FILTER: &[&str] = &["WA", "OR"];

    pub const OUTPUT_DIR: &str = "output";
    pub const PROGRESS_FILE: &str = "fmcsa_progress.jsonl";
    pub const JSON_FILE: &str = "fmcsa_register_enriched.json";
    pub const CSV_FILE: &str = "fmcsa_register_enriched.csv";
    pub const CONFIG_FILE: &str = "config.json";

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_JSON_FORMAT: bool = false;
    pub const LOG_CONSOLE_OUTPUT: bool = true;
    pub const LOG_FILE_OUTPUT: bool = true;
    pub const LOG_FILE_NAME: &str = "fmcsa-enrich.log";
}
