use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Scraper registry and target schema live in the TOML file at `scrapers_config`.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,

    // Web server
    pub api_host: String,
    pub api_port: u16,

    // Orchestration
    pub lock_ttl_secs: u64,
    pub result_cache_ttl_secs: u64,
    pub default_budget_cents: u64,
    pub max_run_cost_cents: Option<u64>,
    pub quality_target: f64,
    pub adapter_timeout_secs: u64,
    pub lock_retry_attempts: u32,

    // Registry
    pub scrapers_config: Option<PathBuf>,

    // Logging
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: parse_env("API_PORT", 3000)?,
            lock_ttl_secs: parse_env("LOCK_TTL_SECS", 30)?,
            result_cache_ttl_secs: parse_env("RESULT_CACHE_TTL_SECS", 300)?,
            default_budget_cents: parse_env("DEFAULT_BUDGET_CENTS", 500)?,
            max_run_cost_cents: env::var("MAX_RUN_COST_CENTS")
                .ok()
                .filter(|s| !s.is_empty())
                .map(|s| s.parse())
                .transpose()
                .context("MAX_RUN_COST_CENTS must be a number")?,
            quality_target: parse_env("QUALITY_TARGET", 90.0)?,
            adapter_timeout_secs: parse_env("ADAPTER_TIMEOUT_SECS", 300)?,
            lock_retry_attempts: parse_env("LOCK_RETRY_ATTEMPTS", 2)?,
            scrapers_config: env::var("SCRAPERS_CONFIG")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        };

        config.log_redacted();
        Ok(config)
    }

    fn log_redacted(&self) {
        fn redact_url(url: &str) -> String {
            match url.split_once('@') {
                Some((_, host)) => format!("postgres://***@{host}"),
                None => url.to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", redact_url(&self.database_url));
        tracing::info!("  API: {}:{}", self.api_host, self.api_port);
        tracing::info!(
            lock_ttl_secs = self.lock_ttl_secs,
            result_cache_ttl_secs = self.result_cache_ttl_secs,
            default_budget_cents = self.default_budget_cents,
            max_run_cost_cents = ?self.max_run_cost_cents,
            quality_target = self.quality_target,
            "  Orchestration"
        );
        tracing::info!(
            "  SCRAPERS_CONFIG: {}",
            self.scrapers_config
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<not set>".to_string())
        );
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{key} must be a valid number, got {raw:?}")),
        _ => Ok(default),
    }
}
