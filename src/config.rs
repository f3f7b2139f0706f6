use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_PRIMARY_MARKET_DATA_URL: &str = "https://api.binance.com";
pub const DEFAULT_FALLBACK_MARKET_DATA_URL: &str = "https://data-api.binance.vision";

/// Candle intervals accepted for runs and decision previews.
pub const SUPPORTED_INTERVALS: [&str; 12] = [
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d",
];

pub fn is_supported_interval(value: &str) -> bool {
    SUPPORTED_INTERVALS.contains(&value)
}

/// Keys read from the `settings` table; a process environment variable of the
/// same name overrides the stored value.
pub const SETTING_KEYS: [&str; 15] = [
    "LIVE_RUN_INTERVAL_SECS",
    "EQUITY_SNAPSHOT_INTERVAL_SECS",
    "RUN_CONCURRENCY",
    "WEBHOOK_TIMEOUT_MS",
    "PRICE_CACHE_TTL_SECS",
    "MARKET_DATA_TIMEOUT_SECS",
    "MARKET_DATA_PRIMARY_URL",
    "MARKET_DATA_FALLBACK_URL",
    "DEFAULT_CANDLE_INTERVAL",
    "CANDLE_LIMIT",
    "EQUITY_HISTORY_LIMIT",
    "EQUITY_MAX_FAILED_RATIO",
    "EQUITY_MIN_CHANGE_RATIO",
    "EQUITY_PRICE_RETRY_DELAY_MS",
    "COMMIT_MAX_ATTEMPTS",
];

/// Applies environment overrides for known keys on top of stored settings.
pub fn overlay_env<F>(settings: &mut HashMap<String, String>, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    for key in SETTING_KEYS {
        if let Some(value) = lookup(key) {
            settings.insert(key.to_string(), value);
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub live_run_interval: Duration,
    pub equity_snapshot_interval: Duration,
    pub run_concurrency: usize,
    pub webhook_timeout: Duration,
    pub price_cache_ttl: Duration,
    pub market_data_timeout: Duration,
    pub primary_market_data_url: String,
    pub fallback_market_data_url: Option<String>,
    pub default_candle_interval: String,
    pub candle_limit: usize,
    pub equity_history_limit: usize,
    pub equity_max_failed_ratio: f64,
    pub equity_min_change_ratio: f64,
    pub equity_price_retry_delay: Duration,
    pub commit_max_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            live_run_interval: Duration::from_secs(10),
            equity_snapshot_interval: Duration::from_secs(60),
            run_concurrency: 4,
            webhook_timeout: Duration::from_millis(5000),
            price_cache_ttl: Duration::from_secs(10),
            market_data_timeout: Duration::from_secs(10),
            primary_market_data_url: DEFAULT_PRIMARY_MARKET_DATA_URL.to_string(),
            fallback_market_data_url: Some(DEFAULT_FALLBACK_MARKET_DATA_URL.to_string()),
            default_candle_interval: "1m".to_string(),
            candle_limit: 100,
            equity_history_limit: 500,
            equity_max_failed_ratio: 0.4,
            equity_min_change_ratio: 0.001,
            equity_price_retry_delay: Duration::from_millis(500),
            commit_max_attempts: 3,
        }
    }
}

impl EngineSettings {
    /// Builds settings from a merged key/value map. Missing keys fall back to
    /// defaults; present keys must be valid.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let live_run_interval_secs = setting_u64(settings, "LIVE_RUN_INTERVAL_SECS", 10, 1)?;
        let equity_snapshot_interval_secs =
            setting_u64(settings, "EQUITY_SNAPSHOT_INTERVAL_SECS", 60, 1)?;
        let run_concurrency =
            setting_u64(settings, "RUN_CONCURRENCY", defaults.run_concurrency as u64, 1)? as usize;
        let webhook_timeout_ms = setting_u64(settings, "WEBHOOK_TIMEOUT_MS", 5000, 100)?;
        if webhook_timeout_ms > 30_000 {
            return Err(anyhow!(
                "Setting WEBHOOK_TIMEOUT_MS must be <= 30000 (value: {})",
                webhook_timeout_ms
            ));
        }
        let price_cache_ttl_secs = setting_u64(settings, "PRICE_CACHE_TTL_SECS", 10, 0)?;
        let market_data_timeout_secs = setting_u64(settings, "MARKET_DATA_TIMEOUT_SECS", 10, 1)?;
        let primary_market_data_url = optional_setting(settings, "MARKET_DATA_PRIMARY_URL")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or(defaults.primary_market_data_url);
        let fallback_market_data_url = match settings.get("MARKET_DATA_FALLBACK_URL") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(value.trim().trim_end_matches('/').to_string()),
            None => defaults.fallback_market_data_url,
        };
        let default_candle_interval = optional_setting(settings, "DEFAULT_CANDLE_INTERVAL")
            .map(str::to_string)
            .unwrap_or(defaults.default_candle_interval);
        if !is_supported_interval(&default_candle_interval) {
            return Err(anyhow!(
                "Setting DEFAULT_CANDLE_INTERVAL must be one of {} (value: {})",
                SUPPORTED_INTERVALS.join(", "),
                default_candle_interval
            ));
        }
        let candle_limit = setting_u64(settings, "CANDLE_LIMIT", 100, 1)? as usize;
        if candle_limit > 1000 {
            return Err(anyhow!(
                "Setting CANDLE_LIMIT must be <= 1000 (value: {})",
                candle_limit
            ));
        }
        let equity_history_limit = setting_u64(settings, "EQUITY_HISTORY_LIMIT", 500, 1)? as usize;
        let equity_max_failed_ratio =
            setting_f64(settings, "EQUITY_MAX_FAILED_RATIO", 0.4, Some(0.0), Some(1.0))?;
        let equity_min_change_ratio =
            setting_f64(settings, "EQUITY_MIN_CHANGE_RATIO", 0.001, Some(0.0), None)?;
        let equity_price_retry_delay_ms =
            setting_u64(settings, "EQUITY_PRICE_RETRY_DELAY_MS", 500, 0)?;
        let commit_max_attempts = setting_u64(settings, "COMMIT_MAX_ATTEMPTS", 3, 1)? as u32;

        Ok(Self {
            live_run_interval: Duration::from_secs(live_run_interval_secs),
            equity_snapshot_interval: Duration::from_secs(equity_snapshot_interval_secs),
            run_concurrency,
            webhook_timeout: Duration::from_millis(webhook_timeout_ms),
            price_cache_ttl: Duration::from_secs(price_cache_ttl_secs),
            market_data_timeout: Duration::from_secs(market_data_timeout_secs),
            primary_market_data_url,
            fallback_market_data_url,
            default_candle_interval,
            candle_limit,
            equity_history_limit,
            equity_max_failed_ratio,
            equity_min_change_ratio,
            equity_price_retry_delay: Duration::from_millis(equity_price_retry_delay_ms),
            commit_max_attempts,
        })
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn setting_u64(
    settings: &HashMap<String, String>,
    key: &str,
    default: u64,
    min: u64,
) -> Result<u64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<u64>()
        .map_err(|_| anyhow!("Setting {} must be a non-negative integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}
