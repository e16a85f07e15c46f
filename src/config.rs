use crate::app_url::resolve_api_base_url;
use crate::models::{BacktestRequest, DEFAULT_TIMEFRAMES};
use crate::retry::RetryPolicy;
use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::time::Duration;

pub const API_SECRET_KEY: &str = "PANEL_API_SECRET";
const POLL_INTERVAL_KEY: &str = "PANEL_POLL_INTERVAL_MS";
const RETRY_ATTEMPTS_KEY: &str = "PANEL_POLL_RETRY_ATTEMPTS";
const RETRY_BASE_KEY: &str = "PANEL_POLL_RETRY_BASE_MS";
const RETRY_MAX_KEY: &str = "PANEL_POLL_RETRY_MAX_MS";
const JOB_TIMEOUT_KEY: &str = "PANEL_JOB_TIMEOUT_SECS";
const REQUEST_TIMEOUT_KEY: &str = "PANEL_REQUEST_TIMEOUT_SECS";
const TIMEFRAMES_KEY: &str = "PANEL_TIMEFRAMES";

const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_RETRY_ATTEMPTS: u64 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_RETRY_MAX_MS: u64 = 5000;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const MAX_POLL_INTERVAL_MS: u64 = 3_600_000;
const MAX_RETRY_ATTEMPTS: u64 = 100;
const MAX_RETRY_DELAY_MS: u64 = 600_000;
const MAX_JOB_TIMEOUT_SECS: u64 = 7 * 24 * 3600;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 3600;

/// Runtime knobs for polling and the HTTP client.
#[derive(Debug, Clone)]
pub struct PanelSettings {
    pub api_base_url: Option<String>,
    pub api_secret: Option<String>,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub job_timeout: Option<Duration>,
    pub request_timeout: Duration,
    pub timeframes: Vec<String>,
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            api_base_url: None,
            api_secret: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            retry: RetryPolicy::default(),
            job_timeout: Some(Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS)),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            timeframes: DEFAULT_TIMEFRAMES.iter().map(|tf| tf.to_string()).collect(),
        }
    }
}

impl PanelSettings {
    pub fn from_env() -> Result<Self> {
        let settings: HashMap<String, String> = std::env::vars().collect();
        Self::from_settings_map(&settings)
    }

    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let api_base_url = resolve_api_base_url(settings);
        let api_secret = optional_setting(settings, API_SECRET_KEY).map(str::to_string);
        let poll_interval_ms = optional_setting_u64(
            settings,
            POLL_INTERVAL_KEY,
            DEFAULT_POLL_INTERVAL_MS,
            1..=MAX_POLL_INTERVAL_MS,
        )?;
        let retry_attempts = optional_setting_u64(
            settings,
            RETRY_ATTEMPTS_KEY,
            DEFAULT_RETRY_ATTEMPTS,
            1..=MAX_RETRY_ATTEMPTS,
        )?;
        let retry_attempts = u32::try_from(retry_attempts).map_err(|_| {
            anyhow!("Setting {} is out of range (value: {})", RETRY_ATTEMPTS_KEY, retry_attempts)
        })?;
        let retry_base_ms = optional_setting_u64(
            settings,
            RETRY_BASE_KEY,
            DEFAULT_RETRY_BASE_MS,
            0..=MAX_RETRY_DELAY_MS,
        )?;
        let retry_max_ms = optional_setting_u64(
            settings,
            RETRY_MAX_KEY,
            DEFAULT_RETRY_MAX_MS,
            0..=MAX_RETRY_DELAY_MS,
        )?;
        let job_timeout_secs = optional_setting_u64(
            settings,
            JOB_TIMEOUT_KEY,
            DEFAULT_JOB_TIMEOUT_SECS,
            0..=MAX_JOB_TIMEOUT_SECS,
        )?;
        let request_timeout_secs = optional_setting_u64(
            settings,
            REQUEST_TIMEOUT_KEY,
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1..=MAX_REQUEST_TIMEOUT_SECS,
        )?;
        let timeframes = match optional_setting(settings, TIMEFRAMES_KEY) {
            Some(raw) => parse_timeframes(raw)
                .map_err(|err| anyhow!("Setting {} is invalid: {}", TIMEFRAMES_KEY, err))?,
            None => DEFAULT_TIMEFRAMES.iter().map(|tf| tf.to_string()).collect(),
        };

        if retry_max_ms < retry_base_ms {
            return Err(anyhow!(
                "{} ({}) must be >= {} ({})",
                RETRY_MAX_KEY,
                retry_max_ms,
                RETRY_BASE_KEY,
                retry_base_ms
            ));
        }

        Ok(Self {
            api_base_url,
            api_secret,
            poll_interval: Duration::from_millis(poll_interval_ms),
            retry: RetryPolicy {
                max_attempts: retry_attempts,
                base_delay: Duration::from_millis(retry_base_ms),
                max_delay: Duration::from_millis(retry_max_ms),
            },
            job_timeout: (job_timeout_secs > 0).then(|| Duration::from_secs(job_timeout_secs)),
            request_timeout: Duration::from_secs(request_timeout_secs),
            timeframes,
        })
    }

    pub fn require_api_base_url(&self) -> Result<&str> {
        self.api_base_url.as_deref().ok_or_else(|| {
            anyhow!("PANEL_API_URL or DOMAIN must be set to reach the trading service API.")
        })
    }
}

/// How much capital each backtest in a batch starts with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CapitalSizing {
    Fixed { amount: f64 },
    Leveraged { amount: f64, leverage: u32 },
}

impl CapitalSizing {
    pub fn initial_capital(&self) -> f64 {
        match *self {
            CapitalSizing::Fixed { amount } => amount,
            CapitalSizing::Leveraged { amount, leverage } => amount * leverage as f64,
        }
    }

    fn validate(&self) -> Result<()> {
        let amount = match *self {
            CapitalSizing::Fixed { amount } => amount,
            CapitalSizing::Leveraged { amount, leverage } => {
                if leverage < 1 {
                    return Err(anyhow!("leverage must be >= 1 (value: {})", leverage));
                }
                amount
            }
        };
        if !amount.is_finite() || amount <= 0.0 {
            return Err(anyhow!(
                "capital amount must be a positive number (value: {})",
                amount
            ));
        }
        Ok(())
    }
}

/// Everything a batch shares across its timeframes.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub symbol: String,
    pub strategy: String,
    pub model: String,
    pub days: u32,
    pub capital: CapitalSizing,
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(anyhow!("symbol must not be empty"));
        }
        if self.strategy.trim().is_empty() {
            return Err(anyhow!("strategy must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must not be empty"));
        }
        if self.days < 1 {
            return Err(anyhow!("days must be >= 1 (value: {})", self.days));
        }
        self.capital.validate()
    }

    pub fn request_for(&self, timeframe: &str) -> BacktestRequest {
        BacktestRequest {
            symbol: self.symbol.trim().to_string(),
            timeframe: timeframe.to_string(),
            strategy: self.strategy.clone(),
            model: self.model.clone(),
            days: self.days,
            initial_capital: self.capital.initial_capital(),
        }
    }
}

/// Splits a comma or whitespace separated timeframe list, rejecting duplicates.
pub fn parse_timeframes(raw: &str) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut timeframes = Vec::new();
    for part in raw.split(|c: char| c == ',' || c.is_whitespace()) {
        let entry = part.trim();
        if entry.is_empty() {
            continue;
        }
        if !seen.insert(entry.to_string()) {
            return Err(anyhow!("duplicate timeframe {}", entry));
        }
        timeframes.push(entry.to_string());
    }
    if timeframes.is_empty() {
        return Err(anyhow!("at least one timeframe is required (value: {})", raw));
    }
    Ok(timeframes)
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_u64(
    settings: &HashMap<String, String>,
    key: &str,
    default: u64,
    bounds: RangeInclusive<u64>,
) -> Result<u64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<u64>()
        .map_err(|_| anyhow!("Setting {} must be a non-negative integer (value: {})", key, raw))?;
    if !bounds.contains(&value) {
        return Err(anyhow!(
            "Setting {} must be between {} and {} (value: {})",
            key,
            bounds.start(),
            bounds.end(),
            raw
        ));
    }
    Ok(value)
}
