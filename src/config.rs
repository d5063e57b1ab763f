use crate::domain::Money;
use crate::engine::{EngineConfig, SpilloverPolicy};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub engine: EngineConfig,
    /// How long a request keeps retrying under lock contention.
    pub contention_budget: Duration,
    /// Overflow sweep period; `None` disables the background sweeper.
    pub overflow_sweep: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue(key.to_string(), reason.into())
}

fn parse_or<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: &str,
    expected: &str,
) -> Result<T, ConfigError> {
    env_map
        .get(key)
        .map(|s| s.trim())
        .unwrap_or(default)
        .parse::<T>()
        .map_err(|_| invalid(key, format!("must be {}", expected)))
}

fn parse_percent(key: &str, raw: &str) -> Result<Money, ConfigError> {
    let rate = Money::from_str_canonical(raw.trim())
        .map_err(|_| invalid(key, format!("not a decimal: {}", raw)))?;
    if rate.is_negative() || rate > Money::hundred() {
        return Err(invalid(key, "must be between 0 and 100"));
    }
    Ok(rate)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_or::<u16>(&env_map, "PORT", "8080", "a valid u16")?;

        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let policy = env_map
            .get("PLACEMENT_POLICY")
            .map(|s| s.as_str())
            .unwrap_or("auto")
            .parse::<SpilloverPolicy>()
            .map_err(|reason| invalid("PLACEMENT_POLICY", reason))?;

        let max_search_depth = parse_or::<u32>(&env_map, "MAX_SEARCH_DEPTH", "10", "a valid u32")?;
        if max_search_depth == 0 {
            return Err(invalid("MAX_SEARCH_DEPTH", "must be at least 1"));
        }

        let depth_limit = match env_map.get("MATRIX_DEPTH_LIMIT") {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u32>()
                    .map_err(|_| invalid("MATRIX_DEPTH_LIMIT", "must be a valid u32"))?,
            ),
            None => None,
        };

        let matching_rate = parse_percent(
            "MATCHING_RATE_PERCENT",
            env_map
                .get("MATCHING_RATE_PERCENT")
                .map(|s| s.as_str())
                .unwrap_or("10"),
        )?;

        let level_rates = env_map
            .get("LEVEL_RATES")
            .map(|s| s.as_str())
            .unwrap_or("10,7,5,3,1")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| parse_percent("LEVEL_RATES", s))
            .collect::<Result<Vec<_>, _>>()?;

        let rebalance_threshold = env_map
            .get("REBALANCE_THRESHOLD")
            .map(|s| s.as_str())
            .unwrap_or("0");
        let rebalance_threshold = Money::from_str_canonical(rebalance_threshold.trim())
            .ok()
            .filter(|m| !m.is_negative())
            .ok_or_else(|| invalid("REBALANCE_THRESHOLD", "must be a non-negative decimal"))?;

        let rebalance_max_moves =
            parse_or::<u32>(&env_map, "REBALANCE_MAX_MOVES", "1", "a valid u32")?;

        let contention_budget_ms =
            parse_or::<u64>(&env_map, "CONTENTION_BUDGET_MS", "2000", "a valid u64")?;

        let overflow_sweep_secs =
            parse_or::<u64>(&env_map, "OVERFLOW_SWEEP_SECS", "0", "a valid u64")?;

        let growth_window_days =
            parse_or::<i64>(&env_map, "GROWTH_WINDOW_DAYS", "30", "a valid i64")?;
        if growth_window_days <= 0 {
            return Err(invalid("GROWTH_WINDOW_DAYS", "must be positive"));
        }

        Ok(Config {
            port,
            database_path,
            engine: EngineConfig {
                policy,
                max_search_depth,
                depth_limit,
                matching_rate,
                level_rates,
                rebalance_threshold,
                rebalance_max_moves,
                growth_window: chrono::Duration::days(growth_window_days),
            },
            contention_budget: Duration::from_millis(contention_budget_ms),
            overflow_sweep: (overflow_sweep_secs > 0)
                .then(|| Duration::from_secs(overflow_sweep_secs)),
        })
    }
}
