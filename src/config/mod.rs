use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::modules::ModuleConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub orchestrator: OrchestratorSettings,
    pub collector: CollectorSettings,
    pub breaker: BreakerSettings,

    /// Optional path to a JSON manifest with the module table, breaker
    /// overrides, and rate-limit budgets
    pub manifest_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Base delay for linear retry backoff between module attempts
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSettings {
    pub retry_attempts: usize,
    pub max_concurrent_requests: usize,
    pub min_quality_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub monitoring_period_ms: u64,
    pub expected_error_rate: f64,
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            monitoring_period: Duration::from_millis(self.monitoring_period_ms),
            expected_error_rate: self.expected_error_rate,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file - this sets env vars that aren't already set
        dotenv::dotenv().ok();

        let config = Config {
            orchestrator: OrchestratorSettings {
                backoff_ms: env::var("VANTAGE_BACKOFF_MS")
                    .unwrap_or_else(|_| "500".to_string())
                    .parse()
                    .context("Invalid VANTAGE_BACKOFF_MS value")?,
            },
            collector: CollectorSettings {
                retry_attempts: env::var("VANTAGE_RETRY_ATTEMPTS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .context("Invalid VANTAGE_RETRY_ATTEMPTS value")?,
                max_concurrent_requests: env::var("VANTAGE_MAX_CONCURRENT_REQUESTS")
                    .unwrap_or_else(|_| "4".to_string())
                    .parse()
                    .context("Invalid VANTAGE_MAX_CONCURRENT_REQUESTS value")?,
                min_quality_score: env::var("VANTAGE_MIN_QUALITY_SCORE")
                    .unwrap_or_else(|_| "0.6".to_string())
                    .parse()
                    .context("Invalid VANTAGE_MIN_QUALITY_SCORE value")?,
            },
            breaker: BreakerSettings {
                failure_threshold: env::var("VANTAGE_BREAKER_FAILURE_THRESHOLD")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .context("Invalid VANTAGE_BREAKER_FAILURE_THRESHOLD value")?,
                reset_timeout_ms: env::var("VANTAGE_BREAKER_RESET_TIMEOUT_MS")
                    .unwrap_or_else(|_| "60000".to_string())
                    .parse()
                    .context("Invalid VANTAGE_BREAKER_RESET_TIMEOUT_MS value")?,
                monitoring_period_ms: env::var("VANTAGE_BREAKER_MONITORING_PERIOD_MS")
                    .unwrap_or_else(|_| "120000".to_string())
                    .parse()
                    .context("Invalid VANTAGE_BREAKER_MONITORING_PERIOD_MS value")?,
                expected_error_rate: env::var("VANTAGE_BREAKER_EXPECTED_ERROR_RATE")
                    .unwrap_or_else(|_| "0.5".to_string())
                    .parse()
                    .context("Invalid VANTAGE_BREAKER_EXPECTED_ERROR_RATE value")?,
            },
            manifest_path: env::var("VANTAGE_MANIFEST_PATH").ok(),
        };

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorSettings { backoff_ms: 500 },
            collector: CollectorSettings {
                retry_attempts: 3,
                max_concurrent_requests: 4,
                min_quality_score: 0.6,
            },
            breaker: BreakerSettings {
                failure_threshold: 5,
                reset_timeout_ms: 60_000,
                monitoring_period_ms: 120_000,
                expected_error_rate: 0.5,
            },
            manifest_path: None,
        }
    }
}

/// Deployment manifest: module table, breaker overrides, rate-limit budgets
///
/// Supplied at process start; the module table stays hot-swappable through
/// the orchestrator's update operation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineManifest {
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,

    #[serde(default)]
    pub breaker_overrides: HashMap<String, BreakerOverride>,

    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitSpec>,
}

impl EngineManifest {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest at {}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse manifest at {}", path))
    }

    /// Resolve the per-resource breaker configs against the defaults
    pub fn breaker_configs(&self, defaults: &BreakerConfig) -> HashMap<String, BreakerConfig> {
        self.breaker_overrides
            .iter()
            .map(|(resource, over)| (resource.clone(), over.apply(defaults)))
            .collect()
    }
}

/// Partial breaker override for one resource
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakerOverride {
    pub failure_threshold: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
    pub monitoring_period_ms: Option<u64>,
    pub expected_error_rate: Option<f64>,
}

impl BreakerOverride {
    pub fn apply(&self, defaults: &BreakerConfig) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            reset_timeout: self
                .reset_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reset_timeout),
            monitoring_period: self
                .monitoring_period_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.monitoring_period),
            expected_error_rate: self
                .expected_error_rate
                .unwrap_or(defaults.expected_error_rate),
        }
    }
}

/// Windowed request budget for one rate-limited resource
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSpec {
    pub requests_per_window: u32,
    pub window_ms: u64,
}
