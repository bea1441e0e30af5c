//! Resilient data collection across ranked source tiers
//!
//! Sources are attempted in phases: required first, then preferred when the
//! quality score falls short, then patient last-resort fallbacks. Each call
//! is wrapped by the source's circuit breaker and a capped-backoff retry
//! policy, so one flaky provider degrades the result instead of sinking it.

pub mod source;

pub use source::{HttpJsonSource, SourceClient, StaticSource};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, info, warn};

use crate::breaker::BreakerRegistry;
use crate::error::SourceError;
use crate::quality::DataQualityValidator;

/// Weight applied to a source missing from the catalog
const DEFAULT_SOURCE_WEIGHT: f64 = 0.1;

/// Synthetic fallback data carries a fraction of the source's normal weight
const FALLBACK_WEIGHT_FACTOR: f64 = 0.3;

/// Retry backoff cap for source fetches
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Timeout posture for a collection run; a multiplier on each source's
/// base timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStrategy {
    Aggressive,
    Balanced,
    Patient,
}

impl TimeoutStrategy {
    pub fn multiplier(&self) -> f64 {
        match self {
            TimeoutStrategy::Aggressive => 0.5,
            TimeoutStrategy::Balanced => 1.0,
            TimeoutStrategy::Patient => 1.5,
        }
    }
}

/// What to collect and how hard to try
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStrategy {
    /// All of these must succeed for the collection to count as a success
    pub required_sources: Vec<String>,

    /// Attempted only when required sources fall short of the threshold
    pub preferred_sources: Vec<String>,

    /// Last resort, attempted patiently at reduced concurrency
    pub fallback_sources: Vec<String>,

    pub min_quality_score: f64,

    pub timeout_strategy: TimeoutStrategy,

    pub max_concurrent_requests: usize,
}

impl Default for CollectionStrategy {
    fn default() -> Self {
        Self {
            required_sources: Vec::new(),
            preferred_sources: Vec::new(),
            fallback_sources: Vec::new(),
            min_quality_score: 0.6,
            timeout_strategy: TimeoutStrategy::Balanced,
            max_concurrent_requests: 4,
        }
    }
}

/// Outcome of one collection attempt against one source, write-once
#[derive(Debug, Clone, Serialize)]
pub struct SourceResult {
    pub source: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// 0-1; zero for failed attempts
    pub quality_score: f64,
}

/// Aggregate of a collection run, recomputed per call
#[derive(Debug, Clone, Serialize)]
pub struct CollectionResult {
    pub results: Vec<SourceResult>,
    pub overall_quality_score: f64,
    pub success: bool,
    pub critical_sources_failed: Vec<String>,
    pub partial_success: bool,
}

/// Quality-weighted, breaker-protected multi-source collector
pub struct ResilientDataCollector {
    sources: HashMap<String, Arc<dyn SourceClient>>,
    weights: HashMap<String, f64>,
    breakers: Arc<BreakerRegistry>,
    validator: Arc<DataQualityValidator>,
    retry_attempts: usize,
}

impl ResilientDataCollector {
    pub fn new(breakers: Arc<BreakerRegistry>, validator: Arc<DataQualityValidator>) -> Self {
        Self {
            sources: HashMap::new(),
            weights: HashMap::new(),
            breakers,
            validator,
            retry_attempts: 3,
        }
    }

    pub fn with_retry_attempts(mut self, attempts: usize) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Register a source with its fixed contribution weight.
    ///
    /// Weights should sum to 1.0 across the full catalog; the score formula
    /// normalizes over attempted sources, so only the ratios matter.
    pub fn register_source(&mut self, client: Arc<dyn SourceClient>, weight: f64) {
        let name = client.name().to_string();
        self.weights.insert(name.clone(), weight);
        self.sources.insert(name, client);
    }

    /// Collect data for a key using phased escalation
    pub async fn collect(&self, strategy: &CollectionStrategy, key: &str) -> CollectionResult {
        info!(
            "Collecting '{}' (required: {:?}, min quality {:.2})",
            key, strategy.required_sources, strategy.min_quality_score
        );

        let cap = strategy.max_concurrent_requests.max(1);
        let multiplier = strategy.timeout_strategy.multiplier();

        let mut results = self
            .run_phase(&strategy.required_sources, key, multiplier, cap)
            .await;
        let mut score = self.weighted_score(&results);

        let required_failed = strategy
            .required_sources
            .iter()
            .any(|name| failed_live(&results, name));

        if required_failed || score < strategy.min_quality_score {
            let pending = self.remaining(&strategy.preferred_sources, &results);
            if !pending.is_empty() {
                info!(
                    "Escalating to preferred sources {:?} (score {:.2})",
                    pending, score
                );
                results
                    .extend(self.run_phase(&pending, key, multiplier, cap).await);
                score = self.weighted_score(&results);
            }
        }

        if score < strategy.min_quality_score {
            let pending = self.remaining(&strategy.fallback_sources, &results);
            if !pending.is_empty() {
                info!(
                    "Escalating to fallback sources {:?} with patient timeouts (score {:.2})",
                    pending, score
                );
                results
                    .extend(
                        self.run_phase(
                            &pending,
                            key,
                            TimeoutStrategy::Patient.multiplier(),
                            cap.min(2),
                        )
                        .await,
                    );
                score = self.weighted_score(&results);
            }
        }

        // Synthetic "<name>_fallback" entries never clear a required source;
        // a failed live fetch keeps it on the critical list.
        let critical_sources_failed: Vec<String> = strategy
            .required_sources
            .iter()
            .filter(|name| failed_live(&results, name))
            .cloned()
            .collect();

        let any_success = results.iter().any(|r| r.success);
        let success = score >= strategy.min_quality_score && critical_sources_failed.is_empty();
        let partial_success = score > 0.2 && any_success;

        if success {
            info!("Collection for '{}' complete, quality {:.2}", key, score);
        } else {
            warn!(
                "Collection for '{}' degraded: quality {:.2}, critical failures {:?}",
                key, score, critical_sources_failed
            );
        }

        CollectionResult {
            results,
            overall_quality_score: score,
            success,
            critical_sources_failed,
            partial_success,
        }
    }

    /// Fetch a batch of sources with bounded concurrency
    async fn run_phase(
        &self,
        names: &[String],
        key: &str,
        multiplier: f64,
        cap: usize,
    ) -> Vec<SourceResult> {
        let batches: Vec<Vec<SourceResult>> = stream::iter(
            names
                .iter()
                .map(|name| self.fetch_source(name.as_str(), key, multiplier)),
        )
        .buffer_unordered(cap.max(1))
        .collect()
        .await;

        batches.into_iter().flatten().collect()
    }

    /// One breaker-wrapped, retried fetch against one source.
    ///
    /// Returns the live result, plus a synthetic `"<name>_fallback"` entry
    /// when the live path failed and the source declares static data.
    async fn fetch_source(&self, name: &str, key: &str, multiplier: f64) -> Vec<SourceResult> {
        let client = match self.sources.get(name) {
            Some(client) => client,
            None => {
                warn!("Source '{}' is not registered, skipping", name);
                return vec![SourceResult {
                    source: name.to_string(),
                    success: false,
                    data: None,
                    error: Some(format!("source '{}' is not registered", name)),
                    duration_ms: 0,
                    quality_score: 0.0,
                }];
            }
        };

        let breaker = self.breakers.breaker(name);
        if let Err(e) = breaker.allow() {
            debug!("Source '{}' rejected by circuit breaker", name);
            let mut out = vec![SourceResult {
                source: name.to_string(),
                success: false,
                data: None,
                error: Some(e.to_string()),
                duration_ms: 0,
                quality_score: 0.0,
            }];
            if let Some(data) = client.fallback_data(key) {
                out.push(self.fallback_result(name, data));
            }
            return out;
        }

        let budget = client.base_timeout().mul_f64(multiplier);
        let backoff = ExponentialBackoff::from_millis(100)
            .max_delay(MAX_RETRY_DELAY)
            .map(jitter)
            .take(self.retry_attempts);

        let started = Instant::now();
        let fetched = RetryIf::spawn(
            backoff,
            || async {
                match tokio::time::timeout(budget, client.fetch(key)).await {
                    Ok(result) => result,
                    Err(_) => Err(SourceError::Timeout {
                        timeout_ms: budget.as_millis() as u64,
                    }),
                }
            },
            |e: &SourceError| e.is_retryable(),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match fetched {
            Ok(data) => {
                breaker.record_success();
                self.validator.record_success(name);
                let quality = self.validator.quality_score(name, &data);
                debug!("Source '{}' ok in {}ms, quality {:.2}", name, duration_ms, quality);
                vec![SourceResult {
                    source: name.to_string(),
                    success: true,
                    data: Some(data),
                    error: None,
                    duration_ms,
                    quality_score: quality,
                }]
            }
            Err(e) => {
                breaker.record_failure();
                self.validator.record_failure(name);
                warn!("Source '{}' failed after retries: {}", name, e);
                let mut out = vec![SourceResult {
                    source: name.to_string(),
                    success: false,
                    data: None,
                    error: Some(e.to_string()),
                    duration_ms,
                    quality_score: 0.0,
                }];
                if let Some(data) = client.fallback_data(key) {
                    info!("Using static fallback data for '{}'", name);
                    out.push(self.fallback_result(name, data));
                }
                out
            }
        }
    }

    fn fallback_result(&self, name: &str, data: Value) -> SourceResult {
        let quality = self.validator.quality_score(name, &data);
        SourceResult {
            source: format!("{}_fallback", name),
            success: true,
            data: Some(data),
            error: None,
            duration_ms: 0,
            quality_score: quality,
        }
    }

    /// Quality score over attempted sources: `Σ(w·q) / Σ(w)`, with failed
    /// attempts contributing zero quality at full weight
    fn weighted_score(&self, results: &[SourceResult]) -> f64 {
        let mut numerator = 0.0;
        let mut denominator = 0.0;

        for result in results {
            let weight = self.weight_for(&result.source);
            if result.success {
                numerator += weight * result.quality_score;
            }
            denominator += weight;
        }

        if denominator > 0.0 {
            numerator / denominator
        } else {
            0.0
        }
    }

    fn weight_for(&self, source: &str) -> f64 {
        if let Some(base) = source.strip_suffix("_fallback") {
            let base_weight = self
                .weights
                .get(base)
                .copied()
                .unwrap_or(DEFAULT_SOURCE_WEIGHT);
            return base_weight * FALLBACK_WEIGHT_FACTOR;
        }
        self.weights
            .get(source)
            .copied()
            .unwrap_or(DEFAULT_SOURCE_WEIGHT)
    }

    /// Sources in `names` that have not been attempted yet
    fn remaining(&self, names: &[String], results: &[SourceResult]) -> Vec<String> {
        names
            .iter()
            .filter(|name| !results.iter().any(|r| &r.source == *name))
            .cloned()
            .collect()
    }
}

fn failed_live(results: &[SourceResult], name: &str) -> bool {
    results.iter().any(|r| r.source == name && !r.success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use serde_json::json;

    fn collector_with_weights(weights: &[(&str, f64)]) -> ResilientDataCollector {
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let validator = Arc::new(DataQualityValidator::new());
        let mut collector = ResilientDataCollector::new(breakers, validator);
        for (name, weight) in weights {
            collector.register_source(Arc::new(StaticSource::new(name, json!({}))), *weight);
        }
        collector
    }

    fn ok_result(source: &str, quality: f64) -> SourceResult {
        SourceResult {
            source: source.to_string(),
            success: true,
            data: Some(json!({})),
            error: None,
            duration_ms: 1,
            quality_score: quality,
        }
    }

    fn failed_result(source: &str) -> SourceResult {
        SourceResult {
            source: source.to_string(),
            success: false,
            data: None,
            error: Some("boom".to_string()),
            duration_ms: 1,
            quality_score: 0.0,
        }
    }

    #[test]
    fn test_weighted_score_normalizes_over_attempted() {
        let collector = collector_with_weights(&[("prices", 0.6), ("news", 0.4)]);

        // Only prices attempted: normalization over its weight alone
        let results = vec![ok_result("prices", 0.9)];
        assert!((collector.weighted_score(&results) - 0.9).abs() < 1e-9);

        // Both attempted
        let results = vec![ok_result("prices", 0.9), ok_result("news", 0.5)];
        let expected = (0.6 * 0.9 + 0.4 * 0.5) / 1.0;
        assert!((collector.weighted_score(&results) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_failed_sources_drag_score_down() {
        let collector = collector_with_weights(&[("prices", 0.6), ("news", 0.4)]);

        let results = vec![ok_result("prices", 0.9), failed_result("news")];
        let expected = (0.6 * 0.9) / 1.0;
        assert!((collector.weighted_score(&results) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_score_monotonic_as_successes_are_added() {
        let collector =
            collector_with_weights(&[("a", 0.3), ("b", 0.3), ("c", 0.2), ("d", 0.2)]);

        let mut results = vec![failed_result("a"), failed_result("b")];
        let mut last = collector.weighted_score(&results);
        assert_eq!(last, 0.0);

        for (name, quality) in [("c", 0.6), ("d", 0.8)] {
            results.push(ok_result(name, quality));
            let score = collector.weighted_score(&results);
            assert!(score >= last, "score decreased after adding success");
            last = score;
        }
    }

    #[test]
    fn test_fallback_weight_is_reduced() {
        let collector = collector_with_weights(&[("prices", 0.6)]);

        assert!((collector.weight_for("prices") - 0.6).abs() < 1e-9);
        assert!((collector.weight_for("prices_fallback") - 0.18).abs() < 1e-9);
        assert!((collector.weight_for("unknown") - DEFAULT_SOURCE_WEIGHT).abs() < 1e-9);
    }

    #[test]
    fn test_timeout_strategy_multipliers() {
        assert_eq!(TimeoutStrategy::Aggressive.multiplier(), 0.5);
        assert_eq!(TimeoutStrategy::Balanced.multiplier(), 1.0);
        assert_eq!(TimeoutStrategy::Patient.multiplier(), 1.5);
    }
}
