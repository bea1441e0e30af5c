//! Data quality validation and scoring
//!
//! Scores payloads against declared field rules plus a few domain
//! heuristics, and maintains a per-source reliability prior that is nudged
//! by observed success and failure.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Expected JSON type for a validated field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// Declarative validation rule for one payload field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    pub required: bool,
    pub kind: FieldKind,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Quality metrics for one validated payload, all on a 0-100 scale
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub completeness: f64,
    pub accuracy: f64,
    pub freshness: f64,
    pub consistency: f64,
    pub confidence: f64,
    pub reliability: f64,
    pub issues: Vec<String>,
}

const DEFAULT_RELIABILITY_PRIOR: f64 = 70.0;
const STALE_ARTICLE_DAYS: i64 = 7;
const EXTREME_CHANGE_PCT: f64 = 20.0;

/// Rule-driven payload validator with per-source reliability tracking
pub struct DataQualityValidator {
    rules: RwLock<HashMap<String, Vec<FieldRule>>>,
    priors: Mutex<HashMap<String, f64>>,
}

impl DataQualityValidator {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            priors: Mutex::new(HashMap::new()),
        }
    }

    /// Register the rule list for a payload kind (usually a source name)
    pub fn register_rules(&self, kind: &str, rules: Vec<FieldRule>) {
        let mut map = self.rules.write().unwrap_or_else(|p| p.into_inner());
        map.insert(kind.to_string(), rules);
    }

    /// Seed the reliability prior for a source
    pub fn set_prior(&self, source: &str, prior: f64) {
        let mut priors = self.lock_priors();
        priors.insert(source.to_string(), prior.clamp(0.0, 100.0));
    }

    fn lock_priors(&self) -> MutexGuard<'_, HashMap<String, f64>> {
        self.priors.lock().unwrap_or_else(|poisoned| {
            warn!("Reliability prior mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn prior(&self, source: &str) -> f64 {
        *self
            .lock_priors()
            .get(source)
            .unwrap_or(&DEFAULT_RELIABILITY_PRIOR)
    }

    /// Nudge the prior up after a successful fetch
    pub fn record_success(&self, source: &str) {
        let mut priors = self.lock_priors();
        let entry = priors
            .entry(source.to_string())
            .or_insert(DEFAULT_RELIABILITY_PRIOR);
        *entry = (*entry + 2.0).clamp(0.0, 100.0);
    }

    /// Nudge the prior down after a failed fetch
    pub fn record_failure(&self, source: &str) {
        let mut priors = self.lock_priors();
        let entry = priors
            .entry(source.to_string())
            .or_insert(DEFAULT_RELIABILITY_PRIOR);
        *entry = (*entry - 5.0).clamp(0.0, 100.0);
    }

    /// Validate a payload against the rules registered for `kind`.
    ///
    /// Metrics start at 100 and take additive deductions; no metric goes
    /// below 0. `reliability` is the fixed weighted combination of the five
    /// base metrics.
    pub fn validate(&self, kind: &str, payload: &Value) -> QualityMetrics {
        let mut issues = Vec::new();
        let rules = {
            let map = self.rules.read().unwrap_or_else(|p| p.into_inner());
            map.get(kind).cloned().unwrap_or_default()
        };

        let completeness = self.score_completeness(&rules, payload, &mut issues);
        let accuracy = self.score_accuracy(&rules, payload, &mut issues);
        let freshness = self.score_freshness(payload, &mut issues);
        let consistency = self.score_consistency(payload, &mut issues);
        let confidence = self.prior(kind);

        let reliability = (0.25 * completeness
            + 0.30 * accuracy
            + 0.20 * freshness
            + 0.15 * consistency
            + 0.10 * confidence)
            .clamp(0.0, 100.0);

        QualityMetrics {
            completeness,
            accuracy,
            freshness,
            consistency,
            confidence,
            reliability,
            issues,
        }
    }

    /// Quality score on the collector's 0-1 scale
    pub fn quality_score(&self, kind: &str, payload: &Value) -> f64 {
        self.validate(kind, payload).reliability / 100.0
    }

    fn score_completeness(&self, rules: &[FieldRule], payload: &Value, issues: &mut Vec<String>) -> f64 {
        let required: Vec<&FieldRule> = rules.iter().filter(|r| r.required).collect();
        if required.is_empty() {
            return 100.0;
        }

        // Each missing required field costs an equal share of the baseline
        let per_field = 100.0 / required.len() as f64;
        let mut score = 100.0;
        for rule in required {
            if payload.get(&rule.field).map_or(true, Value::is_null) {
                score -= per_field;
                issues.push(format!("missing required field '{}'", rule.field));
            }
        }
        score.max(0.0)
    }

    fn score_accuracy(&self, rules: &[FieldRule], payload: &Value, issues: &mut Vec<String>) -> f64 {
        let mut score: f64 = 100.0;

        for rule in rules {
            let value = match payload.get(&rule.field) {
                Some(v) if !v.is_null() => v,
                _ => continue,
            };

            if !kind_matches(rule.kind, value) {
                score -= 15.0;
                issues.push(format!(
                    "field '{}' has wrong type (expected {:?})",
                    rule.field, rule.kind
                ));
                continue;
            }

            if let Some(n) = value.as_f64() {
                if rule.min.is_some_and(|min| n < min) || rule.max.is_some_and(|max| n > max) {
                    score -= 10.0;
                    issues.push(format!("field '{}' out of range: {}", rule.field, n));
                }
            }

            if let (Some(pattern), Some(s)) = (&rule.pattern, value.as_str()) {
                match Regex::new(pattern) {
                    Ok(re) => {
                        if !re.is_match(s) {
                            score -= 10.0;
                            issues.push(format!("field '{}' does not match pattern", rule.field));
                        }
                    }
                    Err(e) => {
                        warn!("Invalid pattern for field '{}': {}", rule.field, e);
                    }
                }
            }
        }

        score.max(0.0)
    }

    fn score_freshness(&self, payload: &Value, issues: &mut Vec<String>) -> f64 {
        let mut score = 100.0;
        let cutoff = Utc::now() - ChronoDuration::days(STALE_ARTICLE_DAYS);

        let stale = articles(payload)
            .filter(|item| {
                item.get("published_at")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .is_some_and(|published| published.with_timezone(&Utc) < cutoff)
            })
            .count();

        if stale > 0 {
            score -= 10.0 * stale as f64;
            issues.push(format!(
                "{} article(s) older than {} days",
                stale, STALE_ARTICLE_DAYS
            ));
        }

        score.max(0.0)
    }

    fn score_consistency(&self, payload: &Value, issues: &mut Vec<String>) -> f64 {
        let mut score = 100.0;

        // Extreme single-day price swings are suspicious enough to flag
        for field in ["change_pct", "daily_change_pct"] {
            if let Some(change) = payload.get(field).and_then(Value::as_f64) {
                if change.abs() > EXTREME_CHANGE_PCT {
                    score -= 15.0;
                    issues.push(format!("extreme price move: {:.1}%", change));
                }
            }
        }

        let mut seen = HashSet::new();
        let mut duplicates = 0;
        for item in articles(payload) {
            if let Some(title) = item.get("title").and_then(Value::as_str) {
                if !seen.insert(title.to_string()) {
                    duplicates += 1;
                }
            }
        }
        if duplicates > 0 {
            score -= 10.0 * duplicates as f64;
            issues.push(format!("{} duplicate title(s) in batch", duplicates));
        }

        score.max(0.0)
    }
}

impl Default for DataQualityValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterate the article-like items of a payload: either a top-level array or
/// an `articles` array field.
fn articles(payload: &Value) -> impl Iterator<Item = &Value> {
    let items = payload
        .as_array()
        .or_else(|| payload.get("articles").and_then(Value::as_array))
        .map(|v| v.as_slice())
        .unwrap_or(&[]);
    items.iter()
}

fn kind_matches(kind: FieldKind, value: &Value) -> bool {
    match kind {
        FieldKind::String => value.is_string(),
        FieldKind::Number => value.is_number(),
        FieldKind::Integer => value.is_i64() || value.is_u64(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Array => value.is_array(),
        FieldKind::Object => value.is_object(),
    }
}
