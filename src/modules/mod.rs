//! Analysis module contract and registry
//!
//! A module is a pluggable analysis unit producing a typed output from a
//! typed input, backed by an external model or service. Modules register
//! themselves by name; the orchestrator dispatches through the registry
//! rather than through a hardcoded switch.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CallResult;

/// Runtime-tunable configuration for one module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,

    /// Scheduling priority, 1-10; higher runs earlier among independent modules
    pub priority: u8,

    pub max_retries: u32,

    pub timeout_ms: u64,

    /// Names of modules whose outputs feed this one
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Allow one switch to the fallback resource within an orchestration
    #[serde(default)]
    pub fallback_enabled: bool,
}

impl ModuleConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            priority: 5,
            max_retries: 3,
            timeout_ms: 30_000,
            dependencies: BTreeSet::new(),
            fallback_enabled: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Input handed to a module for one attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInput {
    pub session_id: Uuid,
    pub key: String,
    /// The backing model/service resolved for this attempt
    pub resource: String,
    /// Static request input merged with completed dependency outputs
    pub data: Value,
}

/// Structured output of a module call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleOutput {
    pub data: Value,
    pub confidence: Option<f64>,
    pub tokens_used: Option<u64>,
}

/// Contract implemented by every analysis module
///
/// Expected business outcomes (low confidence, no signal) are `Ok`; only
/// infrastructure failures (network, malformed response, timeout) should
/// surface as `Err`.
#[async_trait]
pub trait AnalysisModule: Send + Sync {
    fn name(&self) -> &str;

    /// Backing model/service this module calls
    fn resource(&self) -> &str;

    /// Alternate resource used once fallback is engaged
    fn fallback_resource(&self) -> Option<&str> {
        None
    }

    /// Structured fields a healthy output is expected to carry
    fn expected_output_fields(&self) -> &[&str] {
        &[]
    }

    async fn execute(&self, input: &ModuleInput) -> CallResult<ModuleOutput>;
}

/// Name-to-module dispatch table
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn AnalysisModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Arc<dyn AnalysisModule>) {
        self.modules.insert(module.name().to_string(), module);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AnalysisModule>> {
        self.modules.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }
}

/// Score a module output on the 0-1 scale.
///
/// Presence of the expected structured fields raises the score; a
/// confidence outside [0, 1] lowers it.
pub fn score_output(module: &dyn AnalysisModule, output: &ModuleOutput) -> f64 {
    let mut score = 0.5;

    let expected = module.expected_output_fields();
    if expected.is_empty() {
        score += 0.4;
    } else {
        let present = expected
            .iter()
            .filter(|field| output.data.get(**field).is_some_and(|v| !v.is_null()))
            .count();
        score += 0.4 * present as f64 / expected.len() as f64;
    }

    match output.confidence {
        Some(c) if (0.0..=1.0).contains(&c) => score += 0.1,
        Some(_) => score -= 0.2,
        None => {}
    }

    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoModule;

    #[async_trait]
    impl AnalysisModule for EchoModule {
        fn name(&self) -> &str {
            "echo"
        }

        fn resource(&self) -> &str {
            "model-a"
        }

        fn expected_output_fields(&self) -> &[&str] {
            &["signal", "reasoning"]
        }

        async fn execute(&self, input: &ModuleInput) -> CallResult<ModuleOutput> {
            Ok(ModuleOutput {
                data: input.data.clone(),
                confidence: Some(0.7),
                tokens_used: Some(10),
            })
        }
    }

    #[test]
    fn test_registry_dispatch() {
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(EchoModule));

        assert!(registry.contains("echo"));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_score_rewards_expected_fields() {
        let module = EchoModule;

        let full = ModuleOutput {
            data: json!({"signal": "bullish", "reasoning": "momentum"}),
            confidence: Some(0.8),
            tokens_used: None,
        };
        let partial = ModuleOutput {
            data: json!({"signal": "bullish"}),
            confidence: Some(0.8),
            tokens_used: None,
        };

        let full_score = score_output(&module, &full);
        let partial_score = score_output(&module, &partial);

        assert!((full_score - 1.0).abs() < 1e-9);
        assert!(partial_score < full_score);
    }

    #[test]
    fn test_score_penalizes_out_of_range_confidence() {
        let module = EchoModule;

        let output = ModuleOutput {
            data: json!({"signal": "bullish", "reasoning": "momentum"}),
            confidence: Some(1.7),
            tokens_used: None,
        };

        let score = score_output(&module, &output);
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_module_config_defaults() {
        let config = ModuleConfig::new("sentiment");

        assert_eq!(config.priority, 5);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.dependencies.is_empty());
        assert!(!config.fallback_enabled);
    }
}
