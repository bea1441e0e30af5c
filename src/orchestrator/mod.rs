//! Module orchestration
//!
//! Coordinates a requested set of analysis modules: dependency-aware
//! scheduling, per-resource rate limiting, retry with linear backoff, a
//! one-shot fallback resource switch, and a full audit trail. A single
//! module failing never aborts the run; the result carries explicit
//! completed/failed lists so callers can decide what degraded output is
//! worth.

pub mod graph;

pub use graph::execution_order;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{content_hash, AttemptKind, AuditSink, ExecutionRecord};
use crate::error::{CallResult, OrchestrationError, SourceError};
use crate::limiter::RateLimiter;
use crate::modules::{
    score_output, AnalysisModule, ModuleConfig, ModuleInput, ModuleOutput, ModuleRegistry,
};

/// Caller-supplied priority class, recorded with the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Low,
    #[default]
    Normal,
    High,
}

/// One orchestration request: which modules to run for which key
#[derive(Debug, Clone)]
pub struct OrchestrationRequest {
    pub session_id: Uuid,
    pub key: String,
    pub modules: Vec<String>,
    pub priority_class: PriorityClass,
    /// Static per-module inputs, completed at runtime with dependency outputs
    pub inputs: HashMap<String, Value>,
}

impl OrchestrationRequest {
    pub fn new(key: &str, modules: &[&str]) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            key: key.to_string(),
            modules: modules.iter().map(|m| m.to_string()).collect(),
            priority_class: PriorityClass::Normal,
            inputs: HashMap::new(),
        }
    }

    pub fn with_input(mut self, module: &str, input: Value) -> Self {
        self.inputs.insert(module.to_string(), input);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Human-readable problem surfaced alongside the result
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
    pub suggestion: String,
}

/// Aggregate outcome of one orchestration run
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub session_id: Uuid,
    pub key: String,
    pub completed_modules: Vec<String>,
    pub failed_modules: Vec<String>,
    pub outputs: HashMap<String, ModuleOutput>,
    pub module_timings_ms: HashMap<String, u64>,
    pub module_quality: HashMap<String, f64>,
    pub total_external_calls: u32,
    pub total_tokens: u64,
    pub audit_trail: Vec<ExecutionRecord>,
    pub issues: Vec<Issue>,
    /// True only when every requested module completed
    pub success: bool,
    /// True whenever at least one requested module completed
    pub partial_success: bool,
    pub duration_ms: u64,
}

struct ModuleRun {
    records: Vec<ExecutionRecord>,
    outcome: Option<(ModuleOutput, f64)>,
    last_error: Option<String>,
    saw_circuit_open: bool,
    calls: u32,
    duration_ms: u64,
}

/// Dependency-aware module orchestrator
pub struct ModuleOrchestrator {
    registry: Arc<ModuleRegistry>,
    configs: RwLock<HashMap<String, ModuleConfig>>,
    limiter: Arc<RateLimiter>,
    audit: Arc<dyn AuditSink>,
    backoff: Duration,
}

impl ModuleOrchestrator {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        configs: Vec<ModuleConfig>,
        limiter: Arc<RateLimiter>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            registry,
            configs: RwLock::new(
                configs.into_iter().map(|c| (c.name.clone(), c)).collect(),
            ),
            limiter,
            audit,
            backoff: Duration::from_millis(500),
        }
    }

    /// Base delay for the linear retry backoff
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Hot-swap the configuration for one module
    pub fn update_module_config(&self, config: ModuleConfig) {
        let mut configs = self.configs.write().unwrap_or_else(|p| p.into_inner());
        info!("Updating module config for '{}'", config.name);
        configs.insert(config.name.clone(), config);
    }

    pub fn module_config(&self, name: &str) -> Option<ModuleConfig> {
        let configs = self.configs.read().unwrap_or_else(|p| p.into_inner());
        configs.get(name).cloned()
    }

    /// Run the requested modules and aggregate their outcomes.
    ///
    /// Only a cyclic module graph or an unknown module name aborts the run;
    /// individual module failures are reported through the result.
    pub async fn orchestrate(
        &self,
        request: &OrchestrationRequest,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        let run_started = Instant::now();

        // Snapshot the table so a hot update mid-run cannot change the plan
        let configs = {
            let table = self.configs.read().unwrap_or_else(|p| p.into_inner());
            table.clone()
        };

        for name in &request.modules {
            if !self.registry.contains(name) {
                return Err(OrchestrationError::UnknownModule { name: name.clone() });
            }
        }

        let order = execution_order(&configs, &request.modules)?;

        info!(
            "🎬 Session {} for '{}': running {} modules {:?}",
            request.session_id,
            request.key,
            order.len(),
            order
        );
        self.audit
            .record_session_start(request.session_id, &request.key, &request.modules)
            .await;

        let mut outputs: HashMap<String, ModuleOutput> = HashMap::new();
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut module_timings_ms = HashMap::new();
        let mut module_quality = HashMap::new();
        let mut audit_trail = Vec::new();
        let mut issues = Vec::new();
        let mut total_external_calls = 0;
        let mut total_tokens = 0;

        for name in &order {
            let config = &configs[name];
            let module = self
                .registry
                .get(name)
                .ok_or_else(|| OrchestrationError::UnknownModule { name: name.clone() })?;

            let run = self
                .execute_module(request, config, module.as_ref(), &outputs)
                .await;

            total_external_calls += run.calls;
            module_timings_ms.insert(name.clone(), run.duration_ms);
            audit_trail.extend(run.records);

            match run.outcome {
                Some((output, quality)) => {
                    info!(
                        "✅ Module '{}' completed in {}ms (quality {:.2})",
                        name, run.duration_ms, quality
                    );
                    total_tokens += output.tokens_used.unwrap_or(0);
                    module_quality.insert(name.clone(), quality);
                    if quality < 0.5 {
                        issues.push(Issue {
                            severity: Severity::Low,
                            message: format!(
                                "Module '{}' produced low-quality output ({:.2})",
                                name, quality
                            ),
                            suggestion: "Inspect the module output for missing fields".to_string(),
                        });
                    }
                    outputs.insert(name.clone(), output);
                    completed.push(name.clone());
                }
                None => {
                    warn!(
                        "❌ Module '{}' failed after {} call(s): {}",
                        name,
                        run.calls,
                        run.last_error.as_deref().unwrap_or("unknown error")
                    );
                    if run.saw_circuit_open {
                        issues.push(Issue {
                            severity: Severity::Medium,
                            message: format!(
                                "Module '{}' was rejected by an open circuit",
                                name
                            ),
                            suggestion: "The backing service is known-bad; wait for the breaker to recover or reset it manually".to_string(),
                        });
                    }
                    issues.push(Issue {
                        severity: Severity::High,
                        message: format!(
                            "Module '{}' failed after {} attempt(s): {}",
                            name,
                            run.calls,
                            run.last_error.as_deref().unwrap_or("unknown error")
                        ),
                        suggestion: format!(
                            "Check the health of resource '{}' and recent breaker events",
                            module.resource()
                        ),
                    });
                    failed.push(name.clone());
                }
            }
        }

        let success = failed.is_empty();
        let partial_success = !completed.is_empty();

        if !success && !partial_success {
            issues.push(Issue {
                severity: Severity::Critical,
                message: "No requested module completed".to_string(),
                suggestion: "Check upstream service availability before retrying".to_string(),
            });
        }

        self.audit
            .record_session_end(request.session_id, success, &completed, &failed)
            .await;

        let duration_ms = run_started.elapsed().as_millis() as u64;
        info!(
            "Session {} finished in {}ms: {} completed, {} failed",
            request.session_id,
            duration_ms,
            completed.len(),
            failed.len()
        );

        Ok(OrchestrationResult {
            session_id: request.session_id,
            key: request.key.clone(),
            completed_modules: completed,
            failed_modules: failed,
            outputs,
            module_timings_ms,
            module_quality,
            total_external_calls,
            total_tokens,
            audit_trail,
            issues,
            success,
            partial_success,
            duration_ms,
        })
    }

    /// Run one module through its retry/fallback loop
    async fn execute_module(
        &self,
        request: &OrchestrationRequest,
        config: &ModuleConfig,
        module: &dyn AnalysisModule,
        dependency_outputs: &HashMap<String, ModuleOutput>,
    ) -> ModuleRun {
        let input_data = merge_inputs(
            request.inputs.get(&config.name),
            config,
            dependency_outputs,
        );
        let input_hash = content_hash(&input_data);

        let mut run = ModuleRun {
            records: Vec::new(),
            outcome: None,
            last_error: None,
            saw_circuit_open: false,
            calls: 0,
            duration_ms: 0,
        };

        let started = Instant::now();
        let max_attempts = config.max_retries.max(1);
        let mut resource = module.resource().to_string();
        let mut used_fallback = false;
        let mut attempt = 1;

        while attempt <= max_attempts {
            let attempt_kind = if used_fallback {
                AttemptKind::Fallback
            } else if attempt == 1 {
                AttemptKind::Primary
            } else {
                AttemptKind::Retry
            };

            let started_at = Utc::now();
            let input = ModuleInput {
                session_id: request.session_id,
                key: request.key.clone(),
                resource: resource.clone(),
                data: input_data.clone(),
            };

            run.calls += 1;
            let outcome = self.attempt_call(config, &resource, module, &input).await;
            let finished_at = Utc::now();

            let mut record = ExecutionRecord {
                id: Uuid::new_v4(),
                session_id: request.session_id,
                module: config.name.clone(),
                resource: resource.clone(),
                attempt_kind,
                attempt,
                started_at,
                finished_at: Some(finished_at),
                success: false,
                error_message: None,
                input_hash: input_hash.clone(),
                output_hash: None,
                quality_score: None,
            };

            match outcome {
                Ok(output) => {
                    let quality = score_output(module, &output);
                    record.success = true;
                    record.output_hash = Some(content_hash(&output.data));
                    record.quality_score = Some(quality);
                    self.audit.record_execution(&record).await;
                    run.records.push(record);
                    run.outcome = Some((output, quality));
                    break;
                }
                Err(e) => {
                    if matches!(e, SourceError::CircuitOpen { .. }) {
                        run.saw_circuit_open = true;
                    }
                    record.error_message = Some(e.to_string());
                    self.audit.record_execution(&record).await;
                    run.records.push(record);
                    run.last_error = Some(e.to_string());

                    if config.fallback_enabled && !used_fallback {
                        if let Some(fallback) = module.fallback_resource() {
                            warn!(
                                "Module '{}' failed on '{}', switching to fallback resource '{}'",
                                config.name, resource, fallback
                            );
                            used_fallback = true;
                            resource = fallback.to_string();
                            attempt += 1;
                            // Fallback retries immediately, no backoff
                            continue;
                        }
                    }

                    let failed_attempt = attempt;
                    attempt += 1;
                    if attempt <= max_attempts {
                        let delay = self.backoff * failed_attempt;
                        debug!(
                            "Retrying module '{}' in {:?} (attempt {}/{})",
                            config.name, delay, attempt, max_attempts
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        run.duration_ms = started.elapsed().as_millis() as u64;
        run
    }

    /// One rate-limited, timeout-raced call attempt.
    ///
    /// Both the rate-limit wait and the call itself are bounded by the
    /// module's timeout; a saturated window surfaces as a timeout failure.
    async fn attempt_call(
        &self,
        config: &ModuleConfig,
        resource: &str,
        module: &dyn AnalysisModule,
        input: &ModuleInput,
    ) -> CallResult<ModuleOutput> {
        let timeout = config.timeout();

        if tokio::time::timeout(timeout, self.limiter.acquire(resource))
            .await
            .is_err()
        {
            return Err(SourceError::Timeout {
                timeout_ms: config.timeout_ms,
            });
        }

        match tokio::time::timeout(timeout, module.execute(input)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout {
                timeout_ms: config.timeout_ms,
            }),
        }
    }
}

/// Merge a module's static request input with the outputs of its completed
/// dependencies. Dependency outputs land under the dependency's name; a
/// failed dependency simply leaves its key absent.
fn merge_inputs(
    static_input: Option<&Value>,
    config: &ModuleConfig,
    dependency_outputs: &HashMap<String, ModuleOutput>,
) -> Value {
    let mut data = match static_input {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(other) => json!({ "input": other.clone() }),
        None => json!({}),
    };

    if let Some(object) = data.as_object_mut() {
        for dependency in &config.dependencies {
            if let Some(output) = dependency_outputs.get(dependency) {
                object.insert(dependency.clone(), output.data.clone());
            }
        }
    }

    data
}
